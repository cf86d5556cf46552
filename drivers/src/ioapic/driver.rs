use gsiroute_acpi::madt::{Polarity, TriggerMode};

use super::registry::IoapicEntry;

/// Register-level access to I/O APIC redirection entries.
///
/// The routing code never touches hardware directly; it issues these calls
/// and leaves encoding and MMIO to the implementation.
pub trait IoapicDriver {
    /// Number of redirection entries (pins) the controller implements.
    fn redirection_entries(&self, ioapic: &IoapicEntry) -> u32;

    fn set_pin_vector(&mut self, ioapic: &IoapicEntry, pin: u32, vector: u8);

    fn set_pin_polarity(&mut self, ioapic: &IoapicEntry, pin: u32, polarity: Polarity);

    fn set_pin_trigger_mode(&mut self, ioapic: &IoapicEntry, pin: u32, trigger: TriggerMode);
}
