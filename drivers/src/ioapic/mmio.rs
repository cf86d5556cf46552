use core::ptr::{read_volatile, write_volatile};

use gsiroute_acpi::madt::{Polarity, TriggerMode};
use gsiroute_lib::klog_warn;

use super::driver::IoapicDriver;
use super::registry::IoapicEntry;
use super::regs::*;

/// [`IoapicDriver`] backed by the IOREGSEL/IOWIN register window.
///
/// Each setter is a read-modify-write of the low dword of the pin's
/// redirection entry; the mask bit and destination are left alone.
pub struct MmioIoapicDriver {
    hhdm_offset: u64,
}

impl MmioIoapicDriver {
    /// # Safety
    ///
    /// The register window of every controller this driver is handed must be
    /// mapped uncached at `address + hhdm_offset`.
    pub const unsafe fn new(hhdm_offset: u64) -> Self {
        Self { hhdm_offset }
    }

    #[inline]
    fn window(&self, ioapic: &IoapicEntry) -> *mut u8 {
        ioapic.address.as_u64().wrapping_add(self.hhdm_offset) as usize as *mut u8
    }

    #[inline]
    fn read_reg(&self, ioapic: &IoapicEntry, reg: u8) -> u32 {
        let base = self.window(ioapic);
        // SAFETY: `new`'s contract maps the window at `base`.
        unsafe {
            write_volatile(base.add(IOAPIC_REGSEL_OFFSET) as *mut u32, reg as u32);
            read_volatile(base.add(IOAPIC_WINDOW_OFFSET) as *const u32)
        }
    }

    #[inline]
    fn write_reg(&self, ioapic: &IoapicEntry, reg: u8, value: u32) {
        let base = self.window(ioapic);
        // SAFETY: as in `read_reg`.
        unsafe {
            write_volatile(base.add(IOAPIC_REGSEL_OFFSET) as *mut u32, reg as u32);
            write_volatile(base.add(IOAPIC_WINDOW_OFFSET) as *mut u32, value);
        }
    }

    fn update_low(&mut self, ioapic: &IoapicEntry, pin: u32, clear: u32, set: u32) {
        let pins = self.redirection_entries(ioapic);
        let reg = match redir_low_index(pin) {
            Some(reg) if pin < pins => reg,
            _ => {
                klog_warn!(
                    "IOAPIC: pin {} outside IOAPIC 0x{:x} ({} pins)",
                    pin,
                    ioapic.id,
                    pins
                );
                return;
            }
        };
        let value = (self.read_reg(ioapic, reg) & !clear) | set;
        self.write_reg(ioapic, reg, value);
    }
}

impl IoapicDriver for MmioIoapicDriver {
    fn redirection_entries(&self, ioapic: &IoapicEntry) -> u32 {
        let version = self.read_reg(ioapic, IOAPIC_REG_VER);
        ((version >> IOAPIC_VER_MAX_REDIR_SHIFT) & IOAPIC_VER_MAX_REDIR_MASK) + 1
    }

    fn set_pin_vector(&mut self, ioapic: &IoapicEntry, pin: u32, vector: u8) {
        self.update_low(ioapic, pin, IOAPIC_REDIR_VECTOR_MASK, vector as u32);
    }

    /// ISA lines default to active high.
    fn set_pin_polarity(&mut self, ioapic: &IoapicEntry, pin: u32, polarity: Polarity) {
        let low = RedirectionFlags::POLARITY_LOW.bits();
        match polarity {
            Polarity::ActiveLow => self.update_low(ioapic, pin, 0, low),
            Polarity::ActiveHigh | Polarity::BusDefault | Polarity::Reserved => {
                self.update_low(ioapic, pin, low, 0)
            }
        }
    }

    /// ISA lines default to edge triggered.
    fn set_pin_trigger_mode(&mut self, ioapic: &IoapicEntry, pin: u32, trigger: TriggerMode) {
        let level = RedirectionFlags::TRIGGER_LEVEL.bits();
        match trigger {
            TriggerMode::Level => self.update_low(ioapic, pin, 0, level),
            TriggerMode::Edge | TriggerMode::BusDefault | TriggerMode::Reserved => {
                self.update_low(ioapic, pin, level, 0)
            }
        }
    }
}
