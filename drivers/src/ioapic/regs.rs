//! I/O APIC hardware definitions.
//!
//! Register offsets, redirection entry flags, and capacity limits.
//! MADT decoding (polarity/trigger encodings, entry type IDs) lives in
//! `gsiroute_acpi::madt`.

use bitflags::bitflags;

// =============================================================================
// Size and Capacity Limits
// =============================================================================

pub const IOAPIC_MAX_CONTROLLERS: usize = 8;

// =============================================================================
// MMIO Window
// =============================================================================

/// IOREGSEL: selects the register exposed through the window.
pub(crate) const IOAPIC_REGSEL_OFFSET: usize = 0x00;
/// IOWIN: data window for the selected register.
pub(crate) const IOAPIC_WINDOW_OFFSET: usize = 0x10;

// =============================================================================
// Register Indices
// =============================================================================

pub(crate) const IOAPIC_REG_VER: u8 = 0x01;
pub(crate) const IOAPIC_REG_REDIR_BASE: u8 = 0x10;

/// Bits [23:16] of the version register hold the highest redirection index.
pub(crate) const IOAPIC_VER_MAX_REDIR_SHIFT: u32 = 16;
pub(crate) const IOAPIC_VER_MAX_REDIR_MASK: u32 = 0xFF;

// =============================================================================
// Redirection Entry (low dword)
// =============================================================================

pub(crate) const IOAPIC_REDIR_VECTOR_MASK: u32 = 0xFF;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct RedirectionFlags: u32 {
        const POLARITY_LOW = 1 << 13;
        const TRIGGER_LEVEL = 1 << 15;
        const MASKED = 1 << 16;
    }
}

#[inline]
pub(crate) fn redir_low_index(pin: u32) -> Option<u8> {
    let index = pin.checked_mul(2)?.checked_add(IOAPIC_REG_REDIR_BASE as u32)?;
    u8::try_from(index).ok()
}
