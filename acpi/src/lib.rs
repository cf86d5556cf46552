//! ACPI table parsing infrastructure for gsiroute.
//!
//! This crate provides a zero-allocation ACPI table parser. The interrupt
//! routing code in `gsiroute-drivers` consumes it rather than walking firmware
//! memory itself.
//!
//! # Architecture
//!
//! - [`tables`]: RSDP validation, XSDT/RSDT traversal, table lookup by signature.
//! - [`madt`]: MADT (Multiple APIC Description Table) record walking and decoding.
//! - [`test_fixtures`]: synthetic MADT images for tests.
//!
//! # Usage
//!
//! ```ignore
//! use gsiroute_acpi::tables::{AcpiTables, FirmwareTables};
//! use gsiroute_acpi::madt::{Madt, MadtEntry};
//!
//! let tables = unsafe { AcpiTables::from_rsdp(rsdp_phys, hhdm_offset) }?;
//! let madt = Madt::new(tables.locate_table(b"APIC")?).ok()?;
//!
//! madt.walk(|record| match record.decode() {
//!     Ok(MadtEntry::Ioapic(info)) => { /* register IOAPIC */ }
//!     Ok(MadtEntry::InterruptOverride(iso)) => { /* route override */ }
//!     _ => {}
//! })?;
//! ```

#![no_std]

pub mod madt;
pub mod tables;
pub mod test_fixtures;

#[cfg(test)]
extern crate std;
