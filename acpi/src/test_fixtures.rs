//! Synthetic MADT images for tests.
//!
//! [`MadtBuilder`] writes records into a fixed buffer and seals the SDT
//! length and checksum in [`MadtBuilder::build`]. Records are encoded
//! byte-for-byte as firmware lays them out; [`MadtBuilder::raw`] appends
//! arbitrary bytes for malformed-table cases.

use crate::madt::{
    MADT_ENTRY_INTERRUPT_OVERRIDE, MADT_ENTRY_IOAPIC, MADT_ENTRY_LOCAL_APIC,
    MADT_ENTRY_LOCAL_APIC_ADDRESS_OVERRIDE, MADT_ENTRY_LOCAL_APIC_NMI, MADT_ENTRY_NMI_SOURCE,
    MADT_HEADER_LEN, MADT_SIGNATURE,
};
use crate::tables::{FirmwareTables, SDT_HEADER_LEN, TableRegion, checksum};

pub const MADT_IMAGE_CAPACITY: usize = 1024;

#[derive(Clone, Copy)]
pub struct MadtBuilder {
    buf: [u8; MADT_IMAGE_CAPACITY],
    len: usize,
}

impl MadtBuilder {
    pub fn new(lapic_address: u32, flags: u32) -> Self {
        let mut buf = [0u8; MADT_IMAGE_CAPACITY];
        buf[..4].copy_from_slice(MADT_SIGNATURE);
        buf[8] = 3;
        buf[10..16].copy_from_slice(b"GSIRT ");
        buf[16..24].copy_from_slice(b"SYNTHMAD");
        buf[SDT_HEADER_LEN..SDT_HEADER_LEN + 4].copy_from_slice(&lapic_address.to_le_bytes());
        buf[SDT_HEADER_LEN + 4..MADT_HEADER_LEN].copy_from_slice(&flags.to_le_bytes());
        Self {
            buf,
            len: MADT_HEADER_LEN,
        }
    }

    /// Append raw bytes. Panics if the image would exceed its capacity.
    pub fn raw(mut self, bytes: &[u8]) -> Self {
        let end = self.len + bytes.len();
        assert!(end <= MADT_IMAGE_CAPACITY, "synthetic MADT too large");
        self.buf[self.len..end].copy_from_slice(bytes);
        self.len = end;
        self
    }

    pub fn local_apic(self, processor_id: u8, apic_id: u8, flags: u32) -> Self {
        let f = flags.to_le_bytes();
        self.raw(&[
            MADT_ENTRY_LOCAL_APIC,
            8,
            processor_id,
            apic_id,
            f[0],
            f[1],
            f[2],
            f[3],
        ])
    }

    pub fn ioapic(self, id: u8, address: u32, gsi_base: u32) -> Self {
        let a = address.to_le_bytes();
        let g = gsi_base.to_le_bytes();
        self.raw(&[
            MADT_ENTRY_IOAPIC,
            12,
            id,
            0,
            a[0],
            a[1],
            a[2],
            a[3],
            g[0],
            g[1],
            g[2],
            g[3],
        ])
    }

    pub fn interrupt_override(self, bus: u8, irq: u8, gsi: u32, flags: u16) -> Self {
        let g = gsi.to_le_bytes();
        let f = flags.to_le_bytes();
        self.raw(&[
            MADT_ENTRY_INTERRUPT_OVERRIDE,
            10,
            bus,
            irq,
            g[0],
            g[1],
            g[2],
            g[3],
            f[0],
            f[1],
        ])
    }

    pub fn nmi_source(self, flags: u16, gsi: u32) -> Self {
        let f = flags.to_le_bytes();
        let g = gsi.to_le_bytes();
        self.raw(&[
            MADT_ENTRY_NMI_SOURCE,
            8,
            f[0],
            f[1],
            g[0],
            g[1],
            g[2],
            g[3],
        ])
    }

    pub fn local_apic_nmi(self, processor_id: u8, flags: u16, lint: u8) -> Self {
        let f = flags.to_le_bytes();
        self.raw(&[MADT_ENTRY_LOCAL_APIC_NMI, 6, processor_id, f[0], f[1], lint])
    }

    pub fn local_apic_address_override(self, address: u64) -> Self {
        let a = address.to_le_bytes();
        self.raw(&[
            MADT_ENTRY_LOCAL_APIC_ADDRESS_OVERRIDE,
            12,
            0,
            0,
            a[0],
            a[1],
            a[2],
            a[3],
            a[4],
            a[5],
            a[6],
            a[7],
        ])
    }

    /// Seal length and checksum.
    pub fn build(mut self) -> MadtImage {
        self.buf[4..8].copy_from_slice(&(self.len as u32).to_le_bytes());
        self.buf[9] = 0;
        let sum = checksum(&self.buf[..self.len]);
        self.buf[9] = 0u8.wrapping_sub(sum);
        MadtImage {
            buf: self.buf,
            len: self.len,
        }
    }
}

/// A sealed MADT; also serves as a one-table [`FirmwareTables`].
#[derive(Clone, Copy)]
pub struct MadtImage {
    buf: [u8; MADT_IMAGE_CAPACITY],
    len: usize,
}

impl MadtImage {
    pub fn bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn region(&self) -> Option<TableRegion<'_>> {
        TableRegion::new(self.bytes())
    }
}

impl FirmwareTables for MadtImage {
    fn locate_table(&self, signature: &[u8; 4]) -> Option<TableRegion<'_>> {
        if signature != MADT_SIGNATURE {
            return None;
        }
        self.region()
    }
}

/// Firmware with no tables at all.
pub struct NoTables;

impl FirmwareTables for NoTables {
    fn locate_table(&self, _signature: &[u8; 4]) -> Option<TableRegion<'_>> {
        None
    }
}
