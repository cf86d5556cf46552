//! MADT (Multiple APIC Description Table) entry iteration and decoding.
//!
//! After the SDT header and two fixed fields the MADT is a stream of records,
//! each starting with `(type: u8, length: u8)`. The walker only trusts those
//! two bytes: every advance is checked against the table end before anything
//! is read, and a record that would cross it ends the walk.

use core::fmt;
use core::iter::FusedIterator;

use bitflags::bitflags;
use x86_64::PhysAddr;

use crate::tables::{SDT_HEADER_LEN, TableRegion, read_u16, read_u32, read_u64};

pub const MADT_SIGNATURE: &[u8; 4] = b"APIC";

/// SDT header + local APIC address + flags.
pub const MADT_HEADER_LEN: usize = SDT_HEADER_LEN + 8;

const ENTRY_HEADER_LEN: usize = 2;

pub const MADT_ENTRY_LOCAL_APIC: u8 = 0;
pub const MADT_ENTRY_IOAPIC: u8 = 1;
pub const MADT_ENTRY_INTERRUPT_OVERRIDE: u8 = 2;
pub const MADT_ENTRY_NMI_SOURCE: u8 = 3;
pub const MADT_ENTRY_LOCAL_APIC_NMI: u8 = 4;
pub const MADT_ENTRY_LOCAL_APIC_ADDRESS_OVERRIDE: u8 = 5;

const LOCAL_APIC_LEN: u8 = 8;
const IOAPIC_LEN: u8 = 12;
const INTERRUPT_OVERRIDE_LEN: u8 = 10;
const NMI_SOURCE_LEN: u8 = 8;
const LOCAL_APIC_NMI_LEN: u8 = 6;
const LOCAL_APIC_ADDRESS_OVERRIDE_LEN: u8 = 12;

bitflags! {
    /// MADT header flags.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MadtFlags: u32 {
        /// A dual 8259 PIC setup is also installed.
        const PCAT_COMPAT = 1 << 0;
    }
}

bitflags! {
    /// Processor Local APIC flags.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct LocalApicFlags: u32 {
        const ENABLED = 1 << 0;
        /// Only meaningful when `ENABLED` is clear.
        const ONLINE_CAPABLE = 1 << 1;
    }
}

bitflags! {
    /// MPS INTI flags carried by override and NMI records.
    ///
    /// * bits 1:0 = polarity: 00 bus default, 01 active high, 10 reserved,
    ///   11 active low
    /// * bits 3:2 = trigger mode: 00 bus default, 01 edge, 10 reserved,
    ///   11 level
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MpsIntiFlags: u16 {
        const POLARITY_MASK = 0b0011;
        const TRIGGER_MASK = 0b1100;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Polarity {
    BusDefault,
    ActiveHigh,
    Reserved,
    ActiveLow,
}

impl Polarity {
    pub const fn from_bits(bits: u16) -> Self {
        match bits & 0b11 {
            0b00 => Self::BusDefault,
            0b01 => Self::ActiveHigh,
            0b10 => Self::Reserved,
            _ => Self::ActiveLow,
        }
    }

    pub const fn bits(self) -> u16 {
        match self {
            Self::BusDefault => 0b00,
            Self::ActiveHigh => 0b01,
            Self::Reserved => 0b10,
            Self::ActiveLow => 0b11,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerMode {
    BusDefault,
    Edge,
    Reserved,
    Level,
}

impl TriggerMode {
    /// Decodes an already-shifted 2-bit field.
    pub const fn from_bits(bits: u16) -> Self {
        match bits & 0b11 {
            0b00 => Self::BusDefault,
            0b01 => Self::Edge,
            0b10 => Self::Reserved,
            _ => Self::Level,
        }
    }

    pub const fn bits(self) -> u16 {
        match self {
            Self::BusDefault => 0b00,
            Self::Edge => 0b01,
            Self::Reserved => 0b10,
            Self::Level => 0b11,
        }
    }
}

impl MpsIntiFlags {
    pub fn new(polarity: Polarity, trigger: TriggerMode) -> Self {
        Self::from_bits_retain(polarity.bits() | (trigger.bits() << 2))
    }

    pub fn polarity(self) -> Polarity {
        Polarity::from_bits(self.bits() & Self::POLARITY_MASK.bits())
    }

    pub fn trigger_mode(self) -> TriggerMode {
        TriggerMode::from_bits((self.bits() & Self::TRIGGER_MASK.bits()) >> 2)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LocalApicInfo {
    pub processor_id: u8,
    pub apic_id: u8,
    pub flags: LocalApicFlags,
}

impl LocalApicInfo {
    pub fn is_enabled(&self) -> bool {
        self.flags.contains(LocalApicFlags::ENABLED)
    }

    pub fn is_online_capable(&self) -> bool {
        self.flags.contains(LocalApicFlags::ONLINE_CAPABLE)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IoapicInfo {
    pub id: u8,
    pub address: PhysAddr,
    pub gsi_base: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InterruptOverride {
    pub bus_source: u8,
    pub irq_source: u8,
    pub gsi: u32,
    pub flags: MpsIntiFlags,
}

impl InterruptOverride {
    pub fn polarity(&self) -> Polarity {
        self.flags.polarity()
    }

    pub fn trigger_mode(&self) -> TriggerMode {
        self.flags.trigger_mode()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NmiSource {
    pub flags: MpsIntiFlags,
    pub gsi: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LocalApicNmi {
    /// `0xFF` targets every processor.
    pub processor_id: u8,
    pub flags: MpsIntiFlags,
    pub lint: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MadtEntry {
    LocalApic(LocalApicInfo),
    Ioapic(IoapicInfo),
    InterruptOverride(InterruptOverride),
    NmiSource(NmiSource),
    LocalApicNmi(LocalApicNmi),
    LocalApicAddressOverride { address: PhysAddr },
    Unknown { entry_type: u8, length: u8 },
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MalformedKind {
    /// Fewer than two bytes left where a record header should start.
    TruncatedHeader,
    /// Declared length cannot even cover the record header (0 or 1).
    LengthTooSmall,
    /// Declared length runs past the end of the table.
    Overrun,
    /// A known record type is shorter than its structure.
    Truncated { required: u8 },
    /// Address field is not a valid physical address.
    InvalidAddress,
}

/// A record the walker or decoder refused to read.
///
/// `offset` is relative to the start of the table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MalformedRecord {
    pub offset: usize,
    pub entry_type: u8,
    pub length: u8,
    pub kind: MalformedKind,
}

impl fmt::Display for MalformedRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            MalformedKind::TruncatedHeader => {
                write!(f, "truncated record header at offset {:#x}", self.offset)
            }
            MalformedKind::LengthTooSmall => write!(
                f,
                "record type {} at offset {:#x} declares length {}",
                self.entry_type, self.offset, self.length
            ),
            MalformedKind::Overrun => write!(
                f,
                "record type {} at offset {:#x} with length {} runs past table end",
                self.entry_type, self.offset, self.length
            ),
            MalformedKind::Truncated { required } => write!(
                f,
                "record type {} at offset {:#x} has length {}, needs {}",
                self.entry_type, self.offset, self.length, required
            ),
            MalformedKind::InvalidAddress => write!(
                f,
                "record type {} at offset {:#x} carries an invalid physical address",
                self.entry_type, self.offset
            ),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MadtError {
    WrongSignature { found: [u8; 4] },
    TooShort { length: usize },
}

impl fmt::Display for MadtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WrongSignature { found } => {
                write!(f, "expected MADT signature, found {:?}", found)
            }
            Self::TooShort { length } => write!(
                f,
                "MADT length {} shorter than its {}-byte header",
                length, MADT_HEADER_LEN
            ),
        }
    }
}

pub type MadtResult<T> = Result<T, MadtError>;

// =============================================================================
// Table and records
// =============================================================================

/// Parsed handle to the MADT, supporting iteration over its entries.
#[derive(Clone, Copy, Debug)]
pub struct Madt<'a> {
    region: TableRegion<'a>,
    lapic_address: u32,
    flags: MadtFlags,
}

impl<'a> Madt<'a> {
    pub fn new(region: TableRegion<'a>) -> MadtResult<Self> {
        if &region.signature() != MADT_SIGNATURE {
            return Err(MadtError::WrongSignature {
                found: region.signature(),
            });
        }
        if region.length() < MADT_HEADER_LEN {
            return Err(MadtError::TooShort {
                length: region.length(),
            });
        }
        let bytes = region.as_bytes();
        Ok(Self {
            region,
            lapic_address: read_u32(bytes, SDT_HEADER_LEN),
            flags: MadtFlags::from_bits_retain(read_u32(bytes, SDT_HEADER_LEN + 4)),
        })
    }

    /// Local APIC base from the header; a type 5 record may supersede it.
    pub fn local_apic_address(&self) -> PhysAddr {
        PhysAddr::new(self.lapic_address as u64)
    }

    pub fn flags(&self) -> MadtFlags {
        self.flags
    }

    pub fn region(&self) -> TableRegion<'a> {
        self.region
    }

    pub fn entries(&self) -> MadtEntries<'a> {
        MadtEntries {
            table: self.region.as_bytes(),
            offset: MADT_HEADER_LEN,
            done: false,
        }
    }

    /// Call `handler` on each record in table order.
    ///
    /// Returns the number of records delivered, or the record that stopped
    /// the walk. Records delivered before the error remain valid.
    pub fn walk<F>(&self, mut handler: F) -> Result<usize, MalformedRecord>
    where
        F: FnMut(MadtRecord<'a>),
    {
        let mut delivered = 0;
        for record in self.entries() {
            handler(record?);
            delivered += 1;
        }
        Ok(delivered)
    }
}

/// Borrowed view of one MADT record, header included.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MadtRecord<'a> {
    offset: usize,
    bytes: &'a [u8],
}

impl<'a> MadtRecord<'a> {
    #[inline]
    pub fn entry_type(&self) -> u8 {
        self.bytes[0]
    }

    #[inline]
    pub fn length(&self) -> u8 {
        self.bytes[1]
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.bytes[ENTRY_HEADER_LEN..]
    }

    fn malformed(&self, kind: MalformedKind) -> MalformedRecord {
        MalformedRecord {
            offset: self.offset,
            entry_type: self.entry_type(),
            length: self.length(),
            kind,
        }
    }

    fn require(&self, required: u8) -> Result<&'a [u8], MalformedRecord> {
        if self.length() < required {
            return Err(self.malformed(MalformedKind::Truncated { required }));
        }
        Ok(self.bytes)
    }

    pub fn decode(&self) -> Result<MadtEntry, MalformedRecord> {
        let entry = match self.entry_type() {
            MADT_ENTRY_LOCAL_APIC => {
                let b = self.require(LOCAL_APIC_LEN)?;
                MadtEntry::LocalApic(LocalApicInfo {
                    processor_id: b[2],
                    apic_id: b[3],
                    flags: LocalApicFlags::from_bits_retain(read_u32(b, 4)),
                })
            }
            MADT_ENTRY_IOAPIC => {
                let b = self.require(IOAPIC_LEN)?;
                MadtEntry::Ioapic(IoapicInfo {
                    id: b[2],
                    address: PhysAddr::new(read_u32(b, 4) as u64),
                    gsi_base: read_u32(b, 8),
                })
            }
            MADT_ENTRY_INTERRUPT_OVERRIDE => {
                let b = self.require(INTERRUPT_OVERRIDE_LEN)?;
                MadtEntry::InterruptOverride(InterruptOverride {
                    bus_source: b[2],
                    irq_source: b[3],
                    gsi: read_u32(b, 4),
                    flags: MpsIntiFlags::from_bits_retain(read_u16(b, 8)),
                })
            }
            MADT_ENTRY_NMI_SOURCE => {
                let b = self.require(NMI_SOURCE_LEN)?;
                MadtEntry::NmiSource(NmiSource {
                    flags: MpsIntiFlags::from_bits_retain(read_u16(b, 2)),
                    gsi: read_u32(b, 4),
                })
            }
            MADT_ENTRY_LOCAL_APIC_NMI => {
                let b = self.require(LOCAL_APIC_NMI_LEN)?;
                MadtEntry::LocalApicNmi(LocalApicNmi {
                    processor_id: b[2],
                    flags: MpsIntiFlags::from_bits_retain(read_u16(b, 3)),
                    lint: b[5],
                })
            }
            MADT_ENTRY_LOCAL_APIC_ADDRESS_OVERRIDE => {
                let b = self.require(LOCAL_APIC_ADDRESS_OVERRIDE_LEN)?;
                let address = PhysAddr::try_new(read_u64(b, 4))
                    .map_err(|_| self.malformed(MalformedKind::InvalidAddress))?;
                MadtEntry::LocalApicAddressOverride { address }
            }
            t => MadtEntry::Unknown {
                entry_type: t,
                length: self.length(),
            },
        };
        Ok(entry)
    }
}

/// Iterator over MADT records; fused after the first malformed record.
pub struct MadtEntries<'a> {
    table: &'a [u8],
    offset: usize,
    done: bool,
}

impl<'a> MadtEntries<'a> {
    fn fail(&mut self, entry_type: u8, length: u8, kind: MalformedKind) -> MalformedRecord {
        self.done = true;
        MalformedRecord {
            offset: self.offset,
            entry_type,
            length,
            kind,
        }
    }
}

impl<'a> Iterator for MadtEntries<'a> {
    type Item = Result<MadtRecord<'a>, MalformedRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.offset >= self.table.len() {
            return None;
        }

        let remaining = self.table.len() - self.offset;
        if remaining < ENTRY_HEADER_LEN {
            return Some(Err(self.fail(0, 0, MalformedKind::TruncatedHeader)));
        }

        let entry_type = self.table[self.offset];
        let length = self.table[self.offset + 1];
        if (length as usize) < ENTRY_HEADER_LEN {
            return Some(Err(self.fail(
                entry_type,
                length,
                MalformedKind::LengthTooSmall,
            )));
        }
        if length as usize > remaining {
            return Some(Err(self.fail(entry_type, length, MalformedKind::Overrun)));
        }

        let end = self.offset + length as usize;
        let record = MadtRecord {
            offset: self.offset,
            bytes: &self.table[self.offset..end],
        };
        self.offset = end;
        Some(Ok(record))
    }
}

impl FusedIterator for MadtEntries<'_> {}
