//! Firmware table location: RSDP validation, XSDT/RSDT traversal, lookup by
//! signature.
//!
//! Everything downstream of this module sees a table only as a
//! [`TableRegion`], a checksum-validated byte slice whose declared length has
//! already been checked against the bytes actually available.

use core::slice;

use gsiroute_lib::{klog_debug, klog_info, klog_warn};

/// Length of the common System Description Table header.
pub const SDT_HEADER_LEN: usize = 36;

/// Length of an ACPI 1.0 RSDP (the part covered by the first checksum).
pub const RSDP_V1_LEN: usize = 20;

/// Length of an ACPI 2.0+ RSDP.
pub const RSDP_V2_LEN: usize = 36;

const RSDP_SIGNATURE: &[u8; 8] = b"RSD PTR ";
const XSDT_SIGNATURE: &[u8; 4] = b"XSDT";
const RSDT_SIGNATURE: &[u8; 4] = b"RSDT";

const SDT_LENGTH_OFFSET: usize = 4;

const RSDP_REVISION_OFFSET: usize = 15;
const RSDP_RSDT_OFFSET: usize = 16;
const RSDP_LENGTH_OFFSET: usize = 20;
const RSDP_XSDT_OFFSET: usize = 24;

#[inline]
pub(crate) fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

#[inline]
pub(crate) fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(raw)
}

#[inline]
pub(crate) fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(raw)
}

/// Wrapping byte sum; a valid ACPI structure sums to zero.
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |sum, byte| sum.wrapping_add(*byte))
}

/// Immutable view of one System Description Table.
///
/// The slice is trimmed to the table's declared length, so `as_bytes().len()`
/// is always the declared length.
#[derive(Clone, Copy, Debug)]
pub struct TableRegion<'a> {
    bytes: &'a [u8],
}

impl<'a> TableRegion<'a> {
    /// Wrap `bytes` as a table.
    ///
    /// Returns `None` if the slice cannot hold an SDT header, or if the
    /// declared length is smaller than the header or larger than the slice.
    pub fn new(bytes: &'a [u8]) -> Option<Self> {
        if bytes.len() < SDT_HEADER_LEN {
            return None;
        }
        let declared = read_u32(bytes, SDT_LENGTH_OFFSET) as usize;
        if declared < SDT_HEADER_LEN || declared > bytes.len() {
            return None;
        }
        Some(Self {
            bytes: &bytes[..declared],
        })
    }

    pub fn signature(&self) -> [u8; 4] {
        [self.bytes[0], self.bytes[1], self.bytes[2], self.bytes[3]]
    }

    #[inline]
    pub fn length(&self) -> usize {
        self.bytes.len()
    }

    pub fn revision(&self) -> u8 {
        self.bytes[8]
    }

    #[inline]
    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Bytes following the SDT header.
    #[inline]
    pub fn payload(&self) -> &'a [u8] {
        &self.bytes[SDT_HEADER_LEN..]
    }
}

pub fn validate_checksum(region: &TableRegion<'_>) -> bool {
    checksum(region.as_bytes()) == 0
}

/// Source of validated firmware tables.
pub trait FirmwareTables {
    /// Find a table by its 4-byte ASCII signature.
    ///
    /// Implementations only return tables whose checksum is valid.
    fn locate_table(&self, signature: &[u8; 4]) -> Option<TableRegion<'_>>;
}

/// Validated handle to the ACPI table hierarchy rooted at an RSDP.
///
/// Physical addresses found in the RSDP, XSDT and RSDT are translated with a
/// fixed direct-map offset (`virt = phys + hhdm_offset`).
pub struct AcpiTables {
    rsdp: &'static [u8],
    hhdm_offset: u64,
}

impl AcpiTables {
    /// Validate an RSDP and return a handle for table lookups.
    ///
    /// Returns `None` if the pointer is null, the signature does not match,
    /// or an RSDP checksum fails.
    ///
    /// # Safety
    ///
    /// `rsdp_phys + hhdm_offset` must point to readable memory holding the
    /// RSDP, and every table it references must stay mapped and unmodified
    /// at `phys + hhdm_offset` for the rest of the kernel's lifetime.
    pub unsafe fn from_rsdp(rsdp_phys: u64, hhdm_offset: u64) -> Option<Self> {
        let base = map_phys(rsdp_phys, hhdm_offset)?;
        // SAFETY: the caller guarantees the RSDP is mapped at `base`.
        let v1 = unsafe { slice::from_raw_parts(base, RSDP_V1_LEN) };
        if &v1[..8] != RSDP_SIGNATURE {
            klog_info!("ACPI: RSDP signature mismatch");
            return None;
        }
        if checksum(v1) != 0 {
            klog_info!("ACPI: RSDP checksum failed");
            return None;
        }

        let mut rsdp = v1;
        if v1[RSDP_REVISION_OFFSET] >= 2 {
            // SAFETY: revision 2+ RSDPs are at least RSDP_V2_LEN bytes long.
            let head = unsafe { slice::from_raw_parts(base, RSDP_V2_LEN) };
            let length = read_u32(head, RSDP_LENGTH_OFFSET) as usize;
            if length < RSDP_V2_LEN {
                klog_info!("ACPI: RSDP length {} too short for revision 2", length);
                return None;
            }
            // SAFETY: the RSDP declares its own length.
            let full = unsafe { slice::from_raw_parts(base, length) };
            if checksum(full) != 0 {
                klog_info!("ACPI: RSDP extended checksum failed");
                return None;
            }
            rsdp = full;
        }

        Some(Self { rsdp, hhdm_offset })
    }

    pub fn revision(&self) -> u8 {
        self.rsdp[RSDP_REVISION_OFFSET]
    }

    fn xsdt_address(&self) -> u64 {
        if self.rsdp.len() >= RSDP_V2_LEN {
            read_u64(self.rsdp, RSDP_XSDT_OFFSET)
        } else {
            0
        }
    }

    fn rsdt_address(&self) -> u64 {
        read_u32(self.rsdp, RSDP_RSDT_OFFSET) as u64
    }

    fn table_at(&self, phys: u64) -> Option<TableRegion<'static>> {
        let base = map_phys(phys, self.hhdm_offset)?;
        // SAFETY: `from_rsdp`'s contract covers every table reachable from
        // the RSDP; the header is read first to learn the full length.
        let header = unsafe { slice::from_raw_parts(base, SDT_HEADER_LEN) };
        let length = read_u32(header, SDT_LENGTH_OFFSET) as usize;
        if length < SDT_HEADER_LEN {
            return None;
        }
        let bytes = unsafe { slice::from_raw_parts(base, length) };
        TableRegion::new(bytes)
    }

    fn root_table(&self, phys: u64, signature: &[u8; 4]) -> Option<TableRegion<'static>> {
        if phys == 0 {
            return None;
        }
        let root = self.table_at(phys)?;
        if &root.signature() != signature {
            klog_warn!(
                "ACPI: root table at 0x{:x} has wrong signature {:?}",
                phys,
                root.signature()
            );
            return None;
        }
        if !validate_checksum(&root) {
            klog_warn!("ACPI: root table at 0x{:x} has invalid checksum", phys);
            return None;
        }
        Some(root)
    }

    fn scan_sdt(
        &self,
        sdt: TableRegion<'static>,
        entry_size: usize,
        signature: &[u8; 4],
    ) -> Option<TableRegion<'static>> {
        for entry in sdt.payload().chunks_exact(entry_size) {
            let phys = if entry_size == 8 {
                read_u64(entry, 0)
            } else {
                read_u32(entry, 0) as u64
            };

            let Some(candidate) = self.table_at(phys) else {
                continue;
            };
            if &candidate.signature() != signature {
                continue;
            }
            if !validate_checksum(&candidate) {
                klog_info!("ACPI: Found table with invalid checksum, skipping");
                continue;
            }
            klog_debug!("ACPI: table {:?} at phys 0x{:x}", signature, phys);
            return Some(candidate);
        }
        None
    }
}

impl FirmwareTables for AcpiTables {
    /// Searches the XSDT first (64-bit entries), then falls back to the RSDT
    /// (32-bit entries).
    fn locate_table(&self, signature: &[u8; 4]) -> Option<TableRegion<'_>> {
        if self.revision() >= 2 {
            if let Some(xsdt) = self.root_table(self.xsdt_address(), XSDT_SIGNATURE) {
                if let Some(hit) = self.scan_sdt(xsdt, 8, signature) {
                    return Some(hit);
                }
            }
        }

        if let Some(rsdt) = self.root_table(self.rsdt_address(), RSDT_SIGNATURE) {
            if let Some(hit) = self.scan_sdt(rsdt, 4, signature) {
                return Some(hit);
            }
        }

        None
    }
}

fn map_phys(phys: u64, hhdm_offset: u64) -> Option<*const u8> {
    if phys == 0 {
        return None;
    }
    let virt = phys.checked_add(hhdm_offset)?;
    Some(virt as usize as *const u8)
}
