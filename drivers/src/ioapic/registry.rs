//! Registry of discovered I/O APICs.
//!
//! Filled during MADT pass 1, then frozen and published for lock-free reads
//! from any CPU. A controller's pin count is not stored; range lookups ask
//! the driver for it.

use core::fmt;
use core::slice;

use spin::Once;
use x86_64::PhysAddr;

use super::driver::IoapicDriver;
use super::regs::IOAPIC_MAX_CONTROLLERS;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IoapicEntry {
    pub id: u8,
    pub address: PhysAddr,
    pub gsi_base: u32,
}

impl IoapicEntry {
    fn vacant() -> Self {
        Self {
            id: 0,
            address: PhysAddr::zero(),
            gsi_base: 0,
        }
    }

    /// One past the last GSI, given the controller's pin count.
    #[inline]
    pub fn gsi_end(&self, pins: u32) -> u64 {
        self.gsi_base as u64 + pins as u64
    }

    #[inline]
    pub fn owns(&self, gsi: u32, pins: u32) -> bool {
        gsi >= self.gsi_base && (gsi as u64) < self.gsi_end(pins)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegistryError {
    DuplicateIdentifier { id: u8 },
    Full { id: u8 },
    AlreadyPublished,
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateIdentifier { id } => {
                write!(f, "IOAPIC id 0x{:x} already registered", id)
            }
            Self::Full { id } => write!(
                f,
                "no room for IOAPIC id 0x{:x} ({} controllers max)",
                id, IOAPIC_MAX_CONTROLLERS
            ),
            Self::AlreadyPublished => write!(f, "IOAPIC registry already published"),
        }
    }
}

pub type RegistryResult<T = ()> = Result<T, RegistryError>;

/// Append-only controller table in discovery order.
#[derive(Clone, Debug)]
pub struct IoapicRegistry {
    entries: [IoapicEntry; IOAPIC_MAX_CONTROLLERS],
    count: usize,
}

impl Default for IoapicRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for IoapicRegistry {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for IoapicRegistry {}

impl IoapicRegistry {
    pub fn new() -> Self {
        Self {
            entries: [IoapicEntry::vacant(); IOAPIC_MAX_CONTROLLERS],
            count: 0,
        }
    }

    pub fn register(&mut self, id: u8, address: PhysAddr, gsi_base: u32) -> RegistryResult {
        if self.lookup_by_identifier(id).is_some() {
            return Err(RegistryError::DuplicateIdentifier { id });
        }
        if self.count >= IOAPIC_MAX_CONTROLLERS {
            return Err(RegistryError::Full { id });
        }
        self.entries[self.count] = IoapicEntry {
            id,
            address,
            gsi_base,
        };
        self.count += 1;
        Ok(())
    }

    #[inline]
    pub fn as_slice(&self) -> &[IoapicEntry] {
        &self.entries[..self.count]
    }

    pub fn iter(&self) -> slice::Iter<'_, IoapicEntry> {
        self.as_slice().iter()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn lookup_by_identifier(&self, id: u8) -> Option<&IoapicEntry> {
        self.iter().find(|entry| entry.id == id)
    }

    /// The controller whose pin bank covers `gsi`.
    pub fn lookup_owning<D>(&self, gsi: u32, driver: &D) -> Option<&IoapicEntry>
    where
        D: IoapicDriver + ?Sized,
    {
        self.iter()
            .find(|entry| entry.owns(gsi, driver.redirection_entries(entry)))
    }

    /// The controller with the highest `gsi_base` not above `gsi`.
    pub fn nearest_below(&self, gsi: u32) -> Option<&IoapicEntry> {
        self.iter()
            .filter(|entry| entry.gsi_base <= gsi)
            .max_by_key(|entry| entry.gsi_base)
    }

    /// First pair of controllers (by id) whose GSI ranges intersect.
    pub fn find_overlap<D>(&self, driver: &D) -> Option<(u8, u8)>
    where
        D: IoapicDriver + ?Sized,
    {
        let entries = self.as_slice();
        for (i, a) in entries.iter().enumerate() {
            let a_end = a.gsi_end(driver.redirection_entries(a));
            for b in &entries[i + 1..] {
                let b_end = b.gsi_end(driver.redirection_entries(b));
                if (a.gsi_base as u64) < b_end && (b.gsi_base as u64) < a_end {
                    return Some((a.id, b.id));
                }
            }
        }
        None
    }

    /// End the registration phase.
    pub fn freeze(self) -> FrozenRegistry {
        FrozenRegistry(self)
    }
}

/// Read-only registry, safe to share between CPUs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrozenRegistry(IoapicRegistry);

impl FrozenRegistry {
    pub fn iter(&self) -> slice::Iter<'_, IoapicEntry> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn lookup_by_identifier(&self, id: u8) -> Option<&IoapicEntry> {
        self.0.lookup_by_identifier(id)
    }

    pub fn lookup_owning<D>(&self, gsi: u32, driver: &D) -> Option<&IoapicEntry>
    where
        D: IoapicDriver + ?Sized,
    {
        self.0.lookup_owning(gsi, driver)
    }
}

static PUBLISHED: Once<FrozenRegistry> = Once::new();

/// Make `frozen` the system-wide registry. Only the first call succeeds.
pub fn publish(frozen: FrozenRegistry) -> RegistryResult<&'static FrozenRegistry> {
    let mut installed = false;
    let registry = PUBLISHED.call_once(|| {
        installed = true;
        frozen
    });
    if installed {
        Ok(registry)
    } else {
        Err(RegistryError::AlreadyPublished)
    }
}

pub fn published() -> Option<&'static FrozenRegistry> {
    PUBLISHED.get()
}
