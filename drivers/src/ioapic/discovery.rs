//! Two-pass MADT discovery.
//!
//! Pass 1 registers every I/O APIC. Pass 2 interprets the remaining records
//! and routes legacy IRQ overrides, which may name a controller listed later
//! in the table.

use core::fmt;

use gsiroute_acpi::madt::{
    MADT_ENTRY_IOAPIC, MADT_SIGNATURE, Madt, MadtEntry, MadtError, MadtFlags, MadtRecord,
    MalformedRecord,
};
use gsiroute_acpi::tables::FirmwareTables;
use gsiroute_lib::{klog_debug, klog_error, klog_info, klog_warn};
use x86_64::PhysAddr;

use super::driver::IoapicDriver;
use super::registry::{IoapicRegistry, RegistryError};
use super::routing::{OverrideDirective, apply_override};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiscoveryError {
    TableNotFound,
    InvalidHeader(MadtError),
    MalformedTable(MalformedRecord),
    /// A step was called out of order.
    InvalidTransition,
    Registry(RegistryError),
}

impl fmt::Display for DiscoveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TableNotFound => write!(f, "MADT not found in ACPI tables"),
            Self::InvalidHeader(err) => write!(f, "invalid MADT header: {}", err),
            Self::MalformedTable(record) => write!(f, "malformed MADT: {}", record),
            Self::InvalidTransition => write!(f, "discovery step called out of order"),
            Self::Registry(err) => write!(f, "{}", err),
        }
    }
}

impl From<RegistryError> for DiscoveryError {
    fn from(err: RegistryError) -> Self {
        Self::Registry(err)
    }
}

pub type DiscoveryResult<T = ()> = Result<T, DiscoveryError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiscoveryState {
    Unstarted,
    TableLocated,
    ControllersRegistered,
    OverridesApplied,
    Failed(DiscoveryError),
}

/// What discovery saw and did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DiscoveryReport {
    /// Header value, or the type 5 override when one is present.
    pub lapic_address: PhysAddr,
    pub pcat_compat: bool,
    pub processors_enabled: usize,
    pub processors_disabled: usize,
    pub controllers_registered: usize,
    pub controllers_rejected: usize,
    pub overrides_applied: usize,
    pub overrides_skipped: usize,
    pub nmi_sources: usize,
    pub lapic_nmis: usize,
    /// Known records too short to decode.
    pub records_skipped: usize,
}

impl DiscoveryReport {
    fn new() -> Self {
        Self {
            lapic_address: PhysAddr::zero(),
            pcat_compat: false,
            processors_enabled: 0,
            processors_disabled: 0,
            controllers_registered: 0,
            controllers_rejected: 0,
            overrides_applied: 0,
            overrides_skipped: 0,
            nmi_sources: 0,
            lapic_nmis: 0,
            records_skipped: 0,
        }
    }
}

/// Step-by-step driver over one MADT.
///
/// Each step checks the current state; a failure moves to
/// [`DiscoveryState::Failed`] and every later step returns that error.
pub struct Discovery<'t> {
    state: DiscoveryState,
    madt: Option<Madt<'t>>,
    report: DiscoveryReport,
}

impl Default for Discovery<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'t> Discovery<'t> {
    pub fn new() -> Self {
        Self {
            state: DiscoveryState::Unstarted,
            madt: None,
            report: DiscoveryReport::new(),
        }
    }

    pub fn state(&self) -> DiscoveryState {
        self.state
    }

    pub fn report(&self) -> DiscoveryReport {
        self.report
    }

    fn enter(&self, expected: DiscoveryState) -> DiscoveryResult<Madt<'t>> {
        if let DiscoveryState::Failed(err) = self.state {
            return Err(err);
        }
        if self.state != expected {
            return Err(DiscoveryError::InvalidTransition);
        }
        self.madt.ok_or(DiscoveryError::InvalidTransition)
    }

    fn fail(&mut self, err: DiscoveryError) -> DiscoveryError {
        klog_error!("ACPI: MADT discovery failed: {}", err);
        self.state = DiscoveryState::Failed(err);
        err
    }

    pub fn locate<T>(&mut self, tables: &'t T) -> DiscoveryResult
    where
        T: FirmwareTables + ?Sized,
    {
        if let DiscoveryState::Failed(err) = self.state {
            return Err(err);
        }
        if self.state != DiscoveryState::Unstarted {
            return Err(DiscoveryError::InvalidTransition);
        }

        let Some(region) = tables.locate_table(MADT_SIGNATURE) else {
            return Err(self.fail(DiscoveryError::TableNotFound));
        };
        let madt = match Madt::new(region) {
            Ok(madt) => madt,
            Err(err) => return Err(self.fail(DiscoveryError::InvalidHeader(err))),
        };

        self.report.lapic_address = madt.local_apic_address();
        self.report.pcat_compat = madt.flags().contains(MadtFlags::PCAT_COMPAT);
        klog_info!(
            "ACPI: MADT length {} local APIC {:#x}{}",
            region.length(),
            self.report.lapic_address.as_u64(),
            if self.report.pcat_compat { " (8259 present)" } else { "" }
        );

        self.madt = Some(madt);
        self.state = DiscoveryState::TableLocated;
        Ok(())
    }

    /// Pass 1: register every I/O APIC in table order.
    ///
    /// Rejected registrations are logged and counted; the first controller
    /// with a given id stays.
    pub fn register_controllers<D>(
        &mut self,
        registry: &mut IoapicRegistry,
        driver: &D,
    ) -> DiscoveryResult
    where
        D: IoapicDriver + ?Sized,
    {
        let madt = self.enter(DiscoveryState::TableLocated)?;
        let report = &mut self.report;

        let walked = madt.walk(|record| {
            if record.entry_type() != MADT_ENTRY_IOAPIC {
                return;
            }
            let info = match record.decode() {
                Ok(MadtEntry::Ioapic(info)) => info,
                Ok(_) => return,
                Err(err) => {
                    skip_record(report, &err);
                    return;
                }
            };
            match registry.register(info.id, info.address, info.gsi_base) {
                Ok(()) => {
                    report.controllers_registered += 1;
                    let entry = registry.as_slice()[registry.len() - 1];
                    let pins = driver.redirection_entries(&entry);
                    klog_info!(
                        "ACPI: I/O APIC id 0x{:x} base {:#x} GSI {}-{}",
                        info.id,
                        info.address.as_u64(),
                        info.gsi_base,
                        entry.gsi_end(pins).saturating_sub(1)
                    );
                }
                Err(err) => {
                    report.controllers_rejected += 1;
                    klog_warn!("ACPI: ignoring I/O APIC at {:#x}: {}", info.address.as_u64(), err);
                }
            }
        });
        if let Err(record) = walked {
            return Err(self.fail(DiscoveryError::MalformedTable(record)));
        }

        if let Some((a, b)) = registry.find_overlap(driver) {
            klog_warn!(
                "IOAPIC: GSI ranges of IOAPIC 0x{:x} and 0x{:x} overlap, first registered wins",
                a,
                b
            );
        }

        self.state = DiscoveryState::ControllersRegistered;
        Ok(())
    }

    /// Pass 2: interpret every record except I/O APICs and apply overrides.
    pub fn apply_overrides<D>(&mut self, registry: &IoapicRegistry, driver: &mut D) -> DiscoveryResult
    where
        D: IoapicDriver + ?Sized,
    {
        let madt = self.enter(DiscoveryState::ControllersRegistered)?;
        let report = &mut self.report;

        let walked = madt.walk(|record| {
            if record.entry_type() != MADT_ENTRY_IOAPIC {
                interpret(report, registry, &mut *driver, &record);
            }
        });
        if let Err(record) = walked {
            return Err(self.fail(DiscoveryError::MalformedTable(record)));
        }

        self.state = DiscoveryState::OverridesApplied;
        Ok(())
    }
}

fn skip_record(report: &mut DiscoveryReport, err: &MalformedRecord) {
    report.records_skipped += 1;
    klog_warn!("MADT: skipping {}", err);
}

fn interpret<D>(
    report: &mut DiscoveryReport,
    registry: &IoapicRegistry,
    driver: &mut D,
    record: &MadtRecord<'_>,
) where
    D: IoapicDriver + ?Sized,
{
    let entry = match record.decode() {
        Ok(entry) => entry,
        Err(err) => return skip_record(report, &err),
    };

    match entry {
        MadtEntry::LocalApic(lapic) => {
            if lapic.is_enabled() {
                report.processors_enabled += 1;
            } else {
                report.processors_disabled += 1;
            }
            klog_info!(
                "ACPI: LAPIC id {} processor {} {}",
                lapic.apic_id,
                lapic.processor_id,
                if lapic.is_enabled() {
                    "active"
                } else if lapic.is_online_capable() {
                    "online-capable"
                } else {
                    "inactive"
                }
            );
        }
        MadtEntry::InterruptOverride(iso) => {
            match apply_override(registry, driver, &OverrideDirective::from(iso)) {
                Ok(_) => report.overrides_applied += 1,
                Err(_) => report.overrides_skipped += 1,
            }
        }
        MadtEntry::NmiSource(nmi) => {
            report.nmi_sources += 1;
            klog_info!(
                "ACPI: NMI source GSI {} {:?}/{:?}",
                nmi.gsi,
                nmi.flags.polarity(),
                nmi.flags.trigger_mode()
            );
        }
        MadtEntry::LocalApicNmi(nmi) => {
            report.lapic_nmis += 1;
            klog_debug!(
                "ACPI: LAPIC NMI processor 0x{:x} LINT{} {:?}/{:?}",
                nmi.processor_id,
                nmi.lint,
                nmi.flags.polarity(),
                nmi.flags.trigger_mode()
            );
        }
        MadtEntry::LocalApicAddressOverride { address } => {
            klog_info!(
                "ACPI: local APIC address override {:#x} (header {:#x})",
                address.as_u64(),
                report.lapic_address.as_u64()
            );
            report.lapic_address = address;
        }
        MadtEntry::Ioapic(_) | MadtEntry::Unknown { .. } => {}
    }
}

/// Run all three discovery steps against `registry`.
pub fn discover<T, D>(
    tables: &T,
    registry: &mut IoapicRegistry,
    driver: &mut D,
) -> DiscoveryResult<DiscoveryReport>
where
    T: FirmwareTables + ?Sized,
    D: IoapicDriver + ?Sized,
{
    let mut discovery = Discovery::new();
    discovery.locate(tables)?;
    discovery.register_controllers(registry, &*driver)?;
    discovery.apply_overrides(registry, driver)?;
    Ok(discovery.report())
}
