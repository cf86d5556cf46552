//! I/O APIC discovery and legacy IRQ routing.

pub mod discovery;
pub mod driver;
pub mod mmio;
pub mod registry;
pub mod regs;
pub mod routing;

#[cfg(test)]
mod tests;

use gsiroute_acpi::tables::FirmwareTables;
use gsiroute_lib::{klog_debug, klog_info};

pub use discovery::{
    Discovery, DiscoveryError, DiscoveryReport, DiscoveryResult, DiscoveryState, discover,
};
pub use driver::IoapicDriver;
pub use mmio::MmioIoapicDriver;
pub use registry::{
    FrozenRegistry, IoapicEntry, IoapicRegistry, RegistryError, RegistryResult, publish,
    published,
};
pub use routing::{OverrideDirective, RoutedPin, RoutingError, RoutingResult, apply_override};

/// Discover controllers, route ISA overrides, and publish the registry.
///
/// Returns the already published registry if an earlier call succeeded.
pub fn init<T, D>(tables: &T, driver: &mut D) -> DiscoveryResult<&'static FrozenRegistry>
where
    T: FirmwareTables + ?Sized,
    D: IoapicDriver + ?Sized,
{
    if let Some(registry) = published() {
        klog_debug!("IOAPIC: already initialized");
        return Ok(registry);
    }

    let mut registry = IoapicRegistry::new();
    let report = discover(tables, &mut registry, driver)?;

    if registry.is_empty() {
        klog_info!("IOAPIC: No controllers discovered");
    }
    klog_info!(
        "IOAPIC: Discovery complete: {} controller(s), {} CPU(s), {} override(s) applied, {} skipped",
        report.controllers_registered,
        report.processors_enabled,
        report.overrides_applied,
        report.overrides_skipped
    );

    Ok(publish(registry.freeze())?)
}
