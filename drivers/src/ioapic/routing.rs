//! Legacy ISA IRQ routing from Interrupt Source Override records.

use core::fmt;

use gsiroute_acpi::madt::{InterruptOverride, Polarity, TriggerMode};
use gsiroute_lib::{klog_error, klog_info, klog_warn};

use super::driver::IoapicDriver;
use super::registry::IoapicRegistry;

/// Decoded override, consumed as soon as it is applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OverrideDirective {
    pub bus: u8,
    pub legacy_irq: u8,
    pub gsi: u32,
    pub polarity: Polarity,
    pub trigger: TriggerMode,
}

impl From<InterruptOverride> for OverrideDirective {
    fn from(iso: InterruptOverride) -> Self {
        Self {
            bus: iso.bus_source,
            legacy_irq: iso.irq_source,
            gsi: iso.gsi,
            polarity: iso.polarity(),
            trigger: iso.trigger_mode(),
        }
    }
}

/// Pin configuration written for one directive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RoutedPin {
    pub ioapic_id: u8,
    pub pin: u32,
    pub vector: u8,
    pub polarity: Polarity,
    pub trigger: TriggerMode,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoutingError {
    /// No controller starts at or below the GSI.
    UnresolvedRoutingTarget { legacy_irq: u8, gsi: u32 },
    /// A controller starts below the GSI but has no pin for it.
    InvalidVectorSource { legacy_irq: u8, gsi: u32, ioapic_id: u8 },
}

impl fmt::Display for RoutingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnresolvedRoutingTarget { legacy_irq, gsi } => write!(
                f,
                "ISA IRQ {} -> GSI {}: no IOAPIC owns this GSI",
                legacy_irq, gsi
            ),
            Self::InvalidVectorSource {
                legacy_irq,
                gsi,
                ioapic_id,
            } => write!(
                f,
                "ISA IRQ {} -> GSI {}: beyond the pins of IOAPIC 0x{:x}",
                legacy_irq, gsi, ioapic_id
            ),
        }
    }
}

pub type RoutingResult<T> = Result<T, RoutingError>;

/// Program the pin that `directive` points at.
///
/// The vector is written before polarity and trigger mode. On failure
/// nothing is written and only this directive is abandoned.
pub fn apply_override<D>(
    registry: &IoapicRegistry,
    driver: &mut D,
    directive: &OverrideDirective,
) -> RoutingResult<RoutedPin>
where
    D: IoapicDriver + ?Sized,
{
    let Some(ioapic) = registry.lookup_owning(directive.gsi, &*driver).copied() else {
        let err = match registry.nearest_below(directive.gsi) {
            Some(nearest) => RoutingError::InvalidVectorSource {
                legacy_irq: directive.legacy_irq,
                gsi: directive.gsi,
                ioapic_id: nearest.id,
            },
            None => RoutingError::UnresolvedRoutingTarget {
                legacy_irq: directive.legacy_irq,
                gsi: directive.gsi,
            },
        };
        klog_error!("IOAPIC: ignoring ISA IRQ override: {}", err);
        return Err(err);
    };

    if directive.polarity == Polarity::Reserved || directive.trigger == TriggerMode::Reserved {
        klog_warn!(
            "IOAPIC: ISA IRQ {} override uses reserved encoding ({:?}/{:?}), using bus default",
            directive.legacy_irq,
            directive.polarity,
            directive.trigger
        );
    }

    let pin = directive.gsi - ioapic.gsi_base;
    driver.set_pin_vector(&ioapic, pin, directive.legacy_irq);
    driver.set_pin_polarity(&ioapic, pin, directive.polarity);
    driver.set_pin_trigger_mode(&ioapic, pin, directive.trigger);

    klog_info!(
        "IOAPIC: IRQ override bus {} int {} -> GSI {} (IOAPIC 0x{:x} pin {}), {:?}/{:?}",
        directive.bus,
        directive.legacy_irq,
        directive.gsi,
        ioapic.id,
        pin,
        directive.polarity,
        directive.trigger
    );

    Ok(RoutedPin {
        ioapic_id: ioapic.id,
        pin,
        vector: directive.legacy_irq,
        polarity: directive.polarity,
        trigger: directive.trigger,
    })
}
