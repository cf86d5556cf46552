//! Discovery and routing tests against synthetic MADTs and a recording driver.

use core::fmt;
use std::string::String;
use std::vec::Vec;
use std::{format, vec};

use gsiroute_acpi::madt::{MalformedKind, MalformedRecord, Polarity, TriggerMode};
use gsiroute_acpi::test_fixtures::{MadtBuilder, MadtImage, NoTables};
use gsiroute_lib::{KlogLevel, klog_register_backend};
use spin::Mutex;
use x86_64::PhysAddr;

use super::*;

const LAPIC_BASE: u32 = 0xFEE0_0000;
const IOAPIC_BASE: u32 = 0xFEC0_0000;

/// Active low, level triggered.
const INTI_LOW_LEVEL: u16 = 0b1111;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DriverCall {
    Vector { ioapic: u8, pin: u32, vector: u8 },
    Polarity { ioapic: u8, pin: u32, polarity: Polarity },
    Trigger { ioapic: u8, pin: u32, trigger: TriggerMode },
}

struct RecordingDriver {
    default_pins: u32,
    pins: Vec<(u8, u32)>,
    calls: Vec<DriverCall>,
}

impl RecordingDriver {
    fn new() -> Self {
        Self {
            default_pins: 24,
            pins: Vec::new(),
            calls: Vec::new(),
        }
    }

    fn with_pins(mut self, id: u8, pins: u32) -> Self {
        self.pins.push((id, pins));
        self
    }
}

impl IoapicDriver for RecordingDriver {
    fn redirection_entries(&self, ioapic: &IoapicEntry) -> u32 {
        self.pins
            .iter()
            .find(|(id, _)| *id == ioapic.id)
            .map_or(self.default_pins, |(_, pins)| *pins)
    }

    fn set_pin_vector(&mut self, ioapic: &IoapicEntry, pin: u32, vector: u8) {
        self.calls.push(DriverCall::Vector {
            ioapic: ioapic.id,
            pin,
            vector,
        });
    }

    fn set_pin_polarity(&mut self, ioapic: &IoapicEntry, pin: u32, polarity: Polarity) {
        self.calls.push(DriverCall::Polarity {
            ioapic: ioapic.id,
            pin,
            polarity,
        });
    }

    fn set_pin_trigger_mode(&mut self, ioapic: &IoapicEntry, pin: u32, trigger: TriggerMode) {
        self.calls.push(DriverCall::Trigger {
            ioapic: ioapic.id,
            pin,
            trigger,
        });
    }
}

static CAPTURED: Mutex<Vec<String>> = Mutex::new(Vec::new());

fn capture_backend(level: KlogLevel, args: fmt::Arguments<'_>) {
    CAPTURED.lock().push(format!("[{}] {}", level.as_str(), args));
}

/// Tests run in parallel, so callers match on lines unique to themselves.
fn captured_line_containing(needle: &str) -> bool {
    CAPTURED.lock().iter().any(|line| line.contains(needle))
}

fn run(image: &MadtImage, driver: &mut RecordingDriver) -> (IoapicRegistry, DiscoveryResult<DiscoveryReport>) {
    let mut registry = IoapicRegistry::new();
    let result = discover(image, &mut registry, driver);
    (registry, result)
}

fn ioapic_entry(id: u8, address: u32, gsi_base: u32) -> IoapicEntry {
    IoapicEntry {
        id,
        address: PhysAddr::new(address as u64),
        gsi_base,
    }
}

fn registry_of(entries: &[IoapicEntry]) -> IoapicRegistry {
    let mut registry = IoapicRegistry::new();
    for entry in entries {
        registry
            .register(entry.id, entry.address, entry.gsi_base)
            .expect("register");
    }
    registry
}

// =============================================================================
// Pass 1: controller registration
// =============================================================================

#[test]
fn test_pass_one_registers_every_ioapic() {
    let image = MadtBuilder::new(LAPIC_BASE, 0)
        .local_apic(0, 0, 1)
        .ioapic(0, IOAPIC_BASE, 0)
        .ioapic(1, IOAPIC_BASE + 0x1000, 24)
        .ioapic(2, IOAPIC_BASE + 0x2000, 48)
        .build();
    let mut driver = RecordingDriver::new();

    let (registry, result) = run(&image, &mut driver);
    let report = result.expect("discovery");

    assert_eq!(registry.len(), 3);
    assert_eq!(report.controllers_registered, 3);
    assert_eq!(report.controllers_rejected, 0);
    for (id, base) in [(0u8, 0u32), (1, 24), (2, 48)] {
        let entry = registry.lookup_by_identifier(id).expect("registered");
        assert_eq!(*entry, ioapic_entry(id, IOAPIC_BASE + 0x1000 * id as u32, base));
    }
    let ids: Vec<u8> = registry.iter().map(|entry| entry.id).collect();
    assert_eq!(ids, vec![0, 1, 2]);
    assert!(driver.calls.is_empty());
}

#[test]
fn test_duplicate_identifier_keeps_first() {
    let image = MadtBuilder::new(LAPIC_BASE, 0)
        .ioapic(1, IOAPIC_BASE, 0)
        .ioapic(1, IOAPIC_BASE + 0x1000, 24)
        .build();
    let mut driver = RecordingDriver::new();

    let (registry, result) = run(&image, &mut driver);
    let report = result.expect("duplicate is not fatal");

    assert_eq!(registry.len(), 1);
    assert_eq!(report.controllers_rejected, 1);
    assert_eq!(
        registry.lookup_by_identifier(1).map(|entry| entry.address),
        Some(PhysAddr::new(IOAPIC_BASE as u64))
    );

    let mut registry = registry;
    assert_eq!(
        registry.register(1, PhysAddr::new(0xFEC0_2000), 48),
        Err(RegistryError::DuplicateIdentifier { id: 1 })
    );
}

#[test]
fn test_registry_capacity() {
    let mut registry = IoapicRegistry::new();
    for id in 0..regs::IOAPIC_MAX_CONTROLLERS as u8 {
        registry
            .register(id, PhysAddr::new(IOAPIC_BASE as u64), id as u32 * 24)
            .expect("within capacity");
    }
    assert_eq!(
        registry.register(0x40, PhysAddr::new(IOAPIC_BASE as u64), 999),
        Err(RegistryError::Full { id: 0x40 })
    );
    assert_eq!(registry.len(), regs::IOAPIC_MAX_CONTROLLERS);
}

#[test]
fn test_overlapping_ranges_detected() {
    let driver = RecordingDriver::new();

    let disjoint = registry_of(&[ioapic_entry(0, IOAPIC_BASE, 0), ioapic_entry(1, IOAPIC_BASE, 24)]);
    assert_eq!(disjoint.find_overlap(&driver), None);

    let overlapping = registry_of(&[
        ioapic_entry(0, IOAPIC_BASE, 0),
        ioapic_entry(1, IOAPIC_BASE, 24),
        ioapic_entry(2, IOAPIC_BASE, 16),
    ]);
    assert_eq!(overlapping.find_overlap(&driver), Some((0, 2)));

    // First registered owns the shared GSIs.
    assert_eq!(overlapping.lookup_owning(20, &driver).map(|e| e.id), Some(0));
    assert_eq!(overlapping.lookup_owning(30, &driver).map(|e| e.id), Some(1));
}

#[test]
fn test_lookup_owning_uses_driver_pin_count() {
    let driver = RecordingDriver::new().with_pins(0, 16);
    let registry = registry_of(&[ioapic_entry(0, IOAPIC_BASE, 0), ioapic_entry(1, IOAPIC_BASE, 24)]);

    assert_eq!(registry.lookup_owning(15, &driver).map(|e| e.id), Some(0));
    assert_eq!(registry.lookup_owning(16, &driver), None);
    assert_eq!(registry.lookup_owning(47, &driver).map(|e| e.id), Some(1));
    assert_eq!(registry.lookup_owning(48, &driver), None);
    assert_eq!(registry.nearest_below(20).map(|e| e.id), Some(0));
}

// =============================================================================
// Pass 2: interrupt source overrides
// =============================================================================

#[test]
fn test_single_override_programs_pin() {
    let image = MadtBuilder::new(LAPIC_BASE, 1)
        .ioapic(0, IOAPIC_BASE, 0)
        .interrupt_override(0, 9, 9, INTI_LOW_LEVEL)
        .build();
    let mut driver = RecordingDriver::new();

    let (_, result) = run(&image, &mut driver);
    let report = result.expect("discovery");

    assert_eq!(
        driver.calls,
        vec![
            DriverCall::Vector {
                ioapic: 0,
                pin: 9,
                vector: 9
            },
            DriverCall::Polarity {
                ioapic: 0,
                pin: 9,
                polarity: Polarity::ActiveLow
            },
            DriverCall::Trigger {
                ioapic: 0,
                pin: 9,
                trigger: TriggerMode::Level
            },
        ]
    );
    assert_eq!(report.overrides_applied, 1);
    assert_eq!(report.overrides_skipped, 0);
    assert!(report.pcat_compat);
    assert_eq!(report.lapic_address, PhysAddr::new(LAPIC_BASE as u64));
}

#[test]
fn test_override_before_its_controller_is_routed() {
    // Override listed ahead of the controller that owns GSI 26.
    let image = MadtBuilder::new(LAPIC_BASE, 0)
        .interrupt_override(0, 0, 26, 0b0101)
        .ioapic(0, IOAPIC_BASE, 0)
        .ioapic(4, IOAPIC_BASE + 0x1000, 24)
        .build();
    let mut driver = RecordingDriver::new();

    let (_, result) = run(&image, &mut driver);
    result.expect("discovery");

    assert_eq!(
        driver.calls,
        vec![
            DriverCall::Vector {
                ioapic: 4,
                pin: 2,
                vector: 0
            },
            DriverCall::Polarity {
                ioapic: 4,
                pin: 2,
                polarity: Polarity::ActiveHigh
            },
            DriverCall::Trigger {
                ioapic: 4,
                pin: 2,
                trigger: TriggerMode::Edge
            },
        ]
    );
}

#[test]
fn test_unresolved_override_is_skipped_and_logged() {
    klog_register_backend(capture_backend);

    let image = MadtBuilder::new(LAPIC_BASE, 0)
        .ioapic(0, IOAPIC_BASE, 24)
        .interrupt_override(0, 14, 3, 0)
        .interrupt_override(0, 1, 25, 0)
        .build();
    let mut driver = RecordingDriver::new();

    let (_, result) = run(&image, &mut driver);
    let report = result.expect("unresolved override is not fatal");

    assert_eq!(report.overrides_skipped, 1);
    assert_eq!(report.overrides_applied, 1);
    assert_eq!(driver.calls.len(), 3);
    assert!(
        driver
            .calls
            .iter()
            .all(|call| matches!(call, DriverCall::Vector { pin: 1, .. }
                | DriverCall::Polarity { pin: 1, .. }
                | DriverCall::Trigger { pin: 1, .. }))
    );
    assert!(captured_line_containing("ISA IRQ 14 -> GSI 3"));
}

#[test]
fn test_apply_override_errors() {
    let registry = registry_of(&[ioapic_entry(2, IOAPIC_BASE, 8)]);
    let mut driver = RecordingDriver::new().with_pins(2, 16);

    let beyond = OverrideDirective {
        bus: 0,
        legacy_irq: 5,
        gsi: 30,
        polarity: Polarity::BusDefault,
        trigger: TriggerMode::BusDefault,
    };
    assert_eq!(
        apply_override(&registry, &mut driver, &beyond),
        Err(RoutingError::InvalidVectorSource {
            legacy_irq: 5,
            gsi: 30,
            ioapic_id: 2
        })
    );

    let below = OverrideDirective { gsi: 4, ..beyond };
    assert_eq!(
        apply_override(&registry, &mut driver, &below),
        Err(RoutingError::UnresolvedRoutingTarget {
            legacy_irq: 5,
            gsi: 4
        })
    );
    assert!(driver.calls.is_empty());

    let inside = OverrideDirective { gsi: 23, ..beyond };
    assert_eq!(
        apply_override(&registry, &mut driver, &inside),
        Ok(RoutedPin {
            ioapic_id: 2,
            pin: 15,
            vector: 5,
            polarity: Polarity::BusDefault,
            trigger: TriggerMode::BusDefault,
        })
    );
}

// =============================================================================
// Other record types
// =============================================================================

#[test]
fn test_processors_and_nmis_are_reported() {
    let image = MadtBuilder::new(LAPIC_BASE, 0)
        .local_apic(0, 0, 1)
        .local_apic(1, 1, 1)
        .local_apic(2, 2, 2)
        .local_apic(3, 3, 0)
        .ioapic(0, IOAPIC_BASE, 0)
        .nmi_source(0b0101, 2)
        .local_apic_nmi(0xFF, 0, 1)
        .raw(&[0x7F, 4, 0xAA, 0xBB])
        .build();
    let mut driver = RecordingDriver::new();

    let (_, result) = run(&image, &mut driver);
    let report = result.expect("discovery");

    assert_eq!(report.processors_enabled, 2);
    assert_eq!(report.processors_disabled, 2);
    assert_eq!(report.nmi_sources, 1);
    assert_eq!(report.lapic_nmis, 1);
    assert_eq!(report.records_skipped, 0);
    assert!(driver.calls.is_empty());
}

#[test]
fn test_lapic_address_override_replaces_header_value() {
    let image = MadtBuilder::new(LAPIC_BASE, 0)
        .local_apic(0, 0, 1)
        .local_apic_address_override(0x0000_0001_FEE0_0000)
        .build();
    let mut driver = RecordingDriver::new();

    let (_, result) = run(&image, &mut driver);
    let report = result.expect("discovery");

    assert_eq!(report.lapic_address, PhysAddr::new(0x0000_0001_FEE0_0000));
}

// =============================================================================
// Malformed tables and state machine
// =============================================================================

#[test]
fn test_zero_length_record_fails_discovery() {
    let image = MadtBuilder::new(LAPIC_BASE, 0)
        .ioapic(0, IOAPIC_BASE, 0)
        .raw(&[2, 0])
        .ioapic(1, IOAPIC_BASE + 0x1000, 24)
        .build();
    let mut driver = RecordingDriver::new();
    let mut registry = IoapicRegistry::new();
    let mut discovery = Discovery::new();

    discovery.locate(&image).expect("locate");
    let err = discovery
        .register_controllers(&mut registry, &driver)
        .expect_err("zero length");

    let expected = DiscoveryError::MalformedTable(MalformedRecord {
        offset: 56,
        entry_type: 2,
        length: 0,
        kind: MalformedKind::LengthTooSmall,
    });
    assert_eq!(err, expected);
    assert_eq!(discovery.state(), DiscoveryState::Failed(expected));
    assert_eq!(registry.len(), 1);
    assert!(registry.lookup_by_identifier(0).is_some());

    assert_eq!(
        discovery.apply_overrides(&registry, &mut driver),
        Err(expected)
    );
    assert!(driver.calls.is_empty());
}

#[test]
fn test_truncated_records_are_skipped() {
    let image = MadtBuilder::new(LAPIC_BASE, 0)
        .raw(&[1, 8, 3, 0, 0x00, 0x10, 0xC0, 0xFE])
        .ioapic(0, IOAPIC_BASE, 0)
        .raw(&[2, 8, 0, 9, 9, 0, 0, 0])
        .interrupt_override(0, 0, 2, 0)
        .build();
    let mut driver = RecordingDriver::new();

    let (registry, result) = run(&image, &mut driver);
    let report = result.expect("truncated records are not fatal");

    assert_eq!(registry.len(), 1);
    assert_eq!(report.records_skipped, 2);
    assert_eq!(report.overrides_applied, 1);
    assert_eq!(driver.calls.len(), 3);
}

#[test]
fn test_table_not_found() {
    let mut discovery = Discovery::new();
    assert_eq!(discovery.locate(&NoTables), Err(DiscoveryError::TableNotFound));
    assert_eq!(
        discovery.state(),
        DiscoveryState::Failed(DiscoveryError::TableNotFound)
    );

    let mut registry = IoapicRegistry::new();
    let mut driver = RecordingDriver::new();
    assert_eq!(
        discover(&NoTables, &mut registry, &mut driver),
        Err(DiscoveryError::TableNotFound)
    );
    assert!(registry.is_empty());
}

#[test]
fn test_steps_out_of_order_are_rejected() {
    let image = MadtBuilder::new(LAPIC_BASE, 0).ioapic(0, IOAPIC_BASE, 0).build();
    let mut registry = IoapicRegistry::new();
    let mut driver = RecordingDriver::new();
    let mut discovery = Discovery::new();

    assert_eq!(
        discovery.register_controllers(&mut registry, &driver),
        Err(DiscoveryError::InvalidTransition)
    );
    assert_eq!(discovery.state(), DiscoveryState::Unstarted);

    discovery.locate(&image).expect("locate");
    assert_eq!(
        discovery.apply_overrides(&registry, &mut driver),
        Err(DiscoveryError::InvalidTransition)
    );
    assert_eq!(discovery.locate(&image), Err(DiscoveryError::InvalidTransition));
    assert_eq!(discovery.state(), DiscoveryState::TableLocated);

    discovery
        .register_controllers(&mut registry, &driver)
        .expect("pass 1");
    discovery
        .apply_overrides(&registry, &mut driver)
        .expect("pass 2");
    assert_eq!(discovery.state(), DiscoveryState::OverridesApplied);
}

#[test]
fn test_discovery_is_idempotent() {
    let image = MadtBuilder::new(LAPIC_BASE, 1)
        .local_apic(0, 0, 1)
        .local_apic(1, 1, 1)
        .ioapic(0, IOAPIC_BASE, 0)
        .interrupt_override(0, 0, 2, 0)
        .interrupt_override(0, 9, 9, INTI_LOW_LEVEL)
        .ioapic(1, IOAPIC_BASE + 0x1000, 24)
        .interrupt_override(0, 11, 40, 0b1101)
        .build();

    let mut first_driver = RecordingDriver::new();
    let (first_registry, first) = run(&image, &mut first_driver);
    let mut second_driver = RecordingDriver::new();
    let (second_registry, second) = run(&image, &mut second_driver);

    assert_eq!(first_registry, second_registry);
    assert_eq!(first_driver.calls, second_driver.calls);
    assert_eq!(first, second);
    assert_eq!(first_driver.calls.len(), 9);
}

// =============================================================================
// Publication
// =============================================================================

// The published registry is process-wide; this is the only test touching it.
#[test]
fn test_init_publishes_registry_once() {
    let image = MadtBuilder::new(LAPIC_BASE, 0)
        .ioapic(0, IOAPIC_BASE, 0)
        .interrupt_override(0, 0, 2, 0)
        .build();
    let mut driver = RecordingDriver::new();

    let registry = init(&image, &mut driver).expect("init");
    assert_eq!(registry.len(), 1);
    assert_eq!(driver.calls.len(), 3);
    assert!(published().is_some_and(|p| core::ptr::eq(p, registry)));

    let mut again = RecordingDriver::new();
    let second = init(&image, &mut again).expect("second init");
    assert!(core::ptr::eq(second, registry));
    assert!(again.calls.is_empty());

    assert_eq!(
        publish(IoapicRegistry::new().freeze()),
        Err(RegistryError::AlreadyPublished)
    );
}
