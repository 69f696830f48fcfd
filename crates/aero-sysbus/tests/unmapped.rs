mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use aero_sysbus::{
    AddressRange, BusConfig, BusError, CpuRegistrationPoint, FallbackDevice,
    UnhandledAccessBehaviour, SystemBus, Width,
};
use common::{capture_logs, warnings, RecordingCpu};

#[test]
fn unmapped_read_reports_and_counts() {
    let bus = SystemBus::new();
    let (value, logs) = capture_logs(|| bus.read_double_word(0x9999).unwrap());
    assert_eq!(value, 0);
    assert_eq!(bus.unexpected_reads(), 1);
    let warnings = warnings(&logs);
    assert_eq!(warnings.len(), 1, "{logs}");
    assert!(warnings[0].contains("0x9999"), "{logs}");
}

#[test]
fn do_not_report_still_counts() {
    let bus = SystemBus::with_config(
        BusConfig::default().with_unhandled_access(UnhandledAccessBehaviour::DoNotReport),
    );
    let (value, logs) = capture_logs(|| bus.read_double_word(0x9999).unwrap());
    assert_eq!(value, 0);
    assert_eq!(bus.unexpected_reads(), 1);
    assert!(warnings(&logs).is_empty(), "{logs}");

    let (_, logs) = capture_logs(|| bus.write_byte(0x9999, 1).unwrap());
    assert_eq!(bus.unexpected_writes(), 1);
    assert!(warnings(&logs).is_empty(), "{logs}");
}

#[test]
fn configured_default_value() {
    let bus = SystemBus::with_config(BusConfig {
        unmapped_read_value: 0xFFFF_FFFF,
        ..BusConfig::default()
    });
    assert_eq!(bus.read_word(0x10).unwrap(), 0xFFFF);
}

#[test]
fn policy_selects_reports_by_tag() {
    let bus = SystemBus::new();
    bus.tag(AddressRange::with_size(0x100, 0x10), "uart", 0x55, false)
        .unwrap();

    bus.set_unhandled_access(UnhandledAccessBehaviour::ReportIfTagged);
    let (value, logs) = capture_logs(|| {
        let tagged = bus.read_byte(0x104).unwrap();
        bus.read_byte(0x200).unwrap();
        tagged
    });
    assert_eq!(value, 0x55);
    let reported = warnings(&logs);
    assert_eq!(reported.len(), 1, "{logs}");
    assert!(reported[0].contains("uart"), "{logs}");

    bus.set_unhandled_access(UnhandledAccessBehaviour::ReportIfNotTagged);
    let (_, logs) = capture_logs(|| {
        bus.read_byte(0x104).unwrap();
        bus.read_byte(0x200).unwrap();
    });
    let reported = warnings(&logs);
    assert_eq!(reported.len(), 1, "{logs}");
    assert!(reported[0].contains("0x200"), "{logs}");
    assert_eq!(bus.unexpected_reads(), 4);
}

#[test]
fn nested_tags_are_named_hierarchically() {
    let bus = SystemBus::new();
    bus.tag(AddressRange::new(0x1000, 0x2000), "periph", 1, false)
        .unwrap();
    bus.tag(AddressRange::new(0x1400, 0x1500), "ctrl", 2, false)
        .unwrap();

    let names: Vec<_> = bus.tags().into_iter().map(|(_, t)| t.name).collect();
    assert_eq!(names, ["periph", "periph/ctrl", "periph"]);
    assert_eq!(bus.read_byte(0x1450).unwrap(), 2);
    assert_eq!(bus.read_byte(0x1fff).unwrap(), 1);

    assert!(matches!(
        bus.tag(AddressRange::new(0x1f00, 0x2100), "bad", 0, false),
        Err(BusError::TagConflict { .. })
    ));
    assert_eq!(bus.remove_tag(0x1450).unwrap().name, "periph/ctrl");
    assert_eq!(bus.read_byte(0x1450).unwrap(), 0);
    assert!(matches!(bus.remove_tag(0x1450), Err(BusError::NoTag { .. })));
}

#[test]
fn pausing_tag_invokes_the_pause_handler() {
    let bus = SystemBus::new();
    let pauses = Arc::new(AtomicUsize::new(0));
    let counter = pauses.clone();
    bus.set_pause_handler(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    bus.tag(AddressRange::with_size(0x500, 4), "halt", 0, true)
        .unwrap();

    bus.read_byte(0x500).unwrap();
    bus.write_byte(0x501, 0).unwrap();
    bus.read_byte(0x504).unwrap();
    assert_eq!(pauses.load(Ordering::SeqCst), 2);

    bus.clear_pause_handler();
    bus.read_byte(0x500).unwrap();
    assert_eq!(pauses.load(Ordering::SeqCst), 2);
}

#[derive(Default)]
struct RegisterModel {
    writes: Mutex<Vec<(u64, u32, Width)>>,
}

impl FallbackDevice for RegisterModel {
    fn try_read(&self, address: u64, _width: Width) -> Option<u32> {
        (address == 0x4000).then_some(0x1234_5678)
    }

    fn try_write(&self, address: u64, value: u32, width: Width) -> bool {
        if address != 0x4000 {
            return false;
        }
        self.writes.lock().unwrap().push((address, value, width));
        true
    }
}

#[test]
fn fallback_devices_answer_untagged_addresses_silently() {
    let bus = SystemBus::new();
    let model = Arc::new(RegisterModel::default());
    bus.add_fallback(model.clone());

    let (value, logs) = capture_logs(|| {
        bus.write_word(0x4000, 0xBEEF).unwrap();
        bus.read_word(0x4000).unwrap()
    });
    assert_eq!(value, 0x5678);
    assert!(warnings(&logs).is_empty(), "{logs}");
    assert_eq!(*model.writes.lock().unwrap(), [(0x4000, 0xBEEF, Width::Word)]);
    assert_eq!(bus.unexpected_reads(), 1);
    assert_eq!(bus.unexpected_writes(), 1);

    // A tag takes precedence over fallbacks.
    bus.tag(AddressRange::with_size(0x4000, 4), "reg", 7, false)
        .unwrap();
    assert_eq!(bus.read_word(0x4000).unwrap(), 7);
}

#[test]
fn reports_name_the_accessing_cpu() {
    let bus = SystemBus::new();
    bus.register_cpu(RecordingCpu::with_pc(0x8000_1000), CpuRegistrationPoint::slot(2))
        .unwrap();
    let mut handle = bus.cpu_handle(2).unwrap();
    let (_, logs) = capture_logs(|| handle.write_double_word(0x6000, 1).unwrap());
    assert!(logs.contains("[CPU2: 0x80001000]"), "{logs}");
}
