mod common;

use std::sync::Arc;

use aero_sysbus::{
    AddressRange, ArrayMemory, BusError, Capabilities, PeripheralRef, RegistrationPoint,
    SystemBus, WidthMask,
};
use common::{capture_logs, warnings, Registers};

fn at(start: u64, size: u64) -> RegistrationPoint {
    RegistrationPoint::range(AddressRange::with_size(start, size))
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| 0x80 | i as u8).collect()
}

#[test]
fn read_across_a_hole_returns_zeros_and_one_warning() {
    let bus = SystemBus::new();
    bus.register(Arc::new(ArrayMemory::from_bytes(&pattern(0x10))), at(0x10, 0x10))
        .unwrap();

    let (data, logs) = capture_logs(|| bus.read_bytes(0x10, 0x20, false).unwrap());
    assert_eq!(&data[..0x10], pattern(0x10).as_slice());
    assert_eq!(&data[0x10..], [0u8; 0x10].as_slice());

    let holes = warnings(&logs);
    assert_eq!(holes.len(), 1, "{logs}");
    assert!(holes[0].contains("[0x20..0x30)"), "{logs}");
}

#[test]
fn each_hole_is_reported_once() {
    let bus = SystemBus::new();
    bus.register(Arc::new(ArrayMemory::new(0x10)), at(0x100, 0x10))
        .unwrap();
    bus.register(Arc::new(ArrayMemory::new(0x10)), at(0x200, 0x10))
        .unwrap();

    let (_, logs) = capture_logs(|| bus.read_bytes(0x0, 0x300, false).unwrap());
    let holes = warnings(&logs);
    assert_eq!(holes.len(), 3, "{logs}");
    assert!(holes[0].contains("[0x0..0x100)"));
    assert!(holes[1].contains("[0x110..0x200)"));
    assert!(holes[2].contains("[0x210..0x300)"));
}

#[test]
fn write_spans_several_memories() {
    let bus = SystemBus::new();
    let low: PeripheralRef = Arc::new(ArrayMemory::new(0x10));
    let high: PeripheralRef = Arc::new(ArrayMemory::new(0x10));
    bus.register(low, at(0x1000, 0x10)).unwrap();
    bus.register(high, at(0x1010, 0x10)).unwrap();

    let data = pattern(0x18);
    bus.write_bytes(&data, 0x1004, true).unwrap();
    assert_eq!(bus.read_bytes(0x1004, 0x18, true).unwrap(), data);
    assert_eq!(bus.read_byte(0x1003).unwrap(), 0);
    assert_eq!(bus.read_byte(0x101C).unwrap(), 0);
}

#[test]
fn devices_are_transferred_byte_by_byte() {
    let bus = SystemBus::new();
    let regs = Registers::new(8, Capabilities::native(WidthMask::BYTE));
    bus.register(regs.as_peripheral(), at(0x300, 8)).unwrap();

    assert_eq!(
        bus.read_bytes(0x302, 3, false).unwrap(),
        [2, 3, 4]
    );
    bus.write_bytes(&[0xAA, 0xBB], 0x306, false).unwrap();
    assert_eq!(regs.bytes()[6..], [0xAA, 0xBB]);
    assert_eq!(regs.calls().len(), 5);
}

#[test]
fn memory_only_rejects_devices_before_transferring() {
    let bus = SystemBus::new();
    bus.register(Arc::new(ArrayMemory::new(0x10)), at(0, 0x10))
        .unwrap();
    let regs = Registers::new(8, Capabilities::native(WidthMask::BYTE));
    bus.register(regs.as_peripheral(), at(0x10, 8)).unwrap();

    let err = bus.write_bytes(&[1; 0x18], 0, true).unwrap_err();
    assert!(matches!(err, BusError::NotMemory { address: 0x10, .. }));
    assert_eq!(bus.read_bytes(0, 0x10, true).unwrap(), [0u8; 0x10]);
    assert!(regs.calls().is_empty());
}

#[test]
fn redirected_ranges_pass_the_memory_only_guard() {
    let bus = SystemBus::new();
    bus.register(Arc::new(ArrayMemory::from_bytes(&pattern(0x20))), at(0x8000, 0x20))
        .unwrap();
    bus.redirect(0x100, 0x8010, 0x10).unwrap();

    assert_eq!(
        bus.read_bytes(0x100, 0x10, true).unwrap(),
        pattern(0x20)[0x10..]
    );
    bus.write_bytes(&[0x11, 0x22], 0x104, true).unwrap();
    assert_eq!(bus.read_word(0x8014).unwrap(), 0x2211);
}

#[test]
fn redirector_translates_every_width() {
    let bus = SystemBus::new();
    bus.register(Arc::new(ArrayMemory::new(0x10)), at(0x8000, 0x10))
        .unwrap();
    bus.redirect(0x100, 0x8000, 0x10).unwrap();

    bus.write_byte(0x101, 0x11).unwrap();
    bus.write_word(0x102, 0x2222).unwrap();
    bus.write_double_word(0x104, 0x4444_4444).unwrap();
    assert_eq!(bus.read_byte(0x8001).unwrap(), 0x11);
    assert_eq!(bus.read_word(0x8002).unwrap(), 0x2222);
    assert_eq!(bus.read_double_word(0x8004).unwrap(), 0x4444_4444);
    assert_eq!(bus.read_double_word(0x100).unwrap(), 0x2222_1100);
}

#[test]
fn zero_range_clears_memory() {
    let bus = SystemBus::new();
    bus.register(Arc::new(ArrayMemory::from_bytes(&[0xFF; 0x40])), at(0, 0x40))
        .unwrap();
    bus.zero_range(AddressRange::new(0x8, 0x38), true).unwrap();
    let data = bus.read_bytes(0, 0x40, true).unwrap();
    assert!(data[..8].iter().all(|&b| b == 0xFF));
    assert!(data[8..0x38].iter().all(|&b| b == 0));
    assert!(data[0x38..].iter().all(|&b| b == 0xFF));
}

#[test]
fn request_past_the_end_of_the_address_space_fails() {
    let bus = SystemBus::new();
    assert!(matches!(
        bus.read_bytes(u64::MAX - 1, 4, false),
        Err(BusError::AddressOverflow { .. })
    ));
}

#[test]
fn redirect_rejects_targets_it_cannot_reach() {
    let bus = SystemBus::new();
    assert!(matches!(
        bus.redirect(0x100, u64::MAX - 4, 0x10),
        Err(BusError::RedirectMiss { target, .. }) if target == u64::MAX - 4
    ));
    assert!(matches!(
        bus.redirect(0x100, 0x108, 0x10),
        Err(BusError::RedirectMiss { .. })
    ));
    assert!(bus.what_is_at(0x100).is_none());

    bus.redirect(0x100, 0x110, 0x10).unwrap();
}
