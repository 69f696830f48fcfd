use std::sync::Arc;
use std::time::Duration;

use aero_sysbus::{
    AddressRange, AllowedTranslation, ArrayMemory, BusPeripheral, Capabilities, RegistrationPoint,
    SystemBus, WidthMask, PAGE_SIZE,
};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn criterion_config() -> Criterion {
    match std::env::var("AERO_BENCH_PROFILE").as_deref() {
        Ok("ci") => Criterion::default()
            // Keep CI runtime low.
            .warm_up_time(Duration::from_millis(150))
            .measurement_time(Duration::from_millis(400))
            .sample_size(20)
            .noise_threshold(0.05),
        _ => Criterion::default()
            .warm_up_time(Duration::from_secs(1))
            .measurement_time(Duration::from_secs(2))
            .sample_size(50)
            .noise_threshold(0.03),
    }
}

/// Control register block answering only word accesses.
struct WordRegs;

impl BusPeripheral for WordRegs {
    fn capabilities(&self) -> Capabilities {
        Capabilities::native(WidthMask::WORD).with_translations(AllowedTranslation::BYTE_TO_WORD)
    }

    fn read_word(&self, offset: u64) -> u16 {
        offset as u16
    }
}

/// A machine-like layout: a large RAM, many small page-aligned devices, and a few misaligned ones.
fn populated_bus() -> Arc<SystemBus> {
    let bus = SystemBus::new();
    bus.register(
        Arc::new(ArrayMemory::new(1 << 20)),
        RegistrationPoint::range(AddressRange::with_size(0x8000_0000, 1 << 20)),
    )
    .unwrap();
    for i in 0..64u64 {
        let start = 0x4000_0000 + i * PAGE_SIZE;
        bus.register(
            Arc::new(WordRegs),
            RegistrationPoint::range(AddressRange::with_size(start, 0x100)),
        )
        .unwrap();
    }
    for i in 0..16u64 {
        let start = 0x5000_0010 + i * 0x1000;
        bus.register(
            Arc::new(WordRegs),
            RegistrationPoint::range(AddressRange::with_size(start, 0x40)),
        )
        .unwrap();
    }
    bus
}

fn bench_lookup(c: &mut Criterion) {
    let bus = populated_bus();
    let mut group = c.benchmark_group("sysbus_dispatch");

    let mut handle = bus.handle();
    group.bench_function("ram_cached", |b| {
        let mut address = 0x8000_0000u64;
        b.iter(|| {
            address = 0x8000_0000 + (address + 4) % (1 << 20);
            black_box(handle.read_double_word(black_box(address)).unwrap())
        })
    });

    let mut handle = bus.handle();
    group.bench_function("devices_dictionary", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i = (i + 1) % 64;
            let address = 0x4000_0000 + i * PAGE_SIZE + 2;
            black_box(handle.read_word(black_box(address)).unwrap())
        })
    });

    let mut handle = bus.handle();
    group.bench_function("devices_bisect", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i = (i + 1) % 16;
            let address = 0x5000_0010 + i * 0x1000;
            black_box(handle.read_word(black_box(address)).unwrap())
        })
    });

    let mut handle = bus.handle();
    group.bench_function("byte_via_word", |b| {
        b.iter(|| black_box(handle.read_byte(black_box(0x4000_0003)).unwrap()))
    });

    group.finish();
}

criterion_group! {
    name = benches;
    config = criterion_config();
    targets = bench_lookup
}
criterion_main!(benches);
