//! Benchmarks for boot command parsing.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use imagesmith::boot::BootSequence;

const KICKSTART_BOOT: &[&str] = &[
    "<up><wait><tab><wait>",
    " text inst.ks=http://{{ .HTTPIP }}:{{ .HTTPPort }}/ks.cfg",
    " inst.stage2=hd:LABEL=RHEL-9-4-0-BaseOS-x86_64 quiet<enter><wait10s>",
];

fn boot_sequence_benchmark(c: &mut Criterion) {
    c.bench_function("parse", |b| {
        b.iter(|| BootSequence::parse(black_box(KICKSTART_BOOT)));
    });

    if let Ok(sequence) = BootSequence::parse(KICKSTART_BOOT) {
        c.bench_function("resolve", |b| {
            b.iter(|| sequence.resolve(black_box("192.168.122.1"), black_box(8123)));
        });
    }
}

criterion_group!(benches, boot_sequence_benchmark);
criterion_main!(benches);
