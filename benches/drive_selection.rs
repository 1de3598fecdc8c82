//! Benchmark for CreateVolume drive selection
//!
//! Target: selecting among 10K drives well under a millisecond

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use directpv::crd::{DirectPVDrive, DriveStatus, LabelKey};
use directpv::csi::selector::{filter_drives, select_drive, SelectionRequest};
use std::collections::{BTreeMap, HashMap, HashSet};

fn drives(count: usize) -> Vec<DirectPVDrive> {
    (0..count)
        .map(|i| {
            let node = format!("node-{:03}", i % 100);
            let zone = if i % 2 == 0 { "a" } else { "b" };
            let free = ((i % 16) as i64 + 1) << 30;
            DirectPVDrive::build(
                &format!("drive-{i:05}"),
                &node,
                "sdb",
                DriveStatus {
                    total_capacity: free,
                    free_capacity: free,
                    topology: BTreeMap::from([
                        (LabelKey::Node.as_str().to_string(), node.clone()),
                        (LabelKey::TopologyZone.as_str().to_string(), zone.to_string()),
                    ]),
                    ..Default::default()
                },
            )
        })
        .collect()
}

fn request() -> SelectionRequest {
    SelectionRequest {
        name: "pvc-0".into(),
        required_bytes: 4 << 30,
        requisite: vec![HashMap::from([(
            LabelKey::TopologyZone.as_str().to_string(),
            "b".to_string(),
        )])],
        ..Default::default()
    }
}

fn bench_select_drive(c: &mut Criterion) {
    let mut group = c.benchmark_group("drive_selection");
    let request = request();
    let claimed = HashSet::new();

    for count in [100, 1_000, 10_000] {
        let pool = drives(count);
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("select_drive", count), &pool, |b, pool| {
            b.iter(|| select_drive(black_box(pool.clone()), &request, &claimed));
        });
    }

    group.finish();
}

fn bench_filter_drives(c: &mut Criterion) {
    let mut group = c.benchmark_group("drive_selection");
    let request = request();
    let claimed: HashSet<String> = (0..1_000).map(|i| format!("drive-{i:05}")).collect();
    let pool = drives(10_000);
    group.throughput(Throughput::Elements(pool.len() as u64));

    group.bench_function("filter_10k_with_claims", |b| {
        b.iter(|| filter_drives(black_box(pool.clone()), &request, &claimed));
    });

    group.finish();
}

criterion_group!(benches, bench_select_drive, bench_filter_drives);
criterion_main!(benches);
