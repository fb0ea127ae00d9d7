#![forbid(unsafe_code)]
//! Reducer-path microbenchmarks: batch sorting and ring handoff.

use criterion::{Criterion, criterion_group, criterion_main};
use kiln_snapshot::ring::BatchRing;
use kiln_types::{Epoch, LogRecord, Ordinal, RecordKey, RecordKind, StorageId};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread;
use std::time::Duration;

fn lcg_next(state: &mut u64) -> u64 {
    *state = state
        .wrapping_mul(6_364_136_223_846_793_005)
        .wrapping_add(1);
    *state
}

fn make_records(count: usize) -> Vec<LogRecord> {
    let mut rng = 0xbeef_u64;
    (0..count)
        .map(|i| LogRecord {
            storage_id: StorageId((lcg_next(&mut rng) % 8 + 1) as u32),
            key: RecordKey(lcg_next(&mut rng) % 100_000),
            ordinal: Ordinal(i as u64),
            epoch: Epoch(1),
            kind: RecordKind::Overwrite,
            payload: vec![0xab; 16],
        })
        .collect()
}

fn bench_batch_sort(c: &mut Criterion) {
    let records = make_records(64 * 1024);
    c.bench_function("reducer_sort_64k_records", |b| {
        b.iter(|| {
            let mut run = records.clone();
            run.sort_by_key(LogRecord::sort_key);
            run
        });
    });
}

fn bench_ring_handoff(c: &mut Criterion) {
    c.bench_function("ring_handoff_1k_batches", |b| {
        b.iter(|| {
            let ring = Arc::new(BatchRing::new(16));
            let cancelled = Arc::new(AtomicBool::new(false));
            let producer = {
                let ring = Arc::clone(&ring);
                let cancelled = Arc::clone(&cancelled);
                thread::spawn(move || {
                    let batch = make_records(64);
                    for _ in 0..1024 {
                        ring.push(batch.clone(), &cancelled).unwrap();
                    }
                })
            };
            let mut received = 0_usize;
            while received < 1024 {
                if let Some(batch) = ring.pop(Duration::from_millis(10)) {
                    received += batch.len() / 64;
                }
            }
            producer.join().unwrap();
        });
    });
}

criterion_group!(benches, bench_batch_sort, bench_ring_handoff);
criterion_main!(benches);
