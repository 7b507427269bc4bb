use criterion::{black_box, criterion_group, criterion_main, Criterion};
use linesync::cursor::{self, Selection};
use linesync::debounce::SaveDebouncer;
use linesync::engine::{EngineState, ReconciliationEngine, DEFAULT_GRACE_PERIOD};
use linesync::presence::{PresenceAggregator, PALETTE_SIZE};
use linesync::protocol::{DocumentId, ParticipantId, PresenceRecord, RawSnapshot};
use linesync::surface::MemorySurface;
use serde_json::json;
use std::time::Duration;

fn raw_snapshot(content: serde_json::Value) -> RawSnapshot {
    RawSnapshot {
        document_id: DocumentId::new(),
        content,
        line_authors: Some((1..=1000).map(|l| (l, ParticipantId::new(format!("user-{}", l % 7)))).collect()),
        line_locks: None,
        presence: None,
    }
}

fn document(lines: usize) -> Vec<String> {
    (0..lines).map(|i| format!("line {i} of a shared document")).collect()
}

fn bench_normalize_line_array(c: &mut Criterion) {
    let raw = raw_snapshot(json!(document(1000)));

    c.bench_function("normalize_line_array_1000", |b| {
        b.iter(|| black_box(raw.clone().normalize().unwrap()))
    });
}

fn bench_normalize_joined_string(c: &mut Criterion) {
    let raw = raw_snapshot(json!({ "content": document(1000).join("\n") }));

    c.bench_function("normalize_nested_joined_1000", |b| {
        b.iter(|| black_box(raw.clone().normalize().unwrap()))
    });
}

fn bench_decode_wire_snapshot(c: &mut Criterion) {
    let encoded = raw_snapshot(json!(document(1000))).encode().unwrap();

    c.bench_function("decode_snapshot_1000_lines", |b| {
        b.iter(|| black_box(RawSnapshot::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_clamp_selection(c: &mut Criterion) {
    c.bench_function("clamp_selection", |b| {
        b.iter(|| {
            for len in 0..256 {
                black_box(cursor::clamp(black_box(Selection::new(300, 20)), len));
            }
        })
    });
}

fn bench_aggregate_roster(c: &mut Criterion) {
    let records: Vec<PresenceRecord> = (0..100)
        .map(|i| PresenceRecord::new(format!("participant-{i}")).with_cursor(i + 1, 0))
        .collect();
    let aggregator = PresenceAggregator::new(PALETTE_SIZE);
    let me = ParticipantId::from("participant-42");

    c.bench_function("aggregate_roster_100", |b| {
        b.iter(|| black_box(aggregator.aggregate(black_box(&records), &me)))
    });
}

fn bench_reconcile_snapshot(c: &mut Criterion) {
    let snapshots: Vec<_> = (0..2)
        .map(|v| {
            let mut lines = document(1000);
            lines[0] = format!("version {v}");
            raw_snapshot(json!(lines)).normalize().unwrap()
        })
        .collect();

    let state = EngineState::new(
        DocumentId::new(),
        ParticipantId::from("me"),
        DEFAULT_GRACE_PERIOD,
        SaveDebouncer::new(Duration::from_millis(500)),
        PresenceAggregator::default(),
    );
    let mut engine = ReconciliationEngine::new(state, MemorySurface::new());
    let now = tokio::time::Instant::now();
    let mut seq = 0u64;

    c.bench_function("reconcile_snapshot_1000_lines", |b| {
        b.iter(|| {
            seq += 1;
            let snapshot = &snapshots[(seq % 2) as usize];
            black_box(engine.on_snapshot_received(seq, snapshot, now))
        })
    });
}

criterion_group!(
    benches,
    bench_normalize_line_array,
    bench_normalize_joined_string,
    bench_decode_wire_snapshot,
    bench_clamp_selection,
    bench_aggregate_roster,
    bench_reconcile_snapshot,
);
criterion_main!(benches);
