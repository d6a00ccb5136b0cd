use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;

use simbridge_audit::canonical::to_canonical_bytes;
use simbridge_audit::store::MemoryAuditStore;
use simbridge_audit::{AuditSink, VerifyRange};

fn bench_canonical(c: &mut Criterion) {
    let payload = json!({
        "job_id": "0190c1d2-0000-7000-8000-000000000000",
        "kind": "sim.cardio",
        "params": { "steps": 1000, "dt": 0.01, "model": "cardio-v2", "tags": ["a", "b", "c"] },
    });
    c.bench_function("canonical_json_payload", |b| {
        b.iter(|| to_canonical_bytes(black_box(&payload)))
    });
}

fn bench_record_and_verify(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("tokio runtime");

    c.bench_function("record_event_memory", |b| {
        let sink = rt
            .block_on(AuditSink::open(Arc::new(MemoryAuditStore::new())))
            .expect("open sink");
        b.iter(|| {
            rt.block_on(sink.record_event("job.sim.running", json!({ "attempt": 1 })))
                .expect("record")
        })
    });

    c.bench_function("verify_1k_events", |b| {
        let sink = rt
            .block_on(AuditSink::open(Arc::new(MemoryAuditStore::new())))
            .expect("open sink");
        rt.block_on(async {
            for i in 0..1_000 {
                sink.record_event("job.sim.running", json!({ "i": i }))
                    .await
                    .expect("record");
            }
        });
        b.iter(|| rt.block_on(sink.verify(VerifyRange::all())).expect("verify"))
    });
}

criterion_group!(benches, bench_canonical, bench_record_and_verify);
criterion_main!(benches);
