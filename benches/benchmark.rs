use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tokio::runtime::Runtime;

use uel_core::config::EventLayerConfig;
use uel_core::event::subscription::TypePattern;
use uel_core::{EventEnvelope, EventManager, EventOperation};

fn envelope(event_type: &str) -> EventEnvelope {
    EventEnvelope::builder()
        .source("bench")
        .event_type(event_type)
        .operation(EventOperation::Update)
        .target_id("target-1")
        .build()
        .unwrap()
}

fn bench_pattern_matching(c: &mut Criterion) {
    let patterns: Vec<TypePattern> = [
        "coordination:task",
        "coordination:*",
        "monitoring:*",
        "workflow:step:*",
    ]
    .iter()
    .map(|p| TypePattern::new(p))
    .collect();

    c.bench_function("wildcard match", |b| {
        b.iter(|| {
            patterns
                .iter()
                .filter(|p| p.matches(black_box("coordination:task")))
                .count()
        })
    });
}

fn bench_envelope_build(c: &mut Criterion) {
    c.bench_function("envelope build", |b| {
        b.iter(|| envelope(black_box("coordination:task")))
    });
}

fn bench_immediate_emit(c: &mut Criterion) {
    let runtime = Runtime::new().unwrap();
    let manager = EventManager::new("bench", EventLayerConfig::default()).unwrap();
    runtime.block_on(manager.start());
    manager.subscribe_fn(&["coordination:*"], |_| async { Ok(()) });

    c.bench_function("immediate emit", |b| {
        b.iter(|| {
            runtime
                .block_on(manager.emit(envelope("coordination:task")))
                .unwrap()
        })
    });

    runtime.block_on(manager.stop());
}

criterion_group!(
    benches,
    bench_pattern_matching,
    bench_envelope_build,
    bench_immediate_emit
);
criterion_main!(benches);
