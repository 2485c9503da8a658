use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use std::sync::Arc;
use trellis_core::bus::{EventBus, EventHandler, PublishOptions, SubscribeOptions, topic_matches};
use trellis_core::flags::{FeatureFlag, FeatureFlagEvaluator, FlagContext};
use trellis_core::host::SystemClock;
use trellis_core::permissions::PermissionValidator;

fn noop_handler() -> EventHandler {
    Arc::new(|_event| Box::pin(async { Ok(()) }))
}

fn bench_topic_matching(c: &mut Criterion) {
    c.bench_function("topic_matches_deep", |b| {
        b.iter(|| {
            topic_matches(
                black_box("plugins.lifecycle.*.completed"),
                black_box("plugins.lifecycle.activation.completed"),
            )
        })
    });
}

fn bench_publish(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("runtime");
    let bus = EventBus::new();
    for i in 0..100 {
        bus.subscribe(
            "orders.created",
            noop_handler(),
            SubscribeOptions::default().with_priority(i % 3),
        )
        .expect("subscribe");
    }
    c.bench_function("publish_100_subscribers", |b| {
        b.iter(|| {
            runtime
                .block_on(bus.publish(
                    black_box("orders.created"),
                    serde_json::json!({"id": 1}),
                    PublishOptions::default(),
                ))
                .expect("publish")
        })
    });
}

fn bench_permission_validate(c: &mut Criterion) {
    let validator = PermissionValidator::new(Arc::new(SystemClock));
    let permissions: Vec<String> = vec![
        "event:publish".to_string(),
        "file:read".to_string(),
        "database:read".to_string(),
        "template:render".to_string(),
    ];
    c.bench_function("validate_permission_set", |b| {
        b.iter(|| validator.validate(black_box(&permissions)))
    });
}

fn bench_flag_evaluation(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("runtime");
    let clock = Arc::new(SystemClock);
    let bus = Arc::new(EventBus::with_clock(clock.clone()));
    let flags = FeatureFlagEvaluator::new(bus, clock);
    runtime
        .block_on(flags.create_flag(FeatureFlag::new("bench.flag", true), "bench"))
        .expect("create flag");

    let mut context = FlagContext::new();
    context.insert("userId".to_string(), serde_json::json!("u-42"));

    c.bench_function("evaluate_flag", |b| {
        b.iter(|| flags.evaluate(black_box("bench.flag"), black_box(&context)))
    });
    c.bench_function("is_enabled_cached", |b| {
        b.iter(|| flags.is_enabled(black_box("bench.flag"), black_box(&context)))
    });
}

criterion_group!(
    benches,
    bench_topic_matching,
    bench_publish,
    bench_permission_validate,
    bench_flag_evaluation
);
criterion_main!(benches);
