use callstream::{
    CallId, EchoGenerator, Event, EventHub, Orchestrator, OrchestratorConfig, SubmitRequest,
};
use core::{hint::black_box, time::Duration};
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use futures::{StreamExt, future::join_all};
use serde_json::json;
use std::{sync::Arc, time::Instant};
use tokio::runtime::Builder;

// Events published per benchmark iteration.
const TOTAL_EVENTS: usize = 4096;
const IDLE: Duration = Duration::from_secs(5);

/// Publishes a call's worth of partials while `readers` subscribers drain it,
/// through a backlog smaller than the call so publishing is paced by readers.
fn bench_fan_out(c: &mut Criterion, readers: usize) {
    let mut group = c.benchmark_group(format!("hub/fan_out/{readers}"));
    group.throughput(Throughput::Elements((TOTAL_EVENTS * readers) as u64));

    group.bench_function(format!("elems/{TOTAL_EVENTS}"), |b| {
        let rt = Builder::new_multi_thread().enable_all().build().unwrap();

        b.to_async(&rt).iter_custom(|iters| async move {
            let start = Instant::now();

            for _ in 0..iters {
                let hub = EventHub::new(256);
                let id = CallId::new();
                hub.open(id);

                let tasks: Vec<_> = (0..readers)
                    .map(|_| {
                        let stream = hub.subscribe(&id).unwrap().into_stream(IDLE);
                        tokio::spawn(async move { stream.count().await })
                    })
                    .collect();

                for n in 0..TOTAL_EVENTS {
                    hub.publish(&id, Event::Partial { text: n.to_string() }).await;
                }
                hub.publish(&id, Event::Final { text: String::new() }).await;

                for count in join_all(tasks).await {
                    black_box(count.unwrap());
                }
            }

            start.elapsed()
        });
    });

    group.finish();
}

fn benchmark_fan_out_single(c: &mut Criterion) {
    bench_fan_out(c, 1);
}

fn benchmark_fan_out_many(c: &mut Criterion) {
    bench_fan_out(c, 8);
}

/// Submits echo calls and drains each one end to end.
fn benchmark_submit_and_drain(c: &mut Criterion) {
    const CALLS: usize = 256;

    let mut group = c.benchmark_group("orchestrator/submit_and_drain");
    group.throughput(Throughput::Elements(CALLS as u64));

    group.bench_function(format!("calls/{CALLS}"), |b| {
        let rt = Builder::new_multi_thread().enable_all().build().unwrap();

        b.to_async(&rt).iter_custom(|iters| async move {
            let orchestrator = Orchestrator::new(
                OrchestratorConfig::default(),
                Arc::new(EchoGenerator::default()),
            )
            .unwrap();
            let start = Instant::now();

            for _ in 0..iters {
                let drains = (0..CALLS).map(|_| {
                    let submission = orchestrator
                        .submit(SubmitRequest::new(
                            EchoGenerator::TOOL,
                            json!({ "text": "the quick brown fox jumps over the lazy dog" }),
                        ))
                        .unwrap();
                    orchestrator
                        .subscribe_and_drain(&submission.call_id)
                        .unwrap()
                        .count()
                });
                black_box(join_all(drains).await);
            }

            start.elapsed()
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_fan_out_single,
    benchmark_fan_out_many,
    benchmark_submit_and_drain,
);
criterion_main!(benches);
