//! Benchmarks for fan-out dispatch with and without mutating consumers.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use otel_agent_pipeline::consumer::{Capabilities, ConsumeError, Consumer, DynConsumer, FnConsumer};
use otel_agent_pipeline::context::Context;
use otel_agent_pipeline::fanout::new_fanout;
use otel_agent_pipeline::testing::traces_with_spans;
use otel_agent_pipeline::pdata::{Batch, Traces};
use std::hint::black_box;
use std::sync::Arc;

fn discarding(capabilities: Capabilities) -> DynConsumer<Traces> {
    Arc::new(FnConsumer::new(capabilities, |_ctx, batch: Traces| async move {
        black_box(batch.item_count());
        Ok::<(), ConsumeError>(())
    }))
}

fn bench_fanout(c: &mut Criterion) {
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => panic!("failed to build runtime: {e}"),
    };
    let mut group = c.benchmark_group("fanout");

    for mutators in [0usize, 1, 3] {
        let mut consumers: Vec<DynConsumer<Traces>> = (0..mutators)
            .map(|_| discarding(Capabilities::MUTATES))
            .collect();
        consumers.push(discarding(Capabilities::READ_ONLY));
        consumers.push(discarding(Capabilities::READ_ONLY));
        let fanout = match new_fanout(consumers) {
            Ok(fanout) => fanout,
            Err(e) => panic!("failed to build fan-out: {e}"),
        };
        let ctx = Context::background();

        group.bench_with_input(
            BenchmarkId::new("500_spans", format!("{mutators}_mutating")),
            &mutators,
            |b, _| {
                b.to_async(&runtime).iter(|| {
                    let batch = traces_with_spans(500);
                    let fanout = Arc::clone(&fanout);
                    let ctx = ctx.clone();
                    async move { fanout.consume(&ctx, black_box(batch)).await }
                })
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_fanout);
criterion_main!(benches);
