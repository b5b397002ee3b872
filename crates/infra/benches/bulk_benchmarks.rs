use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use specscout_core::{JobStatus, JobType, NewJob};
use specscout_events::{EventBus, EventPayload, InMemoryEventBus, LogLevel, StreamEvent};
use specscout_infra::devices::{InMemoryDeviceStore, PassthroughNormalizer};
use specscout_infra::jobs::{
    BulkJobManager, ExecutorConfig, InMemoryJobStore, ManagerConfig, RetryPolicy, RunnerContext, RunnerRegistry,
    StaticTargetResolver, TaskExecutor,
};
use specscout_infra::source::{ScriptedAdapter, SourceRegistry};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap()
}

fn manager(targets: usize) -> BulkJobManager {
    let slugs: Vec<String> = (0..targets).map(|i| format!("device-{i}")).collect();
    let ctx = RunnerContext::new(
        TaskExecutor::new(ExecutorConfig {
            timeout: Duration::from_secs(5),
            retry: RetryPolicy::no_retry(),
        }),
        SourceRegistry::new().register(Arc::new(ScriptedAdapter::new("bench"))),
        Arc::new(InMemoryDeviceStore::new()),
        Arc::new(PassthroughNormalizer),
    );
    BulkJobManager::new(
        InMemoryJobStore::arc(),
        Arc::new(InMemoryEventBus::with_capacity(8192)),
        Arc::new(StaticTargetResolver::new().with_filter("unscraped", slugs)),
        RunnerRegistry::standard(ctx),
        ManagerConfig {
            idle_poll: Duration::from_millis(1),
            ..ManagerConfig::default()
        },
    )
}

fn bench_bus_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("bus_fanout");

    for subscribers in [1, 8, 64].iter() {
        group.throughput(Throughput::Elements(*subscribers as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(subscribers),
            subscribers,
            |b, &subscribers| {
                let bus = InMemoryEventBus::with_capacity(1024);
                let mut subs: Vec<_> = (0..subscribers).map(|_| bus.subscribe("job")).collect();

                b.iter(|| {
                    let event = StreamEvent::new("job", EventPayload::log(LogLevel::Info, "tick"));
                    bus.publish(black_box(event)).unwrap();
                    for sub in subs.iter_mut() {
                        black_box(sub.try_recv());
                    }
                });
            },
        );
    }

    group.finish();
}

fn bench_job_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("job_throughput");
    group.sample_size(20);
    let rt = runtime();

    for targets in [10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*targets as u64));
        for workers in [1u32, 8].iter() {
            group.bench_with_input(
                BenchmarkId::new(format!("workers_{workers}"), targets),
                targets,
                |b, &targets| {
                    b.iter(|| {
                        rt.block_on(async {
                            let manager = manager(targets);
                            let started = manager
                                .start(NewJob::new(JobType::Scrape).with_filter("unscraped").with_workers(*workers))
                                .await
                                .unwrap();
                            loop {
                                let snapshot = manager.get(started.job.id).unwrap();
                                if snapshot.job.status == JobStatus::Done {
                                    break black_box(snapshot.stats.done);
                                }
                                tokio::task::yield_now().await;
                            }
                        })
                    });
                },
            );
        }
    }

    group.finish();
}

criterion_group!(benches, bench_bus_fanout, bench_job_throughput);
criterion_main!(benches);
