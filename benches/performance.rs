//! Performance benchmarks for the command hub.

use command_hub::{
    Caller, CommandId, CommandInput, DeviceId, Filter, Hub, HubConfig, MemoryCommandStore,
    SubscribeRequest, Timestamp,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn create_hub() -> Hub {
    Hub::with_config(
        Arc::new(MemoryCommandStore::new()),
        HubConfig {
            connection_buffer: 1_000_000,
            ..Default::default()
        },
    )
    .unwrap()
}

/// Benchmark insert + fan-out with varying subscriber counts
fn bench_publish_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("publish_fan_out");

    for subscribers in [1, 10, 100, 1000] {
        group.bench_with_input(
            BenchmarkId::new("subscribers", subscribers),
            &subscribers,
            |b, &count| {
                let hub = create_hub();
                let handles: Vec<_> = (0..count)
                    .map(|_| {
                        let conn = hub.connect();
                        hub.subscribe(conn.id, SubscribeRequest::device("dev-1"))
                            .unwrap();
                        conn
                    })
                    .collect();
                let device = DeviceId::new("dev-1");

                b.iter(|| {
                    let cmd = hub
                        .insert_command(
                            None,
                            &device,
                            CommandInput::new("set").with_parameters(json!({"level": 1})),
                            &Caller::user(1),
                        )
                        .unwrap();
                    black_box(cmd);
                    for handle in &handles {
                        handle.drain();
                    }
                });
            },
        );
    }

    group.finish();
}

/// Benchmark matching lookups across many unrelated subscriptions
fn bench_matching(c: &mut Criterion) {
    let mut group = c.benchmark_group("matching");

    for devices in [100, 1000, 10_000] {
        group.bench_with_input(BenchmarkId::new("devices", devices), &devices, |b, &n| {
            let hub = create_hub();
            let hub_conn = hub.connect();
            for i in 0..n {
                hub.subscribe_filter(
                    hub_conn.id,
                    Filter::devices([DeviceId::new(format!("dev-{}", i))]).unwrap(),
                    None,
                )
                .unwrap();
            }

            let command = CommandInput::new("x").into_command(
                CommandId(1),
                DeviceId::new(format!("dev-{}", n / 2)),
                None,
            );
            b.iter(|| black_box(hub.registry().matching(&command)));
        });
    }

    group.finish();
}

/// Benchmark subscribe with catch-up over a populated store
fn bench_catch_up(c: &mut Criterion) {
    let mut group = c.benchmark_group("catch_up");
    group.sample_size(20);

    for history in [100, 1000] {
        group.bench_with_input(BenchmarkId::new("history", history), &history, |b, &n| {
            let hub = create_hub();
            let device = DeviceId::new("dev-1");
            for _ in 0..n {
                hub.insert_command(None, &device, CommandInput::new("x"), &Caller::user(1))
                    .unwrap();
            }

            b.iter(|| {
                let conn = hub.connect();
                let request = SubscribeRequest::device("dev-1").since(Timestamp(0));
                hub.subscribe(conn.id, request).unwrap();
                let mut received = 0;
                while let Ok(event) = conn.recv_timeout(Duration::from_secs(5)) {
                    if event.command().is_none() {
                        break;
                    }
                    received += 1;
                }
                hub.on_connection_closed(conn.id);
                black_box(received);
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_publish_fan_out, bench_matching, bench_catch_up);
criterion_main!(benches);
