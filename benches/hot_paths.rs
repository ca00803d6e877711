use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use sensorhub::aggregate::Aggregator;
use sensorhub::codec::{parse, parse_frame, FrameContext, SensorType};
use sensorhub::config::{AggregateConfig, BackendKind, StoreConfig};
use sensorhub::export::health::HealthMetrics;
use sensorhub::store::Store;
use serde_json::json;
use tokio_util::sync::CancellationToken;

const MS: i64 = 1_000_000;
const BASE: i64 = 1_700_000_000_000_000_000;

fn single_record() -> Vec<u8> {
    json!({
        "device_id": "bench-phone",
        "sensor": "accelerometer",
        "timestamp": BASE,
        "fields": { "x": 0.0123, "y": -0.98, "z": 9.81 },
    })
    .to_string()
    .into_bytes()
}

fn logger_batch(entries: i64) -> Vec<u8> {
    let payload: Vec<_> = (0..entries)
        .map(|i| {
            json!({
                "name": if i % 10 == 0 { "gps" } else { "accelerometer" },
                "time": BASE + i * 20 * MS,
                "values": { "x": i as f64 * 0.01, "y": 0.5, "z": 9.8 },
            })
        })
        .collect();
    json!({ "messageId": 7, "sessionId": "bench", "deviceId": "bench-phone", "payload": payload })
        .to_string()
        .into_bytes()
}

fn bench_parse(c: &mut Criterion) {
    let record = single_record();
    let batch = logger_batch(256);
    let ctx = FrameContext::default();

    c.bench_function("codec/parse_single", |b| {
        b.iter(|| parse(black_box(&record)).expect("parse record"))
    });

    c.bench_function("codec/parse_logger_batch_256", |b| {
        b.iter(|| {
            let frame = parse_frame(black_box(&batch), &ctx).expect("parse batch");
            black_box(frame.samples.len())
        })
    });
}

fn build_store(rt: &tokio::runtime::Runtime) -> Arc<Store> {
    rt.block_on(async {
        let cfg = StoreConfig {
            backend: BackendKind::Memory,
            ..Default::default()
        };
        let health = Arc::new(HealthMetrics::detached().expect("metrics"));
        let store = Store::open(&cfg, Duration::from_millis(5), health).expect("store");
        store
            .start(CancellationToken::new())
            .await
            .expect("start store");

        let frame = parse_frame(&logger_batch(10_000), &FrameContext::default()).expect("batch");
        store.append_batch(frame.samples).await.expect("append");
        Arc::new(store)
    })
}

fn bench_window(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("runtime");
    let store = build_store(&rt);
    let agg = Aggregator::new(store, AggregateConfig::default());
    let sensors: BTreeSet<SensorType> = [SensorType::Accelerometer, SensorType::Location]
        .into_iter()
        .collect();

    c.bench_function("aggregate/window_200s_decimated", |b| {
        b.iter(|| {
            let table = agg
                .window("bench-phone", black_box(&sensors), Duration::from_secs(200))
                .expect("window");
            black_box(table.rows.len())
        })
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_parse(c);
    bench_window(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
