use std::sync::Arc;
use std::time::Duration;

use sensorhub::agent::Agent;
use sensorhub::codec::SensorType;
use sensorhub::config::{BackendKind, Config, Framing, ViewConfig};
use sensorhub::export::health::HealthMetrics;
use sensorhub::ingest::frame::encode_prefixed;
use sensorhub::ingest::{IngestServer, Ingestor};
use sensorhub::store::{Cursor, RetentionPolicy, Store};
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

const MS: i64 = 1_000_000;
const BASE: i64 = 1_700_000_000_000_000_000;

fn test_config(framing: Framing) -> Config {
    let mut cfg = Config::default();
    cfg.health.addr = String::new();
    cfg.ingest.tcp_addr = "127.0.0.1:0".to_string();
    cfg.ingest.http_addr = "127.0.0.1:0".to_string();
    cfg.ingest.framing = framing;
    cfg.dashboard.addr = "127.0.0.1:0".to_string();
    cfg.store.backend = BackendKind::Memory;
    cfg
}

async fn started(cfg: Config) -> Agent {
    let mut agent = Agent::new(cfg).expect("agent");
    agent.start().await.expect("start");
    agent
}

fn store(agent: &Agent) -> Arc<Store> {
    Arc::clone(agent.store().expect("store started"))
}

fn record(device: &str, sensor: &str, ts: i64, x: f64) -> Vec<u8> {
    json!({
        "device_id": device,
        "sensor": sensor,
        "timestamp": ts,
        "fields": { "x": x },
    })
    .to_string()
    .into_bytes()
}

/// Poll until `stream` holds `want` samples or five seconds pass.
async fn wait_for_count(store: &Store, device: &str, sensor: &SensorType, want: usize) -> usize {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let got = store
            .recent(device, sensor, Cursor::Last(usize::MAX))
            .map(|v| v.len())
            .unwrap_or(0);
        if got >= want || tokio::time::Instant::now() >= deadline {
            return got;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn tcp_session_survives_malformed_frames() {
    let mut agent = started(test_config(Framing::Newline)).await;
    let store = store(&agent);
    let addr = agent.tcp_addr().expect("tcp listener");

    let mut conn = TcpStream::connect(addr).await.expect("connect");
    let mut payload = Vec::new();
    for i in 0..20 {
        payload.extend(record("phone", "accelerometer", BASE + i * 20 * MS, i as f64));
        payload.push(b'\n');
        match i % 5 {
            0 => payload.extend_from_slice(b"{not json at all\n"),
            1 => payload.extend_from_slice(b"{\"device_id\":\"phone\",\"sensor\":\"gyro\"}\n"),
            2 => payload.extend_from_slice(b"[1, 2, 3]\n"),
            _ => {}
        }
    }
    conn.write_all(&payload).await.expect("write");
    conn.flush().await.expect("flush");

    let got = wait_for_count(&store, "phone", &SensorType::Accelerometer, 20).await;
    assert_eq!(got, 20);

    let samples = store
        .recent("phone", &SensorType::Accelerometer, Cursor::Last(usize::MAX))
        .expect("recent");
    for (i, s) in samples.iter().enumerate() {
        assert_eq!(s.sample.field("x"), Some(i as f64));
    }
    assert!(agent.health().parse_errors.with_label_values(&["invalid_json"]).get() >= 4.0);

    drop(conn);
    agent.stop().await.expect("stop");
}

#[tokio::test]
async fn length_prefixed_sessions_from_many_producers() {
    const PRODUCERS: i64 = 6;
    const PER_PRODUCER: i64 = 200;

    let mut agent = started(test_config(Framing::LengthPrefixed)).await;
    let store = store(&agent);
    let addr = agent.tcp_addr().expect("tcp listener");

    let mut producers = Vec::new();
    for p in 0..PRODUCERS {
        producers.push(tokio::spawn(async move {
            let mut conn = TcpStream::connect(addr).await.expect("connect");
            let device = format!("phone-{p}");
            for i in 0..PER_PRODUCER {
                let body = record(&device, "gyroscope", BASE + i * 20 * MS, i as f64);
                conn.write_all(&encode_prefixed(&body)).await.expect("write");
            }
            conn.shutdown().await.expect("shutdown");
        }));
    }
    for p in producers {
        p.await.expect("producer");
    }

    for p in 0..PRODUCERS {
        let got = wait_for_count(
            &store,
            &format!("phone-{p}"),
            &SensorType::Gyroscope,
            PER_PRODUCER as usize,
        )
        .await;
        assert_eq!(got, PER_PRODUCER as usize);
    }
    let summary = store.summary().await.expect("summary");
    assert_eq!(summary.total_records, (PRODUCERS * PER_PRODUCER) as u64);

    agent.stop().await.expect("stop");
}

#[tokio::test]
async fn http_logger_batches_and_stats() {
    let mut agent = started(test_config(Framing::Newline)).await;
    let base = format!("http://{}", agent.http_addr().expect("http listener"));
    let client = reqwest::Client::new();

    let health: Value = client
        .get(format!("{base}/"))
        .send()
        .await
        .expect("get /")
        .json()
        .await
        .expect("json");
    assert_eq!(health["status"], "healthy");

    let batch = json!({
        "messageId": 1,
        "sessionId": "s-1",
        "deviceId": "pixel",
        "payload": [
            { "name": "accelerometer", "time": BASE, "values": { "x": 0.1, "y": 0.2, "z": 9.8 } },
            { "name": "gps", "time": BASE, "values": { "latitude": 52.5, "longitude": 13.4, "altitude": 34.0 } },
            { "name": "accelerometer", "time": BASE + 20 * MS, "values": { "x": 0.3, "y": 0.1, "z": 9.7 } },
            { "name": "accelerometer", "values": { "x": 1.0 } }
        ]
    });
    let resp = client
        .post(format!("{base}/data"))
        .json(&batch)
        .send()
        .await
        .expect("post");
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["status"], "success");
    assert_eq!(body["processed_count"], 3);
    assert_eq!(body["rejected"], 1);

    // Posting the same batch again stores nothing new.
    let body: Value = client
        .post(format!("{base}/data"))
        .json(&batch)
        .send()
        .await
        .expect("post")
        .json()
        .await
        .expect("json");
    assert_eq!(body["duplicates"], 3);

    let resp = client
        .post(format!("{base}/data"))
        .body("definitely not json")
        .send()
        .await
        .expect("post");
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["status"], "error");

    let stats: Value = client
        .get(format!("{base}/stats"))
        .send()
        .await
        .expect("stats")
        .json()
        .await
        .expect("json");
    assert_eq!(stats["total_records"], 3);
    assert_eq!(stats["devices"], 1);
    assert_eq!(stats["streams"], 2);

    agent.stop().await.expect("stop");
}

#[tokio::test]
async fn dashboard_serves_windows_tags_and_live_views() {
    let mut cfg = test_config(Framing::Newline);
    cfg.dashboard.refresh_interval = Duration::from_millis(100);
    cfg.dashboard.views = vec![ViewConfig {
        name: "bike".to_string(),
        device_id: "phone".to_string(),
        sensors: vec!["accelerometer".to_string(), "gps".to_string()],
        span: Duration::from_secs(2),
    }];
    let mut agent = started(cfg).await;
    let store = store(&agent);
    let tcp = agent.tcp_addr().expect("tcp listener");
    let base = format!("http://{}", agent.dashboard_addr().expect("dashboard"));
    let client = reqwest::Client::new();

    let mut conn = TcpStream::connect(tcp).await.expect("connect");
    let mut payload = Vec::new();
    for i in 0..100 {
        payload.extend(record("phone", "accelerometer", BASE + i * 20 * MS, i as f64));
        payload.push(b'\n');
    }
    for i in 0..10 {
        let fix = json!({
            "device_id": "phone",
            "sensor": "location",
            "timestamp": BASE + i * 200 * MS,
            "fields": { "latitude": 52.5, "longitude": 13.4, "altitude": 30.0 + i as f64 },
        });
        payload.extend(fix.to_string().into_bytes());
        payload.push(b'\n');
    }
    conn.write_all(&payload).await.expect("write");
    assert_eq!(wait_for_count(&store, "phone", &SensorType::Location, 10).await, 10);
    assert_eq!(wait_for_count(&store, "phone", &SensorType::Accelerometer, 100).await, 100);

    let window: Value = client
        .get(format!("{base}/api/window?device=phone&sensors=accelerometer,gps&span=2s"))
        .send()
        .await
        .expect("window")
        .json()
        .await
        .expect("json");
    let rows = window["rows"].as_array().expect("rows");
    assert_eq!(rows.len(), 100);
    let gps_cells = rows
        .iter()
        .filter(|r| r["cells"].as_array().expect("cells").iter().any(|c| c.as_f64() == Some(52.5)))
        .count();
    assert_eq!(gps_cells, 10);

    let resp = client
        .get(format!("{base}/api/window?device=phone&sensors=&span=2s"))
        .send()
        .await
        .expect("window");
    assert_eq!(resp.status(), 400);

    let resp = client
        .put(format!("{base}/api/devices/phone/tag"))
        .json(&json!({ "tag": "handlebar" }))
        .send()
        .await
        .expect("tag");
    assert_eq!(resp.status(), 200);
    let devices: Value = client
        .get(format!("{base}/api/devices"))
        .send()
        .await
        .expect("devices")
        .json()
        .await
        .expect("json");
    assert_eq!(devices[0]["device_id"], "phone");
    assert_eq!(devices[0]["tag"], "handlebar");

    let location: Value = client
        .get(format!("{base}/api/devices/phone/location"))
        .send()
        .await
        .expect("location")
        .json()
        .await
        .expect("json");
    assert_eq!(location["altitude"], 39.0);
    let missing = client
        .get(format!("{base}/api/devices/nobody/location"))
        .send()
        .await
        .expect("location");
    assert_eq!(missing.status(), 404);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let live = loop {
        let resp = client
            .get(format!("{base}/api/live/bike"))
            .send()
            .await
            .expect("live");
        if resp.status() == 200 {
            let frame: Value = resp.json().await.expect("json");
            if frame["table"]["rows"].as_array().map_or(0, Vec::len) == 100 {
                break frame;
            }
        }
        assert!(tokio::time::Instant::now() < deadline, "live view never caught up");
        tokio::time::sleep(Duration::from_millis(50)).await;
    };
    assert_eq!(live["stale"], false);

    let unknown = client
        .get(format!("{base}/api/live/nope"))
        .send()
        .await
        .expect("live");
    assert_eq!(unknown.status(), 404);

    drop(conn);
    agent.stop().await.expect("stop");
}

#[tokio::test]
async fn full_write_queue_pushes_back_on_the_producer() {
    const RECORDS: i64 = 16_000;

    let mut cfg = test_config(Framing::Newline);
    cfg.ingest.http_addr = String::new();
    cfg.ingest.max_inflight_per_session = 1;
    cfg.store.queue_capacity = 1;
    cfg.store.max_linger = Duration::ZERO;

    let health = Arc::new(HealthMetrics::new("").expect("metrics"));
    let store = Arc::new(
        Store::open(&cfg.store, cfg.ingest.order_tolerance, Arc::clone(&health)).expect("open"),
    );
    let ingestor = Arc::new(
        Ingestor::new(Arc::clone(&store), Arc::clone(&health), &cfg.ingest).expect("ingestor"),
    );
    let cancel = CancellationToken::new();
    let mut server = IngestServer::new(ingestor, cfg.ingest.clone());
    server.start(cancel.clone()).await.expect("ingest start");
    let addr = server.tcp_addr().expect("tcp listener");

    // Far more than the socket buffers on both ends can absorb.
    let padding = "p".repeat(2048);
    let producer = tokio::spawn(async move {
        let mut conn = TcpStream::connect(addr).await.expect("connect");
        for i in 0..RECORDS {
            let mut line = json!({
                "device_id": "phone",
                "sensor": "accelerometer",
                "timestamp": BASE + i * 20 * MS,
                "fields": { "x": i as f64 },
                "note": padding,
            })
            .to_string()
            .into_bytes();
            line.push(b'\n');
            conn.write_all(&line).await.expect("write");
        }
        conn.shutdown().await.expect("shutdown");
    });

    // Writer not running: the session blocks on the queue and stops reading.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!producer.is_finished(), "producer was never pushed back");
    assert_eq!(store.resident(), 0);

    store.start(cancel.clone()).await.expect("store start");
    tokio::time::timeout(Duration::from_secs(30), producer)
        .await
        .expect("producer drained")
        .expect("producer");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while store.resident() < RECORDS as usize && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(store.resident(), RECORDS as usize);
    assert_eq!(health.samples_dropped.get(), 0.0);

    cancel.cancel();
    server.wait_for_shutdown().await;
    store.wait_for_shutdown().await;
}

#[tokio::test]
async fn session_stays_open_after_write_errors() {
    let mut cfg = test_config(Framing::Newline);
    cfg.store.memory_max_samples = Some(5);
    let mut agent = started(cfg).await;
    let store = store(&agent);
    let health = Arc::clone(agent.health());
    let addr = agent.tcp_addr().expect("tcp listener");

    let mut conn = TcpStream::connect(addr).await.expect("connect");
    let lines = |from: i64, to: i64| {
        let mut payload = Vec::new();
        for i in from..to {
            payload.extend(record("phone", "gyroscope", BASE + i * 20 * MS, i as f64));
            payload.push(b'\n');
        }
        payload
    };

    conn.write_all(&lines(0, 5)).await.expect("write");
    assert_eq!(wait_for_count(&store, "phone", &SensorType::Gyroscope, 5).await, 5);

    // The backend is full: these are acked with a write error and dropped.
    conn.write_all(&lines(5, 8)).await.expect("write");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while health.samples_dropped.get() < 3.0 {
        assert!(tokio::time::Instant::now() < deadline, "write errors never surfaced");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(health.sessions_active.get(), 1.0);

    let report = store
        .retain(&RetentionPolicy {
            max_age: None,
            max_samples_per_stream: Some(2),
        })
        .await
        .expect("retain");
    assert_eq!(report.evicted, 3);

    // Same connection, room again.
    conn.write_all(&lines(8, 9)).await.expect("write");
    assert_eq!(wait_for_count(&store, "phone", &SensorType::Gyroscope, 3).await, 3);
    let newest = store
        .recent("phone", &SensorType::Gyroscope, Cursor::Last(1))
        .expect("recent");
    assert_eq!(newest[0].sample.field("x"), Some(8.0));
    assert_eq!(health.sessions_active.get(), 1.0);

    drop(conn);
    agent.stop().await.expect("stop");
}
