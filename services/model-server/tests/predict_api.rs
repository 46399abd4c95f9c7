//! End-to-end scenarios against a live server on an ephemeral port:
//! warm-up to ready, remote not-found, malformed bodies, and timeout
//! isolation between concurrent requests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use model_server::http::{router, AppState};
use serde_json::{json, Value};
use serving_core::error::{FetchError, PredictError};
use serving_core::loader::ModelCache;
use serving_core::predictor::{InputSchema, Prediction, Predictor};
use serving_core::resilience::RetryConfig;
use serving_core::resolver::{sha256_hex, ArtifactResolver, ModelVersion};
use serving_core::remote::RemoteStore;
use tokio::sync::Semaphore;

struct ScriptedRemote {
    objects: HashMap<String, Vec<u8>>,
    delay: Duration,
    fetches: AtomicUsize,
}

#[async_trait]
impl RemoteStore for ScriptedRemote {
    async fn fetch(&self, path: &str) -> Result<Vec<u8>, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.objects
            .get(path)
            .cloned()
            .ok_or_else(|| FetchError::NotFound { path: path.to_string() })
    }
}

fn iris_artifact() -> Vec<u8> {
    serde_json::to_vec(&json!({
        "format": "linear_softmax",
        "schema": ["sepal_length", "sepal_width", "petal_length", "petal_width"],
        "classes": ["setosa", "versicolor", "virginica"],
        "weights": [
            [0.0, 0.0, -1.0, -1.0],
            [0.0, 0.0, 0.2, 0.0],
            [0.0, 0.0, 1.0, 1.0]
        ],
        "intercepts": [4.0, 0.5, -4.0],
    }))
    .unwrap()
}

struct Harness {
    state: Arc<AppState>,
    _dir: tempfile::TempDir,
}

fn harness(
    objects: HashMap<String, Vec<u8>>,
    fetch_delay: Duration,
    serving: Option<ModelVersion>,
    request_timeout: Duration,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(ScriptedRemote { objects, delay: fetch_delay, fetches: AtomicUsize::new(0) });
    let retry = RetryConfig {
        max_attempts: 2,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        jitter: 0.0,
    };
    let resolver = ArtifactResolver::new(dir.path().to_path_buf(), remote, retry);
    let cache = Arc::new(ModelCache::new(resolver, 4, Duration::from_secs(60)));
    let state = Arc::new(AppState {
        cache,
        serving,
        request_timeout,
        limiter: Arc::new(Semaphore::new(8)),
    });
    Harness { state, _dir: dir }
}

async fn spawn_server(state: Arc<AppState>) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

async fn health_status(client: &reqwest::Client, base: &str) -> (u16, String) {
    let resp = client.get(format!("{base}/health")).send().await.unwrap();
    let code = resp.status().as_u16();
    let body: Value = resp.json().await.unwrap();
    (code, body["status"].as_str().unwrap_or_default().to_string())
}

fn valid_iris_body() -> Value {
    json!({
        "sepal_length": 5.1,
        "sepal_width": 3.5,
        "petal_length": 1.4,
        "petal_width": 0.2,
    })
}

#[tokio::test]
async fn scenario_uncached_version_goes_loading_then_ready() {
    let bytes = iris_artifact();
    let v1 = ModelVersion::new("v1", sha256_hex(&bytes), "objects/v1");
    let h = harness(
        HashMap::from([("objects/v1".to_string(), bytes)]),
        Duration::from_millis(150),
        Some(v1),
        Duration::from_millis(2_000),
    );
    let base = spawn_server(h.state.clone()).await;
    let client = reqwest::Client::new();

    let (code, status) = health_status(&client, &base).await;
    assert_eq!(code, 503);
    assert_eq!(status, "loading");

    // The first prediction arrives before the model is ready: 503, and it
    // kicks the load rather than blocking on it.
    let resp = client
        .post(format!("{base}/predict"))
        .json(&valid_iris_body())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 503);

    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        let (code, status) = health_status(&client, &base).await;
        if code == 200 {
            assert_eq!(status, "ready");
            break;
        }
        assert!(Instant::now() < deadline, "model never became ready");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    let resp = client
        .post(format!("{base}/predict"))
        .json(&valid_iris_body())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["label"], "setosa");
    assert_eq!(body["model_version"], "v1");
    assert!(body["confidence"].as_f64().unwrap() > 0.5);
}

#[tokio::test]
async fn scenario_remote_not_found_reports_failed() {
    let bytes = iris_artifact();
    let v2 = ModelVersion::new("v2", sha256_hex(&bytes), "objects/v2");
    let h = harness(
        HashMap::new(),
        Duration::from_millis(10),
        Some(v2),
        Duration::from_millis(2_000),
    );
    let base = spawn_server(h.state.clone()).await;
    let client = reqwest::Client::new();

    // First predict kicks the load, which fails with NotFound.
    let resp = client
        .post(format!("{base}/predict"))
        .json(&valid_iris_body())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 503);

    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        let (code, status) = health_status(&client, &base).await;
        if status == "failed" {
            assert_eq!(code, 503);
            break;
        }
        assert!(Instant::now() < deadline, "load never failed");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    let resp = client
        .post(format!("{base}/predict"))
        .json(&valid_iris_body())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 503);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "not_ready");
}

#[tokio::test]
async fn scenario_malformed_bodies_are_rejected_without_inference() {
    let bytes = iris_artifact();
    let v1 = ModelVersion::new("v1", sha256_hex(&bytes), "objects/v1");
    let h = harness(
        HashMap::from([("objects/v1".to_string(), bytes)]),
        Duration::from_millis(1),
        Some(v1.clone()),
        Duration::from_millis(2_000),
    );
    h.state.cache.get_or_load(&v1).await.unwrap();
    let base = spawn_server(h.state.clone()).await;
    let client = reqwest::Client::new();

    // Not JSON at all.
    let resp = client
        .post(format!("{base}/predict"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);

    // Valid JSON, wrong shape.
    for body in [
        json!({"sepal_length": 5.1}),
        json!({"sepal_length": 5.1, "sepal_width": 3.5, "petal_length": 1.4, "petal_width": "wide"}),
        json!([5.1, 3.5, 1.4, 0.2]),
        json!({"sepal_length": 5.1, "sepal_width": 3.5, "petal_length": 1.4, "petal_width": 0.2, "extra": 1.0}),
    ] {
        let resp = client
            .post(format!("{base}/predict"))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 400);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"], "validation_error");
    }
}

#[tokio::test]
async fn unconfigured_process_serves_health_but_not_predictions() {
    let h = harness(
        HashMap::new(),
        Duration::from_millis(1),
        None,
        Duration::from_millis(2_000),
    );
    let base = spawn_server(h.state.clone()).await;
    let client = reqwest::Client::new();

    let (code, status) = health_status(&client, &base).await;
    assert_eq!(code, 503);
    assert_eq!(status, "unconfigured");

    let resp = client
        .post(format!("{base}/predict"))
        .json(&valid_iris_body())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 503);

    let resp = client.get(format!("{base}/live")).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);
}

#[derive(Debug)]
struct SlowPredictor {
    schema: InputSchema,
}

impl Predictor for SlowPredictor {
    fn input_schema(&self) -> &InputSchema {
        &self.schema
    }

    fn predict(&self, features: &[f64]) -> Result<Prediction, PredictError> {
        std::thread::sleep(Duration::from_millis(features[0] as u64));
        Ok(Prediction {
            label: "done".to_string(),
            confidence: 1.0,
            scores: Default::default(),
        })
    }
}

#[tokio::test]
async fn timed_out_request_does_not_stall_concurrent_ones() {
    let slow = ModelVersion::new("slow", "ab".repeat(32), "objects/slow");
    let h = harness(
        HashMap::new(),
        Duration::from_millis(1),
        Some(slow.clone()),
        Duration::from_millis(200),
    );
    h.state.cache.insert_ready(
        slow,
        Arc::new(SlowPredictor { schema: InputSchema { features: vec!["delay_ms".to_string()] } }),
    );
    let base = spawn_server(h.state.clone()).await;
    let client = reqwest::Client::new();

    let started = Instant::now();
    let slow_req = client
        .post(format!("{base}/predict"))
        .json(&json!({"delay_ms": 800.0}))
        .send();
    let fast_req = client
        .post(format!("{base}/predict"))
        .json(&json!({"delay_ms": 0.0}))
        .send();
    let (slow_resp, fast_resp) = tokio::join!(slow_req, fast_req);

    assert_eq!(slow_resp.unwrap().status().as_u16(), 504);
    let fast_resp = fast_resp.unwrap();
    assert_eq!(fast_resp.status().as_u16(), 200);
    let body: Value = fast_resp.json().await.unwrap();
    assert_eq!(body["label"], "done");
    // The fast request finished alongside the abandoned slow one, well
    // before the slow prediction's 800ms sleep elapsed.
    assert!(started.elapsed() < Duration::from_millis(700));

    // The predictor stays usable after the abandoned request.
    let resp = client
        .post(format!("{base}/predict"))
        .json(&json!({"delay_ms": 0.0}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
}
