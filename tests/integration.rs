use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use caseflow::{
    remote_cache::HttpRemoteBackend, CacheInstruction, CacheSource, CacheStore,
    DefaultSuiteRunner, DependencyKind, DependencyRef, DependencyResolver, Error, FieldBinding,
    HttpExecutor, HttpMethod, RunConfig, SuiteLoader, SuiteRunner, TestSuite, TestUnit,
    UnitState,
};
use serde_json::{json, Value};
use tokio::task::JoinHandle;

#[derive(Default)]
struct AppState {
    created: AtomicUsize,
    kv: Mutex<HashMap<String, Value>>,
}

struct TestServer {
    base_url: String,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

async fn create_mail(State(state): State<Arc<AppState>>, Json(body): Json<Value>) -> Json<Value> {
    let n = state.created.fetch_add(1, Ordering::SeqCst) + 1;
    Json(json!({
        "code": 0,
        "data": {"id": format!("m-{n}"), "subject": body["subject"]}
    }))
}

async fn reply_mail(Path(id): Path<String>, Json(body): Json<Value>) -> Json<Value> {
    Json(json!({
        "code": 0,
        "data": {
            "id": format!("r-{id}"),
            "mail_id": id,
            "parent_id": body["parent_id"],
            "note": body["note"]
        }
    }))
}

async fn forward_mail(headers: HeaderMap) -> (StatusCode, Json<Value>) {
    match headers.get("x-mail-id").and_then(|v| v.to_str().ok()) {
        Some(id) if id.starts_with("m-") => (
            StatusCode::OK,
            Json(json!({"code": 0, "data": {"forwarded": id}})),
        ),
        _ => (
            StatusCode::BAD_REQUEST,
            Json(json!({"code": 400, "message": "missing mail id"})),
        ),
    }
}

async fn quota_mail() -> Json<Value> {
    Json(json!({"code": 40001, "message": "quota exceeded"}))
}

async fn slow_mail() -> Json<Value> {
    tokio::time::sleep(Duration::from_secs(3)).await;
    Json(json!({"code": 0, "data": {"id": "m-slow"}}))
}

async fn kv_get(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    state
        .kv
        .lock()
        .unwrap()
        .get(&key)
        .cloned()
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn kv_put(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Json(value): Json<Value>,
) -> StatusCode {
    state.kv.lock().unwrap().insert(key, value);
    StatusCode::NO_CONTENT
}

impl TestServer {
    async fn spawn() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();

        let app = Router::new()
            .route("/mail", post(create_mail))
            .route("/mail/forward", post(forward_mail))
            .route("/mail/:id/reply", post(reply_mail))
            .route("/quota/mail", post(quota_mail))
            .route("/slow/mail", post(slow_mail))
            .route("/kv/:key", get(kv_get).put(kv_put))
            .with_state(Arc::new(AppState::default()));

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        let server = axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });

        let handle = tokio::spawn(async move {
            if let Err(err) = server.await {
                eprintln!("test server error: {err}");
            }
        });
        let base_url = format!("http://{addr}");

        Self {
            base_url,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if !handle.is_finished() {
                let _ = handle.await;
            }
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

fn load_fixture_suite(dir: &str, base_url: &str) -> TestSuite {
    let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let mut loader = SuiteLoader::new();
    loader.add_path(manifest_dir.join("tests/fixtures").join(dir));
    let mut suite = loader
        .load_suite()
        .unwrap_or_else(|e| panic!("failed to load fixture suite {dir}: {e:#}"));
    suite.config.base_url = Some(base_url.to_string());
    suite
}

fn response_json(report: &caseflow::RunReport, unit: &str) -> Value {
    let body = report
        .unit(unit)
        .and_then(|u| u.response.as_ref())
        .and_then(|r| r.body.as_deref())
        .unwrap_or_else(|| panic!("no response body for {unit}"));
    serde_json::from_str(body).unwrap()
}

#[tokio::test]
async fn suite_propagates_created_id_end_to_end() {
    let server = TestServer::spawn().await;
    let suite = load_fixture_suite("mail", &server.base_url);
    let runner = DefaultSuiteRunner::new(Arc::new(CacheStore::new()));

    let report = runner.run(&suite).await.unwrap();

    assert!(report.success, "{report:#?}");
    assert_eq!(report.order, vec!["mail_create", "mail_forward", "mail_reply"]);
    assert!(report.warnings.is_empty());

    let reply = response_json(&report, "mail_reply");
    assert_eq!(reply["data"]["mail_id"], json!("m-1"));
    assert_eq!(reply["data"]["parent_id"], json!("m-1"));
    assert_eq!(reply["data"]["note"], json!("re: hello"));

    let forward = response_json(&report, "mail_forward");
    assert_eq!(forward["data"]["forwarded"], json!("m-1"));

    let create = report.unit("mail_create").unwrap();
    assert_eq!(create.cache_keys, vec!["subject"]);
    assert_eq!(create.state, UnitState::CacheWritten);
    let sent = create.request.as_ref().unwrap();
    assert_eq!(sent.headers["X-Client"], "caseflow-tests");

    server.shutdown().await;
}

#[tokio::test]
async fn prerequisite_executes_inline_over_http() {
    let server = TestServer::spawn().await;
    let units = vec![
        TestUnit::new("mail_forward", HttpMethod::Post, "/mail/forward").with_dependency(
            DependencyRef::new("mail_create").bind(
                FieldBinding::new("$.data.id", DependencyKind::Response)
                    .into_target("headers.X-Mail-Id"),
            ),
        ),
        TestUnit::new("mail_create", HttpMethod::Post, "/mail")
            .with_body(json!({"subject": "inline"})),
    ];
    let cache = CacheStore::new();
    let executor = HttpExecutor::new();
    let config = RunConfig {
        base_url: Some(server.base_url.clone()),
        ..RunConfig::default()
    };
    let mut resolver = DependencyResolver::new(&units, &cache, &executor, &config);

    assert!(resolver.run("mail_forward").await);
    assert!(resolver.is_done("mail_create"));
    let results = resolver.into_results();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].id, "mail_create");
    assert!(results[0].inline);
    assert_eq!(results[1].id, "mail_forward");

    server.shutdown().await;
}

#[tokio::test]
async fn business_failure_is_reported_on_dependent() {
    let server = TestServer::spawn().await;
    let suite = TestSuite {
        name: "quota".into(),
        units: vec![
            TestUnit::new("quota_create", HttpMethod::Post, "/quota/mail").with_body(json!({})),
            TestUnit::new("quota_reply", HttpMethod::Post, "/mail/{mail_id}/reply")
                .with_body(json!({}))
                .with_dependency(DependencyRef::new("quota_create").bind(
                    FieldBinding::new("$.data.id", DependencyKind::Response)
                        .into_target("url.mail_id"),
                )),
        ],
        relations: Vec::new(),
        config: RunConfig {
            base_url: Some(server.base_url.clone()),
            ..RunConfig::default()
        },
    };
    let runner = DefaultSuiteRunner::new(Arc::new(CacheStore::new()));

    let report = runner.run(&suite).await.unwrap();

    assert!(!report.success);
    assert!(report.unit("quota_create").unwrap().success);
    let reply = report.unit("quota_reply").unwrap();
    assert_eq!(reply.state, UnitState::Failed);
    assert!(reply.request.is_none());
    let error = reply.error.as_deref().unwrap();
    assert!(error.contains("$.data.id"), "{error}");
    assert!(error.contains("code=40001"), "{error}");
    assert!(error.contains("quota exceeded"), "{error}");

    server.shutdown().await;
}

#[tokio::test]
async fn remote_cache_round_trips_over_http() {
    let server = TestServer::spawn().await;
    let backend = HttpRemoteBackend::new(&format!("{}/kv", server.base_url))
        .unwrap()
        .with_max_retries(0);
    let cache = CacheStore::with_remote(Arc::new(backend), "caseflow:");

    match cache.get("remote:token").await {
        Err(Error::KeyNotFound { key }) => assert_eq!(key, "remote:token"),
        other => panic!("expected KeyNotFound, got {other:?}"),
    }

    cache.set("remote:token", json!({"value": "t0k"})).await.unwrap();
    cache.set("remote:token", json!("t1k")).await.unwrap();
    assert_eq!(cache.get("remote:token").await.unwrap(), json!("t1k"));
    assert!(!cache.contains("remote:token"));

    server.shutdown().await;
}

#[tokio::test]
async fn remote_keys_feed_cache_references() {
    let server = TestServer::spawn().await;
    let suite = TestSuite {
        name: "remote".into(),
        units: vec![
            TestUnit::new("mail_create", HttpMethod::Post, "/mail")
                .with_body(json!({"subject": "s"})),
            TestUnit::new("mail_reply", HttpMethod::Post, "/mail/{{ cache.remote:mail_id }}/reply")
                .with_body(json!({"parent_id": "{{ cache.remote:mail_id }}"}))
                .with_dependency(DependencyRef::new("mail_create").bind(
                    FieldBinding::new("$.data.id", DependencyKind::Response)
                        .cached_as("remote:mail_id"),
                )),
        ],
        relations: Vec::new(),
        config: RunConfig {
            base_url: Some(server.base_url.clone()),
            ..RunConfig::default()
        },
    };
    let backend = HttpRemoteBackend::new(&format!("{}/kv", server.base_url)).unwrap();
    let cache = Arc::new(CacheStore::with_remote(Arc::new(backend), "suite:"));
    let runner = DefaultSuiteRunner::new(cache.clone());

    let report = runner.run(&suite).await.unwrap();

    assert!(report.success, "{report:#?}");
    let reply = response_json(&report, "mail_reply");
    assert_eq!(reply["data"]["mail_id"], json!("m-1"));
    assert_eq!(reply["data"]["parent_id"], json!("m-1"));
    assert_eq!(cache.get("remote:mail_id").await.unwrap(), json!("m-1"));

    server.shutdown().await;
}

#[tokio::test]
async fn unreachable_remote_cache_fails_unit() {
    let server = TestServer::spawn().await;
    let units = vec![
        TestUnit::new("mail_create", HttpMethod::Post, "/mail").with_body(json!({})),
        TestUnit::new("mail_read", HttpMethod::Post, "/mail").with_dependency(
            DependencyRef::new("mail_create").bind(
                FieldBinding::new("$.data.id", DependencyKind::Response).cached_as("remote:id"),
            ),
        ),
    ];
    // Nothing listens on port 9 of the loopback interface.
    let backend = HttpRemoteBackend::new("http://127.0.0.1:9/kv")
        .unwrap()
        .with_max_retries(0);
    let cache = CacheStore::with_remote(Arc::new(backend), "caseflow:");
    let executor = HttpExecutor::new();
    let config = RunConfig {
        base_url: Some(server.base_url.clone()),
        timeout: 5,
        ..RunConfig::default()
    };
    let mut resolver = DependencyResolver::new(&units, &cache, &executor, &config);

    let ran = tokio::time::timeout(Duration::from_secs(20), resolver.run("mail_read"))
        .await
        .expect("resolver hung on unreachable backend");
    assert!(!ran);
    let error = resolver.outcome("mail_read").unwrap().error.clone().unwrap();
    assert!(error.contains("unavailable"), "{error}");

    server.shutdown().await;
}

#[tokio::test]
async fn repeated_runs_use_fresh_local_values() {
    let server = TestServer::spawn().await;
    let suite = TestSuite {
        name: "rerun".into(),
        units: vec![
            TestUnit::new("mail_create", HttpMethod::Post, "/mail")
                .with_body(json!({"subject": "s"})),
            TestUnit::new("mail_reply", HttpMethod::Post, "/mail/{{ cache.mail_id }}/reply")
                .with_body(json!({}))
                .with_dependency(DependencyRef::new("mail_create").bind(
                    FieldBinding::new("$.data.id", DependencyKind::Response).cached_as("mail_id"),
                )),
        ],
        relations: Vec::new(),
        config: RunConfig {
            base_url: Some(server.base_url.clone()),
            ..RunConfig::default()
        },
    };
    let cache = Arc::new(CacheStore::new());
    let runner = DefaultSuiteRunner::new(cache.clone());

    let first = runner.run(&suite).await.unwrap();
    assert!(first.success, "{first:#?}");
    assert_eq!(response_json(&first, "mail_reply")["data"]["mail_id"], json!("m-1"));

    let second = runner.run(&suite).await.unwrap();
    assert!(second.success, "{second:#?}");
    assert_eq!(response_json(&second, "mail_reply")["data"]["mail_id"], json!("m-2"));
    assert_eq!(second.unit("mail_create").unwrap().cache_keys, Vec::<String>::new());
    assert_eq!(second.unit("mail_reply").unwrap().cache_keys, vec!["mail_id"]);
    assert_eq!(cache.get("mail_id").await.unwrap(), json!("m-2"));

    server.shutdown().await;
}

#[tokio::test]
async fn slow_prerequisite_times_out_and_fails_dependent() {
    let server = TestServer::spawn().await;
    let mut slow = TestUnit::new("slow_create", HttpMethod::Post, "/slow/mail")
        .with_body(json!({}))
        .caching(CacheInstruction {
            name: "slow_subject".into(),
            path: "$.data.id".into(),
            from: CacheSource::Response,
        });
    slow.timeout = Some(1);
    let suite = TestSuite {
        name: "slow".into(),
        units: vec![
            slow,
            TestUnit::new("slow_reply", HttpMethod::Post, "/mail/{mail_id}/reply")
                .with_body(json!({}))
                .with_dependency(DependencyRef::new("slow_create").bind(
                    FieldBinding::new("$.data.id", DependencyKind::Response)
                        .into_target("url.mail_id")
                        .cached_as("slow_id"),
                )),
        ],
        relations: Vec::new(),
        config: RunConfig {
            base_url: Some(server.base_url.clone()),
            ..RunConfig::default()
        },
    };
    let cache = Arc::new(CacheStore::new());
    let runner = DefaultSuiteRunner::new(cache.clone());

    let report = runner.run(&suite).await.unwrap();

    assert!(!report.success);
    let create = report.unit("slow_create").unwrap();
    assert_eq!(create.state, UnitState::Failed);
    let error = create.error.as_deref().unwrap();
    assert!(error.contains("timed out"), "{error}");
    assert!(create.duration_ms < 3000, "took {} ms", create.duration_ms);

    let reply = report.unit("slow_reply").unwrap();
    assert_eq!(reply.state, UnitState::Failed);
    let error = reply.error.as_deref().unwrap();
    assert!(error.contains("prerequisite 'slow_create'"), "{error}");
    assert!(cache.keys().is_empty(), "{:?}", cache.keys());

    server.shutdown().await;
}
