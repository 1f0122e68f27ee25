//! Integration tests for the mcai-server HTTP API
//!
//! Third parties are replaced by in-process stubs; the database is a real
//! SQLite file in a temp dir so the job worker and handlers share it the
//! way they do in production.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower::util::ServiceExt;
use uuid::Uuid;

use mcai_common::config::TomlConfig;
use mcai_common::events::{AnalysisState, EventBus};
use mcai_server::config::ServiceConfig;
use mcai_server::db::{analyses, reports};
use mcai_server::models::AnalysisReport;
use mcai_server::services::{
    AcrCloudError, ChartDataSource, FingerprintService, JobWorker, SoundchartsError,
};
use mcai_server::AppState;

const WEBHOOK_TOKEN: &str = "hook-secret";
const FILE_ID: &str = "acr-file-1";

/// Minimal MP3: ID3 header followed by filler
fn mp3_bytes(seed: u8) -> Vec<u8> {
    let mut bytes = b"ID3\x03\x00\x00\x00\x00\x00\x00".to_vec();
    bytes.extend(std::iter::repeat(seed).take(512));
    bytes
}

#[derive(Default)]
struct StubFingerprint {
    fail_uploads: AtomicBool,
    /// Result fetches that answer 503 before one succeeds
    transient_fetch_failures: AtomicUsize,
    reject_fetches: AtomicBool,
    uploads: AtomicUsize,
    fetches: AtomicUsize,
}

#[async_trait]
impl FingerprintService for StubFingerprint {
    async fn upload(&self, _filename: &str, _bytes: Vec<u8>) -> Result<String, AcrCloudError> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(AcrCloudError::Unauthorized);
        }
        Ok(FILE_ID.to_string())
    }

    async fn fetch_result(&self, external_file_id: &str) -> Result<Value, AcrCloudError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.reject_fetches.load(Ordering::SeqCst) {
            return Err(AcrCloudError::Unauthorized);
        }
        if self
            .transient_fetch_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(AcrCloudError::Api {
                status: 503,
                message: "service busy".to_string(),
            });
        }
        Ok(json!({
            "data": [{
                "id": external_file_id,
                "state": 1,
                "results": {
                    "music": [{
                        "result": {
                            "title": "Known Song",
                            "artists": [{"name": "Known Artist"}],
                            "acrid": "acr-1",
                            "score": 97
                        }
                    }]
                }
            }]
        }))
    }
}

struct StubCharts;

#[async_trait]
impl ChartDataSource for StubCharts {
    async fn chart_ranking(
        &self,
        _slug: &str,
        offset: usize,
        _limit: usize,
    ) -> Result<Value, SoundchartsError> {
        if offset > 0 {
            return Ok(json!({"items": [], "page": {"total": 2}}));
        }
        Ok(json!({
            "items": [
                {"song": {"uuid": "s1", "name": "Rising"}, "position": 1, "oldPosition": 3,
                 "positionEvolution": 2, "timeOnChart": 4},
                {"song": {"uuid": "s2", "name": "Falling"}, "position": 2, "oldPosition": 1,
                 "positionEvolution": -1, "timeOnChart": 9}
            ],
            "page": {"offset": 0, "total": 2, "next": null}
        }))
    }

    async fn song(&self, track_uuid: &str) -> Result<Value, SoundchartsError> {
        Ok(json!({
            "object": {
                "uuid": track_uuid,
                "name": format!("Song {}", track_uuid),
                "isrc": {"value": format!("US{}", track_uuid.to_uppercase())},
                "artists": [{"uuid": "a1", "name": "Shared Artist"}]
            }
        }))
    }

    async fn artist(&self, artist_uuid: &str) -> Result<Value, SoundchartsError> {
        Ok(json!({"object": {"uuid": artist_uuid, "name": "Shared Artist", "countryCode": "SE"}}))
    }

    async fn audience(&self, _artist_uuid: &str, _platform: &str) -> Result<Value, SoundchartsError> {
        Ok(json!({"items": [{"date": "2024-03-01T00:00:00+00:00", "followerCount": 1500}]}))
    }
}

struct TestApp {
    app: Router,
    state: AppState,
    fingerprint: Arc<StubFingerprint>,
    worker: Option<JobWorker>,
    cancel: CancellationToken,
    _root: tempfile::TempDir,
}

impl TestApp {
    async fn new(webhook_token: Option<&str>) -> Self {
        let root = tempfile::tempdir().unwrap();
        let db = mcai_common::db::init_database(&root.path().join("mcai.db"))
            .await
            .unwrap();

        let toml = TomlConfig::from_toml_str(
            r#"
            [pipeline]
            retry_base_delay_ms = 1
            retry_max_delay_ms = 5
            "#,
        )
        .unwrap();
        let config = ServiceConfig::from_toml(&toml, root.path().join("uploads"));

        let fingerprint = Arc::new(StubFingerprint::default());
        let cancel = CancellationToken::new();
        let assembled = mcai_server::assemble(
            db,
            EventBus::new(100),
            fingerprint.clone(),
            Arc::new(StubCharts),
            &config,
            webhook_token.map(str::to_string),
            cancel.clone(),
        );

        Self {
            app: mcai_server::build_router(assembled.state.clone()),
            state: assembled.state,
            fingerprint,
            worker: Some(assembled.worker),
            cancel,
            _root: root,
        }
    }

    /// Start processing queued jobs
    fn start_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            tokio::spawn(worker.run(Duration::from_secs(1)));
        }
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).unwrap_or(Value::Null)
        };
        (status, json)
    }

    async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.send(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
    }

    async fn post_json(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.send(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
    }

    async fn upload(&self, filename: &str, bytes: &[u8]) -> (StatusCode, Value) {
        let boundary = "mcai-test-boundary";
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{f}\"\r\nContent-Type: audio/mpeg\r\n\r\n",
                b = boundary,
                f = filename
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());

        self.send(
            Request::builder()
                .method("POST")
                .uri("/analyses")
                .header(
                    "content-type",
                    format!("multipart/form-data; boundary={}", boundary),
                )
                .body(Body::from(body))
                .unwrap(),
        )
        .await
    }

    async fn callback(&self, payload: Value) -> (StatusCode, Value) {
        self.post_json(&format!("/webhooks/acrcloud?token={}", WEBHOOK_TOKEN), payload)
            .await
    }

    async fn wait_for_state(&self, analysis_id: Uuid, expected: AnalysisState) {
        for _ in 0..250 {
            let analysis = analyses::load_analysis(&self.state.db, analysis_id)
                .await
                .unwrap()
                .unwrap();
            if analysis.state == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("analysis {} never reached {}", analysis_id, expected);
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn analysis_id(body: &Value) -> Uuid {
    body["analysis_id"].as_str().unwrap().parse().unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let app = TestApp::new(Some(WEBHOOK_TOKEN)).await;

    let (status, json) = app.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["module"], "mcai-server");
}

#[tokio::test]
async fn test_upload_rejects_non_audio() {
    let app = TestApp::new(Some(WEBHOOK_TOKEN)).await;

    let (status, json) = app.upload("notes.txt", b"just some text").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"]["code"], "BAD_REQUEST");

    let (status, _) = app.upload("empty.mp3", b"").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_upload_submit_callback_report() {
    let mut app = TestApp::new(Some(WEBHOOK_TOKEN)).await;
    app.start_worker();

    let (status, json) = app.upload("song.mp3", &mp3_bytes(1)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json["state"], "uploaded");
    assert_eq!(json["deduplicated"], false);
    let id = analysis_id(&json);

    app.wait_for_state(id, AnalysisState::Submitted).await;
    let (_, json) = app.get(&format!("/analyses/{}", id)).await;
    assert_eq!(json["external_file_id"], FILE_ID);

    let (status, _) = app.get(&format!("/analyses/{}/report", id)).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, ack) = app.callback(json!({"file_id": FILE_ID, "state": 1})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["outcome"], "applied");

    app.wait_for_state(id, AnalysisState::Completed).await;
    let (status, json) = app.get(&format!("/analyses/{}/report", id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["report"]["verdict"], "known_recording");
    assert_eq!(json["original_filename"], "song.mp3");

    // Redelivery after completion changes nothing
    let (status, ack) = app.callback(json!({"file_id": FILE_ID, "state": 1})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["outcome"], "ignored");
    assert_eq!(app.fingerprint.fetches.load(Ordering::SeqCst), 1);

    // Same content again reuses the completed analysis
    let (status, json) = app.upload("copy.mp3", &mp3_bytes(1)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["deduplicated"], true);
    assert_eq!(analysis_id(&json), id);
    assert_eq!(app.fingerprint.uploads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_concurrent_duplicate_callbacks_fetch_once() {
    let mut app = TestApp::new(Some(WEBHOOK_TOKEN)).await;
    app.start_worker();

    let (_, json) = app.upload("dup.mp3", &mp3_bytes(2)).await;
    let id = analysis_id(&json);
    app.wait_for_state(id, AnalysisState::Submitted).await;

    let payload = json!({"file_id": FILE_ID, "state": 1});
    let (first, second) = tokio::join!(app.callback(payload.clone()), app.callback(payload));
    assert_eq!(first.0, StatusCode::OK);
    assert_eq!(second.0, StatusCode::OK);

    let outcomes = [first.1["outcome"].clone(), second.1["outcome"].clone()];
    assert!(outcomes.contains(&json!("applied")));

    app.wait_for_state(id, AnalysisState::Completed).await;
    assert_eq!(app.fingerprint.fetches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_callback_before_submission_is_replayed() {
    let mut app = TestApp::new(Some(WEBHOOK_TOKEN)).await;

    // Worker not running yet: the analysis stays `uploaded`
    let (_, json) = app.upload("early.mp3", &mp3_bytes(3)).await;
    let id = analysis_id(&json);

    let (status, ack) = app.callback(json!({"file_id": FILE_ID, "state": 1})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["outcome"], "pending");

    app.start_worker();
    app.wait_for_state(id, AnalysisState::Completed).await;
    assert_eq!(app.fingerprint.fetches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_callback_failure_then_retry() {
    let mut app = TestApp::new(Some(WEBHOOK_TOKEN)).await;
    app.start_worker();

    let (_, json) = app.upload("bad.mp3", &mp3_bytes(4)).await;
    let id = analysis_id(&json);
    app.wait_for_state(id, AnalysisState::Submitted).await;

    let (status, _) = app
        .callback(json!({"file_id": FILE_ID, "state": -2, "error": "decode failed"}))
        .await;
    assert_eq!(status, StatusCode::OK);
    app.wait_for_state(id, AnalysisState::Failed).await;

    let (_, json) = app.get(&format!("/analyses/{}", id)).await;
    assert_eq!(json["last_error"], "decode failed");

    // Late success for a failed analysis is ignored
    let (_, ack) = app.callback(json!({"file_id": FILE_ID, "state": 1})).await;
    assert_eq!(ack["outcome"], "ignored");

    let (status, json) = app.post_json(&format!("/analyses/{}/retry", id), json!({})).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    // The file id survives, so retry goes straight to fetching
    assert_eq!(json["external_file_id"], FILE_ID);
    assert_ne!(json["state"], "failed");

    app.wait_for_state(id, AnalysisState::Completed).await;
}

/// Upload, wait for submission and signal that the result is ready
async fn upload_until_ready(app: &TestApp, seed: u8) -> Uuid {
    let (_, json) = app.upload("fetch.mp3", &mp3_bytes(seed)).await;
    let id = analysis_id(&json);
    app.wait_for_state(id, AnalysisState::Submitted).await;
    let (status, _) = app.callback(json!({"file_id": FILE_ID, "state": 1})).await;
    assert_eq!(status, StatusCode::OK);
    id
}

#[tokio::test]
async fn test_fetch_recovers_from_transient_failures() {
    let mut app = TestApp::new(Some(WEBHOOK_TOKEN)).await;
    app.fingerprint.transient_fetch_failures.store(2, Ordering::SeqCst);
    app.start_worker();

    let id = upload_until_ready(&app, 10).await;
    app.wait_for_state(id, AnalysisState::Completed).await;

    let (_, json) = app.get(&format!("/analyses/{}", id)).await;
    assert_eq!(json["fetch_attempts"], 3);
    assert_eq!(json["last_error"], Value::Null);
    assert_eq!(app.fingerprint.fetches.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_fetch_exhaustion_then_retry_resets_attempts() {
    let mut app = TestApp::new(Some(WEBHOOK_TOKEN)).await;
    app.fingerprint.transient_fetch_failures.store(usize::MAX, Ordering::SeqCst);
    app.start_worker();

    let id = upload_until_ready(&app, 11).await;
    app.wait_for_state(id, AnalysisState::Failed).await;

    // Default budget is five attempts
    let (_, json) = app.get(&format!("/analyses/{}", id)).await;
    assert_eq!(json["fetch_attempts"], 5);
    let last_error = json["last_error"].as_str().unwrap();
    assert!(last_error.contains("503"), "last_error: {}", last_error);
    assert!(last_error.contains("gave up after 5 attempts"), "last_error: {}", last_error);
    let (status, _) = app.get(&format!("/analyses/{}/report", id)).await;
    assert_eq!(status, StatusCode::CONFLICT);

    // Permanent errors are not retried: one attempt after the reset
    app.fingerprint.reject_fetches.store(true, Ordering::SeqCst);
    let (status, _) = app.post_json(&format!("/analyses/{}/retry", id), json!({})).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    app.wait_for_state(id, AnalysisState::Failed).await;

    let (_, json) = app.get(&format!("/analyses/{}", id)).await;
    assert_eq!(json["fetch_attempts"], 1);
    assert_eq!(json["last_error"], "ACRCloud rejected credentials");
    assert_eq!(app.fingerprint.fetches.load(Ordering::SeqCst), 6);

    // Healthy upstream: the next retry completes
    app.fingerprint.reject_fetches.store(false, Ordering::SeqCst);
    app.fingerprint.transient_fetch_failures.store(0, Ordering::SeqCst);
    let (status, _) = app.post_json(&format!("/analyses/{}/retry", id), json!({})).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    app.wait_for_state(id, AnalysisState::Completed).await;
    let (_, json) = app.get(&format!("/analyses/{}", id)).await;
    assert_eq!(json["fetch_attempts"], 1);
}

#[tokio::test]
async fn test_report_hidden_unless_completed() {
    let mut app = TestApp::new(Some(WEBHOOK_TOKEN)).await;
    app.fingerprint.fail_uploads.store(true, Ordering::SeqCst);
    app.start_worker();

    let (_, json) = app.upload("orphan.mp3", &mp3_bytes(12)).await;
    let id = analysis_id(&json);
    app.wait_for_state(id, AnalysisState::Failed).await;

    // Report row left behind by a fetch that lost to a failure
    let report = AnalysisReport::from_matches(Vec::new(), 80.0);
    reports::save_report(&app.state.db, id, &report, &json!({}))
        .await
        .unwrap();

    let (status, json) = app.get(&format!("/analyses/{}/report", id)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["error"]["code"], "CONFLICT");

    let (_, summary) = app.get("/reports/analyses/summary").await;
    assert_eq!(summary["by_state"]["failed"], 1);
    assert_eq!(summary["by_verdict"], json!({}));
}

#[tokio::test]
async fn test_submit_failure_and_retry() {
    let mut app = TestApp::new(Some(WEBHOOK_TOKEN)).await;
    app.fingerprint.fail_uploads.store(true, Ordering::SeqCst);
    app.start_worker();

    let (_, json) = app.upload("denied.mp3", &mp3_bytes(5)).await;
    let id = analysis_id(&json);
    app.wait_for_state(id, AnalysisState::Failed).await;

    let (status, _) = app.post_json(&format!("/analyses/{}/retry", id), json!({})).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    // Fails again, nothing changed upstream
    app.wait_for_state(id, AnalysisState::Failed).await;

    app.fingerprint.fail_uploads.store(false, Ordering::SeqCst);
    let (status, _) = app.post_json(&format!("/analyses/{}/retry", id), json!({})).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    app.wait_for_state(id, AnalysisState::Submitted).await;
}

#[tokio::test]
async fn test_retry_requires_failed_state() {
    let app = TestApp::new(Some(WEBHOOK_TOKEN)).await;

    let (_, json) = app.upload("fresh.mp3", &mp3_bytes(6)).await;
    let id = analysis_id(&json);

    let (status, json) = app.post_json(&format!("/analyses/{}/retry", id), json!({})).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["error"]["code"], "CONFLICT");

    let (status, _) = app
        .post_json(&format!("/analyses/{}/retry", Uuid::new_v4()), json!({}))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_webhook_authentication_and_validation() {
    let app = TestApp::new(Some(WEBHOOK_TOKEN)).await;

    let (status, _) = app
        .post_json("/webhooks/acrcloud", json!({"file_id": "x", "state": 1}))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app
        .post_json("/webhooks/acrcloud?token=wrong", json!({"file_id": "x", "state": 1}))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app.callback(json!({"state": 1})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app
        .send(
            Request::builder()
                .method("POST")
                .uri(format!("/webhooks/acrcloud?token={}", WEBHOOK_TOKEN))
                .body(Body::from("not json"))
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, ack) = app.callback(json!({"file_id": "unknown", "state": 1})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["outcome"], "pending");
}

#[tokio::test]
async fn test_webhook_rejected_without_configured_token() {
    let app = TestApp::new(None).await;

    let (status, _) = app.callback(json!({"file_id": "x", "state": 1})).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_list_analyses_filter() {
    let app = TestApp::new(Some(WEBHOOK_TOKEN)).await;
    app.upload("one.mp3", &mp3_bytes(7)).await;
    app.upload("two.mp3", &mp3_bytes(8)).await;

    let (status, json) = app.get("/analyses?state=uploaded").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json.as_array().unwrap().len(), 2);

    let (_, json) = app.get("/analyses?state=completed").await;
    assert!(json.as_array().unwrap().is_empty());

    let (status, _) = app.get("/analyses?state=bogus").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app.get(&format!("/analyses/{}", Uuid::new_v4())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

async fn create_chart(app: &TestApp) -> String {
    let (status, json) = app
        .post_json(
            "/charts",
            json!({"slug": "global-top", "name": "Global Top", "country_code": "gb"}),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(json["country_code"], "GB");
    json["chart_id"].as_str().unwrap().to_string()
}

async fn wait_for_run(app: &TestApp, run_id: &str) -> Value {
    for _ in 0..250 {
        let (_, run) = app.get(&format!("/cascade/{}", run_id)).await;
        if run["state"] != "running" {
            return run;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("cascade run {} never finished", run_id);
}

#[tokio::test]
async fn test_chart_validation() {
    let app = TestApp::new(Some(WEBHOOK_TOKEN)).await;
    create_chart(&app).await;

    let (status, _) = app
        .post_json("/charts", json!({"slug": "global-top", "name": "Again"}))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = app.post_json("/charts", json!({"slug": " ", "name": "x"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Slugs end up in upstream request paths
    for slug in ["x/../../artist/abc?y=", "top 50", "a%2Fb"] {
        let (status, json) = app.post_json("/charts", json!({"slug": slug, "name": "x"})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "slug {:?}", slug);
        assert_eq!(json["error"]["code"], "BAD_REQUEST");
    }
    let (_, charts) = app.get("/charts").await;
    assert_eq!(charts.as_array().unwrap().len(), 1);

    let (status, _) = app
        .post_json(&format!("/charts/{}/fetch", Uuid::new_v4()), json!({}))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = app.get(&format!("/cascade/{}", Uuid::new_v4())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_full_cascade_and_reports() {
    let mut app = TestApp::new(Some(WEBHOOK_TOKEN)).await;
    app.start_worker();
    let chart_id = create_chart(&app).await;

    let (status, run) = app
        .post_json(&format!("/charts/{}/fetch", chart_id), json!({}))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(run["stop_after"], "audience");

    let run = wait_for_run(&app, run["run_id"].as_str().unwrap()).await;
    assert_eq!(run["state"], "completed");
    assert_eq!(run["counters"]["entries"], 2);
    assert_eq!(run["counters"]["tracks_fetched"], 2);
    assert_eq!(run["counters"]["artists_fetched"], 1);
    assert_eq!(run["counters"]["audience_snapshots"], 1);

    let (_, json) = app.get(&format!("/charts/{}/entries", chart_id)).await;
    let entries = json["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["track_uuid"], "s1");

    let (_, tracks) = app.get("/tracks?q=Song").await;
    assert_eq!(tracks.as_array().unwrap().len(), 2);
    let (_, track) = app.get("/tracks/s1").await;
    assert_eq!(track["artists"][0]["artist_uuid"], "a1");
    let (status, _) = app.get("/tracks/missing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, artist) = app.get("/artists/a1").await;
    assert_eq!(artist["country_code"], "SE");
    assert_eq!(artist["audience"][0]["follower_count"], 1500);

    let (_, movers) = app.get(&format!("/reports/charts/{}/movers", chart_id)).await;
    assert_eq!(movers["gainers"][0]["track_uuid"], "s1");
    assert_eq!(movers["losers"][0]["track_uuid"], "s2");

    let (_, top) = app.get("/reports/artists/top").await;
    assert_eq!(top[0]["artist_uuid"], "a1");
    assert_eq!(top[0]["appearances"], 2);
    assert_eq!(top[0]["latest_follower_count"], 1500);

    let (_, runs) = app.get(&format!("/charts/{}/runs", chart_id)).await;
    assert_eq!(runs.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_cascade_stop_after_chart() {
    let mut app = TestApp::new(Some(WEBHOOK_TOKEN)).await;
    app.start_worker();
    let chart_id = create_chart(&app).await;

    let (status, run) = app
        .post_json(&format!("/charts/{}/fetch?stop_after=chart", chart_id), json!({}))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let run = wait_for_run(&app, run["run_id"].as_str().unwrap()).await;
    assert_eq!(run["state"], "completed");
    assert_eq!(run["counters"]["entries"], 2);
    assert_eq!(run["counters"]["tracks_fetched"], 0);
}

#[tokio::test]
async fn test_fetch_conflicts_with_running_run() {
    // No worker: the first run stays `running`
    let app = TestApp::new(Some(WEBHOOK_TOKEN)).await;
    let chart_id = create_chart(&app).await;

    let (status, _) = app
        .post_json(&format!("/charts/{}/fetch", chart_id), json!({}))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, _) = app
        .post_json(&format!("/charts/{}/fetch", chart_id), json!({}))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = app
        .send(
            Request::builder()
                .method("DELETE")
                .uri(format!("/charts/{}", chart_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_concurrent_fetches_start_one_run() {
    // No worker: whichever run wins stays `running`
    let app = TestApp::new(Some(WEBHOOK_TOKEN)).await;
    let chart_id = create_chart(&app).await;
    let uri = format!("/charts/{}/fetch", chart_id);

    let (first, second) = tokio::join!(
        app.post_json(&uri, json!({})),
        app.post_json(&uri, json!({}))
    );
    let mut statuses = [first.0, second.0];
    statuses.sort();
    assert_eq!(statuses, [StatusCode::ACCEPTED, StatusCode::CONFLICT]);

    let (_, runs) = app.get(&format!("/charts/{}/runs", chart_id)).await;
    let running = runs
        .as_array()
        .unwrap()
        .iter()
        .filter(|run| run["state"] == "running")
        .count();
    assert_eq!(running, 1);
}

#[tokio::test]
async fn test_concurrent_chart_creates_conflict() {
    let app = TestApp::new(Some(WEBHOOK_TOKEN)).await;
    let body = json!({"slug": "weekly-top", "name": "Weekly"});

    let (first, second) = tokio::join!(
        app.post_json("/charts", body.clone()),
        app.post_json("/charts", body)
    );
    let mut statuses = [first.0, second.0];
    statuses.sort();
    assert_eq!(statuses, [StatusCode::CREATED, StatusCode::CONFLICT]);

    let loser = if first.0 == StatusCode::CONFLICT { first.1 } else { second.1 };
    assert_eq!(loser["error"]["code"], "CONFLICT");
}

#[tokio::test]
async fn test_analyses_summary() {
    let app = TestApp::new(Some(WEBHOOK_TOKEN)).await;
    app.upload("a.mp3", &mp3_bytes(9)).await;

    let (status, json) = app.get("/reports/analyses/summary").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["total"], 1);
    assert_eq!(json["by_state"]["uploaded"], 1);
}
