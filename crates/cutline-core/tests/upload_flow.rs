//! End-to-end tests of the resumable upload protocol against a mock server.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::json;
use tokio::sync::mpsc;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use cutline_core::api::ApiClient;
use cutline_core::error::ClientErrorKind;
use cutline_core::upload::{
    UploadCoordinator, UploadEvent, UploadSource, UploadStatus, UploadTask,
};

const CHUNK: u64 = 4 * 1024;

fn source(name: &str, size: usize) -> UploadSource {
    UploadSource {
        name: name.to_string(),
        size: size as u64,
        mime_type: "video/mp4".to_string(),
        last_modified: Some(1_700_000_000_000),
        bytes: vec![0x42; size].into(),
    }
}

fn task_for(src: &UploadSource) -> UploadTask {
    UploadTask {
        name: src.name.clone(),
        size: src.size,
        status: UploadStatus::Initializing,
        confirmed: 0,
        upload_id: None,
    }
}

/// Responds to `media/init` with a fresh upload id and server-side
/// chunking parameters derived from the declared file size.
struct InitResponder {
    counter: AtomicUsize,
}

impl Respond for InitResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
        let size = body["size"].as_u64().unwrap();
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        ResponseTemplate::new(200).set_body_json(json!({
            "upload_id": format!("u{n}"),
            "chunk_size": CHUNK,
            "total_chunks": size.div_ceil(CHUNK).max(1),
        }))
    }
}

async fn mock_upload_endpoints(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/api/sessions/s1/media/init"))
        .respond_with(InitResponder { counter: AtomicUsize::new(0) })
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path_regex(r"^/api/sessions/s1/media/u\d+/chunk$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path_regex(r"^/api/sessions/s1/media/u\d+/complete$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "media": {"id": "m1", "name": "clip.mp4", "kind": "video"},
            "pending_media": [{"id": "m1", "name": "clip.mp4", "kind": "video"}],
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn batch_sends_expected_chunk_counts_and_reaches_full_progress() {
    let server = MockServer::start().await;
    mock_upload_endpoints(&server).await;

    let api = ApiClient::new(&server.uri());
    let coordinator = UploadCoordinator::new(api, "s1".to_string(), None);

    // Scaled copy of the reference scenario: 10 + 5 + 1 units with a
    // 4-unit chunk size must produce 3 + 2 + 1 chunk calls.
    let sources = vec![
        source("a.mp4", 10 * CHUNK as usize / 4),
        source("b.mp4", 5 * CHUNK as usize / 4),
        source("c.mp4", CHUNK as usize / 4),
    ];

    let (tx, mut rx) = mpsc::unbounded_channel();
    coordinator.run_batch(sources, tx).await;

    // Count chunk requests per upload id.
    let requests = server.received_requests().await.unwrap();
    let chunk_count = |upload_id: &str| {
        requests
            .iter()
            .filter(|r| r.url.path() == format!("/api/sessions/s1/media/{upload_id}/chunk"))
            .count()
    };
    assert_eq!(chunk_count("u1"), 3);
    assert_eq!(chunk_count("u2"), 2);
    assert_eq!(chunk_count("u3"), 1);

    // Aggregate progress is monotone and ends at exactly 100%.
    let mut last = 0.0;
    let mut final_fraction = 0.0;
    let mut completed_files = 0;
    let mut finished = None;
    while let Ok(ev) = rx.try_recv() {
        match ev {
            UploadEvent::Progress { fraction, .. } => {
                assert!(fraction >= last, "progress regressed: {fraction} < {last}");
                last = fraction;
                final_fraction = fraction;
            }
            UploadEvent::FileCompleted { .. } => completed_files += 1,
            UploadEvent::BatchFinished { failed } => finished = Some(failed),
        }
    }
    assert_eq!(completed_files, 3);
    assert!((final_fraction - 1.0).abs() < f64::EPSILON);
    assert!(finished.unwrap().is_none());
}

#[tokio::test]
async fn chunk_failure_cancels_the_upload_server_side() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/sessions/s1/media/init"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "upload_id": "u1",
            "chunk_size": CHUNK,
            "total_chunks": 2,
        })))
        .mount(&server)
        .await;

    // First chunk is accepted, the second blows up.
    Mock::given(method("POST"))
        .and(path("/api/sessions/s1/media/u1/chunk"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/sessions/s1/media/u1/chunk"))
        .respond_with(
            ResponseTemplate::new(500).set_body_json(json!({"detail": "disk full"})),
        )
        .mount(&server)
        .await;

    // The partial upload must be cleaned up, never left as an orphan.
    Mock::given(method("POST"))
        .and(path("/api/sessions/s1/media/u1/cancel"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .expect(1)
        .mount(&server)
        .await;

    let api = ApiClient::new(&server.uri());
    let coordinator = UploadCoordinator::new(api, "s1".to_string(), None);
    let src = source("a.mp4", 2 * CHUNK as usize);
    let mut task = task_for(&src);

    let err = coordinator.upload_file(&src, &mut task, |_| {}).await.unwrap_err();
    assert_eq!(err.message, "disk full");
    assert_eq!(task.status, UploadStatus::Failed);
    // Only the acknowledged chunk counts toward confirmed bytes.
    assert_eq!(task.confirmed, CHUNK);

    server.verify().await;
}

#[tokio::test]
async fn confirmed_bytes_are_bounded_by_declared_size() {
    let server = MockServer::start().await;
    mock_upload_endpoints(&server).await;

    let api = ApiClient::new(&server.uri());
    let coordinator = UploadCoordinator::new(api, "s1".to_string(), None);

    // A file that does not divide evenly into chunks.
    let src = source("odd.mp4", CHUNK as usize + 123);
    let mut task = task_for(&src);
    let mut observed = Vec::new();

    coordinator
        .upload_file(&src, &mut task, |confirmed| observed.push(confirmed))
        .await
        .unwrap();

    assert_eq!(task.status, UploadStatus::Completed);
    assert_eq!(observed.last().copied(), Some(src.size));
    assert!(observed.iter().all(|c| *c <= src.size));
    assert!(observed.windows(2).all(|w| w[0] <= w[1]));
}

#[tokio::test]
async fn rate_limited_init_surfaces_retry_after() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/sessions/s1/media/init"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "detail": "Too Many Requests",
            "retry_after": 3,
        })))
        .mount(&server)
        .await;

    let api = ApiClient::new(&server.uri());
    let coordinator = UploadCoordinator::new(api, "s1".to_string(), None);
    let src = source("a.mp4", 10);
    let mut task = task_for(&src);

    let err = coordinator.upload_file(&src, &mut task, |_| {}).await.unwrap_err();
    assert_eq!(err.kind, ClientErrorKind::HttpStatus);
    assert_eq!(err.retry_after, Some(3));
    assert_eq!(err.to_string(), "Too Many Requests (retry after 3s)");
}

#[tokio::test]
async fn session_acquisition_falls_back_when_the_stored_session_is_gone() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/sessions/stale"))
        .respond_with(
            ResponseTemplate::new(404).set_body_json(json!({"detail": "session not found"})),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/sessions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "session_id": "fresh",
            "lang": "en",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let api = ApiClient::new(&server.uri());
    let snapshot = cutline_core::client::acquire_session(&api, Some("stale")).await.unwrap();
    assert_eq!(snapshot.session_id, "fresh");

    server.verify().await;
}
