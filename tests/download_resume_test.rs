//! End-to-end resumable-download test (testable property 6 / scenario S4):
//! restarting a transfer mid-flight and resuming it must yield a final file
//! byte-identical (by SHA-256) to one fetched in a single uninterrupted pass.
//!
//! A tiny in-process axum server stands in for the Kiwix mirror so the test
//! doesn't depend on network access; it honors `Range: bytes=N-` the same
//! way a real static file server would.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use sha2::{Digest, Sha256};

const FIXTURE_SIZE: usize = 2 * 1024 * 1024;

fn fixture_bytes() -> Vec<u8> {
    (0..FIXTURE_SIZE).map(|i| (i % 251) as u8).collect()
}

async fn serve_file(State(body): State<Arc<Vec<u8>>>, headers: HeaderMap) -> Response {
    let total = body.len() as u64;
    if let Some(range) = headers.get(header::RANGE).and_then(|v| v.to_str().ok()) {
        if let Some(start) = range.strip_prefix("bytes=").and_then(|s| s.strip_suffix('-')) {
            if let Ok(start) = start.parse::<u64>() {
                if start <= total {
                    let slice = body[start as usize..].to_vec();
                    return (
                        StatusCode::PARTIAL_CONTENT,
                        [
                            (header::CONTENT_RANGE, format!("bytes {start}-{}/{total}", total.saturating_sub(1))),
                            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
                        ],
                        slice,
                    )
                        .into_response();
                }
            }
        }
    }
    (StatusCode::OK, [(header::CONTENT_TYPE, "application/octet-stream".to_string())], body.as_ref().clone())
        .into_response()
}

async fn spawn_fixture_server(body: Vec<u8>) -> SocketAddr {
    let shared = Arc::new(body);
    let app = Router::new().route("/fixture.zim", get(serve_file)).with_state(shared);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn wait_for_state(
    downloads: &zimi::download::DownloadManager,
    slug: &str,
    want: zimi::types::DownloadState,
) {
    for _ in 0..200 {
        if let Some(record) = downloads.get(slug) {
            if record.state == want {
                return;
            }
            if matches!(record.state, zimi::types::DownloadState::Failed) {
                panic!("download failed: {:?}", record.error);
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {slug} to reach {want:?}");
}

#[tokio::test]
async fn resumed_download_matches_uninterrupted_fixture_hash() {
    let fixture = fixture_bytes();
    let mut hasher = Sha256::new();
    hasher.update(&fixture);
    let expected_hash = hasher.finalize();

    let addr = spawn_fixture_server(fixture.clone()).await;
    let url = format!("http://{addr}/fixture.zim");

    let dir = tempfile::tempdir().unwrap();
    let config = zimi::config::Config {
        archive_dir: dir.path().to_path_buf(),
        data_dir: dir.path().join(".zimi"),
        manage_enabled: true,
        manage_password: None,
        auto_update: false,
        auto_update_freq: zimi::config::UpdateFrequency::Weekly,
        rate_limit: 0,
        port: 0,
    };
    let ctx = zimi::build_app(config).await.unwrap();

    // Simulate "kill the server after >=1MB and restart": pre-write a
    // partial `.tmp` file before the manager's task ever starts, so the
    // very first transfer attempt is already a resume.
    let partial = &fixture[..1_500_000];
    tokio::fs::write(dir.path().join("fixture.zim.tmp"), partial).await.unwrap();

    ctx.downloads
        .start("fixture".to_string(), url, "fixture.zim".to_string(), Some(fixture.len() as u64), zimi::types::DownloadKind::New)
        .unwrap();

    wait_for_state(&ctx.downloads, "fixture", zimi::types::DownloadState::Complete).await;

    let final_bytes = tokio::fs::read(dir.path().join("fixture.zim")).await.unwrap();
    let mut hasher = Sha256::new();
    hasher.update(&final_bytes);
    assert_eq!(hasher.finalize(), expected_hash);

    // The synthetic fixture isn't a parseable ZIM container, so the registry
    // refresh inside `finalize` logs it as corrupt and skips it — it never
    // reaches `summary.opened`, and no history event is appended for it.
    // A real-archive history-event check belongs in a test with a genuine
    // `.zim` fixture; this test's job is the byte-for-byte resume guarantee.
    assert!(ctx.state.history().is_empty());
}
