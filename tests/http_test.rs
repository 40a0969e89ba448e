//! In-process integration tests for the HTTP surface, driven through
//! `tower::ServiceExt::oneshot` rather than a bound TCP listener, as
//! described for test tooling in the design notes.

use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use zimi::config::{Config, UpdateFrequency};

const TEST_IP: SocketAddr = SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::new(127, 0, 0, 1)), 0);

fn test_config(archive_dir: &std::path::Path, rate_limit: u32, manage_password: Option<&str>) -> Config {
    Config {
        archive_dir: archive_dir.to_path_buf(),
        data_dir: archive_dir.join(".zimi"),
        manage_enabled: true,
        manage_password: manage_password.map(str::to_string),
        auto_update: false,
        auto_update_freq: UpdateFrequency::Weekly,
        rate_limit,
        port: 0,
    }
}

/// Adds the `ConnectInfo` extension routes under the `public` sub-router
/// expect, since tests drive the app via `oneshot` instead of
/// `into_make_service_with_connect_info`.
fn with_connect_info(request: Request<Body>) -> Request<Body> {
    let mut request = request;
    request.extensions_mut().insert(ConnectInfo(TEST_IP));
    request
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
}

#[tokio::test]
async fn health_endpoint_reports_ok() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), 60, None);
    let ctx = zimi::build_app(config).await.unwrap();
    let app = zimi::http::build_router(ctx);

    let response = app.oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["ok"], true);
}

#[tokio::test]
async fn search_rejects_empty_query() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), 60, None);
    let ctx = zimi::build_app(config).await.unwrap();
    let app = zimi::http::build_router(ctx);

    let request = with_connect_info(Request::builder().uri("/search?q=").body(Body::empty()).unwrap());
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn list_returns_empty_archive_set_for_fresh_archive_dir() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), 60, None);
    let ctx = zimi::build_app(config).await.unwrap();
    let app = zimi::http::build_router(ctx);

    let request = with_connect_info(Request::builder().uri("/list").body(Body::empty()).unwrap());
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body.as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn manage_status_is_open_when_no_password_configured() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), 60, None);
    let ctx = zimi::build_app(config).await.unwrap();
    let app = zimi::http::build_router(ctx);

    let response = app
        .oneshot(Request::builder().uri("/manage/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["password_set"], false);
}

#[tokio::test]
async fn manage_routes_require_bearer_password_when_set() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), 60, Some("hunter2"));
    let ctx = zimi::build_app(config).await.unwrap();
    let app = zimi::http::build_router(ctx);

    let unauthenticated =
        app.clone().oneshot(Request::builder().uri("/manage/status").body(Body::empty()).unwrap()).await.unwrap();
    assert_eq!(unauthenticated.status(), StatusCode::UNAUTHORIZED);

    let wrong_password = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/manage/status")
                .header("Authorization", "Bearer wrong")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(wrong_password.status(), StatusCode::UNAUTHORIZED);

    let authenticated = app
        .oneshot(
            Request::builder()
                .uri("/manage/status")
                .header("Authorization", "Bearer hunter2")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(authenticated.status(), StatusCode::OK);
}

#[tokio::test]
async fn collections_reads_are_open_but_writes_require_password() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), 60, Some("hunter2"));
    let ctx = zimi::build_app(config).await.unwrap();
    let app = zimi::http::build_router(ctx);

    let get_without_auth = app
        .clone()
        .oneshot(with_connect_info(Request::builder().uri("/collections").body(Body::empty()).unwrap()))
        .await
        .unwrap();
    assert_eq!(get_without_auth.status(), StatusCode::OK);

    let put_without_auth = app
        .clone()
        .oneshot(with_connect_info(
            Request::builder()
                .method("POST")
                .uri("/collections")
                .header("Content-Type", "application/json")
                .body(Body::from(r#"{"name":"favorites","archive_ids":["wikipedia_en_all_mini"]}"#))
                .unwrap(),
        ))
        .await
        .unwrap();
    assert_eq!(put_without_auth.status(), StatusCode::UNAUTHORIZED);

    let put_with_auth = app
        .clone()
        .oneshot(with_connect_info(
            Request::builder()
                .method("POST")
                .uri("/collections")
                .header("Content-Type", "application/json")
                .header("Authorization", "Bearer hunter2")
                .body(Body::from(r#"{"name":"favorites","archive_ids":["wikipedia_en_all_mini"]}"#))
                .unwrap(),
        ))
        .await
        .unwrap();
    assert_eq!(put_with_auth.status(), StatusCode::OK);

    let get_one = app
        .oneshot(with_connect_info(
            Request::builder().uri("/collections?name=favorites").body(Body::empty()).unwrap(),
        ))
        .await
        .unwrap();
    assert_eq!(get_one.status(), StatusCode::OK);
    let body = json_body(get_one).await;
    assert_eq!(body.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn rate_limit_blocks_the_request_after_the_configured_ceiling() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), 1, None);
    let ctx = zimi::build_app(config).await.unwrap();
    let app = zimi::http::build_router(ctx);

    let first = app
        .clone()
        .oneshot(with_connect_info(Request::builder().uri("/list").body(Body::empty()).unwrap()))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = app
        .oneshot(with_connect_info(Request::builder().uri("/list").body(Body::empty()).unwrap()))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(second.headers().contains_key("Retry-After"));
}

#[tokio::test]
async fn manage_download_rejects_a_second_concurrent_request_for_the_same_slug() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), 60, None);
    let ctx = zimi::build_app(config).await.unwrap();
    let downloads = ctx.downloads.clone();

    // Unreachable URL: the transfer will fail quickly, but the task is
    // inserted into the registry synchronously before any network I/O
    // happens, so the conflict check below is deterministic.
    let first = downloads.start(
        "test-slug".to_string(),
        "http://127.0.0.1:0/unreachable.zim".to_string(),
        "test-slug.zim".to_string(),
        None,
        zimi::types::DownloadKind::New,
    );
    assert!(first.is_ok());

    let second = downloads.start(
        "test-slug".to_string(),
        "http://127.0.0.1:0/unreachable.zim".to_string(),
        "test-slug.zim".to_string(),
        None,
        zimi::types::DownloadKind::New,
    );
    assert!(matches!(second, Err(zimi::error::AppError::Conflict(_))));
}
