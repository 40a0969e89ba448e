//! HTTP surface (component H) — router, middleware, and every handler
//! named in the external interfaces table.
//!
//! Handlers are thin: they parse query/body, call into A-G, and shape the
//! response. All shared state is dependency-injected through [`AppContext`]
//! — nothing here reaches for a global.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::archive::ArchiveRegistry;
use crate::cache::Caches;
use crate::config::Config;
use crate::download::{CatalogEntry, DownloadManager};
use crate::error::{AppError, AppResult};
use crate::indexer::{Indexer, TitleIndexMap};
use crate::metrics::{Metrics, StatsSnapshot};
use crate::ratelimit::RateLimiter;
use crate::reader::Reader;
use crate::search::{SearchEngine, SearchOpts, SearchResponse};
use crate::state::PersistentState;
use crate::types::{ArchiveRecord, Collections, DownloadKind, DownloadRecord, HistoryKind};

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    pub registry: Arc<ArchiveRegistry>,
    pub indexer: Arc<Indexer>,
    pub search: Arc<SearchEngine>,
    pub reader: Arc<Reader>,
    pub downloads: Arc<DownloadManager>,
    pub state: Arc<PersistentState>,
    pub caches: Caches,
    pub rate_limiter: Arc<RateLimiter>,
    pub metrics: Arc<Metrics>,
    pub title_indexes: TitleIndexMap,
}

pub fn build_router(ctx: AppContext) -> Router {
    let public = Router::new()
        .route("/search", get(search))
        .route("/suggest", get(suggest))
        .route("/read", get(read))
        .route("/snippet", get(snippet))
        .route("/random", get(random))
        .route("/list", get(list))
        .route("/catalog", get(catalog))
        .route("/resolve", get(resolve_get).post(resolve_post))
        .route(
            "/collections",
            get(collections_get)
                .post(collections_put)
                .delete(collections_delete)
                .route_layer(middleware::from_fn_with_state(ctx.clone(), guard_mutating_collections)),
        )
        .route("/w/{zim}/{*path}", get(raw_entry))
        .layer(middleware::from_fn_with_state(ctx.clone(), rate_limit));

    let manage = Router::new()
        .route("/manage/status", get(manage_status))
        .route("/manage/catalog", get(catalog))
        .route("/manage/check-updates", get(manage_check_updates))
        .route("/manage/downloads", get(manage_downloads))
        .route("/manage/download", post(manage_download))
        .route("/manage/update", post(manage_update))
        .route("/manage/delete", post(manage_delete))
        .route("/manage/cancel", post(manage_cancel))
        .route("/manage/refresh", post(manage_refresh))
        .route("/manage/stats", get(manage_stats))
        .route("/manage/build-fts", post(manage_build_fts))
        .route("/manage/auto-update", post(manage_auto_update))
        .layer(middleware::from_fn_with_state(ctx.clone(), require_manage_auth));

    let health = Router::new().route("/health", get(health));

    Router::new()
        .merge(health)
        .merge(public)
        .merge(manage)
        .layer(middleware::from_fn_with_state(ctx.clone(), record_metrics))
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

// ---------------------------------------------------------------------------
// middleware
// ---------------------------------------------------------------------------

async fn rate_limit(
    State(ctx): State<AppContext>,
    ConnectInfo(addr): ConnectInfo<std::net::SocketAddr>,
    request: axum::extract::Request,
    next: Next,
) -> Result<Response, AppError> {
    let decision = ctx.rate_limiter.check(addr.ip());
    if !decision.allowed {
        return Err(AppError::RateLimited { retry_after_secs: decision.retry_after_secs });
    }
    Ok(next.run(request).await)
}

async fn record_metrics(
    State(ctx): State<AppContext>,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    let route = request.uri().path().to_string();
    let started = Instant::now();
    let response = next.run(request).await;
    ctx.metrics.record(&route, started.elapsed());
    response
}

fn check_manage_password(ctx: &AppContext, headers: &HeaderMap) -> AppResult<()> {
    if !ctx.state.is_password_set() {
        return Ok(());
    }
    let candidate = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match candidate {
        Some(pw) if ctx.state.verify_password(pw) => Ok(()),
        _ => Err(AppError::Unauthorized),
    }
}

async fn require_manage_auth(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Result<Response, AppError> {
    check_manage_password(&ctx, &headers)?;
    Ok(next.run(request).await)
}

/// Only `/collections` writes require the shared password; reads stay open
/// like every other public endpoint.
async fn guard_mutating_collections(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Result<Response, AppError> {
    if matches!(*request.method(), Method::POST | Method::DELETE) {
        check_manage_password(&ctx, &headers)?;
    }
    Ok(next.run(request).await)
}

// ---------------------------------------------------------------------------
// health
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    version: &'static str,
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse { ok: true, version: env!("CARGO_PKG_VERSION") })
}

// ---------------------------------------------------------------------------
// search / suggest
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SearchQuery {
    q: String,
    limit: Option<usize>,
    zim: Option<String>,
    collection: Option<String>,
    fast: Option<String>,
    timeout_ms: Option<u64>,
    include_snippets: Option<String>,
}

/// Query-string booleans arrive as `1`/`0`/`true`/`false` depending on the
/// caller; `Option<bool>` via `serde_urlencoded` only accepts the latter, so
/// every boolean query flag is parsed through this instead.
fn truthy(value: &Option<String>) -> bool {
    matches!(value.as_deref(), Some("1") | Some("true") | Some("yes"))
}

async fn search(
    State(ctx): State<AppContext>,
    Query(q): Query<SearchQuery>,
) -> AppResult<Json<SearchResponse>> {
    if q.q.trim().is_empty() {
        return Err(AppError::BadRequest("q must not be empty".into()));
    }
    let opts = SearchOpts {
        limit: q.limit.unwrap_or(10).min(200),
        scope: crate::archive::ArchiveScope::parse(q.zim.as_deref(), q.collection.as_deref()),
        fast: truthy(&q.fast),
        timeout_ms: q.timeout_ms,
        include_snippets: truthy(&q.include_snippets),
    };
    let collections = ctx.state.collections();
    let mut response = ctx.search.search(&q.q, opts.clone(), &collections).await?;
    if opts.include_snippets {
        for result in &mut response.results {
            if let Ok(snippet) = ctx.reader.snippet(&result.archive, &result.path).await {
                result.snippet = Some(snippet);
            }
            result.thumbnail_url = ctx.reader.thumbnail_url(&result.archive, &result.path);
        }
    }
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
struct SuggestQuery {
    q: String,
    limit: Option<usize>,
    zim: Option<String>,
    collection: Option<String>,
}

#[derive(Serialize)]
struct SuggestResponse {
    results: Vec<crate::types::SearchResultRecord>,
}

async fn suggest(
    State(ctx): State<AppContext>,
    Query(q): Query<SuggestQuery>,
) -> AppResult<Json<SuggestResponse>> {
    let limit = q.limit.unwrap_or(10).min(100);
    let collections = ctx.state.collections();
    let scope = crate::archive::ArchiveScope::parse(q.zim.as_deref(), q.collection.as_deref());
    let archive_ids = ctx.registry.ids_in_scope(&scope, &collections);
    let prefix_lower = crate::titleindex::fold_title(&q.q);

    let mut results = Vec::new();
    for archive_id in archive_ids {
        if let Some(cached) = ctx.caches.suggestions.get(&archive_id, &prefix_lower) {
            ctx.metrics.record_cache(true);
            results.extend(cached);
            continue;
        }
        ctx.metrics.record_cache(false);
        let Some(index) = ctx.title_indexes.get(&archive_id).map(|e| e.clone()) else { continue };
        let Ok(archive) = ctx.registry.get(&archive_id) else { continue };
        let _guard = archive.title_lock.read().await;
        let hits = index.prefix(&prefix_lower, limit).await.unwrap_or_default();
        let records: Vec<_> = hits
            .into_iter()
            .map(|h| crate::types::SearchResultRecord {
                archive: archive_id.clone(),
                path: h.path,
                title: h.title,
                kind: h.kind,
                score: 1.0,
                snippet: None,
                thumbnail_url: None,
                source_rank: archive.source_rank,
            })
            .collect();
        ctx.caches.suggestions.put(&archive_id, prefix_lower.clone(), records.clone());
        results.extend(records);
    }

    results.sort_by(|a, b| a.title.len().cmp(&b.title.len()).then_with(|| a.title.cmp(&b.title)));
    results.dedup_by(|a, b| a.archive == b.archive && a.path == b.path);
    results.truncate(limit);
    Ok(Json(SuggestResponse { results }))
}

// ---------------------------------------------------------------------------
// read / snippet / random
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ReadQuery {
    zim: String,
    path: String,
    max_length: Option<usize>,
}

async fn read(
    State(ctx): State<AppContext>,
    Query(q): Query<ReadQuery>,
) -> AppResult<Json<crate::reader::ReadResult>> {
    let result = ctx.reader.read(&q.zim, &q.path, q.max_length.unwrap_or(20_000)).await?;
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
struct SnippetQuery {
    zim: String,
    path: String,
}

#[derive(Serialize)]
struct SnippetResponse {
    snippet: String,
}

async fn snippet(
    State(ctx): State<AppContext>,
    Query(q): Query<SnippetQuery>,
) -> AppResult<Json<SnippetResponse>> {
    let snippet = ctx.reader.snippet(&q.zim, &q.path).await?;
    Ok(Json(SnippetResponse { snippet }))
}

#[derive(Debug, Deserialize)]
struct RandomQuery {
    zim: Option<String>,
}

#[derive(Serialize)]
struct RandomResponse {
    archive: String,
    path: String,
    title: String,
}

async fn random(
    State(ctx): State<AppContext>,
    Query(q): Query<RandomQuery>,
) -> AppResult<Json<RandomResponse>> {
    let archive_id = match q.zim {
        Some(id) => id,
        None => {
            let archives = ctx.registry.list();
            let pick = archives
                .get(rand::random::<usize>() % archives.len().max(1))
                .ok_or_else(|| AppError::NotFound("no archives installed".into()))?;
            pick.id.clone()
        }
    };
    let (path, title) = ctx.reader.random(&archive_id).await?;
    Ok(Json(RandomResponse { archive: archive_id, path, title }))
}

// ---------------------------------------------------------------------------
// list / catalog
// ---------------------------------------------------------------------------

async fn list(State(ctx): State<AppContext>) -> Json<Vec<ArchiveRecord>> {
    Json(ctx.registry.list().iter().map(|a| a.snapshot()).collect())
}

#[derive(Debug, Deserialize)]
struct CatalogQuery {
    zim: Option<String>,
}

async fn catalog(
    State(ctx): State<AppContext>,
    Query(q): Query<CatalogQuery>,
) -> AppResult<Json<Vec<CatalogEntry>>> {
    let entries = ctx.downloads.fetch_catalog(q.zim.as_deref()).await?;
    Ok(Json(entries))
}

// ---------------------------------------------------------------------------
// resolve
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ResolveQuery {
    url: String,
}

#[derive(Serialize)]
struct ResolveResponse {
    archive: Option<String>,
    path: Option<String>,
}

async fn resolve_get(
    State(ctx): State<AppContext>,
    Query(q): Query<ResolveQuery>,
) -> AppResult<Json<ResolveResponse>> {
    let resolved = ctx.reader.resolve(&q.url).await?;
    Ok(Json(match resolved {
        Some((archive, path)) => ResolveResponse { archive: Some(archive), path: Some(path) },
        None => ResolveResponse { archive: None, path: None },
    }))
}

#[derive(Debug, Deserialize)]
struct ResolveBatchBody {
    urls: Vec<String>,
}

#[derive(Serialize)]
struct ResolveBatchResponse {
    results: std::collections::HashMap<String, Option<(String, String)>>,
}

async fn resolve_post(
    State(ctx): State<AppContext>,
    Json(body): Json<ResolveBatchBody>,
) -> Json<ResolveBatchResponse> {
    let results = ctx.reader.resolve_batch(body.urls).await;
    Json(ResolveBatchResponse { results })
}

// ---------------------------------------------------------------------------
// collections
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CollectionsQuery {
    name: Option<String>,
}

async fn collections_get(
    State(ctx): State<AppContext>,
    Query(q): Query<CollectionsQuery>,
) -> AppResult<Json<serde_json::Value>> {
    match q.name {
        Some(name) => {
            let archives = ctx
                .state
                .get_collection(&name)
                .ok_or_else(|| AppError::NotFound(format!("no collection '{name}'")))?;
            Ok(Json(serde_json::json!(archives)))
        }
        None => {
            let Collections(map) = ctx.state.collections();
            Ok(Json(serde_json::json!(map)))
        }
    }
}

#[derive(Debug, Deserialize)]
struct CollectionPutBody {
    name: String,
    archive_ids: Vec<String>,
}

async fn collections_put(
    State(ctx): State<AppContext>,
    Json(body): Json<CollectionPutBody>,
) -> AppResult<StatusCode> {
    ctx.state.put_collection(body.name, body.archive_ids)?;
    ctx.caches.invalidate_all();
    Ok(StatusCode::OK)
}

async fn collections_delete(
    State(ctx): State<AppContext>,
    Query(q): Query<CollectionsQuery>,
) -> AppResult<StatusCode> {
    let name = q.name.ok_or_else(|| AppError::BadRequest("name is required".into()))?;
    let removed = ctx.state.delete_collection(&name)?;
    if !removed {
        return Err(AppError::NotFound(format!("no collection '{name}'")));
    }
    ctx.caches.invalidate_all();
    Ok(StatusCode::OK)
}

// ---------------------------------------------------------------------------
// raw entry / Range support
// ---------------------------------------------------------------------------

async fn raw_entry(
    State(ctx): State<AppContext>,
    Path((zim, path)): Path<(String, String)>,
    headers: HeaderMap,
) -> AppResult<Response> {
    let (bytes, mime) = ctx.reader.raw(&zim, &path).await?;
    let total = bytes.len() as u64;

    if let Some(range) = headers.get(header::RANGE).and_then(|v| v.to_str().ok()) {
        if let Some((start, end)) = parse_range(range, total) {
            let slice = bytes[start as usize..=end as usize].to_vec();
            let content_length = end - start + 1;
            let mut response = (
                StatusCode::PARTIAL_CONTENT,
                [
                    (header::CONTENT_TYPE, mime),
                    (header::CONTENT_RANGE, format!("bytes {start}-{end}/{total}")),
                    (header::ACCEPT_RANGES, "bytes".to_string()),
                ],
                slice,
            )
                .into_response();
            if let Ok(value) = header::HeaderValue::from_str(&content_length.to_string()) {
                response.headers_mut().insert(header::CONTENT_LENGTH, value);
            }
            return Ok(response);
        }
    }

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, mime), (header::ACCEPT_RANGES, "bytes".to_string())],
        bytes,
    )
        .into_response())
}

/// Parses a single-range `bytes=start-end` (or `bytes=start-`) request
/// header. Multi-range requests are not supported — the whole entity is
/// served instead, which every caller treats as a correct fallback.
fn parse_range(header_value: &str, total: u64) -> Option<(u64, u64)> {
    let spec = header_value.strip_prefix("bytes=")?;
    let (start_str, end_str) = spec.split_once('-')?;
    let start: u64 = start_str.parse().ok()?;
    let end: u64 = if end_str.is_empty() { total.saturating_sub(1) } else { end_str.parse().ok()? };
    if start > end || end >= total {
        return None;
    }
    Some((start, end.min(total.saturating_sub(1))))
}

// ---------------------------------------------------------------------------
// /manage/*
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ManageStatus {
    manage_enabled: bool,
    password_set: bool,
    auto_update: bool,
    rate_limit: u32,
    archives: usize,
    version: &'static str,
}

async fn manage_status(State(ctx): State<AppContext>) -> Json<ManageStatus> {
    Json(ManageStatus {
        manage_enabled: ctx.config.manage_enabled,
        password_set: ctx.state.is_password_set(),
        auto_update: ctx.config.auto_update,
        rate_limit: ctx.config.rate_limit,
        archives: ctx.registry.list().len(),
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn manage_check_updates(State(ctx): State<AppContext>) -> AppResult<Json<Vec<(String, String)>>> {
    Ok(Json(ctx.downloads.check_updates().await?))
}

async fn manage_downloads(State(ctx): State<AppContext>) -> Json<Vec<DownloadRecord>> {
    Json(ctx.downloads.list())
}

#[derive(Debug, Deserialize)]
struct DownloadBody {
    slug: String,
    url: String,
    target_filename: String,
    expected_size: Option<u64>,
}

async fn manage_download(
    State(ctx): State<AppContext>,
    Json(body): Json<DownloadBody>,
) -> AppResult<Json<DownloadRecord>> {
    let record = ctx.downloads.start(body.slug, body.url, body.target_filename, body.expected_size, DownloadKind::New)?;
    Ok(Json(record))
}

#[derive(Debug, Deserialize)]
struct UpdateBody {
    archive_id: String,
}

async fn manage_update(
    State(ctx): State<AppContext>,
    Json(body): Json<UpdateBody>,
) -> AppResult<Json<DownloadRecord>> {
    let updates = ctx.downloads.check_updates().await?;
    let (_, new_slug) = updates
        .into_iter()
        .find(|(old, _)| *old == body.archive_id)
        .ok_or_else(|| AppError::NotFound(format!("no update available for '{}'", body.archive_id)))?;
    let catalog = ctx.downloads.fetch_catalog(None).await.unwrap_or_default();
    let entry = catalog
        .into_iter()
        .find(|c| c.slug == new_slug)
        .ok_or_else(|| AppError::NotFound(format!("catalog entry '{new_slug}' vanished")))?;
    let filename = format!("{new_slug}.zim");
    let record = ctx.downloads.start(new_slug, entry.url, filename, entry.size, DownloadKind::Update)?;
    Ok(Json(record))
}

#[derive(Debug, Deserialize)]
struct DeleteBody {
    archive_id: String,
}

async fn manage_delete(
    State(ctx): State<AppContext>,
    Json(body): Json<DeleteBody>,
) -> AppResult<StatusCode> {
    let archive = ctx
        .registry
        .get(&body.archive_id)
        .map_err(|_| AppError::NotFound(format!("unknown archive '{}'", body.archive_id)))?;
    let snapshot = archive.snapshot();
    let path = archive.path.clone();
    tokio::fs::remove_file(&path).await.map_err(|e| AppError::Internal(format!("delete failed: {e}")))?;
    ctx.registry.remove(&body.archive_id);
    ctx.caches.invalidate_all();
    ctx.state.append_history(HistoryKind::Deleted, snapshot)?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
struct SlugBody {
    slug: String,
}

async fn manage_cancel(State(ctx): State<AppContext>, Json(body): Json<SlugBody>) -> AppResult<StatusCode> {
    ctx.downloads.cancel(&body.slug)?;
    Ok(StatusCode::OK)
}

async fn manage_refresh(State(ctx): State<AppContext>) -> AppResult<Json<serde_json::Value>> {
    let summary = ctx.registry.refresh().await?;
    ctx.indexer.sync().await;
    ctx.caches.invalidate_all();
    Ok(Json(serde_json::json!({
        "opened": summary.opened,
        "removed": summary.removed,
        "skipped": summary.skipped,
    })))
}

#[derive(Serialize)]
struct ManageStats {
    #[serde(flatten)]
    snapshot: StatsSnapshot,
    archives: usize,
}

async fn manage_stats(State(ctx): State<AppContext>) -> Json<ManageStats> {
    Json(ManageStats { snapshot: ctx.metrics.snapshot(), archives: ctx.registry.list().len() })
}

async fn manage_build_fts(
    State(ctx): State<AppContext>,
    Json(body): Json<SlugBody>,
) -> AppResult<StatusCode> {
    ctx.indexer.build_fts_on_demand(&body.slug).await?;
    Ok(StatusCode::OK)
}

async fn manage_auto_update(State(ctx): State<AppContext>) -> StatusCode {
    ctx.downloads.run_auto_update_tick().await;
    StatusCode::ACCEPTED
}
