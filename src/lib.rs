//! Zimi — offline knowledge server library crate.
//!
//! `main.rs` is a thin shell around [`build_app`]; everything else lives
//! here so integration tests can drive the full router in-process.

pub mod archive;
pub mod cache;
pub mod config;
pub mod download;
pub mod error;
pub mod http;
pub mod indexer;
pub mod metrics;
pub mod ratelimit;
pub mod reader;
pub mod search;
pub mod state;
pub mod titleindex;
pub mod types;

use std::sync::Arc;

use tracing::info;

use crate::archive::ArchiveRegistry;
use crate::cache::Caches;
use crate::config::Config;
use crate::download::DownloadManager;
use crate::error::AppResult;
use crate::http::AppContext;
use crate::indexer::Indexer;
use crate::metrics::Metrics;
use crate::ratelimit::RateLimiter;
use crate::reader::Reader;
use crate::search::SearchEngine;
use crate::state::PersistentState;

/// Wires every component together from a resolved [`Config`] and returns an
/// [`AppContext`] ready to hand to [`http::build_router`]. Shared by `main`
/// and by integration tests, which build their own temp-dir `Config`.
pub async fn build_app(config: Config) -> AppResult<AppContext> {
    std::fs::create_dir_all(&config.archive_dir)
        .map_err(|e| error::AppError::Internal(format!("cannot create archive_dir: {e}")))?;
    let persistent_state = Arc::new(PersistentState::load(&config.data_dir, &config.archive_dir)?);

    if let Some(password) = &config.manage_password {
        if !persistent_state.is_password_set() {
            persistent_state.set_password(password)?;
        }
    }

    let registry = Arc::new(ArchiveRegistry::new(config.archive_dir.clone()));
    registry.preload_cache(persistent_state.load_archive_cache());
    let summary = registry.refresh().await?;
    info!(opened = summary.opened.len(), skipped = summary.skipped.len(), "initial archive scan complete");
    persistent_state.persist_archive_cache(&registry.metadata_cache_snapshot())?;

    let prewarm_registry = registry.clone();
    tokio::spawn(async move { prewarm_registry.prewarm().await });

    let caches = Caches::new();
    let title_indexes: indexer::TitleIndexMap = Arc::new(dashmap::DashMap::new());
    let indexer = Arc::new(Indexer::new(config.data_dir.clone(), registry.clone(), title_indexes.clone(), caches.clone()));
    indexer.sync().await;

    let metrics = Arc::new(Metrics::new());

    let search = Arc::new(SearchEngine::new(registry.clone(), title_indexes.clone(), caches.results.clone(), metrics.clone()));
    let reader = Arc::new(Reader::new(registry.clone(), title_indexes.clone()));
    let downloads = Arc::new(DownloadManager::new(
        config.archive_dir.clone(),
        registry.clone(),
        indexer.clone(),
        persistent_state.clone(),
        caches.clone(),
    ));
    let sweep_downloads = downloads.clone();
    tokio::spawn(async move { sweep_downloads.sweep_stale_tmp_files().await });

    let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit));

    Ok(AppContext {
        config: Arc::new(config),
        registry,
        indexer,
        search,
        reader,
        downloads,
        state: persistent_state,
        caches,
        rate_limiter,
        metrics,
        title_indexes,
    })
}
