//! Indexer — ties the archive registry (A) to the title index store (B).
//!
//! One `Indexer` per process, driven by startup and by every refresh that
//! finds a changed or new archive. It owns the `archive_id -> TitleIndex`
//! map that the search engine, suggestion cache, and reader all share.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::warn;

use crate::archive::{Archive, ArchiveRegistry};
use crate::cache::Caches;
use crate::error::AppResult;
use crate::types::Kind;
use crate::titleindex::TitleIndex;

pub type TitleIndexMap = Arc<DashMap<String, Arc<TitleIndex>>>;

pub struct Indexer {
    data_dir: PathBuf,
    registry: Arc<ArchiveRegistry>,
    title_indexes: TitleIndexMap,
    caches: Caches,
}

impl Indexer {
    pub fn new(data_dir: PathBuf, registry: Arc<ArchiveRegistry>, title_indexes: TitleIndexMap, caches: Caches) -> Self {
        Self { data_dir, registry, title_indexes, caches }
    }

    pub fn title_indexes(&self) -> TitleIndexMap {
        self.title_indexes.clone()
    }

    /// Ensures every archive currently in the registry has an open title
    /// index, rebuilding any whose fingerprint disagrees, and drops index
    /// handles for archives no longer present. Called after every registry
    /// refresh.
    pub async fn sync(&self) {
        let archives = self.registry.list();
        for archive in &archives {
            self.ensure_index(archive.clone()).await;
        }

        let live: std::collections::HashSet<String> = archives.iter().map(|a| a.id.clone()).collect();
        self.title_indexes.retain(|id, _| live.contains(id));
    }

    async fn ensure_index(&self, archive: Arc<Archive>) {
        let index = match self.title_indexes.get(&archive.id).map(|e| e.clone()) {
            Some(existing) => existing,
            None => match TitleIndex::open(&self.data_dir, &archive.id) {
                Ok(opened) => {
                    let opened = Arc::new(opened);
                    self.title_indexes.insert(archive.id.clone(), opened.clone());
                    opened
                }
                Err(e) => {
                    warn!(archive = %archive.id, error = %e, "failed to open title index");
                    return;
                }
            },
        };

        if index.needs_rebuild(archive.size, archive.mtime_unix) {
            self.rebuild(archive, index).await;
        }
    }

    /// Cancels any build already in flight for a superseded fingerprint
    /// (a refresh can race a slow build), enumerates the archive's entries
    /// under an exclusive title lock, and kicks off a fresh build.
    async fn rebuild(&self, archive: Arc<Archive>, index: Arc<TitleIndex>) {
        index.cancel_build();
        let _lock = archive.title_lock.write().await;

        let entries = match ArchiveRegistry::enumerate_entries(&archive.path).await {
            Ok(entries) => entries
                .into_iter()
                .filter(|(_, _, kind)| matches!(kind, Kind::Article | Kind::Image | Kind::Media))
                .collect::<Vec<_>>(),
            Err(e) => {
                warn!(archive = %archive.id, error = %e, "failed to enumerate entries for index build");
                return;
            }
        };

        match index.build(entries, archive.size, archive.mtime_unix).await {
            Ok(()) => {
                self.caches.invalidate_all();
                self.caches.suggestions.invalidate(&archive.id);
            }
            Err(e) => warn!(archive = %archive.id, error = %e, "title index build failed"),
        }
    }

    /// Adds the FTS table to an already-built index without a full rebuild.
    pub async fn build_fts_on_demand(&self, archive_id: &str) -> AppResult<()> {
        let index = self
            .title_indexes
            .get(archive_id)
            .map(|e| e.clone())
            .ok_or_else(|| crate::error::AppError::NotFound(format!("no title index for '{archive_id}'")))?;
        index.build_fts_on_demand().await?;
        self.caches.suggestions.invalidate(archive_id);
        Ok(())
    }
}
