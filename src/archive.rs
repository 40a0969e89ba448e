//! Archive registry (component A) — opens, caches, and reopens ZIM archives.
//!
//! One `ArchiveRegistry` per process, held behind an `Arc` and shared by the
//! HTTP layer, the search engine, and the download manager. Entry into
//! native archive code (full-text search, random entry, raw fetch) is
//! serialized through [`ArchiveRegistry::global_lock`]; title-index-only
//! operations take the per-[`Archive`] `title_lock` instead so title work
//! across archives stays parallel.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::error::{AppError, AppResult};
use crate::types::{Archive, ArchiveRecord, BuildProgress, Category};

/// Ordered (name-regex, Category) table. Matched in order against the
/// archive's filename stem; the first match wins. This is the concrete
/// derivation referred to by `Archive::category` — computed once at load,
/// never re-derived from runtime type inspection.
fn category_table() -> &'static [(&'static str, Category)] {
    &[
        ("wiktionary", Category::Wiktionary),
        ("wikiquote", Category::WikiquoteOrSister),
        ("wikibooks", Category::WikiquoteOrSister),
        ("wikisource", Category::WikiquoteOrSister),
        ("wikivoyage", Category::WikiquoteOrSister),
        ("wikinews", Category::WikiquoteOrSister),
        ("wikipedia", Category::Wikipedia),
        ("stackexchange", Category::StackExchange),
        ("stackoverflow", Category::StackExchange),
        ("devdocs", Category::DevDocs),
    ]
}

fn derive_category(name_lower: &str) -> Category {
    for (pattern, category) in category_table() {
        if name_lower.contains(pattern) {
            return *category;
        }
    }
    Category::Other
}

/// Slugifies a filename stem into a stable archive identifier: lowercase,
/// non-alphanumerics collapsed to single hyphens, trimmed.
pub fn slugify(stem: &str) -> String {
    let mut out = String::with_capacity(stem.len());
    let mut last_was_sep = false;
    for ch in stem.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('-');
            last_was_sep = true;
        }
    }
    out.trim_matches('-').to_string()
}

/// Cached metadata keyed by (path, size, mtime) so a process restart skips
/// re-reading archive headers for files that have not changed on disk.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CachedMetadata {
    pub path: PathBuf,
    pub size: u64,
    pub mtime_unix: i64,
    pub record: ArchiveRecord,
}

pub struct ArchiveRegistry {
    archive_dir: PathBuf,
    archives: parking_lot::RwLock<BTreeMap<String, Arc<Archive>>>,
    build_progress: parking_lot::RwLock<BTreeMap<String, Arc<BuildProgress>>>,
    /// Serializes every call into native archive code across the whole
    /// registry — the native library is not thread-safe for cross-archive
    /// reads through its internal state.
    global_lock: AsyncMutex<()>,
    metadata_cache: parking_lot::RwLock<Vec<CachedMetadata>>,
}

impl ArchiveRegistry {
    pub fn new(archive_dir: PathBuf) -> Self {
        Self {
            archive_dir,
            archives: parking_lot::RwLock::new(BTreeMap::new()),
            build_progress: parking_lot::RwLock::new(BTreeMap::new()),
            global_lock: AsyncMutex::new(()),
            metadata_cache: parking_lot::RwLock::new(Vec::new()),
        }
    }

    /// Acquires the global archive lock. Callers must hold the returned
    /// guard for the entire duration of native archive entry and release it
    /// before any blocking I/O that doesn't need it.
    pub async fn global_lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.global_lock.lock().await
    }

    pub fn get(&self, id: &str) -> AppResult<Arc<Archive>> {
        self.archives
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("unknown archive '{id}'")))
    }

    pub fn list(&self) -> Vec<Arc<Archive>> {
        self.archives.read().values().cloned().collect()
    }

    pub fn ids_in_scope(&self, scope: &ArchiveScope, collections: &crate::types::Collections) -> Vec<String> {
        match scope {
            ArchiveScope::All => self.archives.read().keys().cloned().collect(),
            ArchiveScope::Single(id) => {
                if self.archives.read().contains_key(id) {
                    vec![id.clone()]
                } else {
                    Vec::new()
                }
            }
            ArchiveScope::Collection(name) => collections
                .0
                .get(name)
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .filter(|id| self.archives.read().contains_key(id))
                .collect(),
        }
    }

    pub fn build_progress(&self, id: &str) -> Option<Arc<BuildProgress>> {
        self.build_progress.read().get(id).cloned()
    }

    /// Rescans `archive_dir`: opens newly added `.zim` files, closes and
    /// drops removed ones, and reopens any whose size/mtime changed. Corrupt
    /// archives are logged and skipped — never fatal to the refresh as a
    /// whole.
    pub async fn refresh(&self) -> AppResult<RefreshSummary> {
        let mut summary = RefreshSummary::default();
        let mut seen = std::collections::HashSet::new();

        let mut read_dir = match tokio::fs::read_dir(&self.archive_dir).await {
            Ok(rd) => rd,
            Err(e) => {
                return Err(AppError::Internal(format!(
                    "cannot read archive_dir {}: {e}",
                    self.archive_dir.display()
                )))
            }
        };

        let mut candidates = Vec::new();
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| AppError::Internal(format!("readdir error: {e}")))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("zim") {
                candidates.push(path);
            }
        }

        for path in candidates {
            let meta = match tokio::fs::metadata(&path).await {
                Ok(m) => m,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping archive: stat failed");
                    continue;
                }
            };
            let size = meta.len();
            let mtime_unix = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);

            let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("archive");
            let id = slugify(stem);
            seen.insert(id.clone());

            let needs_open = {
                let archives = self.archives.read();
                match archives.get(&id) {
                    Some(existing) => existing.size != size || existing.mtime_unix != mtime_unix,
                    None => true,
                }
            };

            if needs_open {
                match self.open_archive(&id, &path, size, mtime_unix).await {
                    Ok(archive) => {
                        self.archives.write().insert(id.clone(), Arc::new(archive));
                        summary.opened.push(id.clone());
                        info!(archive = %id, "opened archive");
                    }
                    Err(e) => {
                        warn!(archive = %id, error = %e, "skipping corrupt archive");
                        summary.skipped.push(id.clone());
                    }
                }
            }
        }

        let removed: Vec<String> =
            self.archives.read().keys().filter(|id| !seen.contains(*id)).cloned().collect();
        for id in &removed {
            self.archives.write().remove(id);
            summary.removed.push(id.clone());
        }

        self.write_metadata_cache();
        Ok(summary)
    }

    /// Opens a single archive, preferring the on-disk metadata cache over a
    /// native header read when `(path, size, mtime)` still matches a cached
    /// entry — the whole point of `cache.json` is to let a process restart
    /// skip re-reading headers for files that haven't changed. Only a
    /// cache miss touches the native binding, and that's the only place
    /// outside the global lock this registry calls into it: header reads
    /// happen at open time, before the archive is visible to any other
    /// caller, so there's no cross-archive contention to protect against
    /// yet.
    async fn open_archive(
        &self,
        id: &str,
        path: &Path,
        size: u64,
        mtime_unix: i64,
    ) -> AppResult<Archive> {
        let name_lower = id.to_ascii_lowercase();
        let category = derive_category(&name_lower);

        if let Some(cached) = self.cached_record_for(path, size, mtime_unix) {
            info!(archive = %id, "reusing cached metadata, skipping header read");
            return Ok(Archive {
                id: id.to_string(),
                path: path.to_path_buf(),
                size,
                mtime_unix,
                entry_count: cached.entries,
                title: cached.title,
                description: cached.description,
                language: cached.language,
                publisher: String::new(),
                illustration: None,
                flavor: String::new(),
                category: cached.category,
                source_rank: cached.category.default_source_rank(),
                has_fts: cached.has_fts,
                fts_skipped: cached.entries > 2_000_000,
                index_failed: false,
                update_available: cached.update_available,
                title_lock: Arc::new(tokio::sync::RwLock::new(())),
            });
        }

        let path_owned = path.to_path_buf();
        let header = tokio::task::spawn_blocking(move || read_zim_header(&path_owned))
            .await
            .map_err(|e| AppError::Internal(format!("archive open task panicked: {e}")))??;

        Ok(Archive {
            id: id.to_string(),
            path: path.to_path_buf(),
            size,
            mtime_unix,
            entry_count: header.entry_count,
            title: header.title,
            description: header.description,
            language: header.language,
            publisher: header.publisher,
            illustration: header.illustration,
            flavor: header.flavor,
            category,
            source_rank: category.default_source_rank(),
            has_fts: false,
            fts_skipped: header.entry_count > 2_000_000,
            index_failed: false,
            update_available: false,
            title_lock: Arc::new(tokio::sync::RwLock::new(())),
        })
    }

    fn cached_record_for(&self, path: &Path, size: u64, mtime_unix: i64) -> Option<ArchiveRecord> {
        self.metadata_cache
            .read()
            .iter()
            .find(|c| c.path == path && c.size == size && c.mtime_unix == mtime_unix)
            .map(|c| c.record.clone())
    }

    /// Seeds the in-memory metadata cache from a previously persisted
    /// `cache.json`. Must be called before the first `refresh()` to have
    /// any effect on that refresh's header-read decisions.
    pub fn preload_cache(&self, entries: Vec<CachedMetadata>) {
        *self.metadata_cache.write() = entries;
    }

    /// Enumerates every entry of an opened archive (articles and media) for
    /// the title index builder. Runs inside `spawn_blocking`; does not take
    /// the global lock itself because it only runs during an index build,
    /// which the caller already serializes per-archive via the title lock.
    pub async fn enumerate_entries(path: &Path) -> AppResult<Vec<(String, String, crate::types::Kind)>> {
        let path_owned = path.to_path_buf();
        tokio::task::spawn_blocking(move || -> AppResult<Vec<(String, String, crate::types::Kind)>> {
            let archive = zim_rs::archive::Archive::new(path_owned.to_string_lossy().as_ref())
                .map_err(|e| AppError::Internal(format!("failed to open {}: {e}", path_owned.display())))?;

            let mut out = Vec::with_capacity(archive.entry_count() as usize);
            let mut iter = archive
                .iter_efficient()
                .map_err(|e| AppError::Internal(format!("iterator init failed: {e}")))?;
            while let Some(entry) = iter.next() {
                let Ok(entry) = entry else { continue };
                if entry.is_redirect() {
                    continue;
                }
                let path = entry.get_path();
                let title = entry.get_title();
                let kind = classify_entry_path(&path);
                out.push((path, title, kind));
            }
            Ok(out)
        })
        .await
        .map_err(|e| AppError::Internal(format!("enumerate task panicked: {e}")))?
    }

    fn write_metadata_cache(&self) {
        let snapshot: Vec<CachedMetadata> = self
            .archives
            .read()
            .values()
            .map(|a| CachedMetadata {
                path: a.path.clone(),
                size: a.size,
                mtime_unix: a.mtime_unix,
                record: a.snapshot(),
            })
            .collect();
        *self.metadata_cache.write() = snapshot;
    }

    pub fn metadata_cache_snapshot(&self) -> Vec<CachedMetadata> {
        self.metadata_cache.read().clone()
    }

    /// Marks an archive as gone after a request discovers its file vanished
    /// mid-operation, without waiting for the next scheduled refresh.
    pub fn mark_gone(&self, id: &str) {
        self.archives.write().remove(id);
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Archive>> {
        self.archives.write().remove(id)
    }

    pub fn archive_dir(&self) -> &Path {
        &self.archive_dir
    }

    /// Touches each archive's first entry once in the background so the
    /// operating system's page cache is warm before the first real request
    /// arrives. Best-effort: a failure here just means the first caller
    /// pays the cold-open cost instead, same as if this pass never ran.
    pub async fn prewarm(&self) {
        let paths: Vec<(String, PathBuf)> =
            self.archives.read().values().map(|a| (a.id.clone(), a.path.clone())).collect();
        for (id, path) in paths {
            let _guard = self.global_lock().await;
            let result = tokio::task::spawn_blocking(move || {
                let zim = zim_rs::archive::Archive::new(path.to_string_lossy().as_ref()).ok()?;
                let mut iter = zim.iter_efficient().ok()?;
                iter.next();
                Some(())
            })
            .await;
            if !matches!(result, Ok(Some(()))) {
                warn!(archive = %id, "prewarm pass skipped (non-fatal)");
            }
        }
    }
}

#[derive(Default, Debug)]
pub struct RefreshSummary {
    pub opened: Vec<String>,
    pub removed: Vec<String>,
    pub skipped: Vec<String>,
}

#[derive(Clone, Debug)]
pub enum ArchiveScope {
    All,
    Single(String),
    Collection(String),
}

impl ArchiveScope {
    pub fn parse(zim: Option<&str>, collection: Option<&str>) -> Self {
        if let Some(name) = collection {
            ArchiveScope::Collection(name.to_string())
        } else if let Some(id) = zim {
            ArchiveScope::Single(id.to_string())
        } else {
            ArchiveScope::All
        }
    }
}

struct ZimHeader {
    entry_count: u64,
    title: String,
    description: String,
    language: String,
    publisher: String,
    illustration: Option<Vec<u8>>,
    flavor: String,
}

/// Classifies an entry by its namespace prefix: `A/` is an article, `I/`
/// an image, `-/` (or `M/` on older archives) metadata, everything else
/// falls to `other`/`media` by extension.
pub(crate) fn classify_entry_path(path: &str) -> crate::types::Kind {
    match path.split('/').next() {
        Some("A") => crate::types::Kind::Article,
        Some("I") => crate::types::Kind::Image,
        Some("-") | Some("M") => crate::types::Kind::Other,
        _ => crate::types::Kind::Media,
    }
}

/// Reads just the header metadata of a ZIM file via the native binding.
/// Runs inside `spawn_blocking` since the underlying library performs
/// synchronous file I/O.
fn read_zim_header(path: &Path) -> AppResult<ZimHeader> {
    let archive = zim_rs::archive::Archive::new(path.to_string_lossy().as_ref())
        .map_err(|e| AppError::Internal(format!("failed to open {}: {e}", path.display())))?;

    Ok(ZimHeader {
        entry_count: archive.entry_count(),
        title: archive.get_metadata("Title").unwrap_or_else(|_| "Untitled".to_string()),
        description: archive.get_metadata("Description").unwrap_or_default(),
        language: archive.get_metadata("Language").unwrap_or_default(),
        publisher: archive.get_metadata("Publisher").unwrap_or_default(),
        illustration: archive.get_illustration_item(48).ok().map(|i| i.get_data()),
        flavor: archive.get_metadata("Flavour").unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_collapses_non_alphanumerics() {
        assert_eq!(slugify("wikipedia_en_all_nopic_2024-01"), "wikipedia-en-all-nopic-2024-01");
        assert_eq!(slugify("Mini Wikipedia!!"), "mini-wikipedia");
    }

    #[test]
    fn category_derivation_matches_known_names() {
        assert_eq!(derive_category("wikipedia_en_all_nopic"), Category::Wikipedia);
        assert_eq!(derive_category("wiktionary_en_all"), Category::Wiktionary);
        assert_eq!(derive_category("stackexchange_unix"), Category::StackExchange);
        assert_eq!(derive_category("devdocs_en_rust"), Category::DevDocs);
        assert_eq!(derive_category("gutenberg_en_all"), Category::Other);
    }

    #[test]
    fn classify_entry_path_maps_namespace_prefixes() {
        assert_eq!(classify_entry_path("A/Water"), crate::types::Kind::Article);
        assert_eq!(classify_entry_path("I/m/thumb.png"), crate::types::Kind::Image);
        assert_eq!(classify_entry_path("-/favicon"), crate::types::Kind::Other);
        assert_eq!(classify_entry_path("C/some.bin"), crate::types::Kind::Media);
    }
}
