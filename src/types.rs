//! Shared domain model: archives, search results, downloads, collections.
//!
//! These types are intentionally dumb data — construction, mutation, and
//! locking discipline live in the module that owns each piece of state
//! (`archive`, `titleindex`, `download`, ...). Keeping them here lets every
//! other module share one vocabulary without cyclic `mod` dependencies.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Category (added — derived once at registry load, never via type inspection)
// ---------------------------------------------------------------------------

/// Archive category, derived once from filename/title/publisher metadata
/// against a small ordered name-regex table. Used both for display and as
/// the default `source_rank` tier in search ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Wikipedia,
    Wiktionary,
    WikiquoteOrSister,
    StackExchange,
    DevDocs,
    Other,
}

impl Category {
    /// Default authority rank used to break ties when an archive hasn't had
    /// its `source_rank` overridden by the user. Higher is more authoritative.
    pub fn default_source_rank(self) -> i32 {
        match self {
            Category::Wikipedia => 100,
            Category::Wiktionary | Category::WikiquoteOrSister => 80,
            Category::StackExchange => 60,
            Category::DevDocs => 40,
            Category::Other => 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Entry kind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    Article,
    Image,
    Media,
    Other,
}

impl Kind {
    pub fn as_str(self) -> &'static str {
        match self {
            Kind::Article => "article",
            Kind::Image => "image",
            Kind::Media => "media",
            Kind::Other => "other",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "article" => Kind::Article,
            "image" => Kind::Image,
            "media" => Kind::Media,
            _ => Kind::Other,
        }
    }
}

// ---------------------------------------------------------------------------
// Archive (component A's data model)
// ---------------------------------------------------------------------------

/// One opened ZIM file. The native archive binding itself is reopened
/// per-operation (see `archive::read_zim_header` and the native call sites
/// in `search`/`reader`) rather than cached here, since every such call is
/// already serialized behind the registry's global lock or runs in its own
/// `spawn_blocking` — there is no warm handle worth pinning to this struct.
pub struct Archive {
    pub id: String,
    pub path: PathBuf,
    pub size: u64,
    pub mtime_unix: i64,
    pub entry_count: u64,
    pub title: String,
    pub description: String,
    pub language: String,
    pub publisher: String,
    pub illustration: Option<Vec<u8>>,
    pub flavor: String,
    pub category: Category,
    pub source_rank: i32,
    pub has_fts: bool,
    pub fts_skipped: bool,
    pub index_failed: bool,
    pub update_available: bool,
    /// Per-archive title-index lock (read-preferred). Held for any B-only
    /// operation: prefix lookup, token search, suggestions, enumeration.
    pub title_lock: Arc<tokio::sync::RwLock<()>>,
}

impl Archive {
    /// Lightweight metadata snapshot used for `/list` and the `cache.json`
    /// persistence file. Never carries the native handle or locks.
    pub fn snapshot(&self) -> ArchiveRecord {
        ArchiveRecord {
            id: self.id.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            language: self.language.clone(),
            entries: self.entry_count,
            size: self.size,
            category: self.category,
            has_fts: self.has_fts,
            update_available: self.update_available,
        }
    }
}

/// Serializable projection of [`Archive`] — what crosses the HTTP boundary
/// and what gets written into `cache.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveRecord {
    pub id: String,
    pub title: String,
    pub description: String,
    pub language: String,
    pub entries: u64,
    pub size: u64,
    pub category: Category,
    pub has_fts: bool,
    pub update_available: bool,
}

// ---------------------------------------------------------------------------
// Search result record (component C's output type)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct SearchResultRecord {
    pub archive: String,
    pub path: String,
    pub title: String,
    pub kind: Kind,
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(skip)]
    pub source_rank: i32,
}

/// Which phase a search result (or the overall response) originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchPhase {
    Title,
    FullText,
    Mixed,
}

// ---------------------------------------------------------------------------
// Collection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Collections(pub std::collections::BTreeMap<String, Vec<String>>);

// ---------------------------------------------------------------------------
// Download task (component G's data model)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    Queued,
    Running,
    Complete,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadKind {
    New,
    Update,
}

/// Progress and status for a single in-flight or completed download. The
/// byte counters are atomics so the transfer loop can update them without a
/// lock while HTTP handlers poll `/manage/downloads` concurrently.
pub struct DownloadTask {
    pub slug: String,
    pub url: String,
    pub target_filename: String,
    pub expected_size: Option<u64>,
    pub bytes_written: AtomicU64,
    pub state: RwLock<DownloadState>,
    pub error: RwLock<Option<String>>,
    pub started_at: DateTime<Utc>,
    pub finished_at: RwLock<Option<DateTime<Utc>>>,
    pub kind: DownloadKind,
    pub cancel_requested: std::sync::atomic::AtomicBool,
}

impl DownloadTask {
    pub fn snapshot(&self) -> DownloadRecord {
        DownloadRecord {
            slug: self.slug.clone(),
            url: self.url.clone(),
            target_filename: self.target_filename.clone(),
            expected_size: self.expected_size,
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            state: *self.state.read().expect("download state lock poisoned"),
            error: self.error.read().expect("download error lock poisoned").clone(),
            started_at: self.started_at,
            finished_at: *self.finished_at.read().expect("download finished_at lock poisoned"),
            kind: self.kind,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadRecord {
    pub slug: String,
    pub url: String,
    pub target_filename: String,
    pub expected_size: Option<u64>,
    pub bytes_written: u64,
    pub state: DownloadState,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub kind: DownloadKind,
}

// ---------------------------------------------------------------------------
// History event
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryKind {
    Downloaded,
    Updated,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: HistoryKind,
    pub archive: ArchiveRecord,
}

// ---------------------------------------------------------------------------
// Rate bucket (component H's per-IP sliding window)
// ---------------------------------------------------------------------------

/// Ring of request timestamps (as milliseconds since the bucket was first
/// touched) within the trailing 60-second window for one client IP.
pub struct RateBucket {
    pub timestamps_ms: parking_lot::Mutex<std::collections::VecDeque<i64>>,
}

impl RateBucket {
    pub fn new() -> Self {
        Self { timestamps_ms: parking_lot::Mutex::new(std::collections::VecDeque::new()) }
    }
}

impl Default for RateBucket {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Build progress (added — grounds B's "(built_rows, total_rows, state)")
// ---------------------------------------------------------------------------

/// Lock-free progress counters for an in-flight title-index build, readable
/// from any HTTP handler without taking the archive's title lock.
pub struct BuildProgress {
    /// 0 = idle, 1 = building, 2 = ready, 3 = failed.
    pub state: AtomicU8,
    pub built_rows: AtomicU64,
    pub total_rows: AtomicU64,
    pub failure_count: AtomicU32,
}

impl BuildProgress {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(0),
            built_rows: AtomicU64::new(0),
            total_rows: AtomicU64::new(0),
            failure_count: AtomicU32::new(0),
        }
    }

    pub fn state_label(&self) -> &'static str {
        match self.state.load(Ordering::Relaxed) {
            0 => "idle",
            1 => "building",
            2 => "ready",
            3 => "failed",
            _ => "unknown",
        }
    }
}

impl Default for BuildProgress {
    fn default() -> Self {
        Self::new()
    }
}
