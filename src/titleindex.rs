//! Title index store (component B) — per-archive prefix + full-text index.
//!
//! One SQLite database per archive under `<data_dir>/titles/<id>.db`. Reads
//! go through a small `r2d2` pool of warm connections (2-4); writes use a
//! single dedicated connection so the build worker never contends with the
//! pool for the writer lock SQLite already serializes internally.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::task::spawn_blocking;
use tracing::{info, warn};
use unicode_normalization::UnicodeNormalization;

use crate::error::{AppError, AppResult};
use crate::types::{BuildProgress, Kind};

const MIN_READ_POOL: u32 = 2;
const MAX_READ_POOL: u32 = 4;
const FTS_ENTRY_LIMIT: u64 = 2_000_000;
const BATCH_SIZE: usize = 5_000;
const LIKE_FALLBACK_BUDGET: Duration = Duration::from_millis(50);
const SCHEMA_VERSION: i64 = 1;

type Pool = r2d2::Pool<SqliteConnectionManager>;

/// Folds a title into its case/diacritic-folded lookup form: NFKD
/// decomposition, strip combining marks, lowercase. "Café" and "cafe" land
/// in the same prefix bucket this way.
pub fn fold_title(title: &str) -> String {
    title.nfkd().filter(|c| !unicode_normalization::char::is_combining_mark(*c)).collect::<String>().to_lowercase()
}

#[derive(Debug, Clone)]
pub struct TitleHit {
    pub path: String,
    pub title: String,
    pub kind: Kind,
}

pub struct TitleIndex {
    pub archive_id: String,
    db_path: PathBuf,
    read_pool: Pool,
    writer: Arc<std::sync::Mutex<Connection>>,
    pub has_fts: parking_lot::RwLock<bool>,
    pub fts_skipped: parking_lot::RwLock<bool>,
    pub progress: Arc<BuildProgress>,
    /// Checked between batches of an in-flight build; set by a refresh
    /// that supersedes it. Never reset to `false` mid-build — a fresh
    /// `build()` call starts its own cancellation epoch.
    cancel: Arc<std::sync::atomic::AtomicBool>,
}

impl TitleIndex {
    /// Opens (creating if absent) the index database for `archive_id` under
    /// `data_dir/titles/`. Does not build the index — callers check the
    /// fingerprint and call `build` separately.
    pub fn open(data_dir: &Path, archive_id: &str) -> AppResult<Self> {
        let titles_dir = data_dir.join("titles");
        std::fs::create_dir_all(&titles_dir)
            .map_err(|e| AppError::Internal(format!("cannot create titles dir: {e}")))?;
        let db_path = titles_dir.join(format!("{archive_id}.db"));

        let manager = SqliteConnectionManager::file(&db_path).with_init(apply_pragmas);
        let read_pool = r2d2::Pool::builder()
            .min_idle(Some(MIN_READ_POOL))
            .max_size(MAX_READ_POOL)
            .build(manager)
            .map_err(|e| AppError::Internal(format!("failed to open title index pool: {e}")))?;

        let writer = Connection::open(&db_path)
            .map_err(|e| AppError::Internal(format!("failed to open title index writer: {e}")))?;
        apply_pragmas(&writer).map_err(|e| AppError::Internal(format!("pragma init failed: {e}")))?;
        init_schema(&writer).map_err(|e| AppError::Internal(format!("schema init failed: {e}")))?;

        let has_fts = fts_table_present(&writer).unwrap_or(false);

        Ok(Self {
            archive_id: archive_id.to_string(),
            db_path,
            read_pool,
            writer: Arc::new(std::sync::Mutex::new(writer)),
            has_fts: parking_lot::RwLock::new(has_fts),
            fts_skipped: parking_lot::RwLock::new(false),
            progress: Arc::new(BuildProgress::new()),
            cancel: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        })
    }

    /// Requests cancellation of any build currently in flight. The build
    /// loop notices at the next batch boundary, deletes its `.tmp` file,
    /// and returns without touching the live database.
    pub fn cancel_build(&self) {
        self.cancel.store(true, std::sync::atomic::Ordering::Relaxed);
    }

    /// True when the stored fingerprint disagrees with the archive's
    /// current (size, mtime) or the schema version has advanced.
    pub fn needs_rebuild(&self, size: u64, mtime_unix: i64) -> bool {
        let conn = match self.writer.lock() {
            Ok(c) => c,
            Err(_) => return true,
        };
        let stored: Option<(i64, i64, i64)> = conn
            .query_row(
                "SELECT size, mtime_unix, schema_version FROM fingerprint WHERE id = 0",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()
            .unwrap_or(None);
        match stored {
            Some((s, m, v)) => s != size as i64 || m != mtime_unix || v != SCHEMA_VERSION,
            None => true,
        }
    }

    /// Rebuilds the index from scratch: writes to a `.tmp` sibling database,
    /// then atomically renames over the live one. Entries are inserted in
    /// batches of at least 5,000 per transaction. FTS is skipped above
    /// `FTS_ENTRY_LIMIT` and can be built later on demand.
    pub async fn build(
        self: Arc<Self>,
        entries: Vec<(String, String, Kind)>,
        size: u64,
        mtime_unix: i64,
    ) -> AppResult<()> {
        self.progress.state.store(1, std::sync::atomic::Ordering::Relaxed);
        self.progress.total_rows.store(entries.len() as u64, std::sync::atomic::Ordering::Relaxed);
        self.progress.built_rows.store(0, std::sync::atomic::Ordering::Relaxed);
        self.cancel.store(false, std::sync::atomic::Ordering::Relaxed);

        let db_path = self.db_path.clone();
        let tmp_path = db_path.with_extension("db.tmp");
        let build_fts = (entries.len() as u64) <= FTS_ENTRY_LIMIT;
        let progress = self.progress.clone();
        let cancel = self.cancel.clone();

        let tmp_path_for_task = tmp_path.clone();
        let result = spawn_blocking(move || -> AppResult<bool> {
            let _ = std::fs::remove_file(&tmp_path_for_task);
            let mut conn = Connection::open(&tmp_path_for_task)
                .map_err(|e| AppError::Internal(format!("cannot open tmp index: {e}")))?;
            apply_pragmas(&conn).map_err(|e| AppError::Internal(format!("pragma init failed: {e}")))?;
            init_schema(&conn).map_err(|e| AppError::Internal(format!("schema init failed: {e}")))?;

            for chunk in entries.chunks(BATCH_SIZE) {
                if cancel.load(std::sync::atomic::Ordering::Relaxed) {
                    return Ok(false);
                }
                let tx = conn
                    .transaction()
                    .map_err(|e| AppError::Internal(format!("transaction start failed: {e}")))?;
                for (path, title, kind) in chunk {
                    let title_lower = fold_title(title);
                    tx.execute(
                        "INSERT OR REPLACE INTO entries (path, title, title_lower, kind) VALUES (?1, ?2, ?3, ?4)",
                        params![path, title, title_lower, kind.as_str()],
                    )
                    .map_err(|e| AppError::Internal(format!("insert failed: {e}")))?;
                }
                tx.commit().map_err(|e| AppError::Internal(format!("commit failed: {e}")))?;
                progress.built_rows.fetch_add(chunk.len() as u64, std::sync::atomic::Ordering::Relaxed);
            }

            if cancel.load(std::sync::atomic::Ordering::Relaxed) {
                return Ok(false);
            }

            if build_fts {
                create_fts(&mut conn).map_err(|e| AppError::Internal(format!("fts build failed: {e}")))?;
            }

            conn.execute(
                "INSERT OR REPLACE INTO fingerprint (id, size, mtime_unix, schema_version) VALUES (0, ?1, ?2, ?3)",
                params![size as i64, mtime_unix, SCHEMA_VERSION],
            )
            .map_err(|e| AppError::Internal(format!("fingerprint write failed: {e}")))?;

            drop(conn);
            Ok(true)
        })
        .await
        .map_err(|e| AppError::Internal(format!("build task panicked: {e}")))?;

        let completed = match result {
            Ok(completed) => completed,
            Err(e) => {
                let _ = std::fs::remove_file(&tmp_path);
                let failures = self.progress.failure_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed) + 1;
                self.progress.state.store(3, std::sync::atomic::Ordering::Relaxed);
                if failures >= 3 {
                    warn!(archive = %self.archive_id, "title index quarantined after 3 consecutive build failures");
                }
                return Err(e);
            }
        };

        if !completed {
            let _ = std::fs::remove_file(&tmp_path);
            self.progress.state.store(0, std::sync::atomic::Ordering::Relaxed);
            info!(archive = %self.archive_id, "title index build cancelled");
            return Ok(());
        }

        std::fs::rename(&tmp_path, &db_path)
            .map_err(|e| AppError::Internal(format!("atomic rename failed: {e}")))?;

        *self.has_fts.write() = build_fts;
        *self.fts_skipped.write() = !build_fts;
        self.progress.state.store(2, std::sync::atomic::Ordering::Relaxed);
        self.progress.failure_count.store(0, std::sync::atomic::Ordering::Relaxed);
        info!(archive = %self.archive_id, rows = entries_len_hint(&self.progress), "title index build complete");
        Ok(())
    }

    /// `SELECT path, title, kind FROM entries WHERE title_lower GLOB q* LIMIT N`.
    pub async fn prefix(&self, query_lower: &str, limit: usize) -> AppResult<Vec<TitleHit>> {
        let pool = self.read_pool.clone();
        let query_lower = query_lower.to_string();
        spawn_blocking(move || -> AppResult<Vec<TitleHit>> {
            let conn =
                pool.get().map_err(|e| AppError::Internal(format!("pool checkout failed: {e}")))?;
            let glob = format!("{query_lower}*");
            let mut stmt = conn
                .prepare_cached(
                    "SELECT path, title, kind FROM entries WHERE title_lower GLOB ?1 LIMIT ?2",
                )
                .map_err(|e| AppError::Internal(format!("prepare failed: {e}")))?;
            let rows = stmt
                .query_map(params![glob, limit as i64], |r| {
                    Ok(TitleHit {
                        path: r.get(0)?,
                        title: r.get(1)?,
                        kind: Kind::from_str(&r.get::<_, String>(2)?),
                    })
                })
                .map_err(|e| AppError::Internal(format!("query failed: {e}")))?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|e| AppError::Internal(format!("row decode failed: {e}")))
        })
        .await
        .map_err(|e| AppError::Internal(format!("prefix task panicked: {e}")))?
    }

    /// Token search: FTS MATCH when present, else a cost-budgeted LIKE scan
    /// that returns a `truncated=true` signal if the budget runs out first.
    pub async fn tokens(&self, tokens: Vec<String>, limit: usize) -> AppResult<(Vec<TitleHit>, bool)> {
        let pool = self.read_pool.clone();
        let has_fts = *self.has_fts.read();
        spawn_blocking(move || -> AppResult<(Vec<TitleHit>, bool)> {
            let conn =
                pool.get().map_err(|e| AppError::Internal(format!("pool checkout failed: {e}")))?;
            if has_fts {
                let match_expr = tokens
                    .iter()
                    .map(|t| format!("\"{}\"", t.replace('"', "")))
                    .collect::<Vec<_>>()
                    .join(" AND ");
                let mut stmt = conn
                    .prepare_cached(
                        "SELECT e.path, e.title, e.kind FROM entries_fts f
                         JOIN entries e ON e.path = f.path
                         WHERE entries_fts MATCH ?1 LIMIT ?2",
                    )
                    .map_err(|e| AppError::Internal(format!("prepare failed: {e}")))?;
                let rows = stmt
                    .query_map(params![match_expr, limit as i64], |r| {
                        Ok(TitleHit {
                            path: r.get(0)?,
                            title: r.get(1)?,
                            kind: Kind::from_str(&r.get::<_, String>(2)?),
                        })
                    })
                    .map_err(|e| AppError::Internal(format!("query failed: {e}")))?;
                let hits = rows
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| AppError::Internal(format!("row decode failed: {e}")))?;
                Ok((hits, false))
            } else {
                like_fallback(&conn, &tokens, limit)
            }
        })
        .await
        .map_err(|e| AppError::Internal(format!("tokens task panicked: {e}")))?
    }

    /// Adds the FTS table in place without rebuilding `entries`.
    pub async fn build_fts_on_demand(&self) -> AppResult<()> {
        let writer = self.writer.clone();
        spawn_blocking(move || -> AppResult<()> {
            let mut conn = writer.lock().map_err(|_| AppError::Internal("writer lock poisoned".into()))?;
            create_fts(&mut conn).map_err(|e| AppError::Internal(format!("fts build failed: {e}")))
        })
        .await
        .map_err(|e| AppError::Internal(format!("fts task panicked: {e}")))??;
        *self.has_fts.write() = true;
        *self.fts_skipped.write() = false;
        Ok(())
    }
}

fn entries_len_hint(progress: &BuildProgress) -> u64 {
    progress.total_rows.load(std::sync::atomic::Ordering::Relaxed)
}

fn like_fallback(conn: &Connection, tokens: &[String], limit: usize) -> AppResult<(Vec<TitleHit>, bool)> {
    let deadline = Instant::now() + LIKE_FALLBACK_BUDGET;
    let mut hits = Vec::new();
    let mut truncated = false;

    let mut stmt = conn
        .prepare("SELECT path, title, kind FROM entries WHERE title_lower LIKE ?1 LIMIT 500")
        .map_err(|e| AppError::Internal(format!("prepare failed: {e}")))?;

    'outer: for token in tokens {
        if Instant::now() >= deadline {
            truncated = true;
            break;
        }
        let pattern = format!("%{token}%");
        let rows = stmt
            .query_map(params![pattern], |r| {
                Ok(TitleHit {
                    path: r.get(0)?,
                    title: r.get(1)?,
                    kind: Kind::from_str(&r.get::<_, String>(2)?),
                })
            })
            .map_err(|e| AppError::Internal(format!("query failed: {e}")))?;
        for row in rows {
            if Instant::now() >= deadline {
                truncated = true;
                break 'outer;
            }
            hits.push(row.map_err(|e| AppError::Internal(format!("row decode failed: {e}")))?);
            if hits.len() >= limit {
                break 'outer;
            }
        }
    }

    hits.truncate(limit);
    Ok((hits, truncated))
}

fn apply_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;
         PRAGMA cache_size = -2000;",
    )
}

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS entries (
            path TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            title_lower TEXT NOT NULL,
            kind TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_entries_title_lower ON entries(title_lower);
        CREATE TABLE IF NOT EXISTS fingerprint (
            id INTEGER PRIMARY KEY CHECK (id = 0),
            size INTEGER NOT NULL,
            mtime_unix INTEGER NOT NULL,
            schema_version INTEGER NOT NULL
        );",
    )
}

fn create_fts(conn: &mut Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE VIRTUAL TABLE IF NOT EXISTS entries_fts USING fts5(path, title, content='entries', content_rowid='rowid');
         INSERT INTO entries_fts(entries_fts) VALUES ('rebuild');",
    )
}

fn fts_table_present(conn: &Connection) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'entries_fts'",
        [],
        |_| Ok(true),
    )
    .optional()
    .map(|v| v.unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fold_title_normalizes_diacritics_and_case() {
        assert_eq!(fold_title("Café"), "cafe");
        assert_eq!(fold_title("WATER"), "water");
    }

    #[tokio::test]
    async fn build_then_prefix_finds_inserted_entries() {
        let dir = tempfile::tempdir().unwrap();
        let index = Arc::new(TitleIndex::open(dir.path(), "mini-wikipedia").unwrap());
        let entries = vec![
            ("A/Water".to_string(), "Water".to_string(), Kind::Article),
            ("A/Waterfall".to_string(), "Waterfall".to_string(), Kind::Article),
            ("A/Fire".to_string(), "Fire".to_string(), Kind::Article),
        ];
        index.clone().build(entries, 1024, 0).await.unwrap();

        let hits = index.prefix("wat", 10).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| h.title.to_lowercase().starts_with("wat")));
    }
}
