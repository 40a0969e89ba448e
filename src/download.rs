//! Download manager (component G) — resumable ZIM downloads, update
//! detection, cancellation, and the auto-update scheduler.
//!
//! At most one task is ever active per catalog slug: [`DownloadManager`]
//! keeps an `Arc<DownloadTask>` per slug in a `DashMap`, and starting a
//! second download for a slug that already has one running is a
//! `conflict`, not a queue.

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use scraper::{Html, Selector};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{info, warn};

use crate::archive::ArchiveRegistry;
use crate::error::{AppError, AppResult};
use crate::indexer::Indexer;
use crate::state::PersistentState;
use crate::types::{DownloadKind, DownloadRecord, DownloadState, DownloadTask, HistoryKind};

const CHUNK_SIZE: usize = 64 * 1024;
const STALE_TMP_AGE: Duration = Duration::from_secs(24 * 60 * 60);
const BACKOFFS: [Duration; 3] = [Duration::from_secs(1), Duration::from_secs(4), Duration::from_secs(16)];
const MAX_RETRIES: u32 = 3;
const KIWIX_CATALOG_URL: &str = "https://library.kiwix.org/catalog/v2/entries";

#[derive(Debug, Clone, serde::Serialize)]
pub struct CatalogEntry {
    pub slug: String,
    pub title: String,
    pub url: String,
    pub size: Option<u64>,
    pub language: String,
    pub date: Option<String>,
}

pub struct DownloadManager {
    archive_dir: PathBuf,
    tasks: DashMap<String, Arc<DownloadTask>>,
    client: reqwest::Client,
    registry: Arc<ArchiveRegistry>,
    indexer: Arc<Indexer>,
    state: Arc<PersistentState>,
    caches: crate::cache::Caches,
    auto_update_running: std::sync::atomic::AtomicBool,
}

impl DownloadManager {
    pub fn new(
        archive_dir: PathBuf,
        registry: Arc<ArchiveRegistry>,
        indexer: Arc<Indexer>,
        state: Arc<PersistentState>,
        caches: crate::cache::Caches,
    ) -> Self {
        Self {
            archive_dir,
            tasks: DashMap::new(),
            client: reqwest::Client::new(),
            registry,
            indexer,
            state,
            caches,
            auto_update_running: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn list(&self) -> Vec<DownloadRecord> {
        self.tasks.iter().map(|entry| entry.value().snapshot()).collect()
    }

    pub fn get(&self, slug: &str) -> Option<DownloadRecord> {
        self.tasks.get(slug).map(|t| t.snapshot())
    }

    /// Starts a new download for `slug`, returning `conflict` if one is
    /// already queued or running. Spawns the transfer loop as a detached
    /// background task; callers poll `/manage/downloads` for progress.
    pub fn start(
        self: &Arc<Self>,
        slug: String,
        url: String,
        target_filename: String,
        expected_size: Option<u64>,
        kind: DownloadKind,
    ) -> AppResult<DownloadRecord> {
        if let Some(existing) = self.tasks.get(&slug) {
            if matches!(*existing.state.read().unwrap(), DownloadState::Queued | DownloadState::Running) {
                return Err(AppError::Conflict(format!("download already active for '{slug}'")));
            }
        }

        let task = Arc::new(DownloadTask {
            slug: slug.clone(),
            url: url.clone(),
            target_filename: target_filename.clone(),
            expected_size,
            bytes_written: std::sync::atomic::AtomicU64::new(0),
            state: std::sync::RwLock::new(DownloadState::Queued),
            error: std::sync::RwLock::new(None),
            started_at: chrono::Utc::now(),
            finished_at: std::sync::RwLock::new(None),
            kind,
            cancel_requested: std::sync::atomic::AtomicBool::new(false),
        });
        self.tasks.insert(slug.clone(), task.clone());

        let manager = self.clone();
        tokio::spawn(async move {
            manager.run_transfer(task).await;
        });

        Ok(self.tasks.get(&slug).expect("just inserted").snapshot())
    }

    pub fn cancel(&self, slug: &str) -> AppResult<()> {
        let task = self.tasks.get(slug).ok_or_else(|| AppError::NotFound(format!("no download for '{slug}'")))?;
        task.cancel_requested.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Deletes `.tmp` files under `archive_dir` older than 24 hours that
    /// have no matching in-memory task (a task only exists in memory for
    /// the lifetime of the process that started it, so after a restart
    /// every leftover `.tmp` is, by definition, orphaned).
    pub async fn sweep_stale_tmp_files(&self) {
        let Ok(mut entries) = tokio::fs::read_dir(&self.archive_dir).await else { return };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("tmp") {
                continue;
            }
            let Ok(meta) = entry.metadata().await else { continue };
            let Ok(age) = meta.modified().and_then(|m| m.elapsed()) else { continue };
            if age < STALE_TMP_AGE {
                continue;
            }
            let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
            if self.tasks.contains_key(stem) {
                continue;
            }
            if tokio::fs::remove_file(&path).await.is_ok() {
                info!(path = %path.display(), "removed stale .tmp file");
            }
        }
    }

    async fn run_transfer(&self, task: Arc<DownloadTask>) {
        *task.state.write().unwrap() = DownloadState::Running;
        let tmp_path = self.archive_dir.join(format!("{}.tmp", task.target_filename));
        let final_path = self.archive_dir.join(&task.target_filename);

        let mut attempt = 0u32;
        loop {
            match self.transfer_once(&task, &tmp_path).await {
                Ok(TransferOutcome::Completed) => {
                    if let Err(e) = self.finalize(&task, &tmp_path, &final_path).await {
                        self.fail(&task, e.to_string());
                    }
                    return;
                }
                Ok(TransferOutcome::Cancelled) => {
                    *task.state.write().unwrap() = DownloadState::Cancelled;
                    *task.finished_at.write().unwrap() = Some(chrono::Utc::now());
                    info!(slug = %task.slug, "download cancelled, partial file retained for resume");
                    return;
                }
                Err(e) => {
                    let decision = retry_decision(attempt, &e);
                    match decision {
                        RetryDecision::Retry(after) => {
                            warn!(slug = %task.slug, error = %e, attempt, "download failed, retrying");
                            tokio::time::sleep(after).await;
                            attempt += 1;
                        }
                        RetryDecision::GiveUp => {
                            self.fail(&task, e.to_string());
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn transfer_once(&self, task: &Arc<DownloadTask>, tmp_path: &Path) -> AppResult<TransferOutcome> {
        let already_written = tokio::fs::metadata(tmp_path).await.map(|m| m.len()).unwrap_or(0);
        task.bytes_written.store(already_written, Ordering::Relaxed);

        let mut request = self.client.get(&task.url);
        if already_written > 0 {
            request = request.header("Range", format!("bytes={already_written}-"));
        }

        let response = request
            .send()
            .await
            .map_err(|e| AppError::DownloadFailed(format!("request failed: {e}")))?;

        let status = response.status();
        if status.is_client_error() {
            return Err(AppError::DownloadFailed(format!("server rejected request: {status}")));
        }
        if status.is_server_error() {
            return Err(AppError::DownloadFailed(format!("server error: {status}")));
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(tmp_path)
            .await
            .map_err(|e| AppError::Internal(format!("cannot open tmp file: {e}")))?;
        file.seek(std::io::SeekFrom::Start(already_written))
            .await
            .map_err(|e| AppError::Internal(format!("seek failed: {e}")))?;

        let mut stream = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::with_capacity(CHUNK_SIZE);

        while let Some(chunk) = stream.next().await {
            if task.cancel_requested.load(Ordering::Relaxed) {
                file.flush().await.ok();
                return Ok(TransferOutcome::Cancelled);
            }
            let chunk = chunk.map_err(|e| AppError::DownloadFailed(format!("stream error: {e}")))?;
            buffer.extend_from_slice(&chunk);
            while buffer.len() >= CHUNK_SIZE {
                let write_now: Vec<u8> = buffer.drain(..CHUNK_SIZE).collect();
                file.write_all(&write_now).await.map_err(|e| AppError::Internal(format!("write failed: {e}")))?;
                task.bytes_written.fetch_add(write_now.len() as u64, Ordering::Relaxed);
                if task.cancel_requested.load(Ordering::Relaxed) {
                    file.flush().await.ok();
                    return Ok(TransferOutcome::Cancelled);
                }
            }
        }

        if !buffer.is_empty() {
            let len = buffer.len() as u64;
            file.write_all(&buffer).await.map_err(|e| AppError::Internal(format!("write failed: {e}")))?;
            task.bytes_written.fetch_add(len, Ordering::Relaxed);
        }
        file.flush().await.ok();
        Ok(TransferOutcome::Completed)
    }

    async fn finalize(&self, task: &Arc<DownloadTask>, tmp_path: &Path, final_path: &Path) -> AppResult<()> {
        if let Some(expected) = task.expected_size {
            let actual = tokio::fs::metadata(tmp_path).await.map(|m| m.len()).unwrap_or(0);
            if actual != expected {
                return Err(AppError::DownloadFailed(format!(
                    "size mismatch: expected {expected}, got {actual} (file retained for inspection)"
                )));
            }
        }

        tokio::fs::rename(tmp_path, final_path)
            .await
            .map_err(|e| AppError::Internal(format!("atomic rename failed: {e}")))?;

        *task.state.write().unwrap() = DownloadState::Complete;
        *task.finished_at.write().unwrap() = Some(chrono::Utc::now());

        let summary = self.registry.refresh().await?;
        self.caches.invalidate_all();
        self.indexer.sync().await;

        let history_kind = match task.kind {
            DownloadKind::New => HistoryKind::Downloaded,
            DownloadKind::Update => HistoryKind::Updated,
        };
        for id in summary.opened.iter() {
            if let Ok(archive) = self.registry.get(id) {
                self.state.append_history(history_kind, archive.snapshot())?;
            }
        }

        info!(slug = %task.slug, "download complete");
        Ok(())
    }

    fn fail(&self, task: &Arc<DownloadTask>, message: String) {
        *task.state.write().unwrap() = DownloadState::Failed;
        *task.error.write().unwrap() = Some(message);
        *task.finished_at.write().unwrap() = Some(chrono::Utc::now());
    }

    // -- catalog / update detection --------------------------------------

    pub async fn fetch_catalog(&self, language: Option<&str>) -> AppResult<Vec<CatalogEntry>> {
        let mut url = KIWIX_CATALOG_URL.to_string();
        if let Some(lang) = language {
            url.push_str(&format!("?lang={lang}"));
        }
        let body = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| AppError::Internal(format!("catalog fetch failed: {e}")))?
            .text()
            .await
            .map_err(|e| AppError::Internal(format!("catalog body read failed: {e}")))?;
        Ok(parse_opds_feed(&body))
    }

    /// Compares each installed archive against the catalog by stripping
    /// the trailing date stamp from its filename and looking for a newer
    /// date under the same base name.
    pub async fn check_updates(&self) -> AppResult<Vec<(String, String)>> {
        let catalog = self.fetch_catalog(None).await.unwrap_or_default();
        let mut updates = Vec::new();
        for archive in self.registry.list() {
            let base = strip_date_stamp(&archive.id);
            let newest = catalog
                .iter()
                .filter(|c| strip_date_stamp(&c.slug) == base)
                .max_by(|a, b| a.date.cmp(&b.date));
            if let Some(candidate) = newest {
                if candidate.slug != archive.id {
                    updates.push((archive.id.clone(), candidate.slug.clone()));
                }
            }
        }
        Ok(updates)
    }

    /// Runs one scheduler tick: check for updates, then start a download
    /// for each one found. Only one auto-update cycle runs at a time —
    /// a cycle already in flight skips this tick entirely rather than
    /// queuing behind it.
    pub async fn run_auto_update_tick(self: &Arc<Self>) {
        if self
            .auto_update_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let updates = self.check_updates().await.unwrap_or_default();
        for (old_id, new_slug) in updates {
            let catalog = self.fetch_catalog(None).await.unwrap_or_default();
            if let Some(entry) = catalog.into_iter().find(|c| c.slug == new_slug) {
                let filename = format!("{new_slug}.zim");
                if let Err(e) = self.start(new_slug.clone(), entry.url, filename, entry.size, DownloadKind::Update) {
                    warn!(archive = %old_id, error = %e, "auto-update skipped");
                }
            }
        }

        self.auto_update_running.store(false, Ordering::Release);
    }

    /// Spawns the background scheduler loop at the configured cadence.
    /// Runs until the process exits; there is no explicit stop handle
    /// because the whole server shuts down together.
    pub fn spawn_auto_update_scheduler(self: Arc<Self>, cadence: Duration) {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(cadence).await;
                self.run_auto_update_tick().await;
            }
        });
    }
}

enum TransferOutcome {
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetryDecision {
    Retry(Duration),
    GiveUp,
}

/// Pure backoff policy: retry up to `MAX_RETRIES` times on anything that
/// isn't a terminal client error, waiting 1s/4s/16s between attempts.
/// `4xx` is terminal immediately — retrying a bad request never helps.
fn retry_decision(attempt: u32, error: &AppError) -> RetryDecision {
    let is_client_error = matches!(error, AppError::DownloadFailed(msg) if msg.contains("rejected request"));
    if is_client_error {
        return RetryDecision::GiveUp;
    }
    if attempt >= MAX_RETRIES {
        return RetryDecision::GiveUp;
    }
    RetryDecision::Retry(BACKOFFS[attempt as usize])
}

/// Strips a trailing `_YYYY-MM` / `-YYYY-MM-DD`-style date stamp so two
/// archive identifiers that differ only by the bundled snapshot date
/// compare equal.
fn strip_date_stamp(id: &str) -> String {
    let re = regex::Regex::new(r"[-_]\d{4}[-_]\d{2}(?:[-_]\d{2})?$").unwrap();
    re.replace(id, "").to_string()
}

/// Best-effort parse of a Kiwix OPDS (Atom) catalog feed. Uses the same
/// lenient HTML parser the reader already depends on for article
/// extraction rather than pulling in a dedicated XML crate — OPDS feeds
/// are well-formed enough that tag/attribute selectors find what we need.
fn parse_opds_feed(xml: &str) -> Vec<CatalogEntry> {
    let document = Html::parse_document(xml);
    let entry_selector = Selector::parse("entry").unwrap();
    let title_selector = Selector::parse("title").unwrap();
    let link_selector = Selector::parse("link").unwrap();
    let updated_selector = Selector::parse("updated").unwrap();
    let language_selector = Selector::parse("language").unwrap();
    let name_selector = Selector::parse("name").unwrap();

    let mut entries = Vec::new();
    for entry_el in document.select(&entry_selector) {
        let title = entry_el.select(&title_selector).next().map(|e| e.text().collect::<String>()).unwrap_or_default();
        let slug = entry_el.select(&name_selector).next().map(|e| e.text().collect::<String>()).unwrap_or_default();
        let language =
            entry_el.select(&language_selector).next().map(|e| e.text().collect::<String>()).unwrap_or_default();
        let date = entry_el.select(&updated_selector).next().map(|e| e.text().collect::<String>());

        let acquisition = entry_el.select(&link_selector).find(|l| {
            l.value().attr("rel") == Some("http://opds-spec.org/acquisition/open-access")
                || l.value().attr("type") == Some("application/x-zim")
        });
        let Some(link) = acquisition else { continue };
        let Some(url) = link.value().attr("href") else { continue };
        let size = link.value().attr("length").and_then(|s| s.parse().ok());

        if slug.is_empty() || title.is_empty() {
            continue;
        }
        entries.push(CatalogEntry { slug, title, url: url.to_string(), size, language, date });
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_decision_gives_up_on_client_error() {
        let err = AppError::DownloadFailed("server rejected request: 404 Not Found".into());
        assert_eq!(retry_decision(0, &err), RetryDecision::GiveUp);
    }

    #[test]
    fn retry_decision_backs_off_on_server_error() {
        let err = AppError::DownloadFailed("server error: 503 Service Unavailable".into());
        assert_eq!(retry_decision(0, &err), RetryDecision::Retry(Duration::from_secs(1)));
        assert_eq!(retry_decision(1, &err), RetryDecision::Retry(Duration::from_secs(4)));
        assert_eq!(retry_decision(2, &err), RetryDecision::Retry(Duration::from_secs(16)));
        assert_eq!(retry_decision(3, &err), RetryDecision::GiveUp);
    }

    #[test]
    fn strip_date_stamp_removes_trailing_dates() {
        assert_eq!(strip_date_stamp("wikipedia_en_all_nopic_2024-06"), "wikipedia_en_all_nopic");
        assert_eq!(strip_date_stamp("devdocs_en_rust"), "devdocs_en_rust");
    }

    #[test]
    fn parse_opds_feed_extracts_acquisition_links() {
        let xml = r#"<feed>
            <entry>
                <title>Mini Wikipedia</title>
                <name>wikipedia_en_all_mini</name>
                <language>eng</language>
                <updated>2024-06-01T00:00:00Z</updated>
                <link rel="http://opds-spec.org/acquisition/open-access"
                      href="https://download.kiwix.org/zim/wikipedia_en_all_mini.zim"
                      type="application/x-zim" length="123456"/>
            </entry>
        </feed>"#;
        let entries = parse_opds_feed(xml);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].slug, "wikipedia_en_all_mini");
        assert_eq!(entries[0].size, Some(123456));
    }
}
