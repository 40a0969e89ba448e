//! Persistent state (component I) — `cache.json`, `password`,
//! `collections.json`, `history.json` under `<data_dir>/`.
//!
//! Everything here is read once at startup and rewritten through a
//! temp-file-then-rename so a process kill mid-write leaves the previous
//! file intact: `fs::write` to a `.tmp` sibling, then `fs::rename` over the
//! real path, which POSIX guarantees is atomic on the same filesystem.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};

use crate::archive::CachedMetadata;
use crate::error::{AppError, AppResult};
use crate::types::{ArchiveRecord, Collections, HistoryEvent, HistoryKind};

const HISTORY_CAP: usize = 1_000;
const LEGACY_FILES: &[&str] = &["cache.json", "password", "collections.json", "history.json"];

pub struct PersistentState {
    data_dir: PathBuf,
    collections: RwLock<Collections>,
    history: RwLock<VecDeque<HistoryEvent>>,
    password_hash: RwLock<Option<String>>,
}

impl PersistentState {
    /// Loads every persisted file under `data_dir`, migrating legacy
    /// flat files from the archive directory root on first run.
    pub fn load(data_dir: &Path, archive_dir: &Path) -> AppResult<Self> {
        std::fs::create_dir_all(data_dir)
            .map_err(|e| AppError::Internal(format!("cannot create data_dir: {e}")))?;
        migrate_legacy_files(archive_dir, data_dir)?;

        let collections: Collections = read_json_or_default(&data_dir.join("collections.json"))?;
        let history: Vec<HistoryEvent> = read_json_or_default(&data_dir.join("history.json"))?;
        let password_hash = std::fs::read_to_string(data_dir.join("password"))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            collections: RwLock::new(collections),
            history: RwLock::new(history.into_iter().collect()),
            password_hash: RwLock::new(password_hash),
        })
    }

    // -- collections --------------------------------------------------

    pub fn collections(&self) -> Collections {
        self.collections.read().clone()
    }

    pub fn get_collection(&self, name: &str) -> Option<Vec<String>> {
        self.collections.read().0.get(name).cloned()
    }

    pub fn put_collection(&self, name: String, archive_ids: Vec<String>) -> AppResult<()> {
        self.collections.write().0.insert(name, archive_ids);
        self.persist_collections()
    }

    pub fn delete_collection(&self, name: &str) -> AppResult<bool> {
        let removed = self.collections.write().0.remove(name).is_some();
        if removed {
            self.persist_collections()?;
        }
        Ok(removed)
    }

    fn persist_collections(&self) -> AppResult<()> {
        let snapshot = self.collections.read().clone();
        atomic_write_json(&self.data_dir.join("collections.json"), &snapshot)
    }

    // -- history --------------------------------------------------------

    pub fn history(&self) -> Vec<HistoryEvent> {
        self.history.read().iter().cloned().collect()
    }

    /// Appends an event to the ring, trimming the oldest entries beyond
    /// `HISTORY_CAP`, then persists the whole ring.
    pub fn append_history(&self, kind: HistoryKind, archive: ArchiveRecord) -> AppResult<()> {
        let event = HistoryEvent { timestamp: chrono::Utc::now(), kind, archive };
        {
            let mut history = self.history.write();
            history.push_back(event);
            while history.len() > HISTORY_CAP {
                history.pop_front();
            }
        }
        self.persist_history()
    }

    fn persist_history(&self) -> AppResult<()> {
        let snapshot: Vec<HistoryEvent> = self.history.read().iter().cloned().collect();
        atomic_write_json(&self.data_dir.join("history.json"), &snapshot)
    }

    // -- management password ---------------------------------------------

    pub fn is_password_set(&self) -> bool {
        self.password_hash.read().is_some()
    }

    pub fn set_password(&self, raw: &str) -> AppResult<()> {
        let hash = bcrypt::hash(raw, bcrypt::DEFAULT_COST)
            .map_err(|e| AppError::Internal(format!("password hash failed: {e}")))?;
        *self.password_hash.write() = Some(hash.clone());
        atomic_write_bytes(&self.data_dir.join("password"), hash.as_bytes())
    }

    /// When no password is configured, every candidate is accepted —
    /// callers gate this behind `is_password_set()` / `manage_password`
    /// from `Config` before deciding whether auth applies at all.
    pub fn verify_password(&self, candidate: &str) -> bool {
        match self.password_hash.read().as_ref() {
            Some(hash) => bcrypt::verify(candidate, hash).unwrap_or(false),
            None => true,
        }
    }

    // -- archive metadata cache -------------------------------------------

    pub fn persist_archive_cache(&self, snapshot: &[CachedMetadata]) -> AppResult<()> {
        atomic_write_json(&self.data_dir.join("cache.json"), &snapshot)
    }

    pub fn load_archive_cache(&self) -> Vec<CachedMetadata> {
        read_json_or_default(&self.data_dir.join("cache.json")).unwrap_or_default()
    }
}

fn read_json_or_default<T: Default + DeserializeOwned>(path: &Path) -> AppResult<T> {
    match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map_err(|e| AppError::Internal(format!("corrupt state file {}: {e}", path.display()))),
        Err(_) => Ok(T::default()),
    }
}

fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> AppResult<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| AppError::Internal(format!("serialize failed for {}: {e}", path.display())))?;
    atomic_write_bytes(path, &bytes)
}

fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> AppResult<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes).map_err(|e| AppError::Internal(format!("write {} failed: {e}", tmp.display())))?;
    std::fs::rename(&tmp, path).map_err(|e| AppError::Internal(format!("rename onto {} failed: {e}", path.display())))?;
    Ok(())
}

/// Moves any of the legacy flat files that still live at `archive_dir`'s
/// root into `data_dir`, leaving files already present in `data_dir`
/// untouched (a partial migration from a previous run is never retried).
fn migrate_legacy_files(archive_dir: &Path, data_dir: &Path) -> AppResult<()> {
    for name in LEGACY_FILES {
        let legacy_path = archive_dir.join(name);
        let new_path = data_dir.join(name);
        if legacy_path.exists() && !new_path.exists() {
            std::fs::rename(&legacy_path, &new_path)
                .or_else(|_| std::fs::copy(&legacy_path, &new_path).map(|_| ()))
                .map_err(|e| AppError::Internal(format!("legacy migration of {name} failed: {e}")))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Category;

    fn sample_record(id: &str) -> ArchiveRecord {
        ArchiveRecord {
            id: id.to_string(),
            title: "Mini Wikipedia".into(),
            description: String::new(),
            language: "en".into(),
            entries: 100,
            size: 1024,
            category: Category::Wikipedia,
            has_fts: true,
            update_available: false,
        }
    }

    #[test]
    fn collections_roundtrip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let archive_dir = tempfile::tempdir().unwrap();
        let state = PersistentState::load(dir.path(), archive_dir.path()).unwrap();
        state.put_collection("favorites".into(), vec!["mini-wikipedia".into()]).unwrap();

        let reloaded = PersistentState::load(dir.path(), archive_dir.path()).unwrap();
        assert_eq!(reloaded.get_collection("favorites"), Some(vec!["mini-wikipedia".into()]));
    }

    #[test]
    fn history_is_capped_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let archive_dir = tempfile::tempdir().unwrap();
        let state = PersistentState::load(dir.path(), archive_dir.path()).unwrap();
        for i in 0..(HISTORY_CAP + 10) {
            state
                .append_history(HistoryKind::Downloaded, sample_record(&format!("archive-{i}")))
                .unwrap();
        }
        assert_eq!(state.history().len(), HISTORY_CAP);

        let reloaded = PersistentState::load(dir.path(), archive_dir.path()).unwrap();
        assert_eq!(reloaded.history().len(), HISTORY_CAP);
    }

    #[test]
    fn password_round_trips_and_rejects_wrong_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let archive_dir = tempfile::tempdir().unwrap();
        let state = PersistentState::load(dir.path(), archive_dir.path()).unwrap();
        assert!(!state.is_password_set());
        assert!(state.verify_password("anything"));

        state.set_password("hunter2").unwrap();
        assert!(state.is_password_set());
        assert!(state.verify_password("hunter2"));
        assert!(!state.verify_password("wrong"));
    }

    #[test]
    fn legacy_files_migrate_into_data_dir_on_first_load() {
        let archive_dir = tempfile::tempdir().unwrap();
        let data_dir = archive_dir.path().join(".zimi");
        std::fs::write(archive_dir.path().join("collections.json"), r#"{"kids":["devdocs"]}"#).unwrap();

        let state = PersistentState::load(&data_dir, archive_dir.path()).unwrap();
        assert_eq!(state.get_collection("kids"), Some(vec!["devdocs".to_string()]));
        assert!(!archive_dir.path().join("collections.json").exists());
        assert!(data_dir.join("collections.json").exists());
    }
}
