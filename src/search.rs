//! Search engine (component C) — two-phase cross-archive query.
//!
//! Phase 1 fans out to every archive's title index in parallel under a hard
//! 800ms budget. Phase 2, skipped when `fast` is set, serializes on the
//! registry's global archive lock and queries each archive's native
//! full-text index in turn. Both phases feed one merge/dedup/rank pass.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::archive::{ArchiveRegistry, ArchiveScope};
use crate::cache::ResultCache;
use crate::error::{AppError, AppResult};
use crate::titleindex::TitleIndex;
use crate::types::{Collections, Kind, SearchPhase, SearchResultRecord};

const PHASE1_BUDGET: Duration = Duration::from_millis(800);
const DEFAULT_TOTAL_BUDGET: Duration = Duration::from_secs(12);

#[derive(Debug, Clone)]
pub struct SearchOpts {
    pub limit: usize,
    pub scope: ArchiveScope,
    pub fast: bool,
    pub timeout_ms: Option<u64>,
    pub include_snippets: bool,
}

impl Default for SearchOpts {
    fn default() -> Self {
        Self { limit: 10, scope: ArchiveScope::All, fast: false, timeout_ms: None, include_snippets: false }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResultRecord>,
    pub phase: SearchPhase,
    pub partial: bool,
}

pub struct SearchEngine {
    registry: Arc<ArchiveRegistry>,
    title_indexes: Arc<dashmap::DashMap<String, Arc<TitleIndex>>>,
    result_cache: Arc<ResultCache>,
    metrics: Arc<crate::metrics::Metrics>,
}

impl SearchEngine {
    pub fn new(
        registry: Arc<ArchiveRegistry>,
        title_indexes: Arc<dashmap::DashMap<String, Arc<TitleIndex>>>,
        result_cache: Arc<ResultCache>,
        metrics: Arc<crate::metrics::Metrics>,
    ) -> Self {
        Self { registry, title_indexes, result_cache, metrics }
    }

    /// Drains both phases before returning. This is what `/search` calls;
    /// `search_streaming` is the lower-level primitive it's built on.
    pub async fn search(&self, query: &str, opts: SearchOpts, collections: &Collections) -> AppResult<SearchResponse> {
        let cache_key = self.result_cache.make_key(query, &opts);
        if let Some(cached) = self.result_cache.get(&cache_key) {
            self.metrics.record_cache(true);
            return Ok(cached);
        }
        self.metrics.record_cache(false);

        let (tx, mut rx) = mpsc::channel(2);
        let engine_clone = self.clone_handles();
        let query_owned = query.to_string();
        let opts_clone = opts.clone();
        let collections_clone = collections.clone();
        tokio::spawn(async move {
            engine_clone.search_streaming(&query_owned, opts_clone, &collections_clone, tx).await;
        });

        let mut phase1: Option<SearchResponse> = None;
        let mut final_response: Option<SearchResponse> = None;
        while let Some(partial) = rx.recv().await {
            if partial.phase == SearchPhase::Title {
                phase1 = Some(partial);
            } else {
                final_response = Some(partial);
            }
        }

        let response = final_response.or(phase1).unwrap_or(SearchResponse {
            results: Vec::new(),
            phase: SearchPhase::Title,
            partial: false,
        });

        if !response.partial {
            self.result_cache.put(cache_key, response.clone());
        }
        Ok(response)
    }

    /// Sends phase 1's merged results on `tx` as soon as they're ready, then
    /// (unless `fast`) sends the fully merged phase-1+phase-2 result.
    /// Internal primitive; `search()` drains both messages and returns the
    /// final one.
    pub async fn search_streaming(
        &self,
        query: &str,
        opts: SearchOpts,
        collections: &Collections,
        tx: mpsc::Sender<SearchResponse>,
    ) {
        let started = Instant::now();
        let query_lower = crate::titleindex::fold_title(query);
        let tokens: Vec<String> = query_lower.split_whitespace().map(str::to_string).collect();
        let archive_ids = self.registry.ids_in_scope(&opts.scope, collections);

        let phase1_hits = self.run_phase1(&archive_ids, &query_lower, &tokens, opts.limit).await;
        let phase1_partial = started.elapsed() >= PHASE1_BUDGET;
        let phase1_ranked = self.merge_and_rank(phase1_hits, opts.limit);

        let _ = tx
            .send(SearchResponse { results: phase1_ranked.clone(), phase: SearchPhase::Title, partial: phase1_partial })
            .await;

        if opts.fast {
            return;
        }

        let total_budget = opts
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_TOTAL_BUDGET);
        let remaining = total_budget.saturating_sub(started.elapsed());

        let phase2_hits = timeout(remaining, self.run_phase2(&archive_ids, query)).await;
        let (phase2_results, phase2_partial) = match phase2_hits {
            Ok(hits) => (hits, false),
            Err(_) => (Vec::new(), true),
        };

        let mut combined = phase1_ranked;
        combined.extend(phase2_results);
        let final_results = self.merge_and_rank(combined, opts.limit);

        let _ = tx
            .send(SearchResponse {
                results: final_results,
                phase: SearchPhase::Mixed,
                partial: phase1_partial || phase2_partial,
            })
            .await;
    }

    async fn run_phase1(
        &self,
        archive_ids: &[String],
        query_lower: &str,
        tokens: &[String],
        limit: usize,
    ) -> Vec<SearchResultRecord> {
        let deadline = Instant::now() + PHASE1_BUDGET;
        let mut handles = Vec::new();
        for id in archive_ids {
            let Some(index) = self.title_indexes.get(id).map(|e| e.clone()) else { continue };
            let archive = match self.registry.get(id) {
                Ok(a) => a,
                Err(_) => continue,
            };
            let query_lower = query_lower.to_string();
            let tokens = tokens.to_vec();
            let id_owned = id.clone();
            handles.push(tokio::spawn(async move {
                let _guard = archive.title_lock.read().await;
                let prefix_query = tokens.first().map(String::as_str).unwrap_or(&query_lower);
                let prefix_hits = index.prefix(prefix_query, limit).await.unwrap_or_default();
                let mut token_hits = Vec::new();
                if tokens.len() > 1 {
                    if let Ok((hits, _)) = index.tokens(tokens, limit).await {
                        token_hits = hits;
                    }
                }
                (id_owned, archive.source_rank, prefix_hits, token_hits)
            }));
        }

        let mut results = Vec::new();
        let remaining = deadline.saturating_duration_since(Instant::now());
        if let Ok(outcomes) = timeout(remaining, futures::future::join_all(handles)).await {
            for outcome in outcomes.into_iter().flatten() {
                let (archive_id, source_rank, prefix_hits, token_hits) = outcome;
                for hit in prefix_hits {
                    let score = title_match_score(query_lower, &hit.title, source_rank);
                    results.push(SearchResultRecord {
                        archive: archive_id.clone(),
                        path: hit.path,
                        title: hit.title,
                        kind: hit.kind,
                        score,
                        snippet: None,
                        thumbnail_url: None,
                        source_rank,
                    });
                }
                for hit in token_hits {
                    // Multi-word token hits never clear the prefix tiers — they
                    // matched a substring or an FTS token, not the full query
                    // against the start of the title.
                    let score = TIER_SUBSTRING + source_rank as f64 * 0.01;
                    results.push(SearchResultRecord {
                        archive: archive_id.clone(),
                        path: hit.path,
                        title: hit.title,
                        kind: hit.kind,
                        score,
                        snippet: None,
                        thumbnail_url: None,
                        source_rank,
                    });
                }
            }
        }
        results
    }

    /// Runs under the registry's global lock, one archive at a time, in
    /// (source_rank desc, archive_id asc) order.
    async fn run_phase2(&self, archive_ids: &[String], query: &str) -> Vec<SearchResultRecord> {
        let _global = self.registry.global_lock().await;
        let mut ordered: Vec<_> = archive_ids
            .iter()
            .filter_map(|id| self.registry.get(id).ok().map(|a| (id.clone(), a.source_rank)))
            .collect();
        ordered.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let mut results = Vec::new();
        for (id, source_rank) in ordered {
            match self.native_fulltext_search(&id, query, 50).await {
                Ok(hits) => {
                    for (path, title, kind, native_score) in hits {
                        // FTS-only tier: the native rank and source_rank both
                        // only break ties within it, same scaling as phase 1's
                        // title-quality tiers.
                        let score = TIER_FTS_ONLY + native_score * 0.01 + source_rank as f64 * 0.01;
                        results.push(SearchResultRecord {
                            archive: id.clone(),
                            path,
                            title,
                            kind,
                            score,
                            snippet: None,
                            thumbnail_url: None,
                            source_rank,
                        });
                    }
                }
                Err(_) => continue,
            }
        }
        results
    }

    /// Runs the native full-text query for one archive. Called while the
    /// caller already holds the registry's global lock; a single archive's
    /// failure here is recorded and omitted, never fails the whole search.
    async fn native_fulltext_search(
        &self,
        archive_id: &str,
        query: &str,
        limit: usize,
    ) -> AppResult<Vec<(String, String, Kind, f64)>> {
        let archive = self.registry.get(archive_id)?;
        let path = archive.path.clone();
        let query = query.to_string();
        tokio::task::spawn_blocking(move || -> AppResult<Vec<(String, String, Kind, f64)>> {
            let zim = zim_rs::archive::Archive::new(path.to_string_lossy().as_ref())
                .map_err(|e| AppError::Internal(format!("failed to reopen for fts: {e}")))?;
            let searcher = zim_rs::search::Searcher::new(&zim);
            let query_obj = zim_rs::search::Query::new(&query);
            let search = searcher
                .search(&query_obj)
                .map_err(|e| AppError::Internal(format!("fts query failed: {e}")))?;
            let result_set = search
                .get_results(0, limit as u32)
                .map_err(|e| AppError::Internal(format!("fts results failed: {e}")))?;

            let mut hits = Vec::new();
            for (rank, result) in result_set.iter().enumerate() {
                hits.push((
                    result.get_path(),
                    result.get_title(),
                    crate::archive::classify_entry_path(&result.get_path()),
                    1.0 / (rank as f64 + 1.0),
                ));
            }
            Ok(hits)
        })
        .await
        .map_err(|e| AppError::Internal(format!("fts task panicked: {e}")))?
    }

    /// Dedups by (archive_id, canonical(path)), scores, ranks by
    /// (score desc, title length asc, title asc), and truncates to `limit`.
    fn merge_and_rank(&self, hits: Vec<SearchResultRecord>, limit: usize) -> Vec<SearchResultRecord> {
        let mut seen = HashSet::new();
        let mut deduped = Vec::new();
        for hit in hits {
            let key = (hit.archive.clone(), canonicalize_path(&hit.path));
            if seen.insert(key) {
                deduped.push(hit);
            }
        }
        deduped.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.title.len().cmp(&b.title.len()))
                .then_with(|| a.title.cmp(&b.title))
        });
        deduped.truncate(limit);
        deduped
    }

    fn clone_handles(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            title_indexes: self.title_indexes.clone(),
            result_cache: self.result_cache.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

/// Canonicalizes a path for dedup purposes: strip fragment, URL-decode,
/// collapse a leading `A/` namespace prefix.
fn canonicalize_path(path: &str) -> String {
    let without_fragment = path.split('#').next().unwrap_or(path);
    let decoded = percent_decode(without_fragment);
    decoded.strip_prefix("A/").unwrap_or(&decoded).to_string()
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(&s[i + 1..i + 3], 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Match-quality tiers from §4.3: exact >= prefix >= substring >= FTS-only.
/// `source_rank` (0-100) is folded in as a tie-breaker within a tier, never
/// enough on its own to cross into the tier above.
const TIER_EXACT: f64 = 30.0;
const TIER_PREFIX: f64 = 20.0;
const TIER_SUBSTRING: f64 = 10.0;
const TIER_FTS_ONLY: f64 = 1.0;

/// Scores a title-index hit against the folded query: exact fold match
/// scores highest, a hit where the query is a strict prefix of the title
/// scores next, anything else returned by `prefix()` (a GLOB match that
/// isn't a clean prefix once case/diacritics are stripped) falls to the
/// substring tier.
fn title_match_score(query_lower: &str, hit_title: &str, source_rank: i32) -> f64 {
    let hit_title_lower = crate::titleindex::fold_title(hit_title);
    let tier = if hit_title_lower == query_lower {
        TIER_EXACT
    } else if hit_title_lower.starts_with(query_lower) {
        TIER_PREFIX
    } else {
        TIER_SUBSTRING
    };
    tier + source_rank as f64 * 0.01
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_match_score_ranks_exact_above_prefix_above_substring() {
        let exact = title_match_score("water", "Water", 0);
        let prefix = title_match_score("wat", "Waterfall", 0);
        let substring = title_match_score("ater", "Water", 0);
        assert!(exact > prefix);
        assert!(prefix > substring);
    }

    #[test]
    fn title_match_score_uses_source_rank_only_as_a_tiebreak() {
        let low_rank_exact = title_match_score("water", "Water", 0);
        let high_rank_substring = title_match_score("ater", "Water", 100);
        assert!(low_rank_exact > high_rank_substring);
    }

    #[test]
    fn canonicalize_path_strips_fragment_and_a_prefix() {
        assert_eq!(canonicalize_path("A/Water#History"), "Water");
        assert_eq!(canonicalize_path("A/Fire"), "Fire");
    }

    #[test]
    fn dedup_key_ignores_fragment() {
        assert_eq!(canonicalize_path("A/Water#intro"), canonicalize_path("A/Water#history"));
    }
}
