//! Suggestion cache (D) and result cache (E).
//!
//! Both are sharded LRUs with a TTL checked at read time: an expired entry
//! is treated as a miss and evicted lazily rather than swept by a
//! background timer.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;

use crate::archive::ArchiveScope;
use crate::search::{SearchOpts, SearchResponse};
use crate::types::SearchResultRecord;

const SUGGESTION_CAP: usize = 500;
const SUGGESTION_TTL: Duration = Duration::from_secs(15 * 60);
const RESULT_CAP: usize = 100;
const RESULT_TTL: Duration = Duration::from_secs(5 * 60);

struct Entry<T> {
    value: T,
    inserted_at: Instant,
}

/// Per-archive LRU of (prefix -> results) for autocomplete. Cleared whole
/// on archive refresh since a refreshed archive may have renamed or
/// removed entries.
pub struct SuggestionCache {
    shards: Mutex<std::collections::HashMap<String, LruCache<String, Entry<Vec<SearchResultRecord>>>>>,
}

impl SuggestionCache {
    pub fn new() -> Self {
        Self { shards: Mutex::new(std::collections::HashMap::new()) }
    }

    pub fn get(&self, archive_id: &str, prefix: &str) -> Option<Vec<SearchResultRecord>> {
        let mut shards = self.shards.lock();
        let shard = shards.get_mut(archive_id)?;
        let entry = shard.get(prefix)?;
        if entry.inserted_at.elapsed() > SUGGESTION_TTL {
            shard.pop(prefix);
            return None;
        }
        Some(entry.value.clone())
    }

    pub fn put(&self, archive_id: &str, prefix: String, results: Vec<SearchResultRecord>) {
        let mut shards = self.shards.lock();
        let shard = shards.entry(archive_id.to_string()).or_insert_with(|| {
            LruCache::new(std::num::NonZeroUsize::new(SUGGESTION_CAP).unwrap())
        });
        shard.put(prefix, Entry { value: results, inserted_at: Instant::now() });
    }

    /// Clears one archive's suggestion cache. Called after that archive's
    /// title index is refreshed or rebuilt.
    pub fn invalidate(&self, archive_id: &str) {
        self.shards.lock().remove(archive_id);
    }

    pub fn invalidate_all(&self) {
        self.shards.lock().clear();
    }
}

impl Default for SuggestionCache {
    fn default() -> Self {
        Self::new()
    }
}

/// LRU of full search results keyed by a hash of the query signature.
/// `include_snippets` is deliberately excluded from the key: snippets are a
/// post-filter applied to the cached (or freshly computed) result set, not
/// part of what identifies the search itself.
pub struct ResultCache {
    cache: Mutex<LruCache<u64, Entry<SearchResponse>>>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self { cache: Mutex::new(LruCache::new(std::num::NonZeroUsize::new(RESULT_CAP).unwrap())) }
    }

    pub fn make_key(&self, query: &str, opts: &SearchOpts) -> u64 {
        let mut hasher = DefaultHasher::new();
        crate::titleindex::fold_title(query).hash(&mut hasher);
        scope_key(&opts.scope).hash(&mut hasher);
        opts.limit.hash(&mut hasher);
        opts.fast.hash(&mut hasher);
        hasher.finish()
    }

    pub fn get(&self, key: &u64) -> Option<SearchResponse> {
        let mut cache = self.cache.lock();
        let entry = cache.get(key)?;
        if entry.inserted_at.elapsed() > RESULT_TTL {
            cache.pop(key);
            return None;
        }
        Some(entry.value.clone())
    }

    pub fn put(&self, key: u64, response: SearchResponse) {
        self.cache.lock().put(key, Entry { value: response, inserted_at: Instant::now() });
    }

    /// Invalidated en masse on any archive registry change (add/remove/update).
    pub fn invalidate_all(&self) {
        self.cache.lock().clear();
    }
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new()
    }
}

fn scope_key(scope: &ArchiveScope) -> String {
    match scope {
        ArchiveScope::All => "all".to_string(),
        ArchiveScope::Single(id) => format!("zim:{id}"),
        ArchiveScope::Collection(name) => format!("collection:{name}"),
    }
}

/// Shared cache bundle handed to the HTTP layer and the search engine.
#[derive(Clone)]
pub struct Caches {
    pub suggestions: Arc<SuggestionCache>,
    pub results: Arc<ResultCache>,
}

impl Caches {
    pub fn new() -> Self {
        Self { suggestions: Arc::new(SuggestionCache::new()), results: Arc::new(ResultCache::new()) }
    }

    pub fn invalidate_all(&self) {
        self.suggestions.invalidate_all();
        self.results.invalidate_all();
    }
}

impl Default for Caches {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Kind, SearchPhase};

    #[test]
    fn result_cache_key_ignores_include_snippets() {
        let cache = ResultCache::new();
        let opts_a = SearchOpts { include_snippets: true, ..SearchOpts::default() };
        let opts_b = SearchOpts { include_snippets: false, ..SearchOpts::default() };
        assert_eq!(cache.make_key("water", &opts_a), cache.make_key("water", &opts_b));
    }

    #[test]
    fn result_cache_key_differs_by_scope() {
        let cache = ResultCache::new();
        let opts_all = SearchOpts { scope: ArchiveScope::All, ..SearchOpts::default() };
        let opts_single =
            SearchOpts { scope: ArchiveScope::Single("mini-wikipedia".into()), ..SearchOpts::default() };
        assert_ne!(cache.make_key("water", &opts_all), cache.make_key("water", &opts_single));
    }

    #[test]
    fn suggestion_cache_roundtrips_and_invalidates() {
        let cache = SuggestionCache::new();
        let results = vec![SearchResultRecord {
            archive: "mini-wikipedia".into(),
            path: "A/Water".into(),
            title: "Water".into(),
            kind: Kind::Article,
            score: 1.0,
            snippet: None,
            thumbnail_url: None,
            source_rank: 100,
        }];
        cache.put("mini-wikipedia", "wat".into(), results.clone());
        assert!(cache.get("mini-wikipedia", "wat").is_some());
        cache.invalidate("mini-wikipedia");
        assert!(cache.get("mini-wikipedia", "wat").is_none());
    }

    #[test]
    fn search_phase_round_trips_through_clone() {
        let phase = SearchPhase::Mixed;
        assert_eq!(phase, SearchPhase::Mixed);
    }
}
