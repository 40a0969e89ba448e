//! Reader & resolver (component F) — article fetch, snippet extraction,
//! thumbnail derivation, and cross-archive URL rewriting.

use std::sync::Arc;

use scraper::{Html, Selector};
use tokio::sync::Semaphore;

use crate::archive::ArchiveRegistry;
use crate::error::{AppError, AppResult};
use crate::titleindex::TitleIndex;
use crate::types::Kind;

const RESOLVE_CONCURRENCY: usize = 8;
const SNIPPET_FALLBACK_LEN: usize = 240;

#[derive(Debug, Clone, serde::Serialize)]
pub struct ReadResult {
    pub title: String,
    pub text: String,
    pub mime: String,
}

pub struct Reader {
    registry: Arc<ArchiveRegistry>,
    title_indexes: Arc<dashmap::DashMap<String, Arc<TitleIndex>>>,
}

impl Reader {
    pub fn new(registry: Arc<ArchiveRegistry>, title_indexes: Arc<dashmap::DashMap<String, Arc<TitleIndex>>>) -> Self {
        Self { registry, title_indexes }
    }

    /// Fetches an entry under the registry's global lock, decodes it as
    /// UTF-8, and converts HTML to plain text: strip script/style, unwrap
    /// remaining tags, collapse whitespace, truncate at `max_length` on a
    /// word boundary.
    pub async fn read(&self, archive_id: &str, path: &str, max_length: usize) -> AppResult<ReadResult> {
        let archive = self.registry.get(archive_id)?;
        let _global = self.registry.global_lock().await;
        let (title, raw_html, mime) = fetch_entry(&archive, path)?;

        let text = if mime.starts_with("text/html") {
            html_to_text(&raw_html)
        } else {
            raw_html
        };
        let truncated = truncate_at_word_boundary(&text, max_length);

        Ok(ReadResult { title, text: truncated, mime })
    }

    /// Fetches an entry's raw bytes and mimetype without any text decoding,
    /// for `/w/<zim>/<path>` and thumbnail serving. Same locking discipline
    /// as `read`: global lock held for the whole native fetch.
    pub async fn raw(&self, archive_id: &str, path: &str) -> AppResult<(Vec<u8>, String)> {
        let archive = self.registry.get(archive_id)?;
        if let Some(entry_path) = path.strip_suffix(".thumb") {
            let _ = entry_path;
            if let Some(bytes) = archive.illustration.clone() {
                return Ok((bytes, "image/png".to_string()));
            }
            return Err(AppError::NotFound(format!("no illustration for '{archive_id}'")));
        }

        let _global = self.registry.global_lock().await;
        let path_owned = path.to_string();
        let archive_path = archive.path.clone();
        let archive_id_owned = archive.id.clone();
        tokio::task::spawn_blocking(move || -> AppResult<(Vec<u8>, String)> {
            let zim = zim_rs::archive::Archive::new(archive_path.to_string_lossy().as_ref())
                .map_err(|e| AppError::ArchiveGone(format!("{archive_id_owned}: {e}")))?;
            let entry = zim
                .get_entry_by_path(&path_owned)
                .map_err(|_| AppError::NotFound(format!("no such entry '{path_owned}' in '{archive_id_owned}'")))?;
            let item = entry.get_item().map_err(|e| AppError::Internal(format!("entry read failed: {e}")))?;
            Ok((item.get_data(), item.get_mimetype()))
        })
        .await
        .map_err(|e| AppError::Internal(format!("raw fetch task panicked: {e}")))?
    }

    /// Picks a random article-namespace entry from one archive, under the
    /// global lock like every other native-entry access.
    pub async fn random(&self, archive_id: &str) -> AppResult<(String, String)> {
        let archive = self.registry.get(archive_id)?;
        let _global = self.registry.global_lock().await;
        let path = archive.path.clone();
        tokio::task::spawn_blocking(move || -> AppResult<(String, String)> {
            let zim = zim_rs::archive::Archive::new(path.to_string_lossy().as_ref())
                .map_err(|e| AppError::ArchiveGone(format!("{e}")))?;
            let entry = zim
                .get_random_entry()
                .map_err(|e| AppError::Internal(format!("random entry failed: {e}")))?;
            Ok((entry.get_path(), entry.get_title()))
        })
        .await
        .map_err(|e| AppError::Internal(format!("random task panicked: {e}")))?
    }

    /// First of: meta description, `og:description`, or the first 240
    /// non-boilerplate characters of the body text.
    pub async fn snippet(&self, archive_id: &str, path: &str) -> AppResult<String> {
        let archive = self.registry.get(archive_id)?;
        let _global = self.registry.global_lock().await;
        let (_title, raw_html, mime) = fetch_entry(&archive, path)?;
        if !mime.starts_with("text/html") {
            return Ok(truncate_at_word_boundary(&raw_html, SNIPPET_FALLBACK_LEN));
        }

        let document = Html::parse_document(&raw_html);
        if let Some(desc) = meta_content(&document, "description") {
            return Ok(desc);
        }
        if let Some(desc) = meta_content(&document, "og:description") {
            return Ok(desc);
        }

        let body_text = html_to_text(&raw_html);
        Ok(truncate_at_word_boundary(&strip_boilerplate(&body_text), SNIPPET_FALLBACK_LEN))
    }

    /// Derives a same-origin thumbnail URL from the entry's associated
    /// illustration link, when the archive's metadata carries one. Only
    /// called for the final truncated result set, never for discarded
    /// search candidates.
    pub fn thumbnail_url(&self, archive_id: &str, path: &str) -> Option<String> {
        let archive = self.registry.get(archive_id).ok()?;
        archive.illustration.as_ref()?;
        Some(format!("/w/{archive_id}/{path}.thumb"))
    }

    /// Resolves a single external URL to a candidate (archive_id, path)
    /// pair, trying known-site host patterns against the title indexes of
    /// installed archives.
    pub async fn resolve(&self, url: &str) -> AppResult<Option<(String, String)>> {
        let Some((host, article)) = parse_known_url(url) else { return Ok(None) };

        for candidate in self.candidate_archives_for_host(&host) {
            let Some(index) = self.title_indexes.get(&candidate).map(|e| e.clone()) else { continue };
            let path = format!("A/{article}");
            if index.prefix(&crate::titleindex::fold_title(&article), 1).await.map(|h| !h.is_empty()).unwrap_or(false)
            {
                return Ok(Some((candidate, path)));
            }
        }
        Ok(None)
    }

    /// Batch resolve, chunked at `RESOLVE_CONCURRENCY` concurrent lookups.
    pub async fn resolve_batch(&self, urls: Vec<String>) -> std::collections::HashMap<String, Option<(String, String)>> {
        let semaphore = Arc::new(Semaphore::new(RESOLVE_CONCURRENCY));
        let mut handles = Vec::new();
        for url in urls {
            let permit = semaphore.clone();
            let this = Reader { registry: self.registry.clone(), title_indexes: self.title_indexes.clone() };
            handles.push(tokio::spawn(async move {
                let _permit = permit.acquire_owned().await.expect("semaphore closed");
                let resolved = this.resolve(&url).await.unwrap_or(None);
                (url, resolved)
            }));
        }
        let mut out = std::collections::HashMap::new();
        for handle in handles {
            if let Ok((url, resolved)) = handle.await {
                out.insert(url, resolved);
            }
        }
        out
    }

    /// Known-site host table: maps an external hostname to candidate
    /// archives by language + name pattern. A plain linearly-scanned table
    /// — at most a few dozen entries, not worth indexing.
    fn candidate_archives_for_host(&self, host: &str) -> Vec<String> {
        // Wikimedia-family hosts carry the language as their leftmost
        // subdomain label (`en.wikipedia.org`, `de.wiktionary.org`, ...);
        // Stack Exchange subdomains name the site, not a language, so no
        // language filter applies there.
        let (name_pattern, language): (&str, Option<&str>) = match host {
            h if h.ends_with("wikipedia.org") => ("wikipedia", host.split('.').next()),
            h if h.ends_with("wiktionary.org") => ("wiktionary", host.split('.').next()),
            h if h.ends_with("wikiquote.org") => ("wikiquote", host.split('.').next()),
            h if h.ends_with("stackexchange.com") || h == "stackoverflow.com" => ("stackexchange", None),
            _ => return Vec::new(),
        };
        self.registry
            .list()
            .into_iter()
            .filter(|a| a.id.contains(name_pattern))
            .filter(|a| match language {
                Some(lang) => a.language.eq_ignore_ascii_case(lang),
                None => true,
            })
            .map(|a| a.id.clone())
            .collect()
    }
}

fn fetch_entry(archive: &crate::types::Archive, path: &str) -> AppResult<(String, String, String)> {
    let zim = zim_rs::archive::Archive::new(archive.path.to_string_lossy().as_ref())
        .map_err(|e| AppError::ArchiveGone(format!("{}: {e}", archive.id)))?;
    let entry = zim
        .get_entry_by_path(path)
        .map_err(|_| AppError::NotFound(format!("no such entry '{path}' in '{}'", archive.id)))?;
    let item = entry.get_item().map_err(|e| AppError::Internal(format!("entry read failed: {e}")))?;
    let mime = item.get_mimetype();
    let bytes = item.get_data();
    let text = String::from_utf8_lossy(&bytes).into_owned();
    Ok((entry.get_title(), text, mime))
}

/// Strips `<script>`/`<style>` contents, unwraps remaining tags, and
/// collapses whitespace runs to single spaces.
fn html_to_text(raw_html: &str) -> String {
    let document = Html::parse_document(raw_html);
    let body_selector = Selector::parse("body").unwrap_or_else(|_| Selector::parse("html").unwrap());
    let skip_selector = Selector::parse("script, style, nav, noscript").unwrap();

    let skip_texts: std::collections::HashSet<_> =
        document.select(&skip_selector).flat_map(|el| el.text().collect::<Vec<_>>()).collect();

    let mut text = String::new();
    for node in document.select(&body_selector) {
        for fragment in node.text() {
            if skip_texts.contains(fragment) {
                continue;
            }
            text.push_str(fragment);
            text.push(' ');
        }
    }
    collapse_whitespace(&text)
}

fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_was_space = false;
    for ch in text.chars() {
        if ch.is_whitespace() {
            if !last_was_space {
                out.push(' ');
            }
            last_was_space = true;
        } else {
            out.push(ch);
            last_was_space = false;
        }
    }
    out.trim().to_string()
}

fn truncate_at_word_boundary(text: &str, max_length: usize) -> String {
    if text.len() <= max_length {
        return text.to_string();
    }
    let slice = &text[..max_length];
    match slice.rfind(char::is_whitespace) {
        Some(idx) => slice[..idx].to_string(),
        None => slice.to_string(),
    }
}

/// Heuristic filter for navigation boilerplate: drops short all-caps or
/// link-list-looking fragments before taking the snippet's leading chars.
fn strip_boilerplate(text: &str) -> String {
    text.split(". ")
        .find(|sentence| sentence.split_whitespace().count() > 4)
        .unwrap_or(text)
        .to_string()
}

fn meta_content(document: &Html, name: &str) -> Option<String> {
    let selector = Selector::parse(&format!("meta[name='{name}'], meta[property='{name}']")).ok()?;
    document.select(&selector).next().and_then(|el| el.value().attr("content")).map(str::to_string)
}

/// Parses a known external URL into (host, article-title). Returns `None`
/// for unrecognized hosts.
fn parse_known_url(url: &str) -> Option<(String, String)> {
    let without_scheme = url.split("://").nth(1)?;
    let mut parts = without_scheme.splitn(2, '/');
    let host = parts.next()?.to_string();
    let rest = parts.next()?;
    let article = rest.strip_prefix("wiki/").unwrap_or(rest);
    Some((host, article.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_known_url_extracts_host_and_article() {
        let (host, article) = parse_known_url("https://en.wikipedia.org/wiki/Water").unwrap();
        assert_eq!(host, "en.wikipedia.org");
        assert_eq!(article, "Water");
    }

    #[test]
    fn parse_known_url_rejects_malformed_input() {
        assert!(parse_known_url("not-a-url").is_none());
    }

    #[test]
    fn truncate_at_word_boundary_does_not_split_words() {
        let text = "The quick brown fox jumps";
        let truncated = truncate_at_word_boundary(text, 12);
        assert_eq!(truncated, "The quick");
    }

    #[test]
    fn collapse_whitespace_merges_runs() {
        assert_eq!(collapse_whitespace("a   b\n\tc"), "a b c");
    }
}
