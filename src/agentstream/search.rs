//! Narrow interface to the external document-search collaborator.
//!
//! Retrieval-grounded agents depend only on [`SearchProvider::search`]; the
//! actual search system lives outside this crate. [`MockSearchProvider`]
//! returns deterministic documents so the retrieval agents and the
//! orchestrator can be tested hermetically.

use async_trait::async_trait;
use std::error::Error;
use std::fmt;

use crate::agentstream::event::Citation;

/// One retrieved document.
#[derive(Debug, Clone)]
pub struct Document {
    /// Stable identifier used for cross-subquery deduplication.
    pub id: String,
    pub title: String,
    pub content: String,
    /// Provider-native relevance score (unnormalized).
    pub score: f64,
    pub source: Option<String>,
    pub url: Option<String>,
    pub page: Option<u32>,
}

impl Document {
    /// Project this document into a wire [`Citation`].
    pub fn to_citation(&self) -> Citation {
        Citation {
            title: self.title.clone(),
            source: self.source.clone(),
            snippet: Some(snippet(&self.content, 200)),
            url: self.url.clone(),
            page: self.page,
        }
    }
}

/// Options accepted by [`SearchProvider::search`].
#[derive(Debug, Clone)]
pub struct SearchOptions {
    /// Maximum documents to return.
    pub top_k: usize,
    /// Provider hint: `semantic`, `keyword`, or `hybrid`.
    pub strategy: Option<String>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            top_k: 5,
            strategy: None,
        }
    }
}

impl SearchOptions {
    pub fn with_top_k(top_k: usize) -> Self {
        Self {
            top_k,
            ..Self::default()
        }
    }
}

/// Failure reported by the search collaborator.
#[derive(Debug, Clone)]
pub struct SearchError(pub String);

impl fmt::Display for SearchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "search failed: {}", self.0)
    }
}

impl Error for SearchError {}

/// The collaborator contract: `search(query, options) → [Document]`.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(
        &self,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<Document>, SearchError>;
}

/// Deterministic search stub for tests and mock deployments.
///
/// Returns `top_k` documents derived from the query text. Queries
/// containing `"nothing"` return no hits and queries containing
/// `"searchfail"` fail, so agents' empty-result and error paths stay
/// testable.
pub struct MockSearchProvider;

#[async_trait]
impl SearchProvider for MockSearchProvider {
    async fn search(
        &self,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<Document>, SearchError> {
        let lowered = query.to_ascii_lowercase();
        if lowered.contains("searchfail") {
            return Err(SearchError("mock collaborator outage".to_string()));
        }
        if lowered.contains("nothing") {
            return Ok(Vec::new());
        }

        let slug = slugify(query);
        let docs = (0..options.top_k.min(5))
            .map(|i| Document {
                id: format!("doc-{}-{}", slug, i + 1),
                title: format!("Reference {} for '{}'", i + 1, query),
                content: format!(
                    "Deterministic mock document {} covering: {}. \
                     It restates the query with enough body text to exercise snippets.",
                    i + 1,
                    query
                ),
                score: 9.0 - i as f64,
                source: Some("mock-index".to_string()),
                url: Some(format!("https://example.invalid/{}/{}", slug, i + 1)),
                page: None,
            })
            .collect();
        Ok(docs)
    }
}

fn snippet(content: &str, max: usize) -> String {
    match content.char_indices().nth(max) {
        Some((idx, _)) => content[..idx].to_string(),
        None => content.to_string(),
    }
}

fn slugify(query: &str) -> String {
    let slug: String = query
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(12)
        .collect();
    if slug.is_empty() {
        "query".to_string()
    } else {
        slug.to_ascii_lowercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_is_deterministic() {
        let provider = MockSearchProvider;
        let a = provider
            .search("rust streams", &SearchOptions::default())
            .await
            .unwrap();
        let b = provider
            .search("rust streams", &SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(a.len(), b.len());
        assert_eq!(a[0].id, b[0].id);
        assert!(a[0].score > a[1].score);
    }

    #[tokio::test]
    async fn nothing_queries_return_empty() {
        let provider = MockSearchProvider;
        let docs = provider
            .search("nothing to see", &SearchOptions::default())
            .await
            .unwrap();
        assert!(docs.is_empty());
    }
}
