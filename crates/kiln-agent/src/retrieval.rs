//! Best-effort retrieval pre-pass.
//!
//! Before a loop starts, an optional host-provided retriever can augment
//! the prompt with semantically relevant workspace snippets. The pre-pass
//! is strictly best-effort: trivial queries skip it, it runs under a hard
//! deadline, and every failure is silent.

use std::time::Duration;

use async_trait::async_trait;

use crate::config::RetrievalConfig;
use crate::error::Result;

/// One retrieved workspace snippet.
#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    /// Workspace-relative path of the source.
    pub path: String,
    /// The matching excerpt.
    pub snippet: String,
    /// Relevance score, higher is better.
    pub score: f32,
}

/// Host-provided semantic search over the workspace.
#[async_trait]
pub trait RetrievalAugmenter: Send + Sync {
    /// Return the most relevant chunks for a query, best first.
    async fn retrieve(&self, query: &str) -> Result<Vec<RetrievedChunk>>;
}

/// At most this many chunks make it into the prompt.
const MAX_CHUNKS: usize = 5;

/// Whether a query is too trivial to be worth a retrieval round-trip.
pub fn is_trivial_query(query: &str, config: &RetrievalConfig) -> bool {
    let trimmed = query.trim();
    trimmed.starts_with('/')
        || trimmed.split_whitespace().count() < config.min_tokens
        || trimmed.len() < config.min_len
}

/// Run the pre-pass. Returns a context block to prepend to the prompt, or
/// `None` when skipped, empty, timed out, or failed.
pub async fn augment_query(
    augmenter: &dyn RetrievalAugmenter,
    query: &str,
    config: &RetrievalConfig,
) -> Option<String> {
    if is_trivial_query(query, config) {
        tracing::trace!("retrieval pre-pass skipped for trivial query");
        return None;
    }

    let chunks = match tokio::time::timeout(config.deadline, augmenter.retrieve(query)).await {
        Ok(Ok(chunks)) => chunks,
        Ok(Err(e)) => {
            tracing::debug!(error = %e, "retrieval pre-pass failed");
            return None;
        }
        Err(_) => {
            tracing::debug!(deadline = ?config.deadline, "retrieval pre-pass timed out");
            return None;
        }
    };

    if chunks.is_empty() {
        return None;
    }

    let mut block = String::from("Possibly relevant workspace context:\n");
    for chunk in chunks.iter().take(MAX_CHUNKS) {
        block.push_str(&format!("--- {} ---\n{}\n", chunk.path, chunk.snippet.trim()));
    }
    Some(block)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AgentError;

    struct FixedRetriever {
        chunks: Vec<RetrievedChunk>,
    }

    #[async_trait]
    impl RetrievalAugmenter for FixedRetriever {
        async fn retrieve(&self, _query: &str) -> Result<Vec<RetrievedChunk>> {
            Ok(self.chunks.clone())
        }
    }

    struct SlowRetriever;

    #[async_trait]
    impl RetrievalAugmenter for SlowRetriever {
        async fn retrieve(&self, _query: &str) -> Result<Vec<RetrievedChunk>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Vec::new())
        }
    }

    struct FailingRetriever;

    #[async_trait]
    impl RetrievalAugmenter for FailingRetriever {
        async fn retrieve(&self, _query: &str) -> Result<Vec<RetrievedChunk>> {
            Err(AgentError::Internal("index not built".into()))
        }
    }

    fn config() -> RetrievalConfig {
        RetrievalConfig {
            deadline: Duration::from_millis(50),
            min_tokens: 3,
            min_len: 12,
        }
    }

    #[test]
    fn trivial_queries_are_skipped() {
        let cfg = config();
        assert!(is_trivial_query("/help", &cfg));
        assert!(is_trivial_query("fix this", &cfg)); // two tokens
        assert!(is_trivial_query("ok go now", &cfg)); // short byte length
        assert!(!is_trivial_query("where is the config loaded from", &cfg));
    }

    #[tokio::test]
    async fn augments_with_retrieved_chunks() {
        let retriever = FixedRetriever {
            chunks: vec![RetrievedChunk {
                path: "src/config.rs".into(),
                snippet: "pub struct Config { .. }".into(),
                score: 0.9,
            }],
        };
        let block = augment_query(&retriever, "where is the config loaded from", &config())
            .await
            .unwrap();
        assert!(block.contains("src/config.rs"));
        assert!(block.contains("pub struct Config"));
    }

    #[tokio::test]
    async fn timeout_is_silent() {
        let result = augment_query(&SlowRetriever, "where is the config loaded from", &config()).await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn failure_is_silent() {
        let result =
            augment_query(&FailingRetriever, "where is the config loaded from", &config()).await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn empty_results_yield_no_block() {
        let retriever = FixedRetriever { chunks: Vec::new() };
        assert!(
            augment_query(&retriever, "where is the config loaded from", &config())
                .await
                .is_none()
        );
    }
}
