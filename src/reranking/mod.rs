//! The optional `Reranker` capability (§6) and the rerank-and-replace
//! pipeline step (§4.2).

pub mod llm_reranker;

pub use llm_reranker::LLMReranker;

use async_trait::async_trait;

use crate::config::SearchConfig;
use crate::error::CoreError;
use crate::types::ScoredChunk;

/// A pure relevance judge: given a query and candidate texts, produce a score
/// per candidate, higher is more relevant. Implementations are supplied by
/// the host application; the core ships none.
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(&self, query: &str, candidates: &[String]) -> Result<Vec<f32>, CoreError>;
}

/// Apply §4.2's rerank step to a fused candidate list: replace fusion scores
/// with the reranker's scores (never blend), stable re-sort, truncate to
/// `limit`. On any reranker failure (including timeout) the input is
/// returned unchanged — the failure is absorbed, not surfaced.
pub async fn rerank_and_replace(
    reranker: &dyn Reranker,
    query: &str,
    mut candidates: Vec<ScoredChunk>,
    config: &SearchConfig,
    limit: usize,
) -> Vec<ScoredChunk> {
    if candidates.is_empty() {
        return candidates;
    }

    let texts: Vec<String> = candidates.iter().map(|c| c.chunk.content.clone()).collect();

    let scored = match tokio::time::timeout(
        std::time::Duration::from_secs(20),
        reranker.rerank(query, &texts),
    )
    .await
    {
        Ok(Ok(scores)) if scores.len() == candidates.len() => scores,
        Ok(Ok(_)) => {
            tracing::warn!("reranker returned a mismatched candidate count, keeping fusion order");
            candidates.truncate(limit);
            return candidates;
        }
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "reranker failed, keeping fusion order");
            candidates.truncate(limit);
            return candidates;
        }
        Err(_) => {
            tracing::warn!("reranker timed out, keeping fusion order");
            candidates.truncate(limit);
            return candidates;
        }
    };

    for (candidate, score) in candidates.iter_mut().zip(scored) {
        candidate.score = score;
    }

    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk.chunk_id.cmp(&b.chunk.chunk_id))
    });
    candidates.truncate(limit);
    candidates
}
