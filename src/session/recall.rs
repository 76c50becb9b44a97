//! Prior-answer recall (§4.9): short-circuit the graph using session history
//! before it runs, by reusing history answers whose question is close enough
//! to the new one.

use std::collections::HashMap;

use crate::embeddings::Embedder;
use crate::types::{QAHistoryEntry, SearchAnswer};

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

/// Per-session, append-only embedding cache keyed by the exact question
/// string, so a repeated question across calls is never re-embedded.
#[derive(Debug, Default)]
pub struct RecallCache {
    embeddings: HashMap<String, Vec<f32>>,
}

impl RecallCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached or freshly-embedded vector for every entry in
    /// `history`, embedding only the cache misses in one batch call.
    ///
    /// On embedder failure, returns `None` — the caller skips recall and
    /// runs the graph normally (§4.9 determinism clause).
    async fn embeddings_for(
        &mut self,
        embedder: &dyn Embedder,
        history: &[QAHistoryEntry],
    ) -> Option<Vec<Vec<f32>>> {
        let misses: Vec<String> = history
            .iter()
            .filter(|h| !self.embeddings.contains_key(&h.question))
            .map(|h| h.question.clone())
            .collect();

        if !misses.is_empty() {
            let vectors = embedder.embed(&misses).await.ok()?;
            if vectors.len() != misses.len() {
                return None;
            }
            for (question, vector) in misses.into_iter().zip(vectors) {
                self.embeddings.insert(question, vector);
            }
        }

        history
            .iter()
            .map(|h| self.embeddings.get(&h.question).cloned())
            .collect()
    }
}

/// Select history entries whose question is similar enough to `question` and
/// convert them to `SearchAnswer`s, ready to seed `ResearchContext.qa_responses`.
///
/// Returns an empty vector (never an error) whenever recall can't proceed —
/// embedder failure, empty history, or nothing above threshold.
pub async fn recall(
    embedder: &dyn Embedder,
    cache: &mut RecallCache,
    question: &str,
    history: &[QAHistoryEntry],
    recall_threshold: f32,
) -> Vec<SearchAnswer> {
    if history.is_empty() {
        return Vec::new();
    }

    let query_embedding = match embedder.embed(&[question.to_string()]).await {
        Ok(mut v) => match v.pop() {
            Some(v) => v,
            None => return Vec::new(),
        },
        Err(_) => return Vec::new(),
    };

    let history_embeddings = match cache.embeddings_for(embedder, history).await {
        Some(e) => e,
        None => return Vec::new(),
    };

    history
        .iter()
        .zip(history_embeddings)
        .filter_map(|(entry, embedding)| {
            let similarity = cosine(&query_embedding, &embedding);
            if similarity >= recall_threshold {
                Some(SearchAnswer {
                    query: entry.question.clone(),
                    answer: entry.answer.clone(),
                    confidence: similarity,
                    cited_chunks: entry.citations.iter().map(|c| c.chunk_id.clone()).collect(),
                    citations: entry.citations.clone(),
                })
            } else {
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::fake::FakeEmbedder;

    fn entry(question: &str, answer: &str) -> QAHistoryEntry {
        QAHistoryEntry {
            question: question.into(),
            answer: answer.into(),
            citations: vec![],
            question_embedding: None,
        }
    }

    #[tokio::test]
    async fn test_recall_selects_entries_above_threshold() {
        let embedder = FakeEmbedder::new(16);
        let mut cache = RecallCache::new();
        let history = vec![
            entry("What is the capital of France?", "Paris."),
            entry("How do I bake bread?", "Use yeast."),
        ];

        let selected = recall(
            &embedder,
            &mut cache,
            "What is the capital of France?",
            &history,
            0.70,
        )
        .await;

        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].answer, "Paris.");
    }

    #[tokio::test]
    async fn test_recall_skips_on_embedder_failure() {
        let embedder = FakeEmbedder::failing(16);
        let mut cache = RecallCache::new();
        let history = vec![entry("Q?", "A.")];

        let selected = recall(&embedder, &mut cache, "Q?", &history, 0.70).await;
        assert!(selected.is_empty());
    }

    #[tokio::test]
    async fn test_recall_caches_embeddings_across_calls() {
        let embedder = FakeEmbedder::new(16);
        let mut cache = RecallCache::new();
        let history = vec![entry("What is the capital of France?", "Paris.")];

        recall(&embedder, &mut cache, "unrelated", &history, 0.70).await;
        assert_eq!(cache.embeddings.len(), 1);

        recall(&embedder, &mut cache, "still unrelated", &history, 0.70).await;
        assert_eq!(cache.embeddings.len(), 1);
    }
}
