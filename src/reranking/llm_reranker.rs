//! An LLM-based listwise reranker: one chat call judges relevance of a
//! numbered list of candidate snippets against the query.
//!
//! Produces a monotonic-in-relevance score per candidate (highest score =
//! most relevant) rather than a permutation, so it composes with
//! `rerank_and_replace`'s score-replace contract. Falls back to ranking
//! failure (caller absorbs it) when the LLM is unreachable, times out, or
//! returns unparseable output.

use std::collections::HashSet;

use async_trait::async_trait;

use crate::error::CoreError;
use crate::llm::{ChatLLM, ChatMessage};
use crate::reranking::Reranker;

const RERANK_SNIPPET_CHARS: usize = 300;

pub struct LLMReranker {
    llm: std::sync::Arc<dyn ChatLLM>,
}

impl LLMReranker {
    pub fn new(llm: std::sync::Arc<dyn ChatLLM>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl Reranker for LLMReranker {
    async fn rerank(&self, query: &str, candidates: &[String]) -> Result<Vec<f32>, CoreError> {
        if candidates.len() <= 1 {
            return Ok(vec![1.0; candidates.len()]);
        }

        let snippets: String = candidates
            .iter()
            .enumerate()
            .map(|(i, text)| {
                let truncated: String = text.chars().take(RERANK_SNIPPET_CHARS).collect();
                format!("[{}] {}", i + 1, truncated)
            })
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = format!(
            "You are a search relevance judge. Given a user query and numbered document \
             snippets, rank the snippets by relevance to the query.\n\n\
             Query: \"{query}\"\n\n\
             Snippets:\n{snippets}\n\n\
             Return ONLY a JSON array of snippet numbers ordered from most relevant to least \
             relevant. Include ALL {} snippet numbers. Example: [3, 1, 5, 2, 4]\n\
             Output ONLY the JSON array, nothing else.",
            candidates.len(),
        );

        let response = self
            .llm
            .chat(&[ChatMessage::user(prompt)], &[])
            .await?;

        let text = response
            .text()
            .ok_or_else(|| CoreError::RerankerFailure("reranker call returned tool calls, not text".into()))?;

        let order = parse_ranking(text, candidates.len())
            .ok_or_else(|| CoreError::RerankerFailure("could not parse reranker output".into()))?;

        Ok(order_to_scores(&order, candidates.len()))
    }
}

/// Parse the LLM output into a zero-indexed ranking vector.
///
/// Three-tier strategy:
/// 1. Direct JSON parse of the full output
/// 2. Find `[...]` substring and parse that
/// 3. Extract all integers from raw text, deduplicate
fn parse_ranking(output: &str, expected_count: usize) -> Option<Vec<usize>> {
    let trimmed = output
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    if let Ok(indices) = serde_json::from_str::<Vec<usize>>(trimmed) {
        if validate_ranking(&indices, expected_count) {
            return Some(to_zero_indexed(indices));
        }
    }

    if let Some(start) = trimmed.find('[') {
        if let Some(end) = trimmed[start..].find(']') {
            let slice = &trimmed[start..=start + end];
            if let Ok(indices) = serde_json::from_str::<Vec<usize>>(slice) {
                if validate_ranking(&indices, expected_count) {
                    return Some(to_zero_indexed(indices));
                }
            }
        }
    }

    let numbers: Vec<usize> = trimmed
        .split(|c: char| !c.is_ascii_digit())
        .filter_map(|s| s.parse::<usize>().ok())
        .filter(|&n| n >= 1 && n <= expected_count)
        .collect();

    if numbers.len() >= (expected_count + 1) / 2 {
        let mut seen = HashSet::new();
        let deduped: Vec<usize> = numbers
            .into_iter()
            .filter(|n| seen.insert(*n))
            .map(|i| i.saturating_sub(1))
            .collect();
        if !deduped.is_empty() {
            return Some(deduped);
        }
    }

    None
}

fn validate_ranking(indices: &[usize], expected_count: usize) -> bool {
    !indices.is_empty() && indices.iter().all(|&i| i >= 1 && i <= expected_count)
}

fn to_zero_indexed(indices: Vec<usize>) -> Vec<usize> {
    indices.into_iter().map(|i| i.saturating_sub(1)).collect()
}

/// Convert a (possibly partial) ranking permutation into one score per
/// original candidate, highest for the first-ranked. Candidates the ranking
/// didn't mention get the lowest score, in their original relative order.
fn order_to_scores(order: &[usize], count: usize) -> Vec<f32> {
    let mut scores = vec![0.0f32; count];
    let mut rank = count;
    let mut seen = vec![false; count];

    for &idx in order {
        if idx < count && !seen[idx] {
            scores[idx] = rank as f32 / count as f32;
            seen[idx] = true;
            rank -= 1;
        }
    }
    for seen_flag in seen.iter().enumerate() {
        if !seen_flag.1 {
            scores[seen_flag.0] = rank as f32 / count as f32;
            rank = rank.saturating_sub(1);
        }
    }
    scores
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_clean_json() {
        let output = "[3, 1, 2]";
        let result = parse_ranking(output, 3).unwrap();
        assert_eq!(result, vec![2, 0, 1]);
    }

    #[test]
    fn test_parse_json_with_fences() {
        let output = "```json\n[2, 1, 3]\n```";
        let result = parse_ranking(output, 3).unwrap();
        assert_eq!(result, vec![1, 0, 2]);
    }

    #[test]
    fn test_parse_garbage_returns_none() {
        let output = "I don't understand what you want.";
        assert!(parse_ranking(output, 5).is_none());
    }

    #[test]
    fn test_order_to_scores_monotonic() {
        let scores = order_to_scores(&[2, 0, 1], 3);
        assert!(scores[2] > scores[0]);
        assert!(scores[0] > scores[1]);
    }
}
