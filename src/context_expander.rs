//! The context expander (§4.3): enriches each search result with
//! surrounding material, then merges overlapping expansions within a
//! document so the final output never repeats a chunk.

use crate::config::ContextConfig;
use crate::error::CoreResult;
use crate::store::Store;
use crate::types::ScoredChunk;

/// One chunk contributing to an expanded result, kept in document order.
#[derive(Debug, Clone)]
struct Item {
    order: u32,
    chunk_id: String,
    content: String,
}

#[derive(Debug, Clone)]
struct Candidate {
    document_id: String,
    items: Vec<Item>,
    score: f32,
    origin_chunk_id: String,
}

impl Candidate {
    fn order_range(&self) -> (u32, u32) {
        let min = self.items.iter().map(|i| i.order).min().unwrap_or(0);
        let max = self.items.iter().map(|i| i.order).max().unwrap_or(0);
        (min, max)
    }
}

/// An expanded, deduplicated result ready for the downstream prompt / citation.
#[derive(Debug, Clone)]
pub struct ExpandedResult {
    pub document_id: String,
    pub order_range: (u32, u32),
    pub chunk_ids: Vec<String>,
    pub content: String,
    pub score: f32,
    pub origin_chunk_id: String,
}

/// Expand each result, then merge overlapping/adjacent same-document
/// expansions. See §4.3 for the exact contract; `config.max_context_items`
/// and `config.max_context_chars` bound each final merged group.
pub async fn expand_and_merge(
    store: &dyn Store,
    results: &[ScoredChunk],
    config: &ContextConfig,
) -> CoreResult<Vec<ExpandedResult>> {
    let mut candidates = Vec::with_capacity(results.len());
    for r in results {
        candidates.push(expand_one(store, r, config).await?);
    }

    Ok(merge_candidates(candidates, config))
}

async fn expand_one(store: &dyn Store, scored: &ScoredChunk, config: &ContextConfig) -> CoreResult<Candidate> {
    let chunk = &scored.chunk;

    let items = if chunk.metadata.label.map(|l| l.is_structural()).unwrap_or(false) {
        expand_structural(store, scored, config).await?
    } else {
        expand_radius(store, scored, config).await?
    };

    Ok(Candidate {
        document_id: chunk.document_id.clone(),
        items,
        score: scored.score,
        origin_chunk_id: chunk.chunk_id.clone(),
    })
}

async fn expand_structural(
    store: &dyn Store,
    scored: &ScoredChunk,
    config: &ContextConfig,
) -> CoreResult<Vec<Item>> {
    let chunk = &scored.chunk;
    let unit_id = chunk.metadata.structural_unit_id.clone();

    // Pull every chunk in the document; structural units are assumed small
    // relative to a document, so a full scan is simpler than a second store
    // operation dedicated to unit lookup.
    let siblings = store.adjacent_chunks(&chunk.document_id, 0, u32::MAX).await?;

    let mut run: Vec<Item> = Vec::new();
    let target_idx = siblings.iter().position(|c| c.chunk_id == chunk.chunk_id);

    if let (Some(idx), Some(unit_id)) = (target_idx, unit_id.as_ref()) {
        let mut lo = idx;
        while lo > 0 && siblings[lo - 1].metadata.structural_unit_id.as_ref() == Some(unit_id) {
            lo -= 1;
        }
        let mut hi = idx;
        while hi + 1 < siblings.len()
            && siblings[hi + 1].metadata.structural_unit_id.as_ref() == Some(unit_id)
        {
            hi += 1;
        }
        for c in &siblings[lo..=hi] {
            run.push(Item {
                order: c.order,
                chunk_id: c.chunk_id.clone(),
                content: c.content.clone(),
            });
        }
    } else {
        run.push(Item {
            order: chunk.order,
            chunk_id: chunk.chunk_id.clone(),
            content: chunk.content.clone(),
        });
    }

    Ok(apply_limits(run, config))
}

async fn expand_radius(store: &dyn Store, scored: &ScoredChunk, config: &ContextConfig) -> CoreResult<Vec<Item>> {
    let chunk = &scored.chunk;
    let low = chunk.order.saturating_sub(config.radius);
    let high = chunk.order.saturating_add(config.radius);

    let mut window = store.adjacent_chunks(&chunk.document_id, low, high).await?;
    window.sort_by_key(|c| c.order);

    let center = window
        .iter()
        .position(|c| c.chunk_id == chunk.chunk_id)
        .unwrap_or(0);

    let mut lo = center;
    while lo > 0 && !window[lo - 1].metadata.label.map(|l| l.is_structural()).unwrap_or(false) {
        lo -= 1;
    }
    let mut hi = center;
    while hi + 1 < window.len()
        && !window[hi + 1].metadata.label.map(|l| l.is_structural()).unwrap_or(false)
    {
        hi += 1;
    }

    let items: Vec<Item> = window[lo..=hi]
        .iter()
        .map(|c| Item {
            order: c.order,
            chunk_id: c.chunk_id.clone(),
            content: c.content.clone(),
        })
        .collect();

    Ok(apply_limits(items, config))
}

/// Truncate a single-result expansion to the configured hard limits,
/// keeping the leading items in order (deterministic, no scheduling
/// dependence).
fn apply_limits(items: Vec<Item>, config: &ContextConfig) -> Vec<Item> {
    let mut out = Vec::new();
    let mut chars = 0usize;
    for item in items {
        if out.len() >= config.max_context_items {
            break;
        }
        if chars + item.content.chars().count() > config.max_context_chars && !out.is_empty() {
            break;
        }
        chars += item.content.chars().count();
        out.push(item);
    }
    out
}

fn merge_candidates(candidates: Vec<Candidate>, config: &ContextConfig) -> Vec<ExpandedResult> {
    use std::collections::HashMap;

    let mut by_doc: HashMap<String, Vec<Candidate>> = HashMap::new();
    for c in candidates {
        by_doc.entry(c.document_id.clone()).or_default().push(c);
    }

    let mut out = Vec::new();
    for (document_id, mut group) in by_doc {
        group.sort_by_key(|c| c.order_range().0);

        let mut merged: Vec<Candidate> = Vec::new();
        for cand in group {
            let touches_last = merged.last().map(|last: &Candidate| {
                let (_, last_max) = last.order_range();
                let (cand_min, _) = cand.order_range();
                cand_min <= last_max.saturating_add(1)
            });

            if touches_last == Some(true) {
                let last = merged.last_mut().unwrap();
                for item in cand.items {
                    if !last.items.iter().any(|i| i.chunk_id == item.chunk_id) {
                        last.items.push(item);
                    }
                }
                last.items.sort_by_key(|i| i.order);
                if cand.score > last.score
                    || (cand.score == last.score && cand.origin_chunk_id < last.origin_chunk_id)
                {
                    last.score = cand.score;
                    last.origin_chunk_id = cand.origin_chunk_id;
                }
            } else {
                merged.push(cand);
            }
        }

        for cand in merged {
            let mut items = cand.items;
            items.sort_by_key(|i| i.order);
            items.dedup_by(|a, b| a.chunk_id == b.chunk_id);
            let items = apply_limits(items, config);

            let order_range = (
                items.iter().map(|i| i.order).min().unwrap_or(0),
                items.iter().map(|i| i.order).max().unwrap_or(0),
            );
            let chunk_ids = items.iter().map(|i| i.chunk_id.clone()).collect();
            let content = items
                .iter()
                .map(|i| i.content.as_str())
                .collect::<Vec<_>>()
                .join("\n\n");

            out.push(ExpandedResult {
                document_id: document_id.clone(),
                order_range,
                chunk_ids,
                content,
                score: cand.score,
                origin_chunk_id: cand.origin_chunk_id,
            });
        }
    }

    out.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.origin_chunk_id.cmp(&b.origin_chunk_id))
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use crate::types::{Chunk, ChunkLabel, ChunkMetadata, Document};
    use std::collections::HashMap;

    fn text_chunk(id: &str, doc: &str, order: u32, content: &str) -> Chunk {
        Chunk {
            chunk_id: id.into(),
            document_id: doc.into(),
            order,
            content: content.into(),
            metadata: ChunkMetadata {
                label: Some(ChunkLabel::Text),
                ..Default::default()
            },
            embedding: vec![],
        }
    }

    fn table_chunk(id: &str, doc: &str, order: u32, unit: &str, content: &str) -> Chunk {
        Chunk {
            chunk_id: id.into(),
            document_id: doc.into(),
            order,
            content: content.into(),
            metadata: ChunkMetadata {
                label: Some(ChunkLabel::Table),
                structural_unit_id: Some(unit.into()),
                ..Default::default()
            },
            embedding: vec![],
        }
    }

    fn doc(id: &str) -> Document {
        Document {
            document_id: id.into(),
            uri: format!("doc://{id}"),
            title: None,
            metadata: HashMap::new(),
            created_at: 0,
            updated_at: 0,
        }
    }

    #[tokio::test]
    async fn test_adjacency_merge_within_radius() {
        let chunks: Vec<Chunk> = (0..10).map(|i| text_chunk(&format!("c{i}"), "d1", i, "x")).collect();
        let store = InMemoryStore::new(vec![doc("d1")], chunks.clone());

        let hit2 = ScoredChunk { chunk: chunks[2].clone(), score: 0.8 };
        let hit3 = ScoredChunk { chunk: chunks[3].clone(), score: 0.6 };

        let config = ContextConfig { radius: 1, max_context_items: 100, max_context_chars: 100_000 };
        let expanded = expand_and_merge(&store, &[hit2, hit3], &config).await.unwrap();

        assert_eq!(expanded.len(), 1);
        assert_eq!(expanded[0].order_range, (1, 4));
        assert_eq!(expanded[0].score, 0.8);
        assert_eq!(expanded[0].origin_chunk_id, "c2");
    }

    #[tokio::test]
    async fn test_structural_expansion_ignores_radius() {
        let chunks = vec![
            table_chunk("t1", "d1", 0, "tbl", "row1"),
            table_chunk("t2", "d1", 1, "tbl", "row2"),
            table_chunk("t3", "d1", 2, "tbl", "row3"),
            text_chunk("c4", "d1", 3, "after table"),
        ];
        let store = InMemoryStore::new(vec![doc("d1")], chunks.clone());

        let hit = ScoredChunk { chunk: chunks[1].clone(), score: 0.9 };
        let config = ContextConfig { radius: 0, max_context_items: 100, max_context_chars: 100_000 };
        let expanded = expand_and_merge(&store, &[hit], &config).await.unwrap();

        assert_eq!(expanded.len(), 1);
        assert_eq!(expanded[0].content, "row1\n\nrow2\n\nrow3");
    }

    #[tokio::test]
    async fn test_disjoint_chunk_ids_across_results() {
        let chunks: Vec<Chunk> = (0..10).map(|i| text_chunk(&format!("c{i}"), "d1", i, "x")).collect();
        let store = InMemoryStore::new(vec![doc("d1")], chunks.clone());

        let far_apart = vec![
            ScoredChunk { chunk: chunks[0].clone(), score: 0.9 },
            ScoredChunk { chunk: chunks[8].clone(), score: 0.7 },
        ];
        let config = ContextConfig { radius: 1, max_context_items: 100, max_context_chars: 100_000 };
        let expanded = expand_and_merge(&store, &far_apart, &config).await.unwrap();

        assert_eq!(expanded.len(), 2);
        let all_ids: Vec<&String> = expanded.iter().flat_map(|e| e.chunk_ids.iter()).collect();
        let unique: std::collections::HashSet<_> = all_ids.iter().collect();
        assert_eq!(all_ids.len(), unique.len());
    }
}
