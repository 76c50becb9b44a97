//! Result fusion for hybrid (vector + full-text) search.
//!
//! `reciprocal_rank_fusion` is the default: rank-based, no score
//! normalization, ties broken by chunk id. `score_aware_rrf` and
//! `weighted_fusion` are opt-in alternatives a caller can select explicitly;
//! nothing in the search path invokes them implicitly.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy)]
pub enum HybridSource {
    Vector,
    TextSearch,
    Both,
}

/// Reciprocal Rank Fusion — merges ranked lists without score normalization.
/// Formula: rrf_score(doc) = Σ 1/(k + rank_i) for each list containing doc.
/// Ties are broken by chunk id, ascending, so fusion output is deterministic.
pub fn reciprocal_rank_fusion(
    vector_results: Vec<(String, f32)>,
    fts_results: Vec<(String, f32)>,
    k: usize,
    top_k: usize,
) -> Vec<(String, f32, HybridSource)> {
    let mut scores: HashMap<String, (f32, HybridSource)> = HashMap::new();

    for (rank, (id, _score)) in vector_results.iter().enumerate() {
        let rrf = 1.0 / (k as f32 + rank as f32 + 1.0);
        scores
            .entry(id.clone())
            .and_modify(|(s, src)| {
                *s += rrf;
                *src = HybridSource::Both;
            })
            .or_insert((rrf, HybridSource::Vector));
    }

    for (rank, (id, _score)) in fts_results.iter().enumerate() {
        let rrf = 1.0 / (k as f32 + rank as f32 + 1.0);
        scores
            .entry(id.clone())
            .and_modify(|(s, src)| {
                *s += rrf;
                *src = HybridSource::Both;
            })
            .or_insert((rrf, HybridSource::TextSearch));
    }

    let mut merged: Vec<(String, f32, HybridSource)> = scores
        .into_iter()
        .map(|(id, (score, source))| (id, score, source))
        .collect();

    merged.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    merged.truncate(top_k);
    merged
}

/// Score-aware RRF — standard RRF weighted by normalized original similarity scores.
/// Unlike plain RRF which discards quality signals, this modulates rank-based scores
/// by the original similarity/BM25 scores so high-confidence matches get a boost.
/// `score_weight` controls the blend: 0.0 = pure RRF, higher = more score influence.
pub fn score_aware_rrf(
    vector_results: Vec<(String, f32)>,
    fts_results: Vec<(String, f32)>,
    k: usize,
    top_k: usize,
    score_weight: f32,
) -> Vec<(String, f32, HybridSource)> {
    let normalize = |results: &[(String, f32)]| -> HashMap<String, f32> {
        if results.is_empty() {
            return HashMap::new();
        }
        let max = results.iter().map(|(_, s)| *s).fold(f32::MIN, f32::max);
        let min = results.iter().map(|(_, s)| *s).fold(f32::MAX, f32::min);
        if (max - min).abs() < 1e-9 {
            // All scores identical — assign uniform normalized score
            return results.iter().map(|(id, _)| (id.clone(), 0.5)).collect();
        }
        let range = max - min;
        results
            .iter()
            .map(|(id, s)| (id.clone(), (s - min) / range))
            .collect()
    };

    let vec_norm = normalize(&vector_results);
    let fts_norm = normalize(&fts_results);

    let mut scores: HashMap<String, (f32, HybridSource)> = HashMap::new();

    for (rank, (id, _)) in vector_results.iter().enumerate() {
        let rrf = 1.0 / (k as f32 + rank as f32 + 1.0);
        let orig_score = vec_norm.get(id).copied().unwrap_or(0.0);
        let combined = rrf * (1.0 + score_weight * orig_score);
        scores
            .entry(id.clone())
            .and_modify(|(s, src)| {
                *s += combined;
                *src = HybridSource::Both;
            })
            .or_insert((combined, HybridSource::Vector));
    }

    for (rank, (id, _)) in fts_results.iter().enumerate() {
        let rrf = 1.0 / (k as f32 + rank as f32 + 1.0);
        let orig_score = fts_norm.get(id).copied().unwrap_or(0.0);
        let combined = rrf * (1.0 + score_weight * orig_score);
        scores
            .entry(id.clone())
            .and_modify(|(s, src)| {
                *s += combined;
                *src = HybridSource::Both;
            })
            .or_insert((combined, HybridSource::TextSearch));
    }

    let mut merged: Vec<(String, f32, HybridSource)> = scores
        .into_iter()
        .map(|(id, (score, source))| (id, score, source))
        .collect();

    merged.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    merged.truncate(top_k);

    // Normalize scores to [0, 1] so downstream thresholds work correctly.
    // Raw RRF scores are in the 0.01-0.05 range which makes threshold filtering meaningless.
    if let Some(max_score) = merged.first().map(|(_, s, _)| *s) {
        if max_score > 0.0 {
            for item in &mut merged {
                item.1 /= max_score;
            }
        }
    }

    merged
}

/// Weighted combination — alpha-blends normalized vector and FTS scores
pub fn weighted_fusion(
    vector_results: Vec<(String, f32)>,
    fts_results: Vec<(String, f32)>,
    alpha: f32,
    top_k: usize,
) -> Vec<(String, f32, HybridSource)> {
    let normalize = |results: &[(String, f32)]| -> Vec<(String, f32)> {
        if results.is_empty() {
            return vec![];
        }
        let max = results.iter().map(|(_, s)| *s).fold(f32::MIN, f32::max);
        let min = results.iter().map(|(_, s)| *s).fold(f32::MAX, f32::min);
        let range = (max - min).max(1e-6);
        results
            .iter()
            .map(|(id, s)| (id.clone(), (s - min) / range))
            .collect()
    };

    let norm_vec = normalize(&vector_results);
    let norm_fts = normalize(&fts_results);

    let mut scores: HashMap<String, (f32, HybridSource)> = HashMap::new();

    for (id, score) in &norm_vec {
        scores.insert(id.clone(), (alpha * score, HybridSource::Vector));
    }

    for (id, score) in &norm_fts {
        scores
            .entry(id.clone())
            .and_modify(|(s, src)| {
                *s += (1.0 - alpha) * score;
                *src = HybridSource::Both;
            })
            .or_insert(((1.0 - alpha) * score, HybridSource::TextSearch));
    }

    let mut merged: Vec<(String, f32, HybridSource)> = scores
        .into_iter()
        .map(|(id, (score, source))| (id, score, source))
        .collect();

    merged.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    merged.truncate(top_k);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rrf_exact_scores() {
        let vector = vec![("a".to_string(), 0.9), ("b".to_string(), 0.8)];
        let fts = vec![("b".to_string(), 5.0), ("c".to_string(), 4.0)];
        let merged = reciprocal_rank_fusion(vector, fts, 60, 10);

        let score = |id: &str| merged.iter().find(|(i, ..)| i == id).unwrap().1;
        // b appears rank 1 in both lists: 1/61 + 1/61
        assert!((score("b") - (1.0 / 61.0 + 1.0 / 61.0)).abs() < 1e-6);
        // a appears rank 0 only in vector: 1/61
        assert!((score("a") - 1.0 / 61.0).abs() < 1e-6);
        assert_eq!(merged[0].0, "b");
    }

    #[test]
    fn test_rrf_ties_broken_by_id_ascending() {
        // "z" is top of the vector list, "a" is top of the fts list: both get
        // an identical rrf score of 1/61 with no other signal to break the tie.
        let vector = vec![("z".to_string(), 1.0)];
        let fts = vec![("a".to_string(), 1.0)];
        let merged = reciprocal_rank_fusion(vector, fts, 60, 10);
        assert_eq!(merged[0].0, "a");
        assert_eq!(merged[1].0, "z");
    }

    #[test]
    fn test_rrf_empty_inputs() {
        let merged = reciprocal_rank_fusion(vec![], vec![], 60, 10);
        assert!(merged.is_empty());
    }
}
