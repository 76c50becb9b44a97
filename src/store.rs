//! The Store façade (§4.1): a minimal, search-shaped interface over the
//! columnar + full-text index. The core never opens, migrates, or writes to
//! the underlying store — it receives already-open handles and only reads.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::config::{FusionStrategy, SearchConfig};
use crate::error::{CoreError, CoreResult};
use crate::filter::{Filter, Literal};
use crate::search::{hybrid, text_search::TextSearch};
use crate::storage::lance_store::{LanceRow, LanceStore};
use crate::types::{Chunk, ChunkLabel, ChunkMetadata, Document, ScoredChunk};

#[async_trait]
pub trait Store: Send + Sync {
    async fn search_vector(
        &self,
        embedding: &[f32],
        limit: usize,
        filter: Option<&Filter>,
    ) -> CoreResult<Vec<ScoredChunk>>;

    async fn search_fts(
        &self,
        query_text: &str,
        limit: usize,
        filter: Option<&Filter>,
    ) -> CoreResult<Vec<ScoredChunk>>;

    async fn search_hybrid(
        &self,
        query_text: &str,
        embedding: &[f32],
        limit: usize,
        filter: Option<&Filter>,
    ) -> CoreResult<Vec<ScoredChunk>>;

    async fn get_document(&self, document_id: &str) -> CoreResult<Document>;

    async fn find_document(&self, name_or_uri: &str) -> CoreResult<Option<Document>>;

    async fn adjacent_chunks(
        &self,
        document_id: &str,
        order_from: u32,
        order_to: u32,
    ) -> CoreResult<Vec<Chunk>>;

    async fn get_chunk(&self, chunk_id: &str) -> CoreResult<Chunk>;

    async fn get_chunks_bulk(&self, chunk_ids: &[String]) -> CoreResult<Vec<Chunk>>;

    async fn list_documents(
        &self,
        offset: usize,
        limit: usize,
        filter: Option<&Filter>,
    ) -> CoreResult<Vec<Document>>;
}

/// LanceDB + Tantivy backed implementation. Both halves are read-only
/// wrappers over handles the host application opened and populated.
pub struct ColumnarStore {
    vector: LanceStore,
    text: TextSearch,
    search_config: SearchConfig,
}

impl ColumnarStore {
    pub fn new(vector: LanceStore, text: TextSearch, search_config: SearchConfig) -> Self {
        Self {
            vector,
            text,
            search_config,
        }
    }

    fn chunk_from_row(row: &LanceRow) -> Chunk {
        let headings: Vec<String> = serde_json::from_str(&row.headings_json).unwrap_or_default();
        let page_numbers: Vec<u32> = serde_json::from_str(&row.page_numbers_json).unwrap_or_default();
        let label = label_from_str(&row.label);
        Chunk {
            chunk_id: row.chunk_id.clone(),
            document_id: row.document_id.clone(),
            order: row.chunk_order,
            content: row.content.clone(),
            metadata: ChunkMetadata {
                headings,
                page_numbers,
                label,
                structural_unit_id: if row.structural_unit_id.is_empty() {
                    None
                } else {
                    Some(row.structural_unit_id.clone())
                },
            },
            embedding: Vec::new(),
        }
    }

    fn document_from_row(row: &LanceRow) -> Document {
        let metadata: HashMap<String, serde_json::Value> =
            serde_json::from_str(&row.metadata_json).unwrap_or_default();
        Document {
            document_id: row.document_id.clone(),
            uri: row.uri.clone(),
            title: if row.title.is_empty() { None } else { Some(row.title.clone()) },
            metadata,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }

    /// Render a document-level [`Filter`] as SQL against the chunk table's
    /// column names (`id` -> `document_id`; everything else matches). Returns
    /// `None` when the filter references `metadata.*`, which the chunk table
    /// can't push down — callers fall back to post-filtering with `matches`.
    fn pushdown_sql(filter: &Filter) -> Option<String> {
        if filter.references_metadata() {
            return None;
        }
        Some(render_sql(filter))
    }
}

fn render_sql(filter: &Filter) -> String {
    let field_name = |f: &str| if f == "id" { "document_id".to_string() } else { f.to_string() };
    match filter {
        Filter::Eq(field, lit) => format!("{} = {}", field_name(field), sql_literal(lit)),
        Filter::Like(field, pat) => format!("{} LIKE '{}'", field_name(field), pat.replace('\'', "''")),
        Filter::In(field, lits) => {
            let items: Vec<String> = lits.iter().map(sql_literal).collect();
            format!("{} IN ({})", field_name(field), items.join(", "))
        }
        Filter::IsNull(field) => format!("{} IS NULL", field_name(field)),
        Filter::IsNotNull(field) => format!("{} IS NOT NULL", field_name(field)),
        Filter::And(a, b) => format!("({} AND {})", render_sql(a), render_sql(b)),
        Filter::Or(a, b) => format!("({} OR {})", render_sql(a), render_sql(b)),
        Filter::Not(a) => format!("NOT ({})", render_sql(a)),
    }
}

fn sql_literal(lit: &Literal) -> String {
    match lit {
        Literal::Str(s) => format!("'{}'", s.replace('\'', "''")),
        Literal::Num(n) => n.to_string(),
    }
}

fn label_from_str(s: &str) -> Option<ChunkLabel> {
    match s {
        "text" => Some(ChunkLabel::Text),
        "table" => Some(ChunkLabel::Table),
        "list" => Some(ChunkLabel::List),
        "code" => Some(ChunkLabel::Code),
        "heading" => Some(ChunkLabel::Heading),
        "other" => Some(ChunkLabel::Other),
        _ => None,
    }
}

#[async_trait]
impl Store for ColumnarStore {
    async fn search_vector(
        &self,
        embedding: &[f32],
        limit: usize,
        filter: Option<&Filter>,
    ) -> CoreResult<Vec<ScoredChunk>> {
        let sql = filter.and_then(Self::pushdown_sql);
        let rows = self.vector.vector_search(embedding, limit, sql.as_deref()).await?;
        let rows = post_filter(rows, filter, |r| Self::document_from_row(r));
        Ok(rows
            .into_iter()
            .map(|r| ScoredChunk {
                score: r.score,
                chunk: Self::chunk_from_row(&r),
            })
            .collect())
    }

    async fn search_fts(
        &self,
        query_text: &str,
        limit: usize,
        filter: Option<&Filter>,
    ) -> CoreResult<Vec<ScoredChunk>> {
        let fetch = if filter.is_some() { limit * 3 } else { limit };
        let hits = self.text.search(query_text, fetch)?;
        let ids: Vec<String> = hits.iter().map(|(id, _)| id.clone()).collect();
        let rows = self.vector.rows_by_ids(&ids).await?;
        let scores: HashMap<&str, f32> = hits.iter().map(|(id, s)| (id.as_str(), *s)).collect();

        let rows = post_filter(rows, filter, |r| Self::document_from_row(r));
        let mut scored: Vec<ScoredChunk> = rows
            .into_iter()
            .map(|r| {
                let score = scores.get(r.chunk_id.as_str()).copied().unwrap_or(0.0);
                ScoredChunk {
                    score,
                    chunk: Self::chunk_from_row(&r),
                }
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    async fn search_hybrid(
        &self,
        query_text: &str,
        embedding: &[f32],
        limit: usize,
        filter: Option<&Filter>,
    ) -> CoreResult<Vec<ScoredChunk>> {
        let pool = limit.saturating_mul(self.search_config.rerank_multiplier.max(1));
        let vector_hits = self.search_vector(embedding, pool, filter).await?;
        let fts_hits = self.search_fts(query_text, pool, filter).await?;

        let mut by_id: HashMap<String, ScoredChunk> = HashMap::new();
        for sc in vector_hits.iter().chain(fts_hits.iter()) {
            by_id.entry(sc.chunk_id().to_string()).or_insert_with(|| sc.clone());
        }

        let vector_ranked: Vec<(String, f32)> =
            vector_hits.iter().map(|sc| (sc.chunk_id().to_string(), sc.score)).collect();
        let fts_ranked: Vec<(String, f32)> =
            fts_hits.iter().map(|sc| (sc.chunk_id().to_string(), sc.score)).collect();

        let fused = match self.search_config.fusion_strategy {
            FusionStrategy::Rrf => {
                hybrid::reciprocal_rank_fusion(vector_ranked, fts_ranked, self.search_config.rrf_k as usize, limit)
            }
            FusionStrategy::ScoreAwareRrf => hybrid::score_aware_rrf(
                vector_ranked,
                fts_ranked,
                self.search_config.rrf_k as usize,
                limit,
                self.search_config.fusion_alpha,
            ),
            FusionStrategy::WeightedFusion => {
                hybrid::weighted_fusion(vector_ranked, fts_ranked, self.search_config.fusion_alpha, limit)
            }
        };

        Ok(fused
            .into_iter()
            .filter_map(|(id, score, _source)| {
                by_id.get(&id).map(|sc| ScoredChunk {
                    chunk: sc.chunk.clone(),
                    score,
                })
            })
            .collect())
    }

    async fn get_document(&self, document_id: &str) -> CoreResult<Document> {
        let predicate = format!("document_id = '{}'", document_id.replace('\'', "''"));
        let rows = self.vector.list_rows(Some(&predicate), 1).await?;
        rows.first()
            .map(Self::document_from_row)
            .ok_or_else(|| CoreError::NotFound(format!("document '{document_id}'")))
    }

    async fn find_document(&self, name_or_uri: &str) -> CoreResult<Option<Document>> {
        let needle = name_or_uri.to_lowercase();
        let candidates = self.vector.list_rows(None, usize::MAX).await?;
        let mut seen = std::collections::HashSet::new();
        let mut docs: Vec<Document> = Vec::new();
        for row in &candidates {
            if seen.insert(row.document_id.clone()) {
                docs.push(Self::document_from_row(row));
            }
        }

        // Rank: exact uri match, then uri substring, then title substring.
        // Ties broken by shortest matching field, then lexicographic id.
        let mut ranked: Vec<(u8, usize, &Document)> = Vec::new();
        for doc in &docs {
            let uri_lower = doc.uri.to_lowercase();
            if uri_lower == needle {
                ranked.push((0, uri_lower.len(), doc));
                continue;
            }
            if uri_lower.contains(&needle) {
                ranked.push((1, uri_lower.len(), doc));
                continue;
            }
            if let Some(title) = &doc.title {
                let title_lower = title.to_lowercase();
                if title_lower.contains(&needle) {
                    ranked.push((2, title_lower.len(), doc));
                }
            }
        }

        ranked.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then_with(|| a.1.cmp(&b.1))
                .then_with(|| a.2.document_id.cmp(&b.2.document_id))
        });

        Ok(ranked.into_iter().next().map(|(_, _, doc)| doc.clone()))
    }

    async fn adjacent_chunks(
        &self,
        document_id: &str,
        order_from: u32,
        order_to: u32,
    ) -> CoreResult<Vec<Chunk>> {
        let rows = self.vector.rows_in_order_range(document_id, order_from, order_to).await?;
        Ok(rows.iter().map(Self::chunk_from_row).collect())
    }

    async fn get_chunk(&self, chunk_id: &str) -> CoreResult<Chunk> {
        let rows = self.vector.rows_by_ids(&[chunk_id.to_string()]).await?;
        rows.first()
            .map(Self::chunk_from_row)
            .ok_or_else(|| CoreError::NotFound(format!("chunk '{chunk_id}'")))
    }

    async fn get_chunks_bulk(&self, chunk_ids: &[String]) -> CoreResult<Vec<Chunk>> {
        let rows = self.vector.rows_by_ids(chunk_ids).await?;
        Ok(rows.iter().map(Self::chunk_from_row).collect())
    }

    async fn list_documents(
        &self,
        offset: usize,
        limit: usize,
        filter: Option<&Filter>,
    ) -> CoreResult<Vec<Document>> {
        let sql = filter.and_then(Self::pushdown_sql);
        let rows = self.vector.list_rows(sql.as_deref(), usize::MAX).await?;

        let mut seen = std::collections::HashSet::new();
        let mut docs: Vec<Document> = Vec::new();
        for row in &rows {
            if seen.insert(row.document_id.clone()) {
                let doc = Self::document_from_row(row);
                if filter.map(|f| f.matches(&doc)).unwrap_or(true) {
                    docs.push(doc);
                }
            }
        }
        docs.sort_by(|a, b| a.document_id.cmp(&b.document_id));
        Ok(docs.into_iter().skip(offset).take(limit).collect())
    }
}

/// Post-filter rows against the document-level predicate when it can't be
/// (or wasn't) pushed down as SQL.
fn post_filter(
    rows: Vec<LanceRow>,
    filter: Option<&Filter>,
    to_doc: impl Fn(&LanceRow) -> Document,
) -> Vec<LanceRow> {
    match filter {
        Some(f) if f.references_metadata() => {
            rows.into_iter().filter(|r| f.matches(&to_doc(r))).collect()
        }
        _ => rows,
    }
}

/// An in-memory [`Store`] for tests: no I/O, naive cosine/substring scoring.
pub struct InMemoryStore {
    documents: Vec<Document>,
    chunks: Vec<Chunk>,
}

impl InMemoryStore {
    pub fn new(documents: Vec<Document>, chunks: Vec<Chunk>) -> Self {
        Self { documents, chunks }
    }

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
            (dot / (na * nb)).max(0.0)
        }
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn search_vector(
        &self,
        embedding: &[f32],
        limit: usize,
        filter: Option<&Filter>,
    ) -> CoreResult<Vec<ScoredChunk>> {
        let allowed: Option<std::collections::HashSet<String>> = filter.map(|f| {
            self.documents
                .iter()
                .filter(|d| f.matches(d))
                .map(|d| d.document_id.clone())
                .collect()
        });

        let mut scored: Vec<ScoredChunk> = self
            .chunks
            .iter()
            .filter(|c| allowed.as_ref().map(|a| a.contains(&c.document_id)).unwrap_or(true))
            .map(|c| ScoredChunk {
                score: Self::cosine(embedding, &c.embedding),
                chunk: c.clone(),
            })
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk.chunk_id.cmp(&b.chunk.chunk_id))
        });
        scored.truncate(limit);
        Ok(scored)
    }

    async fn search_fts(
        &self,
        query_text: &str,
        limit: usize,
        filter: Option<&Filter>,
    ) -> CoreResult<Vec<ScoredChunk>> {
        let needle = query_text.to_lowercase();
        let terms: Vec<&str> = needle.split_whitespace().collect();
        let allowed: Option<std::collections::HashSet<String>> = filter.map(|f| {
            self.documents
                .iter()
                .filter(|d| f.matches(d))
                .map(|d| d.document_id.clone())
                .collect()
        });

        let mut scored: Vec<ScoredChunk> = self
            .chunks
            .iter()
            .filter(|c| allowed.as_ref().map(|a| a.contains(&c.document_id)).unwrap_or(true))
            .filter_map(|c| {
                let lower = c.content.to_lowercase();
                let hits = terms.iter().filter(|t| lower.contains(**t)).count();
                if hits == 0 {
                    None
                } else {
                    Some(ScoredChunk {
                        score: hits as f32,
                        chunk: c.clone(),
                    })
                }
            })
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk.chunk_id.cmp(&b.chunk.chunk_id))
        });
        scored.truncate(limit);
        Ok(scored)
    }

    async fn search_hybrid(
        &self,
        query_text: &str,
        embedding: &[f32],
        limit: usize,
        filter: Option<&Filter>,
    ) -> CoreResult<Vec<ScoredChunk>> {
        let pool = limit.saturating_mul(10).max(limit);
        let vector_hits = self.search_vector(embedding, pool, filter).await?;
        let fts_hits = self.search_fts(query_text, pool, filter).await?;

        let mut by_id: HashMap<String, ScoredChunk> = HashMap::new();
        for sc in vector_hits.iter().chain(fts_hits.iter()) {
            by_id.entry(sc.chunk_id().to_string()).or_insert_with(|| sc.clone());
        }

        let vector_ranked: Vec<(String, f32)> =
            vector_hits.iter().map(|sc| (sc.chunk_id().to_string(), sc.score)).collect();
        let fts_ranked: Vec<(String, f32)> =
            fts_hits.iter().map(|sc| (sc.chunk_id().to_string(), sc.score)).collect();

        let fused = hybrid::reciprocal_rank_fusion(vector_ranked, fts_ranked, 60, limit);
        Ok(fused
            .into_iter()
            .filter_map(|(id, score, _)| {
                by_id.get(&id).map(|sc| ScoredChunk {
                    chunk: sc.chunk.clone(),
                    score,
                })
            })
            .collect())
    }

    async fn get_document(&self, document_id: &str) -> CoreResult<Document> {
        self.documents
            .iter()
            .find(|d| d.document_id == document_id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("document '{document_id}'")))
    }

    async fn find_document(&self, name_or_uri: &str) -> CoreResult<Option<Document>> {
        let needle = name_or_uri.to_lowercase();
        let mut ranked: Vec<(u8, usize, &Document)> = Vec::new();
        for doc in &self.documents {
            let uri_lower = doc.uri.to_lowercase();
            if uri_lower == needle {
                ranked.push((0, uri_lower.len(), doc));
            } else if uri_lower.contains(&needle) {
                ranked.push((1, uri_lower.len(), doc));
            } else if let Some(title) = &doc.title {
                let title_lower = title.to_lowercase();
                if title_lower.contains(&needle) {
                    ranked.push((2, title_lower.len(), doc));
                }
            }
        }
        ranked.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then_with(|| a.1.cmp(&b.1))
                .then_with(|| a.2.document_id.cmp(&b.2.document_id))
        });
        Ok(ranked.into_iter().next().map(|(_, _, doc)| doc.clone()))
    }

    async fn adjacent_chunks(
        &self,
        document_id: &str,
        order_from: u32,
        order_to: u32,
    ) -> CoreResult<Vec<Chunk>> {
        let mut out: Vec<Chunk> = self
            .chunks
            .iter()
            .filter(|c| c.document_id == document_id && c.order >= order_from && c.order <= order_to)
            .cloned()
            .collect();
        out.sort_by_key(|c| c.order);
        Ok(out)
    }

    async fn get_chunk(&self, chunk_id: &str) -> CoreResult<Chunk> {
        self.chunks
            .iter()
            .find(|c| c.chunk_id == chunk_id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("chunk '{chunk_id}'")))
    }

    async fn get_chunks_bulk(&self, chunk_ids: &[String]) -> CoreResult<Vec<Chunk>> {
        Ok(self
            .chunks
            .iter()
            .filter(|c| chunk_ids.contains(&c.chunk_id))
            .cloned()
            .collect())
    }

    async fn list_documents(
        &self,
        offset: usize,
        limit: usize,
        filter: Option<&Filter>,
    ) -> CoreResult<Vec<Document>> {
        let mut docs: Vec<Document> = self
            .documents
            .iter()
            .filter(|d| filter.map(|f| f.matches(d)).unwrap_or(true))
            .cloned()
            .collect();
        docs.sort_by(|a, b| a.document_id.cmp(&b.document_id));
        Ok(docs.into_iter().skip(offset).take(limit).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn doc(id: &str, uri: &str) -> Document {
        Document {
            document_id: id.to_string(),
            uri: uri.to_string(),
            title: Some(format!("Title {id}")),
            metadata: Map::new(),
            created_at: 0,
            updated_at: 0,
        }
    }

    fn chunk(id: &str, doc_id: &str, order: u32, content: &str, embedding: Vec<f32>) -> Chunk {
        Chunk {
            chunk_id: id.to_string(),
            document_id: doc_id.to_string(),
            order,
            content: content.to_string(),
            metadata: ChunkMetadata::default(),
            embedding,
        }
    }

    #[tokio::test]
    async fn test_search_hybrid_respects_limit_and_ordering() {
        let docs = vec![doc("d1", "doc://one")];
        let chunks = vec![
            chunk("c1", "d1", 0, "cats are great pets", vec![1.0, 0.0]),
            chunk("c2", "d1", 1, "dogs are loyal companions", vec![0.0, 1.0]),
            chunk("c3", "d1", 2, "cats and dogs both make great pets", vec![0.7, 0.7]),
        ];
        let store = InMemoryStore::new(docs, chunks);
        let results = store
            .search_hybrid("cats pets", &[1.0, 0.0], 2, None)
            .await
            .unwrap();
        assert!(results.len() <= 2);
        for w in results.windows(2) {
            assert!(w[0].score >= w[1].score);
        }
    }

    #[tokio::test]
    async fn test_adjacent_chunks_inclusive_range() {
        let docs = vec![doc("d1", "doc://one")];
        let chunks = (0..10)
            .map(|i| chunk(&format!("c{i}"), "d1", i, "text", vec![]))
            .collect();
        let store = InMemoryStore::new(docs, chunks);
        let result = store.adjacent_chunks("d1", 2, 4).await.unwrap();
        assert_eq!(result.iter().map(|c| c.order).collect::<Vec<_>>(), vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_find_document_exact_uri_beats_substring() {
        let docs = vec![doc("d1", "doc://alpha"), doc("d2", "doc://alpha-beta")];
        let store = InMemoryStore::new(docs, vec![]);
        let found = store.find_document("doc://alpha").await.unwrap().unwrap();
        assert_eq!(found.document_id, "d1");
    }

    #[tokio::test]
    async fn test_get_chunk_not_found() {
        let store = InMemoryStore::new(vec![], vec![]);
        let err = store.get_chunk("missing").await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }
}
