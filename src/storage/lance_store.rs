//! Read-only LanceDB access for the chunk table.
//!
//! The core never opens, creates, or migrates this table (see the Store
//! façade's contract): an already-open [`lancedb::Table`] is handed in by the
//! host application, which owns ingestion. This module only knows how to
//! query it.

use arrow_array::{Array, Float32Array, RecordBatch, StringArray, UInt32Array};
use lancedb::query::{ExecutableQuery, QueryBase};

use crate::config::DistanceMetric;
use crate::error::{CoreError, CoreResult};

/// One row of the chunk table, before it is reassembled into a [`crate::types::Chunk`].
#[derive(Debug, Clone)]
pub struct LanceRow {
    pub chunk_id: String,
    pub document_id: String,
    pub chunk_order: u32,
    pub content: String,
    pub label: String,
    pub structural_unit_id: String,
    pub headings_json: String,
    pub page_numbers_json: String,
    pub uri: String,
    pub title: String,
    pub metadata_json: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub score: f32,
}

pub struct LanceStore {
    table: lancedb::Table,
    dimension: usize,
    metric: DistanceMetric,
}

impl LanceStore {
    /// Wrap an already-open table. `dimension` must match the table's vector
    /// column width; callers get [`CoreError::DimensionMismatch`] from
    /// `vector_search` rather than a panic if it doesn't.
    pub fn open(table: lancedb::Table, dimension: usize, metric: DistanceMetric) -> Self {
        Self {
            table,
            dimension,
            metric,
        }
    }

    fn lance_distance_type(&self) -> lancedb::DistanceType {
        match self.metric {
            DistanceMetric::Cosine => lancedb::DistanceType::Cosine,
            DistanceMetric::L2 => lancedb::DistanceType::L2,
            DistanceMetric::Dot => lancedb::DistanceType::Dot,
        }
    }

    pub async fn vector_search(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&str>,
    ) -> CoreResult<Vec<LanceRow>> {
        if query.len() != self.dimension {
            return Err(CoreError::DimensionMismatch {
                expected: self.dimension,
                got: query.len(),
            });
        }

        let mut query_builder = self
            .table
            .query()
            .nearest_to(query)
            .map_err(|e| CoreError::StoreUnavailable(e.to_string()))?
            .distance_type(self.lance_distance_type())
            .limit(k);

        if let Some(predicate) = filter {
            query_builder = query_builder.only_if(predicate);
        }

        let results = query_builder
            .execute()
            .await
            .map_err(|e| CoreError::StoreUnavailable(format!("vector search failed: {e}")))?;

        let batches: Vec<RecordBatch> = futures::TryStreamExt::try_collect(results)
            .await
            .map_err(|e| CoreError::StoreUnavailable(e.to_string()))?;

        Ok(extract_rows(&batches, matches!(self.metric, DistanceMetric::Cosine)))
    }

    pub async fn list_rows(&self, predicate: Option<&str>, limit: usize) -> CoreResult<Vec<LanceRow>> {
        let mut query = self.table.query();
        if let Some(pred) = predicate {
            query = query.only_if(pred);
        }
        query = query.limit(limit);

        let results = query
            .execute()
            .await
            .map_err(|e| CoreError::StoreUnavailable(format!("list query failed: {e}")))?;

        let batches: Vec<RecordBatch> = futures::TryStreamExt::try_collect(results)
            .await
            .map_err(|e| CoreError::StoreUnavailable(e.to_string()))?;

        Ok(extract_rows(&batches, false))
    }

    pub async fn rows_in_order_range(
        &self,
        document_id: &str,
        order_from: u32,
        order_to: u32,
    ) -> CoreResult<Vec<LanceRow>> {
        let predicate = format!(
            "document_id = '{}' AND chunk_order >= {} AND chunk_order <= {}",
            document_id.replace('\'', "''"),
            order_from,
            order_to
        );
        let mut rows = self.list_rows(Some(&predicate), usize::MAX).await?;
        rows.sort_by_key(|r| r.chunk_order);
        Ok(rows)
    }

    pub async fn rows_by_ids(&self, ids: &[String]) -> CoreResult<Vec<LanceRow>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut all = Vec::new();
        for chunk in ids.chunks(50) {
            let id_list: Vec<String> = chunk
                .iter()
                .map(|id| format!("'{}'", id.replace('\'', "''")))
                .collect();
            let predicate = format!("chunk_id IN ({})", id_list.join(", "));
            all.extend(self.list_rows(Some(&predicate), usize::MAX).await?);
        }
        Ok(all)
    }
}

/// Extract rows from Arrow batches. When `similarity_from_distance` is set,
/// `_distance` (added by LanceDB to kNN results) is converted to a `[0, 1]`
/// similarity; otherwise the raw distance is kept as the score, matching
/// §4.1's "distance-derived similarities (cosine) or raw distance (l2/dot)".
fn extract_rows(batches: &[RecordBatch], similarity_from_distance: bool) -> Vec<LanceRow> {
    let mut rows = Vec::new();
    for batch in batches {
        let col_str = |name: &str| {
            batch
                .column_by_name(name)
                .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        };
        let chunk_ids = col_str("chunk_id");
        let document_ids = col_str("document_id");
        let contents = col_str("content");
        let labels = col_str("label");
        let structural_unit_ids = col_str("structural_unit_id");
        let headings_jsons = col_str("headings_json");
        let page_numbers_jsons = col_str("page_numbers_json");
        let uris = col_str("uri");
        let titles = col_str("title");
        let metadata_jsons = col_str("metadata_json");
        let chunk_orders = batch
            .column_by_name("chunk_order")
            .and_then(|c| c.as_any().downcast_ref::<UInt32Array>());
        let created_ats = batch
            .column_by_name("created_at")
            .and_then(|c| c.as_any().downcast_ref::<arrow_array::Int64Array>());
        let updated_ats = batch
            .column_by_name("updated_at")
            .and_then(|c| c.as_any().downcast_ref::<arrow_array::Int64Array>());
        let distances = batch
            .column_by_name("_distance")
            .and_then(|c| c.as_any().downcast_ref::<Float32Array>());

        let (Some(chunk_ids), Some(document_ids), Some(contents)) =
            (chunk_ids, document_ids, contents)
        else {
            continue;
        };

        for i in 0..batch.num_rows() {
            let score = match distances {
                Some(d) if similarity_from_distance => (1.0 - d.value(i)).max(0.0),
                Some(d) => d.value(i),
                None => 0.0,
            };

            rows.push(LanceRow {
                chunk_id: chunk_ids.value(i).to_string(),
                document_id: document_ids.value(i).to_string(),
                chunk_order: chunk_orders.map(|c| c.value(i)).unwrap_or(0),
                content: contents.value(i).to_string(),
                label: labels.map(|c| c.value(i).to_string()).unwrap_or_default(),
                structural_unit_id: structural_unit_ids.map(|c| c.value(i).to_string()).unwrap_or_default(),
                headings_json: headings_jsons.map(|c| c.value(i).to_string()).unwrap_or_else(|| "[]".into()),
                page_numbers_json: page_numbers_jsons.map(|c| c.value(i).to_string()).unwrap_or_else(|| "[]".into()),
                uri: uris.map(|c| c.value(i).to_string()).unwrap_or_default(),
                title: titles.map(|c| c.value(i).to_string()).unwrap_or_default(),
                metadata_json: metadata_jsons.map(|c| c.value(i).to_string()).unwrap_or_else(|| "{}".into()),
                created_at: created_ats.map(|c| c.value(i)).unwrap_or(0),
                updated_at: updated_ats.map(|c| c.value(i)).unwrap_or(0),
                score,
            });
        }
    }
    rows
}
