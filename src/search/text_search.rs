//! Read-only Tantivy access for full-text search.
//!
//! Like [`crate::storage::lance_store`], this wraps an index the host
//! application already built and committed; the core has no writer and never
//! indexes, deletes, or migrates documents.

use tantivy::collector::TopDocs;
use tantivy::query::QueryParser;
use tantivy::schema::{self, Value as TantivyValue};
use tantivy::{Index, IndexReader, TantivyDocument};

use crate::error::{CoreError, CoreResult};

pub struct TextSearch {
    index: Index,
    reader: IndexReader,
    chunk_id_field: schema::Field,
    content_field: schema::Field,
    title_field: schema::Field,
}

impl TextSearch {
    /// Wrap an already-open, read-only index. The schema is expected to
    /// declare `chunk_id` (STRING|STORED), `content` (TEXT|STORED), and
    /// `title` (TEXT).
    pub fn open(index: Index, reader: IndexReader) -> CoreResult<Self> {
        let schema = index.schema();
        let field = |name: &str| {
            schema
                .get_field(name)
                .map_err(|_| CoreError::StoreUnavailable(format!("fts index missing field '{name}'")))
        };
        Ok(Self {
            chunk_id_field: field("chunk_id")?,
            content_field: field("content")?,
            title_field: field("title")?,
            index,
            reader,
        })
    }

    pub fn search(&self, query: &str, k: usize) -> CoreResult<Vec<(String, f32)>> {
        let searcher = self.reader.searcher();
        let query_parser =
            QueryParser::for_index(&self.index, vec![self.content_field, self.title_field]);

        let parsed_query = match query_parser.parse_query(query) {
            Ok(q) => q,
            Err(_) => {
                let escaped = query.replace('"', "");
                let fallback = QueryParser::for_index(&self.index, vec![self.content_field]);
                fallback
                    .parse_query(&format!("\"{escaped}\""))
                    .map_err(|e| CoreError::FilterSyntax(e.to_string()))?
            }
        };

        let top_docs = searcher
            .search(&parsed_query, &TopDocs::with_limit(k))
            .map_err(|e| CoreError::StoreUnavailable(format!("fts search failed: {e}")))?;

        let mut results = Vec::with_capacity(top_docs.len());
        for (score, addr) in top_docs {
            if let Ok(doc) = searcher.doc::<TantivyDocument>(addr) {
                if let Some(id) = doc.get_first(self.chunk_id_field).and_then(|v| v.as_str()) {
                    results.push((id.to_string(), score));
                }
            }
        }
        Ok(results)
    }

    pub fn count(&self) -> usize {
        self.reader.searcher().num_docs() as usize
    }
}
