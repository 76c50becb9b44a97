//! Core data model: documents, chunks, scored results, citations, and the
//! record types that flow through a research-graph run.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One of the five structural labels a chunk can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkLabel {
    Text,
    Table,
    List,
    Code,
    Heading,
    Other,
}

impl ChunkLabel {
    /// Table/list/code chunks are expanded by structural-unit membership
    /// rather than by a radius (see the context expander).
    pub fn is_structural(self) -> bool {
        matches!(self, ChunkLabel::Table | ChunkLabel::List | ChunkLabel::Code)
    }
}

/// Structural metadata carried alongside a chunk's text.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub headings: Vec<String>,
    pub page_numbers: Vec<u32>,
    pub label: Option<ChunkLabel>,
    /// Identifier shared by all chunks belonging to the same table/list/code
    /// block. `None` for plain text chunks.
    pub structural_unit_id: Option<String>,
}

/// An immutable unit owned by exactly one [`Document`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub document_id: String,
    /// Non-negative, unique per document, contiguous from 0.
    pub order: u32,
    pub content: String,
    pub metadata: ChunkMetadata,
    pub embedding: Vec<f32>,
}

/// An opaque, ingester-owned document. The core only reads these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub document_id: String,
    pub uri: String,
    pub title: Option<String>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A chunk plus a relevance score assigned by one particular query.
///
/// Scores are only comparable within the list that produced them unless they
/// have passed through fusion (see [`crate::search::hybrid`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f32,
}

impl ScoredChunk {
    pub fn chunk_id(&self) -> &str {
        &self.chunk.chunk_id
    }
}

/// User-facing derived view of a scored chunk, carrying the session-stable
/// citation index assigned by the [`crate::citation_registry::CitationRegistry`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    /// 1-based, assigned by the citation registry.
    pub index: u32,
    pub document_id: String,
    pub chunk_id: String,
    pub document_uri: String,
    pub document_title: Option<String>,
    pub page_numbers: Vec<u32>,
    pub headings: Option<Vec<String>>,
    pub content: String,
}

/// The answer to exactly one sub-question.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchAnswer {
    pub query: String,
    pub answer: String,
    pub confidence: f32,
    pub cited_chunks: Vec<String>,
    pub citations: Vec<Citation>,
}

impl SearchAnswer {
    /// An answer produced when a sub-question could not be answered after
    /// retries are exhausted; see §4.6's failure policy.
    pub fn empty(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            answer: String::new(),
            confidence: 0.0,
            cited_chunks: Vec::new(),
            citations: Vec::new(),
        }
    }
}

/// Mutable state threaded through a single graph run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchContext {
    pub original_question: String,
    pub session_context: Option<String>,
    pub qa_responses: Vec<SearchAnswer>,
    pub iterations: u32,
    pub max_iterations: u32,
    pub max_concurrency: u32,
    pub search_filter: Option<String>,
}

impl ResearchContext {
    pub fn new(original_question: impl Into<String>, max_iterations: u32) -> Self {
        Self {
            original_question: original_question.into(),
            session_context: None,
            qa_responses: Vec::new(),
            iterations: 0,
            max_iterations,
            max_concurrency: 1,
            search_filter: None,
        }
    }
}

/// Decision returned by the planner at each `PlanNext` step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PlannerDecision {
    ProposeQuestion { text: String },
    Complete { reason: String },
}

/// One entry in a session's bounded Q/A history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QAHistoryEntry {
    pub question: String,
    pub answer: String,
    pub citations: Vec<Citation>,
    pub question_embedding: Option<Vec<f32>>,
}

/// The running conversation summary produced by the background summarizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionContext {
    pub summary: String,
    pub last_updated: i64,
}

/// The two terminal shapes a graph run can produce.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ResearchOutput {
    Report {
        title: String,
        executive_summary: String,
        main_findings: Vec<String>,
        conclusions: Vec<String>,
        recommendations: Vec<String>,
        limitations: Vec<String>,
        sources_summary: String,
    },
    ConversationalAnswer {
        answer: String,
        confidence: f32,
        citations: Vec<Citation>,
    },
}

/// Which [`ResearchOutput`] shape the synthesizer should produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthesisMode {
    Report,
    Conversational,
}
