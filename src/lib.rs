//! A hybrid vector+FTS retrieval core plus a Research Graph orchestrator:
//! an iterative plan/search/synthesize state machine built on top of it.
//!
//! The crate defines capabilities (`Store`, `Embedder`, `ChatLLM`,
//! `Reranker`, `Clock`) as traits and ships no concrete provider for any of
//! them except the columnar `Store` implementation backed by LanceDB and
//! Tantivy — embedding, chat, and reranking backends are supplied by the
//! host application.

pub mod citation_registry;
pub mod clock;
pub mod config;
pub mod context_expander;
pub mod embeddings;
pub mod error;
pub mod filter;
pub mod graph;
pub mod llm;
pub mod planner;
pub mod reranking;
pub mod search;
pub mod search_one;
pub mod session;
pub mod storage;
pub mod store;
pub mod synthesizer;
pub mod types;

pub use citation_registry::{CitationRegistry, CitationRegistrySnapshot};
pub use clock::{Clock as ClockTrait, SystemClock};
pub use config::{ContextConfig, CoreConfig, DistanceMetric, FusionStrategy, PlannerConfig, SearchConfig};
pub use embeddings::Embedder;
pub use error::{CoreError, CoreResult};
pub use filter::Filter;
pub use graph::{GraphNode, GraphRuntime, StreamEvent};
pub use llm::{ChatLLM, ChatMessage, ChatResponse, ChatRole, ToolCall, ToolSchema};
pub use reranking::{LLMReranker, Reranker};
pub use session::{SessionHandle, SessionRegistry};
pub use store::{ColumnarStore, InMemoryStore, Store};
pub use types::{
    Chunk, ChunkLabel, ChunkMetadata, Citation, Document, PlannerDecision, QAHistoryEntry,
    ResearchContext, ResearchOutput, ScoredChunk, SearchAnswer, SessionContext, SynthesisMode,
};
