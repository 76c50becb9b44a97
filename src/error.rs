//! Error taxonomy for the retrieval engine and research graph.

use thiserror::Error;

/// The single error type returned by every fallible public operation.
///
/// Variants map directly onto the propagation policy: some are absorbed by
/// callers (reranker/embedder failures), some are retried a bounded number of
/// times before degrading (LLM failures), and some are fatal on first sight
/// (dimension mismatches, invariant violations).
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid filter syntax: {0}")]
    FilterSyntax(String),

    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("embedder failure: {0}")]
    EmbedderFailure(String),

    #[error("llm failure: {0}")]
    LLMFailure(String),

    #[error("reranker failure: {0}")]
    RerankerFailure(String),

    #[error("planner proposed a duplicate question twice in a row")]
    PlannerLoop,

    #[error("cancelled")]
    Cancelled,

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("invariant violated: {0}")]
    InvariantViolated(String),
}

impl CoreError {
    /// The wire-shaped `kind` tag used in `RunError` events and snapshots.
    ///
    /// Lowercase-with-underscores form of the variant name, e.g.
    /// `DimensionMismatch` -> `"dimension_mismatch"`.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::StoreUnavailable(_) => "store_unavailable",
            CoreError::NotFound(_) => "not_found",
            CoreError::FilterSyntax(_) => "filter_syntax",
            CoreError::DimensionMismatch { .. } => "dimension_mismatch",
            CoreError::EmbedderFailure(_) => "embedder_failure",
            CoreError::LLMFailure(_) => "llm_failure",
            CoreError::RerankerFailure(_) => "reranker_failure",
            CoreError::PlannerLoop => "planner_loop",
            CoreError::Cancelled => "cancelled",
            CoreError::Timeout(_) => "timeout",
            CoreError::InvariantViolated(_) => "invariant_violated",
        }
    }
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;
