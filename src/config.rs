//! Immutable configuration threaded through graph construction.
//!
//! Replaces the donor's mutable, globally-reachable config with a single
//! value built once per store handle and passed by reference from then on.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    Cosine,
    L2,
    Dot,
}

/// Which fusion algorithm combines vector and FTS result lists. Plain `Rrf`
/// is the contract default; the other two are opt-in alternatives never
/// selected implicitly by the search path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionStrategy {
    Rrf,
    ScoreAwareRrf,
    WeightedFusion,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    pub default_limit: usize,
    /// Multiplier applied to `default_limit` when reranking is enabled, and
    /// to the fusion candidate pool reranking draws from (§4.2).
    pub rerank_multiplier: usize,
    pub rrf_k: u32,
    pub fusion_strategy: FusionStrategy,
    /// Used only when `fusion_strategy` is `ScoreAwareRrf` or `WeightedFusion`.
    pub fusion_alpha: f32,
    pub rerank_enabled: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_limit: 10,
            rerank_multiplier: 10,
            rrf_k: 60,
            fusion_strategy: FusionStrategy::Rrf,
            fusion_alpha: 0.5,
            rerank_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    pub radius: u32,
    pub max_context_items: usize,
    pub max_context_chars: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            radius: 1,
            max_context_items: 12,
            max_context_chars: 16_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    pub max_iterations: u32,
    pub max_concurrency: u32,
    pub completion_confidence: f32,
    /// Case-normalized shared-prefix match ratio above which a proposal is
    /// considered a near-duplicate of an existing sub-question (§4.5, §9).
    pub near_duplicate_threshold: f32,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            max_concurrency: 1,
            completion_confidence: 0.9,
            near_duplicate_threshold: 0.9,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    pub dimension: usize,
    pub distance_metric: DistanceMetric,
    pub search: SearchConfig,
    pub context: ContextConfig,
    pub planner: PlannerConfig,
    pub recall_threshold: f32,
    pub qa_history_cap: usize,
    #[serde(with = "duration_secs")]
    pub call_timeout: Duration,
    pub tool_call_retries: u32,
}

impl CoreConfig {
    /// Reject configurations that could never produce a well-formed run.
    pub fn validate(&self) -> Result<(), String> {
        if self.dimension == 0 {
            return Err("dimension must be > 0".into());
        }
        if self.search.default_limit == 0 {
            return Err("search.default_limit must be > 0".into());
        }
        if self.search.rerank_multiplier == 0 {
            return Err("search.rerank_multiplier must be > 0".into());
        }
        if self.planner.max_iterations == 0 {
            return Err("planner.max_iterations must be > 0".into());
        }
        if self.planner.max_concurrency == 0 {
            return Err("planner.max_concurrency must be > 0".into());
        }
        if !(0.0..=1.0).contains(&self.planner.completion_confidence) {
            return Err("planner.completion_confidence must be in [0.0, 1.0]".into());
        }
        if !(0.0..=1.0).contains(&self.planner.near_duplicate_threshold) {
            return Err("planner.near_duplicate_threshold must be in [0.0, 1.0]".into());
        }
        if !(0.0..=1.0).contains(&self.recall_threshold) {
            return Err("recall_threshold must be in [0.0, 1.0]".into());
        }
        if self.qa_history_cap == 0 {
            return Err("qa_history_cap must be > 0".into());
        }
        if self.call_timeout.is_zero() {
            return Err("call_timeout must be > 0".into());
        }
        Ok(())
    }

    /// Load and validate a config from a JSON file.
    pub fn from_file(path: &std::path::Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read config file: {}", e))?;
        let config: Self =
            serde_json::from_str(&content).map_err(|e| format!("failed to parse config: {}", e))?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            dimension: 768,
            distance_metric: DistanceMetric::Cosine,
            search: SearchConfig::default(),
            context: ContextConfig::default(),
            planner: PlannerConfig::default(),
            recall_threshold: 0.70,
            qa_history_cap: 50,
            call_timeout: Duration::from_secs(60),
            tool_call_retries: 2,
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(CoreConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_dimension_rejected() {
        let mut cfg = CoreConfig::default();
        cfg.dimension = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_out_of_range_threshold_rejected() {
        let mut cfg = CoreConfig::default();
        cfg.recall_threshold = 1.5;
        assert!(cfg.validate().is_err());
    }
}
