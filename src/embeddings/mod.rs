//! The `Embedder` capability (§6): a narrow batch-embedding interface the
//! core depends on but never implements a concrete provider for.

use crate::error::CoreError;
use async_trait::async_trait;

/// Produces fixed-dimension dense vectors for a batch of texts.
///
/// Implementations are provided by the host application (a local model, an
/// API client, ...); the core only ever calls through this trait.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CoreError>;

    fn dimension(&self) -> usize;
}

/// Embed a single text; a thin convenience wrapper over the batch contract.
pub async fn embed_one(embedder: &dyn Embedder, text: &str) -> Result<Vec<f32>, CoreError> {
    let mut out = embedder.embed(&[text.to_string()]).await?;
    out.pop()
        .ok_or_else(|| CoreError::EmbedderFailure("embedder returned no vectors".into()))
}

#[cfg(test)]
pub mod fake {
    use super::*;

    /// A deterministic fake embedder for tests: hashes each word into a
    /// fixed-size vector so semantically similar strings (sharing words)
    /// produce cosine-similar vectors.
    pub struct FakeEmbedder {
        pub dimension: usize,
        pub fail: bool,
    }

    impl FakeEmbedder {
        pub fn new(dimension: usize) -> Self {
            Self {
                dimension,
                fail: false,
            }
        }

        pub fn failing(dimension: usize) -> Self {
            Self {
                dimension,
                fail: true,
            }
        }

        fn embed_one(&self, text: &str) -> Vec<f32> {
            let mut v = vec![0.0f32; self.dimension];
            for word in text.to_lowercase().split_whitespace() {
                let mut hash: u64 = 1469598103934665603;
                for b in word.bytes() {
                    hash ^= b as u64;
                    hash = hash.wrapping_mul(1099511628211);
                }
                let idx = (hash as usize) % self.dimension;
                v[idx] += 1.0;
            }
            let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
            if norm > 0.0 {
                for x in v.iter_mut() {
                    *x /= norm;
                }
            }
            v
        }
    }

    #[async_trait]
    impl Embedder for FakeEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CoreError> {
            if self.fail {
                return Err(CoreError::EmbedderFailure("fake embedder configured to fail".into()));
            }
            Ok(texts.iter().map(|t| self.embed_one(t)).collect())
        }

        fn dimension(&self) -> usize {
            self.dimension
        }
    }
}
