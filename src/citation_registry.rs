//! The per-session citation registry (§4.4): a monotonic, first-occurrence-
//! wins map from chunk id to a 1-based user-visible index.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A structurally-comparable snapshot of a [`CitationRegistry`], suitable for
/// persistence or the session-snapshot wire shape (§6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CitationRegistrySnapshot {
    /// Chunk ids in first-occurrence order; index `i` maps to citation index `i + 1`.
    order: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CitationRegistry {
    index_of: HashMap<String, u32>,
    order: Vec<String>,
}

impl CitationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a chunk id, returning its stable 1-based index. Calling this
    /// twice with the same id returns the same index; the sequence of
    /// distinct ids assigned across a session's lifetime is `1, 2, 3, ...`
    /// without gaps.
    pub fn intern(&mut self, chunk_id: &str) -> u32 {
        if let Some(&idx) = self.index_of.get(chunk_id) {
            return idx;
        }
        let idx = (self.order.len() + 1) as u32;
        self.order.push(chunk_id.to_string());
        self.index_of.insert(chunk_id.to_string(), idx);
        idx
    }

    pub fn index_of(&self, chunk_id: &str) -> Option<u32> {
        self.index_of.get(chunk_id).copied()
    }

    pub fn snapshot(&self) -> CitationRegistrySnapshot {
        CitationRegistrySnapshot {
            order: self.order.clone(),
        }
    }

    pub fn restore(snapshot: CitationRegistrySnapshot) -> Self {
        let mut index_of = HashMap::with_capacity(snapshot.order.len());
        for (i, id) in snapshot.order.iter().enumerate() {
            index_of.insert(id.clone(), (i + 1) as u32);
        }
        Self {
            index_of,
            order: snapshot.order,
        }
    }
}

impl PartialEq for CitationRegistry {
    fn eq(&self, other: &Self) -> bool {
        self.order == other.order
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_is_idempotent_and_sequential() {
        let mut reg = CitationRegistry::new();
        assert_eq!(reg.intern("c1"), 1);
        assert_eq!(reg.intern("c2"), 2);
        assert_eq!(reg.intern("c1"), 1);
        assert_eq!(reg.intern("c3"), 3);
    }

    #[test]
    fn test_snapshot_restore_roundtrip_is_structurally_equal() {
        let mut reg = CitationRegistry::new();
        reg.intern("a");
        reg.intern("b");
        reg.intern("c");

        let restored = CitationRegistry::restore(reg.snapshot());
        assert_eq!(reg, restored);
        assert_eq!(restored.index_of("b"), Some(2));
    }

    #[test]
    fn test_index_of_unknown_chunk_is_none() {
        let reg = CitationRegistry::new();
        assert_eq!(reg.index_of("never-seen"), None);
    }
}
