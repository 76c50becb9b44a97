//! The session layer (§5, §9): per-session state (citation registry,
//! bounded Q/A history, rolling summary) plus the serialized `ask` entry
//! point that ties recall, the graph runtime, and the background summarizer
//! together.

pub mod recall;
pub mod summarizer;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::sync::mpsc::UnboundedSender;

use crate::citation_registry::{CitationRegistry, CitationRegistrySnapshot};
use crate::clock::Clock;
use crate::config::CoreConfig;
use crate::embeddings::Embedder;
use crate::error::CoreResult;
use crate::graph::{GraphRuntime, StreamEvent};
use crate::llm::ChatLLM;
use crate::reranking::Reranker;
use crate::store::Store;
use crate::types::{Citation, QAHistoryEntry, ResearchContext, ResearchOutput, SessionContext, SynthesisMode};

use recall::RecallCache;
use summarizer::Summarizer;

/// The `{citations, qa_history, session_context, document_filter,
/// citation_registry}` wire shape (§6) for persisting or rehydrating a
/// session under a caller-chosen namespace key.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SessionSnapshot {
    pub citations: Vec<Citation>,
    pub qa_history: Vec<QAHistoryEntry>,
    pub session_context: Option<SessionContext>,
    pub document_filter: Option<String>,
    pub citation_registry: CitationRegistrySnapshot,
}

/// One session's durable state. Mutated only by the serialized `ask` path;
/// the background summarizer mutates `session_context` through its own
/// `Arc<Mutex<_>>` handle, independent of the ask-serialization lock.
pub struct SessionHandle {
    ask_lock: Mutex<()>,
    pub citation_registry: Mutex<CitationRegistry>,
    pub qa_history: Mutex<Vec<QAHistoryEntry>>,
    pub session_context: Arc<Mutex<Option<SessionContext>>>,
    pub document_filter: Mutex<Option<String>>,
    recall_cache: Mutex<RecallCache>,
    summarizer: Mutex<Summarizer>,
    qa_history_cap: usize,
}

impl SessionHandle {
    pub fn new(qa_history_cap: usize) -> Self {
        Self {
            ask_lock: Mutex::new(()),
            citation_registry: Mutex::new(CitationRegistry::new()),
            qa_history: Mutex::new(Vec::new()),
            session_context: Arc::new(Mutex::new(None)),
            document_filter: Mutex::new(None),
            recall_cache: Mutex::new(RecallCache::new()),
            summarizer: Mutex::new(Summarizer::new()),
            qa_history_cap,
        }
    }

    /// A point-in-time copy of everything persisted across requests.
    pub async fn snapshot(&self) -> SessionSnapshot {
        let qa_history = self.qa_history.lock().await.clone();
        SessionSnapshot {
            citations: qa_history.iter().flat_map(|h| h.citations.clone()).collect(),
            qa_history,
            session_context: self.session_context.lock().await.clone(),
            document_filter: self.document_filter.lock().await.clone(),
            citation_registry: self.citation_registry.lock().await.snapshot(),
        }
    }

    /// Rehydrate a session's state from a previously taken [`SessionSnapshot`].
    pub async fn restore(&self, snapshot: SessionSnapshot) {
        *self.qa_history.lock().await = snapshot.qa_history;
        *self.session_context.lock().await = snapshot.session_context;
        *self.document_filter.lock().await = snapshot.document_filter;
        *self.citation_registry.lock().await = CitationRegistry::restore(snapshot.citation_registry);
    }

    /// Run one question through recall + the graph runtime, updating session
    /// state and kicking off a background summarization on success. No two
    /// calls for the same session run concurrently: the FIFO `ask_lock`
    /// serializes them.
    #[allow(clippy::too_many_arguments)]
    pub async fn ask(
        &self,
        question: &str,
        mode: SynthesisMode,
        store: &dyn Store,
        embedder: &dyn Embedder,
        llm: Arc<dyn ChatLLM>,
        reranker: Option<&dyn Reranker>,
        clock: Arc<dyn Clock>,
        config: &CoreConfig,
        cancel: Arc<AtomicBool>,
        sender: &UnboundedSender<StreamEvent>,
    ) -> CoreResult<ResearchOutput> {
        let _permit = self.ask_lock.lock().await;

        let mut context = ResearchContext::new(question, config.planner.max_iterations);
        context.max_concurrency = config.planner.max_concurrency;

        {
            let history = self.qa_history.lock().await;
            let mut cache = self.recall_cache.lock().await;
            context.qa_responses = recall::recall(embedder, &mut cache, question, &history, config.recall_threshold).await;
        }

        {
            let session_context = self.session_context.lock().await;
            context.session_context = session_context.as_ref().map(|c| c.summary.clone());
        }

        let mut registry = self.citation_registry.lock().await;
        let runtime = GraphRuntime {
            store,
            embedder,
            llm: llm.as_ref(),
            reranker,
            config,
            cancel,
        };

        let result = runtime.run(context, mode, &mut registry, sender).await?;

        self.record_history(question, &result).await;
        self.spawn_summarizer(llm, clock).await;

        Ok(result)
    }

    async fn record_history(&self, question: &str, result: &ResearchOutput) {
        let (answer, citations) = match result {
            ResearchOutput::ConversationalAnswer { answer, citations, .. } => (answer.clone(), citations.clone()),
            ResearchOutput::Report { executive_summary, .. } => (executive_summary.clone(), Vec::new()),
        };

        let mut history = self.qa_history.lock().await;
        history.push(QAHistoryEntry {
            question: question.to_string(),
            answer,
            citations,
            question_embedding: None,
        });
        if history.len() > self.qa_history_cap {
            let overflow = history.len() - self.qa_history_cap;
            history.drain(0..overflow);
        }
    }

    async fn spawn_summarizer(&self, llm: Arc<dyn ChatLLM>, clock: Arc<dyn Clock>) {
        let history = self.qa_history.lock().await.clone();
        let mut summarizer = self.summarizer.lock().await;
        summarizer.spawn(llm, clock, self.session_context.clone(), history);
    }
}

/// Process-wide map of live sessions, keyed by a caller-chosen session id.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, session_id: &str, qa_history_cap: usize) -> Arc<SessionHandle> {
        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(SessionHandle::new(qa_history_cap)))
            .clone()
    }

    pub fn remove(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::fake::FakeClock;
    use crate::embeddings::fake::FakeEmbedder;
    use crate::llm::fake::ScriptedLLM;
    use crate::llm::ChatResponse;
    use crate::store::InMemoryStore;
    use crate::types::{Chunk, ChunkMetadata, Document};
    use std::collections::HashMap;
    use std::sync::atomic::AtomicBool;

    fn seed_store() -> InMemoryStore {
        let doc = Document {
            document_id: "d1".into(),
            uri: "doc://d1".into(),
            title: None,
            metadata: HashMap::new(),
            created_at: 0,
            updated_at: 0,
        };
        let chunk = Chunk {
            chunk_id: "c1".into(),
            document_id: "d1".into(),
            order: 0,
            content: "Paris is the capital of France.".into(),
            metadata: ChunkMetadata::default(),
            embedding: vec![1.0, 0.0],
        };
        InMemoryStore::new(vec![doc], vec![chunk])
    }

    #[tokio::test]
    async fn test_ask_records_history_and_returns_output() {
        let store = seed_store();
        let embedder = FakeEmbedder::new(2);
        let llm: Arc<dyn ChatLLM> = Arc::new(ScriptedLLM::new(vec![
            ChatResponse::Content(r#"{"type": "Complete", "reason": "done"}"#.into()),
            ChatResponse::Content(r#"{"answer": "Paris."}"#.into()),
            ChatResponse::Content("A follow-up summary.".into()),
        ]));
        let clock: Arc<dyn Clock> = Arc::new(FakeClock::at(42));
        let config = CoreConfig::default();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();

        let registry = SessionRegistry::new();
        let session = registry.get_or_create("s1", config.qa_history_cap);

        let result = session
            .ask(
                "What is the capital of France?",
                SynthesisMode::Conversational,
                &store,
                &embedder,
                llm,
                None,
                clock,
                &config,
                Arc::new(AtomicBool::new(false)),
                &tx,
            )
            .await
            .unwrap();

        assert!(matches!(result, ResearchOutput::ConversationalAnswer { .. }));
        assert_eq!(session.qa_history.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_registry_returns_same_handle_for_same_id() {
        let registry = SessionRegistry::new();
        let a = registry.get_or_create("s1", 50);
        let b = registry.get_or_create("s1", 50);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_snapshot_restore_roundtrip() {
        let session = SessionHandle::new(50);
        session.citation_registry.lock().await.intern("c1");
        session.qa_history.lock().await.push(QAHistoryEntry {
            question: "Q?".into(),
            answer: "A.".into(),
            citations: vec![],
            question_embedding: None,
        });
        *session.document_filter.lock().await = Some("uri LIKE '%report%'".into());

        let snapshot = session.snapshot().await;

        let restored = SessionHandle::new(50);
        restored.restore(snapshot).await;

        assert_eq!(restored.qa_history.lock().await.len(), 1);
        assert_eq!(restored.citation_registry.lock().await.index_of("c1"), Some(1));
        assert_eq!(
            restored.document_filter.lock().await.as_deref(),
            Some("uri LIKE '%report%'")
        );
    }
}
