//! The graph runtime (§4.8): drives `PlanNext -> SearchOne -> PlanNext -> ...
//! -> Synthesize`, emitting a totally-ordered stream of events that never
//! gates the run's own progress.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

use crate::citation_registry::CitationRegistry;
use crate::config::CoreConfig;
use crate::embeddings::Embedder;
use crate::error::{CoreError, CoreResult};
use crate::llm::ChatLLM;
use crate::planner::{self};
use crate::reranking::Reranker;
use crate::search_one;
use crate::store::Store;
use crate::synthesizer;
use crate::types::{PlannerDecision, ResearchContext, ResearchOutput, SynthesisMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphNode {
    PlanNext,
    SearchOne,
    Synthesize,
}

/// The tagged union pushed onto the run's event stream. `#[serde(tag =
/// "type")]` with `SCREAMING_SNAKE_CASE` variants matches the wire shape
/// (§6).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamEvent {
    RunStarted,
    StepStarted { node: GraphNode },
    StepFinished { node: GraphNode },
    StateSnapshot { context: ResearchContext },
    StateDelta { node: GraphNode, iterations: u32 },
    ActivitySnapshot { node: GraphNode, payload: String },
    RunFinished { result: ResearchOutput },
    RunError { kind: String, message: String },
}

fn emit(sender: &UnboundedSender<StreamEvent>, event: StreamEvent) {
    // An absent or dropped receiver must never stop the run; the send
    // failing just means nobody is watching.
    let _ = sender.send(event);
}

fn check_cancelled(cancel: &AtomicBool) -> CoreResult<()> {
    if cancel.load(Ordering::SeqCst) {
        Err(CoreError::Cancelled)
    } else {
        Ok(())
    }
}

/// Everything the runtime needs that isn't already in `ResearchContext` or
/// `CoreConfig`: the capabilities, the citation registry, and the
/// cooperative cancellation flag.
pub struct GraphRuntime<'a> {
    pub store: &'a dyn Store,
    pub embedder: &'a dyn Embedder,
    pub llm: &'a dyn ChatLLM,
    pub reranker: Option<&'a dyn Reranker>,
    pub config: &'a CoreConfig,
    pub cancel: Arc<AtomicBool>,
}

impl<'a> GraphRuntime<'a> {
    /// Run the full `PlanNext -> SearchOne -> ... -> Synthesize` loop,
    /// pushing events to `sender` as it goes. Returns the final output, or a
    /// `CoreError` mirroring the terminal `RunError` event already emitted.
    pub async fn run(
        &self,
        mut context: ResearchContext,
        mode: SynthesisMode,
        registry: &mut CitationRegistry,
        sender: &UnboundedSender<StreamEvent>,
    ) -> CoreResult<ResearchOutput> {
        emit(sender, StreamEvent::RunStarted);

        let mut consecutive_near_duplicates = 0u32;

        loop {
            if let Err(e) = check_cancelled(&self.cancel) {
                emit(
                    sender,
                    StreamEvent::RunError {
                        kind: e.kind().into(),
                        message: e.to_string(),
                    },
                );
                return Err(e);
            }

            emit(sender, StreamEvent::StepStarted { node: GraphNode::PlanNext });
            let decision = self
                .plan_with_retry(&context, &mut consecutive_near_duplicates)
                .await;
            let decision = match decision {
                Ok(d) => d,
                Err(e) => {
                    emit(
                        sender,
                        StreamEvent::RunError {
                            kind: e.kind().into(),
                            message: e.to_string(),
                        },
                    );
                    return Err(e);
                }
            };
            emit(sender, StreamEvent::StepFinished { node: GraphNode::PlanNext });

            match decision {
                PlannerDecision::Complete { reason } => {
                    emit(
                        sender,
                        StreamEvent::ActivitySnapshot {
                            node: GraphNode::PlanNext,
                            payload: reason,
                        },
                    );
                    break;
                }
                PlannerDecision::ProposeQuestion { text } => {
                    if let Err(e) = check_cancelled(&self.cancel) {
                        emit(
                            sender,
                            StreamEvent::RunError {
                                kind: e.kind().into(),
                                message: e.to_string(),
                            },
                        );
                        return Err(e);
                    }

                    emit(sender, StreamEvent::StepStarted { node: GraphNode::SearchOne });
                    let filter = context
                        .search_filter
                        .as_deref()
                        .and_then(|s| crate::filter::Filter::parse(s).ok());

                    let answer = search_one::search_one(
                        self.store,
                        self.embedder,
                        self.llm,
                        self.reranker,
                        registry,
                        &text,
                        &self.config.search,
                        &self.config.context,
                        filter.as_ref(),
                    )
                    .await;

                    context.qa_responses.push(answer);
                    context.iterations += 1;
                    emit(
                        sender,
                        StreamEvent::StateDelta {
                            node: GraphNode::SearchOne,
                            iterations: context.iterations,
                        },
                    );
                    emit(sender, StreamEvent::StepFinished { node: GraphNode::SearchOne });
                }
            }
        }

        emit(sender, StreamEvent::StepStarted { node: GraphNode::Synthesize });
        let result = self.synthesize_with_retry(&context, mode, registry).await;
        let result = match result {
            Ok(r) => r,
            Err(e) => {
                emit(
                    sender,
                    StreamEvent::RunError {
                        kind: e.kind().into(),
                        message: e.to_string(),
                    },
                );
                return Err(e);
            }
        };
        emit(sender, StreamEvent::StepFinished { node: GraphNode::Synthesize });
        emit(sender, StreamEvent::RunFinished { result: result.clone() });

        Ok(result)
    }

    /// `LLMFailure` in the planner is retried once before the run aborts
    /// (§7 propagation policy).
    async fn plan_with_retry(
        &self,
        context: &ResearchContext,
        consecutive_near_duplicates: &mut u32,
    ) -> CoreResult<PlannerDecision> {
        match planner::plan_next(self.llm, context, &self.config.planner, consecutive_near_duplicates).await {
            Ok(d) => Ok(d),
            Err(CoreError::LLMFailure(_)) => {
                planner::plan_next(self.llm, context, &self.config.planner, consecutive_near_duplicates).await
            }
            Err(e) => Err(e),
        }
    }

    /// `LLMFailure` in the synthesizer is retried once before the run aborts.
    async fn synthesize_with_retry(
        &self,
        context: &ResearchContext,
        mode: SynthesisMode,
        registry: &CitationRegistry,
    ) -> CoreResult<ResearchOutput> {
        match synthesizer::synthesize(self.llm, context, mode, registry).await {
            Ok(r) => Ok(r),
            Err(CoreError::LLMFailure(_)) => synthesizer::synthesize(self.llm, context, mode, registry).await,
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::fake::FakeEmbedder;
    use crate::llm::fake::ScriptedLLM;
    use crate::llm::ChatResponse;
    use crate::store::InMemoryStore;
    use crate::types::{Chunk, ChunkMetadata, Document};
    use std::collections::HashMap;

    fn seed_store() -> InMemoryStore {
        let doc = Document {
            document_id: "d1".into(),
            uri: "doc://d1".into(),
            title: Some("Doc One".into()),
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
    async fn test_graph_runs_to_completion_and_emits_terminal_event() {
        let store = seed_store();
        let embedder = FakeEmbedder::new(2);
        let llm = ScriptedLLM::new(vec![
            ChatResponse::Content(r#"{"type": "Complete", "reason": "nothing to ask"}"#.into()),
            ChatResponse::Content(r#"{"answer": "Paris is the capital."}"#.into()),
        ]);
        let config = CoreConfig::default();
        let cancel = Arc::new(AtomicBool::new(false));
        let runtime = GraphRuntime {
            store: &store,
            embedder: &embedder,
            llm: &llm,
            reranker: None,
            config: &config,
            cancel,
        };

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut registry = CitationRegistry::new();
        let context = ResearchContext::new("What is the capital of France?", 5);

        let result = runtime
            .run(context, SynthesisMode::Conversational, &mut registry, &tx)
            .await
            .unwrap();

        assert!(matches!(result, ResearchOutput::ConversationalAnswer { .. }));

        drop(tx);
        let mut saw_run_finished = false;
        while let Some(event) = rx.recv().await {
            if matches!(event, StreamEvent::RunFinished { .. }) {
                saw_run_finished = true;
            }
        }
        assert!(saw_run_finished);
    }

    #[tokio::test]
    async fn test_cancellation_before_first_step_yields_run_error() {
        let store = seed_store();
        let embedder = FakeEmbedder::new(2);
        let llm = ScriptedLLM::new(vec![]);
        let config = CoreConfig::default();
        let cancel = Arc::new(AtomicBool::new(true));
        let runtime = GraphRuntime {
            store: &store,
            embedder: &embedder,
            llm: &llm,
            reranker: None,
            config: &config,
            cancel,
        };

        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let mut registry = CitationRegistry::new();
        let context = ResearchContext::new("Q", 5);

        let result = runtime
            .run(context, SynthesisMode::Conversational, &mut registry, &tx)
            .await;

        assert!(matches!(result, Err(CoreError::Cancelled)));
    }

    #[tokio::test]
    async fn test_search_one_invocations_bounded_by_max_iterations() {
        let store = seed_store();
        let embedder = FakeEmbedder::new(2);
        // The planner always proposes a fresh question; the iteration bound
        // must stop the loop without the planner's own duplicate detection
        // kicking in.
        let llm = ScriptedLLM::new(vec![
            ChatResponse::Content(r#"{"type": "ProposeQuestion", "text": "Where is France?"}"#.into()),
            ChatResponse::Content("Answer one [ref:c1].\nconfidence: 0.4".into()),
            ChatResponse::Content(r#"{"answer": "done"}"#.into()),
        ]);
        let mut config = CoreConfig::default();
        config.planner.max_iterations = 1;
        let cancel = Arc::new(AtomicBool::new(false));
        let runtime = GraphRuntime {
            store: &store,
            embedder: &embedder,
            llm: &llm,
            reranker: None,
            config: &config,
            cancel,
        };

        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let mut registry = CitationRegistry::new();
        let mut context = ResearchContext::new("Where is France?", 1);
        context.max_iterations = 1;

        runtime
            .run(context, SynthesisMode::Conversational, &mut registry, &tx)
            .await
            .unwrap();
    }
}
