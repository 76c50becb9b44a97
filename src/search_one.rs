//! The Search-One node (§4.6): turns one sub-question into one `SearchAnswer`
//! via a bounded, tool-calling QA loop.

use std::sync::OnceLock;
use std::time::Duration;

use serde_json::json;

use crate::citation_registry::CitationRegistry;
use crate::config::{ContextConfig, SearchConfig};
use crate::context_expander::{self, ExpandedResult};
use crate::embeddings::Embedder;
use crate::error::CoreError;
use crate::filter::Filter;
use crate::llm::{ChatLLM, ChatMessage, ChatResponse, ToolSchema};
use crate::reranking::{rerank_and_replace, Reranker};
use crate::store::Store;
use crate::types::{Citation, SearchAnswer};

const MAX_TOOL_CALLS: u32 = 3;
const RETRY_BACKOFFS_MS: [u64; 2] = [100, 400];

fn ref_marker_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"\[ref:([A-Za-z0-9_-]+)\]").unwrap())
}

fn confidence_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r#"(?i)"?confidence"?\s*[:=]\s*([01](?:\.\d+)?)"#).unwrap())
}

fn search_tool_schema() -> ToolSchema {
    ToolSchema {
        name: "search_documents".into(),
        description: "Search the document store for passages relevant to a query.".into(),
        parameters: json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "The search query"}
            },
            "required": ["query"]
        }),
    }
}

struct SearchContext<'a> {
    store: &'a dyn Store,
    reranker: Option<&'a dyn Reranker>,
    search_config: &'a SearchConfig,
    context_config: &'a ContextConfig,
    filter: Option<&'a Filter>,
}

async fn run_search(ctx: &SearchContext<'_>, query: &str, embedding: &[f32]) -> Result<Vec<ExpandedResult>, CoreError> {
    let fetch_limit = if ctx.search_config.rerank_enabled {
        ctx.search_config.default_limit * ctx.search_config.rerank_multiplier
    } else {
        ctx.search_config.default_limit
    };

    let mut hits = ctx
        .store
        .search_hybrid(query, embedding, fetch_limit, ctx.filter)
        .await?;

    if ctx.search_config.rerank_enabled {
        if let Some(reranker) = ctx.reranker {
            hits = rerank_and_replace(
                reranker,
                query,
                hits,
                ctx.search_config,
                ctx.search_config.default_limit,
            )
            .await;
        } else {
            hits.truncate(ctx.search_config.default_limit);
        }
    }

    context_expander::expand_and_merge(ctx.store, &hits, ctx.context_config).await
}

fn render_snippets(results: &[ExpandedResult]) -> String {
    results
        .iter()
        .map(|r| format!("[ref:{}] {}", r.origin_chunk_id, r.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn parse_answer(text: &str) -> (String, Vec<String>, f32) {
    let mut cited: Vec<String> = Vec::new();
    for cap in ref_marker_regex().captures_iter(text) {
        let id = cap[1].to_string();
        if !cited.contains(&id) {
            cited.push(id);
        }
    }

    let confidence = confidence_regex()
        .captures(text)
        .and_then(|c| c[1].parse::<f32>().ok())
        .unwrap_or(0.5);

    let cleaned = ref_marker_regex().replace_all(text, "").trim().to_string();
    (cleaned, cited, confidence)
}

async fn with_retries<F, Fut, T>(mut f: F) -> Result<T, CoreError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, CoreError>>,
{
    let mut last_err = None;
    for (attempt, backoff_ms) in std::iter::once(0).chain(RETRY_BACKOFFS_MS).enumerate() {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
        }
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or(CoreError::LLMFailure("exhausted retries".into())))
}

/// Run the bounded QA loop for one sub-question and append its `Citation`s to
/// the session registry. On persistent failure (after retries) returns
/// [`SearchAnswer::empty`] rather than propagating the error — the graph is
/// expected to continue with the next planner step.
pub async fn search_one(
    store: &dyn Store,
    embedder: &dyn Embedder,
    llm: &dyn ChatLLM,
    reranker: Option<&dyn Reranker>,
    registry: &mut CitationRegistry,
    question: &str,
    search_config: &SearchConfig,
    context_config: &ContextConfig,
    filter: Option<&Filter>,
) -> SearchAnswer {
    let embedding = match embedder.embed(&[question.to_string()]).await {
        Ok(mut v) => v.pop().unwrap_or_default(),
        Err(_) => return SearchAnswer::empty(question),
    };

    let search_ctx = SearchContext {
        store,
        reranker,
        search_config,
        context_config,
        filter,
    };

    let initial_results = match run_search(&search_ctx, question, &embedding).await {
        Ok(r) => r,
        Err(_) => return SearchAnswer::empty(question),
    };

    let system_prompt = format!(
        "You are a careful research assistant. Answer the question using only the provided \
         snippets. Every factual claim must be followed by the [ref:chunk_id] marker of the \
         snippet it came from. If the snippets are insufficient, call search_documents with a \
         refined query (you may call it up to {MAX_TOOL_CALLS} times total). When done, reply \
         with your final answer as plain text containing [ref:...] markers and end with a line \
         `confidence: <0.0-1.0>`.",
    );

    let mut messages = vec![
        ChatMessage::system(system_prompt),
        ChatMessage::user(format!(
            "Question: {question}\n\nSnippets:\n{}",
            render_snippets(&initial_results)
        )),
    ];

    let tools = [search_tool_schema()];
    let mut tool_calls_made = 0u32;
    let mut last_text: Option<String> = None;

    loop {
        let response = with_retries(|| llm.chat(&messages, &tools)).await;
        let response = match response {
            Ok(r) => r,
            Err(_) => break,
        };

        match response {
            ChatResponse::Content(text) => {
                last_text = Some(text);
                break;
            }
            ChatResponse::ToolCalls(calls) => {
                messages.push(ChatMessage::assistant_tool_calls(calls.clone()));
                for call in calls {
                    if tool_calls_made >= MAX_TOOL_CALLS {
                        messages.push(ChatMessage::tool_result(
                            &call.id,
                            &call.name,
                            "tool call budget exhausted, answer with what you have",
                        ));
                        continue;
                    }
                    tool_calls_made += 1;

                    let query = serde_json::from_str::<serde_json::Value>(&call.arguments)
                        .ok()
                        .and_then(|v| v.get("query").and_then(|q| q.as_str()).map(str::to_string))
                        .unwrap_or_else(|| question.to_string());

                    let tool_embedding = embedder
                        .embed(&[query.clone()])
                        .await
                        .ok()
                        .and_then(|mut v| v.pop())
                        .unwrap_or_else(|| embedding.clone());

                    let results = run_search(&search_ctx, &query, &tool_embedding)
                        .await
                        .unwrap_or_default();

                    messages.push(ChatMessage::tool_result(&call.id, &call.name, &render_snippets(&results)));
                }
                if tool_calls_made >= MAX_TOOL_CALLS {
                    // One more turn to let the model produce a final answer; if it
                    // still calls tools, the budget message above makes it stop.
                }
            }
        }
    }

    let text = last_text.unwrap_or_default();
    if text.trim().is_empty() {
        return SearchAnswer::empty(question);
    }

    let (answer, cited_ids, confidence) = parse_answer(&text);

    let mut citations = Vec::new();
    let mut cited_chunks = Vec::new();
    for chunk_id in &cited_ids {
        if let Ok(chunk) = store.get_chunk(chunk_id).await {
            let doc = store.get_document(&chunk.document_id).await.ok();
            let index = registry.intern(chunk_id);
            citations.push(Citation {
                index,
                document_id: chunk.document_id.clone(),
                chunk_id: chunk_id.clone(),
                document_uri: doc.as_ref().map(|d| d.uri.clone()).unwrap_or_default(),
                document_title: doc.and_then(|d| d.title),
                page_numbers: chunk.metadata.page_numbers.clone(),
                headings: Some(chunk.metadata.headings.clone()),
                content: chunk.content.clone(),
            });
            cited_chunks.push(chunk_id.clone());
        }
    }

    SearchAnswer {
        query: question.to_string(),
        answer,
        confidence: confidence.clamp(0.0, 1.0),
        cited_chunks,
        citations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::fake::FakeEmbedder;
    use crate::llm::fake::ScriptedLLM;
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
            content: "The sky is blue because of Rayleigh scattering.".into(),
            metadata: ChunkMetadata::default(),
            embedding: vec![1.0, 0.0],
        };
        InMemoryStore::new(vec![doc], vec![chunk])
    }

    #[tokio::test]
    async fn test_search_one_extracts_citation_and_confidence() {
        let store = seed_store();
        let embedder = FakeEmbedder::new(2);
        let llm = ScriptedLLM::new(vec![ChatResponse::Content(
            "The sky is blue due to scattering [ref:c1].\nconfidence: 0.85".into(),
        )]);
        let mut registry = CitationRegistry::new();
        let search_config = SearchConfig::default();
        let context_config = ContextConfig::default();

        let answer = search_one(
            &store,
            &embedder,
            &llm,
            None,
            &mut registry,
            "Why is the sky blue?",
            &search_config,
            &context_config,
            None,
        )
        .await;

        assert_eq!(answer.cited_chunks, vec!["c1".to_string()]);
        assert_eq!(answer.citations.len(), 1);
        assert_eq!(answer.citations[0].index, 1);
        assert!((answer.confidence - 0.85).abs() < 1e-6);
        assert!(!answer.answer.contains("[ref:"));
    }

    #[tokio::test]
    async fn test_search_one_embedder_failure_yields_empty_answer() {
        let store = seed_store();
        let embedder = FakeEmbedder::failing(2);
        let llm = ScriptedLLM::new(vec![]);
        let mut registry = CitationRegistry::new();
        let search_config = SearchConfig::default();
        let context_config = ContextConfig::default();

        let answer = search_one(
            &store,
            &embedder,
            &llm,
            None,
            &mut registry,
            "Why is the sky blue?",
            &search_config,
            &context_config,
            None,
        )
        .await;

        assert_eq!(answer.confidence, 0.0);
        assert!(answer.citations.is_empty());
    }
}
