//! The background summarizer (§4.10): keeps a session's rolling
//! `SessionContext` fresh without blocking the request that triggered it.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::llm::{ChatLLM, ChatMessage};
use crate::types::{QAHistoryEntry, SessionContext};

/// Rule-based compression of conversation turns into a summary + recent
/// verbatim tail, used only as the fallback when the LLM summarization call
/// itself fails (§4.10 implementation notes).
struct CompressedHistory {
    summary: Option<String>,
    recent_messages: Vec<(String, String)>,
}

fn compress_history(messages: &[(String, String)], max_recent: usize) -> CompressedHistory {
    if messages.len() <= max_recent {
        return CompressedHistory {
            summary: None,
            recent_messages: messages.to_vec(),
        };
    }

    let split_point = messages.len() - max_recent;
    let to_summarize = &messages[..split_point];
    let recent = &messages[split_point..];

    let mut topics: Vec<String> = Vec::new();
    let mut entities: Vec<String> = Vec::new();
    let mut files: Vec<String> = Vec::new();

    for (role, content) in to_summarize {
        if role == "user" || role == "User" {
            let topic: String = content.chars().take(80).collect();
            topics.push(topic.trim().to_string());
        }

        for word in content.split_whitespace() {
            let clean = word.trim_matches(|c: char| !c.is_alphanumeric() && c != '.' && c != '/' && c != '\\');
            if clean.is_empty() {
                continue;
            }

            if (clean.contains('/') || clean.contains('\\')) && clean.len() > 4 && !files.contains(&clean.to_string())
            {
                files.push(clean.to_string());
                continue;
            }

            if clean.contains('.') && clean.len() > 4 {
                let ext = clean.rsplit('.').next().unwrap_or("");
                if matches!(ext, "pdf" | "docx" | "xlsx" | "csv" | "txt" | "json" | "xml")
                    && !files.contains(&clean.to_string())
                {
                    files.push(clean.to_string());
                    continue;
                }
            }

            if clean.len() > 2
                && clean.chars().next().map(|c| c.is_uppercase()).unwrap_or(false)
                && !clean.chars().all(|c| c.is_uppercase())
                && !entities.contains(&clean.to_string())
            {
                entities.push(clean.to_string());
            }
        }
    }

    entities.sort();
    entities.dedup();
    entities.truncate(15);
    files.truncate(10);
    topics.truncate(5);

    let mut summary_parts = Vec::new();
    if !topics.is_empty() {
        summary_parts.push(format!("Previous questions: {}", topics.join("; ")));
    }
    if !entities.is_empty() {
        summary_parts.push(format!("Key entities: {}", entities.join(", ")));
    }
    if !files.is_empty() {
        summary_parts.push(format!("Files discussed: {}", files.join(", ")));
    }

    let summary = if summary_parts.is_empty() {
        None
    } else {
        Some(summary_parts.join(". ") + ".")
    };

    CompressedHistory {
        summary,
        recent_messages: recent.to_vec(),
    }
}

fn format_compressed_history(history: &CompressedHistory) -> String {
    let mut result = String::new();
    if let Some(summary) = &history.summary {
        result.push_str("\nConversation history (for topic continuity only): ");
        result.push_str(summary);
        result.push_str("\n\nRecent turns:\n");
    } else if !history.recent_messages.is_empty() {
        result.push_str("\nConversation history (for topic continuity only):\n");
    }
    for (role, content) in &history.recent_messages {
        result.push_str(&format!("{role}: {content}\n"));
    }
    result
}

fn history_as_turns(history: &[QAHistoryEntry]) -> Vec<(String, String)> {
    history
        .iter()
        .flat_map(|h| {
            vec![
                ("user".to_string(), h.question.clone()),
                ("assistant".to_string(), h.answer.clone()),
            ]
        })
        .collect()
}

const MAX_RECENT_TURNS: usize = 6;

/// Owns the one in-flight summarization task a session may have at a time.
#[derive(Default)]
pub struct Summarizer {
    handle: Option<JoinHandle<()>>,
}

impl Summarizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start summarizing `history` in the background, replacing whatever
    /// `session_context` currently holds once the LLM call resolves. Aborts
    /// any summarization already in flight for this session first.
    pub fn spawn(
        &mut self,
        llm: Arc<dyn ChatLLM>,
        clock: Arc<dyn Clock>,
        session_context: Arc<Mutex<Option<SessionContext>>>,
        history: Vec<QAHistoryEntry>,
    ) {
        if let Some(old) = self.handle.take() {
            old.abort();
        }

        let handle = tokio::spawn(async move {
            let turns = history_as_turns(&history);
            let prior = session_context.lock().await.clone();

            let prompt = format!(
                "Summarize this research conversation so far in 2-4 sentences, preserving the \
                 topics and entities discussed so a future turn can resolve pronouns against \
                 it. Prior summary (if any): {}\n\nConversation:\n{}",
                prior.as_ref().map(|c| c.summary.as_str()).unwrap_or("(none)"),
                turns
                    .iter()
                    .map(|(role, content)| format!("{role}: {content}"))
                    .collect::<Vec<_>>()
                    .join("\n"),
            );

            let llm_summary = llm
                .chat(&[ChatMessage::user(prompt)], &[])
                .await
                .ok()
                .and_then(|r| r.text().map(str::to_string));

            let summary = match llm_summary {
                Some(s) if !s.trim().is_empty() => Some(s),
                _ => {
                    // LLM summarization failed. Only replace an already-stale
                    // summary with the rule-based one; never seed a fresh
                    // session_context from nothing on first failure.
                    if prior.is_some() {
                        let compressed = compress_history(&turns, MAX_RECENT_TURNS);
                        Some(format_compressed_history(&compressed))
                    } else {
                        None
                    }
                }
            };

            if let Some(summary) = summary {
                let mut guard = session_context.lock().await;
                *guard = Some(SessionContext {
                    summary,
                    last_updated: clock.now_unix(),
                });
            }
        });

        self.handle = Some(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::fake::FakeClock;
    use crate::llm::fake::ScriptedLLM;
    use crate::llm::ChatResponse;

    fn entry(question: &str, answer: &str) -> QAHistoryEntry {
        QAHistoryEntry {
            question: question.into(),
            answer: answer.into(),
            citations: vec![],
            question_embedding: None,
        }
    }

    #[tokio::test]
    async fn test_spawn_replaces_session_context_on_success() {
        let llm: Arc<dyn ChatLLM> = Arc::new(ScriptedLLM::new(vec![ChatResponse::Content(
            "We discussed the capital of France.".into(),
        )]));
        let clock: Arc<dyn Clock> = Arc::new(FakeClock::at(1000));
        let session_context = Arc::new(Mutex::new(None));
        let mut summarizer = Summarizer::new();

        summarizer.spawn(
            llm,
            clock,
            session_context.clone(),
            vec![entry("What is the capital of France?", "Paris.")],
        );

        summarizer.handle.take().unwrap().await.unwrap();

        let ctx = session_context.lock().await;
        assert_eq!(ctx.as_ref().unwrap().summary, "We discussed the capital of France.");
        assert_eq!(ctx.as_ref().unwrap().last_updated, 1000);
    }

    #[tokio::test]
    async fn test_first_failure_with_no_prior_context_stays_none() {
        let llm: Arc<dyn ChatLLM> = Arc::new(ScriptedLLM::new(vec![]));
        let clock: Arc<dyn Clock> = Arc::new(FakeClock::at(1000));
        let session_context = Arc::new(Mutex::new(None));
        let mut summarizer = Summarizer::new();

        summarizer.spawn(llm, clock, session_context.clone(), vec![entry("Q?", "A.")]);
        summarizer.handle.take().unwrap().await.unwrap();

        assert!(session_context.lock().await.is_none());
    }

    #[tokio::test]
    async fn test_failure_with_prior_context_falls_back_to_rule_based_summary() {
        let llm: Arc<dyn ChatLLM> = Arc::new(ScriptedLLM::new(vec![]));
        let clock: Arc<dyn Clock> = Arc::new(FakeClock::at(2000));
        let session_context = Arc::new(Mutex::new(Some(SessionContext {
            summary: "stale summary".into(),
            last_updated: 500,
        })));
        let mut summarizer = Summarizer::new();

        summarizer.spawn(
            llm,
            clock,
            session_context.clone(),
            vec![entry("What is the capital of France?", "Paris.")],
        );
        summarizer.handle.take().unwrap().await.unwrap();

        let ctx = session_context.lock().await;
        assert_ne!(ctx.as_ref().unwrap().summary, "stale summary");
        assert_eq!(ctx.as_ref().unwrap().last_updated, 2000);
    }
}
