//! The planner (§4.5): decides the next sub-question, or that the run is
//! complete, given everything gathered so far.

use crate::config::PlannerConfig;
use crate::error::{CoreError, CoreResult};
use crate::llm::{ChatLLM, ChatMessage};
use crate::types::{PlannerDecision, ResearchContext};

fn build_prompt(context: &ResearchContext, remaining_iterations: u32) -> String {
    let mut prompt = String::new();
    if let Some(bg) = &context.session_context {
        prompt.push_str("<background>\n");
        prompt.push_str(bg);
        prompt.push_str("\n</background>\n\n");
    }

    prompt.push_str("<prior_answers>\n");
    for qa in &context.qa_responses {
        prompt.push_str(&format!(
            "- query: {}\n  answer: {}\n  confidence: {:.2}\n",
            qa.query, qa.answer, qa.confidence
        ));
    }
    prompt.push_str("</prior_answers>\n\n");

    prompt.push_str(&format!("<original_question>{}</original_question>\n", context.original_question));
    prompt.push_str(&format!("Remaining iteration budget: {remaining_iterations}\n\n"));
    prompt.push_str(
        "Decide the single next standalone follow-up question needed to fully answer the \
         original question, resolving any pronouns against the background and prior answers. \
         If nothing further is needed, signal completion instead.\n\n\
         Respond with exactly one JSON object, nothing else:\n\
         {\"type\": \"ProposeQuestion\", \"text\": \"...\"}\n\
         or\n\
         {\"type\": \"Complete\", \"reason\": \"...\"}",
    );
    prompt
}

fn parse_decision(text: &str) -> Option<PlannerDecision> {
    let trimmed = text
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    serde_json::from_str(trimmed).ok()
}

/// Case-fold both strings and compare the shorter one's length worth of
/// leading characters; `true` when at least `threshold` of those characters
/// match (§9 Open Questions decision).
fn near_duplicate(a: &str, b: &str, threshold: f32) -> bool {
    let a: Vec<char> = a.to_lowercase().chars().collect();
    let b: Vec<char> = b.to_lowercase().chars().collect();
    let len = a.len().min(b.len());
    if len == 0 {
        return a.is_empty() && b.is_empty();
    }
    let matches = a.iter().zip(b.iter()).take(len).filter(|(x, y)| x == y).count();
    (matches as f32 / len as f32) >= threshold
}

/// Decide the next step. `consecutive_near_duplicates` is runtime state the
/// graph carries across calls within one run; two duplicate proposals back
/// to back escalate from a quiet `Complete` to [`CoreError::PlannerLoop`].
pub async fn plan_next(
    llm: &dyn ChatLLM,
    context: &ResearchContext,
    config: &PlannerConfig,
    consecutive_near_duplicates: &mut u32,
) -> CoreResult<PlannerDecision> {
    if context.iterations >= context.max_iterations {
        *consecutive_near_duplicates = 0;
        return Ok(PlannerDecision::Complete {
            reason: "iteration bound".into(),
        });
    }

    let remaining = context.max_iterations.saturating_sub(context.iterations);
    let prompt = build_prompt(context, remaining);
    let response = llm.chat(&[ChatMessage::user(prompt)], &[]).await?;

    let text = response
        .text()
        .ok_or_else(|| CoreError::LLMFailure("planner call returned tool calls, not text".into()))?;

    let decision = parse_decision(text).unwrap_or(PlannerDecision::ProposeQuestion { text: String::new() });

    let proposal = match decision {
        PlannerDecision::Complete { reason } => {
            *consecutive_near_duplicates = 0;
            return Ok(PlannerDecision::Complete { reason });
        }
        PlannerDecision::ProposeQuestion { text } => text,
    };

    let is_duplicate = proposal.trim().is_empty()
        || context
            .qa_responses
            .iter()
            .any(|qa| near_duplicate(&proposal, &qa.query, config.near_duplicate_threshold));

    if is_duplicate {
        *consecutive_near_duplicates += 1;
        if *consecutive_near_duplicates >= 2 {
            return Err(CoreError::PlannerLoop);
        }
        return Ok(PlannerDecision::Complete {
            reason: "no new direction".into(),
        });
    }

    let already_sufficient = context.qa_responses.iter().any(|qa| {
        qa.confidence >= config.completion_confidence
            && near_duplicate(&qa.query, &context.original_question, config.near_duplicate_threshold)
    });

    *consecutive_near_duplicates = 0;
    if already_sufficient {
        return Ok(PlannerDecision::Complete {
            reason: "sufficient confidence".into(),
        });
    }

    Ok(PlannerDecision::ProposeQuestion { text: proposal })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::fake::ScriptedLLM;
    use crate::llm::ChatResponse;
    use crate::types::SearchAnswer;

    fn context(question: &str, max_iterations: u32) -> ResearchContext {
        ResearchContext::new(question, max_iterations)
    }

    #[tokio::test]
    async fn test_immediate_completion_on_high_confidence_prior_answer() {
        let mut ctx = context("What is X?", 5);
        ctx.qa_responses.push(SearchAnswer {
            query: "What is X?".into(),
            answer: "X is Y.".into(),
            confidence: 0.95,
            cited_chunks: vec!["c1".into()],
            citations: vec![],
        });

        let llm = ScriptedLLM::new(vec![ChatResponse::Content(
            r#"{"type": "ProposeQuestion", "text": "Tell me more about X"}"#.into(),
        )]);
        let config = PlannerConfig::default();
        let mut dup_counter = 0;
        let decision = plan_next(&llm, &ctx, &config, &mut dup_counter).await.unwrap();
        assert!(matches!(decision, PlannerDecision::Complete { .. }));
    }

    #[tokio::test]
    async fn test_iteration_bound_forces_completion_without_llm_call() {
        let ctx = context("Q", 2);
        let mut ctx = ctx;
        ctx.iterations = 2;
        let llm = ScriptedLLM::new(vec![]);
        let config = PlannerConfig::default();
        let mut dup_counter = 0;
        let decision = plan_next(&llm, &ctx, &config, &mut dup_counter).await.unwrap();
        assert!(matches!(decision, PlannerDecision::Complete { reason } if reason == "iteration bound"));
        assert_eq!(llm.calls.lock().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_two_consecutive_duplicates_trigger_planner_loop() {
        let mut ctx = context("Q", 5);
        ctx.qa_responses.push(SearchAnswer {
            query: "What is the capital of France?".into(),
            answer: "Paris.".into(),
            confidence: 0.5,
            cited_chunks: vec![],
            citations: vec![],
        });

        let dup_text = r#"{"type": "ProposeQuestion", "text": "What is the capital of France?"}"#;
        let llm = ScriptedLLM::new(vec![
            ChatResponse::Content(dup_text.into()),
            ChatResponse::Content(dup_text.into()),
        ]);
        let config = PlannerConfig::default();
        let mut dup_counter = 0;

        let first = plan_next(&llm, &ctx, &config, &mut dup_counter).await.unwrap();
        assert!(matches!(first, PlannerDecision::Complete { .. }));

        let second = plan_next(&llm, &ctx, &config, &mut dup_counter).await;
        assert!(matches!(second, Err(CoreError::PlannerLoop)));
    }

    #[test]
    fn test_near_duplicate_threshold() {
        assert!(near_duplicate("What is the capital of France", "What is the capital of france?", 0.9));
        assert!(!near_duplicate("What is the capital of France", "How tall is the Eiffel Tower", 0.9));
    }
}
