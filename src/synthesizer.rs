//! The synthesizer (§4.7): turns accumulated `qa_responses` into the final
//! `ResearchOutput`, in either Report or Conversational mode.

use std::collections::HashSet;
use std::sync::OnceLock;

use serde::Deserialize;

use crate::citation_registry::CitationRegistry;
use crate::error::{CoreError, CoreResult};
use crate::llm::{ChatLLM, ChatMessage};
use crate::types::{Citation, ResearchContext, ResearchOutput, SynthesisMode};

fn marker_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"\[ref:([A-Za-z0-9_-]+)\]").unwrap())
}

fn allowed_chunk_ids(context: &ResearchContext) -> HashSet<&str> {
    context
        .qa_responses
        .iter()
        .flat_map(|qa| qa.cited_chunks.iter().map(String::as_str))
        .collect()
}

/// Strip any `[ref:chunk_id]` marker whose referent isn't in `allowed`.
fn filter_text(text: &str, allowed: &HashSet<&str>) -> String {
    marker_regex()
        .replace_all(text, |caps: &regex::Captures| {
            if allowed.contains(&caps[1]) {
                caps[0].to_string()
            } else {
                String::new()
            }
        })
        .to_string()
}

fn filter_all(fields: &mut [&mut String], allowed: &HashSet<&str>) {
    for field in fields.iter_mut() {
        **field = filter_text(field, allowed);
    }
}

fn filter_vec(items: &mut [String], allowed: &HashSet<&str>) {
    for item in items.iter_mut() {
        *item = filter_text(item, allowed);
    }
}

#[derive(Debug, Deserialize)]
struct ReportDraft {
    title: String,
    executive_summary: String,
    main_findings: Vec<String>,
    conclusions: Vec<String>,
    recommendations: Vec<String>,
    limitations: Vec<String>,
    sources_summary: String,
}

#[derive(Debug, Deserialize)]
struct ConversationalDraft {
    answer: String,
}

fn parse_json<T: for<'de> Deserialize<'de>>(text: &str) -> Option<T> {
    let trimmed = text
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    serde_json::from_str(trimmed).ok()
}

fn qa_digest(context: &ResearchContext) -> String {
    context
        .qa_responses
        .iter()
        .map(|qa| format!("Q: {}\nA: {}\n", qa.query, qa.answer))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Deduplicated union of every cited chunk across `qa_responses`, first
/// occurrence wins, built fresh from the already-assigned registry indices
/// rather than re-interning (citations are interned as they're produced by
/// `search_one`).
fn union_citations(context: &ResearchContext) -> Vec<Citation> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for qa in &context.qa_responses {
        for citation in &qa.citations {
            if seen.insert(citation.chunk_id.clone()) {
                out.push(citation.clone());
            }
        }
    }
    out
}

/// Produce the final `ResearchOutput`. Never fails the whole run: if the LLM
/// call or its parse fails, a minimal, still-grounded output is synthesized
/// directly from `qa_responses` rather than propagating the error upward.
pub async fn synthesize(
    llm: &dyn ChatLLM,
    context: &ResearchContext,
    mode: SynthesisMode,
    _registry: &CitationRegistry,
) -> CoreResult<ResearchOutput> {
    let allowed = allowed_chunk_ids(context);

    match mode {
        SynthesisMode::Report => synthesize_report(llm, context, &allowed).await,
        SynthesisMode::Conversational => synthesize_conversational(llm, context, &allowed).await,
    }
}

async fn synthesize_report(
    llm: &dyn ChatLLM,
    context: &ResearchContext,
    allowed: &HashSet<&str>,
) -> CoreResult<ResearchOutput> {
    let prompt = format!(
        "Original question: {}\n\n{}\n\nWrite a research report grounded only in the \
         answers above. Every claim must carry the [ref:chunk_id] marker(s) it came from.\n\n\
         Respond with exactly one JSON object, nothing else:\n\
         {{\"title\": \"5-12 words\", \"executive_summary\": \"3-5 sentences\", \
         \"main_findings\": [\"4-8 items\"], \"conclusions\": [\"2-4 items\"], \
         \"recommendations\": [\"2-5 items\"], \"limitations\": [\"1-3 items\"], \
         \"sources_summary\": \"brief\"}}",
        context.original_question,
        qa_digest(context),
    );

    let response = llm.chat(&[ChatMessage::user(prompt)], &[]).await?;
    let text = response
        .text()
        .ok_or_else(|| CoreError::LLMFailure("synthesizer call returned tool calls, not text".into()))?;

    let draft = parse_json::<ReportDraft>(text);

    let mut output = match draft {
        Some(d) => ResearchOutput::Report {
            title: d.title,
            executive_summary: d.executive_summary,
            main_findings: d.main_findings,
            conclusions: d.conclusions,
            recommendations: d.recommendations,
            limitations: d.limitations,
            sources_summary: d.sources_summary,
        },
        None => fallback_report(context),
    };

    if let ResearchOutput::Report {
        title,
        executive_summary,
        main_findings,
        conclusions,
        recommendations,
        limitations,
        sources_summary,
    } = &mut output
    {
        filter_all(&mut [title, executive_summary, sources_summary], allowed);
        filter_vec(main_findings, allowed);
        filter_vec(conclusions, allowed);
        filter_vec(recommendations, allowed);
        filter_vec(limitations, allowed);
    }

    Ok(output)
}

fn fallback_report(context: &ResearchContext) -> ResearchOutput {
    ResearchOutput::Report {
        title: format!("Findings for: {}", context.original_question),
        executive_summary: context
            .qa_responses
            .iter()
            .map(|qa| qa.answer.as_str())
            .collect::<Vec<_>>()
            .join(" "),
        main_findings: context.qa_responses.iter().map(|qa| qa.answer.clone()).collect(),
        conclusions: Vec::new(),
        recommendations: Vec::new(),
        limitations: vec!["Synthesis fell back to raw sub-answers.".into()],
        sources_summary: format!("{} sub-question(s) answered.", context.qa_responses.len()),
    }
}

async fn synthesize_conversational(
    llm: &dyn ChatLLM,
    context: &ResearchContext,
    allowed: &HashSet<&str>,
) -> CoreResult<ResearchOutput> {
    let prompt = format!(
        "Original question: {}\n\n{}\n\nWrite one direct answer to the original question, \
         grounded only in the answers above. Carry forward the [ref:chunk_id] marker(s) each \
         claim came from.\n\nRespond with exactly one JSON object, nothing else:\n\
         {{\"answer\": \"...\"}}",
        context.original_question,
        qa_digest(context),
    );

    let response = llm.chat(&[ChatMessage::user(prompt)], &[]).await?;
    let text = response
        .text()
        .ok_or_else(|| CoreError::LLMFailure("synthesizer call returned tool calls, not text".into()))?;

    let mut answer = parse_json::<ConversationalDraft>(text)
        .map(|d| d.answer)
        .unwrap_or_else(|| fallback_answer(context));

    filter_all(&mut [&mut answer], allowed);

    let citations = union_citations(context);
    let confidence = context
        .qa_responses
        .iter()
        .map(|qa| qa.confidence)
        .fold(0.0_f32, f32::max);

    Ok(ResearchOutput::ConversationalAnswer {
        answer,
        confidence,
        citations,
    })
}

fn fallback_answer(context: &ResearchContext) -> String {
    context
        .qa_responses
        .iter()
        .map(|qa| qa.answer.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}
