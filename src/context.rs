//! Context assembly: per-stage template inputs with deterministic, budgeted
//! content.

pub(crate) mod combiner;
pub(crate) mod summarizer;

use crate::clients::TokenCounter;
use crate::models::AnalyzerRecord;
use crate::transcript::Transcript;

/// Stage A input: the transcript trimmed to the configured token budget.
pub(crate) fn stage_a_transcript(
    counter: &TokenCounter,
    transcript: &Transcript,
    chunk_size: usize,
) -> String {
    counter.trim_to_tokens(&transcript.text_for_analysis(), chunk_size)
}

/// Canonical context sections for a set of analyzer results, preserving the
/// given order.
pub(crate) fn context_sections(results: &[(String, AnalyzerRecord)]) -> Vec<(String, String)> {
    results
        .iter()
        .map(|(slug, record)| (slug.clone(), record.to_context_string()))
        .collect()
}

/// Final-stage context: combined sections in the same canonical form as the
/// Stage B combiner, optionally trimmed to a budget (0 = no trim).
pub(crate) fn combined_context(
    counter: &TokenCounter,
    results: &[(String, AnalyzerRecord)],
    budget_tokens: usize,
) -> String {
    let mut parts = Vec::with_capacity(results.len() * 2);
    for (_, section) in context_sections(results) {
        parts.push(section);
        parts.push("\n---\n".to_string());
    }
    let combined = parts.join("\n");
    if budget_tokens > 0 {
        counter.trim_to_tokens(&combined, budget_tokens)
    } else {
        combined
    }
}

/// Char-capped full transcript for optional Stage B / Final inclusion.
pub(crate) fn capped_transcript(transcript: &Transcript, max_chars: usize) -> String {
    let text = transcript.text_for_analysis();
    if max_chars > 0 && text.chars().count() > max_chars {
        crate::util::text::take_chars(&text, max_chars).to_string()
    } else {
        text
    }
}
