//! Optional LLM-based insight extraction.
//!
//! One deterministic completion over the segmented transcript plus the
//! combined A+B context, constrained to a fixed JSON schema. The response is
//! schema-validated; anything that fails to parse or validate is skipped
//! wholesale so this pass can never poison the aggregated dashboard.

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tracing::warn;

use crate::clients::{CompletionRequest, LlmClient};
use crate::schema::{INSIGHT_ITEMS_SCHEMA, check_against_schema};
use crate::util::text::take_chars;

use super::{InsightItem, InsightType};

#[derive(Debug, Clone)]
pub(crate) struct LlmInsightOptions {
    pub(crate) max_items: usize,
    pub(crate) max_tokens: u32,
    pub(crate) model: Option<String>,
}

fn schema_text() -> &'static str {
    r#"Return a single JSON object with this shape:
{
  "items": [
    {
      "type": "action|decision|risk",
      "summary": "short one-line summary",
      "owner": "name or team or null",
      "due": "YYYY-MM-DD or freeform or null",
      "source": "meeting_notes|analyzer|transcript",
      "evidence": {
         "segment_ids": [int],
         "speakers": ["..."],
         "timestamps": ["..."],
         "quotes": ["short quotes"],
         "confidence": 0.0
      }
    }
  ]
}
Ensure valid JSON. Do not include any text outside the JSON. Limit items to the requested maximum."#
}

/// Call the LLM to extract structured insights. Returns the converted items
/// plus the raw parsed payload for artifact persistence. Failures yield an
/// empty result.
pub(crate) async fn extract_insights_llm(
    llm: &LlmClient,
    segmented_transcript: &str,
    combined_context: &str,
    options: &LlmInsightOptions,
    created_at: DateTime<Utc>,
) -> (Vec<InsightItem>, Value) {
    let system = "You extract Actions, Decisions, and Risks from the provided context and segmented transcript.\n\
                  Use only the provided content. Ground evidence with SEGMENT IDs.";
    let prompt = format!(
        "## Context (A+B)\n{}\n\n## Segmented Transcript\n{}\n\n## Instructions\nExtract up to {} items. Use the schema below.\n{}",
        if combined_context.is_empty() { "(none)" } else { combined_context },
        if segmented_transcript.is_empty() { "(none)" } else { segmented_transcript },
        options.max_items,
        schema_text(),
    );

    let response = llm
        .complete(&CompletionRequest {
            prompt,
            system: Some(system.to_string()),
            temperature: Some(0.0),
            max_tokens: Some(options.max_tokens),
            model: options.model.clone(),
        })
        .await;

    let text = match response {
        Ok((text, _)) => text,
        Err(error) => {
            warn!(error = %error, "LLM insight extraction failed");
            return (Vec::new(), json!({ "items": [] }));
        }
    };

    let parsed = match parse_items_payload(&text) {
        Some(parsed) => parsed,
        None => {
            warn!("failed to parse LLM insights JSON");
            return (Vec::new(), json!({ "items": [] }));
        }
    };

    if let Err(errors) = check_against_schema(&INSIGHT_ITEMS_SCHEMA, &parsed) {
        warn!(?errors, "LLM insights failed schema validation");
        return (Vec::new(), json!({ "items": [] }));
    }

    let items = convert_items(&parsed, options.max_items, created_at);
    (items, parsed)
}

/// Accept a bare object, a bare array, or a fenced JSON block.
fn parse_items_payload(text: &str) -> Option<Value> {
    let mut candidate = text.trim();
    if let Some(stripped) = candidate
        .strip_prefix("```json")
        .or_else(|| candidate.strip_prefix("```"))
    {
        candidate = stripped.strip_suffix("```").unwrap_or(stripped).trim();
    }

    let parsed: Value = if candidate.starts_with('[') {
        json!({ "items": serde_json::from_str::<Value>(candidate).ok()? })
    } else {
        serde_json::from_str(candidate).ok()?
    };
    parsed.is_object().then_some(parsed)
}

fn convert_items(parsed: &Value, max_items: usize, created_at: DateTime<Utc>) -> Vec<InsightItem> {
    let Some(entries) = parsed.get("items").and_then(Value::as_array) else {
        return Vec::new();
    };

    let mut items = Vec::new();
    for entry in entries.iter().take(max_items) {
        let Some(item_type) = entry
            .get("type")
            .and_then(Value::as_str)
            .and_then(InsightType::parse)
        else {
            continue;
        };
        let Some(summary) = entry.get("summary").and_then(Value::as_str) else {
            continue;
        };
        let title = summary.trim();
        if title.is_empty() {
            continue;
        }

        let source = entry
            .get("source")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .unwrap_or_else(|| "insight_llm".to_string());
        let mut item = InsightItem::new(item_type, title, Some(source), created_at);
        item.owner = entry
            .get("owner")
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        item.due_date = entry
            .get("due")
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        if let Some(evidence) = entry.get("evidence") {
            if let Some(segment_id) = evidence
                .get("segment_ids")
                .and_then(Value::as_array)
                .and_then(|ids| ids.first())
                .and_then(Value::as_u64)
            {
                item.evidence.segment_id = Some(segment_id);
                item.links.transcript_anchor = Some(format!("#seg-{segment_id}"));
            }
            item.evidence.speaker = first_string(evidence, "speakers");
            item.evidence.timestamp = first_string(evidence, "timestamps");
            item.evidence.quote =
                first_string(evidence, "quotes").map(|q| take_chars(&q, 200).to_string());
            item.confidence = evidence.get("confidence").and_then(Value::as_f64);
        }

        item.refresh_id();
        items.push(item);
    }
    items
}

fn first_string(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_array)
        .and_then(|arr| arr.first())
        .and_then(Value::as_str)
        .map(ToString::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_object_array_and_fenced_payloads() {
        assert!(parse_items_payload(r#"{"items": []}"#).is_some());
        assert!(parse_items_payload(r#"[{"type": "action", "summary": "x"}]"#).is_some());
        assert!(parse_items_payload("```json\n{\"items\": []}\n```").is_some());
        assert!(parse_items_payload("not json at all").is_none());
    }

    #[test]
    fn converts_validated_items_with_evidence() {
        let parsed = json!({
            "items": [{
                "type": "action",
                "summary": "Ship the fix",
                "owner": "Ana",
                "due": "2025-02-01",
                "source": "transcript",
                "evidence": {
                    "segment_ids": [7],
                    "speakers": ["Ana"],
                    "quotes": ["Ship the fix by Friday"],
                    "confidence": 0.9
                }
            }]
        });

        let items = convert_items(&parsed, 50, Utc::now());
        assert_eq!(items.len(), 1);
        let item = &items[0];
        assert_eq!(item.item_type, InsightType::Action);
        assert_eq!(item.owner.as_deref(), Some("Ana"));
        assert_eq!(item.evidence.segment_id, Some(7));
        assert_eq!(item.links.transcript_anchor.as_deref(), Some("#seg-7"));
        assert_eq!(item.confidence, Some(0.9));
    }

    #[test]
    fn unknown_types_are_skipped_and_max_items_enforced() {
        let parsed = json!({
            "items": [
                {"type": "wish", "summary": "skipped"},
                {"type": "risk", "summary": "kept"},
                {"type": "risk", "summary": "dropped by cap"}
            ]
        });

        let items = convert_items(&parsed, 2, Utc::now());
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "kept");
    }
}
