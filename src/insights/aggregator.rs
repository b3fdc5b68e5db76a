//! Insight aggregation across analyzer outputs.
//!
//! Four extraction passes accumulate candidate items (later passes only add,
//! never overwrite): fenced JSON islands, structured data (canonical keys and
//! mined sections), line heuristics, and an optional LLM pass handled by the
//! caller. Items are then anchored to transcript segments and deduplicated.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::models::AnalyzerRecord;
use crate::transcript::{Transcript, TranscriptSegment};
use crate::util::text::take_chars;

use super::{InsightCounts, InsightItem, InsightType, count_items, dedupe_items};

static ACTION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(?:-\s*\[\s*\]|\*|-)?\s*(?:Action(?:\s*#?\d+)?|Action Items?)\s*[:\-]\s*(.+)$")
        .expect("action regex")
});
static DECISION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(?:\*|-)?\s*(?:Decision(?:\s*#?\d+)?|Key Decisions?)\s*[:\-]\s*(.+)$")
        .expect("decision regex")
});
static RISK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(?:\*|-)?\s*(?:Risk|Issue)\s*[:\-]\s*(.+)$").expect("risk regex")
});
static OWNER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:Assigned|Owner)\s*[:\-]\s*([^;,.\n\-—–]+)").expect("owner regex")
});
static HANDLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"@([A-Za-z0-9_\-.]+)").expect("handle regex"));
static DUE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:Due Date|Due|by)\s*[:\-]?\s*([A-Za-z0-9/\-]+)").expect("due regex")
});
static ANCHOR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\[#?seg-(\d+)\]").expect("anchor regex"));
static ANCHOR_VALUE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)#?seg-(\d+)").expect("anchor value regex"));
static LABELED_JSON_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)INSIGHTS_JSON.*?```(?:json)?\s*(\{.*?\})\s*```").expect("labeled json regex")
});
static FENCED_JSON_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```json\s*(\{.*?\})\s*```").expect("fenced json regex"));
static TYPE_PREFIX_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:action|decision|risk)\s*[:\-]\s*").expect("type prefix regex")
});
static OWNER_FRAGMENT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:Owner|Assigned)\s*[:\-]").expect("owner fragment regex")
});
static DUE_FRAGMENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bDue(?:\s*Date)?\s*[:\-]").expect("due fragment regex"));
static WS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("ws regex"));
static QUOTE_RES: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new("\u{201c}([^\u{201d}]+)\u{201d}").expect("curly quote regex"),
        Regex::new("\"([^\"]+)\"").expect("quote regex"),
    ]
});

/// Aggregate actions/decisions/risks from analyzer results and anchor them to
/// transcript evidence. `results` must be ordered; output order is stable so
/// repeat runs over the same inputs produce identical item sets.
pub(crate) fn aggregate_insights(
    results: &[(String, AnalyzerRecord)],
    transcript: Option<&Transcript>,
    created_at: DateTime<Utc>,
) -> (Vec<InsightItem>, InsightCounts) {
    let mut items: Vec<InsightItem> = Vec::new();

    // 0) JSON-first extraction from raw output blocks
    for (slug, record) in results {
        items.extend(from_json_block(slug, &record.raw_output, created_at));
    }
    // 1) Structured sections from each analyzer's parser
    for (slug, record) in results {
        items.extend(from_structured(slug, &record.structured_data, created_at));
    }
    // 2) Heuristic fallback from raw output
    for (slug, record) in results {
        items.extend(heuristics_from_text(slug, &record.raw_output, created_at));
    }

    if let Some(transcript) = transcript {
        attach_evidence(&mut items, &transcript.segments);
    }

    let unique = dedupe_items(items);
    let counts = count_items(&unique);
    (unique, counts)
}

/// Remove `[#seg-N]` tokens from text, returning the clean text and the
/// captured anchor segment id.
fn strip_and_capture_anchor(text: &str) -> (String, Option<u64>) {
    let anchor = ANCHOR_RE
        .captures(text)
        .and_then(|caps| caps[1].parse::<u64>().ok());
    let clean = ANCHOR_RE.replace_all(text, "").trim().to_string();
    (clean, anchor)
}

fn apply_anchor(item: &mut InsightItem, anchor: Option<u64>) {
    if let Some(segment_id) = anchor {
        item.links.transcript_anchor = Some(format!("#seg-{segment_id}"));
        item.evidence.segment_id = Some(segment_id);
    }
}

fn parse_anchor_value(raw: &str) -> Option<u64> {
    ANCHOR_VALUE_RE
        .captures(raw)
        .and_then(|caps| caps[1].parse::<u64>().ok())
}

fn extract_owner(text: &str) -> Option<String> {
    if let Some(caps) = OWNER_RE.captures(text) {
        let owner = caps[1].trim().trim_matches('-').trim().to_string();
        if !owner.is_empty() {
            return Some(owner);
        }
    }
    HANDLE_RE
        .captures(text)
        .map(|caps| caps[1].trim().to_string())
}

fn extract_due(text: &str) -> Option<String> {
    DUE_RE.captures(text).map(|caps| caps[1].trim().to_string())
}

fn value_str(value: &Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(text) = value.get(*key).and_then(Value::as_str) {
            let text = text.trim();
            if !text.is_empty() {
                return Some(text.to_string());
            }
        }
    }
    None
}

/// Extract items from a fenced JSON block, preferably labeled `INSIGHTS_JSON`.
fn from_json_block(analyzer: &str, raw: &str, created_at: DateTime<Utc>) -> Vec<InsightItem> {
    let mut items = Vec::new();
    if raw.is_empty() {
        return items;
    }

    let captured = LABELED_JSON_RE
        .captures(raw)
        .or_else(|| FENCED_JSON_RE.captures(raw));
    let Some(captured) = captured else {
        return items;
    };

    let parsed: Value = match serde_json::from_str(&captured[1]) {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!(analyzer, "insights JSON island parse skipped: {e}");
            return items;
        }
    };

    for (key, item_type) in [
        ("actions", InsightType::Action),
        ("decisions", InsightType::Decision),
        ("risks", InsightType::Risk),
    ] {
        let Some(entries) = parsed.get(key).and_then(Value::as_array) else {
            continue;
        };
        for entry in entries {
            match entry {
                Value::String(text) => {
                    let (title, anchor) = strip_and_capture_anchor(text);
                    if title.is_empty() {
                        continue;
                    }
                    let mut item = InsightItem::new(
                        item_type,
                        title,
                        Some(analyzer.to_string()),
                        created_at,
                    );
                    apply_anchor(&mut item, anchor);
                    items.push(item);
                }
                Value::Object(_) => {
                    let Some(raw_title) = value_str(entry, &["title", "text"]) else {
                        continue;
                    };
                    let (title, anchor) = strip_and_capture_anchor(&raw_title);
                    if title.is_empty() {
                        continue;
                    }
                    let mut item = InsightItem::new(
                        item_type,
                        title,
                        Some(analyzer.to_string()),
                        created_at,
                    );
                    item.description = value_str(entry, &["description"]);
                    item.owner = value_str(entry, &["owner"]);
                    item.due_date = value_str(entry, &["due_date", "due"]);
                    item.priority = value_str(entry, &["priority"]);
                    item.confidence = entry.get("confidence").and_then(Value::as_f64);
                    let explicit = value_str(entry, &["anchor"])
                        .as_deref()
                        .and_then(parse_anchor_value);
                    apply_anchor(&mut item, explicit.or(anchor));
                    item.refresh_id();
                    items.push(item);
                }
                _ => {}
            }
        }
    }

    items
}

/// Extract items from structured data: canonical keys first, then mined
/// sections where headings match known cues.
fn from_structured(analyzer: &str, data: &Value, created_at: DateTime<Utc>) -> Vec<InsightItem> {
    let mut items = Vec::new();

    // 1) Canonical keys used by some analyzers
    for (key, item_type) in [
        ("action_items", InsightType::Action),
        ("key_decisions", InsightType::Decision),
        ("risks", InsightType::Risk),
    ] {
        let Some(entries) = data.get(key).and_then(Value::as_array) else {
            continue;
        };
        for entry in entries {
            match entry {
                Value::String(text) => {
                    let title = text.trim();
                    if !title.is_empty() {
                        items.push(InsightItem::new(
                            item_type,
                            title,
                            Some(analyzer.to_string()),
                            created_at,
                        ));
                    }
                }
                Value::Object(_) => {
                    let Some(title) = value_str(entry, &["title", "text"]) else {
                        continue;
                    };
                    let mut item = InsightItem::new(
                        item_type,
                        title,
                        Some(analyzer.to_string()),
                        created_at,
                    );
                    item.description = value_str(entry, &["description"]);
                    item.owner = value_str(entry, &["owner"]);
                    item.due_date = value_str(entry, &["due_date", "due"]);
                    item.priority = value_str(entry, &["priority"]);
                    item.confidence = entry.get("confidence").and_then(Value::as_f64);
                    item.refresh_id();
                    items.push(item);
                }
                _ => {}
            }
        }
    }

    // 2) Sectioned markdown structures (Final analyzers)
    let Some(sections) = data.get("sections").and_then(Value::as_object) else {
        return items;
    };
    let normalized: Vec<(String, String)> = sections
        .iter()
        .map(|(heading, body)| {
            (
                heading.trim().trim_end_matches(':').to_lowercase(),
                body.as_str().unwrap_or("").to_string(),
            )
        })
        .collect();

    const DECISION_KEYS: &[&str] = &["decision", "decisions", "key decisions", "key_decisions"];
    const ACTION_KEYS: &[&str] = &[
        "actions",
        "action items",
        "action_items",
        "next steps",
        "next_steps",
        "immediate next steps",
    ];
    const RISK_KEYS: &[&str] = &["risks", "risk", "issues", "open questions", "concerns"];

    let exact = |keys: &[&str], item_type: InsightType, items: &mut Vec<InsightItem>| {
        for (heading, body) in &normalized {
            if keys.contains(&heading.as_str()) {
                mine_section_lines(analyzer, body, item_type, items, created_at);
            }
        }
    };
    exact(DECISION_KEYS, InsightType::Decision, &mut items);
    exact(ACTION_KEYS, InsightType::Action, &mut items);
    exact(RISK_KEYS, InsightType::Risk, &mut items);

    // Fuzzy heading pulls catch variants like "Action items (explicit)".
    for (heading, body) in &normalized {
        if heading.contains("decision") {
            mine_section_lines(analyzer, body, InsightType::Decision, &mut items, created_at);
        }
        if ["action", "next step", "todo", "task"]
            .iter()
            .any(|cue| heading.contains(cue))
        {
            mine_section_lines(analyzer, body, InsightType::Action, &mut items, created_at);
        }
        if ["risk", "concern", "issue", "open question"]
            .iter()
            .any(|cue| heading.contains(cue))
        {
            mine_section_lines(analyzer, body, InsightType::Risk, &mut items, created_at);
        }
    }

    items
}

fn mine_section_lines(
    analyzer: &str,
    body: &str,
    item_type: InsightType,
    items: &mut Vec<InsightItem>,
    created_at: DateTime<Utc>,
) {
    for raw_line in body.lines() {
        let line = raw_line.trim_matches([' ', '-', '\t', '*']);
        if line.is_empty() {
            continue;
        }
        let lower = line.to_lowercase();
        if lower.starts_with("actions") || lower.starts_with("decisions") || lower.starts_with("risks")
        {
            continue;
        }
        append_or_merge(analyzer, line, item_type, items, created_at);
    }
}

/// Push a new item, or merge `Owner:` / `Due:` fragments into the preceding
/// actionable item instead of emitting them as items of their own.
fn append_or_merge(
    analyzer: &str,
    line: &str,
    item_type: InsightType,
    items: &mut Vec<InsightItem>,
    created_at: DateTime<Utc>,
) {
    let is_fragment_target = |item: &InsightItem| {
        matches!(item.item_type, InsightType::Action | InsightType::Decision)
    };

    if OWNER_FRAGMENT_RE.is_match(line) && !TYPE_PREFIX_RE.is_match(line) {
        if let Some(last) = items.last_mut().filter(|i| is_fragment_target(i)) {
            if last.owner.is_none() {
                last.owner = extract_owner(line);
                last.refresh_id();
            }
        }
        return;
    }
    if DUE_FRAGMENT_RE.is_match(line) && !TYPE_PREFIX_RE.is_match(line) {
        if let Some(last) = items.last_mut().filter(|i| is_fragment_target(i)) {
            if last.due_date.is_none() {
                last.due_date = extract_due(line);
                last.refresh_id();
            }
        }
        return;
    }

    let stripped = TYPE_PREFIX_RE.replace(line, "");
    let (title, anchor) = strip_and_capture_anchor(stripped.trim());
    if title.is_empty() {
        return;
    }
    let mut item = InsightItem::new(item_type, title, Some(analyzer.to_string()), created_at);
    item.owner = extract_owner(line);
    item.due_date = extract_due(line);
    item.refresh_id();
    apply_anchor(&mut item, anchor);
    items.push(item);
}

/// Line-by-line heuristic extraction from raw output.
fn heuristics_from_text(analyzer: &str, text: &str, created_at: DateTime<Utc>) -> Vec<InsightItem> {
    let mut items: Vec<InsightItem> = Vec::new();
    let mut last_actionable: Option<usize> = None;

    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }

        let matched = [
            (&*ACTION_RE, InsightType::Action),
            (&*DECISION_RE, InsightType::Decision),
            (&*RISK_RE, InsightType::Risk),
        ]
        .iter()
        .find_map(|(re, item_type)| re.captures(line).map(|caps| (*item_type, caps)));

        if let Some((item_type, caps)) = matched {
            let (title, anchor) = strip_and_capture_anchor(caps[1].trim());
            if title.is_empty() {
                continue;
            }
            let mut item =
                InsightItem::new(item_type, title, Some(analyzer.to_string()), created_at);
            if item_type != InsightType::Risk {
                item.owner = extract_owner(line);
                item.due_date = extract_due(line);
                item.refresh_id();
            }
            apply_anchor(&mut item, anchor);
            items.push(item);
            last_actionable = match item_type {
                InsightType::Action | InsightType::Decision => Some(items.len() - 1),
                InsightType::Risk => None,
            };
            continue;
        }

        // Owner/Due fragments following an Action/Decision line
        if let Some(idx) = last_actionable {
            let item = &mut items[idx];
            if item.owner.is_none() {
                if let Some(owner) = extract_owner(line) {
                    item.owner = Some(owner);
                    item.refresh_id();
                }
            }
            if item.due_date.is_none() {
                if let Some(due) = extract_due(line) {
                    item.due_date = Some(due);
                    item.refresh_id();
                }
            }
        }
    }

    items
}

fn normalize_ws(text: &str) -> String {
    WS_RE.replace_all(text, " ").trim().to_string()
}

fn find_quote(text: &str) -> Option<String> {
    for re in QUOTE_RES.iter() {
        if let Some(caps) = re.captures(text) {
            return Some(caps[1].to_string());
        }
    }
    None
}

/// Fill evidence for items: explicit anchors resolve to their segment, other
/// items are matched by a short prefix of a quote or the title against
/// segment text.
fn attach_evidence(items: &mut [InsightItem], segments: &[TranscriptSegment]) {
    if segments.is_empty() {
        return;
    }

    for item in items.iter_mut() {
        if let Some(segment_id) = item.evidence.segment_id {
            if let Some(segment) = segments.iter().find(|s| s.segment_id == segment_id) {
                fill_evidence_from_segment(item, segment);
            }
            continue;
        }

        let quote = find_quote(&item.title)
            .or_else(|| item.description.as_deref().and_then(find_quote));
        let needle_source = quote.as_deref().unwrap_or(&item.title);
        let needle = take_chars(&normalize_ws(&needle_source.to_lowercase()), 40).to_string();
        if needle.is_empty() {
            continue;
        }

        for segment in segments {
            let hay = normalize_ws(&segment.text.to_lowercase());
            if hay.contains(&needle) {
                fill_evidence_from_segment(item, segment);
                break;
            }
        }
    }
}

fn fill_evidence_from_segment(item: &mut InsightItem, segment: &TranscriptSegment) {
    item.evidence.segment_id = Some(segment.segment_id);
    if item.evidence.speaker.is_none() {
        item.evidence.speaker = segment.speaker.clone();
    }
    if item.evidence.timestamp.is_none() {
        item.evidence.timestamp = segment.timestamp.clone();
    }
    if item.evidence.quote.is_none() {
        item.evidence.quote = Some(take_chars(segment.text.trim(), 200).to_string());
    }
    item.links.transcript_anchor = Some(format!("#seg-{}", segment.segment_id));
}
