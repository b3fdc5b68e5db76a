//! Dashboard artifact rendering: JSON, markdown table, and flat CSV.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::json;

use crate::util::text::take_chars;

use super::{InsightCounts, InsightItem};

/// `insight_dashboard.json` body.
pub(crate) fn to_json(items: &[InsightItem], generated_at: DateTime<Utc>) -> Result<String> {
    let doc = json!({
        "items": items,
        "generated_at": generated_at,
    });
    serde_json::to_string_pretty(&doc).context("failed to serialize insight dashboard")
}

fn escape_pipes(text: &str) -> String {
    text.replace('|', "\\|")
}

/// `insight_dashboard.md` body: counts header plus a pipe table.
pub(crate) fn to_markdown(items: &[InsightItem], counts: &InsightCounts) -> String {
    let mut lines = vec![
        "# Insight Dashboard".to_string(),
        String::new(),
        format!(
            "Total: {} | Actions: {} | Decisions: {} | Risks: {}\n",
            counts.total, counts.actions, counts.decisions, counts.risks
        ),
        "| Type | Title | Owner | Due | Source | Evidence |".to_string(),
        "|---|---|---|---|---|---|".to_string(),
    ];

    for item in items {
        let evidence = item
            .evidence
            .quote
            .as_deref()
            .map(|quote| escape_pipes(take_chars(quote, 80)))
            .unwrap_or_default();
        lines.push(format!(
            "| {} | {} | {} | {} | {} | {} |",
            item.item_type.as_str(),
            escape_pipes(&item.title),
            item.owner.as_deref().unwrap_or(""),
            item.due_date.as_deref().unwrap_or(""),
            item.source_analyzer.as_deref().unwrap_or(""),
            evidence,
        ));
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// `insight_dashboard.csv` body with dotted evidence columns.
pub(crate) fn to_csv(items: &[InsightItem]) -> Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record([
            "type",
            "title",
            "description",
            "owner",
            "due_date",
            "priority",
            "confidence",
            "source_analyzer",
            "evidence.segment_id",
            "evidence.speaker",
            "evidence.timestamp",
            "evidence.quote",
            "links.transcript_anchor",
        ])
        .context("failed to write csv header")?;

    for item in items {
        writer
            .write_record([
                item.item_type.as_str().to_string(),
                item.title.clone(),
                item.description.clone().unwrap_or_default(),
                item.owner.clone().unwrap_or_default(),
                item.due_date.clone().unwrap_or_default(),
                item.priority.clone().unwrap_or_default(),
                item.confidence.map(|c| c.to_string()).unwrap_or_default(),
                item.source_analyzer.clone().unwrap_or_default(),
                item.evidence
                    .segment_id
                    .map(|id| id.to_string())
                    .unwrap_or_default(),
                item.evidence.speaker.clone().unwrap_or_default(),
                item.evidence.timestamp.clone().unwrap_or_default(),
                item.evidence.quote.clone().unwrap_or_default(),
                item.links.transcript_anchor.clone().unwrap_or_default(),
            ])
            .context("failed to write csv row")?;
    }

    let bytes = writer.into_inner().context("failed to flush csv writer")?;
    String::from_utf8(bytes).context("csv output was not utf-8")
}
