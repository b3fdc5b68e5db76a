//! Insight dashboard model: unified action/decision/risk items with evidence
//! links back to transcript segments.

pub(crate) mod aggregator;
pub(crate) mod llm;
pub(crate) mod writer;

use chrono::{DateTime, Utc};
use serde::Serialize;
use xxhash_rust::xxh3::xxh3_64;

/// Item category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InsightType {
    Action,
    Decision,
    Risk,
}

impl InsightType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            InsightType::Action => "action",
            InsightType::Decision => "decision",
            InsightType::Risk => "risk",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "action" => Some(InsightType::Action),
            "decision" => Some(InsightType::Decision),
            "risk" => Some(InsightType::Risk),
            _ => None,
        }
    }
}

/// Transcript evidence backing an item.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Evidence {
    pub segment_id: Option<u64>,
    pub speaker: Option<String>,
    pub timestamp: Option<String>,
    pub quote: Option<String>,
}

/// Outbound links for an item.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Links {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript_anchor: Option<String>,
}

/// A consolidated insight item.
#[derive(Debug, Clone, Serialize)]
pub struct InsightItem {
    pub insight_id: String,
    #[serde(rename = "type")]
    pub item_type: InsightType,
    pub title: String,
    pub description: Option<String>,
    pub owner: Option<String>,
    pub due_date: Option<String>,
    pub priority: Option<String>,
    pub confidence: Option<f64>,
    pub source_analyzer: Option<String>,
    pub evidence: Evidence,
    pub links: Links,
    pub created_at: DateTime<Utc>,
}

impl InsightItem {
    #[must_use]
    pub fn new(
        item_type: InsightType,
        title: impl Into<String>,
        source_analyzer: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let title = title.into();
        let mut item = Self {
            insight_id: String::new(),
            item_type,
            title,
            description: None,
            owner: None,
            due_date: None,
            priority: None,
            confidence: None,
            source_analyzer,
            evidence: Evidence::default(),
            links: Links::default(),
            created_at,
        };
        item.insight_id = item.derive_id();
        item
    }

    /// Deterministic id derived from the identity key plus source, so repeat
    /// aggregations over the same inputs produce identical ids.
    fn derive_id(&self) -> String {
        let canonical = format!(
            "{}\u{1}{}\u{1}{}\u{1}{}\u{1}{}",
            self.item_type.as_str(),
            self.title.trim().to_lowercase(),
            self.owner.as_deref().unwrap_or(""),
            self.due_date.as_deref().unwrap_or(""),
            self.source_analyzer.as_deref().unwrap_or(""),
        );
        format!("in-{:016x}", xxh3_64(canonical.as_bytes()))
    }

    /// Recompute the id after owner/due mutations.
    pub(crate) fn refresh_id(&mut self) {
        self.insight_id = self.derive_id();
    }

    /// Dedup key: `(type, lower(trim(title)), owner, due_date)`.
    #[must_use]
    pub fn dedup_key(&self) -> (String, String, Option<String>, Option<String>) {
        (
            self.item_type.as_str().to_string(),
            self.title.trim().to_lowercase(),
            self.owner.clone(),
            self.due_date.clone(),
        )
    }
}

/// Item counts by category.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct InsightCounts {
    pub total: usize,
    pub actions: usize,
    pub decisions: usize,
    pub risks: usize,
}

#[must_use]
pub fn count_items(items: &[InsightItem]) -> InsightCounts {
    InsightCounts {
        total: items.len(),
        actions: items
            .iter()
            .filter(|i| i.item_type == InsightType::Action)
            .count(),
        decisions: items
            .iter()
            .filter(|i| i.item_type == InsightType::Decision)
            .count(),
        risks: items
            .iter()
            .filter(|i| i.item_type == InsightType::Risk)
            .count(),
    }
}

/// Collapse duplicates, keeping the first occurrence of each dedup key.
#[must_use]
pub fn dedupe_items(items: Vec<InsightItem>) -> Vec<InsightItem> {
    let mut seen = std::collections::HashSet::new();
    let mut unique = Vec::with_capacity(items.len());
    for item in items {
        if seen.insert(item.dedup_key()) {
            unique.push(item);
        }
    }
    unique
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedupe_collapses_by_type_title_owner_due() {
        let now = Utc::now();
        let mut a = InsightItem::new(InsightType::Action, "Ship the fix", None, now);
        a.owner = Some("Ana".to_string());
        let mut b = InsightItem::new(InsightType::Action, "  ship the FIX  ", None, now);
        b.owner = Some("Ana".to_string());
        let c = InsightItem::new(InsightType::Risk, "Ship the fix", None, now);

        let unique = dedupe_items(vec![a, b, c]);
        assert_eq!(unique.len(), 2);

        let counts = count_items(&unique);
        assert_eq!(counts.total, 2);
        assert_eq!(counts.actions, 1);
        assert_eq!(counts.risks, 1);
    }

    #[test]
    fn ids_are_deterministic_for_identical_items() {
        let a = InsightItem::new(
            InsightType::Decision,
            "Use postgres",
            Some("meeting_notes".to_string()),
            Utc::now(),
        );
        let b = InsightItem::new(
            InsightType::Decision,
            "Use postgres",
            Some("meeting_notes".to_string()),
            Utc::now(),
        );
        assert_eq!(a.insight_id, b.insight_id);
    }

    #[test]
    fn insight_type_parses_known_labels() {
        assert_eq!(InsightType::parse("Action"), Some(InsightType::Action));
        assert_eq!(InsightType::parse(" risk "), Some(InsightType::Risk));
        assert_eq!(InsightType::parse("hope"), None);
    }
}
