//! Single-analyzer execution: render prompt, complete, normalize, parse,
//! extract insights/concepts, persist intermediates.
//!
//! `run` never propagates an error; every failure becomes an `error` record
//! so sibling analyzers and the stage barrier are unaffected.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::{info, warn};

use crate::analyzers::AnalyzerSpec;
use crate::clients::{CompletionRequest, LlmClient};
use crate::config::Config;
use crate::models::{AnalyzerRecord, AnalyzerStatus, Concept, Insight, Stage};
use crate::prompt::{PromptTemplate, TemplateVars};
use crate::util::markdown::normalize_markdown_tables;

use super::artifacts::JobArtifacts;

static BULLET_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*[-•*]\s+(.+)$").expect("bullet regex"));
static NUMBERED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*\d+\.\s+(.+)$").expect("numbered regex"));
static WIKILINK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[\[([^\]]+)\]\]").expect("wikilink regex"));

/// Inputs shared by every analyzer of a stage.
#[derive(Debug, Clone, Default)]
pub(crate) struct StageInputs {
    pub(crate) transcript: Option<String>,
    pub(crate) context: Option<String>,
}

/// Per-invocation context for one analyzer run.
pub(crate) struct RunContext<'a> {
    pub(crate) job_id: &'a str,
    pub(crate) inputs: &'a StageInputs,
    pub(crate) model_override: Option<&'a str>,
    pub(crate) artifacts: &'a JobArtifacts,
}

pub(crate) struct AnalyzerRunner {
    llm: Arc<LlmClient>,
    config: Arc<Config>,
}

impl AnalyzerRunner {
    pub(crate) fn new(llm: Arc<LlmClient>, config: Arc<Config>) -> Self {
        Self { llm, config }
    }

    pub(crate) fn llm(&self) -> &Arc<LlmClient> {
        &self.llm
    }

    /// Execute one analyzer end-to-end. Always returns a terminal record.
    pub(crate) async fn run(&self, spec: &AnalyzerSpec, ctx: RunContext<'_>) -> AnalyzerRecord {
        let started = Instant::now();
        let mut record = AnalyzerRecord::pending(&spec.slug);
        record.status = AnalyzerStatus::Processing;
        record.prompt_path = Some(spec.prompt_path.display().to_string());

        match self.execute(spec, &ctx, &mut record).await {
            Ok(()) => {
                record.status = AnalyzerStatus::Completed;
            }
            Err(error) => {
                warn!(
                    job_id = ctx.job_id,
                    analyzer = %spec.slug,
                    stage = %spec.stage,
                    error = %error,
                    "analyzer failed"
                );
                record.status = AnalyzerStatus::Error;
                record.error_message = Some(format!("{error:#}"));
            }
        }
        record.processing_time = started.elapsed().as_secs_f64();

        info!(
            job_id = ctx.job_id,
            analyzer = %spec.slug,
            stage = %spec.stage,
            status = ?record.status,
            processing_time = record.processing_time,
            tokens = record.token_usage.total_tokens,
            "analyzer finished"
        );

        // Intermediate artifacts for Stage A/B; Final outputs are written by
        // the scheduler under final/.
        if matches!(spec.stage, Stage::A | Stage::B) {
            self.persist_intermediate(spec, &record, ctx.artifacts).await;
        }

        record
    }

    async fn execute(
        &self,
        spec: &AnalyzerSpec,
        ctx: &RunContext<'_>,
        record: &mut AnalyzerRecord,
    ) -> anyhow::Result<()> {
        let template = PromptTemplate::load(&spec.prompt_path)?;
        template.validate_for_stage(spec.stage)?;

        let vars = TemplateVars {
            transcript: ctx.inputs.transcript.clone(),
            context: ctx.inputs.context.clone(),
            metadata: serde_json::json!({
                "job_id": ctx.job_id,
                "stage": spec.stage.as_str(),
                "analyzer": spec.slug,
            }),
        };
        let prompt = template.render(&vars)?;

        let model = ctx
            .model_override
            .map(ToString::to_string)
            .or_else(|| spec.model.clone());
        let (text, usage) = self
            .llm
            .complete(&CompletionRequest {
                prompt,
                system: None,
                model: model.clone(),
                temperature: spec.temperature,
                max_tokens: spec.max_tokens,
            })
            .await?;

        let normalized = normalize_markdown_tables(&text);
        record.raw_output = normalized.clone();
        record.token_usage = usage;
        record.model_used = Some(model.unwrap_or_else(|| self.llm.default_model().to_string()));
        record.structured_data = spec.parser.parse(&normalized);
        record.insights = extract_insights(
            &normalized,
            &record.structured_data,
            &spec.slug,
            self.config.max_insights_per_analyzer(),
        );
        record.concepts = extract_concepts(
            &normalized,
            &record.structured_data,
            self.config.max_concepts_per_analyzer(),
        );

        Ok(())
    }

    async fn persist_intermediate(
        &self,
        spec: &AnalyzerSpec,
        record: &AnalyzerRecord,
        artifacts: &JobArtifacts,
    ) {
        let dir = artifacts.intermediate_dir(spec.stage);
        let json = serde_json::to_string_pretty(record)
            .unwrap_or_else(|_| "{}".to_string());
        if let Err(error) = artifacts
            .write(&dir.join(format!("{}.json", spec.slug)), &json)
            .await
        {
            warn!(analyzer = %spec.slug, error = %error, "failed to persist intermediate json");
        }

        let markdown = format_record_markdown(spec, record);
        if let Err(error) = artifacts
            .write(&dir.join(format!("{}.md", spec.slug)), &markdown)
            .await
        {
            warn!(analyzer = %spec.slug, error = %error, "failed to persist intermediate markdown");
        }
    }
}

/// Prefer structured insights; fall back to bullet or numbered lines longer
/// than 20 characters. Capped at `max_insights`.
fn extract_insights(
    response: &str,
    structured: &Value,
    analyzer: &str,
    max_insights: usize,
) -> Vec<Insight> {
    let mut insights = Vec::new();

    if let Some(entries) = structured.get("insights").and_then(Value::as_array) {
        for entry in entries {
            match entry {
                Value::String(text) if !text.trim().is_empty() => insights.push(Insight {
                    text: text.trim().to_string(),
                    confidence: None,
                    category: None,
                    source_analyzer: Some(analyzer.to_string()),
                }),
                Value::Object(_) => {
                    let Some(text) = entry.get("text").and_then(Value::as_str) else {
                        continue;
                    };
                    if text.trim().is_empty() {
                        continue;
                    }
                    insights.push(Insight {
                        text: text.trim().to_string(),
                        confidence: entry.get("confidence").and_then(Value::as_f64),
                        category: entry
                            .get("category")
                            .and_then(Value::as_str)
                            .map(ToString::to_string),
                        source_analyzer: Some(analyzer.to_string()),
                    });
                }
                _ => {}
            }
        }
    }

    if insights.is_empty() {
        for re in [&*BULLET_RE, &*NUMBERED_RE] {
            for line in response.lines() {
                if let Some(caps) = re.captures(line) {
                    let text = caps[1].trim();
                    // Very short items are noise.
                    if text.chars().count() > 20 {
                        insights.push(Insight {
                            text: text.to_string(),
                            confidence: None,
                            category: None,
                            source_analyzer: Some(analyzer.to_string()),
                        });
                    }
                }
            }
            if !insights.is_empty() {
                break;
            }
        }
    }

    insights.truncate(max_insights);
    insights
}

/// Prefer structured concepts; fall back to `[[Name]]` spans with occurrence
/// counting. When over the cap, the highest-occurrence set is kept.
fn extract_concepts(response: &str, structured: &Value, max_concepts: usize) -> Vec<Concept> {
    let mut order: Vec<String> = Vec::new();
    let mut by_name: HashMap<String, Concept> = HashMap::new();

    if let Some(entries) = structured.get("concepts").and_then(Value::as_array) {
        for entry in entries {
            match entry {
                Value::String(name) if !name.trim().is_empty() => {
                    let name = name.trim().to_string();
                    if !by_name.contains_key(&name) {
                        order.push(name.clone());
                        by_name.insert(
                            name.clone(),
                            Concept {
                                name,
                                description: None,
                                related_concepts: Vec::new(),
                                occurrences: 1,
                            },
                        );
                    }
                }
                Value::Object(_) => {
                    let Some(name) = entry.get("name").and_then(Value::as_str) else {
                        continue;
                    };
                    let name = name.trim().to_string();
                    if name.is_empty() || by_name.contains_key(&name) {
                        continue;
                    }
                    order.push(name.clone());
                    by_name.insert(
                        name.clone(),
                        Concept {
                            name,
                            description: entry
                                .get("description")
                                .and_then(Value::as_str)
                                .map(ToString::to_string),
                            related_concepts: entry
                                .get("related")
                                .and_then(Value::as_array)
                                .map(|arr| {
                                    arr.iter()
                                        .filter_map(Value::as_str)
                                        .map(ToString::to_string)
                                        .collect()
                                })
                                .unwrap_or_default(),
                            occurrences: 1,
                        },
                    );
                }
                _ => {}
            }
        }
    }

    for caps in WIKILINK_RE.captures_iter(response) {
        let name = caps[1].trim().to_string();
        if name.is_empty() {
            continue;
        }
        match by_name.get_mut(&name) {
            Some(concept) => concept.occurrences += 1,
            None => {
                order.push(name.clone());
                by_name.insert(
                    name.clone(),
                    Concept {
                        name,
                        description: None,
                        related_concepts: Vec::new(),
                        occurrences: 1,
                    },
                );
            }
        }
    }

    let mut concepts: Vec<Concept> = order
        .into_iter()
        .filter_map(|name| by_name.remove(&name))
        .collect();
    if concepts.len() > max_concepts {
        concepts.sort_by(|a, b| b.occurrences.cmp(&a.occurrences));
        concepts.truncate(max_concepts);
    }
    concepts
}

fn format_record_markdown(spec: &AnalyzerSpec, record: &AnalyzerRecord) -> String {
    let mut lines = vec![
        format!("# {} Analysis", spec.slug.replace('_', " ")),
        format!("\n**Stage:** {}", spec.stage),
        format!(
            "**Status:** {}",
            serde_json::to_value(record.status)
                .ok()
                .and_then(|v| v.as_str().map(ToString::to_string))
                .unwrap_or_default()
        ),
        "\n## Processing Metrics".to_string(),
        format!("- **Processing Time:** {:.2} seconds", record.processing_time),
        format!("- **Tokens Used:** {}", record.token_usage.total_tokens),
        format!("  - Prompt: {}", record.token_usage.prompt_tokens),
        format!("  - Completion: {}", record.token_usage.completion_tokens),
    ];

    if !record.insights.is_empty() {
        lines.push("\n## Key Insights".to_string());
        for insight in &record.insights {
            lines.push(format!("- {}", insight.text));
        }
    }

    if !record.concepts.is_empty() {
        lines.push("\n## Identified Concepts".to_string());
        for concept in &record.concepts {
            if concept.occurrences > 1 {
                lines.push(format!("- {} ({}x)", concept.name, concept.occurrences));
            } else {
                lines.push(format!("- {}", concept.name));
            }
        }
    }

    if !record.raw_output.is_empty() {
        lines.push("\n## Raw Output".to_string());
        lines.push("```".to_string());
        lines.push(record.raw_output.clone());
        lines.push("```".to_string());
    }

    if let Some(error) = &record.error_message {
        lines.push("\n## Error Information".to_string());
        lines.push(format!("**Error:** {error}"));
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn structured_insights_take_precedence() {
        let structured = json!({
            "insights": [
                "A structured insight about the roadmap",
                {"text": "Scored insight", "confidence": 0.9, "category": "planning"}
            ]
        });
        let response = "- a bullet that would otherwise match and is long enough";

        let insights = extract_insights(response, &structured, "say_means", 10);
        assert_eq!(insights.len(), 2);
        assert_eq!(insights[1].confidence, Some(0.9));
        assert_eq!(insights[1].category.as_deref(), Some("planning"));
    }

    #[test]
    fn bullet_fallback_filters_short_items() {
        let response = "- short one\n- this bullet is definitely long enough to keep\n1. numbered also long enough to keep";
        let insights = extract_insights(response, &json!({}), "say_means", 10);
        // Bullets matched, so numbered list is not consulted.
        assert_eq!(insights.len(), 1);
        assert!(insights[0].text.starts_with("this bullet"));
    }

    #[test]
    fn numbered_fallback_applies_when_no_bullets() {
        let response = "1. first numbered item long enough to keep\n2. second numbered item long enough too";
        let insights = extract_insights(response, &json!({}), "say_means", 10);
        assert_eq!(insights.len(), 2);
    }

    #[test]
    fn insights_are_capped() {
        let response = (0..20)
            .map(|i| format!("- generated bullet insight number {i} with padding"))
            .collect::<Vec<_>>()
            .join("\n");
        let insights = extract_insights(&response, &json!({}), "say_means", 5);
        assert_eq!(insights.len(), 5);
    }

    #[test]
    fn wikilink_concepts_count_occurrences() {
        let response = "[[Pricing]] drives [[Roadmap]] and again [[Pricing]]";
        let concepts = extract_concepts(response, &json!({}), 10);
        assert_eq!(concepts.len(), 2);
        let pricing = concepts.iter().find(|c| c.name == "Pricing").unwrap();
        assert_eq!(pricing.occurrences, 2);
    }

    #[test]
    fn concept_cap_keeps_highest_occurrence() {
        let response = "[[A]] [[A]] [[A]] [[B]] [[B]] [[C]]";
        let concepts = extract_concepts(response, &json!({}), 2);
        assert_eq!(concepts.len(), 2);
        assert_eq!(concepts[0].name, "A");
        assert_eq!(concepts[1].name, "B");
    }

    #[test]
    fn structured_concepts_carry_descriptions() {
        let structured = json!({
            "concepts": [{"name": "Churn", "description": "Customer attrition", "related": ["Retention"]}]
        });
        let concepts = extract_concepts("", &structured, 10);
        assert_eq!(concepts.len(), 1);
        assert_eq!(concepts[0].description.as_deref(), Some("Customer attrition"));
        assert_eq!(concepts[0].related_concepts, vec!["Retention"]);
    }
}
