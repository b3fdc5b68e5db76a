//! Typed records shared across the pipeline: the durable `Job` document, the
//! per-analyzer result record, token accounting, and the submission payload.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Pipeline stage of an analyzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    #[serde(rename = "stage_a")]
    A,
    #[serde(rename = "stage_b")]
    B,
    #[serde(rename = "final")]
    Final,
}

impl Stage {
    /// Stable identifier used in events and artifact paths.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::A => "stage_a",
            Stage::B => "stage_b",
            Stage::Final => "final",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a whole job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Error,
}

/// Lifecycle of a single analyzer inside a job. Transitions only move forward:
/// `pending -> processing -> completed | error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalyzerStatus {
    Pending,
    Processing,
    Completed,
    Error,
}

impl AnalyzerStatus {
    fn rank(self) -> u8 {
        match self {
            AnalyzerStatus::Pending => 0,
            AnalyzerStatus::Processing => 1,
            AnalyzerStatus::Completed | AnalyzerStatus::Error => 2,
        }
    }

    /// Whether moving from `self` to `next` is a legal forward transition.
    #[must_use]
    pub fn can_advance_to(self, next: AnalyzerStatus) -> bool {
        next.rank() > self.rank()
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, AnalyzerStatus::Completed | AnalyzerStatus::Error)
    }
}

/// Token usage tracking for LLM calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl TokenUsage {
    #[must_use]
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    pub fn add_assign(&mut self, other: TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// An insight extracted from an analyzer response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Insight {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_analyzer: Option<String>,
}

/// A concept or entity identified in an analyzer response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Concept {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub related_concepts: Vec<String>,
    #[serde(default = "default_occurrences")]
    pub occurrences: u32,
}

fn default_occurrences() -> u32 {
    1
}

/// Result record for a single analyzer within a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerRecord {
    pub analyzer: String,
    pub status: AnalyzerStatus,
    /// Wall-clock seconds spent on this analyzer.
    #[serde(default)]
    pub processing_time: f64,
    #[serde(default)]
    pub token_usage: TokenUsage,
    #[serde(default)]
    pub raw_output: String,
    #[serde(default)]
    pub structured_data: Value,
    #[serde(default)]
    pub insights: Vec<Insight>,
    #[serde(default)]
    pub concepts: Vec<Concept>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_used: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_path: Option<String>,
}

impl AnalyzerRecord {
    #[must_use]
    pub fn pending(analyzer: impl Into<String>) -> Self {
        Self {
            analyzer: analyzer.into(),
            status: AnalyzerStatus::Pending,
            processing_time: 0.0,
            token_usage: TokenUsage::default(),
            raw_output: String::new(),
            structured_data: Value::Null,
            insights: Vec::new(),
            concepts: Vec::new(),
            model_used: None,
            error_message: None,
            prompt_path: None,
        }
    }

    #[must_use]
    pub fn error(analyzer: impl Into<String>, message: impl Into<String>) -> Self {
        let mut record = Self::pending(analyzer);
        record.status = AnalyzerStatus::Error;
        record.error_message = Some(message.into());
        record
    }

    /// Canonical context section for this analyzer: heading, raw output, top
    /// insights, top concepts. This is the unit the fair-share combiner
    /// budgets over.
    #[must_use]
    pub fn to_context_string(&self) -> String {
        let mut lines = vec![format!("## {} Analysis\n", self.analyzer)];

        if !self.raw_output.is_empty() {
            lines.push(self.raw_output.clone());
        }

        if !self.insights.is_empty() {
            lines.push("\n### Key Insights:".to_string());
            for insight in self.insights.iter().take(5) {
                lines.push(format!("- {}", insight.text));
            }
        }

        if !self.concepts.is_empty() {
            lines.push("\n### Identified Concepts:".to_string());
            let names: Vec<&str> = self
                .concepts
                .iter()
                .take(10)
                .map(|c| c.name.as_str())
                .collect();
            lines.push(names.join(", "));
        }

        lines.join("\n")
    }
}

/// Durable job document, keyed by `job:<job_id>` in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    #[serde(rename = "jobId")]
    pub job_id: String,
    pub status: JobStatus,
    #[serde(rename = "stageA", default)]
    pub stage_a: BTreeMap<String, AnalyzerRecord>,
    #[serde(rename = "stageB", default)]
    pub stage_b: BTreeMap<String, AnalyzerRecord>,
    #[serde(rename = "final", default)]
    pub final_stage: BTreeMap<String, AnalyzerRecord>,
    #[serde(rename = "tokenUsageTotal", default)]
    pub token_usage_total: TokenUsage,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(rename = "startedAt", skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(rename = "completedAt", skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(rename = "totalProcessingTimeMs", skip_serializing_if = "Option::is_none")]
    pub total_processing_time_ms: Option<u64>,
}

impl Job {
    #[must_use]
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            status: JobStatus::Queued,
            stage_a: BTreeMap::new(),
            stage_b: BTreeMap::new(),
            final_stage: BTreeMap::new(),
            token_usage_total: TokenUsage::default(),
            errors: Vec::new(),
            started_at: None,
            completed_at: None,
            total_processing_time_ms: None,
        }
    }

    #[must_use]
    pub fn stage_map(&self, stage: Stage) -> &BTreeMap<String, AnalyzerRecord> {
        match stage {
            Stage::A => &self.stage_a,
            Stage::B => &self.stage_b,
            Stage::Final => &self.final_stage,
        }
    }

    pub fn stage_map_mut(&mut self, stage: Stage) -> &mut BTreeMap<String, AnalyzerRecord> {
        match stage {
            Stage::A => &mut self.stage_a,
            Stage::B => &mut self.stage_b,
            Stage::Final => &mut self.final_stage,
        }
    }

    /// Move an analyzer to `processing`. Regressions are ignored.
    pub fn mark_analyzer_processing(&mut self, stage: Stage, slug: &str) {
        let entry = self
            .stage_map_mut(stage)
            .entry(slug.to_string())
            .or_insert_with(|| AnalyzerRecord::pending(slug));
        if entry.status.can_advance_to(AnalyzerStatus::Processing) {
            entry.status = AnalyzerStatus::Processing;
        }
    }

    /// Write a terminal analyzer record and fold its token usage into the job
    /// total in the same mutation, so the sum invariant holds at every
    /// observable snapshot. Regressions are ignored.
    pub fn record_analyzer_result(&mut self, stage: Stage, slug: &str, record: AnalyzerRecord) {
        let map = self.stage_map_mut(stage);
        let current = map
            .get(slug)
            .map_or(AnalyzerStatus::Pending, |existing| existing.status);
        if !current.can_advance_to(record.status) {
            return;
        }
        let usage = record.token_usage;
        map.insert(slug.to_string(), record);
        self.token_usage_total.add_assign(usage);
    }
}

/// Transcript inclusion mode for Stage B / Final options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptMode {
    #[default]
    Full,
    Summary,
}

/// Per-stage transcript inclusion options.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TranscriptOptions {
    #[serde(default)]
    pub include_transcript: bool,
    #[serde(default)]
    pub mode: TranscriptMode,
    #[serde(default)]
    pub max_chars: Option<usize>,
}

/// Per-stage model overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelOverrides {
    #[serde(default, rename = "A", alias = "stageA")]
    pub stage_a: Option<String>,
    #[serde(default, rename = "B", alias = "stageB")]
    pub stage_b: Option<String>,
    #[serde(default, rename = "Final", alias = "final")]
    pub final_stage: Option<String>,
}

/// Analyzer subset per stage. `None` means "use the built-in default list";
/// an explicit empty list means "run nothing in this stage".
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Selection {
    #[serde(default, rename = "A", alias = "stageA")]
    pub stage_a: Option<Vec<String>>,
    #[serde(default, rename = "B", alias = "stageB")]
    pub stage_b: Option<Vec<String>>,
    #[serde(default, rename = "Final", alias = "final")]
    pub final_stage: Option<Vec<String>>,
}

/// Prompt template overrides keyed by stage then slug. Paths must resolve
/// under the prompts root.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PromptOverrides {
    #[serde(default, rename = "A", alias = "stageA")]
    pub stage_a: HashMap<String, String>,
    #[serde(default, rename = "B", alias = "stageB")]
    pub stage_b: HashMap<String, String>,
    #[serde(default, rename = "Final", alias = "final")]
    pub final_stage: HashMap<String, String>,
}

impl PromptOverrides {
    #[must_use]
    pub fn for_stage(&self, stage: Stage) -> &HashMap<String, String> {
        match stage {
            Stage::A => &self.stage_a,
            Stage::B => &self.stage_b,
            Stage::Final => &self.final_stage,
        }
    }
}

/// Job-level execution options.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnalysisOptions {
    #[serde(default)]
    pub models: ModelOverrides,
    #[serde(default)]
    pub stage_b: TranscriptOptions,
    #[serde(default, rename = "final")]
    pub final_stage: TranscriptOptions,
}

/// Submission payload accepted by the scheduler.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnalysisPayload {
    #[serde(default)]
    pub transcript_text: Option<String>,
    #[serde(default)]
    pub transcript_ref: Option<String>,
    #[serde(default)]
    pub selected: Selection,
    #[serde(default)]
    pub prompt_overrides: PromptOverrides,
    #[serde(default)]
    pub options: AnalysisOptions,
}

/// Acknowledgement returned by `submit`.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitReceipt {
    pub job_id: String,
    pub queued_at: DateTime<Utc>,
}
