//! Pipeline scheduler: Stage A -> Stage B -> Final with intra-stage fan-out
//! and strict inter-stage barriers.
//!
//! Each stage fans out analyzer tasks onto a shared worker pool bounded by a
//! semaphore (FIFO). Tasks are independent: one failure never cancels
//! siblings. Stage results are snapshotted in memory at each barrier and
//! passed by value to the next stage; the job store is an output, not a
//! coordination medium. Insight aggregation runs synchronously after the
//! Final barrier, then finalization writes `final_status.json` and the
//! `COMPLETED` sentinel.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::analyzers::AnalyzerRegistry;
use crate::clients::LlmClient;
use crate::config::Config;
use crate::context::summarizer::{Summarizer, SummaryOptions};
use crate::context::{
    capped_transcript, combined_context, context_sections, stage_a_transcript,
};
use crate::events::{EventBus, ProgressEvent};
use crate::insights::llm::{LlmInsightOptions, extract_insights_llm};
use crate::insights::{aggregator::aggregate_insights, count_items, dedupe_items, writer};
use crate::models::{
    AnalysisPayload, AnalyzerRecord, AnalyzerStatus, Job, JobStatus, Stage, SubmitReceipt,
    TranscriptMode, TranscriptOptions,
};
use crate::prompt::{PromptError, PromptTemplate, resolve_override};
use crate::store::{JobStore, StoreError};
use crate::transcript::Transcript;
use crate::util::retry::BackoffPolicy;

use super::artifacts::JobArtifacts;
use super::runner::{AnalyzerRunner, RunContext, StageInputs};

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("transcript text is required and must be non-empty")]
    EmptyTranscript,
    #[error("transcript reference could not be resolved: {0}")]
    BadTranscriptRef(String),
    #[error("unknown analyzer `{slug}` for {stage}")]
    UnknownAnalyzer { stage: Stage, slug: String },
    #[error(transparent)]
    Prompt(#[from] PromptError),
    #[error("failed to persist job")]
    Store(#[from] StoreError),
}

#[derive(Clone)]
struct PlannedAnalyzer {
    spec: crate::analyzers::AnalyzerSpec,
    model_override: Option<String>,
}

struct ExecutionPlan {
    transcript: Arc<Transcript>,
    stage_a: Vec<PlannedAnalyzer>,
    stage_b: Vec<PlannedAnalyzer>,
    final_stage: Vec<PlannedAnalyzer>,
    stage_b_options: TranscriptOptions,
    final_options: TranscriptOptions,
}

struct SchedulerInner {
    config: Arc<Config>,
    registry: AnalyzerRegistry,
    runner: AnalyzerRunner,
    store: Arc<dyn JobStore>,
    events: EventBus,
    worker_pool: Arc<Semaphore>,
    store_retry: BackoffPolicy,
}

/// Orchestrates jobs end-to-end. Cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    #[must_use]
    pub(crate) fn new(
        config: Arc<Config>,
        llm: Arc<LlmClient>,
        store: Arc<dyn JobStore>,
        events: EventBus,
    ) -> Self {
        let registry = AnalyzerRegistry::new(config.prompts_root());
        let runner = AnalyzerRunner::new(Arc::clone(&llm), Arc::clone(&config));
        let worker_pool = Arc::new(Semaphore::new(config.max_concurrent().max(1)));
        Self {
            inner: Arc::new(SchedulerInner {
                store_retry: BackoffPolicy::new(
                    3,
                    Duration::from_millis(100),
                    Duration::from_secs(2),
                ),
                registry,
                runner,
                store,
                events,
                worker_pool,
                config,
            }),
        }
    }

    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Validate a submission, persist the queued job, and spawn the run.
    pub async fn submit(&self, payload: AnalysisPayload) -> Result<SubmitReceipt, SubmitError> {
        let transcript_text = self.resolve_transcript_text(&payload)?;
        let transcript = Arc::new(Transcript::parse(&transcript_text, None));
        let plan = self.build_plan(transcript, &payload)?;

        let job_id = Uuid::new_v4().to_string();
        let mut job = Job::new(&job_id);
        for (stage, planned) in [
            (Stage::A, &plan.stage_a),
            (Stage::B, &plan.stage_b),
            (Stage::Final, &plan.final_stage),
        ] {
            for analyzer in planned {
                job.stage_map_mut(stage).insert(
                    analyzer.spec.slug.clone(),
                    AnalyzerRecord::pending(&analyzer.spec.slug),
                );
            }
        }
        self.inner.store.create(&job).await?;

        let queued_at = Utc::now();
        self.inner.events.publish(ProgressEvent::JobQueued {
            job_id: job_id.clone(),
            timestamp: queued_at,
        });

        info!(
            job_id = %job_id,
            stage_a = plan.stage_a.len(),
            stage_b = plan.stage_b.len(),
            final_stage = plan.final_stage.len(),
            "analysis job queued"
        );

        let scheduler = self.clone();
        let spawn_job_id = job_id.clone();
        tokio::spawn(async move {
            scheduler.run_job(&spawn_job_id, plan).await;
        });

        Ok(SubmitReceipt { job_id, queued_at })
    }

    fn resolve_transcript_text(&self, payload: &AnalysisPayload) -> Result<String, SubmitError> {
        if let Some(text) = payload.transcript_text.as_deref() {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                return Err(SubmitError::EmptyTranscript);
            }
            return Ok(trimmed.to_string());
        }

        let Some(reference) = payload.transcript_ref.as_deref() else {
            return Err(SubmitError::EmptyTranscript);
        };
        let root = self
            .inner
            .config
            .uploads_root()
            .canonicalize()
            .map_err(|_| SubmitError::BadTranscriptRef(reference.to_string()))?;
        let candidate = root
            .join(reference)
            .canonicalize()
            .map_err(|_| SubmitError::BadTranscriptRef(reference.to_string()))?;
        if !candidate.starts_with(&root) {
            return Err(SubmitError::BadTranscriptRef(reference.to_string()));
        }
        let text = std::fs::read_to_string(&candidate)
            .map_err(|_| SubmitError::BadTranscriptRef(reference.to_string()))?;
        if text.trim().is_empty() {
            return Err(SubmitError::EmptyTranscript);
        }
        Ok(text.trim().to_string())
    }

    fn build_plan(
        &self,
        transcript: Arc<Transcript>,
        payload: &AnalysisPayload,
    ) -> Result<ExecutionPlan, SubmitError> {
        let models = &payload.options.models;
        let stage_a = self.plan_stage(
            Stage::A,
            payload.selected.stage_a.as_deref(),
            payload,
            models.stage_a.clone(),
        )?;
        let stage_b = self.plan_stage(
            Stage::B,
            payload.selected.stage_b.as_deref(),
            payload,
            models.stage_b.clone(),
        )?;
        let final_stage = self.plan_stage(
            Stage::Final,
            payload.selected.final_stage.as_deref(),
            payload,
            models.final_stage.clone(),
        )?;

        Ok(ExecutionPlan {
            transcript,
            stage_a,
            stage_b,
            final_stage,
            stage_b_options: payload.options.stage_b.clone(),
            final_options: payload.options.final_stage.clone(),
        })
    }

    /// Resolve a stage selection to validated analyzer specs. `None` selects
    /// the built-in defaults; an explicit empty list selects nothing.
    fn plan_stage(
        &self,
        stage: Stage,
        selected: Option<&[String]>,
        payload: &AnalysisPayload,
        model_override: Option<String>,
    ) -> Result<Vec<PlannedAnalyzer>, SubmitError> {
        let slugs: Vec<String> = match selected {
            Some(slugs) => slugs.to_vec(),
            None => self.inner.registry.default_slugs(stage),
        };

        let overrides = payload.prompt_overrides.for_stage(stage);
        let mut planned = Vec::with_capacity(slugs.len());
        for slug in slugs {
            let mut spec = self
                .inner
                .registry
                .resolve(stage, &slug)
                .ok_or_else(|| SubmitError::UnknownAnalyzer {
                    stage,
                    slug: slug.clone(),
                })?;
            if let Some(override_path) = overrides.get(&slug) {
                spec.prompt_path =
                    resolve_override(self.inner.config.prompts_root(), override_path)?;
            }
            // Reject bad templates at submit time, before a job exists.
            let template = PromptTemplate::load(&spec.prompt_path)?;
            template.validate_for_stage(stage)?;

            planned.push(PlannedAnalyzer {
                spec,
                model_override: model_override.clone(),
            });
        }
        Ok(planned)
    }

    async fn run_job(&self, job_id: &str, plan: ExecutionPlan) {
        let started = Instant::now();
        let started_at = Utc::now();
        let artifacts = JobArtifacts::new(self.inner.config.output_root(), job_id);

        if let Err(e) = self
            .update_job(job_id, move |job| {
                job.status = JobStatus::Processing;
                job.started_at = Some(started_at);
            })
            .await
        {
            self.fail_job(job_id, &artifacts, &e.to_string(), started).await;
            return;
        }

        // Stage A
        let counter = self.inner.runner.llm().token_counter().clone();
        let stage_a_inputs = StageInputs {
            transcript: Some(stage_a_transcript(
                &counter,
                &plan.transcript,
                self.inner.config.chunk_size(),
            )),
            context: None,
        };
        let results_a = self
            .run_stage(job_id, Stage::A, &plan.stage_a, stage_a_inputs, &artifacts)
            .await;
        self.inner.events.publish(ProgressEvent::StageCompleted {
            job_id: job_id.to_string(),
            stage: Stage::A,
            timestamp: Utc::now(),
        });
        let snapshot_a: Vec<(String, AnalyzerRecord)> = results_a
            .into_iter()
            .filter(|(_, record)| record.status == AnalyzerStatus::Completed)
            .collect();

        // Stage B
        let results_b = if plan.stage_b.is_empty() {
            Vec::new()
        } else {
            let inputs = self
                .stage_b_inputs(job_id, &plan, &snapshot_a, &artifacts)
                .await;
            self.run_stage(job_id, Stage::B, &plan.stage_b, inputs, &artifacts)
                .await
        };
        self.inner.events.publish(ProgressEvent::StageCompleted {
            job_id: job_id.to_string(),
            stage: Stage::B,
            timestamp: Utc::now(),
        });
        let snapshot_b: Vec<(String, AnalyzerRecord)> = results_b
            .into_iter()
            .filter(|(_, record)| record.status == AnalyzerStatus::Completed)
            .collect();

        let mut combined = snapshot_a;
        combined.extend(snapshot_b);

        // Final
        let results_final = if plan.final_stage.is_empty() {
            Vec::new()
        } else {
            let inputs = self
                .final_inputs(job_id, &plan, &combined, &artifacts, &counter)
                .await;
            let results = self
                .run_stage(job_id, Stage::Final, &plan.final_stage, inputs, &artifacts)
                .await;
            for (slug, record) in &results {
                if record.status == AnalyzerStatus::Completed {
                    let path = artifacts.final_dir().join(format!("{slug}.md"));
                    if let Err(e) = artifacts.write(&path, &record.raw_output).await {
                        warn!(job_id, analyzer = %slug, error = %e, "failed to write final output");
                    }
                }
            }
            results
        };
        self.inner.events.publish(ProgressEvent::StageCompleted {
            job_id: job_id.to_string(),
            stage: Stage::Final,
            timestamp: Utc::now(),
        });

        // Insight aggregation over the in-memory snapshots (never re-read
        // from the store).
        let mut all_results = combined.clone();
        all_results.extend(
            results_final
                .into_iter()
                .filter(|(_, record)| record.status == AnalyzerStatus::Completed),
        );
        self.aggregate_and_publish(job_id, &plan, &all_results, &artifacts)
            .await;

        // Finalization
        let completed_at = Utc::now();
        let total_ms = started.elapsed().as_millis() as u64;
        let final_job = self
            .update_job(job_id, move |job| {
                job.status = JobStatus::Completed;
                job.completed_at = Some(completed_at);
                job.total_processing_time_ms = Some(total_ms);
            })
            .await;

        let job = match final_job {
            Ok(job) => job,
            Err(e) => {
                self.fail_job(job_id, &artifacts, &e.to_string(), started).await;
                return;
            }
        };

        if let Err(e) = self
            .write_final_status(&artifacts, &job, started_at, completed_at, total_ms, None)
            .await
        {
            warn!(job_id, error = %e, "failed to write final status");
        }
        if let Err(e) = artifacts.write_completed_sentinel().await {
            warn!(job_id, error = %e, "failed to write completion sentinel");
        }

        self.inner.events.publish(ProgressEvent::JobCompleted {
            job_id: job_id.to_string(),
            total_processing_time_ms: total_ms,
            total_token_usage: job.token_usage_total,
            timestamp: Utc::now(),
        });

        info!(
            job_id,
            total_ms,
            total_tokens = job.token_usage_total.total_tokens,
            "pipeline completed"
        );
    }

    /// Fan a stage's analyzers onto the worker pool and gather terminal
    /// records in selection order.
    async fn run_stage(
        &self,
        job_id: &str,
        stage: Stage,
        planned: &[PlannedAnalyzer],
        inputs: StageInputs,
        artifacts: &JobArtifacts,
    ) -> Vec<(String, AnalyzerRecord)> {
        let inputs = Arc::new(inputs);
        let mut join_set = JoinSet::new();

        for (idx, analyzer) in planned.iter().enumerate() {
            let scheduler = self.clone();
            let analyzer = analyzer.clone();
            let inputs = Arc::clone(&inputs);
            let job_id = job_id.to_string();
            let artifacts = artifacts.clone();
            join_set.spawn(async move {
                let _permit = scheduler
                    .inner
                    .worker_pool
                    .clone()
                    .acquire_owned()
                    .await
                    .expect("worker pool closed");
                let slug = analyzer.spec.slug.clone();
                let record = scheduler
                    .run_analyzer_task(&job_id, stage, &analyzer, &inputs, &artifacts)
                    .await;
                (idx, slug, record)
            });
        }

        let mut indexed = Vec::with_capacity(planned.len());
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(result) => indexed.push(result),
                Err(e) => {
                    error!(job_id, stage = %stage, error = %e, "analyzer task aborted");
                }
            }
        }
        indexed.sort_by_key(|(idx, _, _)| *idx);
        indexed
            .into_iter()
            .map(|(_, slug, record)| (slug, record))
            .collect()
    }

    async fn run_analyzer_task(
        &self,
        job_id: &str,
        stage: Stage,
        analyzer: &PlannedAnalyzer,
        inputs: &StageInputs,
        artifacts: &JobArtifacts,
    ) -> AnalyzerRecord {
        let slug = analyzer.spec.slug.clone();
        self.inner.events.publish(ProgressEvent::AnalyzerStarted {
            job_id: job_id.to_string(),
            stage,
            analyzer: slug.clone(),
            timestamp: Utc::now(),
        });

        let mark_slug = slug.clone();
        if let Err(e) = self
            .update_job(job_id, move |job| {
                job.mark_analyzer_processing(stage, &mark_slug);
            })
            .await
        {
            warn!(job_id, analyzer = %slug, error = %e, "failed to mark analyzer processing");
        }

        let started = Instant::now();
        let run = self.inner.runner.run(
            &analyzer.spec,
            RunContext {
                job_id,
                inputs,
                model_override: analyzer.model_override.as_deref(),
                artifacts,
            },
        );
        let mut record =
            match tokio::time::timeout(self.inner.config.analyzer_timeout(), run).await {
                Ok(record) => record,
                Err(_) => {
                    let seconds = self.inner.config.analyzer_timeout().as_secs();
                    let mut record = AnalyzerRecord::error(
                        &slug,
                        format!("timeout: analyzer exceeded the {seconds}s soft deadline"),
                    );
                    record.processing_time = started.elapsed().as_secs_f64();
                    record
                }
            };
        record.status = match record.status {
            AnalyzerStatus::Completed => AnalyzerStatus::Completed,
            _ => AnalyzerStatus::Error,
        };

        // Persist the terminal record and fold token usage into the job total
        // in one atomic mutation.
        let store_slug = slug.clone();
        let store_record = record.clone();
        if let Err(e) = self
            .update_job(job_id, move |job| {
                job.record_analyzer_result(stage, &store_slug, store_record.clone());
            })
            .await
        {
            warn!(job_id, analyzer = %slug, error = %e, "failed to persist analyzer record");
        }

        let processing_time_ms = (record.processing_time * 1000.0) as u64;
        match record.status {
            AnalyzerStatus::Completed => {
                self.inner.events.publish(ProgressEvent::AnalyzerCompleted {
                    job_id: job_id.to_string(),
                    stage,
                    analyzer: slug,
                    processing_time_ms,
                    token_usage: record.token_usage,
                    timestamp: Utc::now(),
                });
            }
            _ => {
                self.inner.events.publish(ProgressEvent::AnalyzerError {
                    job_id: job_id.to_string(),
                    stage,
                    analyzer: slug,
                    error_message: record
                        .error_message
                        .clone()
                        .unwrap_or_else(|| "analyzer error".to_string()),
                    processing_time_ms: Some(processing_time_ms),
                    timestamp: Utc::now(),
                });
            }
        }

        record
    }

    /// Build Stage B inputs: the fair-share combined context plus optional
    /// transcript (full or summarized).
    async fn stage_b_inputs(
        &self,
        job_id: &str,
        plan: &ExecutionPlan,
        snapshot_a: &[(String, AnalyzerRecord)],
        artifacts: &JobArtifacts,
    ) -> StageInputs {
        let counter = self.inner.runner.llm().token_counter();
        let sections = context_sections(snapshot_a);
        let (context_text, report) = crate::context::combiner::build_fair_combined_context(
            &sections,
            counter,
            self.inner.config.stage_b_context_token_budget(),
            self.inner.config.stage_b_min_tokens_per_analyzer(),
        );

        info!(
            job_id,
            sections = sections.len(),
            final_tokens = report.final_tokens,
            budget = report.budget,
            allocations = ?report.allocations,
            "stage B context assembled"
        );

        if let Err(e) = artifacts
            .write(&artifacts.stage_b_context_path(), &context_text)
            .await
        {
            warn!(job_id, error = %e, "failed to persist stage B context");
        }

        let transcript = self
            .optional_transcript(job_id, plan, &plan.stage_b_options, Stage::B, artifacts)
            .await;

        StageInputs {
            transcript,
            context: Some(context_text),
        }
    }

    /// Build Final inputs: combined A+B context (optionally budget-trimmed)
    /// plus optional transcript.
    async fn final_inputs(
        &self,
        job_id: &str,
        plan: &ExecutionPlan,
        combined: &[(String, AnalyzerRecord)],
        artifacts: &JobArtifacts,
        counter: &crate::clients::TokenCounter,
    ) -> StageInputs {
        let context_text = combined_context(
            counter,
            combined,
            self.inner.config.final_context_token_budget(),
        );

        if let Err(e) = artifacts
            .write(
                &artifacts.final_dir().join("context_combined.txt"),
                &context_text,
            )
            .await
        {
            warn!(job_id, error = %e, "failed to persist final context");
        }

        let transcript = self
            .optional_transcript(job_id, plan, &plan.final_options, Stage::Final, artifacts)
            .await;

        StageInputs {
            transcript,
            context: Some(context_text),
        }
    }

    async fn optional_transcript(
        &self,
        job_id: &str,
        plan: &ExecutionPlan,
        options: &TranscriptOptions,
        stage: Stage,
        artifacts: &JobArtifacts,
    ) -> Option<String> {
        if !options.include_transcript {
            return None;
        }

        match options.mode {
            TranscriptMode::Summary if self.inner.config.summary_enabled() => {
                let target = match stage {
                    Stage::Final => self.inner.config.summary_final_target_tokens(),
                    _ => self.inner.config.summary_stage_b_target_tokens(),
                };
                let summary_options = SummaryOptions {
                    target_tokens: target,
                    map_chunk_tokens: self.inner.config.summary_map_chunk_tokens(),
                    map_overlap_tokens: self.inner.config.summary_map_overlap_tokens(),
                    single_pass_max_tokens: self.inner.config.summary_single_pass_max_tokens(),
                    map_model: self.inner.config.summary_map_model().map(ToString::to_string),
                    reduce_model: self
                        .inner
                        .config
                        .summary_reduce_model()
                        .map(ToString::to_string),
                };
                let summarizer = Summarizer::new(self.inner.runner.llm());
                let (summary, summary_debug) = summarizer
                    .summarize(
                        &plan.transcript.text_for_analysis(),
                        stage,
                        &summary_options,
                        Some(&artifacts.summaries_dir()),
                    )
                    .await;
                info!(
                    job_id,
                    stage = %stage,
                    mode = ?summary_debug.mode,
                    chunks = summary_debug.chunks,
                    "transcript summarized for inclusion"
                );
                Some(summary)
            }
            _ => {
                let max_chars = options.max_chars.unwrap_or_else(|| match stage {
                    Stage::Final => self.inner.config.final_transcript_char_limit(),
                    _ => 20_000,
                });
                Some(capped_transcript(&plan.transcript, max_chars))
            }
        }
    }

    async fn aggregate_and_publish(
        &self,
        job_id: &str,
        plan: &ExecutionPlan,
        all_results: &[(String, AnalyzerRecord)],
        artifacts: &JobArtifacts,
    ) {
        let generated_at = Utc::now();
        let (mut items, mut counts) =
            aggregate_insights(all_results, Some(&plan.transcript), generated_at);

        if self.inner.config.insights_llm_enabled() {
            let counter = self.inner.runner.llm().token_counter();
            let segmented = plan.transcript.segmented_view();
            let combined = combined_context(counter, all_results, 0);
            let options = LlmInsightOptions {
                max_items: self.inner.config.insights_llm_max_items(),
                max_tokens: self.inner.config.insights_llm_max_tokens(),
                model: self.inner.config.insights_llm_model().map(ToString::to_string),
            };
            let (llm_items, raw) = extract_insights_llm(
                self.inner.runner.llm(),
                &segmented,
                &combined,
                &options,
                generated_at,
            )
            .await;

            if let Ok(raw_json) = serde_json::to_string_pretty(&raw) {
                if let Err(e) = artifacts
                    .write(&artifacts.final_dir().join("insight_llm.json"), &raw_json)
                    .await
                {
                    warn!(job_id, error = %e, "failed to persist LLM insight payload");
                }
            }

            if !llm_items.is_empty() {
                items.extend(llm_items);
                items = dedupe_items(items);
                counts = count_items(&items);
            }
        }

        let final_dir = artifacts.final_dir();
        let json_written = match writer::to_json(&items, generated_at) {
            Ok(body) => {
                let result = artifacts
                    .write(&final_dir.join("insight_dashboard.json"), &body)
                    .await;
                if let Err(e) = &result {
                    warn!(job_id, error = %e, "failed to write insight dashboard json");
                }
                result.is_ok()
            }
            Err(e) => {
                warn!(job_id, error = %e, "failed to render insight dashboard json");
                false
            }
        };

        let markdown = writer::to_markdown(&items, &counts);
        if let Err(e) = artifacts
            .write(&final_dir.join("insight_dashboard.md"), &markdown)
            .await
        {
            warn!(job_id, error = %e, "failed to write insight dashboard markdown");
        }

        match writer::to_csv(&items) {
            Ok(body) => {
                if let Err(e) = artifacts
                    .write(&final_dir.join("insight_dashboard.csv"), &body)
                    .await
                {
                    warn!(job_id, error = %e, "failed to write insight dashboard csv");
                }
            }
            Err(e) => warn!(job_id, error = %e, "failed to render insight dashboard csv"),
        }

        if json_written {
            let items_value = serde_json::to_value(&items).unwrap_or_default();
            let counts_value = serde_json::to_value(counts).unwrap_or_default();
            self.inner.events.publish(ProgressEvent::InsightsUpdated {
                job_id: job_id.to_string(),
                counts: counts_value,
                items: items_value,
                timestamp: Utc::now(),
            });
        }
    }

    async fn write_final_status(
        &self,
        artifacts: &JobArtifacts,
        job: &Job,
        started_at: chrono::DateTime<Utc>,
        completed_at: chrono::DateTime<Utc>,
        total_ms: u64,
        error_message: Option<&str>,
    ) -> anyhow::Result<()> {
        let stage_tokens = |records: &std::collections::BTreeMap<String, AnalyzerRecord>| {
            records
                .values()
                .map(|r| r.token_usage.total_tokens)
                .sum::<u64>()
        };

        let status = serde_json::json!({
            "run_id": job.job_id,
            "status": if error_message.is_some() { "error" } else { "completed" },
            "output_dir": artifacts.root().display().to_string(),
            "stage_a": {
                "analyzers": job.stage_a.keys().collect::<Vec<_>>(),
                "tokens": stage_tokens(&job.stage_a),
            },
            "stage_b": {
                "analyzers": job.stage_b.keys().collect::<Vec<_>>(),
                "tokens": stage_tokens(&job.stage_b),
            },
            "total_tokens": job.token_usage_total.total_tokens,
            "wall_clock_seconds": total_ms as f64 / 1000.0,
            "timestamps": {
                "start_time": started_at,
                "end_time": completed_at,
            },
            "error": error_message,
        });

        artifacts
            .write(
                &artifacts.final_status_path(),
                &serde_json::to_string_pretty(&status)?,
            )
            .await
    }

    async fn fail_job(
        &self,
        job_id: &str,
        artifacts: &JobArtifacts,
        message: &str,
        started: Instant,
    ) {
        error!(job_id, message, "pipeline failed");

        let completed_at = Utc::now();
        let total_ms = started.elapsed().as_millis() as u64;
        let error_text = message.to_string();
        let stored = self
            .update_job(job_id, move |job| {
                job.status = JobStatus::Error;
                job.completed_at = Some(completed_at);
                job.total_processing_time_ms = Some(total_ms);
                job.errors.push(error_text.clone());
            })
            .await;

        let job = match stored {
            Ok(job) => job,
            // The store itself is failing; synthesize a snapshot so the
            // diagnostic file still gets written.
            Err(_) => {
                let mut job = Job::new(job_id);
                job.status = JobStatus::Error;
                job
            }
        };

        let started_at = job.started_at.unwrap_or(completed_at);
        if let Err(e) = self
            .write_final_status(artifacts, &job, started_at, completed_at, total_ms, Some(message))
            .await
        {
            warn!(job_id, error = %e, "failed to write error status file");
        }

        self.inner.events.publish(ProgressEvent::JobError {
            job_id: job_id.to_string(),
            error_code: "PIPELINE_ERROR".to_string(),
            message: message.to_string(),
            timestamp: Utc::now(),
        });
    }

    /// Store writes retried with bounded backoff; only backend errors retry.
    async fn update_job(
        &self,
        job_id: &str,
        mutate: impl Fn(&mut Job) + Send + Sync + 'static,
    ) -> Result<Job, StoreError> {
        let mut failures = 0usize;
        loop {
            match self.inner.store.update(job_id, &mutate).await {
                Ok(job) => return Ok(job),
                Err(StoreError::Backend(e)) => {
                    failures += 1;
                    let Some(delay) = self.inner.store_retry.next_delay(failures) else {
                        return Err(StoreError::Backend(e));
                    };
                    warn!(job_id, failures, error = %e, "store update failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
