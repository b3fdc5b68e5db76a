//! Map-reduce transcript summarizer.
//!
//! Short inputs are summarized in a single pass; longer inputs are chunked
//! with overlap, each chunk summarized independently, then consolidated by a
//! single reduce call. All calls run at temperature 0 so the in-run
//! completion cache keeps repeat runs stable. On any LLM failure the leading
//! slice of the input is returned instead of an error.

use std::path::Path;

use tracing::{debug, warn};

use crate::clients::{CompletionRequest, LlmClient};
use crate::models::Stage;
use crate::util::text::{slice_chars, take_chars};

/// Summarization tuning knobs, resolved from config per stage.
#[derive(Debug, Clone)]
pub(crate) struct SummaryOptions {
    pub(crate) target_tokens: usize,
    pub(crate) map_chunk_tokens: usize,
    pub(crate) map_overlap_tokens: usize,
    pub(crate) single_pass_max_tokens: usize,
    pub(crate) map_model: Option<String>,
    pub(crate) reduce_model: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SummaryMode {
    SinglePass,
    MapReduce,
    Fallback,
}

/// Debug record for instrumentation and artifacts.
#[derive(Debug, Clone)]
pub(crate) struct SummaryDebug {
    pub(crate) mode: SummaryMode,
    pub(crate) total_tokens: usize,
    pub(crate) chunks: usize,
}

pub(crate) struct Summarizer<'a> {
    llm: &'a LlmClient,
}

impl<'a> Summarizer<'a> {
    pub(crate) fn new(llm: &'a LlmClient) -> Self {
        Self { llm }
    }

    /// Summarize `text` toward `target_tokens`, persisting intermediate
    /// artifacts under `artifacts_dir` when provided.
    pub(crate) async fn summarize(
        &self,
        text: &str,
        stage: Stage,
        options: &SummaryOptions,
        artifacts_dir: Option<&Path>,
    ) -> (String, SummaryDebug) {
        let counter = self.llm.token_counter();
        let total_tokens = counter.count(text);

        match self
            .summarize_inner(text, stage, options, artifacts_dir, total_tokens)
            .await
        {
            Ok(done) => done,
            Err(error) => {
                warn!(stage = %stage, error = %error, "summarization failed, falling back to head slice");
                let approx_chars = (options.target_tokens * 4).max(500);
                let summary = take_chars(text, approx_chars).to_string();
                if let Some(dir) = artifacts_dir {
                    let path = dir.join(format!("summary.{stage}.fallback.md"));
                    let _ = tokio::fs::write(&path, &summary).await;
                }
                (
                    summary,
                    SummaryDebug {
                        mode: SummaryMode::Fallback,
                        total_tokens,
                        chunks: 0,
                    },
                )
            }
        }
    }

    async fn summarize_inner(
        &self,
        text: &str,
        stage: Stage,
        options: &SummaryOptions,
        artifacts_dir: Option<&Path>,
        total_tokens: usize,
    ) -> anyhow::Result<(String, SummaryDebug)> {
        if let Some(dir) = artifacts_dir {
            tokio::fs::create_dir_all(dir).await.ok();
        }

        if total_tokens <= options.single_pass_max_tokens.max(1) {
            let prompt = map_prompt(text, options.target_tokens);
            let (response, _) = self
                .llm
                .complete(&CompletionRequest {
                    prompt,
                    temperature: Some(0.0),
                    max_tokens: Some(((options.target_tokens + 200).max(512)) as u32),
                    model: options.map_model.clone(),
                    ..CompletionRequest::default()
                })
                .await?;
            let summary = response.trim().to_string();
            if let Some(dir) = artifacts_dir {
                let path = dir.join(format!("summary.{stage}.single.md"));
                let _ = tokio::fs::write(&path, &summary).await;
            }
            return Ok((
                summary,
                SummaryDebug {
                    mode: SummaryMode::SinglePass,
                    total_tokens,
                    chunks: 0,
                },
            ));
        }

        // Map phase
        let chunks = chunk_text_by_tokens(
            text,
            total_tokens,
            options.map_chunk_tokens,
            options.map_overlap_tokens,
        );
        debug!(stage = %stage, chunks = chunks.len(), total_tokens, "map-reduce summarization");
        let mut chunk_summaries = Vec::with_capacity(chunks.len());
        for (idx, chunk) in chunks.iter().enumerate() {
            let prompt = map_prompt(chunk, (options.target_tokens / 2).max(200));
            let (response, _) = self
                .llm
                .complete(&CompletionRequest {
                    prompt,
                    temperature: Some(0.0),
                    max_tokens: Some(512),
                    model: options.map_model.clone(),
                    ..CompletionRequest::default()
                })
                .await?;
            let chunk_summary = response.trim().to_string();
            if let Some(dir) = artifacts_dir {
                let path = dir.join(format!("chunk_{:03}.md", idx + 1));
                let _ = tokio::fs::write(&path, &chunk_summary).await;
            }
            chunk_summaries.push(chunk_summary);
        }

        // Keep the reduce input reasonable (~3x target).
        let counter = self.llm.token_counter();
        let mut merged = chunk_summaries.join("\n\n---\n");
        let max_reduce_input = (options.target_tokens * 3).max(1200);
        let merged_tokens = counter.count(&merged);
        if merged_tokens > max_reduce_input {
            merged = counter.trim_to_tokens(&merged, max_reduce_input);
        }

        // Reduce phase
        let prompt = reduce_prompt(&merged, options.target_tokens);
        let (response, _) = self
            .llm
            .complete(&CompletionRequest {
                prompt,
                temperature: Some(0.0),
                max_tokens: Some(((options.target_tokens + 300).max(768)) as u32),
                model: options.reduce_model.clone(),
                ..CompletionRequest::default()
            })
            .await?;
        let summary = response.trim().to_string();
        if let Some(dir) = artifacts_dir {
            let path = dir.join(format!("summary.{stage}.reduce.md"));
            let _ = tokio::fs::write(&path, &summary).await;
        }

        Ok((
            summary,
            SummaryDebug {
                mode: SummaryMode::MapReduce,
                total_tokens,
                chunks: chunks.len(),
            },
        ))
    }
}

fn map_prompt(chunk: &str, target_tokens: usize) -> String {
    format!(
        "You are summarizing a transcript chunk for downstream analysis.\n\
         Write a concise, faithful summary with clear headings and bullets.\n\
         Focus on: key points, decisions, action items, issues/risks, perspectives, and notable facts.\n\
         Aim for <= {} tokens. Avoid speculation or repetition.\n\n# Chunk\n{chunk}",
        target_tokens.max(200)
    )
}

fn reduce_prompt(merged_summaries: &str, target_tokens: usize) -> String {
    format!(
        "You are consolidating multiple transcript chunk summaries into a single, non-redundant global summary.\n\
         Keep it faithful, compact, and organized with headings and bullets.\n\
         Prioritize unique insights, decisions, and actionables; include brief risks/gaps/assumptions.\n\
         Fit within ~{} tokens.\n\n# Chunk Summaries\n{merged_summaries}",
        target_tokens.max(400)
    )
}

/// Split text into approximately token-sized chunks with overlap, using the
/// 4-chars-per-token approximation for slicing.
pub(crate) fn chunk_text_by_tokens(
    text: &str,
    total_tokens: usize,
    chunk_tokens: usize,
    overlap_tokens: usize,
) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    if total_tokens <= chunk_tokens {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;
    while start < total_tokens {
        let end = (start + chunk_tokens).min(total_tokens);
        let chunk = slice_chars(text, start * 4, end * 4);
        if !chunk.is_empty() {
            chunks.push(chunk.to_string());
        }
        if end >= total_tokens {
            break;
        }
        start = end.saturating_sub(overlap_tokens);
    }
    chunks
}
