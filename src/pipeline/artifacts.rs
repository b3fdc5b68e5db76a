//! Per-job artifact directory.
//!
//! Layout:
//! ```text
//! <output_root>/<job_id>/
//!   intermediate/stage_a/<slug>.json|.md
//!   intermediate/stage_b/<slug>.json|.md
//!   intermediate/stage_b_context.txt
//!   intermediate/summaries/...
//!   final/<slug>.md
//!   final/context_combined.txt
//!   final/insight_dashboard.json|.md|.csv
//!   final_status.json
//!   COMPLETED
//! ```
//! Writes are atomic: content lands in a sibling temp file first and is then
//! renamed into place.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::models::Stage;

#[derive(Debug, Clone)]
pub(crate) struct JobArtifacts {
    root: PathBuf,
}

impl JobArtifacts {
    pub(crate) fn new(output_root: &Path, job_id: &str) -> Self {
        Self {
            root: output_root.join(job_id),
        }
    }

    pub(crate) fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn intermediate_dir(&self, stage: Stage) -> PathBuf {
        self.root.join("intermediate").join(stage.as_str())
    }

    pub(crate) fn summaries_dir(&self) -> PathBuf {
        self.root.join("intermediate").join("summaries")
    }

    pub(crate) fn final_dir(&self) -> PathBuf {
        self.root.join("final")
    }

    pub(crate) fn stage_b_context_path(&self) -> PathBuf {
        self.root.join("intermediate").join("stage_b_context.txt")
    }

    /// Write a file atomically, creating parent directories as needed.
    pub(crate) async fn write(&self, path: &Path, content: &str) -> Result<()> {
        write_atomic(path, content.as_bytes()).await
    }

    /// Zero-byte marker: presence means the job directory holds a complete,
    /// successful run.
    pub(crate) async fn write_completed_sentinel(&self) -> Result<()> {
        write_atomic(&self.root.join("COMPLETED"), b"").await
    }

    pub(crate) fn final_status_path(&self) -> PathBuf {
        self.root.join("final_status.json")
    }
}

pub(crate) async fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .context("artifact path must have a parent directory")?;
    tokio::fs::create_dir_all(parent)
        .await
        .with_context(|| format!("failed to create {}", parent.display()))?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .context("artifact path must have a file name")?;
    let tmp = parent.join(format!(".{file_name}.tmp"));
    tokio::fs::write(&tmp, content)
        .await
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("failed to move {} into place", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_are_atomic_and_create_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let artifacts = JobArtifacts::new(dir.path(), "job-1");

        let path = artifacts.intermediate_dir(Stage::A).join("say_means.md");
        artifacts.write(&path, "# output").await.expect("write");

        let content = tokio::fs::read_to_string(&path).await.expect("read back");
        assert_eq!(content, "# output");
        // No temp file left behind.
        let mut entries = tokio::fs::read_dir(path.parent().unwrap()).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec!["say_means.md"]);
    }

    #[tokio::test]
    async fn sentinel_is_zero_bytes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let artifacts = JobArtifacts::new(dir.path(), "job-2");
        artifacts
            .write_completed_sentinel()
            .await
            .expect("sentinel");

        let metadata = tokio::fs::metadata(artifacts.root().join("COMPLETED"))
            .await
            .expect("sentinel exists");
        assert_eq!(metadata.len(), 0);
    }
}
