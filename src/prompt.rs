//! Prompt template loading, validation and rendering.
//!
//! Templates are plain markdown files with `{{ transcript }}` /
//! `{{ context }}` / `{{ metadata }}` variables. Stage A templates must
//! reference `transcript`; Stage B and Final templates must reference
//! `context`. Override paths are only accepted under the prompts root.

use std::path::{Path, PathBuf};

use minijinja::{Environment, context};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use crate::models::Stage;

static TRANSCRIPT_VAR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{-?\s*transcript\b").expect("transcript var regex"));
static CONTEXT_VAR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{-?\s*context\b").expect("context var regex"));

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("failed to read prompt template {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("prompt template {path} is missing the `{variable}` variable required for {stage}")]
    MissingVariable {
        path: PathBuf,
        variable: &'static str,
        stage: Stage,
    },
    #[error("prompt override path is not allowed: {0}")]
    UnsafePath(String),
    #[error("failed to render prompt template {path}: {source}")]
    Render {
        path: PathBuf,
        #[source]
        source: minijinja::Error,
    },
}

/// Variables bound into a template render.
#[derive(Debug, Clone, Default)]
pub(crate) struct TemplateVars {
    pub(crate) transcript: Option<String>,
    pub(crate) context: Option<String>,
    pub(crate) metadata: Value,
}

/// A loaded prompt template.
#[derive(Debug, Clone)]
pub(crate) struct PromptTemplate {
    path: PathBuf,
    source: String,
}

impl PromptTemplate {
    pub(crate) fn load(path: &Path) -> Result<Self, PromptError> {
        let source = std::fs::read_to_string(path).map_err(|source| PromptError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Check that the template references the variables its stage requires.
    pub(crate) fn validate_for_stage(&self, stage: Stage) -> Result<(), PromptError> {
        let (re, variable): (&Regex, &'static str) = match stage {
            Stage::A => (&TRANSCRIPT_VAR_RE, "transcript"),
            Stage::B | Stage::Final => (&CONTEXT_VAR_RE, "context"),
        };
        if re.is_match(&self.source) {
            Ok(())
        } else {
            Err(PromptError::MissingVariable {
                path: self.path.clone(),
                variable,
                stage,
            })
        }
    }

    pub(crate) fn render(&self, vars: &TemplateVars) -> Result<String, PromptError> {
        let env = Environment::new();
        env.render_str(
            &self.source,
            context! {
                transcript => vars.transcript.as_deref().unwrap_or(""),
                context => vars.context.as_deref().unwrap_or(""),
                metadata => vars.metadata,
            },
        )
        .map_err(|source| PromptError::Render {
            path: self.path.clone(),
            source,
        })
    }
}

/// Validate a prompt override path: must be a `.md` file that resolves under
/// the prompts root.
pub(crate) fn resolve_override(prompts_root: &Path, candidate: &str) -> Result<PathBuf, PromptError> {
    let path = Path::new(candidate);
    if path.extension().and_then(|e| e.to_str()) != Some("md") {
        return Err(PromptError::UnsafePath(candidate.to_string()));
    }

    let root = prompts_root
        .canonicalize()
        .map_err(|_| PromptError::UnsafePath(candidate.to_string()))?;
    let resolved = path
        .canonicalize()
        .map_err(|_| PromptError::UnsafePath(candidate.to_string()))?;
    if !resolved.starts_with(&root) {
        return Err(PromptError::UnsafePath(candidate.to_string()));
    }

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;

    fn write_template(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, body).expect("write template");
        path
    }

    #[test]
    fn renders_template_variables() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_template(
            dir.path(),
            "analyzer.md",
            "Analyze:\n{{ transcript }}\nwith {{ metadata.job_id }}",
        );

        let template = PromptTemplate::load(&path).expect("load");
        let rendered = template
            .render(&TemplateVars {
                transcript: Some("Alice: hello".to_string()),
                context: None,
                metadata: json!({"job_id": "j-1"}),
            })
            .expect("render");

        assert!(rendered.contains("Alice: hello"));
        assert!(rendered.contains("j-1"));
    }

    #[test]
    fn stage_a_requires_transcript_variable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ok = write_template(dir.path(), "ok.md", "Use {{ transcript }} here");
        let bad = write_template(dir.path(), "bad.md", "Use {{ context }} here");

        assert!(PromptTemplate::load(&ok)
            .unwrap()
            .validate_for_stage(Stage::A)
            .is_ok());
        let err = PromptTemplate::load(&bad)
            .unwrap()
            .validate_for_stage(Stage::A)
            .unwrap_err();
        assert!(matches!(err, PromptError::MissingVariable { .. }));
    }

    #[test]
    fn stage_b_and_final_require_context_variable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ok = write_template(dir.path(), "ok.md", "Combine {{ context }}");
        let template = PromptTemplate::load(&ok).unwrap();
        assert!(template.validate_for_stage(Stage::B).is_ok());
        assert!(template.validate_for_stage(Stage::Final).is_ok());

        let bad = write_template(dir.path(), "bad.md", "No variables at all");
        assert!(PromptTemplate::load(&bad)
            .unwrap()
            .validate_for_stage(Stage::Final)
            .is_err());
    }

    #[test]
    fn override_must_stay_under_prompts_root() {
        let root = tempfile::tempdir().expect("tempdir");
        let inside = write_template(root.path(), "custom.md", "{{ transcript }}");
        let outside_dir = tempfile::tempdir().expect("tempdir");
        let outside = write_template(outside_dir.path(), "evil.md", "{{ transcript }}");

        assert!(resolve_override(root.path(), inside.to_str().unwrap()).is_ok());
        assert!(resolve_override(root.path(), outside.to_str().unwrap()).is_err());
        assert!(resolve_override(root.path(), "not-markdown.txt").is_err());
    }

    #[test]
    fn missing_variables_render_as_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_template(dir.path(), "t.md", "A[{{ transcript }}]B[{{ context }}]");
        let template = PromptTemplate::load(&path).unwrap();
        let rendered = template.render(&TemplateVars::default()).expect("render");
        assert_eq!(rendered, "A[]B[]");
    }
}
