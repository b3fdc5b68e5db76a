//! Declarative analyzer registry.
//!
//! Built-in analyzers are registered per stage with their prompt template and
//! parser capability. Custom slugs resolve to a template-only analyzer that
//! uses the shared fallback parser, so adding an analyzer is just adding a
//! prompt file.

pub(crate) mod parser;

use std::path::PathBuf;

use crate::models::Stage;

pub(crate) use parser::ParserKind;

/// A resolved analyzer: stable slug, stage, prompt template, optional
/// model/sampling overrides, and a parser capability.
#[derive(Debug, Clone)]
pub(crate) struct AnalyzerSpec {
    pub(crate) slug: String,
    pub(crate) stage: Stage,
    pub(crate) prompt_path: PathBuf,
    pub(crate) model: Option<String>,
    pub(crate) temperature: Option<f64>,
    pub(crate) max_tokens: Option<u32>,
    pub(crate) parser: ParserKind,
}

struct Builtin {
    slug: &'static str,
    stage: Stage,
    template: &'static str,
    temperature: Option<f64>,
}

const BUILTINS: &[Builtin] = &[
    Builtin {
        slug: "say_means",
        stage: Stage::A,
        template: "stage_a/say_means.md",
        temperature: None,
    },
    Builtin {
        slug: "perspective_perception",
        stage: Stage::A,
        template: "stage_a/perspective_perception.md",
        temperature: None,
    },
    Builtin {
        slug: "premises_assertions",
        stage: Stage::A,
        template: "stage_a/premises_assertions.md",
        temperature: None,
    },
    Builtin {
        slug: "postulate_theorem",
        stage: Stage::A,
        template: "stage_a/postulate_theorem.md",
        temperature: None,
    },
    Builtin {
        slug: "competing_hypotheses",
        stage: Stage::B,
        template: "stage_b/competing_hypotheses.md",
        temperature: None,
    },
    Builtin {
        slug: "first_principles",
        stage: Stage::B,
        template: "stage_b/first_principles.md",
        temperature: None,
    },
    Builtin {
        slug: "determining_factors",
        stage: Stage::B,
        template: "stage_b/determining_factors.md",
        temperature: None,
    },
    Builtin {
        slug: "patentability",
        stage: Stage::B,
        template: "stage_b/patentability.md",
        temperature: None,
    },
    Builtin {
        slug: "meeting_notes",
        stage: Stage::Final,
        template: "final/meeting_notes.md",
        // Notes should stay close to the source material.
        temperature: Some(0.3),
    },
    Builtin {
        slug: "composite_note",
        stage: Stage::Final,
        template: "final/composite_note.md",
        temperature: Some(0.3),
    },
];

/// Registry resolving slugs to analyzer specs rooted at the prompts dir.
#[derive(Debug, Clone)]
pub(crate) struct AnalyzerRegistry {
    prompts_root: PathBuf,
}

impl AnalyzerRegistry {
    pub(crate) fn new(prompts_root: impl Into<PathBuf>) -> Self {
        Self {
            prompts_root: prompts_root.into(),
        }
    }

    /// Built-in slugs for a stage, in registration order.
    pub(crate) fn default_slugs(&self, stage: Stage) -> Vec<String> {
        BUILTINS
            .iter()
            .filter(|b| b.stage == stage)
            .map(|b| b.slug.to_string())
            .collect()
    }

    /// Resolve a slug for a stage. Built-ins resolve unconditionally; custom
    /// slugs resolve when `prompts/<stage>/<slug>.md` exists.
    pub(crate) fn resolve(&self, stage: Stage, slug: &str) -> Option<AnalyzerSpec> {
        if let Some(builtin) = BUILTINS.iter().find(|b| b.stage == stage && b.slug == slug) {
            return Some(AnalyzerSpec {
                slug: builtin.slug.to_string(),
                stage,
                prompt_path: self.prompts_root.join(builtin.template),
                model: None,
                temperature: builtin.temperature,
                max_tokens: None,
                parser: ParserKind::Sections,
            });
        }

        let custom_path = self
            .prompts_root
            .join(stage.as_str())
            .join(format!("{slug}.md"));
        if custom_path.is_file() {
            return Some(AnalyzerSpec {
                slug: slug.to_string(),
                stage,
                prompt_path: custom_path,
                model: None,
                temperature: None,
                max_tokens: None,
                parser: ParserKind::Plain,
            });
        }

        None
    }
}
