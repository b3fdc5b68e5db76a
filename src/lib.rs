#![allow(
    // Acceptable for trait naming consistency (e.g., JobStore, PgJobStore)
    clippy::module_name_repetitions,

    // Error context via anyhow::Context already provides sufficient documentation
    clippy::missing_errors_doc,

    // Technical identifiers (e.g., XXH3, JSONB) don't need markdown formatting
    clippy::doc_markdown,

    // Named format args reduce readability for long messages with many placeholders
    clippy::uninlined_format_args,

    // Too noisy: many utility methods return useful values but aren't always used
    clippy::must_use_candidate
)]

pub(crate) mod analyzers;
pub(crate) mod api;
pub mod app;
pub(crate) mod clients;
pub mod config;
pub(crate) mod context;
pub mod events;
pub mod insights;
pub mod models;
pub mod observability;
pub mod pipeline;
pub mod prompt;
pub(crate) mod schema;
pub mod store;
pub mod transcript;
pub(crate) mod util;
