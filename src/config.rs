use std::{env, net::SocketAddr, path::PathBuf, time::Duration};

use thiserror::Error;

#[cfg(test)]
use once_cell::sync::Lazy;
#[cfg(test)]
pub(crate) static ENV_MUTEX: Lazy<std::sync::Mutex<()>> = Lazy::new(|| std::sync::Mutex::new(()));

/// Runtime configuration, loaded from environment variables with typed
/// parsing and defaults. Constructed once per process and injected.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    http_bind: SocketAddr,
    llm_base_url: String,
    llm_api_key: Option<String>,
    llm_model: String,
    llm_temperature: f64,
    llm_max_tokens: u32,
    llm_timeout: Duration,
    llm_max_retries: usize,
    llm_backoff_base_ms: u64,
    llm_backoff_cap_ms: u64,
    llm_cache_enabled: bool,
    tokenizer_model: Option<String>,
    db_dsn: Option<String>,
    job_ttl: Duration,
    prompts_root: PathBuf,
    uploads_root: PathBuf,
    output_root: PathBuf,
    max_concurrent: usize,
    analyzer_timeout: Duration,
    chunk_size: usize,
    stage_b_context_token_budget: usize,
    stage_b_min_tokens_per_analyzer: usize,
    final_context_token_budget: usize,
    final_transcript_char_limit: usize,
    summary_enabled: bool,
    summary_map_chunk_tokens: usize,
    summary_map_overlap_tokens: usize,
    summary_stage_b_target_tokens: usize,
    summary_final_target_tokens: usize,
    summary_single_pass_max_tokens: usize,
    summary_map_model: Option<String>,
    summary_reduce_model: Option<String>,
    insights_llm_enabled: bool,
    insights_llm_max_items: usize,
    insights_llm_max_tokens: u32,
    insights_llm_model: Option<String>,
    max_insights_per_analyzer: usize,
    max_concepts_per_analyzer: usize,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {source}")]
    Invalid {
        name: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_bind: "0.0.0.0:9105".parse().expect("default bind"),
            llm_base_url: "http://localhost:8000/v1/".to_string(),
            llm_api_key: None,
            llm_model: "gpt-4o-mini".to_string(),
            llm_temperature: 0.7,
            llm_max_tokens: 8000,
            llm_timeout: Duration::from_secs(120),
            llm_max_retries: 3,
            llm_backoff_base_ms: 250,
            llm_backoff_cap_ms: 10_000,
            llm_cache_enabled: true,
            tokenizer_model: None,
            db_dsn: None,
            job_ttl: Duration::from_secs(60 * 60 * 24),
            prompts_root: PathBuf::from("prompts"),
            uploads_root: PathBuf::from("uploads"),
            output_root: PathBuf::from("output/jobs"),
            max_concurrent: 3,
            analyzer_timeout: Duration::from_secs(300),
            chunk_size: 4000,
            stage_b_context_token_budget: 8000,
            stage_b_min_tokens_per_analyzer: 500,
            final_context_token_budget: 0,
            final_transcript_char_limit: 20_000,
            summary_enabled: true,
            summary_map_chunk_tokens: 2000,
            summary_map_overlap_tokens: 200,
            summary_stage_b_target_tokens: 1000,
            summary_final_target_tokens: 2000,
            summary_single_pass_max_tokens: 6000,
            summary_map_model: None,
            summary_reduce_model: None,
            insights_llm_enabled: true,
            insights_llm_max_items: 50,
            insights_llm_max_tokens: 2000,
            insights_llm_model: None,
            max_insights_per_analyzer: 10,
            max_concepts_per_analyzer: 20,
        }
    }
}

impl Config {
    /// 環境変数から設定値を読み込み、検証する。
    ///
    /// # Errors
    /// 数値／アドレスのパースに失敗した場合は [`ConfigError`] を返す。
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();
        Ok(Self {
            http_bind: parse_socket_addr("MINUTES_HTTP_BIND", defaults.http_bind)?,
            llm_base_url: env::var("LLM_BASE_URL").unwrap_or(defaults.llm_base_url),
            llm_api_key: env::var("LLM_API_KEY").ok(),
            llm_model: env::var("LLM_MODEL").unwrap_or(defaults.llm_model),
            llm_temperature: parse_f64("LLM_TEMPERATURE", defaults.llm_temperature)?,
            llm_max_tokens: parse_u32("LLM_MAX_TOKENS", defaults.llm_max_tokens)?,
            llm_timeout: parse_duration_secs("LLM_TIMEOUT_SECS", 120)?,
            llm_max_retries: parse_usize("LLM_MAX_RETRIES", defaults.llm_max_retries)?,
            llm_backoff_base_ms: parse_u64("LLM_BACKOFF_BASE_MS", defaults.llm_backoff_base_ms)?,
            llm_backoff_cap_ms: parse_u64("LLM_BACKOFF_CAP_MS", defaults.llm_backoff_cap_ms)?,
            llm_cache_enabled: parse_bool("LLM_CACHE_ENABLED", defaults.llm_cache_enabled)?,
            tokenizer_model: env::var("MINUTES_TOKENIZER_MODEL").ok(),
            db_dsn: env::var("MINUTES_DB_DSN").ok(),
            job_ttl: parse_duration_secs("MINUTES_JOB_TTL_SECS", 60 * 60 * 24)?,
            prompts_root: PathBuf::from(
                env::var("MINUTES_PROMPTS_ROOT").unwrap_or_else(|_| "prompts".to_string()),
            ),
            uploads_root: PathBuf::from(
                env::var("MINUTES_UPLOADS_ROOT").unwrap_or_else(|_| "uploads".to_string()),
            ),
            output_root: PathBuf::from(
                env::var("MINUTES_OUTPUT_ROOT").unwrap_or_else(|_| "output/jobs".to_string()),
            ),
            max_concurrent: parse_usize("MINUTES_MAX_CONCURRENT", defaults.max_concurrent)?,
            analyzer_timeout: parse_duration_secs("MINUTES_ANALYZER_TIMEOUT_SECS", 300)?,
            chunk_size: parse_usize("MINUTES_CHUNK_SIZE", defaults.chunk_size)?,
            stage_b_context_token_budget: parse_usize(
                "MINUTES_STAGE_B_CONTEXT_TOKEN_BUDGET",
                defaults.stage_b_context_token_budget,
            )?,
            stage_b_min_tokens_per_analyzer: parse_usize(
                "MINUTES_STAGE_B_MIN_TOKENS_PER_ANALYZER",
                defaults.stage_b_min_tokens_per_analyzer,
            )?,
            final_context_token_budget: parse_usize(
                "MINUTES_FINAL_CONTEXT_TOKEN_BUDGET",
                defaults.final_context_token_budget,
            )?,
            final_transcript_char_limit: parse_usize(
                "MINUTES_FINAL_TRANSCRIPT_CHAR_LIMIT",
                defaults.final_transcript_char_limit,
            )?,
            summary_enabled: parse_bool("MINUTES_SUMMARY_ENABLED", defaults.summary_enabled)?,
            summary_map_chunk_tokens: parse_usize(
                "MINUTES_SUMMARY_MAP_CHUNK_TOKENS",
                defaults.summary_map_chunk_tokens,
            )?,
            summary_map_overlap_tokens: parse_usize(
                "MINUTES_SUMMARY_MAP_OVERLAP_TOKENS",
                defaults.summary_map_overlap_tokens,
            )?,
            summary_stage_b_target_tokens: parse_usize(
                "MINUTES_SUMMARY_STAGE_B_TARGET_TOKENS",
                defaults.summary_stage_b_target_tokens,
            )?,
            summary_final_target_tokens: parse_usize(
                "MINUTES_SUMMARY_FINAL_TARGET_TOKENS",
                defaults.summary_final_target_tokens,
            )?,
            summary_single_pass_max_tokens: parse_usize(
                "MINUTES_SUMMARY_SINGLE_PASS_MAX_TOKENS",
                defaults.summary_single_pass_max_tokens,
            )?,
            summary_map_model: env::var("MINUTES_SUMMARY_MAP_MODEL").ok(),
            summary_reduce_model: env::var("MINUTES_SUMMARY_REDUCE_MODEL").ok(),
            insights_llm_enabled: parse_bool(
                "MINUTES_INSIGHTS_LLM_ENABLED",
                defaults.insights_llm_enabled,
            )?,
            insights_llm_max_items: parse_usize(
                "MINUTES_INSIGHTS_LLM_MAX_ITEMS",
                defaults.insights_llm_max_items,
            )?,
            insights_llm_max_tokens: parse_u32(
                "MINUTES_INSIGHTS_LLM_MAX_TOKENS",
                defaults.insights_llm_max_tokens,
            )?,
            insights_llm_model: env::var("MINUTES_INSIGHTS_LLM_MODEL").ok(),
            max_insights_per_analyzer: parse_usize(
                "MINUTES_MAX_INSIGHTS_PER_ANALYZER",
                defaults.max_insights_per_analyzer,
            )?,
            max_concepts_per_analyzer: parse_usize(
                "MINUTES_MAX_CONCEPTS_PER_ANALYZER",
                defaults.max_concepts_per_analyzer,
            )?,
        })
    }

    #[must_use]
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder {
            config: Config::default(),
        }
    }

    #[must_use]
    pub fn http_bind(&self) -> SocketAddr {
        self.http_bind
    }

    #[must_use]
    pub fn llm_base_url(&self) -> &str {
        &self.llm_base_url
    }

    #[must_use]
    pub fn llm_api_key(&self) -> Option<&str> {
        self.llm_api_key.as_deref()
    }

    #[must_use]
    pub fn llm_model(&self) -> &str {
        &self.llm_model
    }

    #[must_use]
    pub fn llm_temperature(&self) -> f64 {
        self.llm_temperature
    }

    #[must_use]
    pub fn llm_max_tokens(&self) -> u32 {
        self.llm_max_tokens
    }

    #[must_use]
    pub fn llm_timeout(&self) -> Duration {
        self.llm_timeout
    }

    #[must_use]
    pub fn llm_max_retries(&self) -> usize {
        self.llm_max_retries
    }

    #[must_use]
    pub fn llm_backoff_base_ms(&self) -> u64 {
        self.llm_backoff_base_ms
    }

    #[must_use]
    pub fn llm_backoff_cap_ms(&self) -> u64 {
        self.llm_backoff_cap_ms
    }

    #[must_use]
    pub fn llm_cache_enabled(&self) -> bool {
        self.llm_cache_enabled
    }

    #[must_use]
    pub fn tokenizer_model(&self) -> Option<&str> {
        self.tokenizer_model.as_deref()
    }

    #[must_use]
    pub fn db_dsn(&self) -> Option<&str> {
        self.db_dsn.as_deref()
    }

    #[must_use]
    pub fn job_ttl(&self) -> Duration {
        self.job_ttl
    }

    #[must_use]
    pub fn prompts_root(&self) -> &std::path::Path {
        &self.prompts_root
    }

    #[must_use]
    pub fn uploads_root(&self) -> &std::path::Path {
        &self.uploads_root
    }

    #[must_use]
    pub fn output_root(&self) -> &std::path::Path {
        &self.output_root
    }

    #[must_use]
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    #[must_use]
    pub fn analyzer_timeout(&self) -> Duration {
        self.analyzer_timeout
    }

    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    #[must_use]
    pub fn stage_b_context_token_budget(&self) -> usize {
        self.stage_b_context_token_budget
    }

    #[must_use]
    pub fn stage_b_min_tokens_per_analyzer(&self) -> usize {
        self.stage_b_min_tokens_per_analyzer
    }

    #[must_use]
    pub fn final_context_token_budget(&self) -> usize {
        self.final_context_token_budget
    }

    #[must_use]
    pub fn final_transcript_char_limit(&self) -> usize {
        self.final_transcript_char_limit
    }

    #[must_use]
    pub fn summary_enabled(&self) -> bool {
        self.summary_enabled
    }

    #[must_use]
    pub fn summary_map_chunk_tokens(&self) -> usize {
        self.summary_map_chunk_tokens
    }

    #[must_use]
    pub fn summary_map_overlap_tokens(&self) -> usize {
        self.summary_map_overlap_tokens
    }

    #[must_use]
    pub fn summary_stage_b_target_tokens(&self) -> usize {
        self.summary_stage_b_target_tokens
    }

    #[must_use]
    pub fn summary_final_target_tokens(&self) -> usize {
        self.summary_final_target_tokens
    }

    #[must_use]
    pub fn summary_single_pass_max_tokens(&self) -> usize {
        self.summary_single_pass_max_tokens
    }

    #[must_use]
    pub fn summary_map_model(&self) -> Option<&str> {
        self.summary_map_model.as_deref()
    }

    #[must_use]
    pub fn summary_reduce_model(&self) -> Option<&str> {
        self.summary_reduce_model.as_deref()
    }

    #[must_use]
    pub fn insights_llm_enabled(&self) -> bool {
        self.insights_llm_enabled
    }

    #[must_use]
    pub fn insights_llm_max_items(&self) -> usize {
        self.insights_llm_max_items
    }

    #[must_use]
    pub fn insights_llm_max_tokens(&self) -> u32 {
        self.insights_llm_max_tokens
    }

    #[must_use]
    pub fn insights_llm_model(&self) -> Option<&str> {
        self.insights_llm_model.as_deref()
    }

    #[must_use]
    pub fn max_insights_per_analyzer(&self) -> usize {
        self.max_insights_per_analyzer
    }

    #[must_use]
    pub fn max_concepts_per_analyzer(&self) -> usize {
        self.max_concepts_per_analyzer
    }
}

/// Builder used by tests and embedders to construct a config without
/// touching process environment.
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    #[must_use]
    pub fn llm_base_url(mut self, value: impl Into<String>) -> Self {
        self.config.llm_base_url = value.into();
        self
    }

    #[must_use]
    pub fn llm_temperature(mut self, value: f64) -> Self {
        self.config.llm_temperature = value;
        self
    }

    #[must_use]
    pub fn llm_retry(mut self, max_retries: usize, base_ms: u64, cap_ms: u64) -> Self {
        self.config.llm_max_retries = max_retries;
        self.config.llm_backoff_base_ms = base_ms;
        self.config.llm_backoff_cap_ms = cap_ms;
        self
    }

    #[must_use]
    pub fn prompts_root(mut self, value: impl Into<PathBuf>) -> Self {
        self.config.prompts_root = value.into();
        self
    }

    #[must_use]
    pub fn uploads_root(mut self, value: impl Into<PathBuf>) -> Self {
        self.config.uploads_root = value.into();
        self
    }

    #[must_use]
    pub fn output_root(mut self, value: impl Into<PathBuf>) -> Self {
        self.config.output_root = value.into();
        self
    }

    #[must_use]
    pub fn max_concurrent(mut self, value: usize) -> Self {
        self.config.max_concurrent = value;
        self
    }

    #[must_use]
    pub fn analyzer_timeout(mut self, value: Duration) -> Self {
        self.config.analyzer_timeout = value;
        self
    }

    #[must_use]
    pub fn chunk_size(mut self, value: usize) -> Self {
        self.config.chunk_size = value;
        self
    }

    #[must_use]
    pub fn stage_b_budget(mut self, budget: usize, min_per_analyzer: usize) -> Self {
        self.config.stage_b_context_token_budget = budget;
        self.config.stage_b_min_tokens_per_analyzer = min_per_analyzer;
        self
    }

    #[must_use]
    pub fn final_context_token_budget(mut self, value: usize) -> Self {
        self.config.final_context_token_budget = value;
        self
    }

    #[must_use]
    pub fn summary(
        mut self,
        enabled: bool,
        single_pass_max_tokens: usize,
        map_chunk_tokens: usize,
        map_overlap_tokens: usize,
    ) -> Self {
        self.config.summary_enabled = enabled;
        self.config.summary_single_pass_max_tokens = single_pass_max_tokens;
        self.config.summary_map_chunk_tokens = map_chunk_tokens;
        self.config.summary_map_overlap_tokens = map_overlap_tokens;
        self
    }

    #[must_use]
    pub fn insights_llm_enabled(mut self, value: bool) -> Self {
        self.config.insights_llm_enabled = value;
        self
    }

    #[must_use]
    pub fn build(self) -> Config {
        self.config
    }
}

fn parse_socket_addr(name: &'static str, default: SocketAddr) -> Result<SocketAddr, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.parse().map_err(|e| ConfigError::Invalid {
            name,
            source: anyhow::Error::new(e),
        }),
        Err(_) => Ok(default),
    }
}

fn parse_usize(name: &'static str, default: usize) -> Result<usize, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.parse().map_err(|e| ConfigError::Invalid {
            name,
            source: anyhow::Error::new(e),
        }),
        Err(_) => Ok(default),
    }
}

fn parse_u32(name: &'static str, default: u32) -> Result<u32, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.parse().map_err(|e| ConfigError::Invalid {
            name,
            source: anyhow::Error::new(e),
        }),
        Err(_) => Ok(default),
    }
}

fn parse_u64(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.parse().map_err(|e| ConfigError::Invalid {
            name,
            source: anyhow::Error::new(e),
        }),
        Err(_) => Ok(default),
    }
}

fn parse_f64(name: &'static str, default: f64) -> Result<f64, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.parse().map_err(|e| ConfigError::Invalid {
            name,
            source: anyhow::Error::new(e),
        }),
        Err(_) => Ok(default),
    }
}

fn parse_bool(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match env::var(name) {
        Ok(raw) => match raw.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(ConfigError::Invalid {
                name,
                source: anyhow::anyhow!("expected boolean, got {other:?}"),
            }),
        },
        Err(_) => Ok(default),
    }
}

fn parse_duration_secs(name: &'static str, default_secs: u64) -> Result<Duration, ConfigError> {
    Ok(Duration::from_secs(parse_u64(name, default_secs)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_environment() {
        let _lock = ENV_MUTEX.lock().expect("env mutex");
        // SAFETY: protected by ENV_MUTEX; values are removed before reading
        // so defaults are exercised deterministically.
        unsafe {
            env::remove_var("MINUTES_MAX_CONCURRENT");
            env::remove_var("MINUTES_CHUNK_SIZE");
            env::remove_var("LLM_CACHE_ENABLED");
        }

        let config = Config::from_env().expect("config loads");
        assert_eq!(config.max_concurrent(), 3);
        assert_eq!(config.chunk_size(), 4000);
        assert!(config.llm_cache_enabled());
        assert_eq!(config.stage_b_context_token_budget(), 8000);
        assert_eq!(config.job_ttl(), Duration::from_secs(86_400));
    }

    #[test]
    fn environment_overrides_are_parsed() {
        let _lock = ENV_MUTEX.lock().expect("env mutex");
        // SAFETY: protected by ENV_MUTEX for the duration of the test.
        unsafe {
            env::set_var("MINUTES_MAX_CONCURRENT", "8");
            env::set_var("MINUTES_STAGE_B_CONTEXT_TOKEN_BUDGET", "12000");
            env::set_var("LLM_CACHE_ENABLED", "off");
        }

        let config = Config::from_env().expect("config loads");
        assert_eq!(config.max_concurrent(), 8);
        assert_eq!(config.stage_b_context_token_budget(), 12_000);
        assert!(!config.llm_cache_enabled());

        // SAFETY: cleanup under the same lock.
        unsafe {
            env::remove_var("MINUTES_MAX_CONCURRENT");
            env::remove_var("MINUTES_STAGE_B_CONTEXT_TOKEN_BUDGET");
            env::remove_var("LLM_CACHE_ENABLED");
        }
    }

    #[test]
    fn invalid_values_are_rejected() {
        let _lock = ENV_MUTEX.lock().expect("env mutex");
        // SAFETY: protected by ENV_MUTEX for the duration of the test.
        unsafe {
            env::set_var("MINUTES_MAX_CONCURRENT", "many");
        }

        let error = Config::from_env().expect_err("parse must fail");
        assert!(error.to_string().contains("MINUTES_MAX_CONCURRENT"));

        // SAFETY: cleanup under the same lock.
        unsafe {
            env::remove_var("MINUTES_MAX_CONCURRENT");
        }
    }

    #[test]
    fn builder_overrides_defaults() {
        let config = Config::builder()
            .max_concurrent(5)
            .stage_b_budget(4000, 500)
            .insights_llm_enabled(false)
            .build();
        assert_eq!(config.max_concurrent(), 5);
        assert_eq!(config.stage_b_context_token_budget(), 4000);
        assert!(!config.insights_llm_enabled());
    }
}
