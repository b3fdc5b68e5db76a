use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use crate::{
    api,
    clients::{LlmClient, LlmConfig, TokenCounter},
    config::Config,
    events::EventBus,
    observability::Telemetry,
    pipeline::Scheduler,
    store::{JobStore, memory::MemoryJobStore, postgres::PgJobStore},
    util::retry::BackoffPolicy,
};

#[derive(Clone)]
pub(crate) struct AppState {
    registry: Arc<ComponentRegistry>,
}

/// Process-wide dependency container: every component is constructed once
/// here and injected.
pub struct ComponentRegistry {
    config: Arc<Config>,
    #[allow(dead_code)]
    telemetry: Telemetry,
    scheduler: Scheduler,
    llm_client: Arc<LlmClient>,
    store: Arc<dyn JobStore>,
    events: EventBus,
}

impl AppState {
    pub(crate) fn new(registry: ComponentRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    pub(crate) fn scheduler(&self) -> &Scheduler {
        &self.registry.scheduler
    }

    pub(crate) fn llm_client(&self) -> Arc<LlmClient> {
        Arc::clone(&self.registry.llm_client)
    }

    pub(crate) fn store(&self) -> Arc<dyn JobStore> {
        Arc::clone(&self.registry.store)
    }
}

impl ComponentRegistry {
    /// 構成情報と依存をまとめて初期化し、アプリケーションの共有レジストリを構築する。
    ///
    /// # Errors
    /// Telemetry の初期化や HTTP クライアント構築が失敗した場合はエラーを返す。
    pub async fn build(config: Config) -> Result<Self> {
        let config = Arc::new(config);
        let telemetry = Telemetry::new()?;

        let token_counter = match config.tokenizer_model() {
            Some(model) => TokenCounter::from_pretrained(model).unwrap_or_else(|e| {
                warn!(
                    "failed to initialize tokenizer: {e:#}. Using heuristic token counting only."
                );
                TokenCounter::dummy()
            }),
            None => TokenCounter::dummy(),
        };

        let llm_client = Arc::new(
            LlmClient::new(
                LlmConfig {
                    base_url: config.llm_base_url().to_string(),
                    api_key: config.llm_api_key().map(ToString::to_string),
                    model: config.llm_model().to_string(),
                    temperature: config.llm_temperature(),
                    max_tokens: config.llm_max_tokens(),
                    request_timeout: config.llm_timeout(),
                    retry: BackoffPolicy::new(
                        config.llm_max_retries(),
                        Duration::from_millis(config.llm_backoff_base_ms()),
                        Duration::from_millis(config.llm_backoff_cap_ms()),
                    ),
                    cache_enabled: config.llm_cache_enabled(),
                },
                token_counter,
            )
            .context("failed to build completion client")?,
        );

        let store: Arc<dyn JobStore> = match config.db_dsn() {
            Some(dsn) => {
                let pool = PgPoolOptions::new()
                    .max_connections(10)
                    .acquire_timeout(Duration::from_secs(30))
                    .connect_lazy(dsn)
                    .context("failed to configure job store connection pool")?;
                let store = PgJobStore::new(pool, config.job_ttl());
                store
                    .ensure_schema()
                    .await
                    .context("failed to prepare job store schema")?;
                info!("job store: postgres");
                Arc::new(store)
            }
            None => {
                info!("job store: in-memory (no MINUTES_DB_DSN configured)");
                Arc::new(MemoryJobStore::new(config.job_ttl()))
            }
        };

        let events = EventBus::new();
        let scheduler = Scheduler::new(
            Arc::clone(&config),
            Arc::clone(&llm_client),
            Arc::clone(&store),
            events.clone(),
        );

        Ok(Self {
            config,
            telemetry,
            scheduler,
            llm_client,
            store,
            events,
        })
    }

    #[must_use]
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    #[must_use]
    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    #[must_use]
    pub fn store(&self) -> Arc<dyn JobStore> {
        Arc::clone(&self.store)
    }
}

pub fn build_router(registry: ComponentRegistry) -> Router {
    let state = AppState::new(registry);
    api::router(state)
}
