use anyhow::{Error, Result};
use once_cell::sync::OnceCell;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

static TRACING_INIT: OnceCell<()> = OnceCell::new();

/// Telemetry（構造化ログ）を管理する構造体。
#[derive(Debug, Clone)]
pub struct Telemetry;

impl Telemetry {
    /// Tracingサブスクライバを一度だけ初期化する。
    ///
    /// # Errors
    /// サブスクライバの初期化に失敗した場合はエラーを返す。
    pub fn new() -> Result<Self> {
        TRACING_INIT.get_or_try_init(|| {
            let env_filter =
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

            let fmt_layer = tracing_subscriber::fmt::layer().with_target(false).json();

            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer)
                .try_init()
                .map_err(|error| Error::msg(error.to_string()))?;

            info!("structured logging initialized");
            Ok::<(), Error>(())
        })?;
        Ok(Self)
    }
}
