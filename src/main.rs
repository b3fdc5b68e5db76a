use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use minutes_worker::{
    app::{ComponentRegistry, build_router},
    config::Config,
};

fn main() -> anyhow::Result<()> {
    // `minutes-worker healthcheck` probes a running instance and exits; used
    // as the container healthcheck command.
    if std::env::args().nth(1).as_deref() == Some("healthcheck") {
        return liveness_probe();
    }

    install_panic_logger();
    serve()
}

/// Probe the liveness route of the server this process is expected to be
/// running. Runs before any async runtime exists, so the blocking client is
/// safe here.
fn liveness_probe() -> anyhow::Result<()> {
    let config = Config::from_env().context("failed to load configuration")?;
    let url = format!("http://127.0.0.1:{}/health/live", config.http_bind().port());

    let response = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .context("failed to build probe client")?
        .get(&url)
        .send()
        .with_context(|| format!("liveness probe against {url} failed"))?;

    anyhow::ensure!(
        response.status().is_success(),
        "liveness probe returned {}",
        response.status()
    );
    Ok(())
}

/// Panics inside spawned analyzer tasks would otherwise only reach stderr;
/// route them through the structured log stream with their location.
fn install_panic_logger() {
    std::panic::set_hook(Box::new(|info| {
        let payload = info
            .payload()
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| info.payload().downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        let location = info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());
        error!(payload = %payload, location = %location, "worker panicked");
    }));
}

#[tokio::main]
async fn serve() -> anyhow::Result<()> {
    // Tracing initialization happens inside the registry via Telemetry::new()
    let config = Config::from_env().context("failed to load configuration")?;
    let bind_addr = config.http_bind();
    let registry = ComponentRegistry::build(config)
        .await
        .context("failed to build component registry")?;
    let router = build_router(registry);

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind listener on {bind_addr}"))?;

    info!(%bind_addr, "listening");

    if let Err(error) = axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
    {
        warn!(error = %error, "server exited with error");
    }

    Ok(())
}
