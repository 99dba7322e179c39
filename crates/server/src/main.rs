mod api;
mod bootstrap;
mod health;
mod tools;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sprout_agent::stream::EmitterConfig;
use sprout_agent::AgentRuntime;
use sprout_core::config::{AppConfig, LoadOptions};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

fn init_logging(config: &AppConfig) {
    use sprout_core::config::LogFormat::*;
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    // Logging must be up before bootstrap emits its first event.
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;
    let shutdown = CancellationToken::new();

    let sweeper = Arc::clone(app.runtime.prompts())
        .spawn_sweeper(app.config.cache.sweep_interval(), shutdown.child_token());
    let maintenance = spawn_maintenance(
        Arc::clone(&app.runtime),
        app.config.cache.sweep_interval(),
        Duration::from_secs(app.config.sessions.idle_eviction_secs),
        shutdown.child_token(),
    );

    let router = api::router(api::ApiState::new(
        Arc::clone(&app.runtime),
        EmitterConfig::from(&app.config.stream),
    ))
    .merge(health::router(app.db_pool.clone()));

    let address = format!("{}:{}", app.config.server.bind_address, app.config.server.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        bind_address = %address,
        "sprout-server listening"
    );

    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
    });

    wait_for_shutdown().await?;
    tracing::info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        grace_secs = app.config.server.graceful_shutdown_secs,
        "sprout-server stopping"
    );
    shutdown.cancel();

    let grace = Duration::from_secs(app.config.server.graceful_shutdown_secs);
    match tokio::time::timeout(grace, server).await {
        Ok(joined) => joined??,
        Err(_) => tracing::warn!(
            event_name = "system.server.shutdown_timeout",
            correlation_id = "shutdown",
            "open streams outlived the shutdown grace period"
        ),
    }

    let _ = sweeper.await;
    let _ = maintenance.await;
    let persisted = app.runtime.evict_idle(Duration::ZERO).await;
    tracing::info!(
        event_name = "system.server.stopped",
        correlation_id = "shutdown",
        sessions_persisted = persisted.len(),
        "sprout-server stopped"
    );
    app.db_pool.close().await;

    Ok(())
}

/// Periodically evicts idle sessions and expired intent and memory entries.
fn spawn_maintenance(
    runtime: Arc<AgentRuntime>,
    interval: Duration,
    idle_threshold: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let evicted = runtime.evict_idle(idle_threshold).await;
                    let swept = runtime.sweep_caches().await;
                    if !evicted.is_empty() || swept.intents > 0 || swept.memories > 0 {
                        tracing::debug!(
                            event_name = "system.maintenance.swept",
                            sessions_evicted = evicted.len(),
                            intents_expired = swept.intents,
                            memories_expired = swept.memories,
                            "idle state released"
                        );
                    }
                }
            }
        }
    })
}

async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
