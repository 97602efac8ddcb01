//! Entrypoint (C13): wires C1-C12 behind shared handles and serves the five
//! tool operations (C10) over an MCP stdio transport until EOF.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use ceb_admission::{RateLimitConfig, RateLimiter};
use ceb_config::Config;
use ceb_kinds::PortPool;
use ceb_mcp::BrokerServer;
use ceb_metrics::MetricsRegistry;
use ceb_policy::PolicyScreener;
use ceb_session::SessionManager;
use ceb_store::MetadataStore;
use ceb_workspace::WorkspaceProvisioner;
use clap::Parser;
use rmcp::ServiceExt;
use rmcp::transport::stdio;
use tracing::{info, warn};

/// No subcommands today — the broker always speaks one MCP stdio session
/// per process — but `clap` stays on the entrypoint the way every other
/// binary in this workspace parses its invocation, leaving room to grow.
#[derive(Parser)]
#[command(name = "ceb-broker", version)]
#[command(about = "Multi-tenant code-execution broker, served over MCP stdio")]
struct Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let _cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_ansi(false)
        .try_init()
        .ok();

    let config = Config::load()?;
    info!(broker_root = %config.broker_root.display(), "loading broker configuration");

    let store = build_metadata_store(&config);
    let workspace = Arc::new(WorkspaceProvisioner::new(Arc::clone(&config)));
    let sessions = Arc::new(SessionManager::new(
        Arc::clone(&config),
        Arc::clone(&store),
        Arc::clone(&workspace),
    ));
    let policy = Arc::new(PolicyScreener::new());
    let rate_limiter = Arc::new(RateLimiter::new(RateLimitConfig {
        points: config.rate_limit_points,
        window: Duration::from_secs(config.rate_limit_window_secs),
        block_duration: Duration::from_secs(config.rate_limit_block_secs),
    }));
    let vscode_ports = Arc::new(PortPool::new(
        config.vscode_helper_port_range_start..=config.vscode_helper_port_range_end,
    ));
    let metrics = Arc::new(MetricsRegistry::install()?);
    spawn_metrics_listener(Arc::clone(&metrics), config.metrics_port);

    let degraded = workspace.ensure_base_workspaces().await;
    for (language, result) in &degraded {
        if let Err(e) = result {
            warn!(%language, error = %e, "language base workspace degraded at startup");
        }
    }
    match workspace.sweep_stale_workspaces(None).await {
        Ok(removed) => info!(removed, "initial stale-workspace sweep complete"),
        Err(e) => warn!(error = %e, "initial stale-workspace sweep failed"),
    }

    let server = BrokerServer::new(
        Arc::clone(&config),
        Arc::clone(&sessions),
        policy,
        rate_limiter,
        vscode_ports,
        metrics,
    );

    spawn_cleanup_tasks(Arc::clone(&config), Arc::clone(&workspace), server.clone());

    info!("serving broker tools over MCP stdio transport");
    let service = server.serve(stdio()).await?;
    service.waiting().await?;
    info!("broker shutting down");
    Ok(())
}

fn build_metadata_store(config: &Arc<Config>) -> Arc<MetadataStore> {
    match MetadataStore::with_durable_tier(
        &config.metadata_store_host,
        config.metadata_store_port,
        config.metadata_store_db,
        config.metadata_store_password.as_deref(),
    ) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            warn!(
                error = %e,
                "durable metadata tier unreachable at startup, running cache+fallback only"
            );
            Arc::new(MetadataStore::without_durable_tier())
        }
    }
}

/// Serve the Prometheus text export on `METRICS_PORT` until the process
/// exits. A bind failure is logged and swallowed — metrics are diagnostic,
/// not load-bearing for serving tool calls.
fn spawn_metrics_listener(metrics: Arc<MetricsRegistry>, port: u16) {
    tokio::spawn(async move {
        info!(port, "serving metrics export");
        if let Err(e) = metrics.serve_metrics(port).await {
            warn!(port, error = %e, "metrics listener stopped");
        }
    });
}

/// Periodic stale-workspace sweep and session-expiry cleanup, at the
/// interval C11 resolves from `CLEANUP_INTERVAL_MINUTES`.
fn spawn_cleanup_tasks(config: Arc<Config>, workspace: Arc<WorkspaceProvisioner>, server: BrokerServer) {
    let interval = Duration::from_secs(config.cleanup_interval_minutes * 60);
    let max_age = chrono::Duration::hours(config.session_timeout_hours as i64);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // first tick fires immediately; startup already swept once
        loop {
            ticker.tick().await;
            match workspace.sweep_stale_workspaces(None).await {
                Ok(removed) if removed > 0 => info!(removed, "periodic stale-workspace sweep"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "periodic stale-workspace sweep failed"),
            }
            let expired = server.cleanup_expired_sessions(max_age).await;
            if expired > 0 {
                info!(expired, "periodic session-expiry cleanup");
            }
            match tokio::task::spawn_blocking(ceb_resource::cleanup_orphan_scopes).await {
                Ok(Ok(cleaned)) if !cleaned.is_empty() => {
                    info!(count = cleaned.len(), "periodic orphan-scope cleanup");
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(error = %e, "periodic orphan-scope cleanup failed"),
                Err(e) => warn!(error = %e, "orphan-scope cleanup task panicked"),
            }
        }
    });
}
