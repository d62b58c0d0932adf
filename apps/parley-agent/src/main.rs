use anyhow::{Context, Result};
use clap::Parser;
use parley_proto::Role;
use parley_sync::{
    ConnectionEvent, Identity, PageReport, StaticToken, SyncConfig, SyncEngine,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};

mod telemetry;

use telemetry::{LogConfig, LogLevel};

#[derive(Debug, Parser)]
#[command(
    name = "parley-agent",
    author,
    version,
    about = "Keeps a local parley thread cache in sync with the server"
)]
struct Cli {
    /// REST base URL of the thread server.
    #[arg(long, env = "PARLEY_API_URL")]
    api_url: Option<String>,

    /// Live channel base URL; the user id is appended.
    #[arg(long, env = "PARLEY_WS_URL")]
    ws_url: Option<String>,

    /// Bearer token for REST calls and the live channel.
    #[arg(long, env = "PARLEY_TOKEN", hide_env_values = true)]
    token: String,

    #[arg(long, env = "PARLEY_USER_ID")]
    user_id: i64,

    /// `student`/`asker` or `tutor`/`responder`.
    #[arg(long, env = "PARLEY_ROLE", default_value = "student")]
    role: String,

    #[arg(long, env = "PARLEY_PAGE_SIZE")]
    page_size: Option<u32>,

    /// Seconds between background refreshes.
    #[arg(long, env = "PARLEY_SYNC_INTERVAL_SECS")]
    sync_interval_secs: Option<u64>,

    /// Run one refresh and exit without opening the live channel.
    #[arg(long, default_value_t = false)]
    once: bool,

    #[arg(long, env = "PARLEY_LOG_LEVEL", value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    /// Write logs to this file instead of stderr.
    #[arg(long, env = "PARLEY_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Serve Prometheus metrics on this address.
    #[arg(long, env = "PARLEY_METRICS_ADDR")]
    metrics_addr: Option<String>,
}

#[derive(Debug)]
struct AgentConfig {
    sync: SyncConfig,
    identity: Identity,
    token: String,
    once: bool,
    log: LogConfig,
    metrics_addr: Option<SocketAddr>,
}

impl TryFrom<Cli> for AgentConfig {
    type Error = anyhow::Error;

    /// Flags override `PARLEY__*` engine settings, which override defaults.
    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let role = Role::parse(&cli.role)
            .with_context(|| format!("unknown role: {}", cli.role))?;
        let metrics_addr = cli
            .metrics_addr
            .as_deref()
            .map(|addr| {
                addr.parse::<SocketAddr>()
                    .with_context(|| format!("invalid metrics address: {addr}"))
            })
            .transpose()?;

        let mut sync = SyncConfig::from_env();
        if let Some(url) = cli.api_url {
            sync.api_base_url = url;
        }
        if let Some(url) = cli.ws_url {
            sync.ws_base_url = url;
        }
        if let Some(size) = cli.page_size {
            sync.thread_page_size = size;
        }
        if let Some(secs) = cli.sync_interval_secs {
            sync.sync_interval_secs = secs.max(1);
        }

        Ok(AgentConfig {
            sync: sync.normalize(),
            identity: Identity::new(cli.user_id, role),
            token: cli.token,
            once: cli.once,
            log: LogConfig {
                level: cli.log_level,
                file: cli.log_file,
            },
            metrics_addr,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AgentConfig::try_from(Cli::parse())?;
    telemetry::init_logging(&config.log)?;
    telemetry::init_metrics(config.metrics_addr)?;

    let engine = SyncEngine::builder(config.sync.clone(), config.identity)
        .tokens(Arc::new(StaticToken::new(config.token.clone())))
        .build()
        .context("failed to start sync engine")?;

    if config.once {
        let outcome = engine.refresh().await;
        engine.shutdown().await;
        let report = outcome.map_err(|err| anyhow::anyhow!(err.user_message()))?;
        log_report(&report);
        return Ok(());
    }

    let mut events = engine.connection().subscribe();
    engine.on_foreground();
    engine.open();
    refresh(&engine).await;

    let mut ticker = tokio::time::interval(engine.config().sync_interval());
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
            _ = ticker.tick() => refresh(&engine).await,
            event = events.recv() => match event {
                Ok(event) => on_connection_event(&engine, event).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "missed connection events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    tokio::time::timeout(Duration::from_secs(5), engine.shutdown())
        .await
        .context("engine did not stop in time")?;
    Ok(())
}

async fn refresh(engine: &SyncEngine) {
    match engine.refresh().await {
        Ok(report) => log_report(&report),
        Err(err) => warn!(
            error = %err,
            category = ?err.category(),
            "refresh failed: {}",
            err.user_message()
        ),
    }
    let cached = engine.cache().threads(Some(engine.identity().scope()), None);
    metrics::gauge!("parley_cached_threads", cached.len() as f64);
}

async fn on_connection_event(engine: &SyncEngine, event: ConnectionEvent) {
    match event {
        ConnectionEvent::Connected => {
            info!("live channel connected");
            // Pushes missed while offline are only recoverable by pulling.
            refresh(engine).await;
        }
        ConnectionEvent::Disconnected { reason } => {
            info!(%reason, "live channel disconnected");
        }
        ConnectionEvent::GaveUp {
            attempts,
            last_error,
        } => {
            warn!(
                attempts,
                %last_error,
                "live channel gave up; relying on periodic refresh"
            );
        }
    }
}

fn log_report(report: &PageReport) {
    info!(
        synced = report.threads_synced,
        deleted = report.threads_deleted,
        skipped = report.records_skipped,
        failed = report.failed_threads.len(),
        has_more = report.has_more,
        "refresh complete"
    );
    for (thread_id, reason) in &report.failed_threads {
        warn!(thread_id, %reason, "thread history not synced");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["parley-agent", "--token", "t", "--user-id", "7"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn flags_override_engine_settings() {
        let config = AgentConfig::try_from(cli(&[
            "--role",
            "tutor",
            "--api-url",
            "https://threads.example.com",
            "--page-size",
            "500",
            "--sync-interval-secs",
            "0",
        ]))
        .unwrap();

        assert_eq!(config.identity, Identity::new(7, Role::Responder));
        assert_eq!(config.sync.api_base_url, "https://threads.example.com");
        assert_eq!(config.sync.thread_page_size, 100);
        assert_eq!(config.sync.sync_interval_secs, 1);
        assert!(!config.once);
    }

    #[test]
    fn bad_role_and_metrics_address_are_rejected() {
        assert!(AgentConfig::try_from(cli(&["--role", "admin"])).is_err());
        assert!(AgentConfig::try_from(cli(&["--metrics-addr", "nowhere"])).is_err());
    }
}
