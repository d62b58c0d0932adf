use clap::ValueEnum;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::fs::OpenOptions;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn to_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub file: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to configure logger: {0}")]
    Configure(String),
    #[error("failed to install metrics exporter: {0}")]
    Metrics(String),
}

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the global subscriber. Logs go to stderr unless a file is given.
pub fn init_logging(config: &LogConfig) -> Result<(), InitError> {
    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| InitError::Io {
                    path: path.clone(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(build_env_filter(config.level.to_filter()))
        .with_target(config.level >= LogLevel::Debug)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| InitError::Configure(err.to_string()))?;
    let _ = GUARD.set(guard);
    Ok(())
}

/// `PARLEY_LOG_FILTER` wins; otherwise the engine logs at `level` and noisy
/// transport crates stay at warn.
fn build_env_filter(level: LevelFilter) -> EnvFilter {
    if let Ok(filter) = std::env::var("PARLEY_LOG_FILTER") {
        return EnvFilter::new(filter);
    }
    EnvFilter::new(default_filter_for(level))
}

const QUIET_DEPS: &[&str] = &["hyper", "reqwest", "rustls", "tungstenite", "tokio_tungstenite", "h2"];

fn default_filter_for(level: LevelFilter) -> String {
    let mut directives = vec![level.to_string().to_ascii_lowercase()];
    if level > LevelFilter::WARN {
        directives.extend(QUIET_DEPS.iter().map(|dep| format!("{dep}=warn")));
    }
    directives.join(",")
}

/// Installs the Prometheus recorder, serving `/metrics` when an address is given.
/// Must run inside the tokio runtime when a listener is requested.
pub fn init_metrics(listen: Option<SocketAddr>) -> Result<(), InitError> {
    let builder = PrometheusBuilder::new();
    match listen {
        Some(addr) => builder
            .with_http_listener(addr)
            .install()
            .map_err(|err| InitError::Metrics(err.to_string())),
        None => builder
            .install_recorder()
            .map(|_| ())
            .map_err(|err| InitError::Metrics(err.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependency_noise_is_capped_above_warn() {
        let filter = default_filter_for(LevelFilter::DEBUG);
        assert!(filter.starts_with("debug,"));
        assert!(filter.contains("reqwest=warn"));
        assert_eq!(default_filter_for(LevelFilter::ERROR), "error");
    }
}
