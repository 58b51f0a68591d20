mod bus;
pub use bus::*;

mod client;
pub use client::*;

mod config;
pub use config::*;

mod extractor;
pub use extractor::*;

mod gateway;
pub use gateway::*;

mod grants;
pub use grants::*;

mod manager;
pub use manager::*;

mod room;
pub use room::*;

mod users;
pub use users::*;

mod ws;
pub use ws::*;

use anyhow::{Context, Result};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing_appender::non_blocking::WorkerGuard;

pub type SafeMap<K, V> = RwLock<HashMap<K, V>>;

/// Dependencies whose DEBUG/TRACE output would drown the server's own; the
/// file layer caps them at INFO. Stdout follows `RUST_LOG`.
const QUIET_TARGETS: &[&str] = &["hyper", "rustls", "redis", "tungstenite"];

/// Installs the global subscriber: a daily-rolling file under
/// `config.log_dir` plus an env-filtered stdout layer. The returned guard
/// flushes the file writer on drop.
pub fn init_log(config: &Config) -> Result<WorkerGuard> {
    use tracing::{metadata::LevelFilter, Level};
    use tracing_log::LogTracer;
    use tracing_subscriber::{filter, fmt, prelude::*, EnvFilter};

    std::fs::create_dir_all(&config.log_dir)
        .with_context(|| format!("failed to create {}", config.log_dir.display()))?;

    LogTracer::init()?;

    let (file_writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(
        &config.log_dir,
        "syncroom.log",
    ));

    let mut targets = filter::Targets::new().with_default(Level::TRACE);
    for quiet in QUIET_TARGETS {
        targets = targets.with_target(*quiet, Level::INFO);
    }

    tracing::subscriber::set_global_default(
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_writer(file_writer)
                    .with_ansi(false)
                    .with_filter(LevelFilter::DEBUG),
            )
            .with(
                fmt::layer()
                    .with_writer(std::io::stdout)
                    .with_filter(EnvFilter::from_default_env()),
            )
            .with(targets),
    )
    .context("unable to install the global subscriber")?;
    Ok(guard)
}
