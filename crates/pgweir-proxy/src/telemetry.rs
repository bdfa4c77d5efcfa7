//! Logging initialization
//!
//! tracing-subscriber with an env filter; plain or JSON formatting, to
//! stderr or an append-mode log file, per the logging config. `RUST_LOG`
//! overrides the configured level.

use std::fs::OpenOptions;
use std::sync::Arc;

use anyhow::{Context, Result};
use pgweir_common::config::LoggingConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub fn init(cfg: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.level));
    let subscriber = tracing_subscriber::registry().with(filter);

    match &cfg.file {
        Some(file_cfg) => {
            let file = OpenOptions::new()
                .create(true)
                .append(file_cfg.append)
                .write(true)
                .truncate(!file_cfg.append)
                .open(&file_cfg.path)
                .with_context(|| format!("cannot open log file {}", file_cfg.path.display()))?;
            let writer = Arc::new(file);
            if cfg.json {
                subscriber
                    .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
                    .init();
            } else {
                subscriber
                    .with(
                        tracing_subscriber::fmt::layer()
                            .with_ansi(false)
                            .with_writer(writer),
                    )
                    .init();
            }
        }
        None => {
            if cfg.json {
                subscriber
                    .with(tracing_subscriber::fmt::layer().json())
                    .init();
            } else {
                subscriber.with(tracing_subscriber::fmt::layer()).init();
            }
        }
    }
    Ok(())
}
