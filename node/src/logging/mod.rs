//! Tracing setup: stdout formatting plus an optional JSON event file.

mod json;

pub use json::{JsonLogLayer, JsonLogWriter, LogRecord, LOG_BUFFER};

use crate::cli::{NodeConfig, DEFAULT_LOG_JSON_FILTER};
use std::sync::Arc;
use tracing::warn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Must be held for the JSON log to keep receiving events.
pub struct TracingGuards {
    pub log_writer: Option<Arc<JsonLogWriter>>,
}

impl TracingGuards {
    /// Flush the JSON log, if any.
    pub fn finish(&self) {
        if let Some(writer) = &self.log_writer {
            if let Err(err) = writer.finish() {
                warn!(error = %err, "failed to finish json log");
            }
        }
    }
}

/// `RUST_LOG` wins; otherwise `-v` raises the crate's level.
pub fn stdout_filter(verbosity: u8) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let (global, local) = match verbosity {
            0 => ("warn", "info"),
            1 => ("warn", "debug"),
            2 => ("info", "trace"),
            _ => ("debug", "trace"),
        };
        EnvFilter::new(format!("{global},odr_light_client={local}"))
    })
}

pub fn init_tracing(config: &NodeConfig) -> TracingGuards {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .with_filter(stdout_filter(config.verbosity));

    let json_filter = EnvFilter::try_new(&config.log_json_filter)
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_JSON_FILTER));
    let mut open_error = None;
    let log_writer = config
        .log_json
        .as_deref()
        .and_then(|path| match JsonLogWriter::new(path, LOG_BUFFER) {
            Ok(writer) => Some(Arc::new(writer)),
            Err(err) => {
                open_error = Some(err);
                None
            }
        });
    let json_layer = log_writer
        .as_ref()
        .map(|writer| JsonLogLayer::new(Arc::clone(writer)).with_filter(json_filter));

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(json_layer)
        .init();
    if let Some(err) = open_error {
        warn!(error = %err, "failed to open json log");
    }
    TracingGuards { log_writer }
}
