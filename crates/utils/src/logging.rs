//! provides logging helpers

use std::fmt;
use std::str::FromStr;

use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// Output format of the stderr log layer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human readable single-line records
    #[default]
    Text,
    /// One JSON object per record, for log shippers
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "console" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format `{other}`, expected `text` or `json`")),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => f.write_str("text"),
            Self::Json => f.write_str("json"),
        }
    }
}

fn env_filter() -> filter::EnvFilter {
    filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy()
}

/// initiate the global tracing subscriber
pub fn init(format: LogFormat) {
    match format {
        LogFormat::Text => {
            let fmt_layer = layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_filter(env_filter());
            registry().with(fmt_layer).init();
        }
        LogFormat::Json => {
            let fmt_layer = layer()
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_filter(env_filter());
            registry().with(fmt_layer).init();
        }
    }
}
