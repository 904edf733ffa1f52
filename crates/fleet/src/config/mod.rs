use core::error::Error;

pub mod cli;
pub mod clusters;
pub mod daemon;

pub use cli::*;
pub use clusters::load_clusters_file;
pub use daemon::*;

/// Configuration loading errors
#[derive(Debug, derive_more::Display)]
pub enum ConfigError {
    #[display("Failed to read clusters file {path}")]
    ReadFailed { path: String },
    #[display("Failed to parse clusters file {path}")]
    ParseFailed { path: String },
    #[display("Invalid configuration: {message}")]
    Invalid { message: String },
}

impl Error for ConfigError {}
