//! Configuration error types

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    /// `origin` is the file path, or `<inline>` for parsed strings.
    #[error("Failed to parse TOML config at {origin}: {source}")]
    ParseError {
        origin: String,
        source: toml::de::Error,
    },

    #[error("Failed to render configuration: {0}")]
    SerializeError(String),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("XDG directory error: {0}")]
    XdgError(String),
}
