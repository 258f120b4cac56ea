//! Error types for elohim-link

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid payload on {channel}: {reason}")]
    InvalidPayload { channel: String, reason: String },

    #[error("Unknown stage tag on {channel}: {tag}")]
    UnknownStage { channel: String, tag: String },

    #[error("Unknown operation kind: {0}")]
    UnknownOperation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}
