//! Error types for the health ML engine

use thiserror::Error;

/// Errors that can occur while processing a message or bootstrapping the engine
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid JSON: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Message body is not a JSON object")]
    NotAnObject,

    #[error("History I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt history log at line {line}: {reason}")]
    CorruptLog { line: usize, reason: String },

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Training error: {0}")]
    Training(String),

    #[error("Publish error: {0}")]
    Publish(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Connection error: {0}")]
    Connection(String),
}
