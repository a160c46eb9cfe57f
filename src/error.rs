//! Airdock error types

use thiserror::Error;

/// Airdock error type
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Git command or stash protocol error
    #[error("Git error: {0}")]
    Git(String),

    /// Agent engine error
    #[error("Engine error: {0}")]
    Engine(String),

    /// Session persistence error
    #[error("Session error: {0}")]
    Session(String),

    /// Upload parsing or storage error
    #[error("Upload error: {0}")]
    Upload(String),

    /// Broker lifecycle error
    #[error("Broker error: {0}")]
    Broker(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
}

/// Result type alias for Airdock operations
pub type Result<T> = std::result::Result<T, Error>;

/// Current time as Unix epoch milliseconds.
///
/// Every outbound event and conversation entry is stamped with this.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
