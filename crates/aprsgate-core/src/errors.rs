use std::path::PathBuf;

/// Core error type for the gateway.
///
/// Adapter crates should map their specific errors into this type so the bot
/// core can handle failures consistently (user-facing message vs drop-and-log).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    /// Bad user input (callsign, SSID, icon, interval, comment, coordinates).
    #[error("invalid input: {0}")]
    Validation(String),

    /// APRS-IS socket or login failure.
    #[error("connection error: {0}")]
    Connection(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("store error: {path}: {reason}")]
    Store { path: PathBuf, reason: String },

    #[error("external error: {0}")]
    External(String),
}

pub type Result<T> = std::result::Result<T, Error>;
