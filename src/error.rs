//! Error types for the mirror.
//!
//! Only `ConfigError` and a failed ledger load abort a run. Everything else is
//! scoped to a single channel, message or post and gets logged by the pipeline.

use std::path::PathBuf;

/// Configuration-related errors. Fatal, raised before any run starts.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Fetching one source channel failed. The channel is skipped for this run.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Discord API error ({status}) for channel {channel_id}: {body}")]
    Api {
        channel_id: String,
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("Unexpected response for channel {channel_id}: {reason}")]
    Decode { channel_id: String, reason: String },
}

/// A single source message could not be turned into a typed message.
#[derive(Debug, thiserror::Error)]
pub enum NormalizeError {
    #[error("Malformed message in channel {channel_id}: {reason}")]
    MalformedMessage { channel_id: String, reason: String },
}

/// Posting one unit to the destination failed.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Telegram request failed: {0}")]
    Telegram(#[from] teloxide::RequestError),

    #[error("Invalid media URL {url}: {reason}")]
    InvalidMedia { url: String, reason: String },

    #[error("Nothing to send")]
    Empty,
}

impl DeliveryError {
    /// Telegram answered and refused the request, or it was never valid.
    /// Sending it again won't help, unlike a network error or a rate limit.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            DeliveryError::InvalidMedia { .. }
                | DeliveryError::Empty
                | DeliveryError::Telegram(teloxide::RequestError::Api(_))
        )
    }
}

/// Ledger storage errors. Fatal on load, logged on write.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Ledger at {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Ledger IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Ledger database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}
