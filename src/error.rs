//! Adapter error taxonomy

use thiserror::Error;

/// Errors surfaced by the adapter to the hosting layer
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Signature mismatch. The request body is never looked at.
    #[error("Signature verification failed: {0}")]
    Authentication(String),

    /// Bad key, bad padding, app id mismatch or tampered payload
    #[error("Failed to decrypt message: {0}")]
    Decryption(String),

    /// The outer envelope could not be read at all
    #[error("Failed to parse message: {0}")]
    Parse(String),

    /// The reply could not be rendered or encrypted
    #[error("Failed to build reply: {0}")]
    Reply(String),

    /// Missing or invalid settings, or a missing capability
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An outbound API call failed
    #[error("Failed to deliver {msg_type} message to {open_id}: {source}")]
    Delivery {
        open_id: String,
        msg_type: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// The bot callback failed and no turn error handler was registered
    #[error("Bot turn failed: {0}")]
    Turn(#[source] anyhow::Error),

    /// Delivery was stopped by the caller's cancellation token
    #[error("Delivery cancelled")]
    Cancelled,
}

/// Result type for adapter operations
pub type Result<T> = std::result::Result<T, AdapterError>;
