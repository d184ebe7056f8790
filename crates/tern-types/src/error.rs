//! Error types for the tern framework.
//!
//! [`TernError`] is the top-level error type; [`ChannelError`] covers
//! channel-adapter failures. Both are non-exhaustive so new variants can
//! be added without breaking downstream crates.

use thiserror::Error;

/// Top-level error type for the tern framework.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TernError {
    /// A provider returned an error (bad request, server error, ...).
    #[error("provider error: {message}")]
    Provider {
        /// Provider-supplied error message.
        message: String,
    },

    /// An operation exceeded its deadline.
    #[error("operation timed out: {operation}")]
    Timeout {
        /// Human-readable name of the operation that timed out.
        operation: String,
    },

    /// Configuration is malformed or semantically invalid.
    #[error("invalid config: {reason}")]
    ConfigInvalid {
        /// What is wrong with the configuration.
        reason: String,
    },

    /// A skill could not be loaded or parsed.
    #[error("failed to load skill: {skill}")]
    SkillLoadFailed {
        /// Name or path of the skill that failed.
        skill: String,
    },

    /// A required workspace file is missing (e.g. AGENTS.md).
    #[error("missing required workspace file: {path}")]
    MissingBootstrap {
        /// Path of the missing file.
        path: String,
    },

    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A bus/channel-layer error bubbled up.
    #[error("channel error: {0}")]
    Channel(String),
}

/// Channel-adapter error type.
///
/// Used by channel implementations to report failures in connecting,
/// authenticating, or exchanging messages.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ChannelError {
    /// Failed to establish a connection to the channel backend.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Authentication / authorization was rejected.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// Sending a message failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Receiving a message failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// The channel is not currently connected.
    #[error("not connected")]
    NotConnected,

    /// Catch-all for errors that do not fit other variants.
    #[error("{0}")]
    Other(String),
}

/// A convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, TernError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tern_error_display() {
        let err = TernError::Timeout {
            operation: "llm_call".into(),
        };
        assert_eq!(err.to_string(), "operation timed out: llm_call");
    }

    #[test]
    fn tern_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: TernError = io_err.into();
        assert!(matches!(err, TernError::Io(_)));
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn tern_error_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{{bad}}").unwrap_err();
        let err: TernError = json_err.into();
        assert!(matches!(err, TernError::Json(_)));
    }

    #[test]
    fn channel_error_display() {
        let err = ChannelError::NotConnected;
        assert_eq!(err.to_string(), "not connected");

        let err = ChannelError::AuthFailed("bad token".into());
        assert_eq!(err.to_string(), "authentication failed: bad token");
    }

    #[test]
    fn result_alias_works() {
        fn ok_fn() -> Result<i32> {
            Ok(42)
        }
        fn err_fn() -> Result<i32> {
            Err(TernError::Provider {
                message: "boom".into(),
            })
        }
        assert_eq!(ok_fn().unwrap(), 42);
        assert!(err_fn().is_err());
    }
}
