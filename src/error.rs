//! Error types for the voice gateway

use thiserror::Error;

/// Result type alias for voice gateway operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the voice gateway
#[derive(Debug, Error)]
pub enum Error {
    /// Bad or missing backend configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Backend connection lost or refused
    #[error("transport error: {0}")]
    Transport(String),

    /// A stage exceeded its deadline
    #[error("{stage} timed out after {elapsed_ms}ms")]
    Timeout {
        /// Stage that timed out ("recognition", "generation", ...)
        stage: &'static str,
        /// Deadline that was exceeded
        elapsed_ms: u64,
    },

    /// Utterance buffer exceeded its capacity
    #[error("utterance buffer overflow: {buffered_ms}ms buffered exceeds capacity")]
    Overflow {
        /// Audio held when the overflow happened
        buffered_ms: u64,
    },

    /// Explicit cancellation
    #[error("operation cancelled")]
    Cancelled,

    /// Authentication rejected
    #[error("auth error: {0}")]
    Auth(String),

    /// Session lifecycle violation
    #[error("session error: {0}")]
    Session(String),

    /// Language model produced an unusable response
    #[error("generation error: {0}")]
    Generation(String),

    /// Audio decoding error
    #[error("audio error: {0}")]
    Audio(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Coarse classification used for retry and propagation decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Fatal to session setup
    Config,
    /// Terminal for the current utterance, session survives
    Transport,
    /// Terminal for the current stage only
    Timeout,
    /// Terminal for the current utterance
    Overflow,
    /// Always terminal, never retried
    Cancelled,
    /// Anything else
    Other,
}

impl Error {
    /// Map this error onto the gateway's error taxonomy
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) | Self::Toml(_) => ErrorKind::Config,
            Self::Transport(_) | Self::Http(_) | Self::Io(_) => ErrorKind::Transport,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Overflow { .. } => ErrorKind::Overflow,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Auth(_)
            | Self::Session(_)
            | Self::Generation(_)
            | Self::Audio(_)
            | Self::Serialization(_) => ErrorKind::Other,
        }
    }

    /// Whether a generation failure of this kind may use the single-shot fallback
    #[must_use]
    pub const fn allows_fallback(&self) -> bool {
        !matches!(self.kind(), ErrorKind::Cancelled | ErrorKind::Config)
    }

    /// Build a transport error from anything displayable
    pub fn transport(e: impl std::fmt::Display) -> Self {
        Self::Transport(e.to_string())
    }
}
