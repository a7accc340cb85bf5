//! Error types for the vox-bridge voice session

use thiserror::Error;

/// Result type alias for vox-bridge operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the voice bridge
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error (missing or invalid fields at startup)
    #[error("configuration error: {0}")]
    Config(String),

    /// Speech-to-text error
    #[error("STT error: {0}")]
    Stt(String),

    /// Text-to-speech error
    #[error("TTS error: {0}")]
    Tts(String),

    /// Chat gateway error (non-2xx response, empty reply, malformed stream)
    #[error("chat error: {0}")]
    Chat(String),

    /// Stream aborted by interruption or the outer deadline
    #[error("cancelled")]
    Cancelled,

    /// Voice transport error (connection never ready, disconnects)
    #[error("voice error: {0}")]
    Voice(String),

    /// Opus frame decode error
    #[error("decode error: {0}")]
    Decode(String),

    /// Baked phrase store corruption (manifest or file unreadable)
    #[error("baked store error: {0}")]
    BakedStore(String),

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

impl Error {
    /// Whether this error came from an interrupt or deadline, as opposed
    /// to a real failure. Cancellations are logged at debug level and
    /// never retried.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Http(e) => e.is_timeout(),
            _ => false,
        }
    }
}
