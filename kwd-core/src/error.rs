use thiserror::Error;

#[derive(Error, Debug)]
pub enum KeywardError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No key for {provider} is available for this server ({identity})")]
    NoKeyAvailable { provider: String, identity: String },

    #[error("Credential rejected by upstream for {provider}")]
    InvalidCredential { provider: String },

    #[error("Upstream transient failure: {0}")]
    UpstreamTransient(String),

    #[error("Malformed input: {0}")]
    MalformedInput(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Consumer group {group} missing on stream {stream}")]
    ConsumerGroupMissing { stream: String, group: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Key store error: {0}")]
    Store(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl KeywardError {
    /// True for failures the pipeline answers with a requeue rather than a drop.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::InvalidCredential { .. } | Self::UpstreamTransient(_) | Self::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, KeywardError>;
