use std::fmt;

use kwd_core::KeywardError;

/// Errors raised by the stream, log, key store, lease and upstream clients
#[derive(Debug)]
pub enum ClientError {
    /// Could not reach the remote service
    Transport(String),
    /// Operation timed out
    Timeout,
    /// Upstream rejected the credential (401/403)
    Forbidden {
        /// HTTP status returned
        status: u16,
    },
    /// Upstream answered with a non-success status other than an auth failure
    Status {
        /// HTTP status returned
        status: u16,
        /// Truncated response body
        body: String,
    },
    /// Response could not be decoded
    InvalidResponse(String),
    /// Consumer group has not been created on the stream yet
    GroupMissing {
        /// Stream name
        stream: String,
        /// Group name
        group: String,
    },
    /// Consumer group already exists (reply to a create)
    GroupExists {
        /// Stream name
        stream: String,
        /// Group name
        group: String,
    },
    /// Key store failure
    Store(String),
    /// I/O error in a file-backed client
    IoError(std::io::Error),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(msg) => write!(f, "Transport error: {}", msg),
            Self::Timeout => write!(f, "Operation timed out"),
            Self::Forbidden { status } => write!(f, "Credential rejected (HTTP {})", status),
            Self::Status { status, body } => write!(f, "Upstream HTTP {}: {}", status, body),
            Self::InvalidResponse(msg) => write!(f, "Invalid response: {}", msg),
            Self::GroupMissing { stream, group } => {
                write!(f, "Consumer group {} missing on stream {}", group, stream)
            },
            Self::GroupExists { stream, group } => {
                write!(f, "Consumer group {} already exists on stream {}", group, stream)
            },
            Self::Store(msg) => write!(f, "Key store error: {}", msg),
            Self::IoError(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl ClientError {
    /// Returns true if the operation may succeed when repeated later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout | Self::IoError(_) => true,
            // A rejected key is retried with a different key
            Self::Forbidden { .. } => true,
            // Server-side trouble and upstream throttling
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            // InvalidResponse, GroupMissing, GroupExists, Store
            _ => false,
        }
    }

    /// Returns true if the upstream refused the credential itself.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::Forbidden { .. })
    }

    /// Maps an HTTP status to the error it represents, `None` on success.
    pub fn from_status(status: u16, body: &str) -> Option<Self> {
        match status {
            200..=299 => None,
            401 | 403 => Some(Self::Forbidden { status }),
            _ => Some(Self::Status {
                status,
                body: body.chars().take(256).collect(),
            }),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::IoError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err)
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_decode() {
            Self::InvalidResponse(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

impl From<ClientError> for KeywardError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Forbidden { status } => {
                KeywardError::InvalidCredential {
                    provider: format!("HTTP {}", status),
                }
            },
            ClientError::Status { status: 429, body } => KeywardError::RateLimited(body),
            ClientError::Transport(_) | ClientError::Timeout | ClientError::Status { .. } => {
                KeywardError::UpstreamTransient(err.to_string())
            },
            ClientError::InvalidResponse(msg) => KeywardError::MalformedInput(msg),
            ClientError::GroupMissing { stream, group } => {
                KeywardError::ConsumerGroupMissing { stream, group }
            },
            ClientError::GroupExists { .. } => KeywardError::Stream(err.to_string()),
            ClientError::Store(msg) => KeywardError::Store(msg),
            ClientError::IoError(e) => KeywardError::Io(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
