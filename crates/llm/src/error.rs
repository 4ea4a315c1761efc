use thiserror::Error;

pub type Result<T> = std::result::Result<T, LlmError>;

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("LLM is not configured: {0}")]
    NotConfigured(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Server error ({status}): {message}")]
    ServerError { status: u16, message: String },

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Completion cut off at the output token limit: {0}")]
    Truncated(String),

    #[error("Failed to parse response: {0}")]
    ParseError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl LlmError {
    pub(crate) fn from_status(status: u16, body: &str) -> Self {
        match status {
            401 | 403 => Self::AuthenticationFailed(body.to_string()),
            429 => Self::RateLimited(body.to_string()),
            500..=599 => Self::ServerError {
                status,
                message: body.to_string(),
            },
            _ => Self::Other(format!("HTTP {status}: {body}")),
        }
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        Self::NetworkError(err.to_string())
    }
}
