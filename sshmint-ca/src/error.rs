//! Error types for the certificate-authority client.

use sshmint_core::PublishError;

#[derive(Debug, thiserror::Error)]
pub enum CaError {
    #[error("request timed out")]
    Timeout,

    #[error("authority unreachable: {0}")]
    Unreachable(String),

    /// 4xx: the authority looked at the request and said no.
    #[error("authority refused request ({status}): {body}")]
    Refused { status: u16, body: String },

    /// 5xx or 429: the authority could not deal with the request right now.
    #[error("authority unavailable ({status}): {body}")]
    Unavailable { status: u16, body: String },

    #[error("malformed authority response: {0}")]
    Malformed(String),

    #[error("HTTP error: {0}")]
    Http(reqwest::Error),
}

impl From<reqwest::Error> for CaError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_connect() {
            Self::Unreachable(err.to_string())
        } else if err.is_decode() {
            Self::Malformed(err.to_string())
        } else {
            Self::Http(err)
        }
    }
}

impl From<CaError> for PublishError {
    fn from(err: CaError) -> Self {
        match err {
            CaError::Timeout => Self::Timeout,
            CaError::Unreachable(_) | CaError::Unavailable { .. } => Self::Unavailable(err.to_string()),
            CaError::Refused { .. } | CaError::Malformed(_) => Self::Rejected(err.to_string()),
            CaError::Http(_) => Self::Other(anyhow::anyhow!("{err}")),
        }
    }
}
