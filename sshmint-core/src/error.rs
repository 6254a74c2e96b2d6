//! Error types for the session-open pipeline.
//!
//! Each stage owns its own error enum.  [`SessionError`] gathers them so the
//! boundary can pick a PAM status in one place; the detail only ever reaches
//! the log, never the C caller.

use crate::hooks::PamStatus;
use crate::config::Policy;

/// The PAM argument vector could not be copied.
#[derive(Debug, thiserror::Error)]
pub enum InputError {
    #[error("invalid argument vector: {0}")]
    InvalidArguments(String),

    #[error("null PAM handle")]
    NullHandle,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("malformed module argument: {0:?}")]
    MalformedToken(String),

    #[error("unknown module argument {0:?} (strict mode)")]
    UnknownKey(String),

    #[error("invalid key algorithm: {0:?}")]
    InvalidAlgorithm(String),

    #[error("invalid key size {size:?} for {algorithm}")]
    InvalidKeySize { algorithm: &'static str, size: String },

    #[error("invalid destination kind: {0:?}")]
    InvalidDestination(String),

    #[error("no destination configured for {0} publishing")]
    MissingDestination(&'static str),

    #[error("invalid key lifetime: {0:?}")]
    InvalidLifetime(String),

    #[error("invalid publish timeout: {0:?}")]
    InvalidTimeout(String),

    #[error("invalid failure policy: {0:?}")]
    InvalidPolicy(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("no authenticated user on the PAM handle")]
    NoAuthenticatedUser,

    #[error("user {0:?} not found in the user database")]
    UnknownUser(String),

    #[error("username {0:?} cannot be used in a destination path")]
    UnsafeUsername(String),

    #[error("user database lookup failed: {0}")]
    Lookup(String),
}

#[derive(Debug, thiserror::Error)]
pub enum IssuanceError {
    #[error("secure random source unavailable: {0}")]
    EntropyUnavailable(String),

    #[error("key generation failed: {0}")]
    Generation(#[from] ssh_key::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// The destination did not answer (or release its lock) in time.
    #[error("publish timed out")]
    Timeout,

    /// The destination could not be reached; worth trying on the next login.
    #[error("destination unavailable: {0}")]
    Unavailable(String),

    /// The destination refused the credential.
    #[error("destination rejected credential: {0}")]
    Rejected(String),

    /// Writing here as root would follow a path the user controls.
    #[error("refusing to write under {path}: {reason}")]
    UnsafePath { path: String, reason: &'static str },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl PublishError {
    pub fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }

    /// Whether the same request could succeed on a later login.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Unavailable(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Input(#[from] InputError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Issuance(#[from] IssuanceError),

    #[error(transparent)]
    Publish(#[from] PublishError),
}

impl SessionError {
    /// Map the error onto the status returned to PAM.
    ///
    /// Input, configuration and identity failures always fail the session.
    /// Issuance and publish failures are forgiven under [`Policy::Lenient`]:
    /// the login proceeds without a fresh credential.
    pub fn status(&self, policy: Policy) -> PamStatus {
        match (self, policy) {
            (Self::Input(_) | Self::Config(_), _) => PamStatus::ServiceErr,
            (Self::Context(_), _) => PamStatus::UserUnknown,
            (Self::Issuance(_) | Self::Publish(_), Policy::Lenient) => PamStatus::Success,
            (Self::Issuance(_), Policy::Strict) => PamStatus::SystemErr,
            (Self::Publish(_), Policy::Strict) => PamStatus::SessionErr,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_fail_under_both_policies() {
        let err = SessionError::from(ConfigError::MissingDestination("file"));
        assert_eq!(err.status(Policy::Strict), PamStatus::ServiceErr);
        assert_eq!(err.status(Policy::Lenient), PamStatus::ServiceErr);
    }

    #[test]
    fn missing_user_fails_under_both_policies() {
        let err = SessionError::from(ContextError::NoAuthenticatedUser);
        assert_eq!(err.status(Policy::Strict), PamStatus::UserUnknown);
        assert_eq!(err.status(Policy::Lenient), PamStatus::UserUnknown);
    }

    #[test]
    fn publish_timeout_is_forgiven_when_lenient() {
        let err = SessionError::from(PublishError::Timeout);
        assert_eq!(err.status(Policy::Strict), PamStatus::SessionErr);
        assert_eq!(err.status(Policy::Lenient), PamStatus::Success);
    }

    #[test]
    fn entropy_failure_is_a_system_error() {
        let err = SessionError::from(IssuanceError::EntropyUnavailable("getrandom".into()));
        assert_eq!(err.status(Policy::Strict), PamStatus::SystemErr);
    }

    #[test]
    fn retryable_classification() {
        assert!(PublishError::Timeout.is_retryable());
        assert!(PublishError::Unavailable("refused".into()).is_retryable());
        assert!(!PublishError::Rejected("no".into()).is_retryable());
        let unsafe_path = PublishError::UnsafePath {
            path: "/home/a/.ssh".into(),
            reason: "symlink under the user's control",
        };
        assert!(!unsafe_path.is_retryable());
    }
}
