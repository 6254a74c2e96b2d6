//! Destinations that live outside this crate.
//!
//! The file publisher is built in.  Agent registration and certificate
//! signing are reached through these traits so that the boundary crate can
//! plug in the real network clients while tests plug in fakes.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ssh_key::PrivateKey;

use crate::credential::CertificateRequest;
use crate::error::PublishError;

/// Outcome of handing a key to an ssh-agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    /// The key was added; carries its fingerprint.
    Added(String),
    /// The agent already held this key; carries its fingerprint.
    AlreadyRegistered(String),
}

#[async_trait::async_trait]
pub trait AgentRegistrar: Send + Sync {
    /// Load `key` into the agent listening on `socket`.
    ///
    /// With a `lifetime` the agent is asked to forget the key once it
    /// elapses.  Registering a key the agent already holds is not an error.
    async fn register(
        &self,
        socket: &Path,
        key: &PrivateKey,
        lifetime: Option<Duration>,
    ) -> Result<Registration, PublishError>;
}

/// A certificate returned by the authority, OpenSSH encoded.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct SignedCertificate {
    pub certificate: String,
}

#[async_trait::async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// Submit `request` to `endpoint`.
    ///
    /// Implementations must give up after `timeout` with
    /// [`PublishError::Timeout`], and report an explicit refusal as
    /// [`PublishError::Rejected`].
    async fn submit(
        &self,
        endpoint: &str,
        request: &CertificateRequest,
        timeout: Duration,
    ) -> Result<SignedCertificate, PublishError>;
}

/// The external destinations available to the publisher.
#[derive(Clone, Default)]
pub struct Providers {
    pub agent: Option<Arc<dyn AgentRegistrar>>,
    pub authority: Option<Arc<dyn CertificateAuthority>>,
}

impl Providers {
    pub fn with_agent(mut self, agent: Arc<dyn AgentRegistrar>) -> Self {
        self.agent = Some(agent);
        self
    }

    pub fn with_authority(mut self, authority: Arc<dyn CertificateAuthority>) -> Self {
        self.authority = Some(authority);
        self
    }
}

impl std::fmt::Debug for Providers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Providers")
            .field("agent", &self.agent.is_some())
            .field("authority", &self.authority.is_some())
            .finish()
    }
}
