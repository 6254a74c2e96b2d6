//! Core of `pam_sshmint`: mint a fresh SSH credential when a PAM session
//! opens and deliver it to an `authorized_keys` file, an ssh-agent or a
//! certificate authority.
//!
//! Everything here is independent of libpam.  The boundary crate supplies a
//! [`SessionSource`] over the real handle and the network providers; tests
//! supply fakes.

pub mod args;
pub mod config;
pub mod context;
pub mod credential;
pub mod error;
pub mod hooks;
pub mod issue;
pub mod logging;
pub mod pipeline;
pub mod provider;
pub mod publish;
pub mod user;

pub use config::{DestinationKind, KeyAlgorithm, ModuleConfig, Policy};
pub use context::{SessionContext, SessionSource};
pub use credential::{CertificateRequest, IssuedCredential};
pub use error::{ConfigError, ContextError, InputError, IssuanceError, PublishError, SessionError};
pub use hooks::{PamStatus, RawInvocation, SessionHooks};
pub use provider::{AgentRegistrar, CertificateAuthority, Providers, Registration, SignedCertificate};
pub use publish::{PublishOutcome, PublishResult};
