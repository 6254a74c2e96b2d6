//! ssh-agent destination for sshmint.
//!
//! Loads a freshly issued key into the agent listening on a Unix socket,
//! speaking the standard OpenSSH agent protocol through `ssh_agent_lib`.
//!
//! ```text
//! pipeline ── publish() ── AgentRegistrar ──► SocketAgent
//!                                                 │
//!                                           UnixStream (per call)
//!                                                 │
//!                                   request_identities / add_identity
//! ```
//!
//! A key the agent already holds is reported as already registered rather
//! than added twice.  A configured lifetime becomes the agent's own
//! lifetime constraint, so the agent forgets the key without help from us.

pub mod client;

pub use client::SocketAgent;
