//! Agent client used by the publisher.

use std::path::Path;
use std::time::Duration;

use ssh_agent_lib::agent::Session;
use ssh_agent_lib::client::Client;
use ssh_agent_lib::error::AgentError;
use ssh_agent_lib::proto::{AddIdentity, AddIdentityConstrained, KeyConstraint, Credential as PrivateCredential};
use ssh_key::{HashAlg, PrivateKey};
use sshmint_core::{AgentRegistrar, PublishError, Registration};
use tokio::net::UnixStream;
use tracing::debug;

/// Registers keys with the agent behind a Unix socket.
///
/// Opens a fresh connection per call; nothing is cached between sessions.
#[derive(Debug, Clone, Copy, Default)]
pub struct SocketAgent;

impl SocketAgent {
    pub fn new() -> Self {
        Self
    }
}

/// Transport failures are worth retrying; anything the agent answered is a
/// refusal.
fn classify(context: &str, err: AgentError) -> PublishError {
    match err {
        AgentError::IO(e) => PublishError::Unavailable(format!("{context}: {e}")),
        other => PublishError::Rejected(format!("{context}: {other}")),
    }
}

#[async_trait::async_trait]
impl AgentRegistrar for SocketAgent {
    async fn register(
        &self,
        socket: &Path,
        key: &PrivateKey,
        lifetime: Option<Duration>,
    ) -> Result<Registration, PublishError> {
        let stream = UnixStream::connect(socket).await.map_err(|e| {
            PublishError::Unavailable(format!("connect to agent at {}: {e}", socket.display()))
        })?;
        let mut client = Client::new(stream);
        let fingerprint = key.fingerprint(HashAlg::Sha256).to_string();

        let loaded = client
            .request_identities()
            .await
            .map_err(|e| classify("list identities", e))?;
        if loaded.iter().any(|id| &id.pubkey == key.public_key().key_data()) {
            debug!(fingerprint = %fingerprint, "agent already holds key");
            return Ok(Registration::AlreadyRegistered(fingerprint));
        }

        let identity = AddIdentity {
            credential: PrivateCredential::Key {
                privkey: key.key_data().clone(),
                comment: key.comment().to_string(),
            },
        };
        match lifetime {
            None => client.add_identity(identity).await,
            Some(lifetime) => {
                let secs = u32::try_from(lifetime.as_secs()).unwrap_or(u32::MAX);
                client
                    .add_identity_constrained(AddIdentityConstrained {
                        identity,
                        constraints: vec![KeyConstraint::Lifetime(secs)],
                    })
                    .await
            }
        }
        .map_err(|e| classify("add identity", e))?;

        debug!(fingerprint = %fingerprint, lifetime = ?lifetime, "key added to agent");
        Ok(Registration::Added(fingerprint))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use rand_core::OsRng;
    use ssh_agent_lib::agent::listen;
    use ssh_agent_lib::proto::Identity;
    use ssh_key::Algorithm;
    use ssh_key::public::KeyData;
    use tokio::net::UnixListener;

    use super::*;

    #[derive(Debug, Clone)]
    struct Loaded {
        pubkey: KeyData,
        comment: String,
        lifetime: Option<u32>,
    }

    /// Minimal in-process agent that records what it is given.
    #[derive(Debug, Clone, Default)]
    struct RecordingAgent {
        keys: Arc<Mutex<Vec<Loaded>>>,
        refuse: bool,
    }

    impl RecordingAgent {
        fn load(&self, identity: AddIdentity, lifetime: Option<u32>) -> Result<(), AgentError> {
            if self.refuse {
                return Err(AgentError::Failure);
            }
            let PrivateCredential::Key { privkey, comment } = identity.credential else {
                return Err(AgentError::Failure);
            };
            let pubkey = KeyData::try_from(&privkey).map_err(|_| AgentError::Failure)?;
            self.keys.lock().unwrap().push(Loaded {
                pubkey,
                comment,
                lifetime,
            });
            Ok(())
        }
    }

    #[ssh_agent_lib::async_trait]
    impl Session for RecordingAgent {
        async fn request_identities(&mut self) -> Result<Vec<Identity>, AgentError> {
            Ok(self
                .keys
                .lock()
                .unwrap()
                .iter()
                .map(|k| Identity {
                    pubkey: k.pubkey.clone(),
                    comment: k.comment.clone(),
                })
                .collect())
        }

        async fn add_identity(&mut self, identity: AddIdentity) -> Result<(), AgentError> {
            self.load(identity, None)
        }

        async fn add_identity_constrained(
            &mut self,
            request: AddIdentityConstrained,
        ) -> Result<(), AgentError> {
            let lifetime = request.constraints.iter().find_map(|c| match c {
                KeyConstraint::Lifetime(secs) => Some(*secs),
                _ => None,
            });
            self.load(request.identity, lifetime)
        }
    }

    fn spawn_agent(dir: &Path, agent: RecordingAgent) -> std::path::PathBuf {
        let socket = dir.join("agent.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        tokio::spawn(async move {
            let _ = listen(listener, agent).await;
        });
        socket
    }

    fn key(comment: &str) -> PrivateKey {
        let mut key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        key.set_comment(comment);
        key
    }

    #[tokio::test]
    async fn adds_then_reports_already_registered() {
        let tmp = tempfile::tempdir().unwrap();
        let agent = RecordingAgent::default();
        let socket = spawn_agent(tmp.path(), agent.clone());
        let key = key("sshmint:alice@sshd");

        let first = SocketAgent::new().register(&socket, &key, None).await.unwrap();
        let fingerprint = key.fingerprint(HashAlg::Sha256).to_string();
        assert_eq!(first, Registration::Added(fingerprint.clone()));

        let second = SocketAgent::new().register(&socket, &key, None).await.unwrap();
        assert_eq!(second, Registration::AlreadyRegistered(fingerprint));

        let keys = agent.keys.lock().unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].comment, "sshmint:alice@sshd");
        assert_eq!(keys[0].lifetime, None);
    }

    #[tokio::test]
    async fn lifetime_becomes_an_agent_constraint() {
        let tmp = tempfile::tempdir().unwrap();
        let agent = RecordingAgent::default();
        let socket = spawn_agent(tmp.path(), agent.clone());

        SocketAgent::new()
            .register(&socket, &key("k"), Some(Duration::from_secs(3600)))
            .await
            .unwrap();
        assert_eq!(agent.keys.lock().unwrap()[0].lifetime, Some(3600));
    }

    #[tokio::test]
    async fn missing_socket_is_unavailable() {
        let tmp = tempfile::tempdir().unwrap();
        let err = SocketAgent::new()
            .register(&tmp.path().join("nope.sock"), &key("k"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Unavailable(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn refusal_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let agent = RecordingAgent {
            refuse: true,
            ..RecordingAgent::default()
        };
        let socket = spawn_agent(tmp.path(), agent);
        let err = SocketAgent::new()
            .register(&socket, &key("k"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Rejected(_)));
    }
}
