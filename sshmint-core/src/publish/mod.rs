//! Delivery of an issued credential to its destination.
//!
//! [`publish`] consumes the credential: whatever the outcome, the private key
//! is dropped (and zeroized) before it returns.  Identity and certificate
//! files are staged and only renamed into place once the destination has
//! accepted the key, so a failed or timed-out publish leaves none of them.

pub mod file;

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use ssh_key::Certificate;
use tracing::{info, warn};

use crate::config::{DestinationKind, ModuleConfig};
use crate::context::{SessionContext, needs_account, parent_dir};
use crate::credential::IssuedCredential;
use crate::error::{ContextError, PublishError};
use crate::provider::{Providers, Registration};
use crate::user::{UserAccount, effective_uid};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Published,
    /// The destination already held this key; nothing was written.
    AlreadyRegistered,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishResult {
    /// Where the credential went: a path, an agent fingerprint, a key id.
    pub reference: String,
    pub outcome: PublishOutcome,
}

/// Where a credential is delivered, with templates already expanded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    AuthorizedKeys(PathBuf),
    Agent(PathBuf),
    Authority(String),
}

/// Everything [`publish`] needs besides the credential.
#[derive(Debug, Clone)]
pub struct PublishPlan {
    pub target: Target,
    pub identity: Option<PathBuf>,
    pub certificate: Option<PathBuf>,
    /// Account that should own written files.  Only set when running as
    /// root; otherwise files simply belong to the caller.
    pub owner: Option<UserAccount>,
    pub lifetime: Option<Duration>,
    pub timeout: Duration,
    /// Whether earlier `authorized_keys` lines with this credential's comment
    /// are replaced.  Only safe when the comment names the user.
    pub replace_previous: bool,
}

impl PublishPlan {
    /// Expand the configured destinations for this session.
    pub fn new(
        config: &ModuleConfig,
        ctx: &SessionContext,
        account: Option<&UserAccount>,
    ) -> Result<Self, ContextError> {
        let target = match config.destination {
            DestinationKind::File => Target::AuthorizedKeys(ctx.expand(&config.locator, account)?),
            DestinationKind::Agent => Target::Agent(ctx.expand(&config.locator, account)?),
            DestinationKind::CaRequest => Target::Authority(config.locator.clone()),
        };
        let expand = |template: &Option<String>| {
            template
                .as_deref()
                .map(|t| ctx.expand(t, account))
                .transpose()
        };
        let owner = if effective_uid() == 0 { account.cloned() } else { None };

        Ok(Self {
            target,
            identity: expand(&config.identity)?,
            certificate: expand(&config.certificate)?,
            owner,
            lifetime: config.max_lifetime,
            timeout: config.timeout,
            replace_previous: config.comment.as_deref().is_none_or(|c| c.contains("%u")),
        })
    }

    /// Whether building this plan for `config` requires a user database hit.
    pub fn needs_account(config: &ModuleConfig) -> bool {
        let templates = [Some(&config.locator), config.identity.as_ref(), config.certificate.as_ref()];
        effective_uid() == 0 || templates.into_iter().flatten().any(|t| needs_account(t))
    }
}

/// Deliver `credential` according to `plan`, bounded by `plan.timeout`.
pub async fn publish(
    credential: IssuedCredential,
    plan: &PublishPlan,
    providers: &Providers,
) -> Result<PublishResult, PublishError> {
    let result = match tokio::time::timeout(plan.timeout, dispatch(&credential, plan, providers)).await {
        Ok(result) => result,
        Err(_) => Err(PublishError::Timeout),
    };
    drop(credential);

    match &result {
        Ok(published) => info!(
            reference = %published.reference,
            outcome = ?published.outcome,
            "credential published"
        ),
        Err(e) => warn!(error = %e, retryable = e.is_retryable(), "publish failed"),
    }
    result
}

async fn dispatch(
    credential: &IssuedCredential,
    plan: &PublishPlan,
    providers: &Providers,
) -> Result<PublishResult, PublishError> {
    match &plan.target {
        Target::AuthorizedKeys(path) => {
            // Runs to completion inside a single poll, so an expiring
            // timeout never interrupts a write half way.
            let deadline = Instant::now() + plan.timeout;
            let staged = match &plan.identity {
                Some(identity) => stage_identity(credential, identity, plan.owner.as_ref())?,
                None => Vec::new(),
            };
            let line = credential.authorized_key_line().map_err(|e| PublishError::Other(e.into()))?;
            let replace = plan.replace_previous.then_some(credential.comment.as_str());
            let outcome = file::install_authorized_key(
                path,
                &line,
                &credential.public_key,
                replace,
                plan.owner.as_ref(),
                deadline,
            )?;
            commit_all(staged)?;
            Ok(PublishResult {
                reference: path.display().to_string(),
                outcome,
            })
        }
        Target::Agent(socket) => {
            let agent = providers
                .agent
                .as_ref()
                .ok_or_else(|| PublishError::Unavailable("no ssh-agent client available".into()))?;
            let key = credential
                .private_key()
                .ok_or_else(|| anyhow!("private key already discarded"))?;
            Ok(match agent.register(socket, key, plan.lifetime).await? {
                Registration::Added(fingerprint) => PublishResult {
                    reference: fingerprint,
                    outcome: PublishOutcome::Published,
                },
                Registration::AlreadyRegistered(fingerprint) => PublishResult {
                    reference: fingerprint,
                    outcome: PublishOutcome::AlreadyRegistered,
                },
            })
        }
        Target::Authority(endpoint) => {
            let authority = providers
                .authority
                .as_ref()
                .ok_or_else(|| PublishError::Unavailable("no certificate authority client available".into()))?;
            let request = credential
                .ca_request
                .as_ref()
                .ok_or_else(|| anyhow!("credential was issued without a certificate request"))?;

            let signed = authority.submit(endpoint, request, plan.timeout).await?;
            let certificate = Certificate::from_openssh(signed.certificate.trim())
                .map_err(|e| PublishError::Rejected(format!("unparseable certificate: {e}")))?;
            if certificate.public_key() != credential.public_key.key_data() {
                return Err(PublishError::Rejected(
                    "certificate does not certify the submitted key".into(),
                ));
            }

            let mut staged = match &plan.identity {
                Some(identity) => stage_identity(credential, identity, plan.owner.as_ref())?,
                None => Vec::new(),
            };
            match &plan.certificate {
                Some(path) => {
                    let text = format!("{}\n", signed.certificate.trim());
                    file::ensure_dir(parent_dir(path), plan.owner.as_ref())?;
                    staged.push(file::Staged::new(path, text.as_bytes(), plan.owner.as_ref())?);
                }
                None => warn!("certificate issued but no cert path configured; discarding it"),
            }
            commit_all(staged)?;
            Ok(PublishResult {
                reference: certificate.key_id().to_string(),
                outcome: PublishOutcome::Published,
            })
        }
    }
}

/// Stage the private key for `path` and the public key for `path.pub`.
fn stage_identity(
    credential: &IssuedCredential,
    path: &Path,
    owner: Option<&UserAccount>,
) -> Result<Vec<file::Staged>, PublishError> {
    let pem = credential
        .private_key_openssh()
        .map_err(|e| PublishError::Other(e.into()))?
        .ok_or_else(|| anyhow!("private key already discarded"))?;
    let public = credential
        .public_key_openssh()
        .map_err(|e| PublishError::Other(e.into()))?;

    file::ensure_dir(parent_dir(path), owner)?;
    Ok(vec![
        file::Staged::new(&file::sibling(path, ".pub"), format!("{public}\n").as_bytes(), owner)?,
        file::Staged::new(path, pem.as_bytes(), owner)?,
    ])
}

fn commit_all(staged: Vec<file::Staged>) -> Result<(), PublishError> {
    staged.into_iter().try_for_each(file::Staged::commit)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use rand_core::OsRng;
    use ssh_key::certificate::{Builder, CertType};
    use ssh_key::{Algorithm, AuthorizedKeys, PrivateKey};

    use super::*;
    use crate::config::resolve;
    use crate::context::{StaticSession, extract};
    use crate::credential::CertificateRequest;
    use crate::issue::issue;
    use crate::provider::{AgentRegistrar, CertificateAuthority, SignedCertificate};

    fn setup(tokens: &[String]) -> (IssuedCredential, PublishPlan) {
        let config = resolve(tokens).unwrap();
        let ctx = extract(&StaticSession::for_user("alice")).unwrap();
        let credential = issue(&config, &ctx).unwrap();
        let mut plan = PublishPlan::new(&config, &ctx, None).unwrap();
        plan.owner = None;
        (credential, plan)
    }

    /// Remembers every fingerprint it has been given.
    #[derive(Default)]
    struct FakeAgent {
        loaded: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl AgentRegistrar for FakeAgent {
        async fn register(
            &self,
            _socket: &Path,
            key: &PrivateKey,
            _lifetime: Option<Duration>,
        ) -> Result<Registration, PublishError> {
            let fingerprint = key.fingerprint(ssh_key::HashAlg::Sha256).to_string();
            let mut loaded = self.loaded.lock().unwrap();
            if loaded.contains(&fingerprint) {
                return Ok(Registration::AlreadyRegistered(fingerprint));
            }
            loaded.push(fingerprint.clone());
            Ok(Registration::Added(fingerprint))
        }
    }

    /// Signs every request with a throwaway CA key.
    struct FakeAuthority {
        ca: PrivateKey,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl CertificateAuthority for FakeAuthority {
        async fn submit(
            &self,
            _endpoint: &str,
            request: &CertificateRequest,
            _timeout: Duration,
        ) -> Result<SignedCertificate, PublishError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let subject = ssh_key::PublicKey::from_openssh(&request.public_key).unwrap();
            let mut builder = Builder::new_with_random_nonce(
                &mut OsRng,
                subject.key_data().clone(),
                0,
                u64::MAX,
            )
            .unwrap();
            builder.cert_type(CertType::User).unwrap();
            builder.key_id(format!("sshmint-{}", request.username)).unwrap();
            builder.valid_principal(&request.username).unwrap();
            let cert = builder.sign(&self.ca).unwrap();
            Ok(SignedCertificate {
                certificate: cert.to_openssh().unwrap(),
            })
        }
    }

    /// Never answers.
    struct SilentAuthority;

    #[async_trait::async_trait]
    impl CertificateAuthority for SilentAuthority {
        async fn submit(
            &self,
            _endpoint: &str,
            _request: &CertificateRequest,
            _timeout: Duration,
        ) -> Result<SignedCertificate, PublishError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn file_destination_with_identity() {
        let tmp = tempfile::tempdir().unwrap();
        let keys = tmp.path().join("keys").join("%u");
        let identity = tmp.path().join("id").join("id_ed25519");
        let (credential, plan) = setup(&[
            format!("path={}", keys.display()),
            format!("identity={}", identity.display()),
        ]);
        let fingerprint = credential.fingerprint.clone();

        let result = publish(credential, &plan, &Providers::default()).await.unwrap();
        assert_eq!(result.outcome, PublishOutcome::Published);

        let written = tmp.path().join("keys").join("alice");
        assert_eq!(result.reference, written.display().to_string());
        let entries = AuthorizedKeys::read_file(&written).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries[0].public_key().fingerprint(ssh_key::HashAlg::Sha256).to_string(),
            fingerprint
        );

        let private = PrivateKey::read_openssh_file(&identity).unwrap();
        assert_eq!(private.fingerprint(ssh_key::HashAlg::Sha256).to_string(), fingerprint);
        let public = ssh_key::PublicKey::read_openssh_file(&file::sibling(&identity, ".pub")).unwrap();
        assert_eq!(public.key_data(), private.public_key().key_data());
    }

    #[tokio::test]
    async fn agent_destination_reports_idempotence() {
        let agent = Arc::new(FakeAgent::default());
        let providers = Providers::default().with_agent(agent.clone());
        let config = resolve(&["dest=agent", "socket=/run/agent.sock"]).unwrap();
        let ctx = extract(&StaticSession::for_user("alice")).unwrap();
        let credential = issue(&config, &ctx).unwrap();
        let plan = PublishPlan::new(&config, &ctx, None).unwrap();
        let key = credential.private_key().unwrap().clone();

        let first = publish(credential, &plan, &providers).await.unwrap();
        assert_eq!(first.outcome, PublishOutcome::Published);

        let again = agent.register(Path::new("/run/agent.sock"), &key, None).await.unwrap();
        assert_eq!(again, Registration::AlreadyRegistered(first.reference));
    }

    #[tokio::test]
    async fn agent_destination_without_client_is_unavailable() {
        let (credential, plan) = setup(&["dest=agent".into(), "socket=/run/agent.sock".into()]);
        let err = publish(credential, &plan, &Providers::default()).await.unwrap_err();
        assert!(matches!(err, PublishError::Unavailable(_)));
    }

    #[tokio::test]
    async fn authority_certificate_is_checked_and_written() {
        let tmp = tempfile::tempdir().unwrap();
        let cert_path = tmp.path().join("id_ed25519-cert.pub");
        let authority = Arc::new(FakeAuthority {
            ca: PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap(),
            calls: AtomicUsize::new(0),
        });
        let providers = Providers::default().with_authority(authority.clone());
        let (credential, plan) = setup(&[
            "dest=ca".into(),
            "url=https://ca.invalid/sign".into(),
            format!("cert={}", cert_path.display()),
        ]);
        let public = credential.public_key.clone();

        let result = publish(credential, &plan, &providers).await.unwrap();
        assert_eq!(result.reference, "sshmint-alice");
        assert_eq!(authority.calls.load(Ordering::SeqCst), 1);

        let cert = Certificate::read_file(&cert_path).unwrap();
        assert_eq!(cert.public_key(), public.key_data());
        assert_eq!(cert.valid_principals(), ["alice".to_string()]);
    }

    #[tokio::test]
    async fn silent_authority_times_out() {
        let providers = Providers::default().with_authority(Arc::new(SilentAuthority));
        let (credential, plan) = setup(&[
            "dest=ca".into(),
            "url=https://ca.invalid/sign".into(),
            "timeout=1".into(),
        ]);
        let err = publish(credential, &plan, &providers).await.unwrap_err();
        assert!(matches!(err, PublishError::Timeout));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn lock_timeout_leaves_no_identity() {
        let tmp = tempfile::tempdir().unwrap();
        let keys = tmp.path().join("authorized_keys");
        let identity = tmp.path().join("id").join("id_ed25519");
        let _held = file::FileLock::acquire(&keys, Instant::now()).unwrap();
        let (credential, plan) = setup(&[
            format!("path={}", keys.display()),
            format!("identity={}", identity.display()),
            "timeout=1".into(),
        ]);

        let err = publish(credential, &plan, &Providers::default()).await.unwrap_err();
        assert!(matches!(err, PublishError::Timeout), "{err:?}");
        assert!(!keys.exists());
        assert!(!identity.exists());
        assert!(!file::sibling(&identity, ".pub").exists());
        assert_eq!(std::fs::read_dir(tmp.path().join("id")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn failed_certificate_write_leaves_no_identity() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("blocker");
        std::fs::write(&blocker, "").unwrap();
        let identity = tmp.path().join("id_ed25519");
        let authority = Arc::new(FakeAuthority {
            ca: PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap(),
            calls: AtomicUsize::new(0),
        });
        let providers = Providers::default().with_authority(authority);
        let (credential, plan) = setup(&[
            "dest=ca".into(),
            "url=https://ca.invalid/sign".into(),
            format!("identity={}", identity.display()),
            format!("cert={}", blocker.join("cert.pub").display()),
        ]);

        let err = publish(credential, &plan, &providers).await.unwrap_err();
        assert!(matches!(err, PublishError::Io { .. }), "{err:?}");
        let mut names: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        names.sort();
        assert_eq!(names, vec![std::ffi::OsString::from("blocker")]);
    }

    #[test]
    fn replacement_needs_a_per_user_comment() {
        let ctx = extract(&StaticSession::for_user("bob")).unwrap();
        let plan = |tokens: &[&str]| PublishPlan::new(&resolve(tokens).unwrap(), &ctx, None).unwrap();

        assert!(plan(&["path=/k"]).replace_previous);
        assert!(plan(&["path=/k", "comment=login-%u"]).replace_previous);
        assert!(!plan(&["path=/k", "comment=corp-login"]).replace_previous);
    }

    #[test]
    fn plan_expands_templates() {
        let config = resolve(&["path=/var/lib/sshmint/%u/keys", "identity=/var/lib/sshmint/%u/id"]).unwrap();
        let ctx = extract(&StaticSession::for_user("bob")).unwrap();
        let plan = PublishPlan::new(&config, &ctx, None).unwrap();
        assert_eq!(
            plan.target,
            Target::AuthorizedKeys(PathBuf::from("/var/lib/sshmint/bob/keys"))
        );
        assert_eq!(plan.identity, Some(PathBuf::from("/var/lib/sshmint/bob/id")));
        assert_eq!(plan.timeout, Duration::from_secs(5));
    }

    #[test]
    fn plan_needs_an_account_for_home_paths() {
        let config = resolve(&["path=%h/.ssh/authorized_keys"]).unwrap();
        let ctx = extract(&StaticSession::for_user("ghost")).unwrap();
        assert!(PublishPlan::needs_account(&config));
        assert_eq!(
            PublishPlan::new(&config, &ctx, None).unwrap_err(),
            ContextError::UnknownUser("ghost".into())
        );
    }
}
