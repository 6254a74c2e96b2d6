//! In-memory representation of an issued credential.
//!
//! The private half lives in an `ssh_key::PrivateKey`, which zeroizes its key
//! material on drop.  Nothing in this crate serialises it except the file
//! publisher writing an identity file the operator explicitly asked for.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ssh_key::{LineEnding, PrivateKey, PublicKey};
use zeroize::Zeroizing;

use crate::config::KeyAlgorithm;

/// Request envelope sent to a certificate authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateRequest {
    pub username: String,
    pub service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_host: Option<String>,
    /// OpenSSH-encoded public key to be certified.
    pub public_key: String,
    pub algorithm: String,
    pub fingerprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_for_secs: Option<u64>,
}

pub struct IssuedCredential {
    pub algorithm: KeyAlgorithm,
    pub public_key: PublicKey,
    /// SHA-256 fingerprint string (e.g. `"SHA256:abc123…"`).
    pub fingerprint: String,
    pub comment: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub ca_request: Option<CertificateRequest>,
    private_key: Option<PrivateKey>,
}

impl IssuedCredential {
    pub(crate) fn new(
        algorithm: KeyAlgorithm,
        private_key: PrivateKey,
        issued_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        let public_key = private_key.public_key().clone();
        let fingerprint = public_key.fingerprint(ssh_key::HashAlg::Sha256).to_string();
        let comment = private_key.comment().to_string();
        Self {
            algorithm,
            public_key,
            fingerprint,
            comment,
            issued_at,
            expires_at,
            ca_request: None,
            private_key: Some(private_key),
        }
    }

    pub fn private_key(&self) -> Option<&PrivateKey> {
        self.private_key.as_ref()
    }

    pub fn has_private_key(&self) -> bool {
        self.private_key.is_some()
    }

    /// OpenSSH PEM encoding of the private key, scrubbed when dropped.
    pub fn private_key_openssh(&self) -> Result<Option<Zeroizing<String>>, ssh_key::Error> {
        self.private_key
            .as_ref()
            .map(|k| k.to_openssh(LineEnding::LF))
            .transpose()
    }

    /// Drop the private half now rather than when the credential goes away.
    pub fn discard_private_key(&mut self) {
        self.private_key = None;
    }

    /// The public key in OpenSSH format, comment included.
    pub fn public_key_openssh(&self) -> Result<String, ssh_key::Error> {
        self.public_key.to_openssh()
    }

    /// An `authorized_keys` line for this key.
    ///
    /// A bounded lifetime becomes an `expiry-time` option so sshd stops
    /// accepting the key on its own.
    pub fn authorized_key_line(&self) -> Result<String, ssh_key::Error> {
        let key = self.public_key_openssh()?;
        Ok(match self.expires_at {
            Some(expiry) => format!("expiry-time=\"{}\" {key}", expiry.format("%Y%m%d%H%M%SZ")),
            None => key,
        })
    }
}

impl std::fmt::Debug for IssuedCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedCredential")
            .field("algorithm", &self.algorithm)
            .field("fingerprint", &self.fingerprint)
            .field("comment", &self.comment)
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("private_key", &self.private_key.as_ref().map(|_| "[redacted]"))
            .finish_non_exhaustive()
    }
}
