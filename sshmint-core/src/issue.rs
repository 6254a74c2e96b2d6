//! Key issuance.
//!
//! Generates a fresh keypair from the OS CSPRNG for every session.  The RNG
//! is probed first so that an exhausted or unavailable entropy source fails
//! the call cleanly instead of panicking inside key generation.  There is no
//! fallback to a weaker source.

use chrono::{TimeDelta, Utc};
use rand_core::{CryptoRngCore, OsRng};
use ssh_key::private::{EcdsaKeypair, Ed25519Keypair, KeypairData, RsaKeypair};
use ssh_key::{EcdsaCurve, PrivateKey};
use tracing::debug;
use zeroize::Zeroizing;

use crate::config::{DEFAULT_RSA_KEY_SIZE, DestinationKind, KeyAlgorithm, ModuleConfig};
use crate::context::SessionContext;
use crate::credential::{CertificateRequest, IssuedCredential};
use crate::error::IssuanceError;

/// Issue a credential for `ctx` using the OS CSPRNG.
pub fn issue(config: &ModuleConfig, ctx: &SessionContext) -> Result<IssuedCredential, IssuanceError> {
    issue_with(config, ctx, &mut OsRng)
}

/// Issue a credential drawing randomness from `rng`.
pub fn issue_with<R: CryptoRngCore>(
    config: &ModuleConfig,
    ctx: &SessionContext,
    rng: &mut R,
) -> Result<IssuedCredential, IssuanceError> {
    probe_entropy(rng)?;

    let keypair = generate(config, rng)?;
    let private_key = PrivateKey::new(keypair, comment_for(config, ctx))?;

    let issued_at = Utc::now();
    let expires_at = config
        .max_lifetime
        .and_then(|l| TimeDelta::from_std(l).ok())
        .and_then(|l| issued_at.checked_add_signed(l));

    let mut credential = IssuedCredential::new(config.algorithm, private_key, issued_at, expires_at);
    if config.destination == DestinationKind::CaRequest {
        credential.ca_request = Some(CertificateRequest {
            username: ctx.username.clone(),
            service: ctx.service.clone(),
            remote_host: ctx.remote_host.clone(),
            public_key: credential.public_key_openssh()?,
            algorithm: credential.public_key.algorithm().as_str().to_string(),
            fingerprint: credential.fingerprint.clone(),
            valid_for_secs: config.max_lifetime.map(|l| l.as_secs()),
        });
    }

    debug!(
        user = %ctx.username,
        algorithm = %config.algorithm,
        fingerprint = %credential.fingerprint,
        "issued key"
    );
    Ok(credential)
}

fn probe_entropy<R: CryptoRngCore>(rng: &mut R) -> Result<(), IssuanceError> {
    let mut probe = Zeroizing::new([0u8; 32]);
    rng.try_fill_bytes(&mut probe[..])
        .map_err(|e| IssuanceError::EntropyUnavailable(e.to_string()))
}

fn generate<R: CryptoRngCore>(config: &ModuleConfig, rng: &mut R) -> Result<KeypairData, IssuanceError> {
    Ok(match config.algorithm {
        KeyAlgorithm::Ed25519 => KeypairData::Ed25519(Ed25519Keypair::random(&mut *rng)),
        KeyAlgorithm::EcdsaP256 => {
            KeypairData::Ecdsa(EcdsaKeypair::random(&mut *rng, EcdsaCurve::NistP256)?)
        }
        KeyAlgorithm::Rsa => {
            let bits = config.key_size.unwrap_or(DEFAULT_RSA_KEY_SIZE);
            KeypairData::Rsa(RsaKeypair::random(&mut *rng, bits)?)
        }
    })
}

/// Key comment: the configured one, or `sshmint:<user>@<service>`.
///
/// Whitespace is replaced so the comment stays a single `authorized_keys`
/// field; the file publisher uses it to find this user's earlier lines.
pub fn comment_for(config: &ModuleConfig, ctx: &SessionContext) -> String {
    let comment = match &config.comment {
        Some(c) => c.replace("%u", &ctx.username),
        None => format!("sshmint:{}@{}", ctx.username, ctx.service),
    };
    comment
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .collect()
}
