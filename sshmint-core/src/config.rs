//! Module configuration resolved from PAM module arguments.
//!
//! Arguments come from the PAM service file, e.g.
//!
//! ```text
//! session  optional  pam_sshmint.so  algo=ed25519 dest=file path=%h/.ssh/authorized_keys lifetime=12h
//! ```
//!
//! Tokens are `key=value` pairs or bare flags (`strict`, `lenient`,
//! `debug`).  Unknown keys are ignored unless `strict` is present.  Any
//! error is terminal: there is no partially defaulted config and no invented
//! destination.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

pub const RSA_KEY_SIZES: &[usize] = &[2048, 3072, 4096];
pub const DEFAULT_RSA_KEY_SIZE: usize = 3072;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
pub const MAX_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyAlgorithm {
    #[default]
    Ed25519,
    EcdsaP256,
    Rsa,
}

impl KeyAlgorithm {
    pub fn name(self) -> &'static str {
        match self {
            Self::Ed25519 => "ed25519",
            Self::EcdsaP256 => "ecdsa-p256",
            Self::Rsa => "rsa",
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for KeyAlgorithm {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ed25519" | "ssh-ed25519" => Ok(Self::Ed25519),
            "ecdsa" | "ecdsa-p256" | "p256" | "nistp256" | "ecdsa-sha2-nistp256" => {
                Ok(Self::EcdsaP256)
            }
            "rsa" | "ssh-rsa" => Ok(Self::Rsa),
            _ => Err(ConfigError::InvalidAlgorithm(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DestinationKind {
    #[default]
    File,
    Agent,
    CaRequest,
}

impl DestinationKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Agent => "agent",
            Self::CaRequest => "ca",
        }
    }
}

impl FromStr for DestinationKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "file" => Ok(Self::File),
            "agent" => Ok(Self::Agent),
            "ca" | "ca-request" | "authority" => Ok(Self::CaRequest),
            _ => Err(ConfigError::InvalidDestination(s.to_string())),
        }
    }
}

/// What a failed issuance or publish does to the login.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Policy {
    /// Fail the session.
    #[default]
    Strict,
    /// Log the failure and let the session open without a fresh credential.
    Lenient,
}

impl FromStr for Policy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "lenient" => Ok(Self::Lenient),
            _ => Err(ConfigError::InvalidPolicy(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleConfig {
    pub algorithm: KeyAlgorithm,
    /// RSA modulus size in bits; `None` for every other algorithm.
    pub key_size: Option<usize>,
    pub destination: DestinationKind,
    /// Path, socket or URL of the destination.  May contain `%u` and `%h`.
    pub locator: String,
    pub max_lifetime: Option<Duration>,
    pub policy: Policy,
    pub timeout: Duration,
    /// Where to write the private key, if anywhere (file and CA destinations).
    pub identity: Option<String>,
    /// Where to write a certificate returned by the authority.
    pub certificate: Option<String>,
    pub comment: Option<String>,
    pub strict_args: bool,
    pub debug: bool,
}

/// Whether the raw tokens ask for debug logging.
///
/// Checked before resolution so that resolution failures are logged at the
/// requested level.
pub fn wants_debug(tokens: &[String]) -> bool {
    tokens.iter().any(|t| t == "debug")
}

#[derive(Default)]
struct RawArgs<'a> {
    algorithm: Option<&'a str>,
    size: Option<&'a str>,
    destination: Option<&'a str>,
    path: Option<&'a str>,
    socket: Option<&'a str>,
    url: Option<&'a str>,
    lifetime: Option<&'a str>,
    policy: Option<&'a str>,
    timeout: Option<&'a str>,
    identity: Option<&'a str>,
    certificate: Option<&'a str>,
    comment: Option<&'a str>,
    strict: bool,
    lenient: bool,
    debug: bool,
    unknown: Vec<&'a str>,
}

/// Resolve module arguments into a [`ModuleConfig`].
///
/// Later occurrences of a key override earlier ones.
pub fn resolve<S: AsRef<str>>(tokens: &[S]) -> Result<ModuleConfig, ConfigError> {
    let mut raw = RawArgs::default();

    for token in tokens {
        let token = token.as_ref();
        let Some((key, value)) = token.split_once('=') else {
            match token {
                "strict" => raw.strict = true,
                "lenient" => raw.lenient = true,
                "debug" => raw.debug = true,
                "" => return Err(ConfigError::MalformedToken(token.to_string())),
                _ => raw.unknown.push(token),
            }
            continue;
        };
        if key.is_empty() || value.is_empty() {
            return Err(ConfigError::MalformedToken(token.to_string()));
        }
        let slot = match key.to_ascii_lowercase().as_str() {
            "algo" | "algorithm" => &mut raw.algorithm,
            "size" | "bits" => &mut raw.size,
            "dest" | "destination" => &mut raw.destination,
            "path" => &mut raw.path,
            "socket" => &mut raw.socket,
            "url" => &mut raw.url,
            "lifetime" => &mut raw.lifetime,
            "policy" => &mut raw.policy,
            "timeout" => &mut raw.timeout,
            "identity" => &mut raw.identity,
            "cert" | "certificate" => &mut raw.certificate,
            "comment" => &mut raw.comment,
            _ => {
                raw.unknown.push(key);
                continue;
            }
        };
        *slot = Some(value);
    }

    if raw.strict
        && let Some(key) = raw.unknown.first()
    {
        return Err(ConfigError::UnknownKey((*key).to_string()));
    }

    let algorithm = raw
        .algorithm
        .map(KeyAlgorithm::from_str)
        .transpose()?
        .unwrap_or_default();
    let key_size = resolve_key_size(algorithm, raw.size)?;

    let destination = raw
        .destination
        .map(DestinationKind::from_str)
        .transpose()?
        .unwrap_or_default();
    let locator = match destination {
        DestinationKind::File => raw.path,
        DestinationKind::Agent => raw.socket.or(raw.path),
        DestinationKind::CaRequest => raw.url.or(raw.path),
    }
    .map(str::trim)
    .filter(|l| !l.is_empty())
    .ok_or(ConfigError::MissingDestination(destination.name()))?
    .to_string();
    if destination == DestinationKind::CaRequest
        && !(locator.starts_with("https://") || locator.starts_with("http://"))
    {
        return Err(ConfigError::InvalidDestination(locator));
    }

    let max_lifetime = raw
        .lifetime
        .map(|l| parse_duration(l).ok_or_else(|| ConfigError::InvalidLifetime(l.to_string())))
        .transpose()?;
    if let Some(lifetime) = max_lifetime
        && lifetime.as_secs() > u64::from(u32::MAX)
    {
        return Err(ConfigError::InvalidLifetime(format!("{}s", lifetime.as_secs())));
    }

    let timeout = match raw.timeout {
        None => DEFAULT_TIMEOUT,
        Some(t) => parse_duration(t)
            .filter(|d| *d <= MAX_TIMEOUT)
            .ok_or_else(|| ConfigError::InvalidTimeout(t.to_string()))?,
    };

    let policy = match (raw.policy, raw.lenient) {
        (Some(p), _) => Policy::from_str(p)?,
        (None, true) => Policy::Lenient,
        (None, false) => Policy::Strict,
    };

    Ok(ModuleConfig {
        algorithm,
        key_size,
        destination,
        locator,
        max_lifetime,
        policy,
        timeout,
        identity: raw.identity.map(str::to_string),
        certificate: raw.certificate.map(str::to_string),
        comment: raw.comment.map(str::to_string),
        strict_args: raw.strict,
        debug: raw.debug,
    })
}

fn resolve_key_size(algorithm: KeyAlgorithm, size: Option<&str>) -> Result<Option<usize>, ConfigError> {
    let invalid = |s: &str| ConfigError::InvalidKeySize {
        algorithm: algorithm.name(),
        size: s.to_string(),
    };
    match (algorithm, size) {
        (KeyAlgorithm::Rsa, None) => Ok(Some(DEFAULT_RSA_KEY_SIZE)),
        (KeyAlgorithm::Rsa, Some(s)) => {
            let bits: usize = s.parse().map_err(|_| invalid(s))?;
            if RSA_KEY_SIZES.contains(&bits) {
                Ok(Some(bits))
            } else {
                Err(invalid(s))
            }
        }
        (_, None) => Ok(None),
        (_, Some(s)) => Err(invalid(s)),
    }
}

/// Parse `90`, `90s`, `15m`, `12h` or `7d`.  Zero is rejected.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let n: u64 = digits.parse().ok()?;
    let multiplier = match unit {
        "" | "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        "d" => 24 * 60 * 60,
        _ => return None,
    };
    let secs = n.checked_mul(multiplier)?;
    (secs > 0).then(|| Duration::from_secs(secs))
}
