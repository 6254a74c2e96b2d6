//! HTTPS client for the signing endpoint.

use std::time::Duration;

use sshmint_core::{CertificateAuthority, CertificateRequest, PublishError, SignedCertificate};
use tracing::debug;

use crate::error::CaError;

/// Upper bound on how much of an error body is kept for the log.
const MAX_ERROR_BODY: usize = 512;

/// Certificate authority reached over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpAuthority {
    http: reqwest::Client,
}

impl HttpAuthority {
    pub fn new() -> Result<Self, CaError> {
        let http = reqwest::Client::builder()
            .user_agent(format!("pam_sshmint/{}", env!("CARGO_PKG_VERSION")))
            .no_proxy()
            .build()
            .map_err(CaError::Http)?;
        Ok(Self { http })
    }

    /// POST `request` to `endpoint` and parse the signed certificate.
    pub async fn sign(
        &self,
        endpoint: &str,
        request: &CertificateRequest,
        timeout: Duration,
    ) -> Result<SignedCertificate, CaError> {
        debug!(
            endpoint,
            user = %request.username,
            fingerprint = %request.fingerprint,
            "certificate request"
        );

        let resp = self
            .http
            .post(endpoint)
            .timeout(timeout)
            .json(request)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let mut body = resp.text().await.unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            let status = status.as_u16();
            return Err(if status >= 500 || status == 429 {
                CaError::Unavailable { status, body }
            } else {
                CaError::Refused { status, body }
            });
        }

        let text = resp.text().await?;
        let signed: SignedCertificate =
            serde_json::from_str(&text).map_err(|e| CaError::Malformed(e.to_string()))?;
        if signed.certificate.trim().is_empty() {
            return Err(CaError::Malformed("empty certificate".into()));
        }
        debug!(status = status.as_u16(), "certificate received");
        Ok(signed)
    }
}

#[async_trait::async_trait]
impl CertificateAuthority for HttpAuthority {
    async fn submit(
        &self,
        endpoint: &str,
        request: &CertificateRequest,
        timeout: Duration,
    ) -> Result<SignedCertificate, PublishError> {
        Ok(self.sign(endpoint, request, timeout).await?)
    }
}
