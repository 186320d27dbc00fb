// SPDX-License-Identifier: MIT OR Apache-2.0

//! Prover side of the challenge exchange.

use anyhow::{bail, Context, Result};
use log::debug;
use reqwest::StatusCode;

use pcrattest_verify::PlatformAttestation;

use crate::api::{ChallengeResponse, VerifyRequest, VerifyResponse};

/// Talks to a verifier service at one base URL
#[derive(Debug, Clone)]
pub struct VerifierClient {
    http: reqwest::Client,
    base_url: String,
}

impl VerifierClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    /// Use a preconfigured HTTP client (proxies, timeouts, TLS roots)
    pub fn with_client(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Ask the verifier for a nonce
    pub async fn challenge(&self) -> Result<Vec<u8>> {
        let url = format!("{}/challenge", self.base_url);
        let response = self
            .http
            .post(&url)
            .send()
            .await
            .with_context(|| format!("failed to reach {}", url))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("verifier returned {} for a challenge: {}", status, body);
        }

        let challenge: ChallengeResponse = response
            .json()
            .await
            .context("invalid challenge response")?;
        debug!(
            "received nonce {} (expires in {}s)",
            challenge.nonce, challenge.expires_in_secs
        );
        hex::decode(&challenge.nonce).context("challenge nonce is not valid hex")
    }

    /// Submit an attestation for `nonce` and return the verifier's verdict
    pub async fn submit(
        &self,
        nonce: &[u8],
        attestation: PlatformAttestation,
    ) -> Result<VerifyResponse> {
        let url = format!("{}/verify", self.base_url);
        let request = VerifyRequest {
            nonce: hex::encode(nonce),
            attestation,
        };
        let response = self
            .http
            .post(&url)
            .json(&request)
            .send()
            .await
            .with_context(|| format!("failed to reach {}", url))?;

        // A malformed request still carries a verdict
        let status = response.status();
        if !status.is_success() && status != StatusCode::BAD_REQUEST {
            let body = response.text().await.unwrap_or_default();
            bail!("verifier returned {}: {}", status, body);
        }
        response.json().await.context("invalid verify response")
    }
}
