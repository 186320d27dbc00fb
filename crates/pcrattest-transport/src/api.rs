// SPDX-License-Identifier: MIT OR Apache-2.0

//! Verifier routes
//!
//! - `POST /challenge` issues a hex nonce, or answers 503 while too many
//!   nonces are outstanding.
//! - `POST /verify` takes an envelope, not a bare bundle:
//!
//!   ```json
//!   {"nonce": "<hex from /challenge>", "attestation": {"TPMVersion": 2, ...}}
//!   ```
//!
//!   A body without both fields is answered with 400 and a `MalformedBundle`
//!   verdict. Otherwise the verdict comes back with 200.
//! - `GET /health`

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use pcrattest_verify::{
    AttestationVerifier, PlatformAttestation, RejectReason, VerificationResult, Verdict,
};

use crate::challenge::ChallengeStore;
use crate::web_error::AppError;

/// Shared state for the verifier service
#[derive(Clone)]
pub struct AppState {
    pub verifier: Arc<AttestationVerifier>,
    pub challenges: Arc<ChallengeStore>,
}

impl AppState {
    pub fn new(verifier: AttestationVerifier, challenges: ChallengeStore) -> Self {
        Self {
            verifier: Arc::new(verifier),
            challenges: Arc::new(challenges),
        }
    }
}

// =============================================================================
// Request/Response types
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeResponse {
    /// Hex nonce to quote over
    pub nonce: String,
    pub expires_in_secs: u64,
}

/// Body of `POST /verify`: the bundle travels next to the nonce it answers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyRequest {
    /// Hex nonce from `/challenge`
    pub nonce: String,
    pub attestation: PlatformAttestation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyResponse {
    #[serde(flatten)]
    pub verdict: Verdict,
    /// The verified bundle, echoed on acceptance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<PlatformAttestation>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

// =============================================================================
// Routes
// =============================================================================

/// The verifier service
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/challenge", post(issue_challenge))
        .route("/verify", post(verify_attestation))
        .fallback(not_found)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn health_check() -> impl IntoResponse {
    Json(HealthResponse { status: "ok" })
}

async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": "route not found" })),
    )
}

async fn issue_challenge(State(state): State<AppState>) -> Result<Response, AppError> {
    let Some(nonce) = state.challenges.issue()? else {
        return Ok((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": "too many outstanding challenges" })),
        )
            .into_response());
    };
    Ok(Json(ChallengeResponse {
        nonce: hex::encode(nonce),
        expires_in_secs: state.challenges.ttl().as_secs(),
    })
    .into_response())
}

/// Takes the raw body so that undecodable requests get a verdict rather than
/// the extractor's plain-text rejection
async fn verify_attestation(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, AppError> {
    let (request, nonce) = match decode_request(&body) {
        Ok(decoded) => decoded,
        Err(e) => {
            warn!("rejected verify request: {:#}", e);
            let verdict = rejection(RejectReason::MalformedBundle, format!("{:#}", e));
            return Ok((StatusCode::BAD_REQUEST, Json(verdict)).into_response());
        }
    };

    if !state.challenges.redeem(&nonce)? {
        warn!("rejected attestation for unknown nonce {}", request.nonce);
        let verdict = rejection(
            RejectReason::NonceMismatch,
            "nonce was not issued, has expired or was already used".to_string(),
        );
        return Ok(Json(verdict).into_response());
    }

    let result = VerificationResult::from(state.verifier.check(&request.attestation, &nonce));
    let response = match result.rejection() {
        None => {
            info!("accepted attestation for nonce {}", request.nonce);
            VerifyResponse {
                verdict: Verdict::from(&result),
                data: Some(request.attestation),
            }
        }
        Some(rejected) => {
            warn!(
                "rejected attestation for nonce {}: {}: {}",
                request.nonce, rejected.reason, rejected.detail
            );
            VerifyResponse {
                verdict: Verdict::from(&result),
                data: None,
            }
        }
    };
    Ok(Json(response).into_response())
}

fn decode_request(body: &[u8]) -> Result<(VerifyRequest, Vec<u8>)> {
    let request: VerifyRequest =
        serde_json::from_slice(body).context("request body is not a verify request")?;
    let nonce = hex::decode(request.nonce.trim()).context("nonce is not valid hex")?;
    Ok((request, nonce))
}

fn rejection(reason: RejectReason, detail: String) -> VerifyResponse {
    VerifyResponse {
        verdict: Verdict {
            accepted: false,
            reason: Some(reason),
            quote_index: None,
            detail: Some(detail),
        },
        data: None,
    }
}
