// SPDX-License-Identifier: MIT OR Apache-2.0

//! HTTP challenge transport
//!
//! The verifier side issues single-use nonces and checks the bundles posted
//! back against them. The prover side fetches a nonce, answers it with the
//! local root of trust and submits the result.

pub mod api;
pub mod challenge;
pub mod client;
mod web_error;

pub use api::{router, AppState, ChallengeResponse, VerifyRequest, VerifyResponse};
pub use challenge::ChallengeStore;
pub use client::VerifierClient;

/// Default nonce lifetime
pub const DEFAULT_NONCE_TTL_SECS: u64 = 300;

/// Default cap on nonces awaiting redemption
pub const DEFAULT_MAX_OUTSTANDING: usize = 10_000;
