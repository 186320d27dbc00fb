// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end check of a root of trust: ensure an AK, answer a fresh
//! challenge, verify the answer, and make sure a wrong nonce is rejected.

use log::info;
use serde::Serialize;

use pcrattest_verify::{verify, PcrSelection, RejectReason, Verdict};

use crate::ak::{AttestationKeyManager, BlobStore};
use crate::error::Error;
use crate::fresh_nonce;
use crate::responder::ChallengeResponder;
use crate::root::RootOfTrust;

/// Outcome of a self-test run
#[derive(Debug, Clone, Serialize)]
pub struct SelfTestReport {
    /// Hex nonce the attestation was bound to
    pub nonce: String,
    /// AK public area (base64 TPMT_PUBLIC)
    pub ak_public: String,
    pub quotes: usize,
    pub pcrs: usize,
    /// Verdict for the issued nonce; must be accepted
    pub verdict: Verdict,
    /// Verdict for a different nonce; must be a nonce mismatch
    pub wrong_nonce_verdict: Verdict,
}

impl SelfTestReport {
    pub fn passed(&self) -> bool {
        self.verdict.accepted
            && !self.wrong_nonce_verdict.accepted
            && self.wrong_nonce_verdict.reason == Some(RejectReason::NonceMismatch)
    }
}

/// Run the self-test against `root`, using the AK in `manager`'s store or a
/// newly minted one
pub fn run<R, S>(
    root: &mut R,
    manager: &AttestationKeyManager<S>,
    selector: &[PcrSelection],
) -> Result<SelfTestReport, Error>
where
    R: RootOfTrust + ?Sized,
    S: BlobStore,
{
    let key = manager.ensure(root)?;
    let nonce = fresh_nonce();
    let bundle = ChallengeResponder::new().respond(root, &key, &nonce, selector)?;

    let result = verify(&bundle, &nonce, key.public());
    info!(
        "self-test attestation {}",
        if result.is_accepted() { "accepted" } else { "rejected" }
    );

    let mut wrong_nonce = nonce.clone();
    wrong_nonce[0] ^= 0xFF;
    let wrong_result = verify(&bundle, &wrong_nonce, key.public());

    Ok(SelfTestReport {
        nonce: hex::encode(&nonce),
        ak_public: key.public().to_base64(),
        quotes: bundle.quotes.len(),
        pcrs: bundle.pcrs.len(),
        verdict: Verdict::from(&result),
        wrong_nonce_verdict: Verdict::from(&wrong_result),
    })
}
