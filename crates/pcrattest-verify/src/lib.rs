// SPDX-License-Identifier: MIT OR Apache-2.0

//! Verification of TPM 2.0 platform attestation bundles.
//!
//! A bundle ([`PlatformAttestation`]) carries quotes signed by an attestation
//! key, the PCR values they cover and the boot measurement log. [`verify`]
//! checks it against the nonce the verifier issued and the AK it trusts and
//! yields exactly one [`VerificationResult`].
//!
//! This crate is pure: no hardware access, no I/O.

use serde::{Deserialize, Serialize};

pub mod error;
pub mod eventlog;
pub mod model;
pub mod pcr;
pub mod tpm;
mod verifier;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use error::VerifyError;
pub use eventlog::{EventLog, EventLogBuilder};
pub use model::{PcrValue, PlatformAttestation, Quote, TPM_VERSION_1_2, TPM_VERSION_2_0};
pub use pcr::{HashAlgorithm, PcrBanks, PcrSelection, PCR_COUNT};
pub use tpm::{AkPublic, QuoteInfo, MAX_NONCE_SIZE};
pub use verifier::{AttestationVerifier, VerifiedAttestation};

/// Why a bundle was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RejectReason {
    SignatureInvalid,
    NonceMismatch,
    RegisterMismatch,
    EventLogInconsistent,
    MalformedBundle,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RejectReason::SignatureInvalid => "SignatureInvalid",
            RejectReason::NonceMismatch => "NonceMismatch",
            RejectReason::RegisterMismatch => "RegisterMismatch",
            RejectReason::EventLogInconsistent => "EventLogInconsistent",
            RejectReason::MalformedBundle => "MalformedBundle",
        };
        f.write_str(name)
    }
}

/// A rejection with its reason code and diagnostic detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub reason: RejectReason,
    /// Index of the failing quote, when one quote is to blame
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quote_index: Option<usize>,
    pub detail: String,
}

impl From<&VerifyError> for Rejection {
    fn from(err: &VerifyError) -> Self {
        Rejection {
            reason: err.reason(),
            quote_index: err.quote_index(),
            detail: err.to_string(),
        }
    }
}

impl VerifyError {
    pub fn reason(&self) -> RejectReason {
        match self {
            VerifyError::MalformedBundle(_) => RejectReason::MalformedBundle,
            VerifyError::SignatureInvalid { .. } => RejectReason::SignatureInvalid,
            VerifyError::NonceMismatch { .. } => RejectReason::NonceMismatch,
            VerifyError::EventLogInconsistent(_) => RejectReason::EventLogInconsistent,
            VerifyError::RegisterMismatch(_) => RejectReason::RegisterMismatch,
        }
    }

    pub fn quote_index(&self) -> Option<usize> {
        match self {
            VerifyError::SignatureInvalid { quote, .. } => *quote,
            VerifyError::NonceMismatch { quote } => Some(*quote),
            VerifyError::MalformedBundle(error::MalformedReason::Quote { index, .. }) => {
                Some(*index)
            }
            VerifyError::MalformedBundle(error::MalformedReason::QuoteVersionMismatch {
                index,
                ..
            }) => Some(*index),
            VerifyError::RegisterMismatch(
                error::RegisterMismatchReason::SelectedButMissing { quote, .. }
                | error::RegisterMismatchReason::DigestMismatch { quote },
            ) => Some(*quote),
            _ => None,
        }
    }
}

/// The verdict on one bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationResult {
    Accepted,
    Rejected(Rejection),
}

impl VerificationResult {
    pub fn is_accepted(&self) -> bool {
        matches!(self, VerificationResult::Accepted)
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            VerificationResult::Accepted => None,
            VerificationResult::Rejected(rejection) => Some(rejection),
        }
    }
}

impl From<Result<VerifiedAttestation, VerifyError>> for VerificationResult {
    fn from(result: Result<VerifiedAttestation, VerifyError>) -> Self {
        match result {
            Ok(_) => VerificationResult::Accepted,
            Err(err) => VerificationResult::Rejected(Rejection::from(&err)),
        }
    }
}

/// JSON form of a [`VerificationResult`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl From<&VerificationResult> for Verdict {
    fn from(result: &VerificationResult) -> Self {
        match result {
            VerificationResult::Accepted => Verdict {
                accepted: true,
                reason: None,
                quote_index: None,
                detail: None,
            },
            VerificationResult::Rejected(rejection) => Verdict {
                accepted: false,
                reason: Some(rejection.reason),
                quote_index: rejection.quote_index,
                detail: Some(rejection.detail.clone()),
            },
        }
    }
}

/// Verify `bundle` against the nonce the verifier issued and the trusted AK.
pub fn verify(
    bundle: &PlatformAttestation,
    expected_nonce: &[u8],
    ak_public: &AkPublic,
) -> VerificationResult {
    AttestationVerifier::new(ak_public.clone())
        .check(bundle, expected_nonce)
        .into()
}

/// Decode a JSON bundle and verify it. Undecodable input is `MalformedBundle`.
pub fn verify_json(json: &str, expected_nonce: &[u8], ak_public: &AkPublic) -> VerificationResult {
    match PlatformAttestation::from_json(json) {
        Ok(bundle) => verify(&bundle, expected_nonce, ak_public),
        Err(err) => VerificationResult::Rejected(Rejection::from(&err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{BundleBuilder, TEST_NONCE};

    #[test]
    fn test_rejection_carries_reason_and_index() {
        let builder = BundleBuilder::new();
        let bundle = builder.build(&TEST_NONCE);
        let result = verify(&bundle, b"other nonce", &builder.ak_public());
        let rejection = result.rejection().unwrap();
        assert_eq!(rejection.reason, RejectReason::NonceMismatch);
        assert_eq!(rejection.quote_index, Some(0));
        assert!(!rejection.detail.is_empty());
    }

    #[test]
    fn test_reject_reason_serializes_as_name() {
        assert_eq!(
            serde_json::to_string(&RejectReason::EventLogInconsistent).unwrap(),
            "\"EventLogInconsistent\""
        );
        assert_eq!(RejectReason::MalformedBundle.to_string(), "MalformedBundle");
    }

    #[test]
    fn test_verdict_json() {
        let accepted = serde_json::to_value(Verdict::from(&VerificationResult::Accepted)).unwrap();
        assert_eq!(accepted, serde_json::json!({"accepted": true}));

        let rejected = VerificationResult::Rejected(Rejection {
            reason: RejectReason::SignatureInvalid,
            quote_index: Some(2),
            detail: "bad".to_string(),
        });
        let value = serde_json::to_value(Verdict::from(&rejected)).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "accepted": false,
                "reason": "SignatureInvalid",
                "quote_index": 2,
                "detail": "bad"
            })
        );
    }

    #[test]
    fn test_verify_json_rejects_garbage() {
        let builder = BundleBuilder::new();
        let result = verify_json("{", &TEST_NONCE, &builder.ak_public());
        assert_eq!(
            result.rejection().map(|r| r.reason),
            Some(RejectReason::MalformedBundle)
        );
    }

    #[test]
    fn test_verify_json_accepts_wire_bundle() {
        let builder = BundleBuilder::new();
        let json = builder.build(&TEST_NONCE).to_json();
        assert!(verify_json(&json, &TEST_NONCE, &builder.ak_public()).is_accepted());
    }
}
