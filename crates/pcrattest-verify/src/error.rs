// SPDX-License-Identifier: MIT OR Apache-2.0

//! Verification error types
//!
//! Every variant of [`VerifyError`] maps onto exactly one rejection reason
//! code (see [`crate::RejectReason`]). The nested reason enums carry the
//! diagnostic detail.

use thiserror::Error;

use crate::pcr::HashAlgorithm;

/// Why verification rejected a bundle
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("Malformed bundle: {0}")]
    MalformedBundle(#[from] MalformedReason),

    #[error("Signature verification failed{}: {reason}", quote_suffix(.quote))]
    SignatureInvalid {
        quote: Option<usize>,
        reason: SignatureInvalidReason,
    },

    #[error("Quote {quote} was produced for a different nonce")]
    NonceMismatch { quote: usize },

    #[error("Event log does not match PCR values: {0}")]
    EventLogInconsistent(#[from] EventLogReason),

    #[error("PCR values do not match quotes: {0}")]
    RegisterMismatch(#[from] RegisterMismatchReason),
}

fn quote_suffix(quote: &Option<usize>) -> String {
    match quote {
        Some(index) => format!(" for quote {}", index),
        None => String::new(),
    }
}

impl From<SignatureInvalidReason> for VerifyError {
    fn from(reason: SignatureInvalidReason) -> Self {
        VerifyError::SignatureInvalid {
            quote: None,
            reason,
        }
    }
}

impl VerifyError {
    /// Attach the index of the quote being checked, where the variant has one.
    pub(crate) fn for_quote(self, index: usize) -> Self {
        match self {
            VerifyError::SignatureInvalid { reason, .. } => VerifyError::SignatureInvalid {
                quote: Some(index),
                reason,
            },
            VerifyError::NonceMismatch { .. } => VerifyError::NonceMismatch { quote: index },
            VerifyError::MalformedBundle(MalformedReason::Attest(reason)) => {
                VerifyError::MalformedBundle(MalformedReason::Quote { index, reason })
            }
            other => other,
        }
    }
}

// =============================================================================
// MalformedReason
// =============================================================================

#[derive(Debug, Error)]
pub enum MalformedReason {
    #[error("Unsupported TPM version {version} (only TPM 2.0 is supported)")]
    UnsupportedVersion { version: u8 },

    #[error("Quote {index} has version {got}, bundle has {expected}")]
    QuoteVersionMismatch { index: usize, expected: u8, got: u8 },

    #[error("Bundle contains no quotes")]
    NoQuotes,

    #[error("Bundle contains no PCR values")]
    NoPcrs,

    #[error("Invalid AK public area: {0}")]
    AkPublic(#[from] AkPublicReason),

    #[error("Unknown PCR digest algorithm {id}")]
    UnknownDigestAlgorithm { id: i64 },

    #[error("PCR index {index} out of range")]
    PcrIndexOutOfRange { index: i64 },

    #[error("PCR {index} ({algorithm}) has wrong length: expected {expected}, got {got}")]
    PcrValueWrongLength {
        index: u8,
        algorithm: HashAlgorithm,
        expected: usize,
        got: usize,
    },

    #[error("PCR {index} ({algorithm}) appears more than once")]
    DuplicatePcr { index: u8, algorithm: HashAlgorithm },

    #[error("Quote {index}: {reason}")]
    Quote { index: usize, reason: AttestReason },

    #[error("{0}")]
    Attest(#[from] AttestReason),

    #[error("Event log: {0}")]
    EventLog(#[from] EventLogParseReason),

    #[error("Base64 decode failed: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("bundle is not valid JSON: {0}")]
    JsonParse(#[from] serde_json::Error),
}

// =============================================================================
// AttestReason (TPMS_ATTEST / TPMT_SIGNATURE structure)
// =============================================================================

#[derive(Debug, Error)]
pub enum AttestReason {
    #[error("magic is 0x{got:08x}, not TPM_GENERATED_VALUE 0x{expected:08x}")]
    TpmMagicInvalid { expected: u32, got: u32 },

    #[error("attestation type is 0x{got:04x}, not TPM_ST_ATTEST_QUOTE 0x{expected:04x}")]
    TpmTypeInvalid { expected: u16, got: u16 },

    #[error("structure ends early at offset {offset}")]
    TpmTruncated { offset: usize },

    #[error("length overflows at offset {offset}")]
    TpmOverflow { offset: usize },

    #[error("{count} trailing bytes after TPM structure")]
    TrailingBytes { count: usize },

    #[error("{count} PCR selections, at most 16 allowed")]
    PcrSelectionCountExceeded { count: u32 },

    #[error("PCR bitmap of {size} bytes, at most 32 allowed")]
    PcrBitmapSizeExceeded { size: u8 },

    #[error("Quote selects PCR bank with unknown algorithm 0x{alg_id:04X}")]
    UnknownPcrAlgorithm { alg_id: u16 },
}

// =============================================================================
// AkPublicReason (TPMT_PUBLIC)
// =============================================================================

#[derive(Debug, Error)]
pub enum AkPublicReason {
    #[error("{0}")]
    Structure(#[from] AttestReason),

    #[error("Unsupported key type 0x{got:04X} (only ECC is supported)")]
    UnsupportedKeyType { got: u16 },

    #[error("Unsupported name algorithm 0x{got:04X}")]
    UnsupportedNameAlg { got: u16 },

    #[error("Unsupported curve 0x{got:04X} (only NIST P-256 is supported)")]
    UnsupportedCurve { got: u16 },

    #[error("Unsupported signing scheme 0x{scheme:04X}/0x{hash:04X}")]
    UnsupportedScheme { scheme: u16, hash: u16 },

    #[error("Key is not a restricted signing key (attributes 0x{attributes:08X})")]
    NotRestrictedSigningKey { attributes: u32 },

    #[error("Public point is not on the P-256 curve")]
    InvalidPoint,
}

// =============================================================================
// SignatureInvalidReason
// =============================================================================

#[derive(Debug, Error)]
pub enum SignatureInvalidReason {
    #[error("AK public key in bundle does not match the trusted AK")]
    AkPublicKeyMismatch,

    #[error("AK public key is not a P-256 point: {0}")]
    InvalidPublicKey(String),

    #[error("Invalid TPMT_SIGNATURE encoding: {0}")]
    InvalidSignatureEncoding(String),

    #[error("Unsupported signature scheme 0x{scheme:04X}/0x{hash:04X}")]
    UnsupportedScheme { scheme: u16, hash: u16 },

    #[error("ECDSA verification failed: {0}")]
    EcdsaVerificationFailed(String),
}

// =============================================================================
// EventLogParseReason
// =============================================================================

#[derive(Debug, Error)]
pub enum EventLogParseReason {
    #[error("Event log is empty")]
    Empty,

    #[error("Event {event} truncated at offset {offset}")]
    Truncated { event: usize, offset: usize },

    #[error("Malformed Spec ID event: {detail}")]
    SpecIdInvalid { detail: &'static str },

    #[error("Event {event} has digest for algorithm 0x{alg_id:04X} not declared in the log header")]
    UndeclaredAlgorithm { event: usize, alg_id: u16 },

    #[error("Event {event} has {count} digests, header declares {declared} algorithms")]
    DigestCountMismatch {
        event: usize,
        count: u32,
        declared: usize,
    },

    #[error("Event {event} has more than one digest for algorithm 0x{alg_id:04X}")]
    DuplicateDigest { event: usize, alg_id: u16 },

    #[error("Event {event} extends PCR {index}, which is out of range")]
    PcrIndexOutOfRange { event: usize, index: u32 },

    #[error("Event {event} data size {size} exceeds maximum")]
    EventTooLarge { event: usize, size: u32 },
}

// =============================================================================
// EventLogReason
// =============================================================================

#[derive(Debug, Error)]
pub enum EventLogReason {
    #[error("Event log records no {algorithm} digests but the bundle carries that bank")]
    BankNotLogged { algorithm: HashAlgorithm },

    #[error("PCR {index} ({algorithm}) replays to {replayed}, bundle has {claimed}")]
    ReplayMismatch {
        index: u8,
        algorithm: HashAlgorithm,
        replayed: String,
        claimed: String,
    },
}

// =============================================================================
// RegisterMismatchReason
// =============================================================================

#[derive(Debug, Error)]
pub enum RegisterMismatchReason {
    #[error("Quote {quote} selects PCR {index} ({algorithm}), which is missing from the bundle")]
    SelectedButMissing {
        quote: usize,
        index: u8,
        algorithm: HashAlgorithm,
    },

    #[error("Quote {quote} PCR digest does not match the bundle's PCR values")]
    DigestMismatch { quote: usize },

    #[error("PCR {index} ({algorithm}) is not covered by any quote")]
    NotQuoted { index: u8, algorithm: HashAlgorithm },
}
