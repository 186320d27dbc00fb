// SPDX-License-Identifier: MIT OR Apache-2.0

//! Typed errors for the attestation side.
//!
//! Device-level failures (TPM response codes, short reads, I/O) are carried
//! as the `anyhow::Error` source; the variant tells which operation failed.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to mint attestation key")]
    KeyMint(#[source] anyhow::Error),

    #[error("failed to load attestation key")]
    KeyLoad(#[source] anyhow::Error),

    #[error("failed to produce attestation")]
    Attestation(#[source] anyhow::Error),

    #[error("key store error")]
    Store(#[source] anyhow::Error),

    #[error("hardware root of trust unavailable")]
    RootUnavailable(#[source] anyhow::Error),
}
