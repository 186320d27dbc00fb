// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test support: software-signed attestation bundles.
//!
//! Gated behind `#[cfg(any(test, feature = "test-support"))]`, stripped
//! from production builds unless explicitly opted in.

use ecdsa::signature::hazmat::PrehashSigner;
use p256::ecdsa::{Signature as P256Signature, SigningKey};
use sha2::{Digest, Sha256};

use crate::eventlog::{
    EventLogBuilder, EV_EFI_BOOT_SERVICES_APPLICATION, EV_EFI_VARIABLE_DRIVER_CONFIG,
    EV_POST_CODE, EV_SEPARATOR, EV_S_CRTM_VERSION,
};
use crate::model::{PcrValue, PlatformAttestation, Quote, TPM_VERSION_2_0};
use crate::pcr::{HashAlgorithm, PcrSelection};
use crate::tpm::{encode_signature, quote_pcr_digest, AkPublic, ClockInfo, QuoteInfo};

/// Nonce used throughout the tests.
pub const TEST_NONCE: [u8; 16] = [1, 2, 3, 4, 5, 6, 7, 8, 1, 2, 3, 4, 5, 6, 7, 8];

/// Deterministic P-256 key derived from a one-byte seed.
pub fn test_signing_key(seed: u8) -> SigningKey {
    let secret: [u8; 32] = core::array::from_fn(|i| seed.wrapping_add(i as u8).max(1));
    SigningKey::from_bytes(&secret.into()).unwrap()
}

/// Sign TPMS_ATTEST bytes the way a TPM does: ECDSA over SHA-256(attest).
pub fn sign_quote(attest: &[u8], key: &SigningKey) -> Vec<u8> {
    let signature: P256Signature = key.sign_prehash(&Sha256::digest(attest)).unwrap();
    encode_signature(&signature)
}

/// A short firmware boot sequence over PCRs 0-7.
pub fn sample_boot_log(banks: &[HashAlgorithm]) -> EventLogBuilder {
    let mut log = EventLogBuilder::crypto_agile(banks);
    log.no_action(0, b"StartupLocality\0\x00");
    log.measure(0, EV_S_CRTM_VERSION, b"CRTM 1.0");
    log.measure(0, EV_POST_CODE, b"POST CODE");
    log.measure(1, EV_EFI_VARIABLE_DRIVER_CONFIG, b"BootOrder=0001");
    log.measure(7, EV_EFI_VARIABLE_DRIVER_CONFIG, b"SecureBoot=1");
    log.measure(4, EV_EFI_BOOT_SERVICES_APPLICATION, b"\\EFI\\BOOT\\BOOTX64.EFI");
    for pcr in 0..8 {
        log.measure(pcr, EV_SEPARATOR, &[0, 0, 0, 0]);
    }
    log
}

/// Builds self-consistent bundles signed by a software AK.
pub struct BundleBuilder {
    key: SigningKey,
    log_banks: Vec<HashAlgorithm>,
    quotes: Vec<Vec<PcrSelection>>,
}

impl Default for BundleBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BundleBuilder {
    /// One quote over SHA-256 PCRs 0-23; log records SHA-1 and SHA-256.
    pub fn new() -> Self {
        Self::with_key_seed(1)
    }

    pub fn with_key_seed(seed: u8) -> Self {
        Self {
            key: test_signing_key(seed),
            log_banks: vec![HashAlgorithm::Sha1, HashAlgorithm::Sha256],
            quotes: vec![vec![PcrSelection::all(HashAlgorithm::Sha256)]],
        }
    }

    /// Two quotes: SHA-256 PCRs 0-11 and 12-23.
    pub fn with_split_quotes(mut self) -> Self {
        self.quotes = vec![
            vec![PcrSelection::new(HashAlgorithm::Sha256, 0..12)],
            vec![PcrSelection::new(HashAlgorithm::Sha256, 12..24)],
        ];
        self
    }

    pub fn with_quotes(mut self, quotes: Vec<Vec<PcrSelection>>) -> Self {
        self.quotes = quotes;
        self
    }

    pub fn with_log_banks(mut self, banks: &[HashAlgorithm]) -> Self {
        self.log_banks = banks.to_vec();
        self
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.key
    }

    pub fn ak_public(&self) -> AkPublic {
        AkPublic::from_verifying_key(self.key.verifying_key())
    }

    /// Build a bundle whose PCR values are the replay of the sample log.
    pub fn build(&self, nonce: &[u8]) -> PlatformAttestation {
        let event_log = sample_boot_log(&self.log_banks).build();
        let replayed = crate::eventlog::EventLog::parse(&event_log)
            .unwrap()
            .replay();
        let value_of = |alg: HashAlgorithm, index: u8| {
            replayed
                .get(&(alg, index))
                .cloned()
                .unwrap_or_else(|| alg.zero())
        };

        let ak = self.ak_public();
        let mut pcrs = Vec::new();
        let mut quotes = Vec::new();
        for selections in &self.quotes {
            let mut values = Vec::new();
            for selection in selections {
                for &index in &selection.indices {
                    let value = value_of(selection.algorithm, index);
                    if !pcrs.iter().any(|p: &PcrValue| {
                        p.index == index as i64 && p.digest_alg == selection.algorithm.wire_id()
                    }) {
                        pcrs.push(PcrValue {
                            index: index as i64,
                            digest: value.clone(),
                            digest_alg: selection.algorithm.wire_id(),
                        });
                    }
                    values.push(value);
                }
            }

            let attest = QuoteInfo {
                signer_name: ak.name(),
                extra_data: nonce.to_vec(),
                clock_info: ClockInfo {
                    clock: 1_000_000,
                    reset_count: 1,
                    restart_count: 0,
                    safe: true,
                },
                firmware_version: 0x0001_0002_0003_0004,
                selections: selections.clone(),
                pcr_digest: quote_pcr_digest(values.iter().map(Vec::as_slice)),
            }
            .encode();

            quotes.push(Quote {
                version: TPM_VERSION_2_0,
                signature: sign_quote(&attest, &self.key),
                quote: attest,
            });
        }

        PlatformAttestation {
            tpm_version: TPM_VERSION_2_0,
            public: ak.as_bytes().to_vec(),
            quotes,
            pcrs,
            event_log,
        }
    }
}
