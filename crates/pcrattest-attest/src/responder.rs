// SPDX-License-Identifier: MIT OR Apache-2.0

//! Answering a verifier's challenge with a platform attestation.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, info, warn};

use pcrattest_verify::{
    HashAlgorithm, PcrSelection, PcrValue, PlatformAttestation, Quote, MAX_NONCE_SIZE, PCR_COUNT,
};

use crate::ak::AttestationKey;
use crate::error::Error;
use crate::root::RootOfTrust;

/// How many times to re-read when PCRs change while quoting
const MAX_ATTEMPTS: usize = 3;

/// SHA-256 bank, PCRs 0-23
pub fn default_selector() -> Vec<PcrSelection> {
    vec![PcrSelection::all(HashAlgorithm::Sha256)]
}

/// Every allocated bank of `root`, quoted one bank per quote
pub fn allocated_selector<R: RootOfTrust + ?Sized>(
    root: &mut R,
) -> Result<Vec<PcrSelection>, Error> {
    let banks = root
        .pcr_banks()
        .context("failed to read the PCR allocation")
        .map_err(Error::Attestation)?;
    if banks.is_empty() {
        return Err(Error::Attestation(anyhow!("no PCR banks are allocated")));
    }
    Ok(banks)
}

type BankValues = BTreeMap<HashAlgorithm, BTreeMap<u8, Vec<u8>>>;

/// Builds signed attestations from a root of trust and a loaded AK
#[derive(Debug, Clone, Default)]
pub struct ChallengeResponder;

impl ChallengeResponder {
    pub fn new() -> Self {
        Self
    }

    /// Quote every selection in `selector` over `nonce` and bundle the quotes
    /// with the PCR values and measurement log
    ///
    /// Reads hardware state only. If a PCR changes while quoting, the whole
    /// attestation is taken again.
    pub fn respond<R: RootOfTrust + ?Sized>(
        &self,
        root: &mut R,
        key: &AttestationKey,
        nonce: &[u8],
        selector: &[PcrSelection],
    ) -> Result<PlatformAttestation, Error> {
        check_request(nonce, selector).map_err(Error::Attestation)?;

        for attempt in 1..=MAX_ATTEMPTS {
            match attest_once(root, key, nonce, selector).map_err(Error::Attestation)? {
                Some(bundle) => {
                    info!(
                        "attestation ready: {} quotes, {} PCR values, {} byte event log",
                        bundle.quotes.len(),
                        bundle.pcrs.len(),
                        bundle.event_log.len()
                    );
                    return Ok(bundle);
                }
                None => warn!(
                    "PCRs changed while quoting (attempt {}/{})",
                    attempt, MAX_ATTEMPTS
                ),
            }
        }

        Err(Error::Attestation(anyhow!(
            "PCRs kept changing across {} attempts",
            MAX_ATTEMPTS
        )))
    }
}

fn check_request(nonce: &[u8], selector: &[PcrSelection]) -> Result<()> {
    if nonce.is_empty() {
        bail!("nonce is empty");
    }
    if nonce.len() > MAX_NONCE_SIZE {
        bail!(
            "nonce is {} bytes, at most {} fit in a quote",
            nonce.len(),
            MAX_NONCE_SIZE
        );
    }
    if selector.is_empty() {
        bail!("no PCRs selected");
    }

    let mut banks = BTreeSet::new();
    for selection in selector {
        if selection.indices.is_empty() {
            bail!("selection for the {} bank is empty", selection.algorithm);
        }
        if let Some(index) = selection.indices.iter().find(|&&i| i as usize >= PCR_COUNT) {
            bail!("PCR index {} out of range (0-{})", index, PCR_COUNT - 1);
        }
        if !banks.insert(selection.algorithm) {
            bail!("{} bank selected more than once", selection.algorithm);
        }
    }
    Ok(())
}

fn read_banks<R: RootOfTrust + ?Sized>(
    root: &mut R,
    selector: &[PcrSelection],
) -> Result<BankValues> {
    let mut banks = BTreeMap::new();
    for selection in selector {
        let values = root
            .read_pcrs(selection.algorithm, &selection.indices)
            .with_context(|| format!("failed to read the {} bank", selection.algorithm))?;
        banks.insert(selection.algorithm, values);
    }
    Ok(banks)
}

/// One attestation, or `None` if the PCRs moved underneath it
fn attest_once<R: RootOfTrust + ?Sized>(
    root: &mut R,
    key: &AttestationKey,
    nonce: &[u8],
    selector: &[PcrSelection],
) -> Result<Option<PlatformAttestation>> {
    let before = read_banks(root, selector)?;
    let event_log = root
        .read_event_log()
        .context("failed to read the measurement log")?;

    let mut quotes = Vec::with_capacity(selector.len());
    for selection in selector {
        let quote = root
            .quote(key.handle(), nonce, std::slice::from_ref(selection))
            .with_context(|| format!("failed to quote the {} bank", selection.algorithm))?;
        debug!(
            "quoted {} PCRs of the {} bank",
            selection.indices.len(),
            selection.algorithm
        );
        quotes.push(Quote {
            version: root.version(),
            quote: quote.attest,
            signature: quote.signature,
        });
    }

    let after = read_banks(root, selector)?;
    if before != after {
        return Ok(None);
    }

    let mut pcrs = Vec::new();
    for (algorithm, values) in after {
        for (index, digest) in values {
            pcrs.push(PcrValue {
                index: index as i64,
                digest,
                digest_alg: algorithm.wire_id(),
            });
        }
    }

    Ok(Some(PlatformAttestation {
        tpm_version: root.version(),
        public: key.public().as_bytes().to_vec(),
        quotes,
        pcrs,
        event_log,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_validation() {
        let sha256 = default_selector();
        assert!(check_request(&[1; 16], &sha256).is_ok());
        assert!(check_request(&[1; 64], &sha256).is_ok());
        assert!(check_request(&[], &sha256).is_err());
        assert!(check_request(&[1; 65], &sha256).is_err());
        assert!(check_request(&[1; 16], &[]).is_err());
    }

    #[test]
    fn test_allocated_selector_covers_every_bank() {
        let mut root = crate::sim::SimulatedRoot::new();
        let selector = allocated_selector(&mut root).unwrap();
        assert_eq!(
            selector,
            vec![
                PcrSelection::all(HashAlgorithm::Sha1),
                PcrSelection::all(HashAlgorithm::Sha256),
            ]
        );
        assert!(check_request(&[1; 16], &selector).is_ok());
    }

    #[test]
    fn test_selector_validation() {
        let nonce = [1u8; 16];
        let empty = PcrSelection::new(HashAlgorithm::Sha256, std::iter::empty());
        assert!(check_request(&nonce, &[empty]).is_err());

        let out_of_range = PcrSelection::new(HashAlgorithm::Sha256, [0, 24]);
        let err = check_request(&nonce, &[out_of_range]).unwrap_err();
        assert!(err.to_string().contains("24"));

        let twice = [
            PcrSelection::new(HashAlgorithm::Sha256, [0]),
            PcrSelection::new(HashAlgorithm::Sha256, [1]),
        ];
        assert!(check_request(&nonce, &twice).is_err());

        let two_banks = [
            PcrSelection::new(HashAlgorithm::Sha1, 0..8),
            PcrSelection::all(HashAlgorithm::Sha256),
        ];
        assert!(check_request(&nonce, &two_banks).is_ok());
    }
}
