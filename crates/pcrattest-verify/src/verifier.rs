// SPDX-License-Identifier: MIT OR Apache-2.0

//! The attestation verification pipeline.

use std::collections::BTreeSet;

use log::debug;

use crate::error::{
    EventLogReason, MalformedReason, RegisterMismatchReason, SignatureInvalidReason, VerifyError,
};
use crate::eventlog::EventLog;
use crate::model::{PlatformAttestation, TPM_VERSION_2_0};
use crate::pcr::{HashAlgorithm, PcrBanks};
use crate::tpm::{quote_pcr_digest, verify_quote_signature, AkPublic, QuoteInfo};

/// What a successful verification established.
#[derive(Debug, Clone)]
pub struct VerifiedAttestation {
    /// PCR values, each covered by a verified quote
    pub pcrs: PcrBanks,
    /// Parsed quotes, in bundle order
    pub quotes: Vec<QuoteInfo>,
    pub event_log: EventLog,
}

/// Verifies bundles against one trusted attestation key.
///
/// Holds no mutable state; one instance may serve concurrent callers.
#[derive(Debug, Clone)]
pub struct AttestationVerifier {
    ak_public: AkPublic,
}

impl AttestationVerifier {
    pub fn new(ak_public: AkPublic) -> Self {
        Self { ak_public }
    }

    pub fn ak_public(&self) -> &AkPublic {
        &self.ak_public
    }

    /// Run every check in order and stop at the first failure.
    ///
    /// 1. bundle structure
    /// 2. quote signatures and nonce binding
    /// 3. event log structure
    /// 4. event log replay against the PCR values
    /// 5. PCR values against each quote's signed digest
    pub fn check(
        &self,
        bundle: &PlatformAttestation,
        expected_nonce: &[u8],
    ) -> Result<VerifiedAttestation, VerifyError> {
        let (bundle_ak, pcrs) = check_structure(bundle)?;
        debug!(
            "bundle structure ok: {} quotes, {} PCR values",
            bundle.quotes.len(),
            pcrs.len()
        );

        let quotes = self.check_quotes(bundle, &bundle_ak, expected_nonce)?;
        debug!("{} quote signatures verified", quotes.len());

        let event_log = EventLog::parse(&bundle.event_log).map_err(MalformedReason::EventLog)?;
        debug!(
            "event log parsed: {:?}, {} events",
            event_log.format,
            event_log.events.len()
        );

        check_replay(&event_log, &pcrs)?;
        check_registers(&quotes, &pcrs)?;

        Ok(VerifiedAttestation {
            pcrs,
            quotes,
            event_log,
        })
    }

    fn check_quotes(
        &self,
        bundle: &PlatformAttestation,
        bundle_ak: &AkPublic,
        expected_nonce: &[u8],
    ) -> Result<Vec<QuoteInfo>, VerifyError> {
        if *bundle_ak != self.ak_public {
            return Err(SignatureInvalidReason::AkPublicKeyMismatch.into());
        }

        let mut quotes = Vec::with_capacity(bundle.quotes.len());
        for (index, quote) in bundle.quotes.iter().enumerate() {
            verify_quote_signature(&quote.quote, &quote.signature, &self.ak_public)
                .map_err(|reason| VerifyError::from(reason).for_quote(index))?;

            let info = QuoteInfo::parse(&quote.quote)
                .map_err(|reason| VerifyError::from(MalformedReason::Attest(reason)).for_quote(index))?;

            if info.extra_data != expected_nonce {
                return Err(VerifyError::NonceMismatch { quote: index });
            }
            quotes.push(info);
        }
        Ok(quotes)
    }
}

fn check_structure(bundle: &PlatformAttestation) -> Result<(AkPublic, PcrBanks), VerifyError> {
    if bundle.tpm_version != TPM_VERSION_2_0 {
        return Err(MalformedReason::UnsupportedVersion {
            version: bundle.tpm_version,
        }
        .into());
    }

    let ak = AkPublic::parse(&bundle.public).map_err(MalformedReason::AkPublic)?;

    if bundle.quotes.is_empty() {
        return Err(MalformedReason::NoQuotes.into());
    }
    for (index, quote) in bundle.quotes.iter().enumerate() {
        if quote.version != bundle.tpm_version {
            return Err(MalformedReason::QuoteVersionMismatch {
                index,
                expected: bundle.tpm_version,
                got: quote.version,
            }
            .into());
        }
    }

    let pcrs = PcrBanks::from_wire(&bundle.pcrs)?;
    Ok((ak, pcrs))
}

/// Every bank the bundle carries must be recorded by the log, and every PCR
/// the log extends must hold the replayed value.
fn check_replay(event_log: &EventLog, pcrs: &PcrBanks) -> Result<(), VerifyError> {
    for algorithm in pcrs.algorithms() {
        if !event_log.algorithms.contains(&algorithm) {
            return Err(EventLogReason::BankNotLogged { algorithm }.into());
        }
    }

    let replayed = event_log.replay();
    for (algorithm, index, claimed) in pcrs.iter() {
        if let Some(value) = replayed.get(&(algorithm, index)) {
            if value.as_slice() != claimed {
                return Err(EventLogReason::ReplayMismatch {
                    index,
                    algorithm,
                    replayed: hex::encode(value),
                    claimed: hex::encode(claimed),
                }
                .into());
            }
        }
    }
    debug!("event log replay matches {} extended PCRs", replayed.len());
    Ok(())
}

/// Each quote's signed digest must match the bundle's values for the PCRs it
/// selects, and every bundle PCR must be covered by some quote.
fn check_registers(quotes: &[QuoteInfo], pcrs: &PcrBanks) -> Result<(), VerifyError> {
    let mut covered: BTreeSet<(HashAlgorithm, u8)> = BTreeSet::new();

    for (quote_index, quote) in quotes.iter().enumerate() {
        let mut selected = Vec::new();
        for selection in &quote.selections {
            for &index in &selection.indices {
                let value = pcrs.get(selection.algorithm, index).ok_or(
                    RegisterMismatchReason::SelectedButMissing {
                        quote: quote_index,
                        index,
                        algorithm: selection.algorithm,
                    },
                )?;
                selected.push(value);
                covered.insert((selection.algorithm, index));
            }
        }

        if quote_pcr_digest(selected) != quote.pcr_digest {
            return Err(RegisterMismatchReason::DigestMismatch { quote: quote_index }.into());
        }
    }

    for (algorithm, index, _) in pcrs.iter() {
        if !covered.contains(&(algorithm, index)) {
            return Err(RegisterMismatchReason::NotQuoted { index, algorithm }.into());
        }
    }
    Ok(())
}
