// SPDX-License-Identifier: MIT OR Apache-2.0

//! Software root of trust
//!
//! Behaves like a freshly booted TPM: PCR banks that only ever extend, a
//! crypto-agile measurement log that records every measurement, and keys that
//! only the root which minted them can load. Used by `selftest --simulate`
//! and as the fixture for end-to-end tests.
//!
//! Nothing here is protected by hardware. Its quotes carry exactly the
//! structures a TPM produces, so the verifier cannot tell them apart.

use std::collections::{BTreeMap, BTreeSet};

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{anyhow, bail, Result};
use ecdsa::signature::hazmat::PrehashSigner;
use log::debug;
use p256::ecdsa::{Signature, SigningKey};
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};

use pcrattest_verify::eventlog::{
    EventLogBuilder, EV_EFI_BOOT_SERVICES_APPLICATION, EV_EFI_VARIABLE_DRIVER_CONFIG,
    EV_POST_CODE, EV_SEPARATOR, EV_S_CRTM_VERSION,
};
use pcrattest_verify::tpm::{encode_signature, quote_pcr_digest, ClockInfo, MAX_NONCE_SIZE};
use pcrattest_verify::{AkPublic, HashAlgorithm, PcrSelection, QuoteInfo, PCR_COUNT, TPM_VERSION_2_0};

use crate::root::{KeyHandle, KeyMaterial, QuoteResult, RootOfTrust};

/// AES-GCM nonce length of the key wrapping
const WRAP_NONCE_LEN: usize = 12;

/// AES-GCM tag length
const WRAP_TAG_LEN: usize = 16;

/// First transient object handle (TPM_HT_TRANSIENT)
const TRANSIENT_FIRST: u32 = 0x8000_0000;

/// Reported in every quote's firmwareVersion
const FIRMWARE_VERSION: u64 = 0x0001_0000_0000_0000;

/// A simulated TPM
pub struct SimulatedRoot {
    seed: [u8; 32],
    pcrs: BTreeMap<(HashAlgorithm, u8), Vec<u8>>,
    log: EventLogBuilder,
    keys: Vec<SigningKey>,
    clock: u64,
}

impl Default for SimulatedRoot {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedRoot {
    /// A new root with a random identity, booted with SHA-1 and SHA-256 banks
    pub fn new() -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        Self::with_seed(seed)
    }

    /// A root whose identity is `seed`: two roots with the same seed can load
    /// each other's keys.
    pub fn with_seed(seed: [u8; 32]) -> Self {
        Self::with_banks(seed, &[HashAlgorithm::Sha1, HashAlgorithm::Sha256])
    }

    /// A root with the given PCR banks
    pub fn with_banks(seed: [u8; 32], banks: &[HashAlgorithm]) -> Self {
        let mut pcrs = BTreeMap::new();
        for &bank in banks {
            for index in 0..PCR_COUNT as u8 {
                pcrs.insert((bank, index), bank.zero());
            }
        }

        let mut root = Self {
            seed,
            pcrs,
            log: EventLogBuilder::crypto_agile(banks),
            keys: Vec::new(),
            clock: 0,
        };
        root.boot();
        root
    }

    /// Firmware boot sequence over PCRs 0-7
    fn boot(&mut self) {
        let mut locality = b"StartupLocality\0".to_vec();
        locality.push(0);
        self.log.no_action(0, &locality);

        self.measure(0, EV_S_CRTM_VERSION, b"pcrattest simulated CRTM");
        self.measure(0, EV_POST_CODE, b"simulated POST");
        self.measure(1, EV_EFI_VARIABLE_DRIVER_CONFIG, b"BootOrder=0000");
        self.measure(7, EV_EFI_VARIABLE_DRIVER_CONFIG, b"SecureBoot=1");
        self.measure(7, EV_EFI_VARIABLE_DRIVER_CONFIG, b"PK");
        for pcr in 0..8 {
            self.measure(pcr, EV_SEPARATOR, &[0, 0, 0, 0]);
        }
        self.measure(4, EV_EFI_BOOT_SERVICES_APPLICATION, b"\\EFI\\BOOT\\BOOTX64.EFI");
    }

    /// Record `data` in the measurement log and extend it into `pcr`
    pub fn measure(&mut self, pcr: u8, event_type: u32, data: &[u8]) {
        for (bank, digest) in self.log.measure(pcr, event_type, data) {
            self.extend_digest(bank, pcr, &digest);
        }
    }

    /// Extend `data` into `pcr` in every bank without logging it
    ///
    /// Models a measurement the log does not account for.
    pub fn extend(&mut self, pcr: u8, data: &[u8]) {
        let banks: Vec<HashAlgorithm> = self.log.algorithms().to_vec();
        for bank in banks {
            let digest = bank.digest(data);
            self.extend_digest(bank, pcr, &digest);
        }
    }

    fn extend_digest(&mut self, bank: HashAlgorithm, pcr: u8, digest: &[u8]) {
        if let Some(value) = self.pcrs.get_mut(&(bank, pcr)) {
            *value = bank.extend(value.as_slice(), digest);
        }
    }

    fn value(&self, bank: HashAlgorithm, pcr: u8) -> Result<&[u8]> {
        self.pcrs
            .get(&(bank, pcr))
            .map(Vec::as_slice)
            .ok_or_else(|| anyhow!("PCR {} is not allocated in the {} bank", pcr, bank))
    }

    fn wrapping_cipher(&self) -> Result<Aes256Gcm> {
        let mut hasher = Sha256::new();
        hasher.update(b"pcrattest simulated storage key");
        hasher.update(self.seed);
        Aes256Gcm::new_from_slice(&hasher.finalize())
            .map_err(|_| anyhow!("invalid wrapping key length"))
    }

    /// nonce || AES-256-GCM(secret), authenticated with the public area
    fn wrap(&self, secret: &[u8], public: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; WRAP_NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .wrapping_cipher()?
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: secret,
                    aad: public,
                },
            )
            .map_err(|_| anyhow!("failed to wrap key"))?;

        let mut private = Vec::with_capacity(WRAP_NONCE_LEN + ciphertext.len());
        private.extend_from_slice(&nonce);
        private.extend_from_slice(&ciphertext);
        Ok(private)
    }

    fn unwrap_key(&self, private: &[u8], public: &[u8]) -> Result<Vec<u8>> {
        if private.len() < WRAP_NONCE_LEN + WRAP_TAG_LEN {
            bail!("private area too short: {} bytes", private.len());
        }
        let (nonce, ciphertext) = private.split_at(WRAP_NONCE_LEN);
        self.wrapping_cipher()?
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: public,
                },
            )
            .map_err(|_| anyhow!("key was not created by this root or its areas were modified"))
    }

    fn key(&self, handle: KeyHandle) -> Result<&SigningKey> {
        handle
            .0
            .checked_sub(TRANSIENT_FIRST)
            .and_then(|slot| self.keys.get(slot as usize))
            .ok_or_else(|| anyhow!("no key loaded at handle 0x{:08X}", handle.0))
    }
}

impl RootOfTrust for SimulatedRoot {
    fn version(&self) -> u8 {
        TPM_VERSION_2_0
    }

    fn mint_key(&mut self) -> Result<KeyMaterial> {
        let key = SigningKey::random(&mut OsRng);
        let public = AkPublic::from_verifying_key(key.verifying_key())
            .as_bytes()
            .to_vec();
        let private = self.wrap(&key.to_bytes(), &public)?;
        Ok(KeyMaterial { public, private })
    }

    fn load_key(&mut self, public: &[u8], private: &[u8]) -> Result<KeyHandle> {
        let secret = self.unwrap_key(private, public)?;
        let key = SigningKey::from_slice(&secret).map_err(|_| anyhow!("invalid key material"))?;

        let derived = AkPublic::from_verifying_key(key.verifying_key());
        if derived.as_bytes() != public {
            bail!("public area does not belong to the private key");
        }

        let handle = KeyHandle(TRANSIENT_FIRST + self.keys.len() as u32);
        self.keys.push(key);
        debug!("simulated key loaded at handle 0x{:08X}", handle.0);
        Ok(handle)
    }

    fn read_public(&mut self, handle: KeyHandle) -> Result<Vec<u8>> {
        let key = self.key(handle)?;
        Ok(AkPublic::from_verifying_key(key.verifying_key())
            .as_bytes()
            .to_vec())
    }

    fn quote(
        &mut self,
        handle: KeyHandle,
        nonce: &[u8],
        selections: &[PcrSelection],
    ) -> Result<QuoteResult> {
        if nonce.len() > MAX_NONCE_SIZE {
            bail!("TPM command failed: qualifyingData too long ({} bytes)", nonce.len());
        }

        let mut values = Vec::new();
        for selection in selections {
            for &index in &selection.indices {
                values.push(self.value(selection.algorithm, index)?);
            }
        }
        let pcr_digest = quote_pcr_digest(values);

        let key = self.key(handle)?;
        let signer = AkPublic::from_verifying_key(key.verifying_key());
        let attest = QuoteInfo {
            signer_name: signer.name(),
            extra_data: nonce.to_vec(),
            clock_info: ClockInfo {
                clock: self.clock,
                reset_count: 0,
                restart_count: 0,
                safe: true,
            },
            firmware_version: FIRMWARE_VERSION,
            selections: selections.to_vec(),
            pcr_digest,
        }
        .encode();

        let signature: Signature = key
            .sign_prehash(&Sha256::digest(&attest))
            .map_err(|e| anyhow!("signing failed: {}", e))?;

        self.clock += 1;
        Ok(QuoteResult {
            attest,
            signature: encode_signature(&signature),
        })
    }

    fn read_pcrs(
        &mut self,
        algorithm: HashAlgorithm,
        indices: &BTreeSet<u8>,
    ) -> Result<BTreeMap<u8, Vec<u8>>> {
        let mut values = BTreeMap::new();
        for &index in indices {
            values.insert(index, self.value(algorithm, index)?.to_vec());
        }
        Ok(values)
    }

    fn read_event_log(&mut self) -> Result<Vec<u8>> {
        Ok(self.log.build())
    }

    fn pcr_banks(&mut self) -> Result<Vec<PcrSelection>> {
        Ok(self
            .log
            .algorithms()
            .iter()
            .map(|&bank| PcrSelection::all(bank))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pcrattest_verify::tpm::verify_quote_signature;
    use pcrattest_verify::EventLog;

    #[test]
    fn test_pcrs_match_log_replay() {
        let mut root = SimulatedRoot::with_seed([7; 32]);
        let log = EventLog::parse(&root.read_event_log().unwrap()).unwrap();
        let replayed = log.replay();
        for ((bank, index), value) in &replayed {
            let indices = BTreeSet::from([*index]);
            let current = root.read_pcrs(*bank, &indices).unwrap();
            assert_eq!(&current[index], value, "{} PCR {}", bank, index);
        }
        assert!(replayed.contains_key(&(HashAlgorithm::Sha256, 7)));
    }

    #[test]
    fn test_unlogged_extend_diverges_from_log() {
        let mut root = SimulatedRoot::with_seed([7; 32]);
        root.extend(0, b"rootkit");
        let log = EventLog::parse(&root.read_event_log().unwrap()).unwrap();
        let replayed = log.replay();
        let current = root
            .read_pcrs(HashAlgorithm::Sha256, &BTreeSet::from([0]))
            .unwrap();
        assert_ne!(current[&0], replayed[&(HashAlgorithm::Sha256, 0)]);
    }

    #[test]
    fn test_key_round_trip_and_quote_signature() {
        let mut root = SimulatedRoot::with_seed([1; 32]);
        let material = root.mint_key().unwrap();
        let handle = root.load_key(&material.public, &material.private).unwrap();
        assert_eq!(root.read_public(handle).unwrap(), material.public);

        let quote = root
            .quote(handle, b"nonce", &[PcrSelection::all(HashAlgorithm::Sha256)])
            .unwrap();
        let ak = AkPublic::parse(&material.public).unwrap();
        verify_quote_signature(&quote.attest, &quote.signature, &ak).unwrap();

        let info = QuoteInfo::parse(&quote.attest).unwrap();
        assert_eq!(info.extra_data, b"nonce");
        assert_eq!(info.signer_name, ak.name());
    }

    #[test]
    fn test_foreign_key_does_not_load() {
        let mut minter = SimulatedRoot::with_seed([1; 32]);
        let material = minter.mint_key().unwrap();

        let mut other = SimulatedRoot::with_seed([2; 32]);
        assert!(other.load_key(&material.public, &material.private).is_err());

        let mut twin = SimulatedRoot::with_seed([1; 32]);
        assert!(twin.load_key(&material.public, &material.private).is_ok());
    }

    #[test]
    fn test_swapped_public_area_does_not_load() {
        let mut root = SimulatedRoot::with_seed([1; 32]);
        let first = root.mint_key().unwrap();
        let second = root.mint_key().unwrap();
        assert!(root.load_key(&second.public, &first.private).is_err());
    }

    #[test]
    fn test_unallocated_bank_rejected() {
        let mut root = SimulatedRoot::with_banks([1; 32], &[HashAlgorithm::Sha256]);
        let material = root.mint_key().unwrap();
        let handle = root.load_key(&material.public, &material.private).unwrap();
        assert!(root
            .quote(handle, b"n", &[PcrSelection::all(HashAlgorithm::Sha1)])
            .is_err());
        assert!(root
            .read_pcrs(HashAlgorithm::Sha1, &BTreeSet::from([0]))
            .is_err());
    }

    #[test]
    fn test_unknown_handle_rejected() {
        let mut root = SimulatedRoot::with_seed([1; 32]);
        assert!(root.read_public(KeyHandle(0x4000_0001)).is_err());
        assert!(root.read_public(KeyHandle(TRANSIENT_FIRST)).is_err());
    }
}
