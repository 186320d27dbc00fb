// SPDX-License-Identifier: MIT OR Apache-2.0

//! The hardware root of trust and its TPM 2.0 implementation.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};

use pcrattest_verify::{HashAlgorithm, PcrSelection, PCR_COUNT, TPM_VERSION_2_0};

use crate::error::Error;
use crate::{KeyOps, PcrOps, Tpm};

/// Default TPM device: the kernel resource manager
pub const DEFAULT_TPM_DEVICE: &str = "/dev/tpmrm0";

/// Default location of the firmware measurement log
pub const DEFAULT_EVENT_LOG: &str = "/sys/kernel/security/tpm0/binary_bios_measurements";

/// A key loaded into a root of trust
///
/// Only meaningful to the root that returned it, and only while that root
/// stays open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyHandle(pub(crate) u32);

impl KeyHandle {
    pub fn raw(self) -> u32 {
        self.0
    }
}

/// Public and private areas of a newly minted key
#[derive(Debug, Clone)]
pub struct KeyMaterial {
    /// TPMT_PUBLIC
    pub public: Vec<u8>,
    /// Opaque, only loadable by the root that minted it
    pub private: Vec<u8>,
}

/// A signed quote
#[derive(Debug, Clone)]
pub struct QuoteResult {
    /// TPMS_ATTEST
    pub attest: Vec<u8>,
    /// TPMT_SIGNATURE
    pub signature: Vec<u8>,
}

/// A hardware root of trust: key generation, quoting and measurement reads.
///
/// Every operation takes `&mut self`, so one open root serves one caller at
/// a time.
pub trait RootOfTrust {
    /// TPM version this root implements
    fn version(&self) -> u8;

    /// Generate a new attestation key inside the root
    fn mint_key(&mut self) -> Result<KeyMaterial>;

    /// Load a key previously minted by this root
    fn load_key(&mut self, public: &[u8], private: &[u8]) -> Result<KeyHandle>;

    /// TPMT_PUBLIC of a loaded key, as the root reports it
    fn read_public(&mut self, handle: KeyHandle) -> Result<Vec<u8>>;

    /// Sign the current values of `selections`, binding `nonce`
    fn quote(
        &mut self,
        handle: KeyHandle,
        nonce: &[u8],
        selections: &[PcrSelection],
    ) -> Result<QuoteResult>;

    /// Current values of `indices` in one bank
    fn read_pcrs(
        &mut self,
        algorithm: HashAlgorithm,
        indices: &BTreeSet<u8>,
    ) -> Result<BTreeMap<u8, Vec<u8>>>;

    /// The binary measurement log
    fn read_event_log(&mut self) -> Result<Vec<u8>>;

    /// Allocated PCR banks, each with the PCRs it holds
    fn pcr_banks(&mut self) -> Result<Vec<PcrSelection>>;
}

// =============================================================================
// TPM device
// =============================================================================

/// Set while a `TpmRoot` is open in this process
static TPM_ROOT_OPEN: AtomicBool = AtomicBool::new(false);

/// Root of trust backed by a TPM 2.0 device
///
/// At most one is open per process. Dropping it flushes the storage key and
/// every key it loaded.
pub struct TpmRoot {
    tpm: Tpm,
    event_log_path: PathBuf,
    srk: Option<u32>,
    loaded: Vec<u32>,
}

impl TpmRoot {
    /// Open the TPM at `device`, reading the measurement log from `event_log`
    pub fn open(device: impl AsRef<Path>, event_log: impl Into<PathBuf>) -> Result<Self, Error> {
        if TPM_ROOT_OPEN
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::RootUnavailable(anyhow!(
                "a TPM root is already open in this process"
            )));
        }

        let mut tpm = match Tpm::open_path(device.as_ref()) {
            Ok(tpm) => tpm,
            Err(e) => {
                TPM_ROOT_OPEN.store(false, Ordering::Release);
                return Err(Error::RootUnavailable(e));
            }
        };

        match tpm.describe() {
            Ok(description) => info!(
                "opened TPM {} at {}",
                description,
                device.as_ref().display()
            ),
            Err(e) => debug!("could not read TPM properties: {:#}", e),
        }

        Ok(Self {
            tpm,
            event_log_path: event_log.into(),
            srk: None,
            loaded: Vec::new(),
        })
    }

    /// Open the default device and measurement log
    pub fn open_default() -> Result<Self, Error> {
        Self::open(DEFAULT_TPM_DEVICE, DEFAULT_EVENT_LOG)
    }

    fn srk(&mut self) -> Result<u32> {
        if let Some(handle) = self.srk {
            return Ok(handle);
        }
        let handle = self.tpm.create_srk().context("failed to create storage root key")?;
        debug!("storage root key at handle 0x{:08X}", handle);
        self.srk = Some(handle);
        Ok(handle)
    }
}

impl RootOfTrust for TpmRoot {
    fn version(&self) -> u8 {
        TPM_VERSION_2_0
    }

    fn mint_key(&mut self) -> Result<KeyMaterial> {
        let srk = self.srk()?;
        let created = self.tpm.create_ak(srk)?;
        Ok(KeyMaterial {
            public: created.public,
            private: created.private,
        })
    }

    fn load_key(&mut self, public: &[u8], private: &[u8]) -> Result<KeyHandle> {
        let srk = self.srk()?;
        let handle = self.tpm.load(srk, public, private)?;
        debug!("loaded key at handle 0x{:08X}", handle);
        self.loaded.push(handle);
        Ok(KeyHandle(handle))
    }

    fn read_public(&mut self, handle: KeyHandle) -> Result<Vec<u8>> {
        self.tpm.read_public(handle.0)
    }

    fn quote(
        &mut self,
        handle: KeyHandle,
        nonce: &[u8],
        selections: &[PcrSelection],
    ) -> Result<QuoteResult> {
        let output = self.tpm.quote(handle.0, nonce, selections)?;
        Ok(QuoteResult {
            attest: output.attest_data,
            signature: output.signature,
        })
    }

    fn read_pcrs(
        &mut self,
        algorithm: HashAlgorithm,
        indices: &BTreeSet<u8>,
    ) -> Result<BTreeMap<u8, Vec<u8>>> {
        self.tpm.pcr_read_bank(algorithm, indices)
    }

    fn read_event_log(&mut self) -> Result<Vec<u8>> {
        fs::read(&self.event_log_path).with_context(|| {
            format!(
                "failed to read measurement log {}",
                self.event_log_path.display()
            )
        })
    }

    fn pcr_banks(&mut self) -> Result<Vec<PcrSelection>> {
        let banks = self
            .tpm
            .get_pcr_allocation()?
            .into_iter()
            .map(|(algorithm, indices)| {
                PcrSelection::new(algorithm, indices.into_iter().filter(|&i| (i as usize) < PCR_COUNT))
            })
            .filter(|selection| !selection.indices.is_empty())
            .collect();
        Ok(banks)
    }
}

impl Drop for TpmRoot {
    fn drop(&mut self) {
        for handle in self.loaded.drain(..).chain(self.srk.take()) {
            if let Err(e) = self.tpm.flush_context(handle) {
                warn!("failed to flush handle 0x{:08X}: {:#}", handle, e);
            }
        }
        TPM_ROOT_OPEN.store(false, Ordering::Release);
    }
}
