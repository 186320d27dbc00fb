// SPDX-License-Identifier: MIT OR Apache-2.0

//! TPM 2.0 attestation: hardware root of trust, attestation keys and
//! challenge responses
//!
//! Direct communication with the TPM via /dev/tpmrm0 without any C dependencies.
//! Command and response framing follows TPM 2.0 Part 3 (Commands).

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::debug;
use rand_core::{OsRng, RngCore};

use pcrattest_verify::tpm::TpmWriter;

use crate::command::{Command, Reader, Response, HEADER_SIZE};

pub mod ak;
mod command;
pub mod error;
pub mod key;
pub mod pcr;
pub mod responder;
pub mod root;
pub mod selftest;
pub mod sim;

// Re-export extension traits for convenience
pub use key::KeyOps;
pub use pcr::PcrOps;

pub use ak::{
    AttestationKey, AttestationKeyManager, BlobStore, FileBlobStore, KeyBlob, MemoryBlobStore,
};
pub use command::TpmResponseError;
pub use error::Error;
pub use responder::{allocated_selector, default_selector, ChallengeResponder};
pub use root::{KeyHandle, KeyMaterial, QuoteResult, RootOfTrust, TpmRoot};
pub use sim::SimulatedRoot;

/// Size of nonces generated by this crate
pub const NONCE_SIZE: usize = 32;

/// Generate a fresh random nonce
pub fn fresh_nonce() -> Vec<u8> {
    let mut nonce = vec![0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// TPM 2.0 command codes
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TpmCc {
    CreatePrimary = 0x00000131,
    Create = 0x00000153,
    Load = 0x00000157,
    Quote = 0x00000158,
    FlushContext = 0x00000165,
    ReadPublic = 0x00000173,
    GetCapability = 0x0000017A,
    PcrRead = 0x0000017E,
}

/// TPM 2.0 structure tags
#[repr(u16)]
#[derive(Debug, Clone, Copy)]
pub enum TpmSt {
    NoSessions = 0x8001,
    Sessions = 0x8002,
}

/// TPM 2.0 algorithm identifiers used in key templates
///
/// PCR bank algorithms are [`pcrattest_verify::HashAlgorithm`].
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TpmAlg {
    Aes = 0x0006,
    Null = 0x0010,
    EcDsa = 0x0018,
    Ecc = 0x0023,
    Cfb = 0x0043,
}

/// Owner hierarchy
pub const TPM_RH_OWNER: u32 = 0x40000001;

/// Password authorization session
pub const TPM_RS_PW: u32 = 0x40000009;

pub const TPM_CAP_PCRS: u32 = 0x00000005;
pub const TPM_CAP_TPM_PROPERTIES: u32 = 0x00000006;

pub const TPM_PT_MANUFACTURER: u32 = 0x00000105;
pub const TPM_PT_FIRMWARE_VERSION_1: u32 = 0x0000010B;

/// Largest response any TPM 2.0 command produces (TPM_PT_MAX_RESPONSE_SIZE)
const MAX_RESPONSE_SIZE: usize = 4096;

/// Attempts at a command the TPM answers with a retryable warning
const MAX_TPM_ATTEMPTS: u32 = 5;

/// TPM 2.0 device context
pub struct Tpm {
    device: File,
}

impl Tpm {
    /// Open a TPM character device (normally /dev/tpmrm0)
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let device = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("failed to open TPM device at {}", path.display()))?;
        Ok(Self { device })
    }

    /// Run `command`, repeating it while the TPM asks to retry
    pub(crate) fn execute(&mut self, command: Command) -> Result<Response> {
        let encoded = command.encode();
        let mut attempt = 1;
        loop {
            match self.transmit(command.code(), &encoded)? {
                Ok(body) => return command.parse_response(body),
                Err(rc) if rc.is_retryable() && attempt < MAX_TPM_ATTEMPTS => {
                    debug!("{}, retrying (attempt {}/{})", rc, attempt, MAX_TPM_ATTEMPTS);
                    attempt += 1;
                    thread::sleep(Duration::from_millis(20 * attempt as u64));
                }
                Err(rc) => return Err(rc.into()),
            }
        }
    }

    /// One command/response exchange. The outer error is an I/O or framing
    /// failure, the inner one a TPM response code.
    fn transmit(
        &mut self,
        code: TpmCc,
        command: &[u8],
    ) -> Result<std::result::Result<Vec<u8>, TpmResponseError>> {
        self.device
            .write_all(command)
            .with_context(|| format!("failed to send TPM2_{:?}", code))?;

        let mut header = [0u8; HEADER_SIZE];
        self.device
            .read_exact(&mut header)
            .with_context(|| format!("failed to read TPM2_{:?} response header", code))?;
        let size = u32::from_be_bytes([header[2], header[3], header[4], header[5]]) as usize;
        let rc = u32::from_be_bytes([header[6], header[7], header[8], header[9]]);

        if !(HEADER_SIZE..=MAX_RESPONSE_SIZE).contains(&size) {
            bail!("TPM2_{:?} response has invalid size {}", code, size);
        }
        let mut body = vec![0u8; size - HEADER_SIZE];
        self.device
            .read_exact(&mut body)
            .with_context(|| format!("failed to read TPM2_{:?} response body", code))?;

        if rc != 0 {
            return Ok(Err(TpmResponseError { command: code, code: rc }));
        }
        Ok(Ok(body))
    }

    /// Flush a transient object
    pub fn flush_context(&mut self, handle: u32) -> Result<()> {
        self.execute(Command::new(TpmCc::FlushContext).parameters(TpmWriter::new().u32(handle)))?;
        Ok(())
    }

    /// Execute TPM2_GetCapability, returning a reader positioned at the
    /// capability data. moreData is ignored: callers ask for more than any
    /// TPM reports.
    pub(crate) fn get_capability(
        &mut self,
        capability: u32,
        property: u32,
        count: u32,
    ) -> Result<Reader> {
        let mut response = self.execute(
            Command::new(TpmCc::GetCapability)
                .parameters(TpmWriter::new().u32(capability).u32(property).u32(count)),
        )?;
        let reader = &mut response.parameters;

        let _more_data = reader.u8()?;
        let returned = reader.u32()?;
        if returned != capability {
            bail!(
                "TPM returned capability 0x{:08X}, asked for 0x{:08X}",
                returned,
                capability
            );
        }
        Ok(response.parameters)
    }

    /// One TPM_PT fixed property
    pub fn get_property(&mut self, property: u32) -> Result<u32> {
        let mut reader = self.get_capability(TPM_CAP_TPM_PROPERTIES, property, 1)?;

        // TPML_TAGGED_TPM_PROPERTY
        if reader.u32()? == 0 {
            bail!("TPM does not report property 0x{:08X}", property);
        }
        let returned = reader.u32()?;
        if returned != property {
            bail!(
                "TPM returned property 0x{:08X}, asked for 0x{:08X}",
                returned,
                property
            );
        }
        reader.u32()
    }

    /// Manufacturer and firmware version, e.g. `"IFX 7.85"`
    pub fn describe(&mut self) -> Result<String> {
        let manufacturer = self.get_property(TPM_PT_MANUFACTURER)?;
        let firmware = self.get_property(TPM_PT_FIRMWARE_VERSION_1)?;
        let vendor: String = manufacturer
            .to_be_bytes()
            .iter()
            .filter(|b| b.is_ascii_graphic())
            .map(|&b| b as char)
            .collect();
        Ok(format!("{} {}.{}", vendor, firmware >> 16, firmware & 0xFFFF))
    }
}
