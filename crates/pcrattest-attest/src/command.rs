// SPDX-License-Identifier: MIT OR Apache-2.0

//! Command framing and response parsing for the TPM character device
//!
//! A command is `header || handles || [authorization area] || parameters`.
//! The response to an authorized command carries its output handle, then a
//! parameterSize, then the parameters and the response authorization area,
//! which is dropped here.

use std::fmt;

use anyhow::{bail, Result};

use pcrattest_verify::tpm::TpmWriter;
use pcrattest_verify::{HashAlgorithm, PcrSelection};

use crate::{TpmCc, TpmSt, TPM_RS_PW};

/// Size of command and response headers: tag(2) + size(4) + code(4)
pub(crate) const HEADER_SIZE: usize = 10;

/// A command ready to be framed
pub(crate) struct Command {
    code: TpmCc,
    handles: Vec<u32>,
    password: bool,
    returns_handle: bool,
    parameters: Vec<u8>,
}

impl Command {
    pub(crate) fn new(code: TpmCc) -> Self {
        Self {
            code,
            handles: Vec::new(),
            password: false,
            returns_handle: false,
            parameters: Vec::new(),
        }
    }

    pub(crate) fn code(&self) -> TpmCc {
        self.code
    }

    pub(crate) fn handle(mut self, handle: u32) -> Self {
        self.handles.push(handle);
        self
    }

    /// Authorize the first handle with an empty password session
    pub(crate) fn password(mut self) -> Self {
        self.password = true;
        self
    }

    /// The response starts with a handle the TPM created
    pub(crate) fn returns_handle(mut self) -> Self {
        self.returns_handle = true;
        self
    }

    pub(crate) fn parameters(mut self, parameters: TpmWriter) -> Self {
        self.parameters = parameters.into_vec();
        self
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        let tag = if self.password {
            TpmSt::Sessions
        } else {
            TpmSt::NoSessions
        };

        let mut body = TpmWriter::new();
        for &handle in &self.handles {
            body = body.u32(handle);
        }
        if self.password {
            // sessionHandle(4) + nonce(2) + attributes(1) + hmac(2)
            body = body
                .u32(9)
                .u32(TPM_RS_PW)
                .tpm2b(&[])
                .u8(0)
                .tpm2b(&[]);
        }
        let body = body.bytes(&self.parameters).into_vec();

        TpmWriter::new()
            .u16(tag as u16)
            .u32((HEADER_SIZE + body.len()) as u32)
            .u32(self.code as u32)
            .bytes(&body)
            .into_vec()
    }

    /// Split a successful response body into its output handle and parameters
    pub(crate) fn parse_response(&self, body: Vec<u8>) -> Result<Response> {
        let mut reader = Reader::new(body, self.code);
        let handle = if self.returns_handle {
            Some(reader.u32()?)
        } else {
            None
        };
        if self.password {
            let parameter_size = reader.u32()? as usize;
            reader.limit(parameter_size)?;
        }
        Ok(Response {
            handle,
            parameters: reader,
        })
    }
}

/// Output of a successful command
pub(crate) struct Response {
    pub(crate) handle: Option<u32>,
    pub(crate) parameters: Reader,
}

impl Response {
    pub(crate) fn handle(&self) -> Result<u32> {
        match self.handle {
            Some(handle) => Ok(handle),
            None => bail!("response carries no handle"),
        }
    }
}

/// Big-endian reader over a response parameter area
pub(crate) struct Reader {
    data: Vec<u8>,
    offset: usize,
    end: usize,
    code: TpmCc,
}

impl Reader {
    pub(crate) fn new(data: Vec<u8>, code: TpmCc) -> Self {
        let end = data.len();
        Self {
            data,
            offset: 0,
            end,
            code,
        }
    }

    /// Stop reading `len` bytes from here
    fn limit(&mut self, len: usize) -> Result<()> {
        if len > self.remaining() {
            bail!(
                "TPM2_{:?} response declares {} parameter bytes, {} present",
                self.code,
                len,
                self.remaining()
            );
        }
        self.end = self.offset + len;
        Ok(())
    }

    pub(crate) fn remaining(&self) -> usize {
        self.end - self.offset
    }

    pub(crate) fn take(&mut self, len: usize) -> Result<&[u8]> {
        if len > self.remaining() {
            bail!(
                "TPM2_{:?} response truncated: need {} bytes at offset {}, {} left",
                self.code,
                len,
                self.offset,
                self.remaining()
            );
        }
        let bytes = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(bytes)
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Size-prefixed buffer
    pub(crate) fn tpm2b(&mut self) -> Result<Vec<u8>> {
        let size = self.u16()? as usize;
        Ok(self.take(size)?.to_vec())
    }

    /// Everything left in the parameter area
    pub(crate) fn rest(&mut self) -> Vec<u8> {
        let rest = self.data[self.offset..self.end].to_vec();
        self.offset = self.end;
        rest
    }

    /// TPML_PCR_SELECTION. Banks with an algorithm outside [`HashAlgorithm`]
    /// come back as `Err(alg_id)`.
    pub(crate) fn pcr_selections(&mut self) -> Result<Vec<Result<PcrSelection, u16>>> {
        let count = self.u32()?;
        if count > 16 {
            bail!("TPM2_{:?} returned {} PCR selections", self.code, count);
        }
        let mut selections = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let alg_id = self.u16()?;
            let size = self.u8()? as usize;
            let bitmap = self.take(size)?;
            selections.push(
                HashAlgorithm::try_from(alg_id).map(|alg| PcrSelection::from_bitmap(alg, bitmap)),
            );
        }
        Ok(selections)
    }
}

// =============================================================================
// Response codes
// =============================================================================

/// A TPM response code other than TPM_RC_SUCCESS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpmResponseError {
    pub command: TpmCc,
    pub code: u32,
}

impl TpmResponseError {
    /// Transient conditions after which the same command may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self.code, RC_YIELDED | RC_TESTING | RC_RETRY)
    }
}

const RC_FMT1: u32 = 0x080;
const RC_VER1: u32 = 0x100;
const RC_WARN: u32 = 0x900;
const RC_YIELDED: u32 = RC_WARN + 0x008;
const RC_TESTING: u32 = RC_WARN + 0x00A;
const RC_RETRY: u32 = RC_WARN + 0x022;

impl fmt::Display for TpmResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TPM2_{:?} failed with 0x{:03X}", self.command, self.code)?;

        if self.code & RC_FMT1 != 0 {
            let error = self.code & 0x3F;
            let name = format_one_name(error).unwrap_or("unknown error");
            let n = (self.code >> 8) & 0xF;
            return if self.code & 0x040 != 0 {
                write!(f, " ({} on parameter {})", name, n)
            } else if n & 0x8 != 0 {
                write!(f, " ({} on session {})", name, n & 0x7)
            } else {
                write!(f, " ({} on handle {})", name, n)
            };
        }

        match format_zero_name(self.code) {
            Some(name) => write!(f, " ({})", name),
            None => Ok(()),
        }
    }
}

impl std::error::Error for TpmResponseError {}

fn format_one_name(error: u32) -> Option<&'static str> {
    Some(match error {
        0x01 => "TPM_RC_ASYMMETRIC",
        0x02 => "TPM_RC_ATTRIBUTES",
        0x03 => "TPM_RC_HASH",
        0x04 => "TPM_RC_VALUE",
        0x05 => "TPM_RC_HIERARCHY",
        0x07 => "TPM_RC_KEY_SIZE",
        0x09 => "TPM_RC_MODE",
        0x0A => "TPM_RC_TYPE",
        0x0B => "TPM_RC_HANDLE",
        0x0D => "TPM_RC_RANGE",
        0x0E => "TPM_RC_AUTH_FAIL",
        0x12 => "TPM_RC_SCHEME",
        0x15 => "TPM_RC_SIZE",
        0x16 => "TPM_RC_SYMMETRIC",
        0x17 => "TPM_RC_TAG",
        0x18 => "TPM_RC_SELECTOR",
        0x1A => "TPM_RC_INSUFFICIENT",
        0x1B => "TPM_RC_SIGNATURE",
        0x1C => "TPM_RC_KEY",
        0x1F => "TPM_RC_INTEGRITY",
        0x22 => "TPM_RC_BAD_AUTH",
        0x26 => "TPM_RC_CURVE",
        0x27 => "TPM_RC_ECC_POINT",
        _ => return None,
    })
}

fn format_zero_name(code: u32) -> Option<&'static str> {
    Some(match code {
        RC_VER1 => "TPM_RC_INITIALIZE",
        0x101 => "TPM_RC_FAILURE",
        0x103 => "TPM_RC_SEQUENCE",
        0x125 => "TPM_RC_AUTH_MISSING",
        0x127 => "TPM_RC_PCR",
        0x128 => "TPM_RC_PCR_CHANGED",
        0x12E => "TPM_RC_TOO_MANY_CONTEXTS",
        0x12F => "TPM_RC_AUTH_UNAVAILABLE",
        0x142 => "TPM_RC_COMMAND_SIZE",
        0x143 => "TPM_RC_COMMAND_CODE",
        0x144 => "TPM_RC_AUTHSIZE",
        0x152 => "TPM_RC_PARENT",
        0x902 => "TPM_RC_OBJECT_MEMORY",
        0x903 => "TPM_RC_SESSION_MEMORY",
        0x904 => "TPM_RC_MEMORY",
        RC_YIELDED => "TPM_RC_YIELDED",
        0x909 => "TPM_RC_CANCELED",
        RC_TESTING => "TPM_RC_TESTING",
        0x921 => "TPM_RC_LOCKOUT",
        RC_RETRY => "TPM_RC_RETRY",
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unauthorized_command_framing() {
        let command = Command::new(TpmCc::FlushContext).handle(0x8000_0001).encode();
        assert_eq!(command.len(), 14);
        assert_eq!(&command[0..2], &[0x80, 0x01]);
        assert_eq!(&command[2..6], &14u32.to_be_bytes());
        assert_eq!(&command[6..10], &0x165u32.to_be_bytes());
        assert_eq!(&command[10..], &[0x80, 0, 0, 1]);
    }

    #[test]
    fn test_password_session_framing() {
        let command = Command::new(TpmCc::Load)
            .handle(0x8100_0001)
            .password()
            .parameters(TpmWriter::new().u16(0xBEEF))
            .encode();
        assert_eq!(&command[0..2], &[0x80, 0x02]);
        assert_eq!(
            &command[10..],
            &[
                0x81, 0, 0, 1, // parent
                0, 0, 0, 9, 0x40, 0, 0, 9, 0, 0, 0, 0, 0, // empty password
                0xBE, 0xEF,
            ]
        );
    }

    #[test]
    fn test_authorized_response_is_bounded_by_parameter_size() {
        let command = Command::new(TpmCc::Load).handle(0x8100_0001).password().returns_handle();
        // handle, parameterSize = 4, name, then a response auth area
        let body = vec![
            0x80, 0, 0, 2, 0, 0, 0, 4, 0, 2, 0xAA, 0xBB, 0, 0, 1, 0, 0,
        ];
        let mut response = command.parse_response(body).unwrap();
        assert_eq!(response.handle().unwrap(), 0x8000_0002);
        assert_eq!(response.parameters.tpm2b().unwrap(), vec![0xAA, 0xBB]);
        assert_eq!(response.parameters.remaining(), 0);
        assert!(response.parameters.u8().is_err());
    }

    #[test]
    fn test_parameter_size_beyond_body_rejected() {
        let command = Command::new(TpmCc::Quote).handle(0x8000_0000).password();
        assert!(command.parse_response(vec![0, 0, 0, 9, 1, 2]).is_err());
    }

    #[test]
    fn test_reader_truncation() {
        let mut reader = Reader::new(vec![0x00, 0x10, 0x01], TpmCc::PcrRead);
        let err = reader.tpm2b().unwrap_err();
        assert!(err.to_string().contains("truncated"));
    }

    #[test]
    fn test_pcr_selections_skip_unknown_banks() {
        let body = vec![
            0, 0, 0, 2, // count
            0, 0x0B, 3, 0xFF, 0, 0, // SHA-256: PCRs 0-7
            0, 0x12, 3, 0xFF, 0xFF, 0xFF, // SM3
        ];
        let mut reader = Reader::new(body, TpmCc::GetCapability);
        let selections = reader.pcr_selections().unwrap();
        assert_eq!(
            selections[0],
            Ok(PcrSelection::new(HashAlgorithm::Sha256, 0..8))
        );
        assert_eq!(selections[1], Err(0x0012));
    }

    #[test]
    fn test_response_code_descriptions() {
        let err = TpmResponseError {
            command: TpmCc::Load,
            code: 0x01D5,
        };
        assert_eq!(
            err.to_string(),
            "TPM2_Load failed with 0x1D5 (TPM_RC_SIZE on parameter 1)"
        );

        let err = TpmResponseError {
            command: TpmCc::Quote,
            code: 0x098E,
        };
        assert!(err.to_string().contains("TPM_RC_AUTH_FAIL on session 1"));

        let err = TpmResponseError {
            command: TpmCc::Quote,
            code: 0x08B,
        };
        assert!(err.to_string().contains("TPM_RC_HANDLE on handle 0"));

        let retry = TpmResponseError {
            command: TpmCc::CreatePrimary,
            code: 0x922,
        };
        assert!(retry.is_retryable());
        assert!(retry.to_string().contains("TPM_RC_RETRY"));
        assert!(!err.is_retryable());
    }
}
