// SPDX-License-Identifier: MIT OR Apache-2.0

//! Storage key, attestation key and quote operations
//!
//! Provides:
//! - Creating the storage root key (SRK) in the owner hierarchy
//! - Creating an ECC P-256 restricted signing key (the AK) under the SRK
//! - Loading a previously created key from its public and private areas
//! - TPM2_Quote over a list of PCR selections

use anyhow::{bail, Context, Result};

use pcrattest_verify::tpm::{
    attributes, decode_signature, encode_signature, TpmWriter, TPM_ECC_NIST_P256,
};
use pcrattest_verify::{HashAlgorithm, PcrSelection, MAX_NONCE_SIZE};

use crate::command::Command;
use crate::{Tpm, TpmAlg, TpmCc, TPM_RH_OWNER};

/// TPMA_OBJECT noDA: exempt from dictionary attack lockout
const NO_DA: u32 = 1 << 10;

/// Public and private areas of a key created with TPM2_Create
#[derive(Debug, Clone)]
pub struct CreatedKey {
    /// TPMT_PUBLIC (without the TPM2B size prefix)
    pub public: Vec<u8>,
    /// TPM2B_PRIVATE contents, encrypted by the parent
    pub private: Vec<u8>,
}

/// Result from TPM2_Quote
#[derive(Debug)]
pub struct QuoteOutput {
    /// TPMS_ATTEST structure (type=QUOTE)
    pub attest_data: Vec<u8>,
    /// ECDSA/SHA-256 TPMT_SIGNATURE with fixed-width scalars
    pub signature: Vec<u8>,
}

/// Key operations extension trait
pub trait KeyOps {
    /// Create the ECC P-256 storage root key in the owner hierarchy
    ///
    /// The template is fixed, so the TPM derives the same key every time.
    fn create_srk(&mut self) -> Result<u32>;

    /// Create an attestation key under `parent`
    fn create_ak(&mut self, parent: u32) -> Result<CreatedKey>;

    /// Load a key created under `parent`, returning its transient handle
    fn load(&mut self, parent: u32, public: &[u8], private: &[u8]) -> Result<u32>;

    /// Read a loaded object's TPMT_PUBLIC
    fn read_public(&mut self, handle: u32) -> Result<Vec<u8>>;

    /// Quote `selections` with the key at `handle`, binding `qualifying_data`
    fn quote(
        &mut self,
        handle: u32,
        qualifying_data: &[u8],
        selections: &[PcrSelection],
    ) -> Result<QuoteOutput>;
}

/// Parameters shared by TPM2_CreatePrimary and TPM2_Create
fn creation_parameters(template: &[u8]) -> TpmWriter {
    TpmWriter::new()
        // inSensitive: TPM2B_SENSITIVE_CREATE with empty userAuth and data
        .tpm2b(&TpmWriter::new().tpm2b(&[]).tpm2b(&[]).into_vec())
        .tpm2b(template)
        // outsideInfo
        .tpm2b(&[])
        // creationPCR
        .pcr_selections(&[])
}

impl KeyOps for Tpm {
    fn create_srk(&mut self) -> Result<u32> {
        let response = self.execute(
            Command::new(TpmCc::CreatePrimary)
                .handle(TPM_RH_OWNER)
                .password()
                .returns_handle()
                .parameters(creation_parameters(&srk_template())),
        )?;
        // outPublic, creationData, creationHash, creationTicket, name: unused
        response.handle()
    }

    fn create_ak(&mut self, parent: u32) -> Result<CreatedKey> {
        let mut response = self.execute(
            Command::new(TpmCc::Create)
                .handle(parent)
                .password()
                .parameters(creation_parameters(&ak_template())),
        )?;
        let params = &mut response.parameters;

        let private = params.tpm2b()?;
        let public = params.tpm2b()?;
        // creationData, creationHash, creationTicket: unused

        if private.is_empty() || public.is_empty() {
            bail!("TPM2_Create returned an empty key area");
        }
        Ok(CreatedKey { public, private })
    }

    fn load(&mut self, parent: u32, public: &[u8], private: &[u8]) -> Result<u32> {
        let response = self.execute(
            Command::new(TpmCc::Load)
                .handle(parent)
                .password()
                .returns_handle()
                .parameters(TpmWriter::new().tpm2b(private).tpm2b(public)),
        )?;
        response.handle()
    }

    fn read_public(&mut self, handle: u32) -> Result<Vec<u8>> {
        let mut response = self.execute(Command::new(TpmCc::ReadPublic).handle(handle))?;

        // outPublic; name and qualifiedName follow
        let public = response.parameters.tpm2b()?;
        if public.is_empty() {
            bail!("TPM2_ReadPublic returned an empty public area");
        }
        Ok(public)
    }

    fn quote(
        &mut self,
        handle: u32,
        qualifying_data: &[u8],
        selections: &[PcrSelection],
    ) -> Result<QuoteOutput> {
        if qualifying_data.len() > MAX_NONCE_SIZE {
            bail!(
                "qualifying data is {} bytes, a quote takes at most {}",
                qualifying_data.len(),
                MAX_NONCE_SIZE
            );
        }

        let mut response = self.execute(
            Command::new(TpmCc::Quote)
                .handle(handle)
                .password()
                .parameters(
                    TpmWriter::new()
                        .tpm2b(qualifying_data)
                        // inScheme: ECDSA with SHA-256
                        .u16(TpmAlg::EcDsa as u16)
                        .u16(HashAlgorithm::Sha256 as u16)
                        .pcr_selections(selections),
                ),
        )?;
        let params = &mut response.parameters;

        let attest_data = params.tpm2b()?;
        let signature = decode_signature(&params.rest())
            .context("TPM2_Quote returned an unexpected signature")?;

        Ok(QuoteOutput {
            attest_data,
            signature: encode_signature(&signature),
        })
    }
}

/// TPMT_PUBLIC for the storage root key
///
/// TCG Provisioning Guidance SRK template: ECC P-256 restricted decryption
/// key with AES-128-CFB, unique x and y of 32 zero bytes.
fn srk_template() -> Vec<u8> {
    let attrs = attributes::FIXED_TPM
        | attributes::FIXED_PARENT
        | attributes::SENSITIVE_DATA_ORIGIN
        | attributes::USER_WITH_AUTH
        | NO_DA
        | attributes::RESTRICTED
        | attributes::DECRYPT;

    TpmWriter::new()
        .u16(TpmAlg::Ecc as u16)
        .u16(HashAlgorithm::Sha256 as u16) // nameAlg
        .u32(attrs)
        .tpm2b(&[]) // authPolicy
        .u16(TpmAlg::Aes as u16)
        .u16(128)
        .u16(TpmAlg::Cfb as u16)
        .u16(TpmAlg::Null as u16) // scheme
        .u16(TPM_ECC_NIST_P256)
        .u16(TpmAlg::Null as u16) // kdf
        .tpm2b(&[0; 32]) // unique.x
        .tpm2b(&[0; 32]) // unique.y
        .into_vec()
}

/// TPMT_PUBLIC template for the attestation key
///
/// Restricted ECDSA/SHA-256 signing key on NIST P-256: the TPM will only
/// sign digests it computed itself, so anything carrying TPM_GENERATED_VALUE
/// was produced inside the TPM.
fn ak_template() -> Vec<u8> {
    TpmWriter::new()
        .u16(TpmAlg::Ecc as u16)
        .u16(HashAlgorithm::Sha256 as u16) // nameAlg
        .u32(attributes::AK)
        .tpm2b(&[]) // authPolicy
        .u16(TpmAlg::Null as u16) // symmetric
        .u16(TpmAlg::EcDsa as u16)
        .u16(HashAlgorithm::Sha256 as u16)
        .u16(TPM_ECC_NIST_P256)
        .u16(TpmAlg::Null as u16) // kdf
        .tpm2b(&[]) // unique.x, filled in by the TPM
        .tpm2b(&[])
        .into_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ak_template_layout() {
        let area = ak_template();
        assert_eq!(&area[0..2], &[0x00, 0x23]); // ECC
        assert_eq!(&area[2..4], &[0x00, 0x0B]); // SHA-256
        assert_eq!(
            u32::from_be_bytes([area[4], area[5], area[6], area[7]]),
            0x00050072
        );
        assert_eq!(&area[10..16], &[0x00, 0x10, 0x00, 0x18, 0x00, 0x0B]);
        assert_eq!(area.len(), 24);
    }

    #[test]
    fn test_srk_template_is_restricted_decrypt() {
        let area = srk_template();
        let attrs = u32::from_be_bytes([area[4], area[5], area[6], area[7]]);
        assert_ne!(attrs & attributes::RESTRICTED, 0);
        assert_ne!(attrs & attributes::DECRYPT, 0);
        assert_ne!(attrs & NO_DA, 0);
        assert_eq!(attrs & attributes::SIGN, 0);
        // 10 header + 6 symmetric + 2 scheme + 4 curve/kdf + 2 * 34 unique
        assert_eq!(area.len(), 10 + 6 + 2 + 4 + 68);
    }

    #[test]
    fn test_creation_parameters_layout() {
        let params = creation_parameters(&[0xAB; 3]).into_vec();
        assert_eq!(
            params,
            [
                0, 4, 0, 0, 0, 0, // inSensitive
                0, 3, 0xAB, 0xAB, 0xAB, // inPublic
                0, 0, // outsideInfo
                0, 0, 0, 0, // creationPCR
            ]
        );
    }
}
