// SPDX-License-Identifier: MIT OR Apache-2.0

//! TPM 2.0 structure codecs: TPMS_ATTEST (quote), TPMT_PUBLIC (ECC AK) and
//! TPMT_SIGNATURE (ECDSA).
//!
//! All TPM structures are big-endian. Parsers never panic on malformed input
//! and reject trailing bytes.

use base64::{engine::general_purpose::STANDARD, Engine};
use ecdsa::signature::hazmat::PrehashVerifier;
use p256::ecdsa::{Signature as P256Signature, VerifyingKey as P256VerifyingKey};
use sha2::{Digest, Sha256};

use crate::error::{
    AkPublicReason, AttestReason, MalformedReason, SignatureInvalidReason, VerifyError,
};
use crate::pcr::{HashAlgorithm, PcrSelection};

/// TPM_GENERATED magic value (0xff544347 = "ÿTCG")
pub const TPM_GENERATED_VALUE: u32 = 0xff544347;

/// TPM_ST_ATTEST_QUOTE structure type
pub const TPM_ST_ATTEST_QUOTE: u16 = 0x8018;

pub const TPM_ALG_ECC: u16 = 0x0023;
pub const TPM_ALG_ECDSA: u16 = 0x0018;
pub const TPM_ALG_NULL: u16 = 0x0010;
pub const TPM_ECC_NIST_P256: u16 = 0x0003;

/// TPMA_OBJECT bits
pub mod attributes {
    pub const FIXED_TPM: u32 = 1 << 1;
    pub const FIXED_PARENT: u32 = 1 << 4;
    pub const SENSITIVE_DATA_ORIGIN: u32 = 1 << 5;
    pub const USER_WITH_AUTH: u32 = 1 << 6;
    pub const RESTRICTED: u32 = 1 << 16;
    pub const DECRYPT: u32 = 1 << 17;
    pub const SIGN: u32 = 1 << 18;

    /// Attributes of an attestation key template.
    pub const AK: u32 =
        FIXED_TPM | FIXED_PARENT | SENSITIVE_DATA_ORIGIN | USER_WITH_AUTH | RESTRICTED | SIGN;
}

/// Largest nonce a TPM2_Quote accepts as qualifyingData.
pub const MAX_NONCE_SIZE: usize = 64;

/// Size of P-256 coordinates and signature scalars.
const P256_FIELD_SIZE: usize = 32;

/// Size of TPMS_CLOCK_INFO structure: clock(8) + resetCount(4) + restartCount(4) + safe(1)
const TPMS_CLOCK_INFO_SIZE: usize = 17;

// =============================================================================
// TPMS_ATTEST (quote)
// =============================================================================

/// TPMS_CLOCK_INFO
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClockInfo {
    pub clock: u64,
    pub reset_count: u32,
    pub restart_count: u32,
    pub safe: bool,
}

/// Parsed TPMS_ATTEST structure of type TPM_ST_ATTEST_QUOTE
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuoteInfo {
    /// Name of the signing key
    pub signer_name: Vec<u8>,
    /// Qualifying data supplied by the caller (the nonce)
    pub extra_data: Vec<u8>,
    pub clock_info: ClockInfo,
    pub firmware_version: u64,
    /// Quoted banks in selection order
    pub selections: Vec<PcrSelection>,
    /// SHA-256 over the selected PCR values
    pub pcr_digest: Vec<u8>,
}

impl QuoteInfo {
    /// Parse a TPMS_ATTEST structure (QUOTE type)
    ///
    /// Layout:
    /// - magic: 0xff544347 (TPM_GENERATED_VALUE)
    /// - type: 0x8018 (TPM_ST_ATTEST_QUOTE)
    /// - qualifiedSigner: TPM2B_NAME
    /// - extraData: TPM2B_DATA
    /// - clockInfo: TPMS_CLOCK_INFO
    /// - firmwareVersion: u64
    /// - attested.quote.pcrSelect: TPML_PCR_SELECTION
    /// - attested.quote.pcrDigest: TPM2B_DIGEST
    pub fn parse(data: &[u8]) -> Result<Self, AttestReason> {
        let mut cursor = SafeCursor::new(data);

        let magic = cursor.read_u32()?;
        if magic != TPM_GENERATED_VALUE {
            return Err(AttestReason::TpmMagicInvalid {
                expected: TPM_GENERATED_VALUE,
                got: magic,
            });
        }

        let attest_type = cursor.read_u16()?;
        if attest_type != TPM_ST_ATTEST_QUOTE {
            return Err(AttestReason::TpmTypeInvalid {
                expected: TPM_ST_ATTEST_QUOTE,
                got: attest_type,
            });
        }

        let signer_name = cursor.read_tpm2b()?;
        let extra_data = cursor.read_tpm2b()?;

        let clock_start = cursor.offset;
        let clock_info = ClockInfo {
            clock: cursor.read_u64()?,
            reset_count: cursor.read_u32()?,
            restart_count: cursor.read_u32()?,
            safe: cursor.read_u8()? != 0,
        };
        debug_assert_eq!(cursor.offset - clock_start, TPMS_CLOCK_INFO_SIZE);

        let firmware_version = cursor.read_u64()?;
        let selections = cursor.read_pcr_selection()?;
        let pcr_digest = cursor.read_tpm2b()?;
        cursor.finish()?;

        Ok(Self {
            signer_name,
            extra_data,
            clock_info,
            firmware_version,
            selections,
            pcr_digest,
        })
    }

    /// Marshal back into TPMS_ATTEST bytes.
    pub fn encode(&self) -> Vec<u8> {
        TpmWriter::new()
            .u32(TPM_GENERATED_VALUE)
            .u16(TPM_ST_ATTEST_QUOTE)
            .tpm2b(&self.signer_name)
            .tpm2b(&self.extra_data)
            .u64(self.clock_info.clock)
            .u32(self.clock_info.reset_count)
            .u32(self.clock_info.restart_count)
            .u8(self.clock_info.safe as u8)
            .u64(self.firmware_version)
            .pcr_selections(&self.selections)
            .tpm2b(&self.pcr_digest)
            .into_vec()
    }
}

/// pcrDigest of a quote: SHA-256 over the concatenated PCR values, in the
/// order the quote selects them.
pub fn quote_pcr_digest<'a>(values: impl IntoIterator<Item = &'a [u8]>) -> Vec<u8> {
    let mut hasher = Sha256::new();
    for value in values {
        hasher.update(value);
    }
    hasher.finalize().to_vec()
}

// =============================================================================
// TPMT_PUBLIC (attestation key)
// =============================================================================

/// Public area of an ECC P-256 attestation key.
///
/// Holds the exact TPMT_PUBLIC bytes it was parsed from; two values are equal
/// when their encodings are.
#[derive(Debug, Clone)]
pub struct AkPublic {
    encoded: Vec<u8>,
    name_alg: HashAlgorithm,
    attributes: u32,
    verifying_key: P256VerifyingKey,
}

impl PartialEq for AkPublic {
    fn eq(&self, other: &Self) -> bool {
        self.encoded == other.encoded
    }
}

impl Eq for AkPublic {}

impl AkPublic {
    /// Parse a TPMT_PUBLIC and require an ECC P-256 restricted signing key
    /// with an ECDSA/SHA-256 scheme.
    pub fn parse(data: &[u8]) -> Result<Self, AkPublicReason> {
        let mut cursor = SafeCursor::new(data);

        let key_type = cursor.read_u16()?;
        if key_type != TPM_ALG_ECC {
            return Err(AkPublicReason::UnsupportedKeyType { got: key_type });
        }
        let name_alg_id = cursor.read_u16()?;
        let name_alg = HashAlgorithm::try_from(name_alg_id)
            .map_err(|got| AkPublicReason::UnsupportedNameAlg { got })?;
        let attributes = cursor.read_u32()?;
        let _auth_policy = cursor.read_tpm2b()?;

        // parameters (TPMS_ECC_PARMS)
        let symmetric = cursor.read_u16()?;
        if symmetric != TPM_ALG_NULL {
            let _key_bits = cursor.read_u16()?;
            let _mode = cursor.read_u16()?;
        }
        let scheme = cursor.read_u16()?;
        let scheme_hash = if scheme != TPM_ALG_NULL {
            cursor.read_u16()?
        } else {
            TPM_ALG_NULL
        };
        let curve_id = cursor.read_u16()?;
        let kdf = cursor.read_u16()?;
        if kdf != TPM_ALG_NULL {
            let _kdf_hash = cursor.read_u16()?;
        }

        // unique (TPMS_ECC_POINT)
        let x = cursor.read_tpm2b()?;
        let y = cursor.read_tpm2b()?;
        cursor.finish()?;

        if curve_id != TPM_ECC_NIST_P256 {
            return Err(AkPublicReason::UnsupportedCurve { got: curve_id });
        }
        if scheme != TPM_ALG_ECDSA || scheme_hash != HashAlgorithm::Sha256 as u16 {
            return Err(AkPublicReason::UnsupportedScheme {
                scheme,
                hash: scheme_hash,
            });
        }
        let required = attributes::RESTRICTED | attributes::SIGN;
        if attributes & required != required {
            return Err(AkPublicReason::NotRestrictedSigningKey { attributes });
        }

        let mut point = Vec::with_capacity(1 + 2 * P256_FIELD_SIZE);
        point.push(0x04);
        point.extend_from_slice(&left_pad(&x).ok_or(AkPublicReason::InvalidPoint)?);
        point.extend_from_slice(&left_pad(&y).ok_or(AkPublicReason::InvalidPoint)?);
        let verifying_key =
            P256VerifyingKey::from_sec1_bytes(&point).map_err(|_| AkPublicReason::InvalidPoint)?;

        Ok(Self {
            encoded: data.to_vec(),
            name_alg,
            attributes,
            verifying_key,
        })
    }

    /// Build the TPMT_PUBLIC of an attestation key template filled in with
    /// `key`.
    pub fn from_verifying_key(key: &P256VerifyingKey) -> Self {
        let point = key.to_encoded_point(false);
        // Uncompressed SEC1: 0x04 || X || Y
        let (x, y) = point.as_bytes()[1..].split_at(P256_FIELD_SIZE);
        let encoded = TpmWriter::new()
            .u16(TPM_ALG_ECC) // type
            .u16(HashAlgorithm::Sha256 as u16) // nameAlg
            .u32(attributes::AK) // objectAttributes
            .u16(0) // authPolicy (empty)
            .u16(TPM_ALG_NULL) // symmetric
            .u16(TPM_ALG_ECDSA) // scheme
            .u16(HashAlgorithm::Sha256 as u16)
            .u16(TPM_ECC_NIST_P256) // curveID
            .u16(TPM_ALG_NULL) // kdf
            .tpm2b(x)
            .tpm2b(y)
            .into_vec();
        Self {
            encoded,
            name_alg: HashAlgorithm::Sha256,
            attributes: attributes::AK,
            verifying_key: key.clone(),
        }
    }

    /// Decode a standard base64 TPMT_PUBLIC.
    pub fn from_base64(encoded: &str) -> Result<Self, VerifyError> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(MalformedReason::Base64)?;
        Ok(Self::parse(&bytes).map_err(MalformedReason::AkPublic)?)
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.encoded)
    }

    /// TPMT_PUBLIC bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.encoded
    }

    pub fn attributes(&self) -> u32 {
        self.attributes
    }

    pub fn verifying_key(&self) -> &P256VerifyingKey {
        &self.verifying_key
    }

    /// TPM object name: nameAlg || H_nameAlg(TPMT_PUBLIC).
    pub fn name(&self) -> Vec<u8> {
        let mut name = (self.name_alg as u16).to_be_bytes().to_vec();
        name.extend_from_slice(&self.name_alg.digest(&self.encoded));
        name
    }
}

// =============================================================================
// TPMT_SIGNATURE (ECDSA)
// =============================================================================

/// Decode an ECDSA/SHA-256 TPMT_SIGNATURE.
pub fn decode_signature(data: &[u8]) -> Result<P256Signature, SignatureInvalidReason> {
    let encoding = |e: AttestReason| SignatureInvalidReason::InvalidSignatureEncoding(e.to_string());
    let mut cursor = SafeCursor::new(data);

    let scheme = cursor.read_u16().map_err(encoding)?;
    let hash = cursor.read_u16().map_err(encoding)?;
    if scheme != TPM_ALG_ECDSA || hash != HashAlgorithm::Sha256 as u16 {
        return Err(SignatureInvalidReason::UnsupportedScheme { scheme, hash });
    }

    // TPMS_SIGNATURE_ECC
    let r = cursor.read_tpm2b().map_err(encoding)?;
    let s = cursor.read_tpm2b().map_err(encoding)?;
    cursor.finish().map_err(encoding)?;

    let mut scalars = Vec::with_capacity(2 * P256_FIELD_SIZE);
    for scalar in [&r, &s] {
        let padded = left_pad(scalar).ok_or_else(|| {
            SignatureInvalidReason::InvalidSignatureEncoding(format!(
                "scalar of {} bytes",
                scalar.len()
            ))
        })?;
        scalars.extend_from_slice(&padded);
    }
    P256Signature::from_slice(&scalars)
        .map_err(|e| SignatureInvalidReason::InvalidSignatureEncoding(e.to_string()))
}

/// Encode an ECDSA P-256 signature as an ECDSA/SHA-256 TPMT_SIGNATURE.
pub fn encode_signature(signature: &P256Signature) -> Vec<u8> {
    let bytes = signature.to_bytes();
    let (r, s) = bytes.split_at(P256_FIELD_SIZE);
    TpmWriter::new()
        .u16(TPM_ALG_ECDSA)
        .u16(HashAlgorithm::Sha256 as u16)
        .tpm2b(r)
        .tpm2b(s)
        .into_vec()
}

/// Verify a TPMT_SIGNATURE over SHA-256(`message`) with the AK.
pub fn verify_quote_signature(
    message: &[u8],
    signature: &[u8],
    ak: &AkPublic,
) -> Result<(), SignatureInvalidReason> {
    let signature = decode_signature(signature)?;

    // TPM signs the SHA-256 hash of the message
    let digest = Sha256::digest(message);

    ak.verifying_key()
        .verify_prehash(&digest, &signature)
        .map_err(|e| SignatureInvalidReason::EcdsaVerificationFailed(e.to_string()))
}

/// Left-pad a big-endian field element to 32 bytes. Leading zeros beyond
/// that are tolerated, anything longer is not.
fn left_pad(value: &[u8]) -> Option<[u8; P256_FIELD_SIZE]> {
    let first = value
        .iter()
        .position(|&b| b != 0)
        .unwrap_or(value.len());
    let trimmed = &value[first..];
    if trimmed.len() > P256_FIELD_SIZE {
        return None;
    }
    let mut out = [0u8; P256_FIELD_SIZE];
    out[P256_FIELD_SIZE - trimmed.len()..].copy_from_slice(trimmed);
    Some(out)
}

// =============================================================================
// Cursor / writer
// =============================================================================

/// Safe cursor for parsing binary data with overflow protection
struct SafeCursor<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> SafeCursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    /// Read exactly `len` bytes, returning error on overflow or truncation
    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], AttestReason> {
        let end = self
            .offset
            .checked_add(len)
            .ok_or(AttestReason::TpmOverflow {
                offset: self.offset,
            })?;
        if end > self.data.len() {
            return Err(AttestReason::TpmTruncated {
                offset: self.offset,
            });
        }
        let bytes = &self.data[self.offset..end];
        self.offset = end;
        Ok(bytes)
    }

    /// Read a TPM2B structure (2-byte size prefix + data)
    fn read_tpm2b(&mut self) -> Result<Vec<u8>, AttestReason> {
        let size = self.read_u16()? as usize;
        Ok(self.read_bytes(size)?.to_vec())
    }

    fn read_u8(&mut self) -> Result<u8, AttestReason> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, AttestReason> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, AttestReason> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64(&mut self) -> Result<u64, AttestReason> {
        let hi = self.read_u32()? as u64;
        let lo = self.read_u32()? as u64;
        Ok(hi << 32 | lo)
    }

    /// Read TPML_PCR_SELECTION structure
    fn read_pcr_selection(&mut self) -> Result<Vec<PcrSelection>, AttestReason> {
        let count = self.read_u32()?;

        // Sanity check: count should be reasonable (max ~16 different algorithms)
        if count > 16 {
            return Err(AttestReason::PcrSelectionCountExceeded { count });
        }

        let mut selections = Vec::with_capacity(count as usize);
        for _ in 0..count {
            // TPMS_PCR_SELECTION: hash, sizeofSelect, pcrSelect
            let alg_id = self.read_u16()?;
            let bitmap_size = self.read_u8()?;

            // Sanity check: bitmap size should be reasonable (max 32 for 256 PCRs)
            if bitmap_size > 32 {
                return Err(AttestReason::PcrBitmapSizeExceeded { size: bitmap_size });
            }
            let bitmap = self.read_bytes(bitmap_size as usize)?;

            let algorithm = HashAlgorithm::try_from(alg_id)
                .map_err(|alg_id| AttestReason::UnknownPcrAlgorithm { alg_id })?;
            selections.push(PcrSelection::from_bitmap(algorithm, bitmap));
        }

        Ok(selections)
    }

    fn finish(&self) -> Result<(), AttestReason> {
        match self.data.len() - self.offset {
            0 => Ok(()),
            count => Err(AttestReason::TrailingBytes { count }),
        }
    }
}

/// Big-endian marshalling buffer for TPM structures
#[derive(Debug, Default)]
pub struct TpmWriter {
    data: Vec<u8>,
}

impl TpmWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u8(mut self, val: u8) -> Self {
        self.data.push(val);
        self
    }

    pub fn u16(mut self, val: u16) -> Self {
        self.data.extend_from_slice(&val.to_be_bytes());
        self
    }

    pub fn u32(mut self, val: u32) -> Self {
        self.data.extend_from_slice(&val.to_be_bytes());
        self
    }

    pub fn u64(mut self, val: u64) -> Self {
        self.data.extend_from_slice(&val.to_be_bytes());
        self
    }

    pub fn bytes(mut self, bytes: &[u8]) -> Self {
        self.data.extend_from_slice(bytes);
        self
    }

    /// Size-prefixed buffer
    pub fn tpm2b(self, bytes: &[u8]) -> Self {
        self.u16(bytes.len() as u16).bytes(bytes)
    }

    /// TPML_PCR_SELECTION
    pub fn pcr_selections(self, selections: &[PcrSelection]) -> Self {
        let mut w = self.u32(selections.len() as u32);
        for selection in selections {
            let bitmap = selection.bitmap();
            w = w
                .u16(selection.algorithm as u16)
                .u8(bitmap.len() as u8)
                .bytes(&bitmap);
        }
        w
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecdsa::signature::hazmat::PrehashSigner;
    use p256::ecdsa::SigningKey;

    fn signing_key(seed: u8) -> SigningKey {
        let secret: [u8; 32] = core::array::from_fn(|i| seed.wrapping_add(i as u8));
        SigningKey::from_bytes(&secret.into()).unwrap()
    }

    fn sample_quote() -> QuoteInfo {
        QuoteInfo {
            signer_name: vec![0x00, 0x0B, 0xAA, 0xBB],
            extra_data: vec![1, 2, 3, 4],
            clock_info: ClockInfo {
                clock: 0x0102_0304_0506_0708,
                reset_count: 3,
                restart_count: 1,
                safe: true,
            },
            firmware_version: 0x2000_0001,
            selections: vec![PcrSelection::new(HashAlgorithm::Sha256, [0, 1, 7])],
            pcr_digest: vec![0x55; 32],
        }
    }

    fn sign(key: &SigningKey, message: &[u8]) -> Vec<u8> {
        let signature: P256Signature = key.sign_prehash(&Sha256::digest(message)).unwrap();
        encode_signature(&signature)
    }

    // === TPMS_ATTEST ===

    #[test]
    fn test_quote_encode_parse() {
        let quote = sample_quote();
        let encoded = quote.encode();
        assert_eq!(&encoded[..4], &[0xff, 0x54, 0x43, 0x47]);
        assert_eq!(&encoded[4..6], &[0x80, 0x18]);
        assert_eq!(QuoteInfo::parse(&encoded).unwrap(), quote);
    }

    #[test]
    fn test_quote_reject_wrong_magic() {
        let mut encoded = sample_quote().encode();
        encoded[0] = 0x00;
        assert!(matches!(
            QuoteInfo::parse(&encoded),
            Err(AttestReason::TpmMagicInvalid { .. })
        ));
    }

    #[test]
    fn test_quote_reject_wrong_type() {
        let mut encoded = sample_quote().encode();
        encoded[5] = 0x17; // TPM_ST_ATTEST_CERTIFY
        assert!(matches!(
            QuoteInfo::parse(&encoded),
            Err(AttestReason::TpmTypeInvalid { got: 0x8017, .. })
        ));
    }

    #[test]
    fn test_quote_reject_truncated_and_trailing() {
        let encoded = sample_quote().encode();
        for len in [0, 3, 6, 20, encoded.len() - 1] {
            assert!(
                matches!(
                    QuoteInfo::parse(&encoded[..len]),
                    Err(AttestReason::TpmTruncated { .. })
                ),
                "length {} should be truncated",
                len
            );
        }
        let mut trailing = encoded.clone();
        trailing.push(0);
        assert!(matches!(
            QuoteInfo::parse(&trailing),
            Err(AttestReason::TrailingBytes { count: 1 })
        ));
    }

    #[test]
    fn test_quote_reject_unknown_bank() {
        let mut quote = sample_quote();
        quote.selections.clear();
        let mut encoded = quote.encode();
        // Patch in a selection for SM3_256 (0x0012) by hand
        let digest_at = encoded.len() - 34;
        encoded[digest_at - 4..digest_at].copy_from_slice(&1u32.to_be_bytes());
        let tail = encoded.split_off(digest_at);
        encoded.extend_from_slice(&[0x00, 0x12, 0x03, 0xFF, 0xFF, 0xFF]);
        encoded.extend_from_slice(&tail);
        assert!(matches!(
            QuoteInfo::parse(&encoded),
            Err(AttestReason::UnknownPcrAlgorithm { alg_id: 0x0012 })
        ));
    }

    #[test]
    fn test_pcr_digest_is_concatenation_hash() {
        let a = [1u8; 32];
        let b = [2u8; 32];
        let mut concat = a.to_vec();
        concat.extend_from_slice(&b);
        assert_eq!(
            quote_pcr_digest([&a[..], &b[..]]),
            Sha256::digest(&concat).to_vec()
        );
    }

    // === TPMT_PUBLIC ===

    #[test]
    fn test_ak_public_template() {
        let key = signing_key(1);
        let ak = AkPublic::from_verifying_key(key.verifying_key());
        assert_eq!(ak.attributes(), 0x0005_0072);

        let parsed = AkPublic::parse(ak.as_bytes()).unwrap();
        assert_eq!(parsed, ak);
        assert_eq!(parsed.verifying_key(), key.verifying_key());
        assert_eq!(AkPublic::from_base64(&ak.to_base64()).unwrap(), ak);

        let name = ak.name();
        assert_eq!(&name[..2], &[0x00, 0x0B]);
        assert_eq!(&name[2..], Sha256::digest(ak.as_bytes()).as_slice());
    }

    #[test]
    fn test_ak_public_reject_non_restricted() {
        let ak = AkPublic::from_verifying_key(signing_key(1).verifying_key());
        let mut bytes = ak.as_bytes().to_vec();
        // objectAttributes at offset 4, clear `restricted`
        let attrs = u32::from_be_bytes(bytes[4..8].try_into().unwrap()) & !attributes::RESTRICTED;
        bytes[4..8].copy_from_slice(&attrs.to_be_bytes());
        assert!(matches!(
            AkPublic::parse(&bytes),
            Err(AkPublicReason::NotRestrictedSigningKey { .. })
        ));
    }

    #[test]
    fn test_ak_public_reject_rsa_and_other_curves() {
        let ak = AkPublic::from_verifying_key(signing_key(1).verifying_key());

        let mut rsa = ak.as_bytes().to_vec();
        rsa[..2].copy_from_slice(&0x0001u16.to_be_bytes());
        assert!(matches!(
            AkPublic::parse(&rsa),
            Err(AkPublicReason::UnsupportedKeyType { got: 0x0001 })
        ));

        // curveID sits after type(2) nameAlg(2) attrs(4) authPolicy(2) sym(2) scheme(4)
        let mut p384 = ak.as_bytes().to_vec();
        p384[16..18].copy_from_slice(&0x0004u16.to_be_bytes());
        assert!(matches!(
            AkPublic::parse(&p384),
            Err(AkPublicReason::UnsupportedCurve { got: 0x0004 })
        ));
    }

    #[test]
    fn test_ak_public_reject_point_off_curve() {
        let ak = AkPublic::from_verifying_key(signing_key(1).verifying_key());
        let mut bytes = ak.as_bytes().to_vec();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        assert!(matches!(
            AkPublic::parse(&bytes),
            Err(AkPublicReason::InvalidPoint)
        ));
    }

    #[test]
    fn test_ak_public_reject_truncated() {
        let ak = AkPublic::from_verifying_key(signing_key(1).verifying_key());
        let bytes = &ak.as_bytes()[..ak.as_bytes().len() - 5];
        assert!(matches!(
            AkPublic::parse(bytes),
            Err(AkPublicReason::Structure(AttestReason::TpmTruncated { .. }))
        ));
    }

    // === TPMT_SIGNATURE ===

    #[test]
    fn test_valid_quote_signature() {
        let key = signing_key(1);
        let ak = AkPublic::from_verifying_key(key.verifying_key());
        let message = sample_quote().encode();
        let signature = sign(&key, &message);
        assert_eq!(&signature[..4], &[0x00, 0x18, 0x00, 0x0B]);
        assert!(verify_quote_signature(&message, &signature, &ak).is_ok());
    }

    #[test]
    fn test_reject_wrong_message() {
        let key = signing_key(1);
        let ak = AkPublic::from_verifying_key(key.verifying_key());
        let signature = sign(&key, b"test message for signing");
        assert!(matches!(
            verify_quote_signature(b"different message", &signature, &ak),
            Err(SignatureInvalidReason::EcdsaVerificationFailed(_))
        ));
    }

    #[test]
    fn test_reject_wrong_key() {
        let signature = sign(&signing_key(1), b"message");
        let other = AkPublic::from_verifying_key(signing_key(0x20).verifying_key());
        assert!(matches!(
            verify_quote_signature(b"message", &signature, &other),
            Err(SignatureInvalidReason::EcdsaVerificationFailed(_))
        ));
    }

    #[test]
    fn test_reject_unsupported_signature_scheme() {
        let key = signing_key(1);
        let ak = AkPublic::from_verifying_key(key.verifying_key());
        let mut signature = sign(&key, b"message");
        signature[1] = 0x14; // TPM_ALG_RSASSA
        assert!(matches!(
            verify_quote_signature(b"message", &signature, &ak),
            Err(SignatureInvalidReason::UnsupportedScheme { scheme: 0x0014, .. })
        ));
    }

    #[test]
    fn test_reject_malformed_signature_encoding() {
        let key = signing_key(1);
        let ak = AkPublic::from_verifying_key(key.verifying_key());
        let signature = sign(&key, b"message");

        for bad in [
            &[][..],
            &signature[..3],
            &signature[..signature.len() / 2],
            &[0x00, 0x18, 0x00, 0x0B, 0x00, 0x00, 0x00, 0x00][..],
        ] {
            assert!(matches!(
                verify_quote_signature(b"message", bad, &ak),
                Err(SignatureInvalidReason::InvalidSignatureEncoding(_))
            ));
        }
    }

    #[test]
    fn test_every_signature_bit_flip_rejected() {
        let key = signing_key(1);
        let ak = AkPublic::from_verifying_key(key.verifying_key());
        let message = sample_quote().encode();
        let signature = sign(&key, &message);

        for byte in 0..signature.len() {
            for bit in 0..8 {
                let mut flipped = signature.clone();
                flipped[byte] ^= 1 << bit;
                assert!(
                    verify_quote_signature(&message, &flipped, &ak).is_err(),
                    "flip of byte {} bit {} accepted",
                    byte,
                    bit
                );
            }
        }
    }

    #[test]
    fn test_short_scalars_are_padded() {
        assert_eq!(left_pad(&[0x01]).unwrap()[31], 0x01);
        assert_eq!(left_pad(&[0u8; 33]).unwrap(), [0u8; 32]);
        assert!(left_pad(&[0xFFu8; 33]).is_none());
    }
}
