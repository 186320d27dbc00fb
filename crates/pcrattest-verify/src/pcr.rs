// SPDX-License-Identifier: MIT OR Apache-2.0

//! PCR banks, hash algorithms and PCR selections.

use std::collections::{BTreeMap, BTreeSet};

use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};

use crate::error::{MalformedReason, VerifyError};
use crate::model::PcrValue;

/// Number of PCRs in a bank.
pub const PCR_COUNT: usize = 24;

/// Size of a PCR selection bitmap covering [`PCR_COUNT`] registers.
pub const PCR_SELECT_SIZE: usize = PCR_COUNT / 8;

/// PCR bank hash algorithm.
///
/// Discriminant values are the TPM algorithm IDs (TPMI_ALG_HASH).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u16)]
pub enum HashAlgorithm {
    Sha1 = 0x0004,
    Sha256 = 0x000B,
    Sha384 = 0x000C,
    Sha512 = 0x000D,
}

impl HashAlgorithm {
    /// Digest length in bytes.
    pub fn digest_len(self) -> usize {
        match self {
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha384 => 48,
            HashAlgorithm::Sha512 => 64,
        }
    }

    /// Numeric hash identifier used in the wire bundle's `DigestAlg` field.
    pub fn wire_id(self) -> i64 {
        match self {
            HashAlgorithm::Sha1 => 3,
            HashAlgorithm::Sha256 => 5,
            HashAlgorithm::Sha384 => 6,
            HashAlgorithm::Sha512 => 7,
        }
    }

    /// Inverse of [`HashAlgorithm::wire_id`].
    pub fn from_wire_id(id: i64) -> Option<Self> {
        match id {
            3 => Some(HashAlgorithm::Sha1),
            5 => Some(HashAlgorithm::Sha256),
            6 => Some(HashAlgorithm::Sha384),
            7 => Some(HashAlgorithm::Sha512),
            _ => None,
        }
    }

    /// Hash `data` with this algorithm.
    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            HashAlgorithm::Sha1 => Sha1::digest(data).to_vec(),
            HashAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
            HashAlgorithm::Sha384 => Sha384::digest(data).to_vec(),
            HashAlgorithm::Sha512 => Sha512::digest(data).to_vec(),
        }
    }

    /// PCR extend: `H(current || measurement)`.
    pub fn extend(self, current: &[u8], measurement: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(current.len() + measurement.len());
        buf.extend_from_slice(current);
        buf.extend_from_slice(measurement);
        self.digest(&buf)
    }

    /// All-zero PCR reset value for this bank.
    pub fn zero(self) -> Vec<u8> {
        vec![0u8; self.digest_len()]
    }
}

impl TryFrom<u16> for HashAlgorithm {
    type Error = u16;
    fn try_from(value: u16) -> Result<Self, u16> {
        match value {
            0x0004 => Ok(HashAlgorithm::Sha1),
            0x000B => Ok(HashAlgorithm::Sha256),
            0x000C => Ok(HashAlgorithm::Sha384),
            0x000D => Ok(HashAlgorithm::Sha512),
            other => Err(other),
        }
    }
}

impl std::str::FromStr for HashAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha1" => Ok(HashAlgorithm::Sha1),
            "sha256" => Ok(HashAlgorithm::Sha256),
            "sha384" => Ok(HashAlgorithm::Sha384),
            "sha512" => Ok(HashAlgorithm::Sha512),
            other => Err(format!("unknown hash algorithm: {}", other)),
        }
    }
}

impl std::fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HashAlgorithm::Sha1 => write!(f, "sha1"),
            HashAlgorithm::Sha256 => write!(f, "sha256"),
            HashAlgorithm::Sha384 => write!(f, "sha384"),
            HashAlgorithm::Sha512 => write!(f, "sha512"),
        }
    }
}

// =============================================================================
// PCR selection
// =============================================================================

/// One bank's worth of selected PCR indices (a TPMS_PCR_SELECTION).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcrSelection {
    pub algorithm: HashAlgorithm,
    pub indices: BTreeSet<u8>,
}

impl PcrSelection {
    pub fn new(algorithm: HashAlgorithm, indices: impl IntoIterator<Item = u8>) -> Self {
        Self {
            algorithm,
            indices: indices.into_iter().collect(),
        }
    }

    /// Select every PCR of the bank.
    pub fn all(algorithm: HashAlgorithm) -> Self {
        Self::new(algorithm, 0..PCR_COUNT as u8)
    }

    /// Selection bitmap (bit `i % 8` of byte `i / 8` set for PCR `i`).
    ///
    /// Indices >= [`PCR_COUNT`] are not representable and are dropped.
    pub fn bitmap(&self) -> [u8; PCR_SELECT_SIZE] {
        let mut bitmap = [0u8; PCR_SELECT_SIZE];
        for &idx in &self.indices {
            if (idx as usize) < PCR_COUNT {
                bitmap[idx as usize / 8] |= 1 << (idx % 8);
            }
        }
        bitmap
    }

    /// Decode a bitmap of arbitrary length into PCR indices.
    pub fn from_bitmap(algorithm: HashAlgorithm, bitmap: &[u8]) -> Self {
        let mut indices = BTreeSet::new();
        for (byte_idx, byte_val) in bitmap.iter().enumerate() {
            for bit_idx in 0..8 {
                if byte_val & (1 << bit_idx) != 0 {
                    indices.insert((byte_idx * 8 + bit_idx) as u8);
                }
            }
        }
        Self { algorithm, indices }
    }
}

// =============================================================================
// Validated PCR set
// =============================================================================

/// The bundle's PCR values after structural validation.
///
/// Invariants guaranteed by construction:
/// - every algorithm is a known bank algorithm
/// - every index is below [`PCR_COUNT`]
/// - every value has the digest length of its algorithm
/// - `(algorithm, index)` pairs are unique
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcrBanks {
    values: BTreeMap<(HashAlgorithm, u8), Vec<u8>>,
}

impl PcrBanks {
    /// Validate wire PCR entries.
    pub fn from_wire(pcrs: &[PcrValue]) -> Result<Self, VerifyError> {
        if pcrs.is_empty() {
            return Err(MalformedReason::NoPcrs.into());
        }
        let mut values = BTreeMap::new();
        for pcr in pcrs {
            let algorithm = HashAlgorithm::from_wire_id(pcr.digest_alg)
                .ok_or(MalformedReason::UnknownDigestAlgorithm { id: pcr.digest_alg })?;
            let index = u8::try_from(pcr.index)
                .ok()
                .filter(|&i| (i as usize) < PCR_COUNT)
                .ok_or(MalformedReason::PcrIndexOutOfRange { index: pcr.index })?;
            if pcr.digest.len() != algorithm.digest_len() {
                return Err(MalformedReason::PcrValueWrongLength {
                    index,
                    algorithm,
                    expected: algorithm.digest_len(),
                    got: pcr.digest.len(),
                }
                .into());
            }
            if values
                .insert((algorithm, index), pcr.digest.clone())
                .is_some()
            {
                return Err(MalformedReason::DuplicatePcr { index, algorithm }.into());
            }
        }
        Ok(Self { values })
    }

    /// Get a single PCR value.
    pub fn get(&self, algorithm: HashAlgorithm, index: u8) -> Option<&[u8]> {
        self.values.get(&(algorithm, index)).map(Vec::as_slice)
    }

    /// Distinct bank algorithms present, in algorithm-ID order.
    pub fn algorithms(&self) -> BTreeSet<HashAlgorithm> {
        self.values.keys().map(|(alg, _)| *alg).collect()
    }

    /// Iterate `(algorithm, index, value)` in algorithm then index order.
    pub fn iter(&self) -> impl Iterator<Item = (HashAlgorithm, u8, &[u8])> {
        self.values
            .iter()
            .map(|((alg, idx), value)| (*alg, *idx, value.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(index: i64, digest_alg: i64, digest: Vec<u8>) -> PcrValue {
        PcrValue {
            index,
            digest,
            digest_alg,
        }
    }

    #[test]
    fn test_hash_algorithm_properties() {
        assert_eq!(HashAlgorithm::Sha256 as u16, 0x000B);
        assert_eq!(HashAlgorithm::Sha1.digest_len(), 20);
        assert_eq!(HashAlgorithm::Sha512.digest_len(), 64);
        assert_eq!(HashAlgorithm::try_from(0x000Cu16), Ok(HashAlgorithm::Sha384));
        assert_eq!(HashAlgorithm::try_from(0x9999u16), Err(0x9999));
        assert_eq!(HashAlgorithm::from_wire_id(5), Some(HashAlgorithm::Sha256));
        assert_eq!(HashAlgorithm::from_wire_id(4), None);
        assert_eq!("SHA256".parse::<HashAlgorithm>(), Ok(HashAlgorithm::Sha256));
        assert_eq!(HashAlgorithm::Sha384.to_string(), "sha384");
        for alg in [
            HashAlgorithm::Sha1,
            HashAlgorithm::Sha256,
            HashAlgorithm::Sha384,
            HashAlgorithm::Sha512,
        ] {
            assert_eq!(HashAlgorithm::from_wire_id(alg.wire_id()), Some(alg));
            assert_eq!(alg.digest(b"abc").len(), alg.digest_len());
        }
    }

    #[test]
    fn test_extend_matches_manual_hash() {
        let measurement = Sha256::digest(b"measurement").to_vec();
        let extended = HashAlgorithm::Sha256.extend(&HashAlgorithm::Sha256.zero(), &measurement);

        let mut hasher = Sha256::new();
        hasher.update([0u8; 32]);
        hasher.update(&measurement);
        assert_eq!(extended, hasher.finalize().to_vec());
    }

    #[test]
    fn test_selection_bitmap() {
        let sel = PcrSelection::new(HashAlgorithm::Sha256, [0, 7, 8, 23]);
        assert_eq!(sel.bitmap(), [0x81, 0x01, 0x80]);
        assert_eq!(
            PcrSelection::from_bitmap(HashAlgorithm::Sha256, &sel.bitmap()),
            sel
        );
        assert_eq!(
            PcrSelection::all(HashAlgorithm::Sha1).bitmap(),
            [0xFF, 0xFF, 0xFF]
        );
    }

    #[test]
    fn test_banks_from_wire() {
        let banks = PcrBanks::from_wire(&[
            wire(0, 5, vec![0; 32]),
            wire(0, 3, vec![1; 20]),
            wire(7, 5, vec![7; 32]),
        ])
        .unwrap();
        assert_eq!(banks.len(), 3);
        assert_eq!(banks.get(HashAlgorithm::Sha256, 7), Some(&[7u8; 32][..]));
        assert_eq!(banks.get(HashAlgorithm::Sha1, 0), Some(&[1u8; 20][..]));
        assert_eq!(banks.get(HashAlgorithm::Sha1, 7), None);
        assert_eq!(
            banks.algorithms().into_iter().collect::<Vec<_>>(),
            vec![HashAlgorithm::Sha1, HashAlgorithm::Sha256]
        );
    }

    #[test]
    fn test_reject_duplicate_pcr() {
        let err =
            PcrBanks::from_wire(&[wire(3, 5, vec![0; 32]), wire(3, 5, vec![1; 32])]).unwrap_err();
        assert!(matches!(
            err,
            VerifyError::MalformedBundle(MalformedReason::DuplicatePcr { index: 3, .. })
        ));
    }

    #[test]
    fn test_reject_wrong_value_length() {
        let err = PcrBanks::from_wire(&[wire(5, 5, vec![0; 48])]).unwrap_err();
        assert!(matches!(
            err,
            VerifyError::MalformedBundle(MalformedReason::PcrValueWrongLength {
                index: 5,
                expected: 32,
                got: 48,
                ..
            })
        ));
    }

    #[test]
    fn test_reject_index_out_of_range() {
        for index in [24, -1, 300] {
            let err = PcrBanks::from_wire(&[wire(index, 5, vec![0; 32])]).unwrap_err();
            assert!(matches!(
                err,
                VerifyError::MalformedBundle(MalformedReason::PcrIndexOutOfRange { .. })
            ));
        }
    }

    #[test]
    fn test_reject_unknown_algorithm() {
        let err = PcrBanks::from_wire(&[wire(0, 4, vec![0; 16])]).unwrap_err();
        assert!(matches!(
            err,
            VerifyError::MalformedBundle(MalformedReason::UnknownDigestAlgorithm { id: 4 })
        ));
    }

    #[test]
    fn test_reject_empty() {
        assert!(matches!(
            PcrBanks::from_wire(&[]),
            Err(VerifyError::MalformedBundle(MalformedReason::NoPcrs))
        ));
    }
}
