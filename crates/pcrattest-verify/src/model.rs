// SPDX-License-Identifier: MIT OR Apache-2.0

//! Wire format of a platform attestation bundle.
//!
//! Field names are fixed by the JSON exchanged between prover and verifier.
//! Byte fields are standard padded base64.

use serde::{Deserialize, Serialize};

use crate::error::{MalformedReason, VerifyError};

/// `TPMVersion` value for TPM 1.2.
pub const TPM_VERSION_1_2: u8 = 1;

/// `TPMVersion` value for TPM 2.0, the only version the verifier accepts.
pub const TPM_VERSION_2_0: u8 = 2;

/// Everything a prover sends back for one challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformAttestation {
    #[serde(rename = "TPMVersion")]
    pub tpm_version: u8,
    /// TPMT_PUBLIC of the attestation key
    #[serde(rename = "Public", with = "base64_bytes")]
    pub public: Vec<u8>,
    #[serde(rename = "Quotes")]
    pub quotes: Vec<Quote>,
    #[serde(rename = "PCRs")]
    pub pcrs: Vec<PcrValue>,
    /// Raw TCG PC Client measurement log
    #[serde(rename = "EventLog", with = "base64_bytes")]
    pub event_log: Vec<u8>,
}

/// One signed quote over a PCR selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    #[serde(rename = "Version")]
    pub version: u8,
    /// TPMS_ATTEST bytes
    #[serde(rename = "Quote", with = "base64_bytes")]
    pub quote: Vec<u8>,
    /// TPMT_SIGNATURE bytes
    #[serde(rename = "Signature", with = "base64_bytes")]
    pub signature: Vec<u8>,
}

/// One PCR value.
///
/// `digest_alg` stays numeric so that unknown identifiers survive decoding
/// and are rejected by the verifier rather than the parser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcrValue {
    #[serde(rename = "Index")]
    pub index: i64,
    #[serde(rename = "Digest", with = "base64_bytes")]
    pub digest: Vec<u8>,
    #[serde(rename = "DigestAlg")]
    pub digest_alg: i64,
}

impl PlatformAttestation {
    /// Decode a bundle from its JSON wire form.
    pub fn from_json(json: &str) -> Result<Self, VerifyError> {
        serde_json::from_str(json).map_err(|e| MalformedReason::JsonParse(e).into())
    }

    /// Encode the bundle as JSON.
    pub fn to_json(&self) -> String {
        // Serialization of this type has no failure path
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Encode the bundle as indented JSON.
    pub fn to_json_pretty(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

/// serde adapter for `Vec<u8>` as standard base64. `null` decodes as empty.
pub mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::de::{self, Deserialize, Deserializer};
    use serde::ser::Serializer;

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            Some(s) => STANDARD.decode(s).map_err(de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_field_names() {
        let bundle = PlatformAttestation {
            tpm_version: TPM_VERSION_2_0,
            public: vec![0x00, 0x23],
            quotes: vec![Quote {
                version: TPM_VERSION_2_0,
                quote: vec![0xff, 0x54],
                signature: vec![0x00, 0x18],
            }],
            pcrs: vec![PcrValue {
                index: 7,
                digest: vec![0xAA; 4],
                digest_alg: 5,
            }],
            event_log: b"log".to_vec(),
        };

        let value: serde_json::Value = serde_json::from_str(&bundle.to_json()).unwrap();
        assert_eq!(value["TPMVersion"], 2);
        assert_eq!(value["Public"], "ACM=");
        assert_eq!(value["Quotes"][0]["Version"], 2);
        assert_eq!(value["Quotes"][0]["Quote"], "/1Q=");
        assert_eq!(value["Quotes"][0]["Signature"], "ABg=");
        assert_eq!(value["PCRs"][0]["Index"], 7);
        assert_eq!(value["PCRs"][0]["Digest"], "qqqqqg==");
        assert_eq!(value["PCRs"][0]["DigestAlg"], 5);
        assert_eq!(value["EventLog"], "bG9n");

        assert_eq!(PlatformAttestation::from_json(&bundle.to_json()).unwrap(), bundle);
    }

    #[test]
    fn test_null_bytes_decode_as_empty() {
        let json = r#"{"TPMVersion":2,"Public":null,"Quotes":[],"PCRs":[],"EventLog":null}"#;
        let bundle = PlatformAttestation::from_json(json).unwrap();
        assert!(bundle.public.is_empty());
        assert!(bundle.event_log.is_empty());
    }

    #[test]
    fn test_unknown_digest_alg_survives_decoding() {
        let json = r#"{"TPMVersion":2,"Public":"","Quotes":[],
            "PCRs":[{"Index":0,"Digest":"","DigestAlg":99}],"EventLog":""}"#;
        let bundle = PlatformAttestation::from_json(json).unwrap();
        assert_eq!(bundle.pcrs[0].digest_alg, 99);
    }

    #[test]
    fn test_reject_bad_base64_and_shape() {
        let bad_b64 = r#"{"TPMVersion":2,"Public":"!!!","Quotes":[],"PCRs":[],"EventLog":""}"#;
        assert!(matches!(
            PlatformAttestation::from_json(bad_b64),
            Err(VerifyError::MalformedBundle(MalformedReason::JsonParse(_)))
        ));
        assert!(matches!(
            PlatformAttestation::from_json("{\"TPMVersion\":2}"),
            Err(VerifyError::MalformedBundle(MalformedReason::JsonParse(_)))
        ));
        assert!(PlatformAttestation::from_json("not json").is_err());
    }
}
