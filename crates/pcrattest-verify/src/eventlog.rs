// SPDX-License-Identifier: MIT OR Apache-2.0

//! TCG PC Client measurement log: parsing, replay and construction.
//!
//! Two layouts are understood:
//! - crypto-agile: a legacy-format `Spec ID Event03` header event followed by
//!   TCG_PCR_EVENT2 records carrying one digest per declared algorithm
//! - legacy: TCG_PCR_EVENT records with a single SHA-1 digest
//!
//! All integers are little-endian.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::EventLogParseReason;
use crate::pcr::{HashAlgorithm, PCR_COUNT};

pub const EV_POST_CODE: u32 = 0x0000_0001;
pub const EV_NO_ACTION: u32 = 0x0000_0003;
pub const EV_SEPARATOR: u32 = 0x0000_0004;
pub const EV_ACTION: u32 = 0x0000_0005;
pub const EV_S_CRTM_VERSION: u32 = 0x0000_0008;
pub const EV_EFI_VARIABLE_DRIVER_CONFIG: u32 = 0x8000_0001;
pub const EV_EFI_BOOT_SERVICES_APPLICATION: u32 = 0x8000_0003;

/// Signature of the crypto-agile header event (including the NUL).
pub const SPEC_ID_EVENT03_SIGNATURE: &[u8; 16] = b"Spec ID Event03\0";

/// Upper bound on a single event's data.
const MAX_EVENT_DATA_SIZE: u32 = 1 << 20;

/// Upper bound on algorithms declared by the header.
const MAX_DECLARED_ALGORITHMS: u32 = 16;

/// Size of the SHA-1 digest in a legacy TCG_PCR_EVENT.
const SHA1_DIGEST_SIZE: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// SHA-1 only TCG_PCR_EVENT records
    Legacy,
    /// `Spec ID Event03` header followed by TCG_PCR_EVENT2 records
    CryptoAgile,
}

/// One measurement event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub pcr_index: u8,
    pub event_type: u32,
    /// Digests for known bank algorithms, in log order
    pub digests: Vec<(HashAlgorithm, Vec<u8>)>,
    pub data: Vec<u8>,
}

impl Event {
    /// Whether replay extends this event into its PCR.
    pub fn is_extended(&self) -> bool {
        self.event_type != EV_NO_ACTION
    }

    pub fn digest(&self, algorithm: HashAlgorithm) -> Option<&[u8]> {
        self.digests
            .iter()
            .find(|(alg, _)| *alg == algorithm)
            .map(|(_, d)| d.as_slice())
    }
}

/// A parsed measurement log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventLog {
    pub format: LogFormat,
    /// Known bank algorithms the log records digests for
    pub algorithms: BTreeSet<HashAlgorithm>,
    /// Events after the header, in log order
    pub events: Vec<Event>,
}

impl EventLog {
    /// Parse a binary measurement log.
    pub fn parse(data: &[u8]) -> Result<Self, EventLogParseReason> {
        if data.is_empty() {
            return Err(EventLogParseReason::Empty);
        }

        let mut cursor = LeCursor::new(data);
        let first = read_legacy_event(&mut cursor, 0)?;

        if first.event_type == EV_NO_ACTION
            && first.pcr_index == 0
            && first.data.starts_with(SPEC_ID_EVENT03_SIGNATURE)
        {
            let declared = parse_spec_id(&first.data)?;
            let algorithms = declared
                .iter()
                .filter_map(|(alg_id, _)| HashAlgorithm::try_from(*alg_id).ok())
                .collect();

            let mut events = Vec::new();
            while !cursor.is_empty() {
                let event_number = events.len() + 1;
                events.push(read_event2(&mut cursor, event_number, &declared)?);
            }
            return Ok(Self {
                format: LogFormat::CryptoAgile,
                algorithms,
                events,
            });
        }

        let mut events = vec![first];
        while !cursor.is_empty() {
            let event_number = events.len();
            events.push(read_legacy_event(&mut cursor, event_number)?);
        }
        Ok(Self {
            format: LogFormat::Legacy,
            algorithms: BTreeSet::from([HashAlgorithm::Sha1]),
            events,
        })
    }

    /// Replay every extending event from all-zero PCRs.
    ///
    /// Returns the final value of each `(bank, PCR)` the log extends at
    /// least once. PCRs the log never touches are absent.
    pub fn replay(&self) -> BTreeMap<(HashAlgorithm, u8), Vec<u8>> {
        let mut pcrs: BTreeMap<(HashAlgorithm, u8), Vec<u8>> = BTreeMap::new();
        for event in self.events.iter().filter(|e| e.is_extended()) {
            for (alg, digest) in &event.digests {
                let current = pcrs
                    .entry((*alg, event.pcr_index))
                    .or_insert_with(|| alg.zero());
                *current = alg.extend(current, digest);
            }
        }
        pcrs
    }
}

/// Parse the body of a `Spec ID Event03` event into `(alg_id, digest_size)`
/// pairs.
fn parse_spec_id(data: &[u8]) -> Result<Vec<(u16, u16)>, EventLogParseReason> {
    let mut cursor = LeCursor::new(data);

    cursor.read_bytes(16).map_err(spec_id_invalid("signature"))?;
    let _platform_class = cursor.read_u32().map_err(spec_id_invalid("platformClass"))?;
    let _minor = cursor.read_u8().map_err(spec_id_invalid("specVersionMinor"))?;
    let major = cursor.read_u8().map_err(spec_id_invalid("specVersionMajor"))?;
    let _errata = cursor.read_u8().map_err(spec_id_invalid("specErrata"))?;
    let _uintn_size = cursor.read_u8().map_err(spec_id_invalid("uintnSize"))?;
    if major != 2 {
        return Err(EventLogParseReason::SpecIdInvalid {
            detail: "specVersionMajor is not 2",
        });
    }

    let count = cursor.read_u32().map_err(spec_id_invalid("numberOfAlgorithms"))?;
    if count == 0 || count > MAX_DECLARED_ALGORITHMS {
        return Err(EventLogParseReason::SpecIdInvalid {
            detail: "numberOfAlgorithms out of range",
        });
    }

    let mut declared = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let alg_id = cursor.read_u16().map_err(spec_id_invalid("digestSizes"))?;
        let size = cursor.read_u16().map_err(spec_id_invalid("digestSizes"))?;
        if let Ok(alg) = HashAlgorithm::try_from(alg_id) {
            if alg.digest_len() != size as usize {
                return Err(EventLogParseReason::SpecIdInvalid {
                    detail: "digest size does not match algorithm",
                });
            }
        }
        if declared.iter().any(|(id, _)| *id == alg_id) {
            return Err(EventLogParseReason::SpecIdInvalid {
                detail: "algorithm declared twice",
            });
        }
        declared.push((alg_id, size));
    }

    let vendor_size = cursor.read_u8().map_err(spec_id_invalid("vendorInfoSize"))?;
    cursor
        .read_bytes(vendor_size as usize)
        .map_err(spec_id_invalid("vendorInfo"))?;

    Ok(declared)
}

fn spec_id_invalid(detail: &'static str) -> impl Fn(usize) -> EventLogParseReason {
    move |_| EventLogParseReason::SpecIdInvalid { detail }
}

/// TCG_PCR_EVENT: pcrIndex, eventType, digest[20], eventSize, event
fn read_legacy_event(cursor: &mut LeCursor, event: usize) -> Result<Event, EventLogParseReason> {
    let truncated = |offset| EventLogParseReason::Truncated { event, offset };

    let pcr_index = read_pcr_index(cursor, event)?;
    let event_type = cursor.read_u32().map_err(truncated)?;
    let digest = cursor.read_bytes(SHA1_DIGEST_SIZE).map_err(truncated)?;
    let data = read_event_data(cursor, event)?;

    Ok(Event {
        pcr_index,
        event_type,
        digests: vec![(HashAlgorithm::Sha1, digest.to_vec())],
        data,
    })
}

/// TCG_PCR_EVENT2: pcrIndex, eventType, TPML_DIGEST_VALUES, eventSize, event
fn read_event2(
    cursor: &mut LeCursor,
    event: usize,
    declared: &[(u16, u16)],
) -> Result<Event, EventLogParseReason> {
    let truncated = |offset| EventLogParseReason::Truncated { event, offset };

    let pcr_index = read_pcr_index(cursor, event)?;
    let event_type = cursor.read_u32().map_err(truncated)?;

    // Every declared bank gets exactly one digest, so replay never skips a
    // bank for an event
    let count = cursor.read_u32().map_err(truncated)?;
    if count as usize != declared.len() {
        return Err(EventLogParseReason::DigestCountMismatch {
            event,
            count,
            declared: declared.len(),
        });
    }

    let mut seen = BTreeSet::new();
    let mut digests = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let alg_id = cursor.read_u16().map_err(truncated)?;
        let size = declared
            .iter()
            .find(|(id, _)| *id == alg_id)
            .map(|(_, size)| *size)
            .ok_or(EventLogParseReason::UndeclaredAlgorithm { event, alg_id })?;
        if !seen.insert(alg_id) {
            return Err(EventLogParseReason::DuplicateDigest { event, alg_id });
        }
        let digest = cursor.read_bytes(size as usize).map_err(truncated)?;
        // Digests of banks we do not model are skipped
        if let Ok(alg) = HashAlgorithm::try_from(alg_id) {
            digests.push((alg, digest.to_vec()));
        }
    }

    let data = read_event_data(cursor, event)?;
    Ok(Event {
        pcr_index,
        event_type,
        digests,
        data,
    })
}

fn read_pcr_index(cursor: &mut LeCursor, event: usize) -> Result<u8, EventLogParseReason> {
    let index = cursor
        .read_u32()
        .map_err(|offset| EventLogParseReason::Truncated { event, offset })?;
    if index as usize >= PCR_COUNT {
        return Err(EventLogParseReason::PcrIndexOutOfRange { event, index });
    }
    Ok(index as u8)
}

fn read_event_data(cursor: &mut LeCursor, event: usize) -> Result<Vec<u8>, EventLogParseReason> {
    let truncated = |offset| EventLogParseReason::Truncated { event, offset };
    let size = cursor.read_u32().map_err(truncated)?;
    if size > MAX_EVENT_DATA_SIZE {
        return Err(EventLogParseReason::EventTooLarge { event, size });
    }
    Ok(cursor.read_bytes(size as usize).map_err(truncated)?.to_vec())
}

/// Little-endian cursor. Errors carry the offset of the failed read.
struct LeCursor<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> LeCursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn is_empty(&self) -> bool {
        self.offset >= self.data.len()
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], usize> {
        let end = self.offset.checked_add(len).ok_or(self.offset)?;
        if end > self.data.len() {
            return Err(self.offset);
        }
        let bytes = &self.data[self.offset..end];
        self.offset = end;
        Ok(bytes)
    }

    fn read_u8(&mut self) -> Result<u8, usize> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, usize> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, usize> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Writes a measurement log the way firmware does, for simulated roots and
/// tests.
///
/// Each measured event's digest is the bank hash of its event data.
#[derive(Debug, Clone)]
pub struct EventLogBuilder {
    format: LogFormat,
    algorithms: Vec<HashAlgorithm>,
    data: Vec<u8>,
}

impl EventLogBuilder {
    /// Start a crypto-agile log recording the given banks.
    pub fn crypto_agile(algorithms: &[HashAlgorithm]) -> Self {
        let mut spec_id = SPEC_ID_EVENT03_SIGNATURE.to_vec();
        spec_id.extend_from_slice(&0u32.to_le_bytes()); // platformClass
        spec_id.extend_from_slice(&[0, 2, 0, 2]); // minor, major, errata, uintnSize
        spec_id.extend_from_slice(&(algorithms.len() as u32).to_le_bytes());
        for alg in algorithms {
            spec_id.extend_from_slice(&(*alg as u16).to_le_bytes());
            spec_id.extend_from_slice(&(alg.digest_len() as u16).to_le_bytes());
        }
        spec_id.push(0); // vendorInfoSize

        let mut data = Vec::new();
        write_legacy_event(&mut data, 0, EV_NO_ACTION, &[0u8; SHA1_DIGEST_SIZE], &spec_id);
        Self {
            format: LogFormat::CryptoAgile,
            algorithms: algorithms.to_vec(),
            data,
        }
    }

    /// Start a legacy SHA-1 log.
    pub fn legacy() -> Self {
        Self {
            format: LogFormat::Legacy,
            algorithms: vec![HashAlgorithm::Sha1],
            data: Vec::new(),
        }
    }

    pub fn algorithms(&self) -> &[HashAlgorithm] {
        &self.algorithms
    }

    /// Record a measured event. Returns the per-bank digests the caller must
    /// extend into `pcr_index`.
    pub fn measure(
        &mut self,
        pcr_index: u8,
        event_type: u32,
        event_data: &[u8],
    ) -> Vec<(HashAlgorithm, Vec<u8>)> {
        let digests: Vec<_> = self
            .algorithms
            .iter()
            .map(|alg| (*alg, alg.digest(event_data)))
            .collect();
        self.push(pcr_index, event_type, &digests, event_data);
        digests
    }

    /// Record an informational event that is never extended.
    pub fn no_action(&mut self, pcr_index: u8, event_data: &[u8]) {
        let digests: Vec<_> = self
            .algorithms
            .iter()
            .map(|alg| (*alg, alg.zero()))
            .collect();
        self.push(pcr_index, EV_NO_ACTION, &digests, event_data);
    }

    pub fn build(&self) -> Vec<u8> {
        self.data.clone()
    }

    fn push(
        &mut self,
        pcr_index: u8,
        event_type: u32,
        digests: &[(HashAlgorithm, Vec<u8>)],
        event_data: &[u8],
    ) {
        match self.format {
            LogFormat::Legacy => {
                write_legacy_event(&mut self.data, pcr_index, event_type, &digests[0].1, event_data)
            }
            LogFormat::CryptoAgile => {
                let out = &mut self.data;
                out.extend_from_slice(&(pcr_index as u32).to_le_bytes());
                out.extend_from_slice(&event_type.to_le_bytes());
                out.extend_from_slice(&(digests.len() as u32).to_le_bytes());
                for (alg, digest) in digests {
                    out.extend_from_slice(&(*alg as u16).to_le_bytes());
                    out.extend_from_slice(digest);
                }
                out.extend_from_slice(&(event_data.len() as u32).to_le_bytes());
                out.extend_from_slice(event_data);
            }
        }
    }
}

fn write_legacy_event(out: &mut Vec<u8>, pcr_index: u8, event_type: u32, digest: &[u8], data: &[u8]) {
    out.extend_from_slice(&(pcr_index as u32).to_le_bytes());
    out.extend_from_slice(&event_type.to_le_bytes());
    out.extend_from_slice(digest);
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(data);
}
