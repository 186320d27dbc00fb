// SPDX-License-Identifier: MIT OR Apache-2.0

//! PCR (Platform Configuration Register) operations
//!
//! Extension trait providing bank allocation and PCR reads for TPM.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{bail, Result};
use log::debug;

use pcrattest_verify::tpm::TpmWriter;
use pcrattest_verify::{HashAlgorithm, PcrSelection};

use crate::command::Command;
use crate::{Tpm, TpmCc, TPM_CAP_PCRS};

/// Extension trait for PCR operations
pub trait PcrOps {
    /// Which PCRs exist in which banks
    ///
    /// Banks with an algorithm this crate does not support are skipped.
    fn get_pcr_allocation(&mut self) -> Result<Vec<(HashAlgorithm, BTreeSet<u8>)>>;

    /// Read PCR values from one bank
    ///
    /// Fails if any requested PCR is not allocated in the bank.
    fn pcr_read_bank(
        &mut self,
        alg: HashAlgorithm,
        pcr_indices: &BTreeSet<u8>,
    ) -> Result<BTreeMap<u8, Vec<u8>>>;
}

impl PcrOps for Tpm {
    fn get_pcr_allocation(&mut self) -> Result<Vec<(HashAlgorithm, BTreeSet<u8>)>> {
        let mut reader = self.get_capability(TPM_CAP_PCRS, 0, 16)?;

        let mut allocation = Vec::new();
        for selection in reader.pcr_selections()? {
            match selection {
                Ok(selection) => allocation.push((selection.algorithm, selection.indices)),
                Err(alg_id) => debug!("skipping PCR bank with algorithm 0x{:04X}", alg_id),
            }
        }
        Ok(allocation)
    }

    fn pcr_read_bank(
        &mut self,
        alg: HashAlgorithm,
        pcr_indices: &BTreeSet<u8>,
    ) -> Result<BTreeMap<u8, Vec<u8>>> {
        let mut remaining = pcr_indices.clone();
        let mut values = BTreeMap::new();

        // A TPML_DIGEST holds at most 8 digests; the returned selection says
        // which PCRs this round covered.
        while !remaining.is_empty() {
            let request = PcrSelection {
                algorithm: alg,
                indices: remaining.clone(),
            };
            let mut response = self.execute(
                Command::new(TpmCc::PcrRead)
                    .parameters(TpmWriter::new().pcr_selections(&[request])),
            )?;
            let params = &mut response.parameters;

            let _update_counter = params.u32()?;

            let mut returned = Vec::new();
            for selection in params.pcr_selections()? {
                match selection {
                    Ok(selection) if selection.algorithm == alg => {
                        returned.extend(selection.indices)
                    }
                    Ok(selection) => bail!(
                        "PCR_Read returned the {} bank, requested {}",
                        selection.algorithm,
                        alg
                    ),
                    Err(alg_id) => bail!(
                        "PCR_Read returned bank 0x{:04X}, requested {}",
                        alg_id,
                        alg
                    ),
                }
            }

            let digest_count = params.u32()? as usize;
            if digest_count != returned.len() {
                bail!(
                    "PCR_Read returned {} digests for {} selected PCRs",
                    digest_count,
                    returned.len()
                );
            }
            if returned.is_empty() {
                let missing: Vec<String> = remaining.iter().map(u8::to_string).collect();
                bail!(
                    "PCRs [{}] are not allocated in the {} bank",
                    missing.join(", "),
                    alg
                );
            }

            for index in returned {
                let digest = params.tpm2b()?;
                if digest.len() != alg.digest_len() {
                    bail!(
                        "PCR {} in the {} bank has {} bytes, expected {}",
                        index,
                        alg,
                        digest.len(),
                        alg.digest_len()
                    );
                }
                if !remaining.remove(&index) {
                    bail!("PCR_Read returned unrequested PCR {}", index);
                }
                values.insert(index, digest);
            }
        }

        Ok(values)
    }
}
