// SPDX-License-Identifier: MIT OR Apache-2.0

//! Self-test
//!
//! Ensures an AK exists, answers a fresh random challenge, verifies the answer
//! and checks that a wrong nonce is rejected. `--simulate` runs against a
//! software root instead of the TPM, with the key held in memory.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use log::{error, info};

use pcrattest_attest::root::{DEFAULT_EVENT_LOG, DEFAULT_TPM_DEVICE};
use pcrattest_attest::selftest::{self, SelfTestReport};
use pcrattest_attest::{
    allocated_selector, AttestationKeyManager, FileBlobStore, MemoryBlobStore, SimulatedRoot,
    TpmRoot,
};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    /// Use a simulated root of trust instead of the TPM
    #[arg(long)]
    simulate: bool,

    /// TPM device
    #[arg(long, default_value = DEFAULT_TPM_DEVICE)]
    device: PathBuf,

    /// Firmware measurement log
    #[arg(long, default_value = DEFAULT_EVENT_LOG)]
    event_log: PathBuf,

    /// Key blob; minted if missing
    #[arg(short, long, default_value = "ak.json")]
    key_blob: PathBuf,
}

fn run(cli: &Cli) -> Result<SelfTestReport> {
    if cli.simulate {
        let mut root = SimulatedRoot::new();
        let selector = allocated_selector(&mut root)?;
        let manager = AttestationKeyManager::new(MemoryBlobStore::new());
        return Ok(selftest::run(&mut root, &manager, &selector)?);
    }

    let mut root = TpmRoot::open(&cli.device, &cli.event_log)?;
    let selector = allocated_selector(&mut root)?;
    for selection in &selector {
        info!(
            "TPM bank {}: {} PCRs",
            selection.algorithm,
            selection.indices.len()
        );
    }
    let manager = AttestationKeyManager::new(FileBlobStore::new(&cli.key_blob));
    Ok(selftest::run(&mut root, &manager, &selector)?)
}

fn main() -> ExitCode {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));
    let cli = Cli::parse();

    match run(&cli) {
        Ok(report) => {
            println!(
                "{}",
                serde_json::to_string_pretty(&report).unwrap_or_default()
            );
            if report.passed() {
                info!("self-test passed");
                ExitCode::SUCCESS
            } else {
                error!("self-test failed");
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::from(2)
        }
    }
}
