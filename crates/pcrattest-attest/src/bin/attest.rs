// SPDX-License-Identifier: MIT OR Apache-2.0

//! Answer a challenge
//!
//! Loads the stored AK, quotes the selected PCRs over the given nonce and
//! prints the attestation bundle as JSON. Without `--bank` or `--pcrs` every
//! allocated bank is quoted, one quote per bank.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use pcrattest_attest::root::{DEFAULT_EVENT_LOG, DEFAULT_TPM_DEVICE};
use pcrattest_attest::{
    allocated_selector, AttestationKeyManager, ChallengeResponder, FileBlobStore, TpmRoot,
};
use pcrattest_verify::{HashAlgorithm, PcrSelection};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    /// Nonce from the verifier (hex)
    #[arg(short, long)]
    nonce: String,

    /// PCR indices to quote (default: all)
    #[arg(long, value_delimiter = ',')]
    pcrs: Vec<u8>,

    /// PCR bank (default: every allocated bank, or sha256 with --pcrs)
    #[arg(long)]
    bank: Option<HashAlgorithm>,

    /// TPM device
    #[arg(long, default_value = DEFAULT_TPM_DEVICE)]
    device: PathBuf,

    /// Firmware measurement log
    #[arg(long, default_value = DEFAULT_EVENT_LOG)]
    event_log: PathBuf,

    /// Key blob written by `mint-ak`
    #[arg(short, long, default_value = "ak.json")]
    key_blob: PathBuf,
}

fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));
    let cli = Cli::parse();

    let nonce = hex::decode(cli.nonce.trim()).context("nonce is not valid hex")?;

    let mut root = TpmRoot::open(&cli.device, &cli.event_log)?;
    let selector = match (cli.bank, cli.pcrs.is_empty()) {
        (None, true) => allocated_selector(&mut root)?,
        (bank, true) => vec![PcrSelection::all(bank.unwrap_or(HashAlgorithm::Sha256))],
        (bank, false) => vec![PcrSelection::new(
            bank.unwrap_or(HashAlgorithm::Sha256),
            cli.pcrs.iter().copied(),
        )],
    };
    let manager = AttestationKeyManager::new(FileBlobStore::new(&cli.key_blob));
    let key = manager.load_stored(&mut root)?;
    let bundle = ChallengeResponder::new().respond(&mut root, &key, &nonce, &selector)?;

    println!("{}", bundle.to_json_pretty());
    Ok(())
}
