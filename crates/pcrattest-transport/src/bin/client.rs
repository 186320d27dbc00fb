// SPDX-License-Identifier: MIT OR Apache-2.0

//! Attest this platform to a verifier service
//!
//! Fetches a nonce, answers it with the local TPM and the stored AK, submits
//! the attestation and prints the verdict. Exits non-zero on rejection.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};

use pcrattest_attest::root::{DEFAULT_EVENT_LOG, DEFAULT_TPM_DEVICE};
use pcrattest_attest::{
    allocated_selector, AttestationKeyManager, ChallengeResponder, FileBlobStore, TpmRoot,
};
use pcrattest_transport::VerifierClient;
use pcrattest_verify::{HashAlgorithm, PcrSelection, PlatformAttestation};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Verifier service base URL
    #[arg(short, long, default_value = "http://127.0.0.1:8080")]
    server: String,

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

/// Answer `nonce` with the local TPM. The root is closed before returning.
fn attest(args: &Args, nonce: &[u8]) -> Result<PlatformAttestation> {
    let mut root = TpmRoot::open(&args.device, &args.event_log)?;
    let selector = match (args.bank, args.pcrs.is_empty()) {
        (None, true) => allocated_selector(&mut root)?,
        (bank, true) => vec![PcrSelection::all(bank.unwrap_or(HashAlgorithm::Sha256))],
        (bank, false) => vec![PcrSelection::new(
            bank.unwrap_or(HashAlgorithm::Sha256),
            args.pcrs.iter().copied(),
        )],
    };
    let manager = AttestationKeyManager::new(FileBlobStore::new(&args.key_blob));
    let key = manager.load_stored(&mut root)?;
    let bundle = ChallengeResponder::new().respond(&mut root, &key, nonce, &selector)?;
    Ok(bundle)
}

async fn run(args: &Args) -> Result<bool> {
    let client = VerifierClient::new(&args.server);
    let nonce = client.challenge().await?;
    info!("received challenge from {}", args.server);

    let bundle = tokio::task::block_in_place(|| attest(args, &nonce))?;
    let response = client.submit(&nonce, bundle).await?;

    match (&response.verdict.reason, &response.verdict.detail) {
        (None, _) => info!("attestation accepted"),
        (Some(reason), detail) => warn!(
            "attestation rejected: {}: {}",
            reason,
            detail.as_deref().unwrap_or("")
        ),
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&response.verdict).context("failed to encode verdict")?
    );
    Ok(response.verdict.accepted)
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    match run(&args).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            log::error!("{:#}", e);
            ExitCode::from(2)
        }
    }
}
