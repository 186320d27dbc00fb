// SPDX-License-Identifier: MIT OR Apache-2.0

//! Mint the attestation key
//!
//! Creates a new AK under the TPM's storage root key and writes its key blob.
//! Refuses to replace an existing blob unless `--force` is given.

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;

use pcrattest_attest::root::{DEFAULT_EVENT_LOG, DEFAULT_TPM_DEVICE};
use pcrattest_attest::{AttestationKeyManager, FileBlobStore, TpmRoot};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    /// TPM device
    #[arg(long, default_value = DEFAULT_TPM_DEVICE)]
    device: PathBuf,

    /// Where to write the key blob
    #[arg(short, long, default_value = "ak.json")]
    key_blob: PathBuf,

    /// Also write the AK public area (base64 TPMT_PUBLIC) here
    #[arg(short, long)]
    public_out: Option<PathBuf>,

    /// Replace an existing key blob
    #[arg(long)]
    force: bool,
}

fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));
    let cli = Cli::parse();

    let store = FileBlobStore::new(&cli.key_blob);
    if store.exists() && !cli.force {
        bail!(
            "{} already exists; pass --force to replace the attestation key",
            cli.key_blob.display()
        );
    }

    let mut root = TpmRoot::open(&cli.device, DEFAULT_EVENT_LOG)?;
    let manager = AttestationKeyManager::new(store);
    let key = manager.mint(&mut root)?;
    info!("key blob written to {}", cli.key_blob.display());

    let public = key.public().to_base64();
    if let Some(path) = &cli.public_out {
        fs::write(path, format!("{}\n", public))
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!("AK public area written to {}", path.display());
    }
    println!("{}", public);
    Ok(())
}
