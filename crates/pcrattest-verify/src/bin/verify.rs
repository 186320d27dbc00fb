// SPDX-License-Identifier: MIT OR Apache-2.0

//! Verify a platform attestation bundle
//!
//! Reads bundle JSON from a file or stdin, verifies it against a nonce and a
//! trusted AK public area, and prints the verdict as JSON. Exits non-zero on
//! rejection.

use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use pcrattest_verify::{verify_json, AkPublic, Verdict};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    /// Bundle JSON file, or `-` for stdin
    #[arg(short, long, default_value = "-")]
    bundle: String,

    /// Nonce the bundle must be bound to (hex)
    #[arg(short, long)]
    nonce: String,

    /// Trusted AK public area (base64 TPMT_PUBLIC, as written by `mint-ak`)
    #[arg(short, long)]
    ak_public: PathBuf,
}

fn read_bundle(source: &str) -> Result<String> {
    if source == "-" {
        let mut input = String::new();
        io::stdin()
            .read_to_string(&mut input)
            .context("failed to read stdin")?;
        Ok(input)
    } else {
        fs::read_to_string(source).with_context(|| format!("failed to read {}", source))
    }
}

fn run(cli: &Cli) -> Result<bool> {
    let nonce = hex::decode(cli.nonce.trim()).context("nonce is not valid hex")?;
    let ak_text = fs::read_to_string(&cli.ak_public)
        .with_context(|| format!("failed to read {}", cli.ak_public.display()))?;
    let ak_public = AkPublic::from_base64(&ak_text).context("invalid AK public area")?;
    let json = read_bundle(&cli.bundle)?;

    let result = verify_json(&json, &nonce, &ak_public);
    match result.rejection() {
        None => info!("attestation accepted"),
        Some(rejection) => warn!("attestation rejected: {}", rejection.detail),
    }
    println!("{}", serde_json::to_string_pretty(&Verdict::from(&result))?);
    Ok(result.is_accepted())
}

fn main() -> ExitCode {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));
    let cli = Cli::parse();

    match run(&cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::from(2)
        }
    }
}
