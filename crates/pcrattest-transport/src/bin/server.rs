// SPDX-License-Identifier: MIT OR Apache-2.0

//! Attestation verifier service
//!
//! Issues nonces on `POST /challenge` and verifies the platform attestations
//! posted to `POST /verify` against one trusted attestation key.

use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use log::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pcrattest_transport::{
    router, AppState, ChallengeStore, DEFAULT_MAX_OUTSTANDING, DEFAULT_NONCE_TTL_SECS,
};
use pcrattest_verify::{AkPublic, AttestationVerifier};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Socket address to listen on (e.g., "0.0.0.0:8080" or "[::]:8080")
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// Trusted AK public area (base64 TPMT_PUBLIC, as written by `mint-ak`)
    #[arg(short, long)]
    ak_public: PathBuf,

    /// Seconds an issued nonce stays redeemable
    #[arg(long, default_value_t = DEFAULT_NONCE_TTL_SECS)]
    nonce_ttl: u64,

    /// Most nonces awaiting redemption at once; further challenges get 503
    #[arg(long, default_value_t = DEFAULT_MAX_OUTSTANDING)]
    max_outstanding: usize,
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "pcrattest_server=info,pcrattest_transport=info,tower_http=debug,axum::rejection=trace"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let ak_text = fs::read_to_string(&args.ak_public)
        .with_context(|| format!("failed to read {}", args.ak_public.display()))?;
    let ak_public = AkPublic::from_base64(&ak_text).context("invalid AK public area")?;
    info!("trusting attestation key {}", hex::encode(ak_public.name()));

    let state = AppState::new(
        AttestationVerifier::new(ak_public),
        ChallengeStore::new(Duration::from_secs(args.nonce_ttl))
            .with_max_outstanding(args.max_outstanding),
    );
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    info!("listening on {}", args.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    Ok(())
}
