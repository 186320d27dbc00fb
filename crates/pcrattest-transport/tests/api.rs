// SPDX-License-Identifier: MIT OR Apache-2.0

//! The verifier service, driven in-process and over a local socket

use std::time::Duration;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use serde_json::Value;
use tower::ServiceExt;

use pcrattest_attest::{
    default_selector, AttestationKey, AttestationKeyManager, ChallengeResponder, MemoryBlobStore,
    SimulatedRoot,
};
use pcrattest_transport::{router, AppState, ChallengeStore, VerifierClient};
use pcrattest_verify::{AttestationVerifier, PlatformAttestation, RejectReason};

struct Platform {
    root: SimulatedRoot,
    key: AttestationKey,
}

impl Platform {
    fn new(seed: u8) -> Self {
        let mut root = SimulatedRoot::with_seed([seed; 32]);
        let key = AttestationKeyManager::new(MemoryBlobStore::new())
            .mint(&mut root)
            .unwrap();
        Self { root, key }
    }

    fn attest(&mut self, nonce: &[u8]) -> PlatformAttestation {
        ChallengeResponder::new()
            .respond(&mut self.root, &self.key, nonce, &default_selector())
            .unwrap()
    }
}

fn service(platform: &Platform, ttl: Duration) -> Router {
    router(AppState::new(
        AttestationVerifier::new(platform.key.public().clone()),
        ChallengeStore::new(ttl),
    ))
}

async fn send(app: &Router, method: &str, uri: &str, body: Body) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(body)
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

async fn challenge(app: &Router) -> Vec<u8> {
    let (status, body) = send(app, "POST", "/challenge", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    hex::decode(body["nonce"].as_str().unwrap()).unwrap()
}

async fn submit(app: &Router, nonce: &[u8], bundle: &PlatformAttestation) -> (StatusCode, Value) {
    let request = serde_json::json!({
        "nonce": hex::encode(nonce),
        "attestation": bundle,
    });
    send(app, "POST", "/verify", Body::from(request.to_string())).await
}

#[tokio::test]
async fn test_challenge_round_trip_accepted() {
    let mut platform = Platform::new(1);
    let app = service(&platform, Duration::from_secs(60));

    let (status, body) = send(&app, "POST", "/challenge", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["expires_in_secs"], 60);
    let nonce = hex::decode(body["nonce"].as_str().unwrap()).unwrap();
    assert_eq!(nonce.len(), 32);

    let bundle = platform.attest(&nonce);
    let (status, body) = submit(&app, &nonce, &bundle).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["accepted"], true);
    assert!(body.get("reason").is_none());
    assert_eq!(body["data"], serde_json::to_value(&bundle).unwrap());
}

#[tokio::test]
async fn test_reused_nonce_rejected() {
    let mut platform = Platform::new(2);
    let app = service(&platform, Duration::from_secs(60));

    let nonce = challenge(&app).await;
    let bundle = platform.attest(&nonce);
    let (_, first) = submit(&app, &nonce, &bundle).await;
    assert_eq!(first["accepted"], true);

    let (status, second) = submit(&app, &nonce, &bundle).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["accepted"], false);
    assert_eq!(second["reason"], "NonceMismatch");
    assert!(second.get("data").is_none());
}

#[tokio::test]
async fn test_unissued_nonce_rejected() {
    let mut platform = Platform::new(3);
    let app = service(&platform, Duration::from_secs(60));

    let nonce = vec![0x42; 32];
    let bundle = platform.attest(&nonce);
    let (_, body) = submit(&app, &nonce, &bundle).await;
    assert_eq!(body["accepted"], false);
    assert_eq!(body["reason"], "NonceMismatch");
}

#[tokio::test]
async fn test_expired_nonce_rejected() {
    let mut platform = Platform::new(4);
    let app = service(&platform, Duration::ZERO);

    let nonce = challenge(&app).await;
    let bundle = platform.attest(&nonce);
    let (_, body) = submit(&app, &nonce, &bundle).await;
    assert_eq!(body["reason"], "NonceMismatch");
}

#[tokio::test]
async fn test_bundle_for_another_nonce_rejected() {
    let mut platform = Platform::new(5);
    let app = service(&platform, Duration::from_secs(60));

    let issued = challenge(&app).await;
    let bundle = platform.attest(&[0x42; 32]);
    let (_, body) = submit(&app, &issued, &bundle).await;
    assert_eq!(body["accepted"], false);
    assert_eq!(body["reason"], "NonceMismatch");
    assert_eq!(body["quote_index"], 0);
}

#[tokio::test]
async fn test_untrusted_key_rejected() {
    let trusted = Platform::new(6);
    let mut other = Platform::new(7);
    let app = service(&trusted, Duration::from_secs(60));

    let nonce = challenge(&app).await;
    let bundle = other.attest(&nonce);
    let (_, body) = submit(&app, &nonce, &bundle).await;
    assert_eq!(body["accepted"], false);
    assert_eq!(body["reason"], "SignatureInvalid");
}

#[tokio::test]
async fn test_malformed_request_is_bad_request() {
    let platform = Platform::new(8);
    let app = service(&platform, Duration::from_secs(60));

    let bodies = [
        "not json".to_string(),
        r#"{"nonce":"00"}"#.to_string(),
        r#"{"nonce":"zz","attestation":{}}"#.to_string(),
    ];
    for body in bodies {
        let (status, verdict) = send(&app, "POST", "/verify", Body::from(body.clone())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{}", body);
        assert_eq!(verdict["accepted"], false);
        assert_eq!(verdict["reason"], "MalformedBundle");
    }
}

#[tokio::test]
async fn test_bare_bundle_without_envelope_is_bad_request() {
    let mut platform = Platform::new(13);
    let app = service(&platform, Duration::from_secs(60));

    let nonce = challenge(&app).await;
    let bundle = platform.attest(&nonce);
    let (status, verdict) = send(&app, "POST", "/verify", Body::from(bundle.to_json())).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(verdict["reason"], "MalformedBundle");
}

#[tokio::test]
async fn test_malformed_bundle_does_not_consume_nonce() {
    let mut platform = Platform::new(9);
    let app = service(&platform, Duration::from_secs(60));

    let nonce = challenge(&app).await;
    let garbage = format!(r#"{{"nonce":"{}","attestation":[]}}"#, hex::encode(&nonce));
    let (status, _) = send(&app, "POST", "/verify", Body::from(garbage)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let bundle = platform.attest(&nonce);
    let (_, body) = submit(&app, &nonce, &bundle).await;
    assert_eq!(body["accepted"], true);
}

#[tokio::test]
async fn test_health_and_unknown_route() {
    let platform = Platform::new(10);
    let app = service(&platform, Duration::from_secs(60));

    let (status, body) = send(&app, "GET", "/health", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, serde_json::json!({ "status": "ok" }));

    let (status, body) = send(&app, "GET", "/nope", Body::empty()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "route not found");
}

#[tokio::test]
async fn test_challenges_refused_when_store_is_full() {
    let mut platform = Platform::new(12);
    let app = router(AppState::new(
        AttestationVerifier::new(platform.key.public().clone()),
        ChallengeStore::new(Duration::from_secs(60)).with_max_outstanding(1),
    ));

    let nonce = challenge(&app).await;
    let (status, body) = send(&app, "POST", "/challenge", Body::empty()).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "too many outstanding challenges");

    // The outstanding nonce still verifies and frees its slot
    let bundle = platform.attest(&nonce);
    let (_, body) = submit(&app, &nonce, &bundle).await;
    assert_eq!(body["accepted"], true);
    challenge(&app).await;
}

#[tokio::test]
async fn test_client_against_live_server() {
    let mut platform = Platform::new(11);
    let app = service(&platform, Duration::from_secs(60));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move { axum::serve(listener, app).await });

    let http = reqwest::Client::builder().no_proxy().build().unwrap();
    let client = VerifierClient::with_client(http, format!("http://{}/", addr));
    let nonce = client.challenge().await.unwrap();
    let bundle = platform.attest(&nonce);

    let verdict = client.submit(&nonce, bundle.clone()).await.unwrap();
    assert!(verdict.verdict.accepted);
    assert_eq!(verdict.data, Some(bundle.clone()));

    let replay = client.submit(&nonce, bundle).await.unwrap();
    assert!(!replay.verdict.accepted);
    assert_eq!(replay.verdict.reason, Some(RejectReason::NonceMismatch));

    server.abort();
}
