//! Integration tests against the Saxo SIM environment
//! (`https://gateway.saxobank.com/sim/openapi`).
//!
//! # Running
//!
//! These tests require a SIM access token (the 24-hour developer token
//! works). Set it before running:
//!
//! ```sh
//! export SAXO_ACCESS_TOKEN="your-access-token"
//! cargo test --test sim -- --nocapture
//! ```
//!
//! Without the env var, every test is silently skipped.
//!
//! # What is tested
//!
//! - **Subscriptions**: create → snapshot → remove on the info price service
//! - **Streaming**: connect, receive a frame, survive a caller reconnect
//! - **Error handling**: bad subscription arguments produce a typed API error

use std::time::Duration;

use saxo_streaming::client::RestClient;
use saxo_streaming::error::StreamingError;
use saxo_streaming::types::auth::AccessToken;
use saxo_streaming::types::subscription::SubscriptionSpec;
use saxo_streaming::ws::lifecycle::{ConnectionState, DisconnectReason};
use saxo_streaming::ws::router::SubscriptionUpdate;
use saxo_streaming::ws::session::{SessionEvent, StreamingSessionBuilder};
use serde_json::json;
use tokio::time::timeout;

const INFO_PRICES: &str = "/trade/v1/infoprices/subscriptions";

/// EURUSD spot, available on every SIM account.
fn eurusd() -> SubscriptionSpec {
    SubscriptionSpec::new(
        INFO_PRICES,
        json!({ "Uic": 21, "AssetType": "FxSpot", "FieldGroups": ["Quote"] }),
    )
}

/// Helper: read the SIM token or skip the test.
fn sim_token() -> Option<String> {
    let token = std::env::var("SAXO_ACCESS_TOKEN").ok()?;
    if token.is_empty() {
        return None;
    }
    Some(token)
}

/// Macro to skip a test when credentials are missing.
macro_rules! require_token {
    () => {
        match sim_token() {
            Some(t) => t,
            None => {
                eprintln!("⏭  Skipped (SAXO_ACCESS_TOKEN not set)");
                return;
            }
        }
    };
}

fn context_id(test: &str) -> String {
    format!("{test}{}", chrono::Utc::now().timestamp_millis() % 1_000_000)
}

// ===================================================================
// REST subscriptions
// ===================================================================

#[tokio::test]
async fn test_subscription_create_and_remove() {
    let token = require_token!();
    let client = RestClient::new(&token).expect("client");
    let context = context_id("rest");
    let spec = eurusd();

    let resp = client
        .create_subscription(INFO_PRICES, &spec.to_request(&context, "eurusd"))
        .await
        .expect("create_subscription failed");
    assert!(resp.snapshot.is_some(), "info price subscriptions carry a snapshot");
    println!("✔ Created: state={:?}, refresh={:?}", resp.state, resp.refresh_rate);

    client
        .remove_subscription(INFO_PRICES, &context, "eurusd")
        .await
        .expect("remove_subscription failed");
    println!("✔ Removed");
}

#[tokio::test]
async fn test_bad_arguments_are_api_errors() {
    let token = require_token!();
    let client = RestClient::new(&token).expect("client");
    let spec = SubscriptionSpec::new(INFO_PRICES, json!({ "Uic": -1, "AssetType": "NoSuchType" }));

    match client
        .create_subscription(INFO_PRICES, &spec.to_request(&context_id("bad"), "bad"))
        .await
    {
        Err(StreamingError::Api { status, body }) => {
            assert!(status.is_client_error());
            println!("✔ Api error: {status} {body}");
        }
        Err(StreamingError::HttpStatus { status, .. }) => {
            assert!(status.is_client_error());
            println!("✔ Http error: {status}");
        }
        other => panic!("expected a client error, got {other:?}"),
    }
}

// ===================================================================
// Streaming
// ===================================================================

#[tokio::test]
async fn test_stream_snapshot_and_reconnect() {
    let token = require_token!();
    let (session, handle) = StreamingSessionBuilder::new(AccessToken::new(token))
        .context_id(context_id("ws"))
        .build()
        .expect("build");
    let task = tokio::spawn(session.run());

    timeout(
        Duration::from_secs(15),
        handle.wait_for_state(ConnectionState::Open),
    )
    .await
    .expect("connect timed out")
    .expect("session closed");
    println!("✔ Connected");

    let mut sub = handle.subscribe("eurusd", eurusd()).await.expect("subscribe failed");
    match timeout(Duration::from_secs(10), sub.updates.recv()).await {
        Ok(Some(SubscriptionUpdate::Snapshot(v))) => println!("✔ Snapshot: {v}"),
        other => panic!("expected snapshot, got {other:?}"),
    }

    let mut events = handle.events();
    handle.reconnect().await.expect("reconnect");
    timeout(Duration::from_secs(15), async {
        while let Ok(event) = events.recv().await {
            if event == SessionEvent::StateChanged(ConnectionState::Open) {
                return;
            }
        }
    })
    .await
    .expect("reconnect timed out");
    println!("✔ Reconnected");

    handle.unsubscribe("eurusd").await.expect("unsubscribe failed");
    handle.close().await.expect("close");
    assert_eq!(task.await.expect("join"), DisconnectReason::ClosedByCaller);
    println!("✔ Closed");
}
