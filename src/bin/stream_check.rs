//! Binary to open a SIM streaming connection and subscribe to EURUSD
//! (Uic 21, FxSpot) info prices for inspecting live frames.
//!
//! # Usage
//!
//! ```sh
//! export SAXO_ACCESS_TOKEN="your-24h-sim-token"
//! cargo run --bin stream_check --features cli
//! ```

use std::env;
use std::time::Duration;

use saxo_streaming::types::auth::AccessToken;
use saxo_streaming::types::subscription::SubscriptionSpec;
use saxo_streaming::ws::router::SubscriptionUpdate;
use saxo_streaming::ws::session::StreamingSessionBuilder;
use tokio::time;

#[tokio::main]
async fn main() -> saxo_streaming::error::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let token =
        env::var("SAXO_ACCESS_TOKEN").expect("set SAXO_ACCESS_TOKEN env var before running");

    let (session, handle) = StreamingSessionBuilder::new(AccessToken::new(token))
        .context_id(format!("check{}", std::process::id()))
        .build()?;
    let task = tokio::spawn(session.run());
    let mut events = handle.events();

    println!("Subscribing to EURUSD info prices…");
    let spec = SubscriptionSpec::new(
        "/trade/v1/infoprices/subscriptions",
        serde_json::json!({
            "Uic": 21,
            "AssetType": "FxSpot",
            "FieldGroups": ["Quote"]
        }),
    )
    .refresh_rate(1_000);
    let mut prices = handle.subscribe("eurusd", spec).await?;
    println!("Subscribed: {:?}", prices.response.state);

    println!("Listening for 10 seconds…\n");
    let deadline = time::sleep(Duration::from_secs(10));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => {
                println!("\n10 seconds elapsed, disconnecting…");
                break;
            }
            update = prices.updates.recv() => match update {
                Some(SubscriptionUpdate::Snapshot(v)) => println!("snapshot: {v:#}"),
                Some(SubscriptionUpdate::Data(m)) => println!("#{} {}", m.message_id, m.payload),
                Some(SubscriptionUpdate::Reset) => println!("server reset the subscription"),
                Some(SubscriptionUpdate::Closed { reason }) => {
                    println!("subscription closed: {reason}");
                    break;
                }
                None => {
                    println!("session ended");
                    break;
                }
            },
            event = events.recv() => {
                if let Ok(event) = event {
                    println!("event: {event:?}");
                }
            }
        }
    }

    let state = handle.subscription_state().await?;
    for (reference_id, message_id) in state.iter() {
        println!("last message for {reference_id}: {message_id}");
    }

    if let Err(e) = handle.unsubscribe("eurusd").await {
        eprintln!("Unsubscribe failed: {e}");
    }
    handle.close().await?;
    let reason = task.await.ok();
    println!("Done ({reason:?}).");

    Ok(())
}
