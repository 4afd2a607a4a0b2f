//! Connects to a cluster and follows leader changes.
//!
//! Run: `cargo run --example cluster_connect -- --seeds 127.0.0.1:2113,127.0.0.1:2114`
//!
//! This example shows:
//! - Gossip seed configuration and node preference
//! - Waiting for the first connection
//! - Issuing calls through the leader-aware invoker
//! - Reacting to connectivity errors

// Examples are allowed to use expect/unwrap for brevity
#![allow(clippy::expect_used, clippy::unwrap_used, clippy::disallowed_methods)]

use std::time::Duration;

use evdb_client::{
    ClientConfig, ClusterClient, NodePreference, Result,
    proto::{Empty, gossip_client::GossipClient},
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().collect();
    let seeds = args
        .iter()
        .position(|a| a == "--seeds")
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
        .unwrap_or("127.0.0.1:2113");
    let preference: NodePreference = args
        .iter()
        .position(|a| a == "--prefer")
        .and_then(|i| args.get(i + 1))
        .map(|p| p.parse::<NodePreference>())
        .transpose()?
        .unwrap_or_default();

    // -------------------------------------------------------------------------
    // 1. Configure discovery
    // -------------------------------------------------------------------------
    let config = ClientConfig::builder()
        .with_gossip_seeds(seeds.split(',').map(str::trim))
        .with_node_preference(preference)
        .with_discovery_interval(Duration::from_secs(30))
        .build()?;

    let client = ClusterClient::new(config).await?;

    // -------------------------------------------------------------------------
    // 2. Wait for the first connection
    // -------------------------------------------------------------------------
    let info = client.connection_info().await?;
    println!(
        "Connected to {} (generation {}, server version {})",
        info.endpoint(),
        info.generation(),
        info.capabilities().version.as_deref().unwrap_or("unknown")
    );

    // -------------------------------------------------------------------------
    // 3. Call through the invoker; "not leader" replies move the connection
    // -------------------------------------------------------------------------
    for round in 1..=5 {
        let info = client.connection_info().await?;
        let invoker = info.invoker();
        let mut gossip = GossipClient::new(invoker.channel());

        match invoker.unary(gossip.read(Empty {})).await {
            Ok(response) => {
                println!("[{round}] {} reports {} members", info.endpoint(), response.get_ref().members.len());
            },
            Err(status) => {
                println!("[{round}] {} failed: {} ({:?})", info.endpoint(), status.message(), status.code());
            },
        }

        tokio::time::sleep(Duration::from_secs(2)).await;
    }

    client.shutdown();
    Ok(())
}
