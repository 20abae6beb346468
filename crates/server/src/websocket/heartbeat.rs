//! Per-client heartbeat monitor
//!
//! One monitor runs per [`Client`] for its whole lifetime:
//!
//! ```text
//! Running ──tick──> send HeartBeat ──ok──> Running
//!    │                    │
//!    │                    └──err──> (client self-closes) ──> stopped
//!    └──cancel──> Cancelled (terminal)
//! ```
//!
//! The monitor holds only a weak reference, so it never keeps a client
//! alive; if the client is gone at the next tick the monitor stops.

use std::sync::Weak;
use std::time::Duration;

use relay_shared::MessageType;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::client::Client;

/// Default period between heartbeats
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Payload carried by each heartbeat
pub const HEARTBEAT_CONTENT: &str = "heart beat";

/// Heartbeat loop
///
/// Waits a full interval before the first probe. Missed ticks are skipped
/// rather than burst.
pub async fn heartbeat_task(client: Weak<Client>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    // Skip the first immediate tick
    ticker.tick().await;
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Heartbeat cancelled");
                break;
            }
            _ = ticker.tick() => {
                let Some(client) = client.upgrade() else {
                    debug!("Client dropped, stopping heartbeat");
                    break;
                };

                // A failed send already triggered the client's self-close
                if let Err(e) = client.send_message(MessageType::HeartBeat, HEARTBEAT_CONTENT) {
                    debug!(client_id = %client.id(), error = %e, "Heartbeat send failed");
                    break;
                }
            }
        }
    }
}

/// Spawn the monitor for one client
pub fn spawn_heartbeat(
    client: Weak<Client>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(heartbeat_task(client, interval, cancel))
}
