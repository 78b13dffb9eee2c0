//! The background pinger: periodically probes peers someone is waiting
//! on, so reboots are eventually observed even with no other traffic.

use crate::registry::{PeerRegistry, PingDecision};
use crate::{PingOutcome, SyncMode};
use std::sync::Arc;
use tracing::debug;

/// Drive the ping loop until the registry shuts down. Spawn once per
/// process, after the registry is constructed.
///
/// Each round walks the armed peers: a peer with recent traffic is taken
/// off the list (the liveness transition already ran recovery); everyone
/// else is probed. A successful probe feeds [`PeerRegistry::note_alive`],
/// which triggers the recovery actions as a side effect.
pub async fn run_pinger(registry: Arc<PeerRegistry>) {
    let interval = registry.tuning().ping_interval;
    loop {
        tokio::time::sleep(interval).await;
        if registry.is_shutting_down() {
            debug!(component = "RECOV", "pinger exiting");
            return;
        }
        for peer in registry.armed_peers() {
            match registry.ping_decision(peer) {
                PingDecision::Disarm => {
                    registry.count_ping(false);
                    registry.disarm_pinger(peer);
                }
                PingDecision::Ping => {
                    registry.count_ping(true);
                    match registry.probe().ping(peer).await {
                        PingOutcome::Alive(gen) => {
                            registry
                                .note_alive(peer, gen, SyncMode::Asynchronous)
                                .await;
                            registry.disarm_pinger(peer);
                        }
                        PingOutcome::Timeout | PingOutcome::ServiceDisabled => {
                            // Still down; keep the peer on the list.
                        }
                    }
                }
            }
        }
    }
}
