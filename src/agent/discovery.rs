use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::shutdown::ShutdownReceiver;
use crate::wire::{DISCOVERY_MAGIC, DiscoveryReply, Role};

use super::AgentState;

const MAX_DATAGRAM_BYTES: usize = 2048;

/// Answers discovery broadcasts until shutdown. Keeps no state between
/// requests; unrecognised datagrams are dropped silently.
pub(super) async fn run_discovery_responder(
    state: Arc<AgentState>,
    socket: UdpSocket,
    mut shutdown_rx: ShutdownReceiver,
) {
    if let Ok(addr) = socket.local_addr() {
        info!("Discovery responder listening on udp://{}", addr);
    }
    let mut buffer = [0u8; MAX_DATAGRAM_BYTES];
    loop {
        let (bytes, peer) = tokio::select! {
            _ = shutdown_rx.recv() => break,
            received = socket.recv_from(&mut buffer) => match received {
                Ok(received) => received,
                Err(err) => {
                    debug!("Discovery receive failed: {}", err);
                    continue;
                }
            },
        };
        let payload = buffer.get(..bytes).unwrap_or_default();
        if !is_discovery_request(payload) {
            continue;
        }
        let reply = discovery_reply(&state);
        let encoded = match serde_json::to_vec(&reply) {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!("Failed to encode discovery reply: {}", err);
                continue;
            }
        };
        match socket.send_to(&encoded, peer).await {
            Ok(_) => debug!("Answered discovery from {}", peer),
            Err(err) => debug!("Discovery reply to {} failed: {}", peer, err),
        }
    }
    debug!("Discovery responder stopped");
}

pub(super) fn is_discovery_request(payload: &[u8]) -> bool {
    let trimmed = payload
        .iter()
        .position(|byte| !byte.is_ascii_whitespace())
        .and_then(|start| payload.get(start..))
        .unwrap_or_default();
    trimmed.starts_with(DISCOVERY_MAGIC.as_bytes())
}

pub(super) fn discovery_reply(state: &AgentState) -> DiscoveryReply {
    DiscoveryReply {
        name: state.identity.name.clone().unwrap_or_default(),
        base: state.identity.base_url.clone(),
        port: state.control_port,
        mgmt: state.identity.mgmt_ip.clone(),
        version: state.identity.version.clone(),
        servers: state
            .supervisor
            .active_keys(Some(Role::Server))
            .into_iter()
            .map(|key| key.port)
            .collect(),
    }
}
