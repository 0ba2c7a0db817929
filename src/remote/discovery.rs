use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::debug;

use crate::error::AppResult;
use crate::wire::{DEFAULT_DISCOVERY_PORT, DISCOVERY_MAGIC, DiscoveryReply};

const MAX_DATAGRAM_BYTES: usize = 4096;

#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// Broadcast address by default; a unicast address probes one host.
    pub target: IpAddr,
    pub port: u16,
    /// How long replies are collected after the first probe.
    pub timeout: Duration,
    /// Number of probe datagrams sent.
    pub retries: u32,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            target: IpAddr::V4(Ipv4Addr::BROADCAST),
            port: DEFAULT_DISCOVERY_PORT,
            timeout: Duration::from_millis(800),
            retries: 2,
        }
    }
}

/// Broadcasts the discovery magic and collects agent replies until the
/// timeout elapses. Replies are de-duplicated by base address and returned
/// sorted by it.
///
/// # Errors
///
/// Returns an error when the probe socket cannot be bound or no probe
/// datagram could be sent.
pub async fn discover_agents(options: &DiscoveryOptions) -> AppResult<Vec<DiscoveryReply>> {
    let bind_addr = match options.target {
        IpAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        IpAddr::V6(_) => SocketAddr::from((std::net::Ipv6Addr::UNSPECIFIED, 0)),
    };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.set_broadcast(true)?;
    let destination = SocketAddr::new(options.target, options.port);

    let mut sent = 0u32;
    let mut last_error = None;
    for _ in 0..options.retries.max(1) {
        match socket.send_to(DISCOVERY_MAGIC.as_bytes(), destination).await {
            Ok(_) => sent = sent.saturating_add(1),
            Err(err) => {
                debug!("Discovery probe to {} failed: {}", destination, err);
                last_error = Some(err);
            }
        }
    }
    if sent == 0
        && let Some(err) = last_error
    {
        return Err(err.into());
    }

    let deadline = Instant::now()
        .checked_add(options.timeout)
        .unwrap_or_else(Instant::now);
    let mut found: BTreeMap<String, DiscoveryReply> = BTreeMap::new();
    let mut buffer = vec![0u8; MAX_DATAGRAM_BYTES];
    loop {
        let received = tokio::time::timeout_at(deadline, socket.recv_from(&mut buffer)).await;
        let (bytes, peer) = match received {
            Err(_elapsed) => break,
            Ok(Err(err)) => {
                debug!("Discovery receive failed: {}", err);
                continue;
            }
            Ok(Ok(received)) => received,
        };
        let Some(payload) = buffer.get(..bytes) else {
            continue;
        };
        match serde_json::from_slice::<DiscoveryReply>(payload) {
            Ok(reply) => {
                debug!("Discovered agent {} from {}", reply.base, peer);
                found.entry(reply.base.clone()).or_insert(reply);
            }
            Err(err) => debug!("Ignoring malformed discovery reply from {}: {}", peer, err),
        }
    }
    Ok(found.into_values().collect())
}
