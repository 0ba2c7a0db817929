use std::net::{IpAddr, Ipv4Addr, UdpSocket};

use tracing::debug;

/// Address used only to pick the outbound interface; nothing is sent.
const ROUTE_PROBE_ADDR: &str = "8.8.8.8:80";

/// The management IP other hosts should use to reach this agent.
///
/// An explicit override wins. Otherwise the address of the interface that
/// routes to the outside world is used, falling back to loopback.
#[must_use]
pub fn advertise_ip(override_ip: Option<&str>, listen_host: &str) -> String {
    if let Some(ip) = override_ip.map(str::trim).filter(|ip| !ip.is_empty()) {
        return ip.to_owned();
    }
    if let Ok(addr) = listen_host.parse::<IpAddr>()
        && !addr.is_unspecified()
    {
        return addr.to_string();
    }
    detect_outbound_ip().map_or_else(|| Ipv4Addr::LOCALHOST.to_string(), |ip| ip.to_string())
}

fn detect_outbound_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    if let Err(err) = socket.connect(ROUTE_PROBE_ADDR) {
        debug!("No default route for advertise IP detection: {}", err);
        return None;
    }
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}

/// Display name announced over discovery.
#[must_use]
pub fn host_name() -> String {
    ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .map(|value| value.trim().to_owned())
        .find(|value| !value.is_empty())
        .or_else(read_etc_hostname)
        .unwrap_or_else(|| "iperf-mesh-agent".to_owned())
}

fn read_etc_hostname() -> Option<String> {
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}
