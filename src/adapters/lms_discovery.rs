//! LMS server discovery via UDP broadcast
//!
//! One probe packet goes to 255.255.255.255:3483; every server on the segment
//! answers with a TLV blob. Reference:
//! https://github.com/LMS-Community/slimserver/blob/public/9.0/Slim/Networking/Discovery.pm
//!
//! ```bash
//! echo -ne "eNAME\x00JSON\x00UUID\x00VERS\x00" | socat -t3 - udp-datagram:255.255.255.255:3483,broadcast | od -c
//! ```

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

/// Squeezebox discovery port
pub const DISCOVERY_PORT: u16 = 3483;

/// JSON-RPC port assumed when a reply carries no JSON tag
pub const DEFAULT_JSON_PORT: u16 = 9000;

/// Pause after a failed receive before listening again
const RECV_ERROR_PAUSE: Duration = Duration::from_millis(20);

/// Probe: marker byte, then each requested tag with a zero length
const PROBE: &[u8] = b"eNAME\x00JSON\x00UUID\x00VERS\x00";

/// A server that answered the probe
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiscoveredServer {
    /// Source address of the reply
    pub host: String,
    /// JSON-RPC port (JSON tag)
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Iterator over `tag(4) len(1) value(len)` records following the marker byte
struct TlvRecords<'a> {
    data: &'a [u8],
}

impl<'a> Iterator for TlvRecords<'a> {
    type Item = (&'a [u8], &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.len() < 5 {
            return None;
        }
        let (tag, rest) = self.data.split_at(4);
        let len = rest[0] as usize;
        let rest = &rest[1..];
        if rest.len() < len {
            debug!(
                "discovery: truncated {} value, need {} have {}",
                String::from_utf8_lossy(tag),
                len,
                rest.len()
            );
            self.data = &[];
            return None;
        }
        let (value, remaining) = rest.split_at(len);
        self.data = remaining;
        Some((tag, value))
    }
}

/// Decode one discovery reply. Replies start with `E` (some servers echo `e`).
fn parse_reply(data: &[u8], source: &SocketAddr) -> Option<DiscoveredServer> {
    let (&marker, body) = data.split_first()?;
    if marker != b'E' && marker != b'e' {
        debug!("discovery: ignoring packet with marker {:#04x}", marker);
        return None;
    }

    let mut server = DiscoveredServer {
        host: source.ip().to_string(),
        port: DEFAULT_JSON_PORT,
        name: None,
        uuid: None,
        version: None,
    };

    for (tag, value) in (TlvRecords { data: body }) {
        let text = || {
            let s = String::from_utf8_lossy(value).trim().to_string();
            (!s.is_empty()).then_some(s)
        };
        match tag {
            b"JSON" => {
                if let Some(port) = text().and_then(|s| s.parse::<u16>().ok()) {
                    server.port = port;
                }
            }
            b"NAME" => server.name = text(),
            b"UUID" => server.uuid = text(),
            b"VERS" => server.version = text(),
            _ => {}
        }
    }

    Some(server)
}

/// Broadcast a probe on the local network and collect replies for `wait`.
///
/// Zero replies is an empty list, not an error. Order is arrival order and
/// each source host appears once.
pub async fn scan(wait: Duration) -> Result<Vec<DiscoveredServer>> {
    let target = SocketAddr::from((Ipv4Addr::BROADCAST, DISCOVERY_PORT));
    scan_target(target, wait).await
}

/// Same as [`scan`] but probes an explicit address (unicast or broadcast)
pub async fn scan_target(target: SocketAddr, wait: Duration) -> Result<Vec<DiscoveredServer>> {
    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .context("discovery: bind failed")?;
    socket.set_broadcast(true)?;
    socket
        .send_to(PROBE, target)
        .await
        .with_context(|| format!("discovery: probe to {} failed", target))?;
    debug!("discovery: probe sent to {}", target);

    let mut found: Vec<DiscoveredServer> = Vec::new();
    let mut buf = [0u8; 1500];
    let deadline = Instant::now() + wait;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }

        match timeout(remaining, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, addr))) => {
                debug!("discovery: {} bytes from {}", len, addr);
                let Some(server) = parse_reply(&buf[..len], &addr) else {
                    continue;
                };
                if found.iter().any(|s| s.host == server.host) {
                    continue;
                }
                found.push(server);
            }
            // e.g. ICMP port unreachable from a host without a server
            Ok(Err(e)) => {
                warn!("discovery: receive error: {}", e);
                tokio::time::sleep(remaining.min(RECV_ERROR_PAUSE)).await;
            }
            Err(_) => break,
        }
    }

    info!("discovery: {} server(s) answered", found.len());
    Ok(found)
}
