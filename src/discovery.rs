use crate::tunnel;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Discovery asks for every device by default.
pub const WILDCARD_DEVICE_ID: &str = "*";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not bind a local UDP socket for discovery")]
    Bind(#[source] std::io::Error),
    #[error("could not enable broadcast on the discovery socket")]
    Broadcast(#[source] std::io::Error),
    #[error("could not send a discovery probe to {1}")]
    Send(#[source] std::io::Error, SocketAddr),
    #[error("could not read discovery replies")]
    Receive(#[source] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub device_id: String,
    pub port: u16,
    /// How long to collect replies before giving up.
    pub timeout: Duration,
    /// How many probes to send, `retry_interval` apart.
    pub retries: u32,
    pub retry_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            device_id: WILDCARD_DEVICE_ID.to_owned(),
            port: tunnel::TUNNEL_PORT,
            timeout: Duration::from_secs(5),
            retries: 3,
            retry_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct DiscoveredDevice {
    pub device_id: String,
    pub ip: IpAddr,
    pub port: u16,
}

/// Broadcasts to the limited broadcast address and collects every unique
/// reply until the window closes.
pub async fn discover(config: &Config) -> Result<Vec<DiscoveredDevice>, Error> {
    discover_with(config, |_| ()).await
}

/// Like [`discover`], but `on_device` observes each hit as it arrives so
/// callers can stream results.
pub async fn discover_with(
    config: &Config,
    on_device: impl FnMut(&DiscoveredDevice),
) -> Result<Vec<DiscoveredDevice>, Error> {
    let socket = bind().await?;
    socket.set_broadcast(true).map_err(Error::Broadcast)?;
    let target = SocketAddr::from((Ipv4Addr::BROADCAST, config.port));
    collect(config, &socket, target, false, on_device).await
}

/// Sends the discovery probe to one known address instead of the
/// broadcast; for segments where broadcast is filtered. Resolves with the
/// first valid reply, or `None` once the window closes.
pub async fn probe(config: &Config, ip: IpAddr) -> Result<Option<DiscoveredDevice>, Error> {
    let socket = bind().await?;
    let target = SocketAddr::from((ip, config.port));
    let mut found = collect(config, &socket, target, true, |_| ()).await?;
    Ok(found.pop())
}

async fn bind() -> Result<UdpSocket, Error> {
    UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .await
        .map_err(Error::Bind)
}

async fn collect(
    config: &Config,
    socket: &UdpSocket,
    target: SocketAddr,
    stop_at_first: bool,
    mut on_device: impl FnMut(&DiscoveredDevice),
) -> Result<Vec<DiscoveredDevice>, Error> {
    let request = tunnel::build_discovery_request(&config.device_id);
    let deadline = Instant::now() + config.timeout;
    let mut next_probe = Instant::now();
    let mut probes_left = config.retries;
    let mut buffer = [0u8; 2048];
    let mut found = Vec::new();
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(next_probe), if probes_left > 0 => {
                trace!(message = "sending discovery probe", %target);
                socket
                    .send_to(&request, target)
                    .await
                    .map_err(|e| Error::Send(e, target))?;
                probes_left -= 1;
                next_probe += config.retry_interval;
            }
            received = socket.recv_from(&mut buffer) => {
                let (len, peer) = received.map_err(Error::Receive)?;
                let Some(device_id) = tunnel::parse_discovery_response(&buffer[..len]) else {
                    trace!(message = "ignoring stray datagram", %peer, len);
                    continue;
                };
                let device = DiscoveredDevice {
                    device_id,
                    ip: peer.ip(),
                    port: peer.port(),
                };
                if found.contains(&device) {
                    continue;
                }
                debug!(message = "device answered", id = %device.device_id, %peer);
                on_device(&device);
                found.push(device);
                if stop_at_first {
                    return Ok(found);
                }
            }
            _ = tokio::time::sleep_until(deadline) => return Ok(found),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeController;

    fn test_config(fake: &FakeController) -> Config {
        Config {
            port: fake.addr.port(),
            timeout: Duration::from_millis(300),
            retries: 2,
            retry_interval: Duration::from_millis(50),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn probe_finds_a_device_by_address() {
        let fake = FakeController::spawn("GEN123", 1).await;
        let found = probe(&test_config(&fake), IpAddr::V4(Ipv4Addr::LOCALHOST))
            .await
            .unwrap()
            .expect("the fake controller should answer the probe");
        assert_eq!(found.device_id, "GEN123");
        assert_eq!(found.ip, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(found.port, fake.addr.port());
    }

    #[tokio::test]
    async fn probe_returns_none_when_nothing_answers() {
        let fake = FakeController::spawn("GEN123", 1).await;
        fake.set_silent(true);
        let found = probe(&test_config(&fake), IpAddr::V4(Ipv4Addr::LOCALHOST))
            .await
            .unwrap();
        assert_eq!(found, None);
    }

    #[tokio::test]
    async fn repeated_replies_are_deduplicated() {
        let fake = FakeController::spawn("GEN123", 1).await;
        // Three probes at 50 ms spacing all get answered; the device must
        // still appear once.
        let config = test_config(&fake);
        let mut streamed = Vec::new();
        let found = {
            let streamed = &mut streamed;
            discover_to(&config, fake.addr, move |device| {
                streamed.push(device.clone())
            })
            .await
            .unwrap()
        };
        assert_eq!(found.len(), 1);
        assert_eq!(streamed.len(), 1);
        assert_eq!(found[0].device_id, "GEN123");
    }

    /// Unicast variant of `discover_with` so the dedup path is testable
    /// without broadcast privileges.
    async fn discover_to(
        config: &Config,
        target: SocketAddr,
        on_device: impl FnMut(&DiscoveredDevice),
    ) -> Result<Vec<DiscoveredDevice>, Error> {
        let socket = bind().await?;
        collect(config, &socket, target, false, on_device).await
    }
}
