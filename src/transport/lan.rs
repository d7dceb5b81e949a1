//! Local-network transport: UDP broadcast beacons for discovery, TCP for
//! links.
//!
//! Beacon datagrams are a single ASCII line:
//!
//! ```text
//! VBL1 <signature> <tcp port> <text-safe fingerprint>
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use super::{
    AdvertiseHandle, Capability, Proximity, Sighting, SightingStream,
    TransportAdapter, TransportAddress, TransportKind,
};
use crate::errors::{Result, VibeError};
use crate::id::NodeSignature;
use crate::link::{FramedLink, PeerLink};

pub const BEACON_TAG: &str = "VBL1";
const MAX_BEACON_LEN: usize = 512;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LanConfig {
    pub bind_addr: IpAddr,
    /// UDP port beacons are sent to and received on.
    pub beacon_port: u16,
    pub broadcast_addr: IpAddr,
    /// TCP port for incoming links, `0` picks a free one.
    pub link_port: u16,
    pub beacon_interval_ms: u64,
}

impl Default for LanConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            beacon_port: 47_474,
            broadcast_addr: IpAddr::V4(Ipv4Addr::BROADCAST),
            link_port: 0,
            beacon_interval_ms: 1_000,
        }
    }
}

impl LanConfig {
    pub fn beacon_interval(&self) -> Duration {
        Duration::from_millis(self.beacon_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.beacon_port == 0 {
            return Err(VibeError::Config(
                "lan.beacon_port must be set".to_owned(),
            ));
        }
        if self.beacon_interval_ms == 0 {
            return Err(VibeError::Config(
                "lan.beacon_interval_ms must be positive".to_owned(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Beacon {
    pub signature: NodeSignature,
    pub link_port: u16,
    pub payload: Vec<u8>,
}

impl Beacon {
    pub fn encode(&self) -> Vec<u8> {
        let mut line = format!(
            "{} {} {} ",
            BEACON_TAG, self.signature, self.link_port
        )
        .into_bytes();
        line.extend_from_slice(&self.payload);
        line
    }

    pub fn parse(datagram: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(datagram).map_err(|_| {
            VibeError::MalformedPayload("beacon is not utf-8".to_owned())
        })?;
        let mut parts = text.trim_end().splitn(4, ' ');
        let tag = parts.next().unwrap_or_default();
        if tag != BEACON_TAG {
            return Err(VibeError::MalformedPayload(format!(
                "unknown beacon tag {:?}",
                tag
            )));
        }
        let signature: NodeSignature =
            parts.next().unwrap_or_default().parse()?;
        let link_port = parts
            .next()
            .unwrap_or_default()
            .parse::<u16>()
            .map_err(|e| {
                VibeError::MalformedPayload(format!("beacon port: {}", e))
            })?;
        let payload = parts.next().unwrap_or_default().as_bytes().to_vec();
        Ok(Beacon {
            signature,
            link_port,
            payload,
        })
    }
}

pub struct LanTransport {
    config: LanConfig,
    listener: Arc<TcpListener>,
    link_port: u16,
}

impl LanTransport {
    /// Bind the link listener. Beacon sockets are opened lazily.
    pub async fn bind(config: LanConfig) -> Result<Self> {
        config.validate()?;
        let listener =
            TcpListener::bind(SocketAddr::new(config.bind_addr, config.link_port))
                .await
                .map_err(bind_error)?;
        let link_port = listener.local_addr()?.port();
        log::info!("LAN links listening on port {}", link_port);
        Ok(Self {
            config,
            listener: Arc::new(listener),
            link_port,
        })
    }

    pub fn link_port(&self) -> u16 {
        self.link_port
    }
}

fn bind_error(e: std::io::Error) -> VibeError {
    match e.kind() {
        std::io::ErrorKind::PermissionDenied => {
            VibeError::PermissionDenied(TransportKind::Lan.to_string())
        }
        _ => VibeError::Io(e),
    }
}

#[async_trait]
impl TransportAdapter for LanTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Lan
    }

    async fn probe(&self) -> Capability {
        match UdpSocket::bind(SocketAddr::new(self.config.bind_addr, 0)).await {
            Ok(socket) => match socket.set_broadcast(true) {
                Ok(()) => Capability::Available,
                Err(e) => Capability::Failed(e.to_string()),
            },
            Err(e) => Capability::from_error(&bind_error(e)),
        }
    }

    async fn advertise(
        &self,
        signature: &NodeSignature,
        payload: Vec<u8>,
        ttl: Duration,
    ) -> Result<AdvertiseHandle> {
        let socket = UdpSocket::bind(SocketAddr::new(self.config.bind_addr, 0))
            .await
            .map_err(bind_error)?;
        socket.set_broadcast(true)?;
        let target =
            SocketAddr::new(self.config.broadcast_addr, self.config.beacon_port);
        let beacon = Beacon {
            signature: signature.clone(),
            link_port: self.link_port,
            payload,
        }
        .encode();
        let interval = self.config.beacon_interval();

        let task = tokio::spawn(async move {
            let started = tokio::time::Instant::now();
            let mut ticker = tokio::time::interval(interval);
            while started.elapsed() < ttl {
                ticker.tick().await;
                if let Err(e) = socket.send_to(&beacon, target).await {
                    log::warn!("LAN beacon to {} failed: {}", target, e);
                }
            }
            log::debug!("LAN beacon reached its ttl");
        });
        Ok(AdvertiseHandle::new(move || task.abort()))
    }

    fn scan(&self) -> SightingStream {
        let bind = SocketAddr::new(self.config.bind_addr, self.config.beacon_port);
        Box::pin(async_stream::stream! {
            let socket = match UdpSocket::bind(bind).await {
                Ok(socket) => socket,
                Err(e) => {
                    yield Err(match bind_error(e) {
                        VibeError::Io(e) => VibeError::Transient(format!(
                            "beacon socket on {}: {}",
                            bind, e
                        )),
                        fatal => fatal,
                    });
                    return;
                }
            };
            let mut buf = [0u8; MAX_BEACON_LEN];
            loop {
                let (len, from) = match socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(e) => {
                        yield Err(VibeError::Transient(e.to_string()));
                        continue;
                    }
                };
                let beacon = match Beacon::parse(&buf[..len]) {
                    Ok(beacon) => beacon,
                    Err(e) => {
                        log::debug!("Ignoring datagram from {}: {}", from, e);
                        continue;
                    }
                };
                yield Ok(Sighting {
                    signature: beacon.signature,
                    payload: beacon.payload,
                    proximity: Proximity::Unknown,
                    address: TransportAddress::Socket(SocketAddr::new(
                        from.ip(),
                        beacon.link_port,
                    )),
                    seen_at: Utc::now(),
                });
            }
        })
    }

    async fn connect(
        &self,
        address: &TransportAddress,
    ) -> Result<Box<dyn PeerLink>> {
        let addr = match address {
            TransportAddress::Socket(addr) => *addr,
            other => {
                return Err(VibeError::Transient(format!(
                    "LAN transport cannot reach {}",
                    other
                )))
            }
        };
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| VibeError::Transient(format!("{}: {}", addr, e)))?;
        stream.set_nodelay(true)?;
        Ok(Box::new(FramedLink::new(stream, address.clone())))
    }

    async fn accept(&self) -> Result<Box<dyn PeerLink>> {
        let (stream, from) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        log::debug!("Accepted LAN link from {}", from);
        Ok(Box::new(FramedLink::new(stream, TransportAddress::Socket(from))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::TerminationReason;
    use crate::exchange::ExchangeMessage;

    #[test]
    fn beacon_line_round_trips() {
        let beacon = Beacon {
            signature: "0123456789abcdef".parse().unwrap(),
            link_port: 4242,
            payload: b"VkIB_AAA".to_vec(),
        };
        let bytes = beacon.encode();
        assert!(bytes.starts_with(b"VBL1 0123456789abcdef 4242 "));
        assert_eq!(Beacon::parse(&bytes).unwrap(), beacon);
    }

    #[test]
    fn beacon_parse_rejects_foreign_datagrams() {
        assert!(Beacon::parse(b"HELLO world").is_err());
        assert!(Beacon::parse(b"VBL1 nothex 1 x").is_err());
        assert!(Beacon::parse(b"VBL1 0123456789abcdef port x").is_err());
        assert!(Beacon::parse(&[0xff, 0xfe]).is_err());
    }

    #[tokio::test]
    async fn links_connect_over_loopback() {
        let config = LanConfig {
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..LanConfig::default()
        };
        let transport = LanTransport::bind(config).await.unwrap();
        let addr = TransportAddress::Socket(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            transport.link_port(),
        ));

        let (outbound, inbound) =
            tokio::join!(transport.connect(&addr), transport.accept());
        let (mut outbound, mut inbound) = (outbound.unwrap(), inbound.unwrap());
        let msg = ExchangeMessage::Terminate {
            reason: TerminationReason::Shutdown,
        };
        outbound.send(&msg).await.unwrap();
        assert_eq!(inbound.recv().await.unwrap(), msg);
    }
}
