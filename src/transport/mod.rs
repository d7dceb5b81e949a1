//! Proximity transports.
//!
//! Each transport kind implements [`TransportAdapter`]. The engine probes the
//! configured kinds once at startup and replaces every kind that cannot be
//! used with an [`UnsupportedTransport`] carrying the reason.

use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::codec::WireFormat;
use crate::errors::{Result, VibeError};
use crate::id::NodeSignature;
use crate::link::PeerLink;

pub mod lan;
pub mod memory;
pub mod unsupported;

pub use lan::{LanConfig, LanTransport};
pub use memory::{Ether, MemoryTransport};
pub use unsupported::UnsupportedTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Ble,
    Lan,
    Memory,
    Unsupported,
}

impl TransportKind {
    /// Format of the fingerprint carried in this transport's advertisements.
    pub fn wire_format(&self) -> WireFormat {
        match self {
            TransportKind::Lan => WireFormat::TextSafe,
            TransportKind::Ble
            | TransportKind::Memory
            | TransportKind::Unsupported => WireFormat::Compact,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Ble => "ble",
            TransportKind::Lan => "lan",
            TransportKind::Memory => "memory",
            TransportKind::Unsupported => "unsupported",
        }
    }
}

impl Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum Capability {
    Available,
    Unsupported,
    PermissionDenied,
    Failed(String),
}

impl Capability {
    pub fn is_available(&self) -> bool {
        matches!(self, Capability::Available)
    }

    /// The error a transport in this state reports for every operation.
    pub fn to_error(&self, kind: TransportKind) -> VibeError {
        match self {
            Capability::PermissionDenied => {
                VibeError::PermissionDenied(kind.to_string())
            }
            Capability::Failed(reason) => VibeError::TransportUnsupported(
                format!("{}: {}", kind, reason),
            ),
            Capability::Available | Capability::Unsupported => {
                VibeError::TransportUnsupported(kind.to_string())
            }
        }
    }

    pub fn from_error(error: &VibeError) -> Capability {
        match error {
            VibeError::PermissionDenied(_) => Capability::PermissionDenied,
            VibeError::TransportUnsupported(_) => Capability::Unsupported,
            other => Capability::Failed(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceBucket {
    Immediate,
    Near,
    Far,
}

/// How close a sighted node is, as far as the transport can tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Proximity {
    /// Received signal strength in dBm.
    SignalStrength(i16),
    Distance(DistanceBucket),
    Unknown,
}

impl Proximity {
    /// Closeness on a dBm-like scale, higher is closer. Distance buckets map
    /// to typical signal strengths so that both kinds compare.
    pub fn rank(&self) -> i32 {
        match self {
            Proximity::SignalStrength(dbm) => *dbm as i32,
            Proximity::Distance(DistanceBucket::Immediate) => -45,
            Proximity::Distance(DistanceBucket::Near) => -65,
            Proximity::Distance(DistanceBucket::Far) => -85,
            Proximity::Unknown => i32::MIN,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportAddress {
    /// Station of the in-memory ether.
    Memory(u64),
    Socket(SocketAddr),
    None,
}

impl Display for TransportAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportAddress::Memory(station) => write!(f, "mem:{}", station),
            TransportAddress::Socket(addr) => write!(f, "{}", addr),
            TransportAddress::None => write!(f, "-"),
        }
    }
}

/// One received advertisement.
#[derive(Debug, Clone, PartialEq)]
pub struct Sighting {
    pub signature: NodeSignature,
    pub payload: Vec<u8>,
    pub proximity: Proximity,
    pub address: TransportAddress,
    pub seen_at: DateTime<Utc>,
}

/// Keeps an advertisement alive. Advertising stops when it is dropped.
pub struct AdvertiseHandle {
    on_drop: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl AdvertiseHandle {
    pub fn new(on_drop: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            on_drop: Some(Box::new(on_drop)),
        }
    }
}

impl Drop for AdvertiseHandle {
    fn drop(&mut self) {
        if let Some(on_drop) = self.on_drop.take() {
            on_drop();
        }
    }
}

impl std::fmt::Debug for AdvertiseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdvertiseHandle")
            .field("active", &self.on_drop.is_some())
            .finish()
    }
}

/// Infinite stream of sightings. It may end early on fatal errors and can be
/// restarted by calling [`TransportAdapter::scan`] again.
pub type SightingStream = BoxStream<'static, Result<Sighting>>;

#[async_trait]
pub trait TransportAdapter: Send + Sync {
    fn kind(&self) -> TransportKind;

    async fn probe(&self) -> Capability;

    /// Start advertising `payload` under `signature`. Replaces an earlier
    /// advertisement of this adapter.
    async fn advertise(
        &self,
        signature: &NodeSignature,
        payload: Vec<u8>,
        ttl: Duration,
    ) -> Result<AdvertiseHandle>;

    fn scan(&self) -> SightingStream;

    async fn connect(
        &self,
        address: &TransportAddress,
    ) -> Result<Box<dyn PeerLink>>;

    async fn accept(&self) -> Result<Box<dyn PeerLink>>;
}

/// Probe every candidate and swap the unusable ones for stubs.
pub async fn select_transports(
    candidates: Vec<Arc<dyn TransportAdapter>>,
) -> Vec<(Arc<dyn TransportAdapter>, Capability)> {
    let mut selected = Vec::with_capacity(candidates.len());
    for adapter in candidates {
        let kind = adapter.kind();
        let capability = adapter.probe().await;
        if capability.is_available() {
            log::info!("Transport {} available", kind);
            selected.push((adapter, capability));
        } else {
            log::warn!("Transport {} unusable: {:?}", kind, capability);
            let stub: Arc<dyn TransportAdapter> = Arc::new(
                UnsupportedTransport::new(kind, capability.clone()),
            );
            selected.push((stub, capability));
        }
    }
    selected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proximity_ranks_closer_higher() {
        assert!(Proximity::SignalStrength(-40).rank()
            > Proximity::SignalStrength(-70).rank());
        assert!(Proximity::Distance(DistanceBucket::Immediate).rank()
            > Proximity::Distance(DistanceBucket::Far).rank());
        assert!(Proximity::Distance(DistanceBucket::Far).rank()
            > Proximity::Unknown.rank());
    }

    #[test]
    fn wire_format_per_kind() {
        assert_eq!(TransportKind::Ble.wire_format(), WireFormat::Compact);
        assert_eq!(TransportKind::Memory.wire_format(), WireFormat::Compact);
        assert_eq!(TransportKind::Lan.wire_format(), WireFormat::TextSafe);
    }

    #[test]
    fn handle_runs_callback_once_on_drop() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let handle = AdvertiseHandle::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        drop(handle);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn capability_error_mapping() {
        let err = Capability::PermissionDenied.to_error(TransportKind::Ble);
        assert!(err.is_fatal_for_adapter());
        assert_eq!(Capability::from_error(&err), Capability::PermissionDenied);
    }

    #[tokio::test]
    async fn unavailable_transports_become_stubs() {
        let ether = Ether::new();
        let broken = MemoryTransport::new(&ether)
            .with_capability(Capability::PermissionDenied);
        let selected = select_transports(vec![
            Arc::new(MemoryTransport::new(&ether)),
            Arc::new(broken),
        ])
        .await;
        assert!(selected[0].1.is_available());
        assert_eq!(selected[1].1, Capability::PermissionDenied);
        assert!(selected[1].0.connect(&TransportAddress::None).await.is_err());
    }
}
