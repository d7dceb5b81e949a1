//! In-process transport used for simulation and tests.
//!
//! Every [`MemoryTransport`] attached to the same [`Ether`] is "nearby" every
//! other one. The ether does not expire advertisements; stale payloads stay
//! visible until retracted, exactly like a misbehaving radio would leave
//! them, and it is up to the receivers to reject expired fingerprints.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream;
use tokio::sync::mpsc;

use super::{
    AdvertiseHandle, Capability, Proximity, Sighting, SightingStream,
    TransportAdapter, TransportAddress, TransportKind,
};
use crate::errors::{Result, VibeError};
use crate::id::NodeSignature;
use crate::link::{FramedLink, PeerLink};

pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_millis(50);

const PIPE_CAPACITY: usize = 64 * 1024;
const ACCEPT_BACKLOG: usize = 16;

struct Advert {
    signature: NodeSignature,
    payload: Vec<u8>,
    generation: u64,
}

struct Station {
    advert: Option<Advert>,
    proximity: Proximity,
    listener: Option<mpsc::Sender<Box<dyn PeerLink>>>,
}

/// Shared medium of simulated nearby devices.
#[derive(Clone, Default)]
pub struct Ether {
    stations: Arc<Mutex<HashMap<u64, Station>>>,
    next_id: Arc<AtomicU64>,
}

impl Ether {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Station>> {
        self.stations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn register(
        &self,
        listener: Option<mpsc::Sender<Box<dyn PeerLink>>>,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.lock().insert(
            id,
            Station {
                advert: None,
                proximity: Proximity::Unknown,
                listener,
            },
        );
        id
    }

    /// Put a raw advertisement on the ether that no station backs.
    ///
    /// Returns the station id, usable with [`Ether::retract`].
    pub fn inject(
        &self,
        signature: NodeSignature,
        payload: Vec<u8>,
        proximity: Proximity,
    ) -> u64 {
        let id = self.register(None);
        let mut stations = self.lock();
        if let Some(station) = stations.get_mut(&id) {
            station.proximity = proximity;
            station.advert = Some(Advert {
                signature,
                payload,
                generation: 0,
            });
        }
        log::debug!("Injected raw advertisement on station {}", id);
        id
    }

    pub fn retract(&self, station: u64) {
        self.lock().remove(&station);
    }

    pub fn set_proximity(&self, station: u64, proximity: Proximity) {
        if let Some(station) = self.lock().get_mut(&station) {
            station.proximity = proximity;
        }
    }

    pub fn station_count(&self) -> usize {
        self.lock().len()
    }

    fn set_advert(&self, station: u64, advert: Advert) {
        if let Some(station) = self.lock().get_mut(&station) {
            station.advert = Some(advert);
        }
    }

    fn clear_advert(&self, station: u64, generation: u64) {
        if let Some(station) = self.lock().get_mut(&station) {
            if station
                .advert
                .as_ref()
                .map_or(false, |a| a.generation == generation)
            {
                station.advert = None;
            }
        }
    }

    fn visible_from(&self, observer: u64) -> Vec<Sighting> {
        let now = Utc::now();
        let mut sightings: Vec<Sighting> = self
            .lock()
            .iter()
            .filter(|(id, _)| **id != observer)
            .filter_map(|(id, station)| {
                station.advert.as_ref().map(|advert| Sighting {
                    signature: advert.signature.clone(),
                    payload: advert.payload.clone(),
                    proximity: station.proximity,
                    address: TransportAddress::Memory(*id),
                    seen_at: now,
                })
            })
            .collect();
        sightings.sort_by(|a, b| a.signature.cmp(&b.signature));
        sightings
    }

    fn listener_of(
        &self,
        station: u64,
    ) -> Option<mpsc::Sender<Box<dyn PeerLink>>> {
        self.lock()
            .get(&station)
            .and_then(|s| s.listener.clone())
    }
}

impl std::fmt::Debug for Ether {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ether")
            .field("stations", &self.station_count())
            .finish()
    }
}

/// A station on an [`Ether`].
pub struct MemoryTransport {
    ether: Ether,
    station: u64,
    capability: Capability,
    scan_interval: Duration,
    incoming: Arc<tokio::sync::Mutex<mpsc::Receiver<Box<dyn PeerLink>>>>,
    generation: AtomicU64,
    pending_failures: Arc<AtomicUsize>,
}

impl MemoryTransport {
    pub fn new(ether: &Ether) -> Self {
        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        let station = ether.register(Some(tx));
        Self {
            ether: ether.clone(),
            station,
            capability: Capability::Available,
            scan_interval: DEFAULT_SCAN_INTERVAL,
            incoming: Arc::new(tokio::sync::Mutex::new(rx)),
            generation: AtomicU64::new(0),
            pending_failures: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Pretend the device reports `capability` for this transport.
    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capability = capability;
        self
    }

    pub fn with_scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = interval;
        self
    }

    pub fn station(&self) -> u64 {
        self.station
    }

    pub fn address(&self) -> TransportAddress {
        TransportAddress::Memory(self.station)
    }

    /// How close this station appears to the others.
    pub fn set_proximity(&self, proximity: Proximity) {
        self.ether.set_proximity(self.station, proximity);
    }

    /// Make the next `count` scan steps fail with a transient error.
    pub fn inject_scan_failures(&self, count: usize) {
        self.pending_failures.fetch_add(count, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<()> {
        if self.capability.is_available() {
            Ok(())
        } else {
            Err(self.capability.to_error(TransportKind::Memory))
        }
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.ether.retract(self.station);
    }
}

#[async_trait]
impl TransportAdapter for MemoryTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Memory
    }

    async fn probe(&self) -> Capability {
        self.capability.clone()
    }

    async fn advertise(
        &self,
        signature: &NodeSignature,
        payload: Vec<u8>,
        _ttl: Duration,
    ) -> Result<AdvertiseHandle> {
        self.ensure_available()?;
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        self.ether.set_advert(
            self.station,
            Advert {
                signature: signature.clone(),
                payload,
                generation,
            },
        );
        log::trace!("Station {} advertising {}", self.station, signature);

        let ether = self.ether.clone();
        let station = self.station;
        Ok(AdvertiseHandle::new(move || {
            ether.clear_advert(station, generation)
        }))
    }

    fn scan(&self) -> SightingStream {
        if let Err(e) = self.ensure_available() {
            return Box::pin(stream::once(async move { Err(e) }));
        }

        let ether = self.ether.clone();
        let station = self.station;
        let interval = self.scan_interval;
        let failures = self.pending_failures.clone();
        Box::pin(async_stream::stream! {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let failed = failures
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                        n.checked_sub(1)
                    })
                    .is_ok();
                if failed {
                    yield Err(VibeError::Transient(
                        "simulated scan failure".to_owned(),
                    ));
                    continue;
                }
                for sighting in ether.visible_from(station) {
                    yield Ok(sighting);
                }
            }
        })
    }

    async fn connect(
        &self,
        address: &TransportAddress,
    ) -> Result<Box<dyn PeerLink>> {
        self.ensure_available()?;
        let target = match address {
            TransportAddress::Memory(station) => *station,
            other => {
                return Err(VibeError::Transient(format!(
                    "memory transport cannot reach {}",
                    other
                )))
            }
        };
        let listener = self.ether.listener_of(target).ok_or_else(|| {
            VibeError::Transient(format!("no listener at {}", address))
        })?;

        let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
        let far: Box<dyn PeerLink> =
            Box::new(FramedLink::new(far, self.address()));
        listener.send(far).await.map_err(|_| {
            VibeError::Transient(format!("{} is not accepting", address))
        })?;
        Ok(Box::new(FramedLink::new(near, address.clone())))
    }

    async fn accept(&self) -> Result<Box<dyn PeerLink>> {
        self.ensure_available()?;
        self.incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or(VibeError::LinkClosed)
    }
}
