//! Continuous scanning of every usable transport and the candidate table
//! built from it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::codec;
use crate::config::{
    ensure_at_most, saturating_add, window_ms, window_secs, MAX_WINDOW_SECS,
};
use crate::errors::{Result, VibeError};
use crate::fingerprint::VibeFingerprint;
use crate::id::NodeSignature;
use crate::transport::{
    Capability, Proximity, Sighting, TransportAdapter, TransportAddress,
    TransportKind,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Longest wait for a single scan step.
    pub scan_tick_timeout_ms: u64,
    /// Pause before a scan stream that ended is started again.
    pub restart_backoff_ms: u64,
    /// Candidates not sighted for this long are evicted.
    pub silence_window_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            scan_tick_timeout_ms: 2_000,
            restart_backoff_ms: 1_000,
            silence_window_secs: 30,
        }
    }
}

impl DiscoveryConfig {
    pub fn scan_tick_timeout(&self) -> Duration {
        window_ms(self.scan_tick_timeout_ms)
    }

    pub fn restart_backoff(&self) -> Duration {
        window_ms(self.restart_backoff_ms)
    }

    pub fn silence_window(&self) -> chrono::Duration {
        window_secs(self.silence_window_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.scan_tick_timeout_ms == 0 || self.silence_window_secs == 0 {
            return Err(VibeError::Config(
                "discovery timings must be positive".to_owned(),
            ));
        }
        ensure_at_most(
            "discovery.silence_window_secs",
            self.silence_window_secs,
            MAX_WINDOW_SECS,
        )?;
        ensure_at_most(
            "discovery.scan_tick_timeout_ms",
            self.scan_tick_timeout_ms,
            MAX_WINDOW_SECS * 1_000,
        )?;
        ensure_at_most(
            "discovery.restart_backoff_ms",
            self.restart_backoff_ms,
            MAX_WINDOW_SECS * 1_000,
        )
    }
}

/// A nearby node, as last sighted.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeDescriptor {
    pub signature: NodeSignature,
    pub transport: TransportKind,
    pub address: TransportAddress,
    pub fingerprint: VibeFingerprint,
    pub proximity: Proximity,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiscoveryStats {
    pub sightings: u64,
    pub accepted: u64,
    pub own_sightings: u64,
    pub malformed: u64,
    pub expired: u64,
    pub transient_errors: u64,
    pub restarts: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    New,
    Refreshed,
    OwnSignature,
    Malformed,
    Expired,
}

struct Running {
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

struct DiscoveryInner {
    config: DiscoveryConfig,
    adapters: Vec<Arc<dyn TransportAdapter>>,
    capabilities: RwLock<HashMap<TransportKind, Capability>>,
    own: RwLock<Vec<NodeSignature>>,
    table: Mutex<HashMap<NodeSignature, NodeDescriptor>>,
    stats: Mutex<DiscoveryStats>,
}

/// Owns one scan task per usable transport and the table of candidates
/// they feed.
#[derive(Clone)]
pub struct DiscoveryManager {
    inner: Arc<DiscoveryInner>,
    running: Arc<Mutex<Option<Running>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl DiscoveryManager {
    pub fn new(
        config: DiscoveryConfig,
        transports: Vec<(Arc<dyn TransportAdapter>, Capability)>,
    ) -> Self {
        let capabilities = transports
            .iter()
            .map(|(adapter, capability)| (adapter.kind(), capability.clone()))
            .collect();
        let adapters = transports
            .into_iter()
            .filter(|(_, capability)| capability.is_available())
            .map(|(adapter, _)| adapter)
            .collect();
        Self {
            inner: Arc::new(DiscoveryInner {
                config,
                adapters,
                capabilities: RwLock::new(capabilities),
                own: RwLock::new(Vec::new()),
                table: Mutex::new(HashMap::new()),
                stats: Mutex::new(DiscoveryStats::default()),
            }),
            running: Arc::new(Mutex::new(None)),
        }
    }

    /// Register the signature this node currently advertises under.
    /// The previous one stays recognised while its adverts fade out.
    pub fn set_local_signature(&self, signature: NodeSignature) {
        let mut own = self
            .inner
            .own
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if own.last() == Some(&signature) {
            return;
        }
        own.push(signature);
        if own.len() > 2 {
            own.remove(0);
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.running).is_some()
    }

    /// Spawn the scan tasks. Calling it while running does nothing.
    pub fn start(&self) {
        let mut running = lock(&self.running);
        if running.is_some() {
            return;
        }
        let (stop, stop_rx) = watch::channel(false);
        let tasks = self
            .inner
            .adapters
            .iter()
            .map(|adapter| {
                let inner = self.inner.clone();
                let adapter = adapter.clone();
                let stop_rx = stop_rx.clone();
                tokio::spawn(async move {
                    scan_loop(inner, adapter, stop_rx).await
                })
            })
            .collect();
        log::info!(
            "Discovery started on {} transports",
            self.inner.adapters.len()
        );
        *running = Some(Running { stop, tasks });
    }

    /// Stop every scan task and forget all candidates.
    pub async fn stop(&self) {
        let running = lock(&self.running).take();
        if let Some(running) = running {
            let _ = running.stop.send(true);
            for task in running.tasks {
                if let Err(e) = task.await {
                    log::warn!("Scan task ended abnormally: {}", e);
                }
            }
            log::info!("Discovery stopped");
        }
        lock(&self.inner.table).clear();
    }

    /// Feed one sighting into the table.
    pub fn ingest(
        &self,
        kind: TransportKind,
        sighting: Sighting,
        now: DateTime<Utc>,
    ) -> IngestOutcome {
        self.inner.ingest(kind, sighting, now)
    }

    /// Live candidates, closest first.
    pub fn candidates(&self, now: DateTime<Utc>) -> Vec<NodeDescriptor> {
        let silence = self.inner.config.silence_window();
        let mut table = lock(&self.inner.table);
        table.retain(|signature, node| {
            let keep = saturating_add(node.last_seen, silence) >= now
                && !node.fingerprint.is_expired(now);
            if !keep {
                log::debug!("Evicting candidate {}", signature);
            }
            keep
        });

        let mut candidates: Vec<NodeDescriptor> = table.values().cloned().collect();
        candidates.sort_by(|a, b| {
            b.proximity
                .rank()
                .cmp(&a.proximity.rank())
                .then(b.last_seen.cmp(&a.last_seen))
                .then(a.signature.cmp(&b.signature))
        });
        candidates
    }

    pub fn candidate(&self, signature: &NodeSignature) -> Option<NodeDescriptor> {
        lock(&self.inner.table).get(signature).cloned()
    }

    pub fn capability(&self, kind: TransportKind) -> Option<Capability> {
        self.inner
            .capabilities
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&kind)
            .cloned()
    }

    pub fn capabilities(&self) -> HashMap<TransportKind, Capability> {
        self.inner
            .capabilities
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn stats(&self) -> DiscoveryStats {
        *lock(&self.inner.stats)
    }
}

impl DiscoveryInner {
    fn ingest(
        &self,
        kind: TransportKind,
        sighting: Sighting,
        now: DateTime<Utc>,
    ) -> IngestOutcome {
        let outcome = self.classify(kind, sighting, now);
        let mut stats = lock(&self.stats);
        stats.sightings += 1;
        match outcome {
            IngestOutcome::New | IngestOutcome::Refreshed => stats.accepted += 1,
            IngestOutcome::OwnSignature => stats.own_sightings += 1,
            IngestOutcome::Malformed => stats.malformed += 1,
            IngestOutcome::Expired => stats.expired += 1,
        }
        outcome
    }

    fn classify(
        &self,
        kind: TransportKind,
        sighting: Sighting,
        now: DateTime<Utc>,
    ) -> IngestOutcome {
        let own = self
            .own
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(&sighting.signature);
        if own {
            return IngestOutcome::OwnSignature;
        }

        let fingerprint =
            match codec::decode(&sighting.payload, kind.wire_format(), now) {
                Ok(fingerprint) => fingerprint,
                Err(VibeError::Expired(at)) => {
                    log::debug!(
                        "Dropping expired advert of {} (expired {})",
                        sighting.signature,
                        at
                    );
                    return IngestOutcome::Expired;
                }
                Err(e) => {
                    log::debug!(
                        "Dropping malformed advert of {}: {}",
                        sighting.signature,
                        e
                    );
                    return IngestOutcome::Malformed;
                }
            };

        let mut table = lock(&self.table);
        match table.get_mut(&sighting.signature) {
            Some(node) => {
                node.transport = kind;
                node.address = sighting.address;
                node.fingerprint = fingerprint;
                node.proximity = sighting.proximity;
                node.last_seen = now;
                log::trace!("Refreshed candidate {}", sighting.signature);
                IngestOutcome::Refreshed
            }
            None => {
                log::debug!(
                    "New candidate {} via {}",
                    sighting.signature,
                    kind
                );
                table.insert(
                    sighting.signature.clone(),
                    NodeDescriptor {
                        signature: sighting.signature,
                        transport: kind,
                        address: sighting.address,
                        fingerprint,
                        proximity: sighting.proximity,
                        first_seen: now,
                        last_seen: now,
                    },
                );
                IngestOutcome::New
            }
        }
    }

    fn mark_unusable(&self, kind: TransportKind, error: &VibeError) {
        log::warn!("Transport {} is unusable: {}", kind, error);
        self.capabilities
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(kind, Capability::from_error(error));
    }
}

async fn scan_loop(
    inner: Arc<DiscoveryInner>,
    adapter: Arc<dyn TransportAdapter>,
    mut stop: watch::Receiver<bool>,
) {
    let kind = adapter.kind();
    let tick = inner.config.scan_tick_timeout();
    loop {
        let mut stream = adapter.scan();
        loop {
            let step = tokio::select! {
                _ = stop.changed() => return,
                step = tokio::time::timeout(tick, stream.next()) => step,
            };
            match step {
                // quiet tick
                Err(_) => continue,
                Ok(None) => break,
                Ok(Some(Ok(sighting))) => {
                    inner.ingest(kind, sighting, Utc::now());
                }
                Ok(Some(Err(e))) if e.is_fatal_for_adapter() => {
                    inner.mark_unusable(kind, &e);
                    return;
                }
                Ok(Some(Err(e))) => {
                    log::debug!("Transient scan error on {}: {}", kind, e);
                    lock(&inner.stats).transient_errors += 1;
                }
            }
        }

        lock(&inner.stats).restarts += 1;
        log::debug!("Scan stream of {} ended, restarting", kind);
        tokio::select! {
            _ = stop.changed() => return,
            _ = tokio::time::sleep(inner.config.restart_backoff()) => {}
        }
    }
}
