//! The engine context: owns every component and the background tasks that
//! tie them together.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use vibe_link::{Engine, EngineConfig, InMemoryProfileStore, PersonalityProfile};
//! # async fn demo() -> vibe_link::Result<()> {
//! let config = EngineConfig::default();
//! let store = InMemoryProfileStore::with_policy(
//!     PersonalityProfile::uniform("me", 0.5),
//!     config.insights.clone(),
//! )?;
//! let adapters = vibe_link::engine::transports_from_config(&config, None).await;
//! let engine = Engine::start(config, Arc::new(store), adapters).await?;
//! for candidate in engine.candidates() {
//!     println!("{} nearby", candidate.signature);
//! }
//! engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::advertiser::Advertiser;
use crate::anonymizer::PrivacyAnonymizer;
use crate::config::EngineConfig;
use crate::connection::{Connection, Role};
use crate::cooldown::CooldownLedger;
use crate::discovery::{DiscoveryManager, DiscoveryStats, NodeDescriptor};
use crate::errors::Result;
use crate::history::{EncounterHistory, EncounterRecord};
use crate::lifecycle::{ConnectionManager, ConnectionSubscriber, LocalPresence};
use crate::profile::ProfileStore;
use crate::storage::{
    BaseStorage, FileStorage, COOLDOWNS_FILE, HISTORY_FILE, SETTINGS_FILE,
};
use crate::transport::{
    select_transports, Capability, Ether, LanTransport, MemoryTransport,
    TransportAdapter, TransportKind, UnsupportedTransport,
};

const DISCOVERY_ENABLED_KEY: &str = "discovery_enabled";
/// How often shutdown checks whether running connections are done.
const DRAIN_POLL: Duration = Duration::from_millis(20);
/// Pause after an accept error that did not disable the transport.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(500);

/// Instantiate the transports named in the config.
///
/// BLE has no implementation here and becomes a stub reporting
/// `Unsupported`. `Memory` needs an ether to join. A LAN socket that cannot
/// be bound is reported through its capability instead of failing startup.
pub async fn transports_from_config(
    config: &EngineConfig,
    ether: Option<&Ether>,
) -> Vec<Arc<dyn TransportAdapter>> {
    let mut adapters: Vec<Arc<dyn TransportAdapter>> = Vec::new();
    for kind in &config.transports {
        let adapter: Arc<dyn TransportAdapter> = match kind {
            TransportKind::Memory => match ether {
                Some(ether) => Arc::new(MemoryTransport::new(ether)),
                None => Arc::new(UnsupportedTransport::new(
                    TransportKind::Memory,
                    Capability::Failed("no ether to join".to_owned()),
                )),
            },
            TransportKind::Lan => match LanTransport::bind(config.lan.clone()).await {
                Ok(lan) => Arc::new(lan),
                Err(e) => Arc::new(UnsupportedTransport::new(
                    TransportKind::Lan,
                    Capability::from_error(&e),
                )),
            },
            TransportKind::Ble | TransportKind::Unsupported => Arc::new(
                UnsupportedTransport::new(*kind, Capability::Unsupported),
            ),
        };
        adapters.push(adapter);
    }
    adapters
}

/// Background tasks that only run while discovery is enabled.
struct Activity {
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

struct EngineInner {
    config: EngineConfig,
    adapters: Vec<Arc<dyn TransportAdapter>>,
    discovery: DiscoveryManager,
    manager: ConnectionManager,
    advertiser: Arc<Advertiser>,
    settings: Mutex<Option<FileStorage<String, bool>>>,
    activity: tokio::sync::Mutex<Option<Activity>>,
    enabled: watch::Sender<bool>,
}

/// A running proximity engine.
///
/// Cheap to clone; all clones drive the same engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Engine {
    /// Probe `candidates`, restore persisted state and, unless discovery was
    /// switched off, start scanning and advertising.
    pub async fn start(
        config: EngineConfig,
        store: Arc<dyn ProfileStore>,
        candidates: Vec<Arc<dyn TransportAdapter>>,
    ) -> Result<Self> {
        config.validate()?;
        // fail early on a profile the anonymizer cannot use
        store.current_profile()?.validate()?;

        let transports = select_transports(candidates).await;
        let adapters: Vec<Arc<dyn TransportAdapter>> = transports
            .iter()
            .filter(|(_, capability)| capability.is_available())
            .map(|(adapter, _)| adapter.clone())
            .collect();
        if adapters.is_empty() {
            log::warn!("No usable transport, the engine will stay idle");
        }

        let now = Utc::now();
        let cooldown = config.lifecycle.cooldown();
        let history_limit = config.lifecycle.history_limit;
        let (cooldowns, history, settings) = match &config.storage_dir {
            Some(dir) => (
                CooldownLedger::with_storage(cooldown, &dir.join(COOLDOWNS_FILE), now)?,
                EncounterHistory::with_storage(history_limit, &dir.join(HISTORY_FILE))?,
                Some(FileStorage::<String, bool>::load(
                    "settings",
                    &dir.join(SETTINGS_FILE),
                )?),
            ),
            None => (
                CooldownLedger::new(cooldown),
                EncounterHistory::new(history_limit),
                None,
            ),
        };
        let enabled = settings
            .as_ref()
            .and_then(|s: &FileStorage<String, bool>| {
                s.get(&DISCOVERY_ENABLED_KEY.to_owned()).copied()
            })
            .unwrap_or(config.discovery_enabled);

        let manager = ConnectionManager::new(
            config.lifecycle.clone(),
            config.analyzer.clone(),
            store.clone(),
            cooldowns,
            history,
        );
        let discovery = DiscoveryManager::new(config.discovery.clone(), transports);
        let advertiser = Arc::new(Advertiser::new(
            config.advertising.clone(),
            PrivacyAnonymizer::new(config.privacy.clone())?,
            store,
            adapters.clone(),
        ));

        let engine = Self {
            inner: Arc::new(EngineInner {
                config,
                adapters,
                discovery,
                manager,
                advertiser,
                settings: Mutex::new(settings),
                activity: tokio::sync::Mutex::new(None),
                enabled: watch::channel(false).0,
            }),
        };
        if enabled {
            engine.activate().await;
        } else {
            log::info!("Discovery disabled by persisted setting");
        }
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn is_discovery_enabled(&self) -> bool {
        *self.inner.enabled.borrow()
    }

    /// Start scanning, advertising and connecting. Remembered across
    /// restarts.
    pub async fn enable_discovery(&self) -> Result<()> {
        self.activate().await;
        self.persist_setting(true)
    }

    /// Stop scanning, advertising and connecting. Running connections keep
    /// going until they finish on their own.
    pub async fn disable_discovery(&self) -> Result<()> {
        self.deactivate().await;
        self.persist_setting(false)
    }

    async fn activate(&self) {
        let mut activity = self.inner.activity.lock().await;
        if activity.is_some() {
            return;
        }
        if self.inner.manager.is_shutting_down() {
            log::debug!("Not enabling discovery during shutdown");
            return;
        }

        let (stop, stop_rx) = watch::channel(false);
        let mut tasks = Vec::new();
        self.inner.discovery.start();
        tasks.push(tokio::spawn(self.inner.advertiser.clone().run(
            self.inner.discovery.clone(),
            self.inner.manager.profile_revisions(),
            stop_rx.clone(),
        )));
        for adapter in &self.inner.adapters {
            tasks.push(tokio::spawn(accept_loop(
                self.inner.clone(),
                adapter.clone(),
                stop_rx.clone(),
            )));
        }
        tasks.push(tokio::spawn(connect_loop(self.inner.clone(), stop_rx)));

        *activity = Some(Activity { stop, tasks });
        self.inner.enabled.send_replace(true);
        log::info!("Discovery enabled");
    }

    async fn deactivate(&self) {
        let activity = self.inner.activity.lock().await.take();
        if let Some(activity) = activity {
            activity.stop.send_replace(true);
            for task in activity.tasks {
                if let Err(e) = task.await {
                    log::warn!("Background task ended abnormally: {}", e);
                }
            }
            log::info!("Discovery disabled");
        }
        self.inner.discovery.stop().await;
        self.inner.enabled.send_replace(false);
    }

    fn persist_setting(&self, enabled: bool) -> Result<()> {
        match lock(&self.inner.settings).as_mut() {
            Some(settings) => {
                settings.set(DISCOVERY_ENABLED_KEY.to_owned(), enabled);
                settings.write_fs()
            }
            None => Ok(()),
        }
    }

    /// Nearby candidates, closest first.
    pub fn candidates(&self) -> Vec<NodeDescriptor> {
        self.inner.discovery.candidates(Utc::now())
    }

    /// Active connections, oldest first.
    pub fn connections(&self) -> Vec<Connection> {
        self.inner.manager.connections()
    }

    pub fn capabilities(&self) -> HashMap<TransportKind, Capability> {
        self.inner.discovery.capabilities()
    }

    pub fn stats(&self) -> DiscoveryStats {
        self.inner.discovery.stats()
    }

    /// The `n` most recent encounters, newest first.
    pub fn history(&self, n: usize) -> Vec<EncounterRecord> {
        self.inner.manager.history(n)
    }

    /// What this node currently advertises, once the advertiser ran.
    pub fn presence(&self) -> Option<LocalPresence> {
        self.inner.advertiser.presence()
    }

    pub fn subscribe(&self, subscriber: Arc<dyn ConnectionSubscriber>) {
        self.inner.manager.subscribe(subscriber);
    }

    pub fn unsubscribe(&self, subscriber: Arc<dyn ConnectionSubscriber>) {
        self.inner.manager.unsubscribe(subscriber);
    }

    /// Stop every task, give running connections the grace period to end,
    /// terminate the rest and flush persisted state.
    pub async fn shutdown(&self) -> Result<()> {
        log::info!("Engine shutting down");
        self.inner.manager.begin_shutdown();
        self.deactivate().await;

        let grace = tokio::time::Instant::now() + self.inner.config.lifecycle.shutdown_grace();
        while self.inner.manager.active_count() > 0
            && tokio::time::Instant::now() < grace
        {
            tokio::time::sleep(DRAIN_POLL).await;
        }
        let left = self.inner.manager.active_count();
        if left > 0 {
            log::warn!("Force-finishing {} connections", left);
            self.inner.manager.force_finish_all(Utc::now());
        }

        self.inner.manager.flush()?;
        if let Some(settings) = lock(&self.inner.settings).as_mut() {
            if settings.needs_syncing()? {
                settings.write_fs()?;
            }
        }
        log::info!("Engine stopped");
        Ok(())
    }

    pub fn storage_dir(&self) -> Option<&PathBuf> {
        self.inner.config.storage_dir.as_ref()
    }
}

/// Serve peers dialling in on one transport.
async fn accept_loop(
    inner: Arc<EngineInner>,
    adapter: Arc<dyn TransportAdapter>,
    mut stop: watch::Receiver<bool>,
) {
    let kind = adapter.kind();
    loop {
        let accepted = tokio::select! {
            _ = stop.changed() => return,
            accepted = adapter.accept() => accepted,
        };
        match accepted {
            Ok(link) => {
                let presence = match inner.advertiser.current(Utc::now()) {
                    Ok(presence) => presence,
                    Err(e) => {
                        log::warn!("No presence to answer with: {}", e);
                        continue;
                    }
                };
                let manager = inner.manager.clone();
                tokio::spawn(async move {
                    manager.run_inbound(link, kind, presence).await;
                });
            }
            Err(e) if e.is_fatal_for_adapter() => {
                log::warn!("Accepting on {} stopped: {}", kind, e);
                return;
            }
            Err(e) => {
                log::debug!("Accept on {} failed: {}", kind, e);
                tokio::select! {
                    _ = stop.changed() => return,
                    _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                }
            }
        }
    }
}

/// Periodically dial the best candidates while there is room.
///
/// Of two nodes seeing each other, only the one with the lower signature
/// dials, so a pair never races into two connections.
async fn connect_loop(inner: Arc<EngineInner>, mut stop: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(inner.config.lifecycle.connect_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop.changed() => return,
            _ = ticker.tick() => {}
        }
        if inner.manager.is_shutting_down() {
            return;
        }

        let now = Utc::now();
        let presence = match inner.advertiser.current(now) {
            Ok(presence) => presence,
            Err(e) => {
                log::warn!("No presence to connect with: {}", e);
                continue;
            }
        };
        let cap = inner.config.lifecycle.max_concurrent_connections;
        for candidate in inner.discovery.candidates(now) {
            if inner.manager.active_count() >= cap {
                break;
            }
            if presence.signature >= candidate.signature
                || inner.manager.is_connected_to(&candidate.signature)
                || inner.manager.cooldown_until(&candidate.signature, now).is_some()
            {
                continue;
            }
            let Some(adapter) = inner
                .adapters
                .iter()
                .find(|a| a.kind() == candidate.transport)
                .cloned()
            else {
                continue;
            };

            match inner.manager.attempt(
                &presence.signature,
                &candidate.signature,
                candidate.transport,
                Role::Initiator,
                now,
            ) {
                Ok(connection) => {
                    let manager = inner.manager.clone();
                    let presence = presence.clone();
                    let address = candidate.address.clone();
                    tokio::spawn(async move {
                        manager
                            .run_outbound(connection, adapter, address, presence)
                            .await;
                    });
                }
                Err(rejection) => {
                    log::debug!("Not connecting to {}: {}", candidate.signature, rejection)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{InMemoryProfileStore, PersonalityProfile};
    use tempdir::TempDir;

    fn store() -> Arc<dyn ProfileStore> {
        Arc::new(
            InMemoryProfileStore::new(PersonalityProfile::uniform("me", 0.5))
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn ble_and_missing_ether_are_reported_unusable() {
        let config = EngineConfig {
            transports: vec![TransportKind::Ble, TransportKind::Memory],
            ..EngineConfig::default()
        };
        let adapters = transports_from_config(&config, None).await;
        let engine = Engine::start(config, store(), adapters).await.unwrap();
        let capabilities = engine.capabilities();
        assert_eq!(
            capabilities.get(&TransportKind::Ble),
            Some(&Capability::Unsupported)
        );
        assert!(matches!(
            capabilities.get(&TransportKind::Memory),
            Some(Capability::Failed(_))
        ));
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn discovery_setting_survives_restart() {
        let dir = TempDir::new("engine").unwrap();
        let ether = Ether::new();
        let config = EngineConfig {
            transports: vec![TransportKind::Memory],
            storage_dir: Some(dir.path().to_path_buf()),
            ..EngineConfig::default()
        };

        let adapters = transports_from_config(&config, Some(&ether)).await;
        let engine = Engine::start(config.clone(), store(), adapters).await.unwrap();
        assert!(engine.is_discovery_enabled());
        engine.disable_discovery().await.unwrap();
        assert!(!engine.is_discovery_enabled());
        engine.shutdown().await.unwrap();
        drop(engine);

        let adapters = transports_from_config(&config, Some(&ether)).await;
        let engine = Engine::start(config, store(), adapters).await.unwrap();
        assert!(!engine.is_discovery_enabled());
        engine.enable_discovery().await.unwrap();
        assert!(engine.is_discovery_enabled());
        engine.shutdown().await.unwrap();
    }
}
