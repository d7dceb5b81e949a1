use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::anonymizer::PrivacyAnonymizer;
use crate::codec;
use crate::config::window_ms;
use crate::discovery::DiscoveryManager;
use crate::errors::{Result, VibeError};
use crate::lifecycle::LocalPresence;
use crate::profile::ProfileStore;
use crate::transport::{AdvertiseHandle, TransportAdapter};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvertisingConfig {
    /// Re-derive the fingerprint this long before it expires.
    pub refresh_margin_secs: u64,
    /// Pause after a failed derivation.
    pub retry_backoff_ms: u64,
}

impl Default for AdvertisingConfig {
    fn default() -> Self {
        Self {
            refresh_margin_secs: 30,
            retry_backoff_ms: 2_000,
        }
    }
}

impl AdvertisingConfig {
    pub fn validate(&self, fingerprint_ttl_secs: u64) -> Result<()> {
        if self.refresh_margin_secs >= fingerprint_ttl_secs {
            return Err(VibeError::Config(format!(
                "advertising.refresh_margin_secs ({}) must be below the fingerprint ttl ({})",
                self.refresh_margin_secs, fingerprint_ttl_secs
            )));
        }
        Ok(())
    }
}

/// Keeps this node's advertisement fresh on every usable transport.
///
/// The advert is re-derived when the fingerprint nears expiry, when the
/// node signature rotates and whenever the profile changed after an
/// exchange.
pub struct Advertiser {
    config: AdvertisingConfig,
    anonymizer: PrivacyAnonymizer,
    store: Arc<dyn ProfileStore>,
    adapters: Vec<Arc<dyn TransportAdapter>>,
    presence: watch::Sender<Option<LocalPresence>>,
}

impl Advertiser {
    pub fn new(
        config: AdvertisingConfig,
        anonymizer: PrivacyAnonymizer,
        store: Arc<dyn ProfileStore>,
        adapters: Vec<Arc<dyn TransportAdapter>>,
    ) -> Self {
        let (presence, _) = watch::channel(None);
        Self {
            config,
            anonymizer,
            store,
            adapters,
            presence,
        }
    }

    /// Last derived presence, if any.
    pub fn presence(&self) -> Option<LocalPresence> {
        self.presence.borrow().clone()
    }

    /// Current presence, derived anew when missing or expired.
    pub fn current(&self, now: DateTime<Utc>) -> Result<LocalPresence> {
        match self.presence() {
            Some(presence)
                if !presence.fingerprint.is_expired(now)
                    && self
                        .anonymizer
                        .node_signature(&self.store.current_profile()?, now)?
                        == presence.signature =>
            {
                Ok(presence)
            }
            _ => self.refresh(now),
        }
    }

    /// Derive a new fingerprint and signature from the current profile.
    pub fn refresh(&self, now: DateTime<Utc>) -> Result<LocalPresence> {
        let profile = self.store.current_profile()?;
        let presence = LocalPresence {
            signature: self.anonymizer.node_signature(&profile, now)?,
            fingerprint: self.anonymizer.derive(&profile, now)?,
        };
        self.presence.send_replace(Some(presence.clone()));
        Ok(presence)
    }

    /// Time until the advert has to be renewed.
    fn renewal_delay(&self, presence: &LocalPresence, now: DateTime<Utc>) -> Duration {
        let margin = chrono::Duration::seconds(self.config.refresh_margin_secs as i64);
        let refresh_at = (presence.fingerprint.expires_at() - margin)
            .min(self.anonymizer.next_rotation(now));
        (refresh_at - now)
            .to_std()
            .unwrap_or(Duration::ZERO)
            .max(Duration::from_secs(1))
    }

    async fn advertise(&self, presence: &LocalPresence) -> Vec<AdvertiseHandle> {
        let ttl = self.anonymizer.config().fingerprint_ttl().to_std().unwrap_or_default();
        let mut handles = Vec::with_capacity(self.adapters.len());
        for adapter in &self.adapters {
            let payload =
                codec::encode(&presence.fingerprint, adapter.kind().wire_format());
            match adapter.advertise(&presence.signature, payload, ttl).await {
                Ok(handle) => handles.push(handle),
                Err(e) => log::warn!("Advertising on {} failed: {}", adapter.kind(), e),
            }
        }
        handles
    }

    /// Advertise until `stop` flips.
    pub async fn run(
        self: Arc<Self>,
        discovery: DiscoveryManager,
        mut revisions: watch::Receiver<u64>,
        mut stop: watch::Receiver<bool>,
    ) {
        loop {
            if *stop.borrow() {
                break;
            }
            let now = Utc::now();
            let presence = match self.refresh(now) {
                Ok(presence) => presence,
                Err(e) => {
                    log::warn!("Cannot derive fingerprint: {}", e);
                    let backoff = window_ms(self.config.retry_backoff_ms);
                    tokio::select! {
                        _ = stop.changed() => break,
                        _ = tokio::time::sleep(backoff) => continue,
                    }
                }
            };
            discovery.set_local_signature(presence.signature.clone());
            let handles = self.advertise(&presence).await;
            log::info!(
                "Advertising {} on {} transports",
                presence.signature,
                handles.len()
            );

            let wait = self.renewal_delay(&presence, now);
            tokio::select! {
                _ = stop.changed() => break,
                _ = tokio::time::sleep(wait) => {
                    log::debug!("Advert due for renewal");
                }
                Ok(()) = revisions.changed() => {
                    log::debug!("Profile changed, renewing advert");
                }
            }
            drop(handles);
        }
        log::info!("Advertising stopped");
    }
}
