use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};

use crate::config::saturating_add;
use crate::errors::Result;
use crate::id::NodeSignature;
use crate::storage::{BaseStorage, FileStorage};

/// Remembers which peers were recently connected to and until when they
/// must not be connected to again.
pub struct CooldownLedger {
    period: Duration,
    entries: BTreeMap<NodeSignature, DateTime<Utc>>,
    storage: Option<FileStorage<NodeSignature, DateTime<Utc>>>,
}

impl CooldownLedger {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            entries: BTreeMap::new(),
            storage: None,
        }
    }

    /// Ledger backed by a file. Entries that already expired are dropped on
    /// load.
    pub fn with_storage(
        period: Duration,
        path: &Path,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let storage: FileStorage<NodeSignature, DateTime<Utc>> =
            FileStorage::load("cooldowns", path)?;
        let mut ledger = Self {
            period,
            entries: storage.as_ref().clone(),
            storage: Some(storage),
        };
        ledger.prune(now);
        log::debug!("Loaded {} active cooldowns", ledger.entries.len());
        Ok(ledger)
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Start the cooldown of `signature` at `now`.
    pub fn record(
        &mut self,
        signature: &NodeSignature,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        self.record_for(signature, now, self.period)
    }

    /// Start a cooldown of custom length. Entries that ran out are dropped
    /// on the way, since signatures rotate and old keys never come back.
    pub fn record_for(
        &mut self,
        signature: &NodeSignature,
        now: DateTime<Utc>,
        period: Duration,
    ) -> DateTime<Utc> {
        self.prune(now);
        let until = saturating_add(now, period);
        self.entries.insert(signature.clone(), until);
        until
    }

    /// End of the active cooldown of `signature`, if any.
    pub fn until(
        &self,
        signature: &NodeSignature,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        self.entries
            .get(signature)
            .copied()
            .filter(|until| *until > now)
    }

    pub fn is_cooling(&self, signature: &NodeSignature, now: DateTime<Utc>) -> bool {
        self.until(signature, now).is_some()
    }

    pub fn prune(&mut self, now: DateTime<Utc>) {
        self.entries.retain(|_, until| *until > now);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Persist the live entries when the ledger is file backed.
    pub fn flush(&mut self) -> Result<()> {
        self.prune(Utc::now());
        let Some(storage) = self.storage.as_mut() else {
            return Ok(());
        };
        storage.clear();
        for (signature, until) in &self.entries {
            storage.set(signature.clone(), *until);
        }
        storage.write_fs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    fn sig(s: &str) -> NodeSignature {
        s.parse().unwrap()
    }

    #[test]
    fn cooldown_blocks_until_period_elapses() {
        let mut ledger = CooldownLedger::new(Duration::seconds(600));
        let now = Utc::now();
        let peer = sig("0123456789abcdef");
        let until = ledger.record(&peer, now);
        assert_eq!(until, now + Duration::seconds(600));
        assert!(ledger.is_cooling(&peer, now + Duration::seconds(599)));
        assert!(!ledger.is_cooling(&peer, until));
        assert!(!ledger.is_cooling(&sig("fedcba9876543210"), now));
    }

    #[test]
    fn prune_drops_expired_entries() {
        let mut ledger = CooldownLedger::new(Duration::seconds(10));
        let now = Utc::now();
        ledger.record(&sig("0123456789abcdef"), now);
        ledger.record(&sig("fedcba9876543210"), now + Duration::seconds(5));
        ledger.prune(now + Duration::seconds(12));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn recording_drops_what_already_ran_out() {
        let mut ledger = CooldownLedger::new(Duration::seconds(1));
        let start = Utc::now();
        for i in 0..50i64 {
            let peer = sig(&format!("{:016x}", i + 1));
            ledger.record(&peer, start + Duration::seconds(10 * i));
        }
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn short_cooldown_sits_next_to_full_ones() {
        let mut ledger = CooldownLedger::new(Duration::seconds(600));
        let now = Utc::now();
        let until = ledger.record_for(&sig("0123456789abcdef"), now, Duration::seconds(15));
        assert_eq!(until, now + Duration::seconds(15));
        ledger.record(&sig("fedcba9876543210"), now);
        assert!(!ledger.is_cooling(&sig("0123456789abcdef"), now + Duration::seconds(15)));
        assert!(ledger.is_cooling(&sig("fedcba9876543210"), now + Duration::seconds(15)));
    }

    #[test]
    fn flush_writes_only_live_entries() {
        let dir = TempDir::new("cooldown").unwrap();
        let path = dir.path().join("cooldowns.json");
        let now = Utc::now();
        let mut ledger =
            CooldownLedger::with_storage(Duration::seconds(60), &path, now).unwrap();
        ledger.record(&sig("0123456789abcdef"), now - Duration::seconds(3600));
        ledger.record(&sig("fedcba9876543210"), now);
        ledger.flush().unwrap();
        assert_eq!(ledger.len(), 1);

        let stored: FileStorage<NodeSignature, DateTime<Utc>> =
            FileStorage::load("cooldowns", &path).unwrap();
        assert_eq!(stored.as_ref().len(), 1);
        assert!(stored.as_ref().contains_key(&sig("fedcba9876543210")));
    }

    #[test]
    fn cooldowns_survive_restart() {
        let dir = TempDir::new("cooldown").unwrap();
        let path = dir.path().join("cooldowns.json");
        let now = Utc::now();
        let peer = sig("0123456789abcdef");
        {
            let mut ledger =
                CooldownLedger::with_storage(Duration::seconds(60), &path, now)
                    .unwrap();
            ledger.record(&peer, now);
            ledger.flush().unwrap();
        }
        let ledger =
            CooldownLedger::with_storage(Duration::seconds(60), &path, now)
                .unwrap();
        assert!(ledger.is_cooling(&peer, now + Duration::seconds(30)));

        let later = CooldownLedger::with_storage(
            Duration::seconds(60),
            &path,
            now + Duration::seconds(61),
        )
        .unwrap();
        assert!(later.is_empty());
    }
}
