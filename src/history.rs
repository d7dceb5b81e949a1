use std::collections::VecDeque;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::connection::{Connection, ConnectionState, TerminationReason};
use crate::depth::InteractionDepth;
use crate::errors::Result;
use crate::id::{ConnectionId, NodeSignature};
use crate::storage::{BaseStorage, FileStorage};
use crate::transport::TransportKind;

/// What is remembered about a finished connection. Holds no insight and no
/// fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncounterRecord {
    pub connection: ConnectionId,
    pub remote: NodeSignature,
    pub transport: TransportKind,
    pub outcome: ConnectionState,
    pub termination: Option<TerminationReason>,
    pub score: Option<f64>,
    pub effective_depth: Option<InteractionDepth>,
    pub insights_sent: usize,
    pub insights_received: usize,
    pub duration_ms: i64,
    pub completed_at: DateTime<Utc>,
}

impl EncounterRecord {
    pub fn from_connection(connection: &Connection, now: DateTime<Utc>) -> Self {
        Self {
            connection: connection.id,
            remote: connection.remote.clone(),
            transport: connection.transport,
            outcome: connection.state,
            termination: connection.termination.clone(),
            score: connection.local_result.as_ref().map(|r| r.score),
            effective_depth: connection.effective_depth,
            insights_sent: connection.insights_sent,
            insights_received: connection.insights_received,
            duration_ms: connection.duration_ms(),
            completed_at: connection.completed_at.unwrap_or(now),
        }
    }
}

/// Bounded log of past encounters, oldest evicted first.
pub struct EncounterHistory {
    limit: usize,
    next_seq: u64,
    records: VecDeque<(u64, EncounterRecord)>,
    storage: Option<FileStorage<u64, EncounterRecord>>,
}

impl EncounterHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            next_seq: 0,
            records: VecDeque::new(),
            storage: None,
        }
    }

    pub fn with_storage(limit: usize, path: &Path) -> Result<Self> {
        let storage: FileStorage<u64, EncounterRecord> =
            FileStorage::load("history", path)?;
        let records: VecDeque<(u64, EncounterRecord)> = storage
            .as_ref()
            .iter()
            .map(|(seq, record)| (*seq, record.clone()))
            .collect();
        let next_seq = records.back().map_or(0, |(seq, _)| seq + 1);
        let mut history = Self {
            limit,
            next_seq,
            records,
            storage: Some(storage),
        };
        history.evict();
        Ok(history)
    }

    pub fn append(&mut self, record: EncounterRecord) {
        log::debug!(
            "Encounter with {} ended {}",
            record.remote,
            record.outcome
        );
        self.records.push_back((self.next_seq, record));
        self.next_seq += 1;
        self.evict();
    }

    fn evict(&mut self) {
        while self.records.len() > self.limit {
            self.records.pop_front();
        }
    }

    /// The `n` most recent records, newest first.
    pub fn recent(&self, n: usize) -> Vec<EncounterRecord> {
        self.records
            .iter()
            .rev()
            .take(n)
            .map(|(_, record)| record.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn flush(&mut self) -> Result<()> {
        let Some(storage) = self.storage.as_mut() else {
            return Ok(());
        };
        storage.clear();
        for (seq, record) in &self.records {
            storage.set(*seq, record.clone());
        }
        storage.write_fs()
    }
}
