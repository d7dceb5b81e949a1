//! Connection lifecycle: admission, handshake, depth negotiation, the
//! bounded insight exchange and teardown.
//!
//! The active-connection table, together with the cooldown ledger, lives
//! behind a single mutex owned by [`ConnectionManager`]. Nothing else mutates
//! it; everybody else gets cloned snapshots.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::{sleep_until, timeout, Instant};

use crate::codec::{self, WireFormat};
use crate::compatibility::{AnalyzerConfig, CompatibilityAnalyzer};
use crate::config::{ensure_at_most, window_ms, window_secs, MAX_WINDOW_SECS};
use crate::connection::{
    Connection, ConnectionState, Rejection, Role, TerminationReason,
};
use crate::cooldown::CooldownLedger;
use crate::depth::{DepthResolution, DepthResolver};
use crate::errors::{Result, VibeError};
use crate::exchange::{self, ExchangeMessage, InsightPlan};
use crate::fingerprint::VibeFingerprint;
use crate::history::{EncounterHistory, EncounterRecord};
use crate::id::{ConnectionId, NodeSignature};
use crate::link::PeerLink;
use crate::profile::{LearningInsight, ProfileStore};
use crate::transport::{TransportAdapter, TransportAddress, TransportKind};

/// Best-effort wait when telling the peer goodbye.
const FAREWELL_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub max_concurrent_connections: usize,
    pub cooldown_secs: u64,
    /// Shorter cooldown after a handshake that failed for a passing reason:
    /// no link, a timeout or a peer at capacity.
    pub retry_cooldown_secs: u64,
    pub handshake_timeout_ms: u64,
    /// Idle limit between two protocol messages.
    pub message_timeout_ms: u64,
    pub max_connection_duration_ms: u64,
    /// Upper bound of insight offers per connection, both directions.
    pub max_exchange_messages: usize,
    /// Pause between two passes over the candidate list.
    pub connect_interval_ms: u64,
    pub history_limit: usize,
    /// How long running connections may keep going after shutdown started.
    pub shutdown_grace_ms: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            max_concurrent_connections: 3,
            cooldown_secs: 600,
            retry_cooldown_secs: 15,
            handshake_timeout_ms: 5_000,
            message_timeout_ms: 3_000,
            max_connection_duration_ms: 30_000,
            max_exchange_messages: 6,
            connect_interval_ms: 2_000,
            history_limit: 500,
            shutdown_grace_ms: 2_000,
        }
    }
}

impl LifecycleConfig {
    pub fn cooldown(&self) -> chrono::Duration {
        window_secs(self.cooldown_secs)
    }

    pub fn retry_cooldown(&self) -> chrono::Duration {
        window_secs(self.retry_cooldown_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        window_ms(self.handshake_timeout_ms)
    }

    pub fn message_timeout(&self) -> Duration {
        window_ms(self.message_timeout_ms)
    }

    pub fn max_connection_duration(&self) -> Duration {
        window_ms(self.max_connection_duration_ms)
    }

    pub fn connect_interval(&self) -> Duration {
        window_ms(self.connect_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        window_ms(self.shutdown_grace_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_connections == 0 {
            return Err(VibeError::Config(
                "lifecycle.max_concurrent_connections must be positive"
                    .to_owned(),
            ));
        }
        if self.handshake_timeout_ms == 0
            || self.message_timeout_ms == 0
            || self.max_connection_duration_ms == 0
        {
            return Err(VibeError::Config(
                "lifecycle timeouts must be positive".to_owned(),
            ));
        }
        if self.max_exchange_messages == 0 {
            return Err(VibeError::Config(
                "lifecycle.max_exchange_messages must be positive".to_owned(),
            ));
        }
        if self.retry_cooldown_secs > self.cooldown_secs {
            return Err(VibeError::Config(
                "lifecycle.retry_cooldown_secs must not exceed cooldown_secs"
                    .to_owned(),
            ));
        }
        ensure_at_most("lifecycle.cooldown_secs", self.cooldown_secs, MAX_WINDOW_SECS)?;
        ensure_at_most(
            "lifecycle.retry_cooldown_secs",
            self.retry_cooldown_secs,
            MAX_WINDOW_SECS,
        )?;
        let max_ms = MAX_WINDOW_SECS * 1_000;
        for (field, value) in [
            ("lifecycle.handshake_timeout_ms", self.handshake_timeout_ms),
            ("lifecycle.message_timeout_ms", self.message_timeout_ms),
            (
                "lifecycle.max_connection_duration_ms",
                self.max_connection_duration_ms,
            ),
            ("lifecycle.connect_interval_ms", self.connect_interval_ms),
            ("lifecycle.shutdown_grace_ms", self.shutdown_grace_ms),
        ] {
            ensure_at_most(field, value, max_ms)?;
        }
        Ok(())
    }
}

/// What this node currently presents to peers.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalPresence {
    pub signature: NodeSignature,
    pub fingerprint: VibeFingerprint,
}

#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    pub connection: Connection,
}

pub trait ConnectionSubscriber: Send + Sync {
    fn get_id(&self) -> String;
    fn notify_state(&self, event: ConnectionEvent);
}

struct Table {
    connections: HashMap<ConnectionId, Connection>,
    cooldowns: CooldownLedger,
}

struct ManagerInner {
    config: LifecycleConfig,
    analyzer: CompatibilityAnalyzer,
    resolver: DepthResolver,
    table: Mutex<Table>,
    history: Mutex<EncounterHistory>,
    profile_store: Arc<dyn ProfileStore>,
    subscribers: RwLock<HashMap<String, Arc<dyn ConnectionSubscriber>>>,
    shutdown: watch::Sender<bool>,
    revisions: watch::Sender<u64>,
}

#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ConnectionManager {
    pub fn new(
        config: LifecycleConfig,
        analyzer: AnalyzerConfig,
        profile_store: Arc<dyn ProfileStore>,
        cooldowns: CooldownLedger,
        history: EncounterHistory,
    ) -> Self {
        let resolver = DepthResolver::new(
            analyzer.compatibility_floor,
            analyzer.max_share_depth,
        );
        let (shutdown, _) = watch::channel(false);
        let (revisions, _) = watch::channel(profile_store.revision());
        Self {
            inner: Arc::new(ManagerInner {
                config,
                analyzer: CompatibilityAnalyzer::new(analyzer),
                resolver,
                table: Mutex::new(Table {
                    connections: HashMap::new(),
                    cooldowns,
                }),
                history: Mutex::new(history),
                profile_store,
                subscribers: RwLock::new(HashMap::new()),
                shutdown,
                revisions,
            }),
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.inner.config
    }

    pub fn subscribe(&self, subscriber: Arc<dyn ConnectionSubscriber>) {
        self.inner
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(subscriber.get_id(), subscriber);
    }

    pub fn unsubscribe(&self, subscriber: Arc<dyn ConnectionSubscriber>) {
        self.inner
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&subscriber.get_id());
    }

    fn notify(&self, connection: &Connection) {
        let subscribers: Vec<Arc<dyn ConnectionSubscriber>> = self
            .inner
            .subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect();
        for subscriber in subscribers {
            subscriber.notify_state(ConnectionEvent {
                connection: connection.clone(),
            });
        }
    }

    /// Revision of the profile store after each applied exchange.
    pub fn profile_revisions(&self) -> watch::Receiver<u64> {
        self.inner.revisions.subscribe()
    }

    /// Admit a new connection with `remote`.
    ///
    /// Checks, in order: the concurrency cap, the remote's cooldown and
    /// whether a connection with the remote already exists. The admitted
    /// connection counts against the cap right away.
    pub fn attempt(
        &self,
        local: &NodeSignature,
        remote: &NodeSignature,
        transport: TransportKind,
        role: Role,
        now: DateTime<Utc>,
    ) -> std::result::Result<Connection, Rejection> {
        let connection = {
            let mut table = lock(&self.inner.table);
            if table.connections.len()
                >= self.inner.config.max_concurrent_connections
            {
                return Err(Rejection::TooManyConnections);
            }
            if let Some(until) = table.cooldowns.until(remote, now) {
                return Err(Rejection::InCooldown { until });
            }
            if table.connections.values().any(|c| &c.remote == remote) {
                return Err(Rejection::AlreadyConnecting);
            }
            let connection =
                Connection::new(role, local.clone(), remote.clone(), transport, now);
            table
                .connections
                .insert(connection.id, connection.clone());
            connection
        };
        log::info!(
            "Connection {} with {} admitted as {:?}",
            connection.id,
            remote,
            role
        );
        self.notify(&connection);
        Ok(connection)
    }

    pub fn transition(
        &self,
        id: ConnectionId,
        next: ConnectionState,
        now: DateTime<Utc>,
    ) -> Result<Connection> {
        let connection = {
            let mut table = lock(&self.inner.table);
            let connection = table
                .connections
                .get_mut(&id)
                .ok_or_else(|| VibeError::UnknownConnection(id.to_string()))?;
            connection.transition(next, now)?;
            connection.clone()
        };
        self.notify(&connection);
        Ok(connection)
    }

    /// Record bookkeeping on a live connection.
    pub fn update(
        &self,
        id: ConnectionId,
        f: impl FnOnce(&mut Connection),
    ) -> Result<Connection> {
        let mut table = lock(&self.inner.table);
        let connection = table
            .connections
            .get_mut(&id)
            .ok_or_else(|| VibeError::UnknownConnection(id.to_string()))?;
        f(connection);
        Ok(connection.clone())
    }

    pub fn get(&self, id: ConnectionId) -> Option<Connection> {
        lock(&self.inner.table).connections.get(&id).cloned()
    }

    /// Move a connection into a terminal state and retire it: it leaves the
    /// table, its remote enters cooldown and an encounter is recorded.
    ///
    /// A handshake lost to a timeout, a dead link or a busy peer only earns
    /// the retry cooldown. A connection still in `Discovered` never started
    /// and is only dropped.
    pub fn finish(
        &self,
        id: ConnectionId,
        outcome: ConnectionState,
        reason: TerminationReason,
        now: DateTime<Utc>,
    ) -> Result<Connection> {
        let connection = {
            let mut table = lock(&self.inner.table);
            let mut connection = table
                .connections
                .remove(&id)
                .ok_or_else(|| VibeError::UnknownConnection(id.to_string()))?;
            if connection.state == ConnectionState::Discovered {
                log::debug!("Connection {} cancelled before start", id);
                return Ok(connection);
            }
            let period = if is_retryable(connection.state, &reason) {
                self.inner.config.retry_cooldown()
            } else {
                self.inner.config.cooldown()
            };
            if let Err(e) = connection.transition(outcome, now) {
                table.connections.insert(id, connection);
                return Err(e);
            }
            connection.termination = Some(reason);
            table.cooldowns.record_for(&connection.remote, now, period);
            connection
        };

        lock(&self.inner.history)
            .append(EncounterRecord::from_connection(&connection, now));
        log::info!(
            "Connection {} with {} {} ({:?})",
            connection.id,
            connection.remote,
            connection.state,
            connection.termination
        );
        self.notify(&connection);
        Ok(connection)
    }

    /// Snapshot of the active-connection table, oldest first.
    pub fn connections(&self) -> Vec<Connection> {
        let mut connections: Vec<Connection> = lock(&self.inner.table)
            .connections
            .values()
            .cloned()
            .collect();
        connections.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        connections
    }

    pub fn active_count(&self) -> usize {
        lock(&self.inner.table).connections.len()
    }

    pub fn is_connected_to(&self, remote: &NodeSignature) -> bool {
        lock(&self.inner.table)
            .connections
            .values()
            .any(|c| &c.remote == remote)
    }

    pub fn cooldown_until(
        &self,
        remote: &NodeSignature,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        lock(&self.inner.table).cooldowns.until(remote, now)
    }

    pub fn history(&self, n: usize) -> Vec<EncounterRecord> {
        lock(&self.inner.history).recent(n)
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    /// Ask every running connection to wind down.
    pub fn begin_shutdown(&self) {
        self.inner.shutdown.send_replace(true);
    }

    /// Terminate whatever is still in the table: exchanging connections
    /// complete, earlier ones abort.
    pub fn force_finish_all(&self, now: DateTime<Utc>) {
        let remaining: Vec<(ConnectionId, ConnectionState)> = lock(&self.inner.table)
            .connections
            .values()
            .map(|c| (c.id, c.state))
            .collect();
        for (id, state) in remaining {
            let outcome = if state == ConnectionState::Exchanging {
                ConnectionState::Completed
            } else {
                ConnectionState::Aborted
            };
            if let Err(e) = self.finish(id, outcome, TerminationReason::Shutdown, now) {
                log::warn!("Failed to force-finish {}: {}", id, e);
            }
        }
    }

    /// Persist cooldowns and history.
    pub fn flush(&self) -> Result<()> {
        lock(&self.inner.table).cooldowns.flush()?;
        lock(&self.inner.history).flush()
    }

    /// Drive an admitted outbound connection to its end.
    pub async fn run_outbound(
        &self,
        connection: Connection,
        adapter: Arc<dyn TransportAdapter>,
        address: TransportAddress,
        presence: LocalPresence,
    ) -> Option<Connection> {
        let id = connection.id;
        if let Err(e) = self.transition(id, ConnectionState::Handshaking, Utc::now()) {
            log::warn!("Connection {} could not start: {}", id, e);
            return self
                .finish(id, ConnectionState::Aborted, TerminationReason::Shutdown, Utc::now())
                .ok();
        }

        let link = match timeout(
            self.inner.config.handshake_timeout(),
            adapter.connect(&address),
        )
        .await
        {
            Ok(Ok(link)) => link,
            Ok(Err(e)) => {
                log::debug!("Connecting to {} failed: {}", address, e);
                return self
                    .finish(
                        id,
                        ConnectionState::Aborted,
                        TerminationReason::LinkClosed,
                        Utc::now(),
                    )
                    .ok();
            }
            Err(_) => {
                return self
                    .finish(
                        id,
                        ConnectionState::Aborted,
                        TerminationReason::Timeout,
                        Utc::now(),
                    )
                    .ok();
            }
        };

        let mut session = Session::new(self.clone(), &connection, link, presence);
        let result = session.initiate().await;
        session.conclude(result).await
    }

    /// Serve a link opened by a peer. Returns `None` when the peer was
    /// declined or never said hello.
    pub async fn run_inbound(
        &self,
        mut link: Box<dyn PeerLink>,
        transport: TransportKind,
        presence: LocalPresence,
    ) -> Option<Connection> {
        let hello = match timeout(self.inner.config.handshake_timeout(), link.recv()).await {
            Ok(Ok(ExchangeMessage::Hello {
                signature,
                fingerprint,
            })) => (signature, fingerprint),
            Ok(Ok(other)) => {
                log::debug!("Inbound link opened with {}", other.name());
                return None;
            }
            Ok(Err(e)) => {
                log::debug!("Inbound link failed before hello: {}", e);
                return None;
            }
            Err(_) => {
                log::debug!("Inbound link silent, dropping");
                return None;
            }
        };
        let (remote, payload) = hello;

        if self.is_shutting_down() {
            return None;
        }
        let connection = match self.attempt(
            &presence.signature,
            &remote,
            transport,
            Role::Responder,
            Utc::now(),
        ) {
            Ok(connection) => connection,
            Err(rejection) => {
                log::debug!("Declining {}: {}", remote, rejection);
                let decline = ExchangeMessage::Decline { reason: rejection };
                let _ = timeout(FAREWELL_TIMEOUT, link.send(&decline)).await;
                return None;
            }
        };
        if let Err(e) = self.transition(connection.id, ConnectionState::Handshaking, Utc::now()) {
            log::warn!("Connection {} could not start: {}", connection.id, e);
            return self
                .finish(
                    connection.id,
                    ConnectionState::Aborted,
                    TerminationReason::Shutdown,
                    Utc::now(),
                )
                .ok();
        }

        let mut session = Session::new(self.clone(), &connection, link, presence);
        let result = session.respond(payload).await;
        session.conclude(result).await
    }
}

/// A handshake that died of a passing condition, worth trying again soon.
fn is_retryable(state: ConnectionState, reason: &TerminationReason) -> bool {
    state == ConnectionState::Handshaking
        && matches!(
            reason,
            TerminationReason::Timeout
                | TerminationReason::LinkClosed
                | TerminationReason::Rejected {
                    rejection: Rejection::TooManyConnections
                        | Rejection::AlreadyConnecting
                }
        )
}

/// Why a session stopped, and whether the peer still has to be told.
#[derive(Debug)]
struct Stop {
    reason: TerminationReason,
    tell_peer: bool,
}

impl Stop {
    fn local(reason: TerminationReason) -> Self {
        Self {
            reason,
            tell_peer: true,
        }
    }

    fn remote(reason: TerminationReason) -> Self {
        Self {
            reason,
            tell_peer: false,
        }
    }
}

type Step<T> = std::result::Result<T, Stop>;

/// One running connection, owned by its task.
struct Session {
    manager: ConnectionManager,
    id: ConnectionId,
    remote: NodeSignature,
    link: Box<dyn PeerLink>,
    presence: LocalPresence,
    deadline: Instant,
    shutdown: watch::Receiver<bool>,
    received: Vec<LearningInsight>,
}

impl Session {
    fn new(
        manager: ConnectionManager,
        connection: &Connection,
        link: Box<dyn PeerLink>,
        presence: LocalPresence,
    ) -> Self {
        let deadline = Instant::now() + manager.config().max_connection_duration();
        let shutdown = manager.inner.shutdown.subscribe();
        Self {
            id: connection.id,
            remote: connection.remote.clone(),
            manager,
            link,
            presence,
            deadline,
            shutdown,
            received: Vec::new(),
        }
    }

    fn config(&self) -> &LifecycleConfig {
        self.manager.config()
    }

    fn step(&self, next: ConnectionState) -> Step<Connection> {
        self.manager
            .transition(self.id, next, Utc::now())
            .map_err(|e| {
                log::debug!("Connection {} cannot move on: {}", self.id, e);
                Stop::local(TerminationReason::Shutdown)
            })
    }

    fn record(&self, f: impl FnOnce(&mut Connection)) -> Step<Connection> {
        self.manager.update(self.id, f).map_err(|e| {
            log::debug!("Connection {} vanished: {}", self.id, e);
            Stop::local(TerminationReason::Shutdown)
        })
    }

    async fn send(&mut self, message: ExchangeMessage) -> Step<()> {
        match timeout(self.config().message_timeout(), self.link.send(&message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                log::debug!("Sending {} failed: {}", message.name(), e);
                Err(Stop::remote(TerminationReason::LinkClosed))
            }
            Err(_) => Err(Stop::remote(TerminationReason::Timeout)),
        }
    }

    /// Next message, bounded by `wait`, the overall ceiling and shutdown.
    /// A `Terminate` from the peer ends the session.
    async fn recv(&mut self, wait: Duration) -> Step<ExchangeMessage> {
        if *self.shutdown.borrow() {
            return Err(Stop::local(TerminationReason::Shutdown));
        }
        let message = tokio::select! {
            _ = self.shutdown.changed() => {
                return Err(Stop::local(TerminationReason::Shutdown))
            }
            _ = sleep_until(self.deadline) => {
                return Err(Stop::local(TerminationReason::DurationExceeded))
            }
            received = timeout(wait, self.link.recv()) => received,
        };
        match message {
            Err(_) => Err(Stop::local(TerminationReason::Timeout)),
            Ok(Err(VibeError::LinkClosed)) => {
                Err(Stop::remote(TerminationReason::LinkClosed))
            }
            Ok(Err(e)) => {
                log::debug!("Connection {} received garbage: {}", self.id, e);
                Err(Stop::local(TerminationReason::ProtocolViolation))
            }
            Ok(Ok(ExchangeMessage::Terminate { reason })) => {
                log::debug!("Peer {} terminated: {:?}", self.remote, reason);
                Err(Stop::remote(reason))
            }
            Ok(Ok(message)) => Ok(message),
        }
    }

    fn hello(&self) -> ExchangeMessage {
        let fingerprint = codec::encode(&self.presence.fingerprint, WireFormat::Structured);
        ExchangeMessage::Hello {
            signature: self.presence.signature.clone(),
            // structured encoding is JSON text
            fingerprint: String::from_utf8_lossy(&fingerprint).into_owned(),
        }
    }

    fn decode_remote(&self, payload: &str) -> Step<VibeFingerprint> {
        codec::decode(payload.as_bytes(), WireFormat::Structured, Utc::now()).map_err(|e| {
            log::debug!("Fingerprint of {} rejected: {}", self.remote, e);
            Stop::local(TerminationReason::MalformedFingerprint)
        })
    }

    async fn initiate(&mut self) -> Step<()> {
        let hello = self.hello();
        self.send(hello).await?;
        let wait = self.config().handshake_timeout();
        let remote = match self.recv(wait).await? {
            ExchangeMessage::Hello {
                signature,
                fingerprint,
            } => {
                if signature != self.remote {
                    log::debug!("Expected {}, {} answered", self.remote, signature);
                    return Err(Stop::local(TerminationReason::ProtocolViolation));
                }
                self.decode_remote(&fingerprint)?
            }
            ExchangeMessage::Decline { reason } => {
                return Err(Stop::remote(TerminationReason::Rejected { rejection: reason }))
            }
            other => return Err(unexpected(&other)),
        };
        self.step(ConnectionState::Active)?;

        let resolution = self.negotiate(&remote, Role::Initiator).await?;
        self.step(ConnectionState::Exchanging)?;
        self.exchange_as_initiator(resolution).await
    }

    async fn respond(&mut self, payload: String) -> Step<()> {
        let remote = self.decode_remote(&payload)?;
        let hello = self.hello();
        self.send(hello).await?;
        self.step(ConnectionState::Active)?;

        let resolution = self.negotiate(&remote, Role::Responder).await?;
        self.step(ConnectionState::Exchanging)?;
        self.exchange_as_responder(resolution).await
    }

    /// Score the peer, apply the floor and agree on a depth.
    async fn negotiate(
        &mut self,
        remote: &VibeFingerprint,
        role: Role,
    ) -> Step<(DepthResolution, InsightPlan)> {
        let inner = self.manager.inner.clone();
        let result = inner.analyzer.score(&self.presence.fingerprint, remote);
        let desired = inner.resolver.desired(&result);
        let below_floor = !inner.resolver.passes_floor(&result);
        self.record(|c| {
            c.local_result = Some(result.clone());
            c.desired_depth = Some(desired);
        })?;
        if below_floor {
            log::debug!("Score {:.3} with {} below floor", result.score, self.remote);
            return Err(Stop::local(TerminationReason::BelowFloor));
        }

        let proposal = ExchangeMessage::DepthProposal {
            result: result.clone(),
            desired,
        };
        let wait = self.config().message_timeout();
        if role == Role::Initiator {
            self.send(proposal.clone()).await?;
        }
        let (remote_result, remote_desired) = match self.recv(wait).await? {
            ExchangeMessage::DepthProposal { result, desired } => (result, desired),
            other => return Err(unexpected(&other)),
        };
        if remote_result.validate().is_err() {
            return Err(Stop::local(TerminationReason::ProtocolViolation));
        }
        if role == Role::Responder {
            self.send(proposal).await?;
        }

        let resolution = inner.resolver.resolve(desired, remote_desired);
        self.record(|c| {
            c.remote_result = Some(remote_result);
            c.remote_desired_depth = Some(remote_desired);
            c.effective_depth = Some(resolution.effective);
        })?;
        log::debug!(
            "Connection {} depth {:.2} ({})",
            self.id,
            resolution.effective.value(),
            resolution.effective_tier()
        );
        let plan = InsightPlan::new(
            &result,
            resolution.effective,
            self.config().max_exchange_messages,
        );
        Ok((resolution, plan))
    }

    fn absorb(
        &mut self,
        resolution: &DepthResolution,
        offer: &[exchange::WireInsight],
    ) -> Step<usize> {
        let limit = exchange::per_offer_limit(
            resolution.effective_tier(),
            self.config().max_exchange_messages,
        );
        let accepted =
            exchange::accept_offer(offer, limit, resolution.local_learning_rate())
                .map_err(|e| {
                    log::debug!("Offer from {} refused: {}", self.remote, e);
                    Stop::local(TerminationReason::ProtocolViolation)
                })?;
        let count = accepted.len();
        self.received.extend(accepted);
        Ok(count)
    }

    async fn exchange_as_initiator(
        &mut self,
        (resolution, mut plan): (DepthResolution, InsightPlan),
    ) -> Step<()> {
        let max = self.config().max_exchange_messages;
        let wait = self.config().message_timeout();
        let mut messages = 0;
        let mut round = 0u32;

        while messages + 2 <= max {
            round += 1;
            let offer = plan.next_offer();
            let sent = offer.len();
            self.send(ExchangeMessage::InsightOffer {
                round,
                insights: offer,
            })
            .await?;
            messages += 1;
            self.record(|c| {
                c.insights_sent += sent;
                c.messages_exchanged += 1;
            })?;

            let insights = match self.recv(wait).await? {
                ExchangeMessage::InsightOffer {
                    round: answered,
                    insights,
                } if answered == round => insights,
                other => return Err(unexpected(&other)),
            };
            let got = self.absorb(&resolution, &insights)?;
            messages += 1;
            self.record(|c| {
                c.insights_received += got;
                c.messages_exchanged += 1;
            })?;

            if sent == 0 && insights.is_empty() {
                return Err(Stop::local(TerminationReason::Complete));
            }
        }
        Err(Stop::local(TerminationReason::MessageLimit))
    }

    async fn exchange_as_responder(
        &mut self,
        (resolution, mut plan): (DepthResolution, InsightPlan),
    ) -> Step<()> {
        let max = self.config().max_exchange_messages;
        let wait = self.config().message_timeout();
        let mut messages = 0;

        loop {
            let (round, insights) = match self.recv(wait).await? {
                ExchangeMessage::InsightOffer { round, insights } => (round, insights),
                other => return Err(unexpected(&other)),
            };
            if messages + 2 > max {
                log::debug!("{} exceeded the message bound", self.remote);
                return Err(Stop::local(TerminationReason::MessageLimit));
            }
            let got = self.absorb(&resolution, &insights)?;
            messages += 1;
            self.record(|c| {
                c.insights_received += got;
                c.messages_exchanged += 1;
            })?;

            let offer = plan.next_offer();
            let sent = offer.len();
            self.send(ExchangeMessage::InsightOffer {
                round,
                insights: offer,
            })
            .await?;
            messages += 1;
            self.record(|c| {
                c.insights_sent += sent;
                c.messages_exchanged += 1;
            })?;
        }
    }

    /// Say goodbye if needed, hand accepted insights to the profile store
    /// and retire the connection.
    async fn conclude(mut self, result: Step<()>) -> Option<Connection> {
        let stop = match result {
            Ok(()) => Stop::local(TerminationReason::Complete),
            Err(stop) => stop,
        };
        if stop.tell_peer {
            let farewell = ExchangeMessage::Terminate {
                reason: stop.reason.clone(),
            };
            let _ = timeout(FAREWELL_TIMEOUT, self.link.send(&farewell)).await;
        }

        let state = self.manager.get(self.id)?.state;
        let outcome = match (&state, &stop.reason) {
            (
                ConnectionState::Exchanging,
                TerminationReason::ProtocolViolation | TerminationReason::LinkClosed,
            ) => ConnectionState::Aborted,
            (ConnectionState::Exchanging, _) => ConnectionState::Completed,
            _ => ConnectionState::Aborted,
        };

        if outcome == ConnectionState::Completed && !self.received.is_empty() {
            let store = self.manager.inner.profile_store.clone();
            match store.apply_insights(&self.received) {
                Ok(applied) => {
                    log::info!(
                        "Applied {} of {} insights from {}",
                        applied,
                        self.received.len(),
                        self.remote
                    );
                    if applied > 0 {
                        self.manager.inner.revisions.send_replace(store.revision());
                    }
                }
                Err(e) => log::warn!("Profile store refused insights: {}", e),
            }
        }

        match self.manager.finish(self.id, outcome, stop.reason, Utc::now()) {
            Ok(connection) => Some(connection),
            Err(e) => {
                log::debug!("Connection {} already retired: {}", self.id, e);
                None
            }
        }
    }
}

fn unexpected(message: &ExchangeMessage) -> Stop {
    log::debug!("Unexpected {} message", message.name());
    Stop::local(TerminationReason::ProtocolViolation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{InMemoryProfileStore, PersonalityProfile};
    use rstest::rstest;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sig(s: &str) -> NodeSignature {
        s.parse().unwrap()
    }

    fn manager(config: LifecycleConfig) -> ConnectionManager {
        let store = InMemoryProfileStore::new(PersonalityProfile::uniform("me", 0.5))
            .unwrap();
        ConnectionManager::new(
            config.clone(),
            AnalyzerConfig::default(),
            Arc::new(store),
            CooldownLedger::new(config.cooldown()),
            EncounterHistory::new(config.history_limit),
        )
    }

    fn open(m: &ConnectionManager, remote: &str) -> Connection {
        m.attempt(
            &sig("0000000000000000"),
            &sig(remote),
            TransportKind::Memory,
            Role::Initiator,
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn cap_is_checked_first() {
        let m = manager(LifecycleConfig {
            max_concurrent_connections: 2,
            ..LifecycleConfig::default()
        });
        open(&m, "aaaaaaaaaaaaaaaa");
        open(&m, "bbbbbbbbbbbbbbbb");
        let third = m.attempt(
            &sig("0000000000000000"),
            &sig("aaaaaaaaaaaaaaaa"),
            TransportKind::Memory,
            Role::Initiator,
            Utc::now(),
        );
        assert_eq!(third.unwrap_err(), Rejection::TooManyConnections);
        assert_eq!(m.active_count(), 2);
    }

    #[test]
    fn duplicate_remote_is_already_connecting() {
        let m = manager(LifecycleConfig::default());
        open(&m, "aaaaaaaaaaaaaaaa");
        let again = m.attempt(
            &sig("0000000000000000"),
            &sig("aaaaaaaaaaaaaaaa"),
            TransportKind::Memory,
            Role::Responder,
            Utc::now(),
        );
        assert_eq!(again.unwrap_err(), Rejection::AlreadyConnecting);
    }

    fn retry_at(
        m: &ConnectionManager,
        remote: &str,
        at: DateTime<Utc>,
    ) -> std::result::Result<Connection, Rejection> {
        m.attempt(
            &sig("0000000000000000"),
            &sig(remote),
            TransportKind::Memory,
            Role::Initiator,
            at,
        )
    }

    #[test]
    fn finished_connection_puts_remote_in_cooldown() {
        let m = manager(LifecycleConfig::default());
        let c = open(&m, "aaaaaaaaaaaaaaaa");
        let now = Utc::now();
        m.transition(c.id, ConnectionState::Handshaking, now).unwrap();
        m.transition(c.id, ConnectionState::Active, now).unwrap();
        let done = m
            .finish(c.id, ConnectionState::Aborted, TerminationReason::BelowFloor, now)
            .unwrap();
        assert_eq!(done.state, ConnectionState::Aborted);
        assert_eq!(m.active_count(), 0);
        assert_eq!(m.history(10).len(), 1);

        match retry_at(&m, "aaaaaaaaaaaaaaaa", now + chrono::Duration::seconds(1)) {
            Err(Rejection::InCooldown { until }) => {
                assert_eq!(until, now + chrono::Duration::seconds(600))
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(retry_at(&m, "aaaaaaaaaaaaaaaa", now + chrono::Duration::seconds(601)).is_ok());
    }

    #[rstest]
    #[case(TerminationReason::Timeout)]
    #[case(TerminationReason::LinkClosed)]
    #[case(TerminationReason::Rejected { rejection: Rejection::TooManyConnections })]
    #[case(TerminationReason::Rejected { rejection: Rejection::AlreadyConnecting })]
    fn failed_handshake_is_retried_after_short_cooldown(#[case] reason: TerminationReason) {
        let m = manager(LifecycleConfig::default());
        let c = open(&m, "aaaaaaaaaaaaaaaa");
        let now = Utc::now();
        m.transition(c.id, ConnectionState::Handshaking, now).unwrap();
        m.finish(c.id, ConnectionState::Aborted, reason, now).unwrap();

        match retry_at(&m, "aaaaaaaaaaaaaaaa", now + chrono::Duration::seconds(1)) {
            Err(Rejection::InCooldown { until }) => {
                assert_eq!(until, now + chrono::Duration::seconds(15))
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(retry_at(&m, "aaaaaaaaaaaaaaaa", now + chrono::Duration::seconds(16)).is_ok());
    }

    #[test]
    fn peer_already_cooling_us_gets_full_cooldown() {
        let m = manager(LifecycleConfig::default());
        let c = open(&m, "aaaaaaaaaaaaaaaa");
        let now = Utc::now();
        m.transition(c.id, ConnectionState::Handshaking, now).unwrap();
        let reason = TerminationReason::Rejected {
            rejection: Rejection::InCooldown { until: now },
        };
        m.finish(c.id, ConnectionState::Aborted, reason, now).unwrap();
        assert_eq!(
            m.cooldown_until(&sig("aaaaaaaaaaaaaaaa"), now),
            Some(now + chrono::Duration::seconds(600))
        );
    }

    #[test]
    fn huge_cooldown_saturates_instead_of_overflowing() {
        let config = LifecycleConfig {
            cooldown_secs: 10_000_000_000_000,
            ..LifecycleConfig::default()
        };
        assert!(config.validate().is_err());
        let m = manager(config);
        let c = open(&m, "aaaaaaaaaaaaaaaa");
        let now = DateTime::<Utc>::MAX_UTC - chrono::Duration::days(1);
        m.transition(c.id, ConnectionState::Handshaking, now).unwrap();
        m.transition(c.id, ConnectionState::Active, now).unwrap();
        m.finish(c.id, ConnectionState::Aborted, TerminationReason::BelowFloor, now)
            .unwrap();
        assert_eq!(
            m.cooldown_until(&sig("aaaaaaaaaaaaaaaa"), now),
            Some(DateTime::<Utc>::MAX_UTC)
        );
    }

    #[test]
    fn expired_cooldowns_do_not_pile_up() {
        let m = manager(LifecycleConfig {
            cooldown_secs: 1,
            retry_cooldown_secs: 1,
            ..LifecycleConfig::default()
        });
        let start = Utc::now();
        for i in 0..100u64 {
            let at = start + chrono::Duration::seconds(10 * i as i64);
            let remote = format!("{:016x}", i + 1);
            let c = retry_at(&m, &remote, at).unwrap();
            m.transition(c.id, ConnectionState::Handshaking, at).unwrap();
            m.finish(c.id, ConnectionState::Aborted, TerminationReason::Timeout, at)
                .unwrap();
        }
        assert_eq!(lock(&m.inner.table).cooldowns.len(), 1);
    }

    #[test]
    fn completed_requires_exchanging() {
        let m = manager(LifecycleConfig::default());
        let c = open(&m, "aaaaaaaaaaaaaaaa");
        let now = Utc::now();
        m.transition(c.id, ConnectionState::Handshaking, now).unwrap();
        assert!(matches!(
            m.finish(c.id, ConnectionState::Completed, TerminationReason::Complete, now),
            Err(VibeError::InvalidTransition { .. })
        ));
        // still tracked after the refused step
        assert_eq!(m.active_count(), 1);
    }

    #[test]
    fn force_finish_follows_state() {
        let m = manager(LifecycleConfig::default());
        let now = Utc::now();
        let a = open(&m, "aaaaaaaaaaaaaaaa");
        let b = open(&m, "bbbbbbbbbbbbbbbb");
        for next in [
            ConnectionState::Handshaking,
            ConnectionState::Active,
            ConnectionState::Exchanging,
        ] {
            m.transition(a.id, next, now).unwrap();
        }
        m.transition(b.id, ConnectionState::Handshaking, now).unwrap();
        m.force_finish_all(now);

        let history = m.history(10);
        let outcome_of = |id| {
            history
                .iter()
                .find(|r| r.connection == id)
                .map(|r| r.outcome)
                .unwrap()
        };
        assert_eq!(outcome_of(a.id), ConnectionState::Completed);
        assert_eq!(outcome_of(b.id), ConnectionState::Aborted);
        assert_eq!(m.active_count(), 0);
    }

    struct Counter(AtomicUsize);

    impl ConnectionSubscriber for Counter {
        fn get_id(&self) -> String {
            "counter".to_owned()
        }

        fn notify_state(&self, _event: ConnectionEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn subscribers_see_every_change() {
        let m = manager(LifecycleConfig::default());
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        m.subscribe(counter.clone());
        let c = open(&m, "aaaaaaaaaaaaaaaa");
        m.transition(c.id, ConnectionState::Handshaking, Utc::now())
            .unwrap();
        m.finish(
            c.id,
            ConnectionState::Aborted,
            TerminationReason::LinkClosed,
            Utc::now(),
        )
        .unwrap();
        assert_eq!(counter.0.load(Ordering::SeqCst), 3);

        m.unsubscribe(counter.clone());
        open(&m, "bbbbbbbbbbbbbbbb");
        assert_eq!(counter.0.load(Ordering::SeqCst), 3);
    }
}
