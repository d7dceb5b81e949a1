use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use vibe_link::codec::{self, WireFormat};
use vibe_link::connection::TerminationReason;
use vibe_link::cooldown::CooldownLedger;
use vibe_link::dimensions::DIMENSION_COUNT;
use vibe_link::history::EncounterHistory;
use vibe_link::transport::DistanceBucket;
use vibe_link::{
    AnalyzerConfig, Connection, ConnectionEvent, ConnectionManager,
    ConnectionState, ConnectionSubscriber, DepthTier, Engine, EngineConfig,
    Ether, InMemoryProfileStore, LifecycleConfig, MemoryTransport,
    NodeSignature, PersonalityProfile, ProfileStore, Proximity, Rejection,
    Role, TransportAdapter, TransportKind, VibeFingerprint,
};

fn fast_config() -> EngineConfig {
    let mut config = EngineConfig {
        transports: vec![TransportKind::Memory],
        ..EngineConfig::default()
    };
    config.lifecycle.connect_interval_ms = 50;
    config.lifecycle.shutdown_grace_ms = 200;
    config.discovery.restart_backoff_ms = 50;
    config
}

fn store(owner: &str, values: [f64; DIMENSION_COUNT]) -> Arc<InMemoryProfileStore> {
    Arc::new(
        InMemoryProfileStore::new(PersonalityProfile::new(owner, values)).unwrap(),
    )
}

async fn engine_on(
    ether: &Ether,
    config: EngineConfig,
    store: Arc<InMemoryProfileStore>,
) -> Engine {
    let adapter: Arc<dyn TransportAdapter> = Arc::new(MemoryTransport::new(ether));
    Engine::start(config, store, vec![adapter]).await.unwrap()
}

/// Poll `condition` until it holds or five seconds pass.
async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..250 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

fn sig(s: &str) -> NodeSignature {
    s.parse().unwrap()
}

/// Keeps the last connection that reached a terminal state.
#[derive(Default)]
struct Finished(Mutex<Option<Connection>>);

impl Finished {
    fn get(&self) -> Option<Connection> {
        self.0.lock().unwrap().clone()
    }
}

impl ConnectionSubscriber for Finished {
    fn get_id(&self) -> String {
        "finished".to_owned()
    }

    fn notify_state(&self, event: ConnectionEvent) {
        if event.connection.state.is_terminal() {
            *self.0.lock().unwrap() = Some(event.connection);
        }
    }
}

#[test_log::test(tokio::test)]
async fn two_compatible_nodes_complete_an_exchange() {
    let ether = Ether::new();
    let mut theirs = [0.5; DIMENSION_COUNT];
    theirs[0] = 0.9;
    theirs[1] = 0.2;
    let alice_store = store("alice", [0.5; DIMENSION_COUNT]);
    let bob_store = store("bob", theirs);
    let alice = engine_on(&ether, fast_config(), alice_store.clone()).await;
    let bob = engine_on(&ether, fast_config(), bob_store.clone()).await;
    let alice_seen = Arc::new(Finished::default());
    let bob_seen = Arc::new(Finished::default());
    alice.subscribe(alice_seen.clone());
    bob.subscribe(bob_seen.clone());

    assert!(
        eventually(|| alice.history(10).len() == 1 && bob.history(10).len() == 1)
            .await,
        "no encounter recorded"
    );

    let a = &alice.history(10)[0];
    let b = &bob.history(10)[0];
    assert_eq!(a.outcome, ConnectionState::Completed);
    assert_eq!(b.outcome, ConnectionState::Completed);
    assert_eq!(a.effective_depth, b.effective_depth);
    assert!(a.score.unwrap() >= 0.8 && b.score.unwrap() >= 0.8);

    for seen in [&alice_seen, &bob_seen] {
        let connection = seen.get().expect("no terminal event");
        let local = connection.local_result.as_ref().unwrap();
        let remote = connection.remote_result.as_ref().unwrap();
        assert_eq!(local.recommended_tier, DepthTier::Deep);
        assert_eq!(remote.recommended_tier, DepthTier::Deep);

        let desired = connection.desired_depth.unwrap();
        let remote_desired = connection.remote_desired_depth.unwrap();
        let shallower = if desired <= remote_desired {
            desired
        } else {
            remote_desired
        };
        assert_eq!(connection.effective_depth, Some(shallower));
        assert_eq!(a.effective_depth, Some(shallower));
    }
    assert!(alice.connections().is_empty());
    assert!(bob.connections().is_empty());
    assert!(a.insights_received > 0 && b.insights_received > 0);
    assert!(alice_store.revision() > 0 && bob_store.revision() > 0);

    // both sides are cooling down now, no second encounter follows
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(alice.history(10).len(), 1);
    assert_eq!(bob.history(10).len(), 1);

    alice.shutdown().await.unwrap();
    bob.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn orthogonal_profiles_stop_below_the_floor() {
    let ether = Ether::new();
    let mut config = fast_config();
    config.analyzer.compatibility_floor = 0.99;
    let mut a = [0.0; DIMENSION_COUNT];
    let mut b = [0.0; DIMENSION_COUNT];
    a[..6].copy_from_slice(&[1.0; 6]);
    b[6..].copy_from_slice(&[1.0; 6]);
    let alice = engine_on(&ether, config.clone(), store("alice", a)).await;
    let bob = engine_on(&ether, config, store("bob", b)).await;

    assert!(eventually(|| alice.history(10).len() == 1 && bob.history(10).len() == 1).await);
    for record in alice.history(10).into_iter().chain(bob.history(10)) {
        assert_eq!(record.outcome, ConnectionState::Aborted);
        assert_eq!(record.insights_received, 0);
    }
    assert!(alice
        .history(10)
        .into_iter()
        .chain(bob.history(10))
        .any(|r| r.termination == Some(TerminationReason::BelowFloor)));

    alice.shutdown().await.unwrap();
    bob.shutdown().await.unwrap();
}

#[test]
fn cap_rejects_the_third_peer() {
    let config = LifecycleConfig {
        max_concurrent_connections: 2,
        ..LifecycleConfig::default()
    };
    let manager = ConnectionManager::new(
        config.clone(),
        AnalyzerConfig::default(),
        store("me", [0.5; DIMENSION_COUNT]),
        CooldownLedger::new(config.cooldown()),
        EncounterHistory::new(10),
    );
    let local = sig("0000000000000000");
    let now = Utc::now();
    for remote in ["aaaaaaaaaaaaaaaa", "bbbbbbbbbbbbbbbb"] {
        manager
            .attempt(&local, &sig(remote), TransportKind::Memory, Role::Initiator, now)
            .unwrap();
    }
    assert_eq!(
        manager.attempt(
            &local,
            &sig("cccccccccccccccc"),
            TransportKind::Memory,
            Role::Initiator,
            now
        ),
        Err(Rejection::TooManyConnections)
    );
    assert_eq!(manager.active_count(), 2);
}

#[test_log::test(tokio::test)]
async fn expired_and_malformed_adverts_are_dropped_while_scanning_goes_on() {
    let ether = Ether::new();
    let engine = engine_on(&ether, fast_config(), store("me", [0.5; DIMENSION_COUNT])).await;

    let now = Utc::now().timestamp() as u32;
    let stale = VibeFingerprint::from_levels([128; DIMENSION_COUNT], now - 900, now - 600)
        .unwrap();
    ether.inject(
        sig("1111111111111111"),
        codec::encode(&stale, WireFormat::Compact),
        Proximity::Distance(DistanceBucket::Immediate),
    );
    ether.inject(
        sig("2222222222222222"),
        b"VB\x01 not a fingerprint".to_vec(),
        Proximity::Unknown,
    );
    let fresh = VibeFingerprint::from_levels([128; DIMENSION_COUNT], now, now + 300)
        .unwrap();
    // injected stations cannot be dialled; with the lowest signature the
    // dialling is left to them
    ether.inject(
        sig("0000000000000000"),
        codec::encode(&fresh, WireFormat::Compact),
        Proximity::SignalStrength(-60),
    );

    assert!(
        eventually(|| {
            let stats = engine.stats();
            stats.expired > 0 && stats.malformed > 0 && stats.accepted > 0
        })
        .await
    );
    let candidates: Vec<String> = engine
        .candidates()
        .into_iter()
        .map(|c| c.signature.to_string())
        .collect();
    assert!(candidates.contains(&"0000000000000000".to_owned()));
    assert!(!candidates.contains(&"1111111111111111".to_owned()));
    assert!(!candidates.contains(&"2222222222222222".to_owned()));

    engine.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn disabling_discovery_clears_candidates() {
    let ether = Ether::new();
    let engine = engine_on(&ether, fast_config(), store("me", [0.5; DIMENSION_COUNT])).await;
    let now = Utc::now().timestamp() as u32;
    let fresh = VibeFingerprint::from_levels([90; DIMENSION_COUNT], now, now + 300)
        .unwrap();
    ether.inject(
        sig("0000000000000000"),
        codec::encode(&fresh, WireFormat::Compact),
        Proximity::Unknown,
    );
    assert!(eventually(|| !engine.candidates().is_empty()).await);

    engine.disable_discovery().await.unwrap();
    assert!(engine.candidates().is_empty());
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(engine.candidates().is_empty());

    engine.enable_discovery().await.unwrap();
    assert!(eventually(|| !engine.candidates().is_empty()).await);
    engine.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn denied_transport_is_reported_and_engine_stays_idle() {
    let ether = Ether::new();
    let adapter: Arc<dyn TransportAdapter> = Arc::new(
        MemoryTransport::new(&ether)
            .with_capability(vibe_link::Capability::PermissionDenied),
    );
    let engine = Engine::start(
        fast_config(),
        store("me", [0.5; DIMENSION_COUNT]),
        vec![adapter],
    )
    .await
    .unwrap();
    assert_eq!(
        engine.capabilities().get(&TransportKind::Memory),
        Some(&vibe_link::Capability::PermissionDenied)
    );
    assert!(engine.candidates().is_empty());
    engine.shutdown().await.unwrap();
}
