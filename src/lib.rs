//! Proximity compatibility engine.
//!
//! Nearby devices advertise a short-lived, noised fingerprint of their
//! owner's personality profile. Two nodes that find each other score their
//! compatibility from their own side, agree on the shallower of the two
//! desired interaction depths and trade a bounded number of learning
//! insights before disconnecting and cooling down.
//!
//! [`Engine`] is the entry point; everything below it is usable on its own.

pub mod advertiser;
pub mod anonymizer;
pub mod codec;
pub mod compatibility;
pub mod config;
pub mod connection;
pub mod cooldown;
pub mod depth;
pub mod dimensions;
pub mod discovery;
pub mod engine;
mod errors;
pub mod exchange;
pub mod fingerprint;
pub mod history;
pub mod id;
pub mod lifecycle;
pub mod link;
pub mod profile;
pub mod storage;
pub mod transport;

pub use advertiser::{Advertiser, AdvertisingConfig};
pub use anonymizer::{PrivacyAnonymizer, PrivacyConfig};
pub use codec::WireFormat;
pub use compatibility::{
    AnalyzerConfig, CompatibilityAnalyzer, CompatibilityResult, DepthTier,
    DimensionDelta,
};
pub use config::EngineConfig;
pub use connection::{
    Connection, ConnectionState, Rejection, Role, TerminationReason,
};
pub use depth::{DepthResolution, DepthResolver, InteractionDepth};
pub use discovery::{DiscoveryConfig, DiscoveryManager, NodeDescriptor};
pub use engine::Engine;
pub use errors::{Result, VibeError};
pub use fingerprint::{FingerprintHash, VibeFingerprint};
pub use history::EncounterRecord;
pub use id::{ConnectionId, NodeSignature};
pub use lifecycle::{
    ConnectionEvent, ConnectionManager, ConnectionSubscriber, LifecycleConfig,
    LocalPresence,
};
pub use profile::{
    InMemoryProfileStore, InsightPolicy, LearningInsight, PersonalityProfile,
    ProfileStore, Provenance,
};
pub use transport::{
    Capability, Ether, MemoryTransport, Proximity, TransportAdapter,
    TransportKind,
};
