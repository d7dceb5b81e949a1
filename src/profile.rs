//! Personality profiles and the store that owns them.
//!
//! The engine never persists profiles itself. It asks a [`ProfileStore`] for
//! snapshots and hands it the learning insights accepted from completed
//! connections.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{ensure_at_most, saturating_add, window_secs, MAX_WINDOW_SECS};
use crate::dimensions::{index_of, DIMENSIONS, DIMENSION_COUNT};
use crate::errors::{Result, VibeError};

/// Raw, device-local personality profile. Never leaves the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonalityProfile {
    pub owner_id: String,
    pub dimensions: BTreeMap<String, f64>,
}

impl PersonalityProfile {
    pub fn new(owner_id: impl Into<String>, values: [f64; DIMENSION_COUNT]) -> Self {
        let dimensions = DIMENSIONS
            .iter()
            .zip(values.iter())
            .map(|(name, value)| (name.to_string(), *value))
            .collect();
        Self {
            owner_id: owner_id.into(),
            dimensions,
        }
    }

    pub fn uniform(owner_id: impl Into<String>, value: f64) -> Self {
        Self::new(owner_id, [value; DIMENSION_COUNT])
    }

    pub fn value(&self, dimension: &str) -> Option<f64> {
        self.dimensions.get(dimension).copied()
    }

    /// Check the profile and return its values in dimension order.
    pub fn validate(&self) -> Result<[f64; DIMENSION_COUNT]> {
        if self.owner_id.trim().is_empty() {
            return Err(VibeError::InvalidProfile(
                "owner id is empty".to_owned(),
            ));
        }
        if let Some(unknown) = self
            .dimensions
            .keys()
            .find(|name| index_of(name).is_none())
        {
            return Err(VibeError::InvalidProfile(format!(
                "unknown dimension {}",
                unknown
            )));
        }

        let mut values = [0.0; DIMENSION_COUNT];
        for (i, name) in DIMENSIONS.iter().enumerate() {
            let value = self.value(name).ok_or_else(|| {
                VibeError::InvalidProfile(format!("missing dimension {}", name))
            })?;
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(VibeError::InvalidProfile(format!(
                    "dimension {} out of range: {}",
                    name, value
                )));
            }
            values[i] = value;
        }
        Ok(values)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Local,
    Remote,
}

/// A single bounded adjustment to one profile dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningInsight {
    pub dimension: String,
    pub delta: f64,
    pub confidence: f64,
    pub provenance: Provenance,
}

impl LearningInsight {
    pub fn validate(&self) -> Result<usize> {
        let index = index_of(&self.dimension).ok_or_else(|| {
            VibeError::Protocol(format!(
                "insight for unknown dimension {}",
                self.dimension
            ))
        })?;
        if !self.delta.is_finite() || !(-1.0..=1.0).contains(&self.delta) {
            return Err(VibeError::Protocol(format!(
                "insight delta out of range: {}",
                self.delta
            )));
        }
        if !self.confidence.is_finite()
            || !(0.0..=1.0).contains(&self.confidence)
        {
            return Err(VibeError::Protocol(format!(
                "insight confidence out of range: {}",
                self.confidence
            )));
        }
        Ok(index)
    }
}

/// Contract of the external component owning the durable profile.
pub trait ProfileStore: Send + Sync {
    /// Snapshot of the current profile.
    fn current_profile(&self) -> Result<PersonalityProfile>;

    /// Apply accepted insights and return how many actually changed the
    /// profile. The store may refuse part of the batch.
    fn apply_insights(&self, insights: &[LearningInsight]) -> Result<usize>;

    /// Monotonic counter bumped on every profile change.
    fn revision(&self) -> u64;
}

/// Limits a store applies to incoming insights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InsightPolicy {
    /// Largest change a single insight may make.
    pub max_delta: f64,
    /// Insights beyond this count in one batch are ignored.
    pub max_batch: usize,
    /// Largest total change of one dimension inside `drift_window_secs`.
    pub max_drift: f64,
    pub drift_window_secs: u64,
}

impl Default for InsightPolicy {
    fn default() -> Self {
        Self {
            max_delta: 0.1,
            max_batch: 5,
            max_drift: 0.2,
            drift_window_secs: 3600,
        }
    }
}

impl InsightPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.max_batch == 0 {
            return Err(VibeError::Config(
                "insights.max_batch must be positive".to_owned(),
            ));
        }
        if !self.max_delta.is_finite() || self.max_delta < 0.0 {
            return Err(VibeError::Config(format!(
                "insights.max_delta must not be negative, got {}",
                self.max_delta
            )));
        }
        if !self.max_drift.is_finite() || self.max_drift < 0.0 {
            return Err(VibeError::Config(format!(
                "insights.max_drift must not be negative, got {}",
                self.max_drift
            )));
        }
        ensure_at_most(
            "insights.drift_window_secs",
            self.drift_window_secs,
            MAX_WINDOW_SECS,
        )
    }
}

const DRIFT_TOLERANCE: f64 = 1e-9;

struct StoreState {
    profile: PersonalityProfile,
    revision: u64,
    drift: HashMap<usize, VecDeque<(DateTime<Utc>, f64)>>,
}

/// Reference [`ProfileStore`] holding the profile in memory.
pub struct InMemoryProfileStore {
    policy: InsightPolicy,
    state: Mutex<StoreState>,
}

impl InMemoryProfileStore {
    pub fn new(profile: PersonalityProfile) -> Result<Self> {
        Self::with_policy(profile, InsightPolicy::default())
    }

    pub fn with_policy(
        profile: PersonalityProfile,
        policy: InsightPolicy,
    ) -> Result<Self> {
        profile.validate()?;
        policy.validate()?;
        Ok(Self {
            policy,
            state: Mutex::new(StoreState {
                profile,
                revision: 0,
                drift: HashMap::new(),
            }),
        })
    }

    pub fn policy(&self) -> &InsightPolicy {
        &self.policy
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply with an explicit clock, used by the trait method.
    pub fn apply_insights_at(
        &self,
        insights: &[LearningInsight],
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let window = window_secs(self.policy.drift_window_secs);
        let mut state = self.lock();
        let mut applied = 0;

        for insight in insights.iter().take(self.policy.max_batch) {
            let index = match insight.validate() {
                Ok(index) => index,
                Err(e) => {
                    log::debug!("Refusing insight: {}", e);
                    continue;
                }
            };

            let history = state.drift.entry(index).or_default();
            while history
                .front()
                .map_or(false, |(at, _)| saturating_add(*at, window) <= now)
            {
                history.pop_front();
            }
            let drifted: f64 = history.iter().map(|(_, d)| d.abs()).sum();
            let allowance = self.policy.max_drift - drifted;
            if allowance <= DRIFT_TOLERANCE {
                log::debug!("Drift budget exhausted for {}", DIMENSIONS[index]);
                continue;
            }

            let step = (insight.delta * insight.confidence)
                .clamp(-self.policy.max_delta, self.policy.max_delta)
                .clamp(-allowance, allowance);
            if step == 0.0 {
                continue;
            }

            let name = DIMENSIONS[index];
            let current = state.profile.value(name).unwrap_or(0.0);
            let next = (current + step).clamp(0.0, 1.0);
            let moved = next - current;
            if moved == 0.0 {
                continue;
            }
            state.profile.dimensions.insert(name.to_owned(), next);
            state
                .drift
                .entry(index)
                .or_default()
                .push_back((now, moved));
            applied += 1;
        }

        if applied > 0 {
            state.revision += 1;
            log::info!(
                "Applied {} insights, profile revision {}",
                applied,
                state.revision
            );
        }
        Ok(applied)
    }
}

impl ProfileStore for InMemoryProfileStore {
    fn current_profile(&self) -> Result<PersonalityProfile> {
        Ok(self.lock().profile.clone())
    }

    fn apply_insights(&self, insights: &[LearningInsight]) -> Result<usize> {
        self.apply_insights_at(insights, Utc::now())
    }

    fn revision(&self) -> u64 {
        self.lock().revision
    }
}
