//! Asymmetric depth resolution: both sides propose, the shallower wins.

use serde::{Deserialize, Serialize};

use crate::compatibility::{CompatibilityResult, DepthTier};

#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
#[serde(from = "f64", into = "f64")]
pub struct InteractionDepth(f64);

impl InteractionDepth {
    pub const NONE: InteractionDepth = InteractionDepth(0.0);
    pub const FULL: InteractionDepth = InteractionDepth(1.0);

    /// Clamp into `[0, 1]`; NaN becomes zero.
    pub fn new(value: f64) -> Self {
        if value.is_nan() {
            return Self::NONE;
        }
        InteractionDepth(value.clamp(0.0, 1.0))
    }

    pub fn value(&self) -> f64 {
        self.0
    }

    pub fn tier(&self) -> DepthTier {
        DepthTier::from_score(self.0)
    }
}

impl From<f64> for InteractionDepth {
    fn from(value: f64) -> Self {
        InteractionDepth::new(value)
    }
}

impl From<InteractionDepth> for f64 {
    fn from(value: InteractionDepth) -> Self {
        value.0
    }
}

/// Effective depth of a connection. Symmetric in its arguments.
pub fn resolve(a: InteractionDepth, b: InteractionDepth) -> InteractionDepth {
    InteractionDepth(a.0.min(b.0))
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DepthResolution {
    pub local_desired: InteractionDepth,
    pub remote_desired: InteractionDepth,
    pub effective: InteractionDepth,
}

impl DepthResolution {
    pub fn effective_tier(&self) -> DepthTier {
        self.effective.tier()
    }

    /// Rate at which this node absorbs insights. Follows the local node's
    /// own wish, not the negotiated depth.
    pub fn local_learning_rate(&self) -> f64 {
        self.local_desired.tier().learning_rate()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DepthResolver {
    floor: f64,
    max_share_depth: InteractionDepth,
}

impl DepthResolver {
    pub fn new(floor: f64, max_share_depth: f64) -> Self {
        Self {
            floor,
            max_share_depth: InteractionDepth::new(max_share_depth),
        }
    }

    pub fn desired(&self, result: &CompatibilityResult) -> InteractionDepth {
        resolve(InteractionDepth::new(result.score), self.max_share_depth)
    }

    pub fn passes_floor(&self, result: &CompatibilityResult) -> bool {
        result.score >= self.floor
    }

    pub fn resolve(
        &self,
        local_desired: InteractionDepth,
        remote_desired: InteractionDepth,
    ) -> DepthResolution {
        DepthResolution {
            local_desired,
            remote_desired,
            effective: resolve(local_desired, remote_desired),
        }
    }
}
