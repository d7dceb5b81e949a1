use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::dimensions::{DIMENSIONS, DIMENSION_COUNT};
use crate::errors::{Result, VibeError};
use crate::fingerprint::VibeFingerprint;

/// How much two nodes share with each other, ordered from least to most.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum DepthTier {
    Surface,
    Light,
    Moderate,
    Deep,
}

impl DepthTier {
    pub const DEEP_THRESHOLD: f64 = 0.8;
    pub const MODERATE_THRESHOLD: f64 = 0.5;
    pub const LIGHT_THRESHOLD: f64 = 0.2;

    pub fn from_score(score: f64) -> Self {
        if score >= Self::DEEP_THRESHOLD {
            DepthTier::Deep
        } else if score >= Self::MODERATE_THRESHOLD {
            DepthTier::Moderate
        } else if score >= Self::LIGHT_THRESHOLD {
            DepthTier::Light
        } else {
            DepthTier::Surface
        }
    }

    /// Maximum number of insights one side may send at this tier.
    pub fn insight_budget(&self) -> usize {
        match self {
            DepthTier::Surface => 1,
            DepthTier::Light => 2,
            DepthTier::Moderate => 3,
            DepthTier::Deep => 5,
        }
    }

    /// Fraction of a received delta a node is willing to absorb.
    pub fn learning_rate(&self) -> f64 {
        match self {
            DepthTier::Surface => 0.1,
            DepthTier::Light => 0.25,
            DepthTier::Moderate => 0.5,
            DepthTier::Deep => 1.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DepthTier::Surface => "surface",
            DepthTier::Light => "light",
            DepthTier::Moderate => "moderate",
            DepthTier::Deep => "deep",
        }
    }
}

impl Display for DepthTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionDelta {
    pub dimension: String,
    pub local: f64,
    pub remote: f64,
    /// `remote - local`
    pub delta: f64,
}

impl DimensionDelta {
    pub fn magnitude(&self) -> f64 {
        self.delta.abs()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompatibilityResult {
    pub score: f64,
    pub learning_opportunities: Vec<DimensionDelta>,
    pub recommended_tier: DepthTier,
}

impl CompatibilityResult {
    /// Sanity check for results received from a peer.
    pub fn validate(&self) -> Result<()> {
        if !self.score.is_finite() || !(0.0..=1.0).contains(&self.score) {
            return Err(VibeError::Protocol(format!(
                "compatibility score out of range: {}",
                self.score
            )));
        }
        if self.learning_opportunities.len() > DIMENSION_COUNT {
            return Err(VibeError::Protocol(
                "too many learning opportunities".to_owned(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Smallest gap considered worth learning from.
    pub min_delta: f64,
    /// Largest gap still considered learnable.
    pub max_delta: f64,
    /// Scores below this end the connection before any exchange.
    pub compatibility_floor: f64,
    /// Upper bound of the depth this node asks for.
    pub max_share_depth: f64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            min_delta: 0.1,
            max_delta: 0.6,
            compatibility_floor: 0.05,
            max_share_depth: 1.0,
        }
    }
}

impl AnalyzerConfig {
    pub fn validate(&self) -> Result<()> {
        let unit = 0.0..=1.0;
        if !unit.contains(&self.min_delta)
            || !unit.contains(&self.max_delta)
            || self.min_delta > self.max_delta
        {
            return Err(VibeError::Config(format!(
                "analyzer delta band [{}, {}] is invalid",
                self.min_delta, self.max_delta
            )));
        }
        if !unit.contains(&self.compatibility_floor) {
            return Err(VibeError::Config(
                "analyzer.compatibility_floor must be within [0, 1]".to_owned(),
            ));
        }
        if !unit.contains(&self.max_share_depth) {
            return Err(VibeError::Config(
                "analyzer.max_share_depth must be within [0, 1]".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Pure scoring of two fingerprints.
#[derive(Debug, Clone, Default)]
pub struct CompatibilityAnalyzer {
    config: AnalyzerConfig,
}

impl CompatibilityAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    pub fn score(
        &self,
        local: &VibeFingerprint,
        remote: &VibeFingerprint,
    ) -> CompatibilityResult {
        self.score_values(&local.values(), &remote.values())
    }

    pub fn score_values(
        &self,
        local: &[f64; DIMENSION_COUNT],
        remote: &[f64; DIMENSION_COUNT],
    ) -> CompatibilityResult {
        let score = squared_cosine(local, remote);

        let mut learning_opportunities: Vec<DimensionDelta> = DIMENSIONS
            .iter()
            .zip(local.iter().zip(remote.iter()))
            .map(|(name, (l, r))| DimensionDelta {
                dimension: name.to_string(),
                local: *l,
                remote: *r,
                delta: r - l,
            })
            .filter(|d| {
                let m = d.magnitude();
                m >= self.config.min_delta && m <= self.config.max_delta
            })
            .collect();
        // stable sort keeps dimension order among equal gaps
        learning_opportunities
            .sort_by(|a, b| b.magnitude().total_cmp(&a.magnitude()));

        CompatibilityResult {
            score,
            learning_opportunities,
            recommended_tier: DepthTier::from_score(score),
        }
    }
}

/// `|<a, b>|^2 / (|a|^2 |b|^2)`, zero when either vector is zero.
fn squared_cosine(a: &[f64], b: &[f64]) -> f64 {
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f64 = a.iter().map(|x| x * x).sum();
    let norm_b: f64 = b.iter().map(|x| x * x).sum();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    let score = (dot * dot) / (norm_a * norm_b);
    if score.is_finite() {
        score.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0.95, DepthTier::Deep)]
    #[case(0.8, DepthTier::Deep)]
    #[case(0.79, DepthTier::Moderate)]
    #[case(0.5, DepthTier::Moderate)]
    #[case(0.2, DepthTier::Light)]
    #[case(0.19, DepthTier::Surface)]
    #[case(0.0, DepthTier::Surface)]
    fn tier_bands(#[case] score: f64, #[case] tier: DepthTier) {
        assert_eq!(DepthTier::from_score(score), tier);
    }

    #[test]
    fn identical_vectors_score_one() {
        let analyzer = CompatibilityAnalyzer::default();
        let v = [0.4; DIMENSION_COUNT];
        let result = analyzer.score_values(&v, &v);
        assert!((result.score - 1.0).abs() < 1e-12);
        assert_eq!(result.recommended_tier, DepthTier::Deep);
        assert!(result.learning_opportunities.is_empty());
    }

    #[test]
    fn zero_vector_scores_zero() {
        let analyzer = CompatibilityAnalyzer::default();
        let result = analyzer
            .score_values(&[0.0; DIMENSION_COUNT], &[0.7; DIMENSION_COUNT]);
        assert_eq!(result.score, 0.0);
        assert_eq!(result.recommended_tier, DepthTier::Surface);
    }

    #[test]
    fn orthogonal_vectors_score_zero() {
        let analyzer = CompatibilityAnalyzer::default();
        let mut a = [0.0; DIMENSION_COUNT];
        let mut b = [0.0; DIMENSION_COUNT];
        a[0] = 1.0;
        b[1] = 1.0;
        assert_eq!(analyzer.score_values(&a, &b).score, 0.0);
    }

    #[test]
    fn score_is_symmetric() {
        let analyzer = CompatibilityAnalyzer::default();
        let a = [0.1, 0.9, 0.3, 0.5, 0.2, 0.8, 0.4, 0.6, 0.7, 0.3, 0.5, 0.1];
        let b = [0.6, 0.2, 0.4, 0.9, 0.1, 0.3, 0.5, 0.8, 0.2, 0.7, 0.4, 0.9];
        let ab = analyzer.score_values(&a, &b).score;
        let ba = analyzer.score_values(&b, &a).score;
        assert!((ab - ba).abs() < 1e-12);
    }

    #[test]
    fn opportunities_within_band_sorted_by_gap() {
        let analyzer = CompatibilityAnalyzer::default();
        let local = [0.5; DIMENSION_COUNT];
        let mut remote = [0.5; DIMENSION_COUNT];
        remote[0] = 0.55; // below band
        remote[1] = 0.8; // 0.3
        remote[2] = 0.0; // 0.5
        remote[3] = 1.0; // 0.5, later in dimension order
        remote[4] = 0.35; // 0.15
        let mut far_local = local;
        far_local[5] = 0.0;
        remote[5] = 0.9; // 0.9, above band

        let result = analyzer.score_values(&far_local, &remote);
        let names: Vec<_> = result
            .learning_opportunities
            .iter()
            .map(|d| d.dimension.as_str())
            .collect();
        assert_eq!(
            names,
            vec![
                "location_adventurousness",
                "authenticity_preference",
                "community_orientation",
                "trust_network_reliance",
            ]
        );
        assert!((result.learning_opportunities[0].delta + 0.5).abs() < 1e-12);
    }

    #[test]
    fn peer_results_are_validated() {
        let bad = CompatibilityResult {
            score: 1.5,
            learning_opportunities: vec![],
            recommended_tier: DepthTier::Deep,
        };
        assert!(bad.validate().is_err());
    }
}
