use chrono::{DateTime, Duration, Utc};
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};

use crate::config::{ensure_at_most, MAX_WINDOW_SECS};
use crate::dimensions::DIMENSION_COUNT;
use crate::errors::{Result, VibeError};
use crate::fingerprint::VibeFingerprint;
use crate::id::NodeSignature;
use crate::profile::PersonalityProfile;

const SALT_LEN: usize = 32;

/// Differential-privacy parameters of the anonymizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivacyConfig {
    /// Privacy budget. Smaller means noisier fingerprints.
    pub epsilon: f64,
    pub sensitivity: f64,
    /// Absolute bound of the noise added to a single dimension.
    pub noise_bound: f64,
    pub fingerprint_ttl_secs: u64,
    pub signature_rotation_secs: u64,
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            epsilon: 0.5,
            sensitivity: 0.02,
            noise_bound: 0.08,
            fingerprint_ttl_secs: 300,
            signature_rotation_secs: 900,
        }
    }
}

impl PrivacyConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.epsilon.is_finite() || self.epsilon <= 0.0 {
            return Err(VibeError::Config(format!(
                "privacy.epsilon must be positive, got {}",
                self.epsilon
            )));
        }
        if !self.sensitivity.is_finite() || self.sensitivity < 0.0 {
            return Err(VibeError::Config(format!(
                "privacy.sensitivity must not be negative, got {}",
                self.sensitivity
            )));
        }
        if !(0.0..=1.0).contains(&self.noise_bound) {
            return Err(VibeError::Config(format!(
                "privacy.noise_bound must be within [0, 1], got {}",
                self.noise_bound
            )));
        }
        if self.fingerprint_ttl_secs == 0
            || self.fingerprint_ttl_secs > u32::MAX as u64
        {
            return Err(VibeError::Config(
                "privacy.fingerprint_ttl_secs out of range".to_owned(),
            ));
        }
        if self.signature_rotation_secs == 0 {
            return Err(VibeError::Config(
                "privacy.signature_rotation_secs must be positive".to_owned(),
            ));
        }
        ensure_at_most(
            "privacy.signature_rotation_secs",
            self.signature_rotation_secs,
            MAX_WINDOW_SECS,
        )
    }

    pub fn fingerprint_ttl(&self) -> Duration {
        Duration::seconds(self.fingerprint_ttl_secs as i64)
    }

    /// Scale of the Laplace distribution, `sensitivity / epsilon`.
    pub fn noise_scale(&self) -> f64 {
        self.sensitivity / self.epsilon
    }
}

/// Turns a raw profile into a broadcast-safe fingerprint and derives the
/// rotating node signature.
///
/// The salt is drawn once per anonymizer, so signatures of the same owner
/// are unlinkable across processes.
#[derive(Debug, Clone)]
pub struct PrivacyAnonymizer {
    config: PrivacyConfig,
    salt: [u8; SALT_LEN],
}

impl PrivacyAnonymizer {
    pub fn new(config: PrivacyConfig) -> Result<Self> {
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        Self::with_salt(config, salt)
    }

    pub fn with_salt(config: PrivacyConfig, salt: [u8; SALT_LEN]) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, salt })
    }

    pub fn config(&self) -> &PrivacyConfig {
        &self.config
    }

    pub fn derive(
        &self,
        profile: &PersonalityProfile,
        now: DateTime<Utc>,
    ) -> Result<VibeFingerprint> {
        self.derive_with_rng(profile, now, &mut rand::thread_rng())
    }

    pub fn derive_with_rng<R: Rng + ?Sized>(
        &self,
        profile: &PersonalityProfile,
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> Result<VibeFingerprint> {
        let values = profile.validate()?;
        let scale = self.config.noise_scale();
        let bound = self.config.noise_bound;

        let mut noisy = [0.0; DIMENSION_COUNT];
        for (out, value) in noisy.iter_mut().zip(values.iter()) {
            let noise = laplace(rng, scale).clamp(-bound, bound);
            *out = (value + noise).clamp(0.0, 1.0);
        }

        let fingerprint = VibeFingerprint::new(
            noisy,
            now,
            now + self.config.fingerprint_ttl(),
        )?;
        log::debug!(
            "Derived fingerprint {} valid until {}",
            fingerprint.hash(),
            fingerprint.expires_at()
        );
        Ok(fingerprint)
    }

    /// Rotation epoch containing `now`.
    pub fn epoch(&self, now: DateTime<Utc>) -> u64 {
        now.timestamp().max(0) as u64 / self.config.signature_rotation_secs.max(1)
    }

    /// Start of the next rotation epoch.
    pub fn next_rotation(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let next = (self.epoch(now) + 1)
            .saturating_mul(self.config.signature_rotation_secs.max(1));
        i64::try_from(next)
            .ok()
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn node_signature(
        &self,
        profile: &PersonalityProfile,
        now: DateTime<Utc>,
    ) -> Result<NodeSignature> {
        if profile.owner_id.trim().is_empty() {
            return Err(VibeError::InvalidProfile(
                "owner id is empty".to_owned(),
            ));
        }
        Ok(NodeSignature::derive(
            &self.salt,
            &profile.owner_id,
            self.epoch(now),
        ))
    }
}

/// Sample of a zero-centred Laplace distribution by inverse CDF.
fn laplace<R: Rng + ?Sized>(rng: &mut R, scale: f64) -> f64 {
    if scale <= 0.0 || !scale.is_finite() {
        return 0.0;
    }
    let u: f64 = rng.gen_range(-0.5..0.5);
    -scale * u.signum() * (1.0 - 2.0 * u.abs()).ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn noise_stays_within_bound() {
        let anonymizer = PrivacyAnonymizer::new(PrivacyConfig::default()).unwrap();
        let profile = PersonalityProfile::uniform("owner", 0.5);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let fp = anonymizer
                .derive_with_rng(&profile, at(1_000), &mut rng)
                .unwrap();
            for value in fp.values() {
                // quantisation adds at most half a level
                assert!((value - 0.5).abs() <= 0.08 + 1.0 / 255.0);
            }
        }
    }

    #[test]
    fn derivation_is_deterministic_for_a_seed() {
        let anonymizer = PrivacyAnonymizer::new(PrivacyConfig::default()).unwrap();
        let profile = PersonalityProfile::uniform("owner", 0.3);
        let a = anonymizer
            .derive_with_rng(&profile, at(50), &mut StdRng::seed_from_u64(1))
            .unwrap();
        let b = anonymizer
            .derive_with_rng(&profile, at(50), &mut StdRng::seed_from_u64(1))
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_carries_ttl() {
        let anonymizer = PrivacyAnonymizer::new(PrivacyConfig {
            fingerprint_ttl_secs: 60,
            ..PrivacyConfig::default()
        })
        .unwrap();
        let fp = anonymizer
            .derive(&PersonalityProfile::uniform("owner", 0.9), at(100))
            .unwrap();
        assert_eq!(fp.issued_at(), at(100));
        assert_eq!(fp.expires_at(), at(160));
    }

    #[test]
    fn values_are_clipped_to_unit_range() {
        let anonymizer = PrivacyAnonymizer::new(PrivacyConfig {
            epsilon: 0.01,
            sensitivity: 1.0,
            noise_bound: 1.0,
            ..PrivacyConfig::default()
        })
        .unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let fp = anonymizer
            .derive_with_rng(
                &PersonalityProfile::uniform("owner", 1.0),
                at(10),
                &mut rng,
            )
            .unwrap();
        assert!(fp.values().iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn invalid_profile_is_rejected() {
        let anonymizer = PrivacyAnonymizer::new(PrivacyConfig::default()).unwrap();
        let mut profile = PersonalityProfile::uniform("owner", 0.5);
        profile.dimensions.remove("crowd_tolerance");
        assert!(matches!(
            anonymizer.derive(&profile, at(10)),
            Err(VibeError::InvalidProfile(_))
        ));
    }

    #[test]
    fn signature_rotates_with_epoch() {
        let anonymizer = PrivacyAnonymizer::with_salt(
            PrivacyConfig {
                signature_rotation_secs: 100,
                ..PrivacyConfig::default()
            },
            [9; SALT_LEN],
        )
        .unwrap();
        let profile = PersonalityProfile::uniform("owner", 0.5);
        let first = anonymizer.node_signature(&profile, at(1_000)).unwrap();
        let same = anonymizer.node_signature(&profile, at(1_099)).unwrap();
        let next = anonymizer.node_signature(&profile, at(1_100)).unwrap();
        assert_eq!(first, same);
        assert_ne!(first, next);
        assert_eq!(anonymizer.next_rotation(at(1_050)), at(1_100));
    }

    #[test]
    fn salts_make_signatures_unlinkable() {
        let profile = PersonalityProfile::uniform("owner", 0.5);
        let a = PrivacyAnonymizer::new(PrivacyConfig::default()).unwrap();
        let b = PrivacyAnonymizer::new(PrivacyConfig::default()).unwrap();
        assert_ne!(
            a.node_signature(&profile, at(10)).unwrap(),
            b.node_signature(&profile, at(10)).unwrap()
        );
    }

    #[test]
    fn config_validation() {
        assert!(PrivacyConfig::default().validate().is_ok());
        assert!(PrivacyConfig {
            epsilon: 0.0,
            ..PrivacyConfig::default()
        }
        .validate()
        .is_err());
        assert!(PrivacyConfig {
            fingerprint_ttl_secs: 0,
            ..PrivacyConfig::default()
        }
        .validate()
        .is_err());
    }
}
