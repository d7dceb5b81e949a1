//! The anonymized, expiring fingerprint: the only thing that leaves a device.

use core::fmt::Display;

use blake3::Hasher;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::dimensions::DIMENSION_COUNT;
use crate::errors::{Result, VibeError};

/// Number of quantisation steps of a dimension value.
pub const LEVEL_MAX: u8 = u8::MAX;

pub const HASH_LEN: usize = 16;

/// Truncated BLAKE3 digest over the canonical body of a fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FingerprintHash(pub [u8; HASH_LEN]);

impl FingerprintHash {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| {
            VibeError::MalformedPayload(format!("fingerprint hash: {}", e))
        })?;
        let bytes: [u8; HASH_LEN] = bytes.try_into().map_err(|_| {
            VibeError::MalformedPayload("fingerprint hash length".to_owned())
        })?;
        Ok(FingerprintHash(bytes))
    }
}

impl Display for FingerprintHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for FingerprintHash {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for FingerprintHash {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        FingerprintHash::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// An anonymized personality fingerprint.
///
/// Dimension values are stored quantised to one byte so that every wire
/// format reproduces the exact same value. Timestamps are whole seconds
/// that fit in an unsigned 32-bit field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VibeFingerprint {
    levels: [u8; DIMENSION_COUNT],
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    hash: FingerprintHash,
}

impl VibeFingerprint {
    /// Build a fingerprint from dimension values in `[0, 1]`.
    ///
    /// Values are rounded to the nearest level; sub-second precision of the
    /// timestamps is dropped.
    pub fn new(
        values: [f64; DIMENSION_COUNT],
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Self> {
        let mut levels = [0u8; DIMENSION_COUNT];
        for (level, value) in levels.iter_mut().zip(values.iter()) {
            if !value.is_finite() {
                return Err(VibeError::InvalidProfile(
                    "dimension value is not finite".to_owned(),
                ));
            }
            *level = quantise(*value);
        }
        Self::from_levels(
            levels,
            seconds_of(issued_at)?,
            seconds_of(expires_at)?,
        )
    }

    /// Build a fingerprint from its wire representation.
    pub fn from_levels(
        levels: [u8; DIMENSION_COUNT],
        issued_at: u32,
        expires_at: u32,
    ) -> Result<Self> {
        if expires_at <= issued_at {
            return Err(VibeError::MalformedPayload(format!(
                "expiry {} is not after issuance {}",
                expires_at, issued_at
            )));
        }
        let hash = content_hash(&levels, issued_at, expires_at);
        Ok(Self {
            levels,
            issued_at: timestamp(issued_at),
            expires_at: timestamp(expires_at),
            hash,
        })
    }

    pub fn levels(&self) -> &[u8; DIMENSION_COUNT] {
        &self.levels
    }

    pub fn value(&self, index: usize) -> f64 {
        self.levels
            .get(index)
            .map(|l| *l as f64 / LEVEL_MAX as f64)
            .unwrap_or(0.0)
    }

    pub fn values(&self) -> [f64; DIMENSION_COUNT] {
        let mut values = [0.0; DIMENSION_COUNT];
        for (i, value) in values.iter_mut().enumerate() {
            *value = self.value(i);
        }
        values
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn issued_at_secs(&self) -> u32 {
        self.issued_at.timestamp() as u32
    }

    pub fn expires_at_secs(&self) -> u32 {
        self.expires_at.timestamp() as u32
    }

    pub fn hash(&self) -> FingerprintHash {
        self.hash
    }

    /// A fingerprint past its expiry must be treated as absent.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    /// Time left before expiry, zero once expired.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).max(Duration::zero())
    }
}

fn quantise(value: f64) -> u8 {
    (value.clamp(0.0, 1.0) * LEVEL_MAX as f64).round() as u8
}

fn seconds_of(at: DateTime<Utc>) -> Result<u32> {
    u32::try_from(at.timestamp()).map_err(|_| {
        VibeError::InvalidProfile(format!(
            "timestamp {} does not fit the wire format",
            at
        ))
    })
}

fn timestamp(secs: u32) -> DateTime<Utc> {
    // Every u32 second count is a valid chrono timestamp.
    DateTime::<Utc>::from_timestamp(secs as i64, 0).unwrap_or_default()
}

pub(crate) fn content_hash(
    levels: &[u8; DIMENSION_COUNT],
    issued_at: u32,
    expires_at: u32,
) -> FingerprintHash {
    let mut hasher = Hasher::new();
    hasher.update(levels);
    hasher.update(&issued_at.to_be_bytes());
    hasher.update(&expires_at.to_be_bytes());
    let digest = hasher.finalize();
    let mut hash = [0u8; HASH_LEN];
    hash.copy_from_slice(&digest.as_bytes()[..HASH_LEN]);
    FingerprintHash(hash)
}
