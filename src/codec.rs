//! Wire representations of a [`VibeFingerprint`].
//!
//! Compact binary layout, 23 bytes:
//!
//! ```text
//! [magic "VB": 2][version: 1][dimension levels: 12][issued_at u32 BE: 4][expires_at u32 BE: 4]
//! ```
//!
//! The text-safe form is the compact form in URL-safe base64 without
//! padding. The structured form is a JSON document keyed by dimension name
//! that also carries the content hash.

use std::collections::BTreeMap;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dimensions::{index_of, DIMENSIONS, DIMENSION_COUNT};
use crate::errors::{Result, VibeError};
use crate::fingerprint::{FingerprintHash, VibeFingerprint};

pub const MAGIC: [u8; 2] = *b"VB";
pub const WIRE_VERSION: u8 = 1;
pub const COMPACT_LEN: usize = MAGIC.len() + 1 + DIMENSION_COUNT + 4 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireFormat {
    Compact,
    TextSafe,
    Structured,
}

impl WireFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            WireFormat::Compact => "compact",
            WireFormat::TextSafe => "text_safe",
            WireFormat::Structured => "structured",
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct StructuredFingerprint {
    version: u8,
    dimensions: BTreeMap<String, u8>,
    issued_at: u32,
    expires_at: u32,
    hash: FingerprintHash,
}

pub fn encode(fingerprint: &VibeFingerprint, format: WireFormat) -> Vec<u8> {
    match format {
        WireFormat::Compact => encode_compact(fingerprint).to_vec(),
        WireFormat::TextSafe => URL_SAFE_NO_PAD
            .encode(encode_compact(fingerprint))
            .into_bytes(),
        WireFormat::Structured => {
            let dimensions: serde_json::Map<String, serde_json::Value> =
                DIMENSIONS
                    .iter()
                    .zip(fingerprint.levels().iter())
                    .map(|(name, level)| (name.to_string(), (*level).into()))
                    .collect();
            serde_json::json!({
                "version": WIRE_VERSION,
                "dimensions": dimensions,
                "issued_at": fingerprint.issued_at_secs(),
                "expires_at": fingerprint.expires_at_secs(),
                "hash": fingerprint.hash().to_hex(),
            })
            .to_string()
            .into_bytes()
        }
    }
}

/// Decode a payload and reject it if it expired before `now`.
pub fn decode(
    bytes: &[u8],
    format: WireFormat,
    now: DateTime<Utc>,
) -> Result<VibeFingerprint> {
    let fingerprint = match format {
        WireFormat::Compact => decode_compact(bytes)?,
        WireFormat::TextSafe => {
            let raw = URL_SAFE_NO_PAD.decode(bytes).map_err(|e| {
                VibeError::MalformedPayload(format!("base64: {}", e))
            })?;
            decode_compact(&raw)?
        }
        WireFormat::Structured => decode_structured(bytes)?,
    };

    if fingerprint.is_expired(now) {
        log::debug!(
            "Fingerprint {} expired at {}",
            fingerprint.hash(),
            fingerprint.expires_at()
        );
        return Err(VibeError::Expired(fingerprint.expires_at()));
    }
    Ok(fingerprint)
}

fn encode_compact(fingerprint: &VibeFingerprint) -> [u8; COMPACT_LEN] {
    let mut out = [0u8; COMPACT_LEN];
    out[..2].copy_from_slice(&MAGIC);
    out[2] = WIRE_VERSION;
    out[3..3 + DIMENSION_COUNT].copy_from_slice(fingerprint.levels());
    let ts = 3 + DIMENSION_COUNT;
    out[ts..ts + 4].copy_from_slice(&fingerprint.issued_at_secs().to_be_bytes());
    out[ts + 4..].copy_from_slice(&fingerprint.expires_at_secs().to_be_bytes());
    out
}

fn decode_compact(bytes: &[u8]) -> Result<VibeFingerprint> {
    if bytes.len() != COMPACT_LEN {
        return Err(VibeError::MalformedPayload(format!(
            "expected {} bytes, got {}",
            COMPACT_LEN,
            bytes.len()
        )));
    }
    if bytes[..2] != MAGIC {
        return Err(VibeError::MalformedPayload("bad magic".to_owned()));
    }
    check_version(bytes[2])?;

    let mut levels = [0u8; DIMENSION_COUNT];
    levels.copy_from_slice(&bytes[3..3 + DIMENSION_COUNT]);
    let ts = 3 + DIMENSION_COUNT;
    let issued_at = read_u32(&bytes[ts..ts + 4]);
    let expires_at = read_u32(&bytes[ts + 4..ts + 8]);
    VibeFingerprint::from_levels(levels, issued_at, expires_at)
}

fn decode_structured(bytes: &[u8]) -> Result<VibeFingerprint> {
    let doc: StructuredFingerprint = serde_json::from_slice(bytes)
        .map_err(|e| VibeError::MalformedPayload(format!("json: {}", e)))?;
    check_version(doc.version)?;

    let mut levels = [0u8; DIMENSION_COUNT];
    let mut seen = [false; DIMENSION_COUNT];
    for (name, level) in &doc.dimensions {
        let index = index_of(name).ok_or_else(|| {
            VibeError::MalformedPayload(format!("unknown dimension {}", name))
        })?;
        levels[index] = *level;
        seen[index] = true;
    }
    if let Some(missing) = seen.iter().position(|s| !s) {
        return Err(VibeError::MalformedPayload(format!(
            "missing dimension {}",
            DIMENSIONS[missing]
        )));
    }

    let fingerprint =
        VibeFingerprint::from_levels(levels, doc.issued_at, doc.expires_at)?;
    if fingerprint.hash() != doc.hash {
        return Err(VibeError::MalformedPayload(
            "content hash mismatch".to_owned(),
        ));
    }
    Ok(fingerprint)
}

fn check_version(version: u8) -> Result<()> {
    if version != WIRE_VERSION {
        return Err(VibeError::MalformedPayload(format!(
            "unsupported version {}",
            version
        )));
    }
    Ok(())
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    u32::from_be_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(secs, 0).unwrap()
    }

    fn sample() -> VibeFingerprint {
        let mut levels = [0u8; DIMENSION_COUNT];
        for (i, level) in levels.iter_mut().enumerate() {
            *level = (i * 20) as u8;
        }
        VibeFingerprint::from_levels(levels, 1_000, 1_300).unwrap()
    }

    #[rstest]
    #[case(WireFormat::Compact)]
    #[case(WireFormat::TextSafe)]
    #[case(WireFormat::Structured)]
    fn encode_then_decode_is_identity(#[case] format: WireFormat) {
        let fp = sample();
        let decoded = decode(&encode(&fp, format), format, at(1_100)).unwrap();
        assert_eq!(decoded, fp);
    }

    #[test]
    fn compact_layout() {
        let bytes = encode(&sample(), WireFormat::Compact);
        assert_eq!(bytes.len(), 23);
        assert_eq!(&bytes[..3], &[0x56, 0x42, 0x01]);
        assert_eq!(bytes[4], 20);
        assert_eq!(&bytes[15..19], &1_000u32.to_be_bytes());
        assert_eq!(&bytes[19..], &1_300u32.to_be_bytes());
    }

    #[test]
    fn text_safe_is_ascii() {
        let bytes = encode(&sample(), WireFormat::TextSafe);
        assert!(bytes
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || *b == b'-' || *b == b'_'));
    }

    #[rstest]
    #[case(WireFormat::Compact)]
    #[case(WireFormat::TextSafe)]
    #[case(WireFormat::Structured)]
    fn expired_payload_is_rejected(#[case] format: WireFormat) {
        let bytes = encode(&sample(), format);
        assert!(decode(&bytes, format, at(1_300)).is_ok());
        assert!(matches!(
            decode(&bytes, format, at(1_301)),
            Err(VibeError::Expired(_))
        ));
    }

    #[test]
    fn compact_rejects_bad_structure() {
        let good = encode(&sample(), WireFormat::Compact);

        let mut bad_magic = good.clone();
        bad_magic[0] = b'X';
        let mut bad_version = good.clone();
        bad_version[2] = 2;
        let truncated = &good[..22];
        let mut inverted = good.clone();
        inverted[15..19].copy_from_slice(&2_000u32.to_be_bytes());

        for payload in [&bad_magic[..], &bad_version[..], truncated, &inverted[..]] {
            assert!(matches!(
                decode(payload, WireFormat::Compact, at(1_100)),
                Err(VibeError::MalformedPayload(_))
            ));
        }
    }

    #[test]
    fn text_safe_rejects_garbage() {
        assert!(matches!(
            decode(b"!!not base64!!", WireFormat::TextSafe, at(0)),
            Err(VibeError::MalformedPayload(_))
        ));
    }

    #[test]
    fn structured_verifies_hash_and_dimensions() {
        let bytes = encode(&sample(), WireFormat::Structured);
        let mut doc: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        let mut tampered = doc.clone();
        tampered["dimensions"]["crowd_tolerance"] = 7.into();
        let tampered = serde_json::to_vec(&tampered).unwrap();
        assert!(matches!(
            decode(&tampered, WireFormat::Structured, at(1_100)),
            Err(VibeError::MalformedPayload(_))
        ));

        doc["dimensions"]
            .as_object_mut()
            .unwrap()
            .remove("overall_energy");
        let missing = serde_json::to_vec(&doc).unwrap();
        assert!(matches!(
            decode(&missing, WireFormat::Structured, at(1_100)),
            Err(VibeError::MalformedPayload(_))
        ));

        assert!(decode(b"{}", WireFormat::Structured, at(0)).is_err());
    }
}
