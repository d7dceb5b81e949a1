use core::{fmt::Display, str::FromStr};

use blake3::Hasher;
use hex::encode;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{Result, VibeError};

/// Length of a node signature in bytes before hex encoding.
pub const SIGNATURE_LEN: usize = 8;

/// Ephemeral identifier of a node participating in discovery.
///
/// Computed with [`blake3`] from a process-local salt, the owner id and the
/// current rotation epoch, then truncated. It cannot be mapped back to the
/// owner and changes every epoch.
#[derive(
    Debug, Clone, PartialEq, Eq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct NodeSignature(String);

impl NodeSignature {
    pub fn derive(salt: &[u8], owner_id: &str, epoch: u64) -> Self {
        log::trace!("Deriving node signature for epoch {}", epoch);

        let mut hasher = Hasher::new();
        hasher.update(salt);
        hasher.update(owner_id.as_bytes());
        hasher.update(&epoch.to_be_bytes());
        let hash = hasher.finalize();
        NodeSignature(encode(&hash.as_bytes()[..SIGNATURE_LEN]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for NodeSignature {
    type Err = VibeError;

    fn from_str(s: &str) -> Result<Self> {
        let valid = s.len() == SIGNATURE_LEN * 2
            && s.bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !valid {
            return Err(VibeError::MalformedPayload(format!(
                "invalid node signature {:?}",
                s
            )));
        }
        Ok(NodeSignature(s.to_owned()))
    }
}

impl TryFrom<String> for NodeSignature {
    type Error = VibeError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<NodeSignature> for String {
    fn from(value: NodeSignature) -> Self {
        value.0
    }
}

impl Display for NodeSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn generate() -> Self {
        ConnectionId(Uuid::new_v4())
    }
}

impl Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
