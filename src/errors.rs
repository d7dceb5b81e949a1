use std::{str::Utf8Error, time::SystemTimeError};

use chrono::{DateTime, Utc};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, VibeError>;

#[derive(Error, Debug)]
pub enum VibeError {
    #[error("Invalid profile: {0}")]
    InvalidProfile(String),
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),
    #[error("Fingerprint expired at {0}")]
    Expired(DateTime<Utc>),
    #[error("Transport {0} is not supported on this device")]
    TransportUnsupported(String),
    #[error("Transport {0} permission denied")]
    PermissionDenied(String),
    #[error("Transient transport failure: {0}")]
    Transient(String),
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("Protocol violation: {0}")]
    Protocol(String),
    #[error("Link closed")]
    LinkClosed,
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },
    #[error("Unknown connection: {0}")]
    UnknownConnection(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parsing error")]
    Parse,
    #[error("Storage error: {0} {1}")]
    Storage(String, String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VibeError {
    /// Errors after which a transport adapter is considered unusable for
    /// the rest of the process lifetime.
    pub fn is_fatal_for_adapter(&self) -> bool {
        matches!(
            self,
            VibeError::TransportUnsupported(_) | VibeError::PermissionDenied(_)
        )
    }

    /// Errors that only drop the offending candidate or message.
    pub fn is_malformed_input(&self) -> bool {
        matches!(self, VibeError::MalformedPayload(_) | VibeError::Expired(_))
    }
}

impl From<Utf8Error> for VibeError {
    fn from(_: Utf8Error) -> Self {
        Self::Parse
    }
}

impl From<serde_json::Error> for VibeError {
    fn from(_: serde_json::Error) -> Self {
        Self::Parse
    }
}

impl From<toml::de::Error> for VibeError {
    fn from(value: toml::de::Error) -> Self {
        Self::Config(value.to_string())
    }
}

impl From<SystemTimeError> for VibeError {
    fn from(value: SystemTimeError) -> Self {
        Self::Other(anyhow::anyhow!(value.to_string()))
    }
}

impl From<Box<dyn std::error::Error>> for VibeError {
    fn from(e: Box<dyn std::error::Error>) -> Self {
        Self::Other(anyhow::anyhow!(e.to_string()))
    }
}
