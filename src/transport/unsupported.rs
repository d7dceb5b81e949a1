use std::time::Duration;

use async_trait::async_trait;
use futures::stream;

use super::{
    AdvertiseHandle, Capability, SightingStream, TransportAdapter,
    TransportAddress, TransportKind,
};
use crate::errors::Result;
use crate::id::NodeSignature;
use crate::link::PeerLink;

/// Stand-in for a transport that cannot be used on this device.
///
/// Keeps the kind it replaces so that capability reports stay meaningful.
#[derive(Debug, Clone)]
pub struct UnsupportedTransport {
    replaces: TransportKind,
    capability: Capability,
}

impl UnsupportedTransport {
    pub fn new(replaces: TransportKind, capability: Capability) -> Self {
        let capability = match capability {
            Capability::Available => Capability::Unsupported,
            other => other,
        };
        Self {
            replaces,
            capability,
        }
    }

    pub fn replaces(&self) -> TransportKind {
        self.replaces
    }
}

#[async_trait]
impl TransportAdapter for UnsupportedTransport {
    fn kind(&self) -> TransportKind {
        self.replaces
    }

    async fn probe(&self) -> Capability {
        self.capability.clone()
    }

    async fn advertise(
        &self,
        _signature: &NodeSignature,
        _payload: Vec<u8>,
        _ttl: Duration,
    ) -> Result<AdvertiseHandle> {
        Err(self.capability.to_error(self.replaces))
    }

    fn scan(&self) -> SightingStream {
        let error = self.capability.to_error(self.replaces);
        Box::pin(stream::once(async move { Err(error) }))
    }

    async fn connect(
        &self,
        _address: &TransportAddress,
    ) -> Result<Box<dyn PeerLink>> {
        Err(self.capability.to_error(self.replaces))
    }

    async fn accept(&self) -> Result<Box<dyn PeerLink>> {
        Err(self.capability.to_error(self.replaces))
    }
}
