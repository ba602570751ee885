use async_trait::async_trait;

use crate::cache::error::TransportError;

use super::envelope::MessageEnvelope;

/// Carries envelopes to the other nodes of the farm.
///
/// Delivery is at most once per send; nothing is retried.
#[async_trait]
pub trait FarmTransport: Send + Sync {
    /// Send to every peer. Returns how many peers accepted the envelope.
    async fn send(&self, envelope: &MessageEnvelope) -> Result<usize, TransportError>;

    /// Whether there is anyone to send to.
    fn has_peers(&self) -> bool;
}

/// Transport of a single-server install.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTransport;

#[async_trait]
impl FarmTransport for NoopTransport {
    async fn send(&self, _envelope: &MessageEnvelope) -> Result<usize, TransportError> {
        Ok(0)
    }

    fn has_peers(&self) -> bool {
        false
    }
}
