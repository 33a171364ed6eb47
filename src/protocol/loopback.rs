//! Loopback Protocol Network
//!
//! In-process message exchange between connector instances sharing a
//! routing table. Used by tests and demos; a production deployment swaps in
//! a channel implementation speaking the real wire protocol.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

use super::{InboundMessage, MessageReceiver, ProtocolChannel, ProtocolMessage, TransportError};
use crate::core_types::EndpointAddress;

/// Shared routing table mapping endpoint addresses to inbound queues
#[derive(Default)]
pub struct LoopbackNetwork {
    routes: DashMap<EndpointAddress, mpsc::Sender<InboundMessage>>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register an endpoint and take the receiving end of its inbound queue
    pub fn register(
        self: &Arc<Self>,
        endpoint: impl Into<EndpointAddress>,
        buffer: usize,
    ) -> MessageReceiver {
        let (tx, rx) = mpsc::channel(buffer);
        self.routes.insert(endpoint.into(), tx);
        MessageReceiver::new(rx)
    }

    /// Outbound channel that stamps `local` as the sender endpoint
    pub fn channel(self: &Arc<Self>, local: impl Into<EndpointAddress>) -> LoopbackChannel {
        LoopbackChannel {
            network: Arc::clone(self),
            local: local.into(),
        }
    }
}

/// [`ProtocolChannel`] bound to one local endpoint of a [`LoopbackNetwork`]
pub struct LoopbackChannel {
    network: Arc<LoopbackNetwork>,
    local: EndpointAddress,
}

#[async_trait]
impl ProtocolChannel for LoopbackChannel {
    async fn send(
        &self,
        endpoint: &EndpointAddress,
        message: ProtocolMessage,
    ) -> Result<(), TransportError> {
        let tx = self
            .network
            .routes
            .get(endpoint)
            .map(|route| route.value().clone())
            .ok_or_else(|| TransportError::Unreachable(endpoint.clone()))?;

        debug!(
            from = %self.local,
            to = %endpoint,
            kind = message.kind(),
            correlation_id = message.correlation_id(),
            "Delivering loopback message"
        );

        tx.send(InboundMessage {
            sender: self.local.clone(),
            message,
        })
        .await
        .map_err(|_| TransportError::SendFailed(format!("inbound queue closed: {endpoint}")))
    }
}
