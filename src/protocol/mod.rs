//! Inter-Connector Protocol
//!
//! Message types and the send/receive abstraction for the negotiation
//! handshake between two connectors. The concrete transport (HTTP, message
//! bus, in-process loopback) lives behind [`ProtocolChannel`]; the engine
//! only assumes sends are reliable and idempotent per message.

pub mod loopback;

pub use loopback::LoopbackNetwork;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::contract::{ContractAgreement, ContractOffer};
use crate::core_types::EndpointAddress;

/// Transport failure. Always treated as retryable by the managers; the
/// bounded send-retry count decides when to give up.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("send failed: {0}")]
    SendFailed(String),
}

/// Negotiation handshake messages.
///
/// `correlation_id` links the provider- and consumer-side records of the
/// same logical negotiation; it is assigned by the initiating consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ProtocolMessage {
    /// Consumer opens a negotiation with its initial offer
    Request {
        correlation_id: String,
        offer: ContractOffer,
        /// Where the provider should send replies
        callback: EndpointAddress,
    },
    /// Counter-offer, either direction
    Offer {
        correlation_id: String,
        offer: ContractOffer,
    },
    /// Consumer accepts the offer currently on the table
    Accept {
        correlation_id: String,
        offer_id: String,
    },
    /// Provider delivers the signed agreement
    Agreement {
        correlation_id: String,
        agreement: ContractAgreement,
    },
    /// Consumer acknowledges the agreement
    Ack { correlation_id: String },
    /// Either party ends the negotiation
    Terminate {
        correlation_id: String,
        reason: String,
    },
}

impl ProtocolMessage {
    pub fn correlation_id(&self) -> &str {
        match self {
            ProtocolMessage::Request { correlation_id, .. }
            | ProtocolMessage::Offer { correlation_id, .. }
            | ProtocolMessage::Accept { correlation_id, .. }
            | ProtocolMessage::Agreement { correlation_id, .. }
            | ProtocolMessage::Ack { correlation_id }
            | ProtocolMessage::Terminate { correlation_id, .. } => correlation_id,
        }
    }

    /// Message kind for logging
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolMessage::Request { .. } => "request",
            ProtocolMessage::Offer { .. } => "offer",
            ProtocolMessage::Accept { .. } => "accept",
            ProtocolMessage::Agreement { .. } => "agreement",
            ProtocolMessage::Ack { .. } => "ack",
            ProtocolMessage::Terminate { .. } => "terminate",
        }
    }
}

/// An inbound message paired with the endpoint it came from
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub sender: EndpointAddress,
    pub message: ProtocolMessage,
}

/// Outbound half of the protocol: deliver a message to a remote connector
#[async_trait]
pub trait ProtocolChannel: Send + Sync {
    async fn send(
        &self,
        endpoint: &EndpointAddress,
        message: ProtocolMessage,
    ) -> Result<(), TransportError>;
}

/// Inbound half of the protocol: a restartable sequence of messages
/// consumed by the dispatcher and fed to the negotiation manager.
pub struct MessageReceiver {
    rx: mpsc::Receiver<InboundMessage>,
}

impl MessageReceiver {
    pub fn new(rx: mpsc::Receiver<InboundMessage>) -> Self {
        Self { rx }
    }

    /// Try to receive a message (non-blocking)
    pub fn try_recv(&mut self) -> Option<InboundMessage> {
        self.rx.try_recv().ok()
    }

    /// Receive a message (blocking until available or closed)
    pub async fn recv(&mut self) -> Option<InboundMessage> {
        self.rx.recv().await
    }
}

/// Mock channel for testing
#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records every send; can be told to fail the next N sends.
    pub struct MockChannel {
        sent: Mutex<Vec<(EndpointAddress, ProtocolMessage)>>,
        fail_next: AtomicUsize,
    }

    impl MockChannel {
        pub fn new() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                fail_next: AtomicUsize::new(0),
            }
        }

        pub fn fail_next_sends(&self, count: usize) {
            self.fail_next.store(count, Ordering::SeqCst);
        }

        pub fn sent_count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }

        pub fn take_sent(&self) -> Vec<(EndpointAddress, ProtocolMessage)> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }

        pub fn last_sent(&self) -> Option<(EndpointAddress, ProtocolMessage)> {
            self.sent.lock().unwrap().last().cloned()
        }
    }

    #[async_trait]
    impl ProtocolChannel for MockChannel {
        async fn send(
            &self,
            endpoint: &EndpointAddress,
            message: ProtocolMessage,
        ) -> Result<(), TransportError> {
            let remaining = self.fail_next.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_next.store(remaining - 1, Ordering::SeqCst);
                return Err(TransportError::SendFailed("mock transport failure".into()));
            }

            self.sent.lock().unwrap().push((endpoint.clone(), message));
            Ok(())
        }
    }
}

#[cfg(test)]
pub use mock::MockChannel;
