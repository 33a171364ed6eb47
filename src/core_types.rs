//! Core types used throughout the connector
//!
//! Identifier newtypes and shared enums used by all modules.
//! Record keys (negotiations, transfer processes) are ULID-backed so they
//! sort by creation time and need no coordination between workers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Asset ID - identifier of a data asset offered by a provider.
///
/// Assigned by the provider's catalog; opaque to the engine.
pub type AssetId = String;

/// Policy ID - identifier of a usage policy in the policy registry.
pub type PolicyId = String;

/// Participant ID - stable identity of a connector party (provider or consumer).
pub type ParticipantId = String;

/// Agreement ID - identifier of a finalized contract agreement.
pub type AgreementId = String;

/// Offer ID - unique per negotiation round.
pub type OfferId = String;

/// Endpoint address - where a counterparty connector receives protocol messages.
///
/// Opaque to the engine; the protocol channel implementation interprets it.
pub type EndpointAddress = String;

/// Negotiation ID - ULID-based unique identifier for a negotiation record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NegotiationId(ulid::Ulid);

impl NegotiationId {
    /// Generate a new unique NegotiationId
    pub fn new() -> Self {
        Self(ulid::Ulid::new())
    }

    /// Get the inner ULID value
    pub fn inner(&self) -> ulid::Ulid {
        self.0
    }
}

impl Default for NegotiationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NegotiationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NegotiationId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(ulid::Ulid::from_string(s)?))
    }
}

/// Transfer ID - ULID-based unique identifier for a transfer process record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(ulid::Ulid);

impl TransferId {
    /// Generate a new unique TransferId
    pub fn new() -> Self {
        Self(ulid::Ulid::new())
    }

    /// Get the inner ULID value
    pub fn inner(&self) -> ulid::Ulid {
        self.0
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TransferId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(ulid::Ulid::from_string(s)?))
    }
}

/// Which side of a negotiation or transfer this record represents.
///
/// Provider and consumer each drive their own copy of the state machine;
/// the two copies are linked by the correlation id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Provider,
    Consumer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Provider => "PROVIDER",
            Role::Consumer => "CONSUMER",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiation_id_roundtrip() {
        let id = NegotiationId::new();
        let parsed: NegotiationId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_transfer_id_is_monotonic_enough() {
        let a = TransferId::new();
        let b = TransferId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn test_role_display() {
        assert_eq!(Role::Provider.to_string(), "PROVIDER");
        assert_eq!(Role::Consumer.to_string(), "CONSUMER");
    }
}
