//! Contract Negotiation State Definitions
//!
//! State IDs are stable for persistent storage as SMALLINT.
//! Terminal states: CONFIRMED (40), TERMINATED (-10)

use std::fmt;

use serde::{Deserialize, Serialize};

/// Contract Negotiation states
///
/// Consumer and provider each drive their own copy of the machine:
///
/// ```text
/// INITIAL → REQUESTED ⇄ OFFERED → AGREED → CONFIRMED
///               ↓           ↓        ↓
///                      TERMINATED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
#[repr(i16)]
pub enum NegotiationState {
    /// Record created locally, initial request not yet sent
    Initial = 0,

    /// The consumer's offer is on the table, awaiting the provider
    Requested = 10,

    /// A counter-offer is on the table, awaiting the receiving party
    Offered = 20,

    /// Terms accepted; agreement created (provider) or awaited (consumer)
    Agreed = 30,

    /// Terminal: agreement acknowledged by both parties
    Confirmed = 40,

    /// Terminal: negotiation ended by failure, rejection, or cancellation
    Terminated = -10,
}

impl NegotiationState {
    /// Check if this is a terminal state (no more transitions accepted)
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NegotiationState::Confirmed | NegotiationState::Terminated
        )
    }

    /// Get the numeric state ID for persistent storage
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    /// Convert from a persisted state ID
    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(NegotiationState::Initial),
            10 => Some(NegotiationState::Requested),
            20 => Some(NegotiationState::Offered),
            30 => Some(NegotiationState::Agreed),
            40 => Some(NegotiationState::Confirmed),
            -10 => Some(NegotiationState::Terminated),
            _ => None,
        }
    }

    /// Get human-readable state name
    pub fn as_str(&self) -> &'static str {
        match self {
            NegotiationState::Initial => "INITIAL",
            NegotiationState::Requested => "REQUESTED",
            NegotiationState::Offered => "OFFERED",
            NegotiationState::Agreed => "AGREED",
            NegotiationState::Confirmed => "CONFIRMED",
            NegotiationState::Terminated => "TERMINATED",
        }
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<i16> for NegotiationState {
    type Error = ();

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        NegotiationState::from_id(value).ok_or(())
    }
}

/// Why a negotiation reached TERMINATED
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TerminationReason {
    /// The policy gate denied the offer
    PolicyRejected,
    /// The offer referenced no known contract definition, policy, or asset
    InvalidOffer,
    /// Offer/counter-offer rounds exceeded the configured bound
    MaxRoundsExceeded,
    /// The counterparty never acknowledged the agreement
    AckTimeout,
    /// A retryable failure exceeded the configured retry bound
    RetriesExhausted,
    /// Explicit cancellation by the owning party
    Cancelled,
    /// The counterparty sent a termination message
    CounterpartyTerminated,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::PolicyRejected => "POLICY_REJECTED",
            TerminationReason::InvalidOffer => "INVALID_OFFER",
            TerminationReason::MaxRoundsExceeded => "MAX_ROUNDS_EXCEEDED",
            TerminationReason::AckTimeout => "ACK_TIMEOUT",
            TerminationReason::RetriesExhausted => "RETRIES_EXHAUSTED",
            TerminationReason::Cancelled => "CANCELLED",
            TerminationReason::CounterpartyTerminated => "COUNTERPARTY_TERMINATED",
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(NegotiationState::Confirmed.is_terminal());
        assert!(NegotiationState::Terminated.is_terminal());

        assert!(!NegotiationState::Initial.is_terminal());
        assert!(!NegotiationState::Requested.is_terminal());
        assert!(!NegotiationState::Offered.is_terminal());
        assert!(!NegotiationState::Agreed.is_terminal());
    }

    #[test]
    fn test_state_id_roundtrip() {
        let states = [
            NegotiationState::Initial,
            NegotiationState::Requested,
            NegotiationState::Offered,
            NegotiationState::Agreed,
            NegotiationState::Confirmed,
            NegotiationState::Terminated,
        ];

        for state in states {
            let id = state.id();
            let recovered = NegotiationState::from_id(id).unwrap();
            assert_eq!(state, recovered);
        }
    }

    #[test]
    fn test_invalid_state_id() {
        assert!(NegotiationState::from_id(999).is_none());
        assert!(NegotiationState::from_id(-999).is_none());
    }

    #[test]
    fn test_display() {
        assert_eq!(NegotiationState::Initial.to_string(), "INITIAL");
        assert_eq!(NegotiationState::Confirmed.to_string(), "CONFIRMED");
        assert_eq!(
            TerminationReason::MaxRoundsExceeded.to_string(),
            "MAX_ROUNDS_EXCEEDED"
        );
    }
}
