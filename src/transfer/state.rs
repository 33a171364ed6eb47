//! Transfer Process State Definitions
//!
//! State IDs are stable for persistent storage as SMALLINT.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Transfer Process states
///
/// ```text
/// REQUESTED → PROVISIONING → PROVISIONED → IN_PROGRESS → COMPLETED
///      ↓            ↓             ↓             ↓            ↓
///                       TERMINATED ──────────────→ DEPROVISIONING → DEPROVISIONED
/// ```
///
/// DEPROVISIONING/DEPROVISIONED are a best-effort cleanup tail reachable
/// from PROVISIONED, COMPLETED, and TERMINATED; a process already counts as
/// logically finished once it reaches COMPLETED or TERMINATED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
#[repr(i16)]
pub enum TransferState {
    /// Request validated and recorded
    Requested = 0,

    /// Data flow controller provisioning invoked (persist-before-call)
    Provisioning = 10,

    /// Resources provisioned, transfer not yet started
    Provisioned = 20,

    /// Data is moving
    InProgress = 30,

    /// Terminal: transfer completed successfully
    Completed = 40,

    /// Cleanup: releasing provisioned resources
    Deprovisioning = 50,

    /// Terminal: resources released
    Deprovisioned = 60,

    /// Terminal: transfer ended by failure or cancellation
    Terminated = -10,
}

impl TransferState {
    /// Check if the process is logically finished (data movement over,
    /// possibly still draining cleanup)
    #[inline]
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            TransferState::Completed
                | TransferState::Terminated
                | TransferState::Deprovisioning
                | TransferState::Deprovisioned
        )
    }

    /// Check if no further transition of any kind is accepted
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferState::Deprovisioned)
    }

    /// Get the numeric state ID for persistent storage
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    /// Convert from a persisted state ID
    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(TransferState::Requested),
            10 => Some(TransferState::Provisioning),
            20 => Some(TransferState::Provisioned),
            30 => Some(TransferState::InProgress),
            40 => Some(TransferState::Completed),
            50 => Some(TransferState::Deprovisioning),
            60 => Some(TransferState::Deprovisioned),
            -10 => Some(TransferState::Terminated),
            _ => None,
        }
    }

    /// Get human-readable state name
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferState::Requested => "REQUESTED",
            TransferState::Provisioning => "PROVISIONING",
            TransferState::Provisioned => "PROVISIONED",
            TransferState::InProgress => "IN_PROGRESS",
            TransferState::Completed => "COMPLETED",
            TransferState::Deprovisioning => "DEPROVISIONING",
            TransferState::Deprovisioned => "DEPROVISIONED",
            TransferState::Terminated => "TERMINATED",
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<i16> for TransferState {
    type Error = ();

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        TransferState::from_id(value).ok_or(())
    }
}

/// Why a transfer process reached TERMINATED
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferTerminationReason {
    /// The referenced agreement's validity window had elapsed
    AgreementExpired,
    /// Provisioning failed past the retry bound
    ProvisionFailed,
    /// Starting the data flow failed past the retry bound
    StartFailed,
    /// A retryable failure exceeded the configured retry bound
    RetriesExhausted,
    /// Explicit cancellation by the owning party
    Cancelled,
}

impl TransferTerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferTerminationReason::AgreementExpired => "AGREEMENT_EXPIRED",
            TransferTerminationReason::ProvisionFailed => "PROVISION_FAILED",
            TransferTerminationReason::StartFailed => "START_FAILED",
            TransferTerminationReason::RetriesExhausted => "RETRIES_EXHAUSTED",
            TransferTerminationReason::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for TransferTerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finished_states() {
        assert!(TransferState::Completed.is_finished());
        assert!(TransferState::Terminated.is_finished());
        assert!(TransferState::Deprovisioning.is_finished());
        assert!(TransferState::Deprovisioned.is_finished());

        assert!(!TransferState::Requested.is_finished());
        assert!(!TransferState::Provisioning.is_finished());
        assert!(!TransferState::Provisioned.is_finished());
        assert!(!TransferState::InProgress.is_finished());
    }

    #[test]
    fn test_state_id_roundtrip() {
        let states = [
            TransferState::Requested,
            TransferState::Provisioning,
            TransferState::Provisioned,
            TransferState::InProgress,
            TransferState::Completed,
            TransferState::Deprovisioning,
            TransferState::Deprovisioned,
            TransferState::Terminated,
        ];

        for state in states {
            let id = state.id();
            let recovered = TransferState::from_id(id).unwrap();
            assert_eq!(state, recovered);
        }
    }

    #[test]
    fn test_invalid_state_id() {
        assert!(TransferState::from_id(999).is_none());
        assert!(TransferState::from_id(-999).is_none());
    }

    #[test]
    fn test_display() {
        assert_eq!(TransferState::Requested.to_string(), "REQUESTED");
        assert_eq!(TransferState::InProgress.to_string(), "IN_PROGRESS");
        assert_eq!(
            TransferTerminationReason::AgreementExpired.to_string(),
            "AGREEMENT_EXPIRED"
        );
    }
}
