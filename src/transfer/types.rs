//! Transfer Process Record
//!
//! The mutable record persisted by the transfer store, plus the destination
//! and provisioned-resource descriptors handed to the data flow controller.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::{TransferState, TransferTerminationReason};
use crate::core_types::{AgreementId, Role, TransferId};

/// Where the consumer wants the data delivered.
///
/// `kind` selects the data flow controller behavior (e.g. "http-push",
/// "s3", "file"); `properties` carry the kind-specific settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataDestination {
    pub kind: String,
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl DataDestination {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            properties: HashMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// A resource the data flow controller allocated during provisioning.
/// Referenced again at deprovision time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedResource {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl ProvisionedResource {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            properties: HashMap::new(),
        }
    }
}

/// Mutable transfer process record.
///
/// # Invariants
/// - Created only against an existing contract agreement.
/// - At most one non-finished process per agreement id (store-enforced).
/// - `provisioned_resources` is set during provisioning and cleared on
///   deprovisioning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferProcess {
    pub id: TransferId,
    pub agreement_id: AgreementId,
    pub role: Role,
    pub destination: DataDestination,
    pub state: TransferState,
    pub provisioned_resources: Vec<ProvisionedResource>,
    pub termination_reason: Option<TransferTerminationReason>,
    pub error_detail: Option<String>,
    pub state_entered_at: DateTime<Utc>,
    /// Earliest instant the dispatcher may pick this record up again
    pub next_attempt_at: DateTime<Utc>,
    pub retry_count: u32,
    /// Optimistic concurrency counter, bumped by every successful save
    pub version: u64,
}

impl TransferProcess {
    pub fn new(agreement_id: impl Into<AgreementId>, role: Role, destination: DataDestination) -> Self {
        let now = Utc::now();
        Self {
            id: TransferId::new(),
            agreement_id: agreement_id.into(),
            role,
            destination,
            state: TransferState::Requested,
            provisioned_resources: Vec::new(),
            termination_reason: None,
            error_detail: None,
            state_entered_at: now,
            next_attempt_at: now,
            retry_count: 0,
            version: 1,
        }
    }

    /// Enter a new state, resetting the retry counter and making the record
    /// immediately eligible for the dispatcher.
    pub fn transition_to(&mut self, state: TransferState) {
        let now = Utc::now();
        self.state = state;
        self.state_entered_at = now;
        self.next_attempt_at = now;
        self.retry_count = 0;
    }

    /// Terminate with a reason and optional detail
    pub fn transition_terminated(
        &mut self,
        reason: TransferTerminationReason,
        detail: Option<String>,
    ) {
        self.transition_to(TransferState::Terminated);
        self.termination_reason = Some(reason);
        self.error_detail = detail;
    }

    /// Keep the current state but push the next attempt out by `delay`,
    /// counting the retry.
    pub fn schedule_retry(&mut self, delay: Duration) {
        self.retry_count += 1;
        self.defer(delay);
    }

    /// Push the next attempt out without counting a retry
    pub fn defer(&mut self, delay: Duration) {
        self.next_attempt_at =
            Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);
    }

    pub fn has_provisioned_resources(&self) -> bool {
        !self.provisioned_resources.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_process_starts_requested() {
        let process = TransferProcess::new(
            "agreement-1",
            Role::Consumer,
            DataDestination::new("http-push").with_property("url", "https://sink.example"),
        );

        assert_eq!(process.state, TransferState::Requested);
        assert_eq!(process.agreement_id, "agreement-1");
        assert!(!process.has_provisioned_resources());
        assert_eq!(process.version, 1);
    }

    #[test]
    fn test_terminated_carries_reason() {
        let mut process =
            TransferProcess::new("agreement-1", Role::Provider, DataDestination::new("file"));
        process.transition_terminated(
            TransferTerminationReason::ProvisionFailed,
            Some("disk full".to_string()),
        );

        assert_eq!(process.state, TransferState::Terminated);
        assert_eq!(
            process.termination_reason,
            Some(TransferTerminationReason::ProvisionFailed)
        );
        assert_eq!(process.error_detail.as_deref(), Some("disk full"));
    }

    #[test]
    fn test_schedule_retry_counts_and_defers() {
        let mut process =
            TransferProcess::new("agreement-1", Role::Provider, DataDestination::new("file"));
        let before = process.next_attempt_at;
        process.schedule_retry(Duration::from_secs(10));

        assert_eq!(process.retry_count, 1);
        assert!(process.next_attempt_at > before);
    }
}
