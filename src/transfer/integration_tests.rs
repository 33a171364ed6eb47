//! Integration Tests for the Transfer Process
//!
//! The complete lifecycle against in-memory stores and the mock data flow
//! controller; dispatcher steps are driven by hand.

use std::sync::Arc;

use super::manager::{TransferError, TransferManager};
use super::state::{TransferState, TransferTerminationReason};
use super::store::TransferStore;
use super::types::DataDestination;
use crate::config::{RetryPolicy, TransferConfig};
use crate::contract::{ContractAgreement, ContractOffer};
use crate::core_types::{Role, TransferId};
use crate::dataflow::MockFlowController;
use crate::negotiation::state::NegotiationState;
use crate::negotiation::store::NegotiationStore;
use crate::negotiation::types::ContractNegotiation;
use crate::store::{InMemoryNegotiationStore, InMemoryTransferStore, StoreError};

fn fast_config() -> TransferConfig {
    TransferConfig {
        deprovision_backoff_ms: 1,
        recheck_interval_ms: 1,
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 5,
        backoff_base_ms: 1,
        backoff_max_ms: 4,
    }
}

struct TestHarness {
    manager: Arc<TransferManager>,
    store: Arc<InMemoryTransferStore>,
    negotiations: Arc<InMemoryNegotiationStore>,
    controller: Arc<MockFlowController>,
}

impl TestHarness {
    fn new() -> Self {
        Self::with_retry(fast_retry())
    }

    fn with_retry(retry: RetryPolicy) -> Self {
        let store = Arc::new(InMemoryTransferStore::new());
        let negotiations = Arc::new(InMemoryNegotiationStore::new());
        let controller = Arc::new(MockFlowController::new());

        let manager = Arc::new(TransferManager::new(
            store.clone(),
            negotiations.clone(),
            controller.clone(),
            fast_config(),
            retry,
        ));

        Self {
            manager,
            store,
            negotiations,
            controller,
        }
    }

    /// Plant a confirmed negotiation carrying an agreement with the given
    /// validity window; returns the agreement id.
    async fn seed_agreement(&self, validity: chrono::Duration) -> String {
        let offer = ContractOffer::new("A-1", "P-1", "provider-1", "consumer-1");
        let mut negotiation =
            ContractNegotiation::initiate(offer.clone(), "provider.internal".into());
        let agreement = ContractAgreement::new(offer, validity);
        let agreement_id = agreement.id.clone();
        negotiation.agreement = Some(agreement);
        negotiation.transition_to(NegotiationState::Confirmed);
        self.negotiations.create(negotiation).await.unwrap();
        agreement_id
    }

    /// One dispatcher-style pass: step the freshly loaded record
    async fn step(&self, id: &TransferId) -> TransferState {
        let record = self.store.find_by_id(id).await.unwrap();
        self.manager.step(record).await.unwrap().state
    }
}

fn destination() -> DataDestination {
    DataDestination::new("http-push").with_property("url", "https://sink.example/inbox")
}

#[tokio::test]
async fn test_happy_path_provisions_starts_and_completes() {
    let harness = TestHarness::new();
    let agreement_id = harness.seed_agreement(chrono::Duration::hours(1)).await;

    let id = harness
        .manager
        .initiate(&agreement_id, Role::Consumer, destination())
        .await
        .unwrap();

    // REQUESTED validates the window, enters PROVISIONING, and provisions
    assert_eq!(harness.step(&id).await, TransferState::Provisioned);
    let provisioned = harness.manager.get(&id).await.unwrap();
    assert!(provisioned.has_provisioned_resources());

    assert_eq!(harness.step(&id).await, TransferState::InProgress);

    // Completion signal from the controller side
    harness.manager.notify_completed(id).await.unwrap();
    let completed = harness.manager.get(&id).await.unwrap();
    assert_eq!(completed.state, TransferState::Completed);

    // Cleanup was queued automatically because resources exist
    assert_eq!(harness.manager.process_deprovision_requests().await, 1);
    assert_eq!(harness.step(&id).await, TransferState::Deprovisioned);
    let finished = harness.manager.get(&id).await.unwrap();
    assert!(!finished.has_provisioned_resources());

    assert_eq!(harness.controller.provision_count(), 1);
    assert_eq!(harness.controller.start_count(), 1);
    assert_eq!(harness.controller.deprovision_count(), 1);
}

#[tokio::test]
async fn test_provision_fails_twice_then_succeeds_within_bound() {
    let harness = TestHarness::new();
    let agreement_id = harness.seed_agreement(chrono::Duration::hours(1)).await;
    harness.controller.fail_next_provisions(2);

    let id = harness
        .manager
        .initiate(&agreement_id, Role::Consumer, destination())
        .await
        .unwrap();

    // Two retryable failures leave the record in PROVISIONING
    assert_eq!(harness.step(&id).await, TransferState::Provisioning);
    assert_eq!(harness.step(&id).await, TransferState::Provisioning);
    let retried = harness.manager.get(&id).await.unwrap();
    assert_eq!(retried.retry_count, 2);

    // Third attempt lands within the bound and succeeds
    assert_eq!(harness.step(&id).await, TransferState::Provisioned);
    assert_eq!(harness.controller.provision_count(), 3);
}

#[tokio::test]
async fn test_provision_retries_exhaust_to_terminated() {
    let harness = TestHarness::with_retry(RetryPolicy {
        max_retries: 2,
        backoff_base_ms: 1,
        backoff_max_ms: 2,
    });
    let agreement_id = harness.seed_agreement(chrono::Duration::hours(1)).await;
    harness.controller.fail_next_provisions(100);

    let id = harness
        .manager
        .initiate(&agreement_id, Role::Consumer, destination())
        .await
        .unwrap();

    assert_eq!(harness.step(&id).await, TransferState::Provisioning);
    assert_eq!(harness.step(&id).await, TransferState::Provisioning);
    assert_eq!(harness.step(&id).await, TransferState::Terminated);

    let terminated = harness.manager.get(&id).await.unwrap();
    assert_eq!(
        terminated.termination_reason,
        Some(TransferTerminationReason::ProvisionFailed)
    );
    assert!(terminated.error_detail.is_some());
}

#[tokio::test]
async fn test_expired_agreement_terminates_without_provisioning() {
    let harness = TestHarness::new();
    // Window already elapsed when the transfer is requested
    let agreement_id = harness.seed_agreement(chrono::Duration::hours(-1)).await;

    let id = harness
        .manager
        .initiate(&agreement_id, Role::Consumer, destination())
        .await
        .unwrap();

    assert_eq!(harness.step(&id).await, TransferState::Terminated);
    let terminated = harness.manager.get(&id).await.unwrap();
    assert_eq!(
        terminated.termination_reason,
        Some(TransferTerminationReason::AgreementExpired)
    );

    // No provisioning was attempted
    assert_eq!(harness.controller.provision_count(), 0);
}

#[tokio::test]
async fn test_missing_agreement_rejects_creation() {
    let harness = TestHarness::new();

    let result = harness
        .manager
        .initiate("no-such-agreement", Role::Consumer, destination())
        .await;
    assert!(matches!(result, Err(TransferError::AgreementNotFound(_))));
}

#[tokio::test]
async fn test_second_active_transfer_for_agreement_is_refused() {
    let harness = TestHarness::new();
    let agreement_id = harness.seed_agreement(chrono::Duration::hours(1)).await;

    let first = harness
        .manager
        .initiate(&agreement_id, Role::Consumer, destination())
        .await
        .unwrap();

    let conflict = harness
        .manager
        .initiate(&agreement_id, Role::Consumer, destination())
        .await;
    assert!(matches!(
        conflict,
        Err(TransferError::Store(StoreError::Conflict(_)))
    ));

    // Drive the first transfer to a finished state; a successor is then fine
    assert_eq!(harness.step(&first).await, TransferState::Provisioned);
    harness.manager.cancel(first);
    harness.manager.process_cancellations().await;

    harness
        .manager
        .initiate(&agreement_id, Role::Consumer, destination())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_cancel_after_provisioning_schedules_cleanup() {
    let harness = TestHarness::new();
    let agreement_id = harness.seed_agreement(chrono::Duration::hours(1)).await;

    let id = harness
        .manager
        .initiate(&agreement_id, Role::Consumer, destination())
        .await
        .unwrap();
    assert_eq!(harness.step(&id).await, TransferState::Provisioned);

    harness.manager.cancel(id);

    // Queued, not synchronous
    assert_eq!(
        harness.manager.get(&id).await.unwrap().state,
        TransferState::Provisioned
    );

    assert_eq!(harness.manager.process_cancellations().await, 1);
    let cancelled = harness.manager.get(&id).await.unwrap();
    assert_eq!(cancelled.state, TransferState::Terminated);
    assert_eq!(
        cancelled.termination_reason,
        Some(TransferTerminationReason::Cancelled)
    );

    // Resources were provisioned, so cleanup follows
    assert_eq!(harness.manager.process_deprovision_requests().await, 1);
    assert_eq!(harness.step(&id).await, TransferState::Deprovisioned);
}

#[tokio::test]
async fn test_start_failure_retries_then_succeeds() {
    let harness = TestHarness::new();
    let agreement_id = harness.seed_agreement(chrono::Duration::hours(1)).await;
    harness.controller.fail_next_starts(1);

    let id = harness
        .manager
        .initiate(&agreement_id, Role::Consumer, destination())
        .await
        .unwrap();

    assert_eq!(harness.step(&id).await, TransferState::Provisioned);
    // First start fails, record stays put with a retry counted
    assert_eq!(harness.step(&id).await, TransferState::Provisioned);
    assert_eq!(harness.manager.get(&id).await.unwrap().retry_count, 1);

    assert_eq!(harness.step(&id).await, TransferState::InProgress);
    assert_eq!(harness.controller.start_count(), 2);
}

#[tokio::test]
async fn test_deprovision_failure_retries_without_terminating() {
    let harness = TestHarness::new();
    let agreement_id = harness.seed_agreement(chrono::Duration::hours(1)).await;
    harness.controller.fail_next_deprovisions(1);

    let id = harness
        .manager
        .initiate(&agreement_id, Role::Consumer, destination())
        .await
        .unwrap();
    assert_eq!(harness.step(&id).await, TransferState::Provisioned);

    harness.manager.cancel(id);
    harness.manager.process_cancellations().await;
    harness.manager.process_deprovision_requests().await;

    // Best-effort: the failure leaves the record in DEPROVISIONING
    assert_eq!(harness.step(&id).await, TransferState::Deprovisioning);
    // And the next pass finishes the cleanup
    assert_eq!(harness.step(&id).await, TransferState::Deprovisioned);
}

#[tokio::test]
async fn test_duplicate_completion_signal_is_noop() {
    let harness = TestHarness::new();
    let agreement_id = harness.seed_agreement(chrono::Duration::hours(1)).await;

    let id = harness
        .manager
        .initiate(&agreement_id, Role::Consumer, destination())
        .await
        .unwrap();
    assert_eq!(harness.step(&id).await, TransferState::Provisioned);
    assert_eq!(harness.step(&id).await, TransferState::InProgress);

    harness.manager.notify_completed(id).await.unwrap();
    let completed = harness.manager.get(&id).await.unwrap();
    let version = completed.version;

    harness.manager.notify_completed(id).await.unwrap();
    let after = harness.manager.get(&id).await.unwrap();
    assert_eq!(after.state, TransferState::Completed);
    assert_eq!(after.version, version);
}
