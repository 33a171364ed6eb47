//! Transfer Process Manager
//!
//! Drives the Transfer Process state machine once a contract agreement
//! exists. Persists through the transfer store and invokes the pluggable
//! data flow controller for the actual byte movement.
//!
//! # Safety Invariants
//!
//! 1. **Persist-before-call**: the record is moved to PROVISIONING before
//!    the controller's provision operation runs, so a crash mid-call is
//!    recovered by re-invoking the (idempotent) operation.
//! 2. Controller failures are retryable up to the configured bound, then
//!    terminal with the failure detail persisted.
//! 3. Deprovisioning is best-effort and never blocks a process from
//!    counting as logically finished.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::state::{TransferState, TransferTerminationReason};
use super::store::TransferStore;
use super::types::{DataDestination, TransferProcess};
use crate::config::{RetryPolicy, TransferConfig};
use crate::core_types::{Role, TransferId};
use crate::dataflow::DataFlowController;
use crate::negotiation::store::NegotiationStore;
use crate::store::StoreError;

/// Transfer manager error taxonomy
#[derive(Error, Debug)]
pub enum TransferError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The referenced agreement does not exist
    #[error("agreement not found: {0}")]
    AgreementNotFound(String),

    /// A local operation against a record in the wrong state
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

impl TransferError {
    pub fn is_retryable(&self) -> bool {
        match self {
            TransferError::Store(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Drives transfer processes for one connector
pub struct TransferManager {
    store: Arc<dyn TransferStore>,
    /// Agreements live with the negotiation that produced them
    negotiations: Arc<dyn NegotiationStore>,
    controller: Arc<dyn DataFlowController>,
    config: TransferConfig,
    retry: RetryPolicy,
    /// Cancellations and cleanup requests are queued and take effect when
    /// drained by the dispatcher, not synchronously.
    pending_cancellations: Mutex<Vec<TransferId>>,
    pending_deprovisions: Mutex<Vec<TransferId>>,
}

impl TransferManager {
    pub fn new(
        store: Arc<dyn TransferStore>,
        negotiations: Arc<dyn NegotiationStore>,
        controller: Arc<dyn DataFlowController>,
        config: TransferConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            negotiations,
            controller,
            config,
            retry,
            pending_cancellations: Mutex::new(Vec::new()),
            pending_deprovisions: Mutex::new(Vec::new()),
        }
    }

    /// Create a transfer process against an existing agreement.
    ///
    /// The agreement must resolve; its validity window is (re-)checked by
    /// the dispatcher before provisioning, so a request against an elapsed
    /// agreement yields an inspectable TERMINATED(AGREEMENT_EXPIRED) record
    /// rather than an error here. Fails with a store conflict if an active
    /// transfer already exists for the agreement.
    pub async fn initiate(
        &self,
        agreement_id: &str,
        role: Role,
        destination: DataDestination,
    ) -> Result<TransferId, TransferError> {
        self.negotiations
            .find_agreement(agreement_id)
            .await
            .map_err(|e| match e {
                StoreError::NotFound(_) => {
                    TransferError::AgreementNotFound(agreement_id.to_string())
                }
                other => other.into(),
            })?;

        let process = TransferProcess::new(agreement_id, role, destination);
        let id = process.id;
        self.store.create(process).await?;

        info!(transfer_id = %id, agreement_id, "Transfer process created");
        Ok(id)
    }

    pub async fn get(&self, id: &TransferId) -> Result<TransferProcess, TransferError> {
        Ok(self.store.find_by_id(id).await?)
    }

    /// Queue a cancellation. Takes effect the next time the dispatcher
    /// drains cancellations; callers needing confirmation must poll.
    pub fn cancel(&self, id: TransferId) {
        debug!(transfer_id = %id, "Transfer cancellation queued");
        self.pending_cancellations.lock().unwrap().push(id);
    }

    /// Queue cleanup of a provisioned/finished process
    pub fn schedule_deprovision(&self, id: TransferId) {
        debug!(transfer_id = %id, "Deprovisioning queued");
        self.pending_deprovisions.lock().unwrap().push(id);
    }

    /// Apply queued cancellations; returns how many took effect
    pub async fn process_cancellations(&self) -> usize {
        let ids: Vec<TransferId> =
            std::mem::take(&mut *self.pending_cancellations.lock().unwrap());
        let mut applied = 0;

        for id in ids {
            match self.apply_cancellation(&id).await {
                Ok(true) => applied += 1,
                Ok(false) => {}
                Err(TransferError::Store(StoreError::ConcurrentModification(_))) => {
                    self.pending_cancellations.lock().unwrap().push(id);
                }
                Err(e) => {
                    warn!(transfer_id = %id, error = %e, "Failed to apply cancellation");
                }
            }
        }
        applied
    }

    async fn apply_cancellation(&self, id: &TransferId) -> Result<bool, TransferError> {
        let mut process = self.store.find_by_id(id).await?;
        if process.state.is_finished() {
            return Ok(false);
        }

        process.transition_terminated(TransferTerminationReason::Cancelled, None);
        let saved = self.store.save(process).await?;
        info!(transfer_id = %id, "Transfer cancelled");

        if saved.has_provisioned_resources() {
            self.schedule_deprovision(saved.id);
        }
        Ok(true)
    }

    /// Move queued cleanup requests into DEPROVISIONING
    pub async fn process_deprovision_requests(&self) -> usize {
        let ids: Vec<TransferId> =
            std::mem::take(&mut *self.pending_deprovisions.lock().unwrap());
        let mut applied = 0;

        for id in ids {
            match self.apply_deprovision_request(&id).await {
                Ok(true) => applied += 1,
                Ok(false) => {}
                Err(TransferError::Store(StoreError::ConcurrentModification(_))) => {
                    self.pending_deprovisions.lock().unwrap().push(id);
                }
                Err(e) => {
                    warn!(transfer_id = %id, error = %e, "Failed to schedule deprovisioning");
                }
            }
        }
        applied
    }

    async fn apply_deprovision_request(&self, id: &TransferId) -> Result<bool, TransferError> {
        let mut process = self.store.find_by_id(id).await?;

        let eligible = matches!(
            process.state,
            TransferState::Provisioned | TransferState::Completed | TransferState::Terminated
        );
        if !eligible || !process.has_provisioned_resources() {
            return Ok(false);
        }

        process.transition_to(TransferState::Deprovisioning);
        self.store.save(process).await?;
        Ok(true)
    }

    /// Completion callback from the data flow controller, keyed by
    /// transfer id. Idempotent: signals for already-finished processes are
    /// dropped.
    pub async fn notify_completed(&self, id: TransferId) -> Result<(), TransferError> {
        for _attempt in 0..3 {
            let mut process = self.store.find_by_id(&id).await?;

            if process.state != TransferState::InProgress {
                debug!(
                    transfer_id = %id,
                    state = %process.state,
                    "Completion signal ignored"
                );
                return Ok(());
            }

            process.transition_to(TransferState::Completed);
            match self.store.save(process).await {
                Ok(saved) => {
                    info!(transfer_id = %id, "Transfer completed");
                    if saved.has_provisioned_resources() {
                        self.schedule_deprovision(saved.id);
                    }
                    return Ok(());
                }
                Err(StoreError::ConcurrentModification(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(TransferError::Store(StoreError::ConcurrentModification(
            format!("completion of {id} never applied"),
        )))
    }

    /// Execute one dispatcher-driven step on a leased record
    pub async fn step(&self, process: TransferProcess) -> Result<TransferProcess, TransferError> {
        match process.state {
            TransferState::Requested => self.step_requested(process).await,
            TransferState::Provisioning => self.step_provision(process).await,
            TransferState::Provisioned => self.step_start(process).await,
            TransferState::InProgress => {
                // Completion arrives through the completion channel
                let mut process = process;
                process.defer(self.config.recheck_interval());
                Ok(self.store.save(process).await?)
            }
            TransferState::Deprovisioning => self.step_deprovision(process).await,
            // Finished states are not polled; pass through untouched
            _ => Ok(process),
        }
    }

    /// REQUESTED: validate the agreement window, then enter provisioning
    async fn step_requested(
        &self,
        mut process: TransferProcess,
    ) -> Result<TransferProcess, TransferError> {
        let agreement = match self.negotiations.find_agreement(&process.agreement_id).await {
            Ok(agreement) => agreement,
            Err(StoreError::NotFound(_)) => {
                process.transition_terminated(
                    TransferTerminationReason::AgreementExpired,
                    Some(format!("agreement {} not resolvable", process.agreement_id)),
                );
                return Ok(self.store.save(process).await?);
            }
            Err(e) => return Err(e.into()),
        };

        if agreement.is_expired(Utc::now()) {
            info!(
                transfer_id = %process.id,
                agreement_id = %process.agreement_id,
                "Agreement validity window elapsed; no provisioning attempted"
            );
            process.transition_terminated(TransferTerminationReason::AgreementExpired, None);
            return Ok(self.store.save(process).await?);
        }

        // Persist PROVISIONING before calling the controller
        process.transition_to(TransferState::Provisioning);
        let process = self.store.save(process).await?;
        self.step_provision(process).await
    }

    /// PROVISIONING: (re-)invoke the idempotent provision operation
    async fn step_provision(
        &self,
        mut process: TransferProcess,
    ) -> Result<TransferProcess, TransferError> {
        match self.controller.provision(&process).await {
            Ok(resources) => {
                info!(
                    transfer_id = %process.id,
                    controller = self.controller.name(),
                    resources = resources.len(),
                    "Provisioning succeeded"
                );
                process.provisioned_resources = resources;
                process.transition_to(TransferState::Provisioned);
                Ok(self.store.save(process).await?)
            }
            Err(e) => {
                self.retry_or_terminate(process, TransferTerminationReason::ProvisionFailed, &e)
                    .await
            }
        }
    }

    /// PROVISIONED: start the data flow
    async fn step_start(
        &self,
        mut process: TransferProcess,
    ) -> Result<TransferProcess, TransferError> {
        match self.controller.start(&process).await {
            Ok(()) => {
                info!(
                    transfer_id = %process.id,
                    controller = self.controller.name(),
                    "Data flow started"
                );
                process.transition_to(TransferState::InProgress);
                Ok(self.store.save(process).await?)
            }
            Err(e) => {
                self.retry_or_terminate(process, TransferTerminationReason::StartFailed, &e)
                    .await
            }
        }
    }

    /// DEPROVISIONING: best-effort cleanup on a longer backoff.
    /// Never terminates the process; it is already logically finished.
    async fn step_deprovision(
        &self,
        mut process: TransferProcess,
    ) -> Result<TransferProcess, TransferError> {
        match self.controller.deprovision(&process).await {
            Ok(()) => {
                info!(transfer_id = %process.id, "Resources deprovisioned");
                process.provisioned_resources.clear();
                process.transition_to(TransferState::Deprovisioned);
                Ok(self.store.save(process).await?)
            }
            Err(e) => {
                warn!(
                    transfer_id = %process.id,
                    error = %e,
                    retry_count = process.retry_count,
                    "Deprovisioning failed (will retry)"
                );
                process.schedule_retry(self.config.deprovision_backoff());
                Ok(self.store.save(process).await?)
            }
        }
    }

    /// Retryable controller failure: back off in place, or terminate with
    /// `reason` once the bound is hit
    async fn retry_or_terminate(
        &self,
        mut process: TransferProcess,
        reason: TransferTerminationReason,
        error: &anyhow::Error,
    ) -> Result<TransferProcess, TransferError> {
        if self.retry.exhausted(process.retry_count) {
            warn!(
                transfer_id = %process.id,
                error = %error,
                retry_count = process.retry_count,
                reason = %reason,
                "Retries exhausted"
            );
            process.transition_terminated(reason, Some(error.to_string()));
            let saved = self.store.save(process).await?;

            if saved.has_provisioned_resources() {
                self.schedule_deprovision(saved.id);
            }
            return Ok(saved);
        }

        debug!(
            transfer_id = %process.id,
            error = %error,
            retry_count = process.retry_count,
            "Retryable controller failure, backing off"
        );
        process.schedule_retry(self.retry.delay(process.retry_count));
        Ok(self.store.save(process).await?)
    }
}
