//! Dispatcher Worker
//!
//! One worker executes ticks on its own cadence. Per tick it drains a
//! bounded batch of inbound protocol messages and completion signals,
//! applies queued cancellations, then leases a bounded batch of due
//! records per (store, state) and steps every leased record concurrently,
//! so one record's slow external call cannot stall the rest of the batch.

use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, error, info, warn};

use crate::config::DispatcherConfig;
use crate::dataflow::CompletionReceiver;
use crate::negotiation::manager::NegotiationManager;
use crate::negotiation::state::NegotiationState;
use crate::negotiation::store::NegotiationStore;
use crate::protocol::MessageReceiver;
use crate::store::StoreError;
use crate::transfer::manager::TransferManager;
use crate::transfer::state::TransferState;
use crate::transfer::store::TransferStore;

/// States with a dispatcher-driven action attached
const NEGOTIATION_STATES: [NegotiationState; 4] = [
    NegotiationState::Initial,
    NegotiationState::Requested,
    NegotiationState::Offered,
    NegotiationState::Agreed,
];

const TRANSFER_STATES: [TransferState; 5] = [
    TransferState::Requested,
    TransferState::Provisioning,
    TransferState::Provisioned,
    TransferState::InProgress,
    TransferState::Deprovisioning,
];

/// What one tick did; useful for logs and tests
#[derive(Debug, Default, Clone, Copy)]
pub struct TickStats {
    pub messages: usize,
    pub completions: usize,
    pub cancellations: usize,
    pub negotiations_stepped: usize,
    pub transfers_stepped: usize,
}

impl TickStats {
    pub fn total(&self) -> usize {
        self.messages
            + self.completions
            + self.cancellations
            + self.negotiations_stepped
            + self.transfers_stepped
    }
}

/// A single dispatcher worker.
///
/// At most one worker per connector owns the inbound message receiver and
/// the completion receiver; additional replicas poll the stores only and
/// coordinate through leases.
pub struct DispatcherWorker {
    negotiation_manager: Arc<NegotiationManager>,
    transfer_manager: Arc<TransferManager>,
    negotiation_store: Arc<dyn NegotiationStore>,
    transfer_store: Arc<dyn TransferStore>,
    inbound: Option<MessageReceiver>,
    completions: Option<CompletionReceiver>,
    config: DispatcherConfig,
}

impl DispatcherWorker {
    pub fn new(
        negotiation_manager: Arc<NegotiationManager>,
        transfer_manager: Arc<TransferManager>,
        negotiation_store: Arc<dyn NegotiationStore>,
        transfer_store: Arc<dyn TransferStore>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            negotiation_manager,
            transfer_manager,
            negotiation_store,
            transfer_store,
            inbound: None,
            completions: None,
            config,
        }
    }

    /// Attach the connector's inbound protocol queue to this worker
    pub fn with_inbound(mut self, inbound: MessageReceiver) -> Self {
        self.inbound = Some(inbound);
        self
    }

    /// Attach the data flow completion channel to this worker
    pub fn with_completions(mut self, completions: CompletionReceiver) -> Self {
        self.completions = Some(completions);
        self
    }

    /// Run the dispatcher loop forever
    pub async fn run(&mut self) -> ! {
        info!(
            tick_interval_ms = self.config.tick_interval_ms,
            batch_size = self.config.batch_size,
            lease_duration_ms = self.config.lease_duration_ms,
            "Starting dispatcher worker"
        );

        loop {
            let stats = self.tick().await;
            if stats.total() > 0 {
                debug!(?stats, "Dispatcher tick finished");
            }

            tokio::time::sleep(self.config.tick_interval()).await;
        }
    }

    /// Run a single dispatch cycle
    pub async fn tick(&mut self) -> TickStats {
        let mut stats = TickStats::default();

        // 1. Inbound protocol messages, bounded per tick so a burst cannot
        //    starve record processing
        if let Some(inbound) = self.inbound.as_mut() {
            for _ in 0..self.config.inbound_batch {
                let Some(message) = inbound.try_recv() else {
                    break;
                };
                stats.messages += 1;
                if let Err(e) = self.negotiation_manager.handle_message(message).await {
                    warn!(error = %e, "Inbound message rejected");
                }
            }
        }

        // 2. Data flow completion signals
        if let Some(completions) = self.completions.as_mut() {
            while let Some(transfer_id) = completions.try_recv() {
                stats.completions += 1;
                if let Err(e) = self.transfer_manager.notify_completed(transfer_id).await {
                    warn!(transfer_id = %transfer_id, error = %e, "Completion signal failed");
                }
            }
        }

        // 3. Queued local decisions
        stats.cancellations += self.negotiation_manager.process_cancellations().await;
        stats.cancellations += self.transfer_manager.process_cancellations().await;
        self.transfer_manager.process_deprovision_requests().await;

        // 4. Due negotiation records
        for state in NEGOTIATION_STATES {
            let batch = match self
                .negotiation_store
                .next_for_state(state, self.config.batch_size, self.config.lease_duration())
                .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    error!(state = %state, error = %e, "Failed to lease negotiation batch");
                    continue;
                }
            };
            stats.negotiations_stepped += batch.len();

            let steps = batch.into_iter().map(|record| {
                let manager = Arc::clone(&self.negotiation_manager);
                async move {
                    let id = record.id;
                    (id, manager.step(record).await)
                }
            });
            for (id, result) in join_all(steps).await {
                match result {
                    Ok(_) => {}
                    Err(e) if lost_race(&e) => {
                        debug!(negotiation_id = %id, "Record advanced by another worker");
                    }
                    Err(e) => {
                        // The record keeps its state; the lease expires on
                        // its own and a later tick retries.
                        warn!(negotiation_id = %id, error = %e, "Negotiation step failed");
                    }
                }
            }
        }

        // 5. Due transfer records
        for state in TRANSFER_STATES {
            let batch = match self
                .transfer_store
                .next_for_state(state, self.config.batch_size, self.config.lease_duration())
                .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    error!(state = %state, error = %e, "Failed to lease transfer batch");
                    continue;
                }
            };
            stats.transfers_stepped += batch.len();

            let steps = batch.into_iter().map(|record| {
                let manager = Arc::clone(&self.transfer_manager);
                async move {
                    let id = record.id;
                    (id, manager.step(record).await)
                }
            });
            for (id, result) in join_all(steps).await {
                match result {
                    Ok(_) => {}
                    Err(e) if transfer_lost_race(&e) => {
                        debug!(transfer_id = %id, "Record advanced by another worker");
                    }
                    Err(e) => {
                        warn!(transfer_id = %id, error = %e, "Transfer step failed");
                    }
                }
            }
        }

        stats
    }

    /// Drive ticks until nothing is due or `max_ticks` is hit; test helper
    /// mirroring one worker catching a store up.
    pub async fn drain(&mut self, max_ticks: usize) -> usize {
        let mut total = 0;
        for _ in 0..max_ticks {
            let stats = self.tick().await;
            total += stats.total();
            if stats.total() == 0 {
                break;
            }
        }
        total
    }
}

fn lost_race(error: &crate::negotiation::manager::NegotiationError) -> bool {
    matches!(
        error,
        crate::negotiation::manager::NegotiationError::Store(StoreError::ConcurrentModification(_))
    )
}

fn transfer_lost_race(error: &crate::transfer::manager::TransferError) -> bool {
    matches!(
        error,
        crate::transfer::manager::TransferError::Store(StoreError::ConcurrentModification(_))
    )
}
