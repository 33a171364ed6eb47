//! Transfer Store Contract

use std::time::Duration;

use async_trait::async_trait;

use super::state::TransferState;
use super::types::TransferProcess;
use crate::core_types::TransferId;
use crate::store::StoreError;

/// Durable storage for [`TransferProcess`] records.
///
/// Same contract shape as the negotiation store, keyed by transfer id with
/// a secondary index by agreement id enforcing the
/// one-active-transfer-per-agreement invariant.
#[async_trait]
pub trait TransferStore: Send + Sync {
    /// Persist a new record.
    ///
    /// Fails with [`StoreError::Conflict`] if a non-finished transfer
    /// process already exists for the same agreement id.
    async fn create(&self, process: TransferProcess) -> Result<(), StoreError>;

    async fn find_by_id(&self, id: &TransferId) -> Result<TransferProcess, StoreError>;

    /// The active (non-finished) process for an agreement, if any
    async fn find_active_for_agreement(
        &self,
        agreement_id: &str,
    ) -> Result<Option<TransferProcess>, StoreError>;

    /// Lease up to `limit` due records in `state`; see the negotiation
    /// store for lease semantics.
    async fn next_for_state(
        &self,
        state: TransferState,
        limit: usize,
        lease_duration: Duration,
    ) -> Result<Vec<TransferProcess>, StoreError>;

    /// Compare-and-swap write; bumps the version and releases any lease.
    async fn save(&self, process: TransferProcess) -> Result<TransferProcess, StoreError>;
}
