//! Negotiation Store Contract

use std::time::Duration;

use async_trait::async_trait;

use super::state::NegotiationState;
use super::types::ContractNegotiation;
use crate::contract::ContractAgreement;
use crate::core_types::NegotiationId;
use crate::store::StoreError;

/// Durable storage for [`ContractNegotiation`] records.
///
/// Implementations enforce the at-most-one-active-negotiation-per
/// (asset, consumer) invariant on `create`, and provide lease-based mutual
/// exclusion plus version-CAS saves for safe concurrent transitions.
#[async_trait]
pub trait NegotiationStore: Send + Sync {
    /// Persist a new record.
    ///
    /// Fails with [`StoreError::Conflict`] if a non-terminal negotiation
    /// already exists for the same (asset, consumer) pair.
    async fn create(&self, negotiation: ContractNegotiation) -> Result<(), StoreError>;

    async fn find_by_id(&self, id: &NegotiationId) -> Result<ContractNegotiation, StoreError>;

    async fn find_by_correlation_id(
        &self,
        correlation_id: &str,
    ) -> Result<ContractNegotiation, StoreError>;

    /// Resolve an agreement produced by a confirmed negotiation.
    ///
    /// Serves the transfer manager's validity checks; agreements live with
    /// the negotiation record that produced them.
    async fn find_agreement(&self, agreement_id: &str) -> Result<ContractAgreement, StoreError>;

    /// Lease up to `limit` records currently in `state` that are lease-free
    /// (or whose lease expired) and whose `next_attempt_at` has passed.
    ///
    /// Leased records are claimed for `lease_duration` under a fresh token;
    /// the lease expires on its own, so a crashed worker never permanently
    /// strands a record. `save` releases the claim.
    async fn next_for_state(
        &self,
        state: NegotiationState,
        limit: usize,
        lease_duration: Duration,
    ) -> Result<Vec<ContractNegotiation>, StoreError>;

    /// Compare-and-swap write: succeeds only if the stored version still
    /// matches `negotiation.version`, then bumps the version and releases
    /// any lease. Returns the stored record.
    ///
    /// Fails with [`StoreError::ConcurrentModification`] if the stored
    /// version moved since the record was loaded.
    async fn save(
        &self,
        negotiation: ContractNegotiation,
    ) -> Result<ContractNegotiation, StoreError>;
}
