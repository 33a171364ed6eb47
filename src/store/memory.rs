//! In-Memory Store Backend
//!
//! Reference implementation of the store contracts, used by tests and
//! single-process demos. All compound operations run under one mutex held
//! strictly across synchronous sections (never across an await), so the
//! lease and CAS semantics match the durable backends exactly.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use super::{Lease, StoreError};
use crate::contract::ContractAgreement;
use crate::core_types::{AgreementId, NegotiationId, TransferId};
use crate::negotiation::state::NegotiationState;
use crate::negotiation::store::NegotiationStore;
use crate::negotiation::types::ContractNegotiation;
use crate::transfer::state::TransferState;
use crate::transfer::store::TransferStore;
use crate::transfer::types::TransferProcess;

struct StoredNegotiation {
    record: ContractNegotiation,
    lease: Option<Lease>,
}

#[derive(Default)]
struct NegotiationInner {
    records: HashMap<NegotiationId, StoredNegotiation>,
    /// (asset, consumer) -> active negotiation, backing the
    /// one-active-negotiation-per-pair invariant
    active: HashMap<(String, String), NegotiationId>,
}

/// In-memory negotiation store
#[derive(Default)]
pub struct InMemoryNegotiationStore {
    inner: Mutex<NegotiationInner>,
}

impl InMemoryNegotiationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NegotiationStore for InMemoryNegotiationStore {
    async fn create(&self, negotiation: ContractNegotiation) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();

        if inner.records.contains_key(&negotiation.id) {
            return Err(StoreError::Conflict(format!(
                "negotiation {} already exists",
                negotiation.id
            )));
        }

        let key = (
            negotiation.asset_id().to_string(),
            negotiation.consumer_id().to_string(),
        );
        if let Some(existing_id) = inner.active.get(&key) {
            let still_active = inner
                .records
                .get(existing_id)
                .is_some_and(|stored| !stored.record.state.is_terminal());
            if still_active {
                return Err(StoreError::Conflict(format!(
                    "active negotiation {} already exists for asset {} and consumer {}",
                    existing_id, key.0, key.1
                )));
            }
        }

        inner.active.insert(key, negotiation.id);
        inner.records.insert(
            negotiation.id,
            StoredNegotiation {
                record: negotiation,
                lease: None,
            },
        );
        Ok(())
    }

    async fn find_by_id(&self, id: &NegotiationId) -> Result<ContractNegotiation, StoreError> {
        let inner = self.inner.lock().unwrap();
        inner
            .records
            .get(id)
            .map(|stored| stored.record.clone())
            .ok_or_else(|| StoreError::NotFound(format!("negotiation {id}")))
    }

    async fn find_by_correlation_id(
        &self,
        correlation_id: &str,
    ) -> Result<ContractNegotiation, StoreError> {
        let inner = self.inner.lock().unwrap();
        inner
            .records
            .values()
            .find(|stored| stored.record.correlation_id == correlation_id)
            .map(|stored| stored.record.clone())
            .ok_or_else(|| StoreError::NotFound(format!("correlation {correlation_id}")))
    }

    async fn find_agreement(&self, agreement_id: &str) -> Result<ContractAgreement, StoreError> {
        let inner = self.inner.lock().unwrap();
        inner
            .records
            .values()
            .filter_map(|stored| stored.record.agreement.as_ref())
            .find(|agreement| agreement.id == agreement_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("agreement {agreement_id}")))
    }

    async fn next_for_state(
        &self,
        state: NegotiationState,
        limit: usize,
        lease_duration: Duration,
    ) -> Result<Vec<ContractNegotiation>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();

        let mut due: Vec<NegotiationId> = inner
            .records
            .values()
            .filter(|stored| {
                stored.record.state == state
                    && stored.record.next_attempt_at <= now
                    && stored.lease.as_ref().is_none_or(|lease| lease.is_expired(now))
            })
            .map(|stored| stored.record.id)
            .collect();
        due.sort_by_key(|id| {
            inner
                .records
                .get(id)
                .map(|stored| stored.record.next_attempt_at)
                .unwrap_or(now)
        });
        due.truncate(limit);

        let mut leased = Vec::with_capacity(due.len());
        for id in due {
            if let Some(stored) = inner.records.get_mut(&id) {
                stored.lease = Some(Lease::acquire(lease_duration));
                leased.push(stored.record.clone());
            }
        }
        Ok(leased)
    }

    async fn save(
        &self,
        negotiation: ContractNegotiation,
    ) -> Result<ContractNegotiation, StoreError> {
        let mut inner = self.inner.lock().unwrap();

        let stored = inner
            .records
            .get_mut(&negotiation.id)
            .ok_or_else(|| StoreError::NotFound(format!("negotiation {}", negotiation.id)))?;

        if stored.record.version != negotiation.version {
            return Err(StoreError::ConcurrentModification(format!(
                "negotiation {} is at version {}, caller had {}",
                negotiation.id, stored.record.version, negotiation.version
            )));
        }

        let mut updated = negotiation;
        updated.version += 1;
        stored.record = updated.clone();
        stored.lease = None;

        if updated.state.is_terminal() {
            let key = (
                updated.asset_id().to_string(),
                updated.consumer_id().to_string(),
            );
            if inner.active.get(&key) == Some(&updated.id) {
                inner.active.remove(&key);
            }
        }

        Ok(updated)
    }
}

struct StoredTransfer {
    record: TransferProcess,
    lease: Option<Lease>,
}

#[derive(Default)]
struct TransferInner {
    records: HashMap<TransferId, StoredTransfer>,
    /// agreement id -> active transfer, backing the
    /// one-active-transfer-per-agreement invariant
    active: HashMap<AgreementId, TransferId>,
}

/// In-memory transfer store
#[derive(Default)]
pub struct InMemoryTransferStore {
    inner: Mutex<TransferInner>,
}

impl InMemoryTransferStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransferStore for InMemoryTransferStore {
    async fn create(&self, process: TransferProcess) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();

        if inner.records.contains_key(&process.id) {
            return Err(StoreError::Conflict(format!(
                "transfer {} already exists",
                process.id
            )));
        }

        if let Some(existing_id) = inner.active.get(&process.agreement_id) {
            let still_active = inner
                .records
                .get(existing_id)
                .is_some_and(|stored| !stored.record.state.is_finished());
            if still_active {
                return Err(StoreError::Conflict(format!(
                    "active transfer {} already exists for agreement {}",
                    existing_id, process.agreement_id
                )));
            }
        }

        inner.active.insert(process.agreement_id.clone(), process.id);
        inner.records.insert(
            process.id,
            StoredTransfer {
                record: process,
                lease: None,
            },
        );
        Ok(())
    }

    async fn find_by_id(&self, id: &TransferId) -> Result<TransferProcess, StoreError> {
        let inner = self.inner.lock().unwrap();
        inner
            .records
            .get(id)
            .map(|stored| stored.record.clone())
            .ok_or_else(|| StoreError::NotFound(format!("transfer {id}")))
    }

    async fn find_active_for_agreement(
        &self,
        agreement_id: &str,
    ) -> Result<Option<TransferProcess>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .active
            .get(agreement_id)
            .and_then(|id| inner.records.get(id))
            .map(|stored| stored.record.clone())
            .filter(|record| !record.state.is_finished()))
    }

    async fn next_for_state(
        &self,
        state: TransferState,
        limit: usize,
        lease_duration: Duration,
    ) -> Result<Vec<TransferProcess>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();

        let mut due: Vec<TransferId> = inner
            .records
            .values()
            .filter(|stored| {
                stored.record.state == state
                    && stored.record.next_attempt_at <= now
                    && stored.lease.as_ref().is_none_or(|lease| lease.is_expired(now))
            })
            .map(|stored| stored.record.id)
            .collect();
        due.sort_by_key(|id| {
            inner
                .records
                .get(id)
                .map(|stored| stored.record.next_attempt_at)
                .unwrap_or(now)
        });
        due.truncate(limit);

        let mut leased = Vec::with_capacity(due.len());
        for id in due {
            if let Some(stored) = inner.records.get_mut(&id) {
                stored.lease = Some(Lease::acquire(lease_duration));
                leased.push(stored.record.clone());
            }
        }
        Ok(leased)
    }

    async fn save(&self, process: TransferProcess) -> Result<TransferProcess, StoreError> {
        let mut inner = self.inner.lock().unwrap();

        let stored = inner
            .records
            .get_mut(&process.id)
            .ok_or_else(|| StoreError::NotFound(format!("transfer {}", process.id)))?;

        if stored.record.version != process.version {
            return Err(StoreError::ConcurrentModification(format!(
                "transfer {} is at version {}, caller had {}",
                process.id, stored.record.version, process.version
            )));
        }

        let mut updated = process;
        updated.version += 1;
        stored.record = updated.clone();
        stored.lease = None;

        // A finished process no longer blocks a successor for the same
        // agreement, even while its cleanup tail drains.
        if updated.state.is_finished() && inner.active.get(&updated.agreement_id) == Some(&updated.id)
        {
            inner.active.remove(&updated.agreement_id);
        }

        Ok(updated)
    }
}
