//! Filesystem Store Backend
//!
//! One JSON document per record, written atomically via temp-file rename so
//! a crash mid-write never corrupts a record. Records (including their
//! lease) survive process restarts.
//!
//! Compound operations are serialized through an in-process mutex: the
//! backend assumes a single connector process owns the data directory.
//! Multi-worker deployments within that process still coordinate through
//! the persisted leases.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::sync::Mutex;

use super::{Lease, StoreError};
use crate::contract::ContractAgreement;
use crate::core_types::{NegotiationId, TransferId};
use crate::negotiation::state::NegotiationState;
use crate::negotiation::store::NegotiationStore;
use crate::negotiation::types::ContractNegotiation;
use crate::transfer::state::TransferState;
use crate::transfer::store::TransferStore;
use crate::transfer::types::TransferProcess;

/// Persisted layout: the full state-machine record (which carries its own
/// version counter) plus the lease token+expiry pair.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    record: T,
    lease: Option<Lease>,
}

fn io_err(context: &str, err: std::io::Error) -> StoreError {
    StoreError::Backend(format!("{context}: {err}"))
}

fn codec_err(context: &str, err: serde_json::Error) -> StoreError {
    StoreError::Backend(format!("{context}: {err}"))
}

async fn read_envelope<T: DeserializeOwned>(path: &Path) -> Result<Envelope<T>, StoreError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| io_err("read record", e))?;
    serde_json::from_str(&content).map_err(|e| codec_err("decode record", e))
}

/// Write to a temp file in the same directory, then rename over the target.
async fn write_envelope<T: Serialize>(path: &Path, envelope: &Envelope<T>) -> Result<(), StoreError> {
    let content =
        serde_json::to_string_pretty(envelope).map_err(|e| codec_err("encode record", e))?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, content)
        .await
        .map_err(|e| io_err("write record", e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| io_err("commit record", e))
}

async fn load_all<T: DeserializeOwned>(dir: &Path) -> Result<Vec<Envelope<T>>, StoreError> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| io_err("list records", e))?;
    let mut envelopes = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| io_err("list records", e))?
    {
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
            envelopes.push(read_envelope(&path).await?);
        }
    }
    Ok(envelopes)
}

/// Filesystem-backed negotiation store
pub struct FsNegotiationStore {
    dir: PathBuf,
    guard: Mutex<()>,
}

impl FsNegotiationStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| io_err("create store directory", e))?;
        Ok(Self {
            dir,
            guard: Mutex::new(()),
        })
    }

    fn path_for(&self, id: &NegotiationId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

#[async_trait]
impl NegotiationStore for FsNegotiationStore {
    async fn create(&self, negotiation: ContractNegotiation) -> Result<(), StoreError> {
        let _guard = self.guard.lock().await;

        let path = self.path_for(&negotiation.id);
        if tokio::fs::try_exists(&path)
            .await
            .map_err(|e| io_err("probe record", e))?
        {
            return Err(StoreError::Conflict(format!(
                "negotiation {} already exists",
                negotiation.id
            )));
        }

        let all: Vec<Envelope<ContractNegotiation>> = load_all(&self.dir).await?;
        let clashing = all.iter().any(|envelope| {
            !envelope.record.state.is_terminal()
                && envelope.record.asset_id() == negotiation.asset_id()
                && envelope.record.consumer_id() == negotiation.consumer_id()
        });
        if clashing {
            return Err(StoreError::Conflict(format!(
                "active negotiation already exists for asset {} and consumer {}",
                negotiation.asset_id(),
                negotiation.consumer_id()
            )));
        }

        write_envelope(
            &path,
            &Envelope {
                record: negotiation,
                lease: None,
            },
        )
        .await
    }

    async fn find_by_id(&self, id: &NegotiationId) -> Result<ContractNegotiation, StoreError> {
        let path = self.path_for(id);
        if !tokio::fs::try_exists(&path)
            .await
            .map_err(|e| io_err("probe record", e))?
        {
            return Err(StoreError::NotFound(format!("negotiation {id}")));
        }
        let envelope: Envelope<ContractNegotiation> = read_envelope(&path).await?;
        Ok(envelope.record)
    }

    async fn find_by_correlation_id(
        &self,
        correlation_id: &str,
    ) -> Result<ContractNegotiation, StoreError> {
        let all: Vec<Envelope<ContractNegotiation>> = load_all(&self.dir).await?;
        all.into_iter()
            .map(|envelope| envelope.record)
            .find(|record| record.correlation_id == correlation_id)
            .ok_or_else(|| StoreError::NotFound(format!("correlation {correlation_id}")))
    }

    async fn find_agreement(&self, agreement_id: &str) -> Result<ContractAgreement, StoreError> {
        let all: Vec<Envelope<ContractNegotiation>> = load_all(&self.dir).await?;
        all.into_iter()
            .filter_map(|envelope| envelope.record.agreement)
            .find(|agreement| agreement.id == agreement_id)
            .ok_or_else(|| StoreError::NotFound(format!("agreement {agreement_id}")))
    }

    async fn next_for_state(
        &self,
        state: NegotiationState,
        limit: usize,
        lease_duration: Duration,
    ) -> Result<Vec<ContractNegotiation>, StoreError> {
        let _guard = self.guard.lock().await;
        let now = Utc::now();

        let mut due: Vec<Envelope<ContractNegotiation>> = load_all::<ContractNegotiation>(&self.dir)
            .await?
            .into_iter()
            .filter(|envelope| {
                envelope.record.state == state
                    && envelope.record.next_attempt_at <= now
                    && envelope
                        .lease
                        .as_ref()
                        .is_none_or(|lease| lease.is_expired(now))
            })
            .collect();
        due.sort_by_key(|envelope| envelope.record.next_attempt_at);
        due.truncate(limit);

        let mut leased = Vec::with_capacity(due.len());
        for mut envelope in due {
            envelope.lease = Some(Lease::acquire(lease_duration));
            let path = self.path_for(&envelope.record.id);
            write_envelope(&path, &envelope).await?;
            leased.push(envelope.record);
        }
        Ok(leased)
    }

    async fn save(
        &self,
        negotiation: ContractNegotiation,
    ) -> Result<ContractNegotiation, StoreError> {
        let _guard = self.guard.lock().await;

        let path = self.path_for(&negotiation.id);
        if !tokio::fs::try_exists(&path)
            .await
            .map_err(|e| io_err("probe record", e))?
        {
            return Err(StoreError::NotFound(format!(
                "negotiation {}",
                negotiation.id
            )));
        }

        let stored: Envelope<ContractNegotiation> = read_envelope(&path).await?;
        if stored.record.version != negotiation.version {
            return Err(StoreError::ConcurrentModification(format!(
                "negotiation {} is at version {}, caller had {}",
                negotiation.id, stored.record.version, negotiation.version
            )));
        }

        let mut updated = negotiation;
        updated.version += 1;
        write_envelope(
            &path,
            &Envelope {
                record: updated.clone(),
                lease: None,
            },
        )
        .await?;
        Ok(updated)
    }
}

/// Filesystem-backed transfer store
pub struct FsTransferStore {
    dir: PathBuf,
    guard: Mutex<()>,
}

impl FsTransferStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| io_err("create store directory", e))?;
        Ok(Self {
            dir,
            guard: Mutex::new(()),
        })
    }

    fn path_for(&self, id: &TransferId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

#[async_trait]
impl TransferStore for FsTransferStore {
    async fn create(&self, process: TransferProcess) -> Result<(), StoreError> {
        let _guard = self.guard.lock().await;

        let path = self.path_for(&process.id);
        if tokio::fs::try_exists(&path)
            .await
            .map_err(|e| io_err("probe record", e))?
        {
            return Err(StoreError::Conflict(format!(
                "transfer {} already exists",
                process.id
            )));
        }

        let all: Vec<Envelope<TransferProcess>> = load_all(&self.dir).await?;
        let clashing = all.iter().any(|envelope| {
            !envelope.record.state.is_finished()
                && envelope.record.agreement_id == process.agreement_id
        });
        if clashing {
            return Err(StoreError::Conflict(format!(
                "active transfer already exists for agreement {}",
                process.agreement_id
            )));
        }

        write_envelope(
            &path,
            &Envelope {
                record: process,
                lease: None,
            },
        )
        .await
    }

    async fn find_by_id(&self, id: &TransferId) -> Result<TransferProcess, StoreError> {
        let path = self.path_for(id);
        if !tokio::fs::try_exists(&path)
            .await
            .map_err(|e| io_err("probe record", e))?
        {
            return Err(StoreError::NotFound(format!("transfer {id}")));
        }
        let envelope: Envelope<TransferProcess> = read_envelope(&path).await?;
        Ok(envelope.record)
    }

    async fn find_active_for_agreement(
        &self,
        agreement_id: &str,
    ) -> Result<Option<TransferProcess>, StoreError> {
        let all: Vec<Envelope<TransferProcess>> = load_all(&self.dir).await?;
        Ok(all
            .into_iter()
            .map(|envelope| envelope.record)
            .find(|record| record.agreement_id == agreement_id && !record.state.is_finished()))
    }

    async fn next_for_state(
        &self,
        state: TransferState,
        limit: usize,
        lease_duration: Duration,
    ) -> Result<Vec<TransferProcess>, StoreError> {
        let _guard = self.guard.lock().await;
        let now = Utc::now();

        let mut due: Vec<Envelope<TransferProcess>> = load_all::<TransferProcess>(&self.dir)
            .await?
            .into_iter()
            .filter(|envelope| {
                envelope.record.state == state
                    && envelope.record.next_attempt_at <= now
                    && envelope
                        .lease
                        .as_ref()
                        .is_none_or(|lease| lease.is_expired(now))
            })
            .collect();
        due.sort_by_key(|envelope| envelope.record.next_attempt_at);
        due.truncate(limit);

        let mut leased = Vec::with_capacity(due.len());
        for mut envelope in due {
            envelope.lease = Some(Lease::acquire(lease_duration));
            let path = self.path_for(&envelope.record.id);
            write_envelope(&path, &envelope).await?;
            leased.push(envelope.record);
        }
        Ok(leased)
    }

    async fn save(&self, process: TransferProcess) -> Result<TransferProcess, StoreError> {
        let _guard = self.guard.lock().await;

        let path = self.path_for(&process.id);
        if !tokio::fs::try_exists(&path)
            .await
            .map_err(|e| io_err("probe record", e))?
        {
            return Err(StoreError::NotFound(format!("transfer {}", process.id)));
        }

        let stored: Envelope<TransferProcess> = read_envelope(&path).await?;
        if stored.record.version != process.version {
            return Err(StoreError::ConcurrentModification(format!(
                "transfer {} is at version {}, caller had {}",
                process.id, stored.record.version, process.version
            )));
        }

        let mut updated = process;
        updated.version += 1;
        write_envelope(
            &path,
            &Envelope {
                record: updated.clone(),
                lease: None,
            },
        )
        .await?;
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::ContractOffer;
    use crate::core_types::Role;
    use crate::transfer::types::DataDestination;

    fn negotiation() -> ContractNegotiation {
        ContractNegotiation::initiate(
            ContractOffer::new("A-1", "P-1", "provider-1", "consumer-1"),
            "provider.internal".into(),
        )
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let record = negotiation();
        let id = record.id;

        {
            let store = FsNegotiationStore::open(tmp.path()).unwrap();
            store.create(record).await.unwrap();
        }

        // Fresh handle over the same directory, as after a process restart
        let store = FsNegotiationStore::open(tmp.path()).unwrap();
        let loaded = store.find_by_id(&id).await.unwrap();
        assert_eq!(loaded.id, id);
        assert_eq!(loaded.state, NegotiationState::Initial);
    }

    #[tokio::test]
    async fn test_lease_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();

        {
            let store = FsNegotiationStore::open(tmp.path()).unwrap();
            store.create(negotiation()).await.unwrap();
            let leased = store
                .next_for_state(NegotiationState::Initial, 10, Duration::from_secs(60))
                .await
                .unwrap();
            assert_eq!(leased.len(), 1);
        }

        // The persisted lease still excludes other workers after restart
        let store = FsNegotiationStore::open(tmp.path()).unwrap();
        let leased = store
            .next_for_state(NegotiationState::Initial, 10, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(leased.is_empty());
    }

    #[tokio::test]
    async fn test_cas_save_over_files() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsNegotiationStore::open(tmp.path()).unwrap();
        let record = negotiation();
        let id = record.id;
        store.create(record).await.unwrap();

        let copy_a = store.find_by_id(&id).await.unwrap();
        let copy_b = store.find_by_id(&id).await.unwrap();

        let mut copy_a = copy_a;
        copy_a.transition_to(NegotiationState::Requested);
        store.save(copy_a).await.unwrap();

        let mut copy_b = copy_b;
        copy_b.transition_to(NegotiationState::Offered);
        assert!(matches!(
            store.save(copy_b).await,
            Err(StoreError::ConcurrentModification(_))
        ));
    }

    #[tokio::test]
    async fn test_transfer_agreement_invariant_over_files() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsTransferStore::open(tmp.path()).unwrap();

        let process =
            TransferProcess::new("agr-1", Role::Consumer, DataDestination::new("file"));
        store.create(process).await.unwrap();

        let second = TransferProcess::new("agr-1", Role::Consumer, DataDestination::new("file"));
        assert!(matches!(
            store.create(second).await,
            Err(StoreError::Conflict(_))
        ));
    }
}
