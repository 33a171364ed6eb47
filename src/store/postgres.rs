//! PostgreSQL Store Backend
//!
//! Multi-worker durable backend. Each record is stored as a JSON document
//! column alongside the scalar columns the queries filter on; leasing uses
//! `FOR UPDATE SKIP LOCKED` so concurrent workers never fight over the same
//! batch, and saves CAS on the version column.
//!
//! The one-active-record invariants are enforced by partial unique indexes
//! over the non-finished states, so they hold even across connector
//! processes sharing one database.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;
use sqlx::postgres::{PgPool, PgPoolOptions};

use super::{Lease, StoreError};
use crate::contract::ContractAgreement;
use crate::core_types::{NegotiationId, TransferId};
use crate::negotiation::state::NegotiationState;
use crate::negotiation::store::NegotiationStore;
use crate::negotiation::types::ContractNegotiation;
use crate::transfer::state::TransferState;
use crate::transfer::store::TransferStore;
use crate::transfer::types::TransferProcess;

const NEGOTIATION_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS contract_negotiations (
        id TEXT PRIMARY KEY,
        correlation_id TEXT NOT NULL,
        asset_id TEXT NOT NULL,
        consumer_id TEXT NOT NULL,
        agreement_id TEXT,
        state SMALLINT NOT NULL,
        version BIGINT NOT NULL,
        next_attempt_at TIMESTAMPTZ NOT NULL,
        lease_token TEXT,
        lease_expires_at TIMESTAMPTZ,
        document TEXT NOT NULL
    )
    "#,
    // Partial unique index: at most one non-terminal negotiation per
    // (asset, consumer) pair. Terminal states: CONFIRMED (40), TERMINATED (-10).
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS contract_negotiations_active_pair
        ON contract_negotiations (asset_id, consumer_id)
        WHERE state NOT IN (40, -10)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS contract_negotiations_due
        ON contract_negotiations (state, next_attempt_at)
    "#,
];

const TRANSFER_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS transfer_processes (
        id TEXT PRIMARY KEY,
        agreement_id TEXT NOT NULL,
        state SMALLINT NOT NULL,
        version BIGINT NOT NULL,
        next_attempt_at TIMESTAMPTZ NOT NULL,
        lease_token TEXT,
        lease_expires_at TIMESTAMPTZ,
        document TEXT NOT NULL
    )
    "#,
    // Finished states (COMPLETED 40, DEPROVISIONING 50, DEPROVISIONED 60,
    // TERMINATED -10) no longer block a successor for the same agreement.
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS transfer_processes_active_agreement
        ON transfer_processes (agreement_id)
        WHERE state NOT IN (40, 50, 60, -10)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS transfer_processes_due
        ON transfer_processes (state, next_attempt_at)
    "#,
];

fn db_err(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
            StoreError::Conflict(db.message().to_string())
        }
        _ => StoreError::Backend(err.to_string()),
    }
}

fn decode<T: serde::de::DeserializeOwned>(document: &str) -> Result<T, StoreError> {
    serde_json::from_str(document)
        .map_err(|e| StoreError::Backend(format!("decode document: {e}")))
}

fn encode<T: serde::Serialize>(record: &T) -> Result<String, StoreError> {
    serde_json::to_string(record)
        .map_err(|e| StoreError::Backend(format!("encode document: {e}")))
}

/// PostgreSQL-backed negotiation store
pub struct PgNegotiationStore {
    pool: PgPool,
}

impl PgNegotiationStore {
    /// Create a store over an existing connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(url)
            .await
            .map_err(db_err)?;
        Ok(Self::new(pool))
    }

    /// Create tables and indexes if they do not exist yet
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in NEGOTIATION_SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }
        Ok(())
    }
}

#[async_trait]
impl NegotiationStore for PgNegotiationStore {
    async fn create(&self, negotiation: ContractNegotiation) -> Result<(), StoreError> {
        let document = encode(&negotiation)?;
        sqlx::query(
            r#"
            INSERT INTO contract_negotiations
                (id, correlation_id, asset_id, consumer_id, agreement_id,
                 state, version, next_attempt_at, document)
            VALUES
                ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(negotiation.id.to_string())
        .bind(&negotiation.correlation_id)
        .bind(negotiation.asset_id())
        .bind(negotiation.consumer_id())
        .bind(negotiation.agreement.as_ref().map(|a| a.id.clone()))
        .bind(negotiation.state.id())
        .bind(negotiation.version as i64)
        .bind(negotiation.next_attempt_at)
        .bind(document)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn find_by_id(&self, id: &NegotiationId) -> Result<ContractNegotiation, StoreError> {
        let document = sqlx::query_scalar::<_, String>(
            "SELECT document FROM contract_negotiations WHERE id = $1",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| StoreError::NotFound(format!("negotiation {id}")))?;
        decode(&document)
    }

    async fn find_by_correlation_id(
        &self,
        correlation_id: &str,
    ) -> Result<ContractNegotiation, StoreError> {
        let document = sqlx::query_scalar::<_, String>(
            "SELECT document FROM contract_negotiations WHERE correlation_id = $1",
        )
        .bind(correlation_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| StoreError::NotFound(format!("correlation {correlation_id}")))?;
        decode(&document)
    }

    async fn find_agreement(&self, agreement_id: &str) -> Result<ContractAgreement, StoreError> {
        let document = sqlx::query_scalar::<_, String>(
            "SELECT document FROM contract_negotiations WHERE agreement_id = $1",
        )
        .bind(agreement_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| StoreError::NotFound(format!("agreement {agreement_id}")))?;
        let negotiation: ContractNegotiation = decode(&document)?;
        negotiation
            .agreement
            .ok_or_else(|| StoreError::NotFound(format!("agreement {agreement_id}")))
    }

    async fn next_for_state(
        &self,
        state: NegotiationState,
        limit: usize,
        lease_duration: Duration,
    ) -> Result<Vec<ContractNegotiation>, StoreError> {
        let lease = Lease::acquire(lease_duration);
        let rows = sqlx::query(
            r#"
            UPDATE contract_negotiations
            SET lease_token = $1, lease_expires_at = $2
            WHERE id IN (
                SELECT id FROM contract_negotiations
                WHERE state = $3
                  AND next_attempt_at <= $4
                  AND (lease_token IS NULL OR lease_expires_at <= $4)
                ORDER BY next_attempt_at ASC
                LIMIT $5
                FOR UPDATE SKIP LOCKED
            )
            RETURNING document
            "#,
        )
        .bind(&lease.token)
        .bind(lease.expires_at)
        .bind(state.id())
        .bind(Utc::now())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| decode(row.get::<String, _>("document").as_str()))
            .collect()
    }

    async fn save(
        &self,
        negotiation: ContractNegotiation,
    ) -> Result<ContractNegotiation, StoreError> {
        let mut updated = negotiation;
        let expected = updated.version;
        updated.version += 1;
        let document = encode(&updated)?;

        let result = sqlx::query(
            r#"
            UPDATE contract_negotiations
            SET document = $1, state = $2, agreement_id = $3, version = $4,
                next_attempt_at = $5, lease_token = NULL, lease_expires_at = NULL
            WHERE id = $6 AND version = $7
            "#,
        )
        .bind(document)
        .bind(updated.state.id())
        .bind(updated.agreement.as_ref().map(|a| a.id.clone()))
        .bind(updated.version as i64)
        .bind(updated.next_attempt_at)
        .bind(updated.id.to_string())
        .bind(expected as i64)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            let exists = sqlx::query_scalar::<_, i64>(
                "SELECT version FROM contract_negotiations WHERE id = $1",
            )
            .bind(updated.id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

            return Err(match exists {
                Some(stored) => StoreError::ConcurrentModification(format!(
                    "negotiation {} is at version {stored}, caller had {expected}",
                    updated.id
                )),
                None => StoreError::NotFound(format!("negotiation {}", updated.id)),
            });
        }

        Ok(updated)
    }
}

/// PostgreSQL-backed transfer store
pub struct PgTransferStore {
    pool: PgPool,
}

impl PgTransferStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(url)
            .await
            .map_err(db_err)?;
        Ok(Self::new(pool))
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in TRANSFER_SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }
        Ok(())
    }
}

#[async_trait]
impl TransferStore for PgTransferStore {
    async fn create(&self, process: TransferProcess) -> Result<(), StoreError> {
        let document = encode(&process)?;
        sqlx::query(
            r#"
            INSERT INTO transfer_processes
                (id, agreement_id, state, version, next_attempt_at, document)
            VALUES
                ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(process.id.to_string())
        .bind(&process.agreement_id)
        .bind(process.state.id())
        .bind(process.version as i64)
        .bind(process.next_attempt_at)
        .bind(document)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn find_by_id(&self, id: &TransferId) -> Result<TransferProcess, StoreError> {
        let document = sqlx::query_scalar::<_, String>(
            "SELECT document FROM transfer_processes WHERE id = $1",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| StoreError::NotFound(format!("transfer {id}")))?;
        decode(&document)
    }

    async fn find_active_for_agreement(
        &self,
        agreement_id: &str,
    ) -> Result<Option<TransferProcess>, StoreError> {
        let document = sqlx::query_scalar::<_, String>(
            r#"
            SELECT document FROM transfer_processes
            WHERE agreement_id = $1 AND state NOT IN (40, 50, 60, -10)
            "#,
        )
        .bind(agreement_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        document.as_deref().map(decode).transpose()
    }

    async fn next_for_state(
        &self,
        state: TransferState,
        limit: usize,
        lease_duration: Duration,
    ) -> Result<Vec<TransferProcess>, StoreError> {
        let lease = Lease::acquire(lease_duration);
        let rows = sqlx::query(
            r#"
            UPDATE transfer_processes
            SET lease_token = $1, lease_expires_at = $2
            WHERE id IN (
                SELECT id FROM transfer_processes
                WHERE state = $3
                  AND next_attempt_at <= $4
                  AND (lease_token IS NULL OR lease_expires_at <= $4)
                ORDER BY next_attempt_at ASC
                LIMIT $5
                FOR UPDATE SKIP LOCKED
            )
            RETURNING document
            "#,
        )
        .bind(&lease.token)
        .bind(lease.expires_at)
        .bind(state.id())
        .bind(Utc::now())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| decode(row.get::<String, _>("document").as_str()))
            .collect()
    }

    async fn save(&self, process: TransferProcess) -> Result<TransferProcess, StoreError> {
        let mut updated = process;
        let expected = updated.version;
        updated.version += 1;
        let document = encode(&updated)?;

        let result = sqlx::query(
            r#"
            UPDATE transfer_processes
            SET document = $1, state = $2, version = $3, next_attempt_at = $4,
                lease_token = NULL, lease_expires_at = NULL
            WHERE id = $5 AND version = $6
            "#,
        )
        .bind(document)
        .bind(updated.state.id())
        .bind(updated.version as i64)
        .bind(updated.next_attempt_at)
        .bind(updated.id.to_string())
        .bind(expected as i64)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            let exists = sqlx::query_scalar::<_, i64>(
                "SELECT version FROM transfer_processes WHERE id = $1",
            )
            .bind(updated.id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

            return Err(match exists {
                Some(stored) => StoreError::ConcurrentModification(format!(
                    "transfer {} is at version {stored}, caller had {expected}",
                    updated.id
                )),
                None => StoreError::NotFound(format!("transfer {}", updated.id)),
            });
        }

        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::ContractOffer;
    use crate::core_types::Role;
    use crate::transfer::types::DataDestination;

    async fn create_test_pool() -> Option<PgPool> {
        // Try to connect to test database; tests are skipped when absent
        let database_url = std::env::var("DATABASE_URL").ok()?;

        PgPoolOptions::new()
            .max_connections(1)
            .connect(&database_url)
            .await
            .ok()
    }

    fn negotiation() -> ContractNegotiation {
        ContractNegotiation::initiate(
            ContractOffer::new(
                format!("A-{}", ulid::Ulid::new()),
                "P-1",
                "provider-1",
                "consumer-1",
            ),
            "provider.internal".into(),
        )
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL database"]
    async fn test_pg_create_and_find() {
        let pool = match create_test_pool().await {
            Some(p) => p,
            None => {
                eprintln!("Skipping test - database not available");
                return;
            }
        };

        let store = PgNegotiationStore::new(pool);
        store.ensure_schema().await.unwrap();

        let record = negotiation();
        let id = record.id;
        store.create(record).await.unwrap();

        let loaded = store.find_by_id(&id).await.unwrap();
        assert_eq!(loaded.id, id);
        assert_eq!(loaded.version, 1);
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL database"]
    async fn test_pg_cas_save() {
        let pool = match create_test_pool().await {
            Some(p) => p,
            None => {
                eprintln!("Skipping test - database not available");
                return;
            }
        };

        let store = PgNegotiationStore::new(pool);
        store.ensure_schema().await.unwrap();

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
    #[ignore = "requires PostgreSQL database"]
    async fn test_pg_lease_batch() {
        let pool = match create_test_pool().await {
            Some(p) => p,
            None => {
                eprintln!("Skipping test - database not available");
                return;
            }
        };

        let store = PgTransferStore::new(pool);
        store.ensure_schema().await.unwrap();

        let process = TransferProcess::new(
            format!("agr-{}", ulid::Ulid::new()),
            Role::Consumer,
            DataDestination::new("file"),
        );
        let id = process.id;
        store.create(process).await.unwrap();

        let leased = store
            .next_for_state(TransferState::Requested, 100, Duration::from_secs(30))
            .await
            .unwrap();
        assert!(leased.iter().any(|p| p.id == id));

        // Same batch query again: the record is leased out
        let again = store
            .next_for_state(TransferState::Requested, 100, Duration::from_secs(30))
            .await
            .unwrap();
        assert!(!again.iter().any(|p| p.id == id));
    }
}
