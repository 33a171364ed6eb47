//! State Stores
//!
//! Durable keyed storage for negotiation and transfer-process records.
//! Mutual exclusion between dispatcher workers is lease-based: fetching a
//! record for a state transition claims it under a time-bounded lease, and
//! every write goes through an optimistic compare-and-swap on the record's
//! version counter. No global lock exists anywhere.
//!
//! Backends: [`memory`] (tests, demos), [`fs`] (single-node durable),
//! [`postgres`] (multi-worker durable).

pub mod fs;
pub mod memory;
pub mod postgres;

pub use fs::{FsNegotiationStore, FsTransferStore};
pub use memory::{InMemoryNegotiationStore, InMemoryTransferStore};
pub use postgres::{PgNegotiationStore, PgTransferStore};

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Store error taxonomy
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// An invariant was violated on create (duplicate id, second active
    /// record for the same key)
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The stored version moved since the record was loaded; the caller's
    /// write was discarded
    #[error("concurrent modification: {0}")]
    ConcurrentModification(String),

    /// Backend I/O failure (disk, database); retryable
    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Get the error code for logs and API responses
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Conflict(_) => "CONFLICT",
            StoreError::NotFound(_) => "NOT_FOUND",
            StoreError::ConcurrentModification(_) => "CONCURRENT_MODIFICATION",
            StoreError::Backend(_) => "BACKEND_ERROR",
        }
    }

    /// Backend failures are worth retrying; the rest are definitive
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Backend(_))
    }
}

/// A time-bounded exclusive claim on a record, granted to one worker so no
/// second worker processes the same record concurrently. Expires on its own
/// if the holder crashes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn acquire(duration: Duration) -> Self {
        Self {
            token: uuid::Uuid::new_v4().to_string(),
            expires_at: Utc::now() + chrono::Duration::milliseconds(duration.as_millis() as i64),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
