//! Transfer Process
//!
//! Implements the data transfer lifecycle as a persistent state machine
//! driven once a contract agreement exists.
//!
//! # Architecture
//!
//! ```text
//! REQUESTED → PROVISIONING → PROVISIONED → IN_PROGRESS → COMPLETED
//!      ↓            ↓             ↓             ↓            ↓
//!                       TERMINATED ──────────────→ DEPROVISIONING → DEPROVISIONED
//! ```
//!
//! # Safety Invariants
//!
//! 1. **Persist-Before-Call**: the record enters PROVISIONING before the
//!    data flow controller is invoked.
//! 2. A transfer process is only created referencing an existing contract
//!    agreement; the validity window is re-checked before provisioning.
//! 3. At most one non-finished process per agreement id, enforced by the
//!    store on create.
//! 4. All controller operations must be idempotent per transfer id.

pub mod manager;
pub mod state;
pub mod store;
pub mod types;

#[cfg(test)]
mod integration_tests;

// Re-exports for convenience
pub use manager::{TransferError, TransferManager};
pub use state::{TransferState, TransferTerminationReason};
pub use store::TransferStore;
pub use types::{DataDestination, ProvisionedResource, TransferProcess};
