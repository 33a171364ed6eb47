//! Dispatcher Loop
//!
//! The recurring scheduler that gives the engine its liveness guarantees:
//! it leases due records from the stores, routes each to its manager's step
//! function, and drains inbound messages, completion signals, and queued
//! local decisions.
//!
//! Workers may be replicated freely; mutual exclusion between them is
//! expressed entirely through store leasing and version CAS, never a shared
//! in-process lock.

pub mod worker;


pub use worker::{DispatcherWorker, TickStats};
