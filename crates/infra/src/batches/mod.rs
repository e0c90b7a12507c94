//! Batch-changes adapters for the queue engine.
//!
//! - `queues`: table bindings for each batch-changes queue
//! - `rows`: payload decoding from Postgres rows
//! - `store`: transaction-scoped access to the batch-changes tables
//! - `workers`: the handlers, and `BatchesWorkers` to run them all

pub mod queues;
mod rows;
pub mod store;
pub mod workers;

pub use store::{BatchesTx, InMemoryBatchesStore, InMemoryBatchesTx};
pub use workers::{BatchesWorkers, Collaborators};
