//! Database-backed job queue engine.
//!
//! ## Design
//!
//! - A queue is one table bound declaratively through `QueueOptions`
//! - Claims are exclusive; a claimed record is heartbeated while its handler runs
//! - Handler failures spend a retry budget, then fail the record
//! - Stalled claims are reset by the `Resetter`, bounded by a reset budget
//!
//! ## Components
//!
//! - `QueueRecord`: engine bookkeeping around a typed payload
//! - `Store`: queue operations (in-memory or Postgres)
//! - `Worker`: poll loops running a `Handler` inside a `Transact` transaction
//! - `Resetter`: periodic stall recovery

pub mod clock;
pub mod postgres;
pub mod resetter;
pub mod store;
pub mod types;
pub mod worker;

pub use clock::{Clock, MockClock, SystemClock};
pub use postgres::{PgPayload, PostgresStore, PostgresTransactor};
pub use resetter::{Resetter, ResetterConfig};
pub use store::{InMemoryStore, Store, StoreError};
pub use types::{QueueOptions, QueueRecord, RecordState, ResetOutcome};
pub use worker::{
    Handler, HandlerError, Processed, RoutineHandle, Transact, Worker, WorkerConfig,
};
