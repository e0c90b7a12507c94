//! Infrastructure layer: the job-queue engine, batch-changes adapters,
//! configuration and database wiring.

pub mod batches;
pub mod config;
pub mod db;
pub mod jobs;
