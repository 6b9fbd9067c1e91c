//! The `sylvadb` crate is the persistence layer of the sylva
//! aggregator: a diesel/sqlite implementation of the store contract
//! defined in `sylva-broker`, plus the session-end consolidation pass.
//!
//! Responsibilities:
//! 1. Node and device registry: logical nodes, their radios, cached
//!    classifications, battery/last-comms bookkeeping
//! 2. Capture session lifecycle, including crash recovery of sessions
//!    left open by a previous run
//! 3. The per-session staging buffer (`session_data`) that read tasks
//!    append to field-by-field while sampling
//! 4. Consolidation/offload ([`Consolidator`]): folding staged fields
//!    into permanent multi-field `node_data` records, then clearing
//!    the staging buffer
//! 5. System parameters with set-if-absent defaults
//!
//! Concurrency discipline: [`SqliteStoreFactory`] hands out one
//! connection-scoped handle per operation; no handle is ever shared
//! across tasks.

mod db;
mod models;
mod offload;
mod schema;

pub use db::{DatabaseError, SqliteStore, SqliteStoreFactory, MIGRATIONS};
pub use offload::{
    consolidate, fetch_records, ConsolidationOutcome, Consolidator, DownloadOrigin,
    DownloadRecord, OffloadStats, PartialRecord, StagedReading,
};
