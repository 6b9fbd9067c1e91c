//! The `sylvad` crate is the aggregator daemon: it owns the node
//! lifecycle (activate / deactivate / collect / scan / shutdown), the
//! collection and idle-out timers, and the wiring between the sampling
//! core (`sylva-broker`) and the sqlite store (`sylvadb`).
//!
//! The control loop is the [`control::Aggregator`] actix actor; its
//! mailbox is the task queue, so state transitions are processed
//! strictly one at a time.

pub mod control;

use thiserror::Error;

pub use control::{
    Activate, Aggregator, AggregatorState, CollectionEnded, Deactivate, ExtendIdle, GetState,
    Scan, SetParam, Shutdown, StartCollect, StopCollect,
};

#[derive(Error, Debug)]
pub enum AggregatorError {
    #[error("Database error: {0}")]
    Database(#[from] sylvadb::DatabaseError),
    #[error("Store error: {0}")]
    Store(#[from] sylva_broker::StoreError),
    #[error("BLE client error: {0}")]
    Ble(#[from] sylva_broker::BleClientError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type AggregatorResult<T> = std::result::Result<T, AggregatorError>;
