//! Persistent-store collaborator contract.
//!
//! The sampling core does not own a database; it consumes these traits.
//! A [`StoreFactory`] hands out one connection-scoped [`Store`] handle
//! per operation, so handles are never shared across concurrently
//! running tasks. The `sylvadb` crate provides the sqlite
//! implementation; tests use an in-memory one.

use thiserror::Error;

use crate::{
    device::{DeviceKind, NodeClass},
    SessionId,
};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("no open session")]
    NoOpenSession,
    #[error("record not found: {0}")]
    NotFound(String),
}

/// One logical sensing node together with its bound radio
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRecord {
    pub id: String,
    pub address: String,
    pub kind: DeviceKind,
    pub class: NodeClass,
    pub site_name: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
}

impl NodeRecord {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            kind: DeviceKind::Unknown,
            class: NodeClass::Unknown,
            site_name: None,
            lat: None,
            lon: None,
        }
    }
}

/// One physical radio record in the device table
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRecord {
    pub address: String,
    pub node_id: String,
    pub kind: DeviceKind,
    pub last_scanned: Option<i64>,
    pub last_comms: Option<i64>,
    pub battery: Option<f64>,
}

/// One capture session row; `end_time` is `None` while the session is
/// open
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionRecord {
    pub id: SessionId,
    pub start_time: i64,
    pub end_time: Option<i64>,
}

/// Connection-scoped store handle. Implementations open their own
/// backend connection and release it on drop; callers never hold one
/// handle across concurrent tasks.
pub trait Store: Send {
    /// Nodes eligible for a collection pass: class SENSOR or UNKNOWN
    fn collectable_nodes(&mut self) -> Result<Vec<NodeRecord>, StoreError>;

    fn get_node(&mut self, id: &str) -> Result<Option<NodeRecord>, StoreError>;

    fn upsert_node(&mut self, node: &NodeRecord) -> Result<(), StoreError>;

    fn upsert_device(&mut self, device: &DeviceRecord) -> Result<(), StoreError>;

    /// Caches a resolved classification on both the node and its
    /// device record; classification happens exactly once per device
    fn record_classification(
        &mut self,
        node_id: &str,
        address: &str,
        kind: DeviceKind,
        class: NodeClass,
    ) -> Result<(), StoreError>;

    fn update_device_battery(
        &mut self,
        address: &str,
        battery: f64,
        ts: i64,
    ) -> Result<(), StoreError>;

    /// Opens a new capture session. A stale open session (crash
    /// leftover) is terminated first; at most one session is ever open.
    fn open_session(&mut self, now: i64) -> Result<SessionId, StoreError>;

    fn current_session(&mut self) -> Result<Option<SessionRecord>, StoreError>;

    fn terminate_session(&mut self, now: i64) -> Result<(), StoreError>;

    /// Appends one staged field reading to the open session's buffer
    fn append_staged(
        &mut self,
        source: &str,
        field: &str,
        value: f64,
        ts: i64,
    ) -> Result<(), StoreError>;

    fn get_param(&mut self, name: &str) -> Result<Option<String>, StoreError>;

    fn set_param(&mut self, name: &str, value: &str) -> Result<(), StoreError>;
}

/// Hands out connection-scoped [`Store`] handles
pub trait StoreFactory: Send + Sync {
    fn open(&self) -> Result<Box<dyn Store>, StoreError>;
}
