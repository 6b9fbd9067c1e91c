//! sqlite implementation of the broker's store contract.
//!
//! [`SqliteStoreFactory`] runs the embedded migrations once at startup
//! and then hands out one [`SqliteStore`] (one `SqliteConnection`) per
//! operation scope. Handles are never shared across tasks; the sqlite
//! file is the only shared state.

use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use thiserror::Error;

use sylva_broker::{
    DeviceKind, DeviceRecord, NodeClass, NodeRecord, SessionRecord, Store, StoreError,
    StoreFactory,
};

use crate::models::{
    NewSession, NewSessionData, NodeDeviceRow, NodeRow, SessionRow, SysParamRow,
};
use crate::schema::{node_devices, nodes, session_data, sessions, sys_params};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!();

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Connection(#[from] diesel::ConnectionError),
    #[error("Query error: {0}")]
    Query(#[from] diesel::result::Error),
    #[error("Migration error: {0}")]
    Migration(String),
}

impl From<DatabaseError> for StoreError {
    fn from(e: DatabaseError) -> Self {
        StoreError::Backend(e.to_string())
    }
}

fn store_err(e: diesel::result::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

/// Opens one connection per store handle against a fixed database url
pub struct SqliteStoreFactory {
    database_url: String,
}

impl SqliteStoreFactory {
    /// Connects once to run pending migrations, then serves handles
    pub fn new(database_url: &str) -> Result<Self, DatabaseError> {
        let mut conn = SqliteConnection::establish(database_url)?;
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;

        log::debug!("Database ready at {database_url:}");

        Ok(Self {
            database_url: database_url.to_string(),
        })
    }

    pub fn open_store(&self) -> Result<SqliteStore, DatabaseError> {
        Ok(SqliteStore {
            conn: SqliteConnection::establish(&self.database_url)?,
        })
    }
}

impl StoreFactory for SqliteStoreFactory {
    fn open(&self) -> Result<Box<dyn Store>, StoreError> {
        Ok(Box::new(self.open_store()?))
    }
}

/// One connection-scoped store handle
pub struct SqliteStore {
    conn: SqliteConnection,
}

impl SqliteStore {
    /// In-memory database with migrations applied; every handle is its
    /// own database, so this is only useful where one handle suffices
    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        let mut conn = SqliteConnection::establish(":memory:")?;
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;
        Ok(Self { conn })
    }

    pub(crate) fn conn(&mut self) -> &mut SqliteConnection {
        &mut self.conn
    }

    fn node_record(node: NodeRow, device: Option<NodeDeviceRow>) -> NodeRecord {
        let (kind, address) = match device {
            Some(device) => (
                DeviceKind::from(device.device_type.as_str()),
                if node.address.is_empty() {
                    device.address
                } else {
                    node.address.clone()
                },
            ),
            None => (DeviceKind::Unknown, node.address.clone()),
        };

        NodeRecord {
            id: node.id,
            address,
            kind,
            class: NodeClass::from(node.node_class.as_str()),
            site_name: node.site_name,
            lat: node.lat,
            lon: node.lon,
        }
    }

    fn open_session_id(&mut self) -> Result<Option<SessionRow>, StoreError> {
        sessions::table
            .filter(sessions::end_time.is_null())
            .order(sessions::id.desc())
            .select(SessionRow::as_select())
            .first(&mut self.conn)
            .optional()
            .map_err(store_err)
    }
}

impl Store for SqliteStore {
    fn collectable_nodes(&mut self) -> Result<Vec<NodeRecord>, StoreError> {
        let rows = nodes::table
            .left_join(node_devices::table)
            .filter(
                nodes::node_class
                    .eq(NodeClass::Sensor.as_str())
                    .or(nodes::node_class.eq(NodeClass::Unknown.as_str())),
            )
            .order(nodes::id.asc())
            .select((NodeRow::as_select(), Option::<NodeDeviceRow>::as_select()))
            .load::<(NodeRow, Option<NodeDeviceRow>)>(&mut self.conn)
            .map_err(store_err)?;

        Ok(rows
            .into_iter()
            .map(|(node, device)| Self::node_record(node, device))
            .collect())
    }

    fn get_node(&mut self, id: &str) -> Result<Option<NodeRecord>, StoreError> {
        let row = nodes::table
            .left_join(node_devices::table)
            .filter(nodes::id.eq(id))
            .select((NodeRow::as_select(), Option::<NodeDeviceRow>::as_select()))
            .first::<(NodeRow, Option<NodeDeviceRow>)>(&mut self.conn)
            .optional()
            .map_err(store_err)?;

        Ok(row.map(|(node, device)| Self::node_record(node, device)))
    }

    fn upsert_node(&mut self, node: &NodeRecord) -> Result<(), StoreError> {
        let row = NodeRow {
            id: node.id.clone(),
            address: node.address.clone(),
            node_class: node.class.as_str().to_string(),
            site_name: node.site_name.clone(),
            lat: node.lat,
            lon: node.lon,
        };

        diesel::replace_into(nodes::table)
            .values(&row)
            .execute(&mut self.conn)
            .map_err(store_err)?;

        if !node.address.is_empty() {
            // Keep the radio record in step without clobbering its
            // battery / last-comms bookkeeping
            diesel::insert_into(node_devices::table)
                .values(&NodeDeviceRow {
                    address: node.address.clone(),
                    node_id: node.id.clone(),
                    device_type: node.kind.as_str().to_string(),
                    last_scanned: None,
                    last_comms: None,
                    battery: None,
                })
                .on_conflict(node_devices::address)
                .do_update()
                .set((
                    node_devices::node_id.eq(node.id.clone()),
                    node_devices::device_type.eq(node.kind.as_str().to_string()),
                ))
                .execute(&mut self.conn)
                .map_err(store_err)?;
        }

        Ok(())
    }

    fn upsert_device(&mut self, device: &DeviceRecord) -> Result<(), StoreError> {
        diesel::insert_into(node_devices::table)
            .values(&NodeDeviceRow {
                address: device.address.clone(),
                node_id: device.node_id.clone(),
                device_type: device.kind.as_str().to_string(),
                last_scanned: device.last_scanned,
                last_comms: device.last_comms,
                battery: device.battery,
            })
            .on_conflict(node_devices::address)
            .do_update()
            .set((
                node_devices::node_id.eq(device.node_id.clone()),
                node_devices::device_type.eq(device.kind.as_str().to_string()),
                node_devices::last_scanned.eq(device.last_scanned),
            ))
            .execute(&mut self.conn)
            .map_err(store_err)?;

        Ok(())
    }

    fn record_classification(
        &mut self,
        node_id: &str,
        address: &str,
        kind: DeviceKind,
        class: NodeClass,
    ) -> Result<(), StoreError> {
        diesel::update(nodes::table.filter(nodes::id.eq(node_id)))
            .set(nodes::node_class.eq(class.as_str()))
            .execute(&mut self.conn)
            .map_err(store_err)?;

        diesel::insert_into(node_devices::table)
            .values(&NodeDeviceRow {
                address: address.to_string(),
                node_id: node_id.to_string(),
                device_type: kind.as_str().to_string(),
                last_scanned: None,
                last_comms: None,
                battery: None,
            })
            .on_conflict(node_devices::address)
            .do_update()
            .set((
                node_devices::node_id.eq(node_id.to_string()),
                node_devices::device_type.eq(kind.as_str().to_string()),
            ))
            .execute(&mut self.conn)
            .map_err(store_err)?;

        Ok(())
    }

    fn update_device_battery(
        &mut self,
        address: &str,
        battery: f64,
        ts: i64,
    ) -> Result<(), StoreError> {
        diesel::update(node_devices::table.filter(node_devices::address.eq(address)))
            .set((
                node_devices::battery.eq(Some(battery)),
                node_devices::last_comms.eq(Some(ts)),
            ))
            .execute(&mut self.conn)
            .map_err(store_err)?;

        Ok(())
    }

    fn open_session(&mut self, now: i64) -> Result<i32, StoreError> {
        // Crash recovery: a session left open by a previous run is
        // closed before the new one starts
        diesel::update(sessions::table.filter(sessions::end_time.is_null()))
            .set(sessions::end_time.eq(Some(now)))
            .execute(&mut self.conn)
            .map_err(store_err)?;

        let id = diesel::insert_into(sessions::table)
            .values(&NewSession { start_time: now })
            .returning(sessions::id)
            .get_result::<i32>(&mut self.conn)
            .map_err(store_err)?;

        Ok(id)
    }

    fn current_session(&mut self) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.open_session_id()?.map(|row| SessionRecord {
            id: row.id,
            start_time: row.start_time,
            end_time: row.end_time,
        }))
    }

    fn terminate_session(&mut self, now: i64) -> Result<(), StoreError> {
        diesel::update(sessions::table.filter(sessions::end_time.is_null()))
            .set(sessions::end_time.eq(Some(now)))
            .execute(&mut self.conn)
            .map_err(store_err)?;

        Ok(())
    }

    fn append_staged(
        &mut self,
        source: &str,
        field: &str,
        value: f64,
        ts: i64,
    ) -> Result<(), StoreError> {
        let session = self.open_session_id()?.ok_or(StoreError::NoOpenSession)?;

        diesel::insert_into(session_data::table)
            .values(&NewSessionData {
                session_id: session.id,
                source_id: source.to_string(),
                content: format!("{field}: {value}"),
                timestamp: ts,
            })
            .execute(&mut self.conn)
            .map_err(store_err)?;

        Ok(())
    }

    fn get_param(&mut self, name: &str) -> Result<Option<String>, StoreError> {
        let row = sys_params::table
            .filter(sys_params::name.eq(name))
            .select(SysParamRow::as_select())
            .first(&mut self.conn)
            .optional()
            .map_err(store_err)?;

        Ok(row.map(|row| row.value))
    }

    fn set_param(&mut self, name: &str, value: &str) -> Result<(), StoreError> {
        diesel::replace_into(sys_params::table)
            .values(&SysParamRow {
                name: name.to_string(),
                value: value.to_string(),
            })
            .execute(&mut self.conn)
            .map_err(store_err)?;

        Ok(())
    }
}
