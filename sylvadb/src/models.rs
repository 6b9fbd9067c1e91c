use diesel::prelude::*;

/// Row in the `nodes` table: one logical sensing unit
#[derive(Queryable, Selectable, Insertable, PartialEq, Debug, Clone)]
#[diesel(table_name = crate::schema::nodes)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub(crate) struct NodeRow {
    pub(crate) id: String,
    pub(crate) address: String,
    pub(crate) node_class: String,
    pub(crate) site_name: Option<String>,
    pub(crate) lat: Option<f64>,
    pub(crate) lon: Option<f64>,
}

/// Row in the `node_devices` table: one physical radio bound to a node
#[derive(Queryable, Selectable, Insertable, PartialEq, Debug, Clone)]
#[diesel(table_name = crate::schema::node_devices)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub(crate) struct NodeDeviceRow {
    pub(crate) address: String,
    pub(crate) node_id: String,
    pub(crate) device_type: String,
    pub(crate) last_scanned: Option<i64>,
    pub(crate) last_comms: Option<i64>,
    pub(crate) battery: Option<f64>,
}

#[derive(Queryable, Selectable, PartialEq, Debug, Clone, Copy)]
#[diesel(table_name = crate::schema::sessions)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub(crate) struct SessionRow {
    pub(crate) id: i32,
    pub(crate) start_time: i64,
    pub(crate) end_time: Option<i64>,
}

#[derive(Insertable)]
#[diesel(table_name = crate::schema::sessions)]
pub(crate) struct NewSession {
    pub(crate) start_time: i64,
}

/// Ephemeral staged reading: one field of one sampling cycle, content
/// encoded as `"field: value"`. Cleared in bulk by the offload pass.
#[derive(Queryable, Selectable, PartialEq, Debug, Clone)]
#[diesel(table_name = crate::schema::session_data)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub(crate) struct SessionDataRow {
    pub(crate) id: i32,
    pub(crate) session_id: i32,
    pub(crate) source_id: String,
    pub(crate) content: String,
    pub(crate) timestamp: i64,
}

#[derive(Insertable)]
#[diesel(table_name = crate::schema::session_data)]
pub(crate) struct NewSessionData {
    pub(crate) session_id: i32,
    pub(crate) source_id: String,
    pub(crate) content: String,
    pub(crate) timestamp: i64,
}

/// Permanent consolidated record: a merged field dictionary for one
/// source, tagged with its per-source block id within the session
#[derive(Queryable, Selectable, PartialEq, Debug, Clone)]
#[diesel(table_name = crate::schema::node_data)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub(crate) struct NodeDataRow {
    pub(crate) id: i32,
    pub(crate) session_id: i32,
    pub(crate) block_id: i32,
    pub(crate) source_id: String,
    pub(crate) content: String,
    pub(crate) timestamp: i64,
}

#[derive(Insertable)]
#[diesel(table_name = crate::schema::node_data)]
pub(crate) struct NewNodeData {
    pub(crate) session_id: i32,
    pub(crate) block_id: i32,
    pub(crate) source_id: String,
    pub(crate) content: String,
    pub(crate) timestamp: i64,
}

#[derive(Queryable, Selectable, Insertable, PartialEq, Debug, Clone)]
#[diesel(table_name = crate::schema::sys_params)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub(crate) struct SysParamRow {
    pub(crate) name: String,
    pub(crate) value: String,
}
