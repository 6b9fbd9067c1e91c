//! Session buffer consolidation.
//!
//! During a capture session the staging table accumulates one row per
//! field per sampling cycle. At session end the offload pass folds
//! those rows back into multi-field records, one [`PartialRecord`] at a
//! time: a staged field goes into the first in-progress record for its
//! source that does not hold that field yet; a record reaching its
//! class's expected field count is emitted as complete; whatever is
//! still in progress when the staging rows run out is flushed as-is.
//! Staged data is never discarded — a partial record beats a lost one.
//!
//! The fold itself ([`consolidate`]) is pure; [`Consolidator`] wraps it
//! with the database plumbing (fetch staged rows, resolve per-source
//! expected counts from the device table, write `node_data` records
//! best-effort, clear staging).

use std::collections::{BTreeMap, HashMap};

use diesel::prelude::*;

use sylva_broker::{DeviceKind, SessionId};

use crate::db::{DatabaseError, SqliteStore};
use crate::models::{NewNodeData, NodeDataRow, NodeDeviceRow, NodeRow, SessionDataRow};
use crate::schema::{node_data, node_devices, nodes, session_data};

/// One staged field reading, decoded from its `"field: value"` row
#[derive(Debug, Clone, PartialEq)]
pub struct StagedReading {
    pub source_id: String,
    pub field: String,
    pub value: String,
    pub ts: i64,
}

impl StagedReading {
    pub fn new(source_id: &str, field: &str, value: &str, ts: i64) -> Self {
        Self {
            source_id: source_id.to_string(),
            field: field.to_string(),
            value: value.to_string(),
            ts,
        }
    }

    /// Splits the staged content encoding. Rows that do not match
    /// `"field: value"` are data errors and yield `None`.
    fn from_row(row: &SessionDataRow) -> Option<Self> {
        let (field, value) = row.content.split_once(':')?;
        Some(Self {
            source_id: row.source_id.clone(),
            field: field.trim().to_string(),
            value: value.trim().to_string(),
            ts: row.timestamp,
        })
    }
}

/// An in-progress (or finished) consolidated record for one source
#[derive(Debug, Clone, PartialEq)]
pub struct PartialRecord {
    pub source_id: String,
    pub fields: BTreeMap<String, String>,
    /// Field count at which the record is complete; `None` when the
    /// source's class is unknown, in which case the record only leaves
    /// via the end-of-session flush
    pub expected_fields: Option<usize>,
    /// Timestamp of the last contributing reading
    pub last_ts: i64,
}

impl PartialRecord {
    fn new(source_id: &str, expected_fields: Option<usize>) -> Self {
        Self {
            source_id: source_id.to_string(),
            fields: BTreeMap::new(),
            expected_fields,
            last_ts: 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        match self.expected_fields {
            Some(expected) => self.fields.len() >= expected,
            None => false,
        }
    }
}

/// Output of one consolidation fold: records that reached their class's
/// field count, and the leftovers flushed at session close
#[derive(Debug, Default)]
pub struct ConsolidationOutcome {
    pub complete: Vec<PartialRecord>,
    pub flushed_partials: Vec<PartialRecord>,
}

impl ConsolidationOutcome {
    /// Emission order: completed records first, then the flushed tail
    pub fn into_records(self) -> Vec<PartialRecord> {
        let mut records = self.complete;
        records.extend(self.flushed_partials);
        records
    }
}

/// Pure consolidation fold over staged readings, in arrival order.
/// `expected_for` maps a source id to its class's expected field count.
pub fn consolidate<F>(staged: &[StagedReading], expected_for: F) -> ConsolidationOutcome
where
    F: Fn(&str) -> Option<usize>,
{
    let mut in_progress: BTreeMap<String, Vec<PartialRecord>> = BTreeMap::new();
    let mut outcome = ConsolidationOutcome::default();

    for entry in staged {
        let records = in_progress.entry(entry.source_id.clone()).or_default();

        let slot = records
            .iter()
            .position(|record| !record.fields.contains_key(&entry.field));

        let index = match slot {
            Some(index) => index,
            None => {
                records.push(PartialRecord::new(
                    &entry.source_id,
                    expected_for(&entry.source_id),
                ));
                records.len() - 1
            }
        };

        records[index]
            .fields
            .insert(entry.field.clone(), entry.value.clone());
        records[index].last_ts = entry.ts;

        if records[index].is_complete() {
            outcome.complete.push(records.remove(index));
        }
    }

    // Session close must not drop partial data
    for (_, records) in in_progress {
        for record in records {
            if !record.fields.is_empty() {
                outcome.flushed_partials.push(record);
            }
        }
    }

    outcome
}

#[derive(Debug, Default, PartialEq)]
pub struct OffloadStats {
    pub records_written: usize,
    pub partials_flushed: usize,
    pub write_failures: usize,
    pub staged_cleared: usize,
}

/// Consolidated-record view served to the line-protocol handler
#[derive(Debug, Clone, serde::Serialize)]
pub struct DownloadRecord {
    pub rec_id: i32,
    pub timestamp: i64,
    pub sampling_site: Option<String>,
    pub data: serde_json::Value,
    pub origin: DownloadOrigin,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DownloadOrigin {
    pub name: String,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub addr: String,
}

/// Session-end offload: staged readings in, permanent records out
pub struct Consolidator {
    expected_fields_soil: usize,
    expected_fields_ph: usize,
}

impl Consolidator {
    pub fn new(expected_fields_soil: usize, expected_fields_ph: usize) -> Self {
        Self {
            expected_fields_soil,
            expected_fields_ph,
        }
    }

    /// Consolidates and archives every staged reading of the session,
    /// then clears the staging table. A failed record write is logged
    /// and the remaining records still drained.
    pub fn offload_session(
        &self,
        store: &mut SqliteStore,
        session: SessionId,
    ) -> Result<OffloadStats, DatabaseError> {
        let rows = session_data::table
            .filter(session_data::session_id.eq(session))
            .order(session_data::id.asc())
            .select(SessionDataRow::as_select())
            .load::<SessionDataRow>(store.conn())?;

        let staged = rows
            .iter()
            .filter_map(|row| {
                let parsed = StagedReading::from_row(row);
                if parsed.is_none() {
                    log::error!(
                        "[{}] Malformed staged content, skipping: {}",
                        row.source_id,
                        row.content
                    );
                }
                parsed
            })
            .collect::<Vec<_>>();

        let kinds = self.device_kinds(store)?;
        let expected_for = |source: &str| {
            kinds.get(source).and_then(|kind| match kind {
                DeviceKind::Parrot => Some(self.expected_fields_soil),
                DeviceKind::Bluno => Some(self.expected_fields_ph),
                _ => None,
            })
        };

        let outcome = consolidate(&staged, expected_for);

        let mut stats = OffloadStats {
            partials_flushed: outcome.flushed_partials.len(),
            ..OffloadStats::default()
        };

        let mut block_counters: HashMap<String, i32> = HashMap::new();

        for record in outcome.into_records() {
            let block = block_counters.entry(record.source_id.clone()).or_insert(0);
            *block += 1;

            let content = match serde_json::to_string(&record.fields) {
                Ok(content) => content,
                Err(e) => {
                    log::error!("[{}] Record serialization failed: {e:}", record.source_id);
                    stats.write_failures += 1;
                    continue;
                }
            };

            let row = NewNodeData {
                session_id: session,
                block_id: *block,
                source_id: record.source_id.clone(),
                content,
                timestamp: record.last_ts,
            };

            match diesel::insert_into(node_data::table)
                .values(&row)
                .execute(store.conn())
            {
                Ok(_) => stats.records_written += 1,
                Err(e) => {
                    // Best-effort drain: other records still go through
                    log::error!("[{}] Failed to archive record: {e:}", record.source_id);
                    stats.write_failures += 1;
                }
            }
        }

        stats.staged_cleared = diesel::delete(
            session_data::table.filter(session_data::session_id.eq(session)),
        )
        .execute(store.conn())?;

        log::info!(
            "Offloaded session {session:}: {} records ({} partial), {} failures, {} staged rows cleared",
            stats.records_written,
            stats.partials_flushed,
            stats.write_failures,
            stats.staged_cleared
        );

        Ok(stats)
    }

    fn device_kinds(
        &self,
        store: &mut SqliteStore,
    ) -> Result<HashMap<String, DeviceKind>, DatabaseError> {
        let rows = node_devices::table
            .select(NodeDeviceRow::as_select())
            .load::<NodeDeviceRow>(store.conn())?;

        Ok(rows
            .into_iter()
            .map(|row| (row.node_id, DeviceKind::from(row.device_type.as_str())))
            .collect())
    }
}

/// Bounded fetch of archived records joined with their node origin,
/// ready for the external request handler to frame and send
pub fn fetch_records(
    store: &mut SqliteStore,
    limit: Option<i64>,
    offset: Option<i64>,
    start_id: i32,
    end_id: i32,
) -> Result<Vec<DownloadRecord>, DatabaseError> {
    let mut query = node_data::table
        .filter(node_data::id.ge(start_id))
        .filter(node_data::id.le(end_id))
        .order(node_data::id.asc())
        .select(NodeDataRow::as_select())
        .into_boxed();

    if let Some(limit) = limit {
        query = query.limit(limit);
    }
    if let Some(offset) = offset {
        query = query.offset(offset);
    }

    let rows = query.load::<NodeDataRow>(store.conn())?;

    let node_rows = nodes::table
        .select(NodeRow::as_select())
        .load::<NodeRow>(store.conn())?;
    let origins: HashMap<String, NodeRow> = node_rows
        .into_iter()
        .map(|row| (row.id.clone(), row))
        .collect();

    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        let data = match serde_json::from_str::<serde_json::Value>(&row.content) {
            Ok(data) => data,
            Err(e) => {
                log::error!("[{}] Unreadable archived record: {e:}", row.source_id);
                continue;
            }
        };

        let origin = origins.get(&row.source_id);

        records.push(DownloadRecord {
            rec_id: row.id,
            timestamp: row.timestamp,
            sampling_site: origin.and_then(|o| o.site_name.clone()),
            data,
            origin: DownloadOrigin {
                name: row.source_id.clone(),
                lat: origin.and_then(|o| o.lat),
                lon: origin.and_then(|o| o.lon),
                addr: origin.map(|o| o.address.clone()).unwrap_or_default(),
            },
        });
    }

    Ok(records)
}
