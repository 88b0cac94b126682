//! Trial store
//!
//! Persists a recording session: session metadata, one parameter row per
//! trial in a fixed-width table shared by the whole session, and per-trial
//! event tables plus variable-length array channels for streamed data.
//!
//! One SQLite file holds one session. Every mutating call runs in a single
//! transaction that is committed before the call returns.

mod error;
pub mod schema;

pub use error::{Result, StoreError};
pub use schema::TableSchema;

use chrono::Utc;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::protocol::{FieldKind, FieldMap, FieldValue, ProtocolDefinition};
use schema::{quote_ident, ARRAY_CHUNK_ROWS, EVENT_CHUNK_ROWS, TRIALS_TABLE};

/// Extension given to session files
pub const SESSION_EXTENSION: &str = "db";

/// Session-level metadata, written once as attributes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub animal_id: String,
    pub session_number: u32,
    pub rig: String,
    pub user: String,
    pub experiment_notes: String,
    /// Version of the host software
    pub host_version: String,
    /// Version of the experiment's own code
    pub usercode_version: String,
    /// Sketch name reported by the controller
    pub device_protocol_name: String,
    pub user_protocol_name: String,
    /// Start of the session, UTC epoch seconds
    pub start_date: f64,
    pub timezone: String,
    /// Free-form extra attributes
    #[serde(default)]
    pub user_metadata: BTreeMap<String, serde_json::Value>,
}

/// The root container of an open session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    path: PathBuf,
}

impl SessionHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// A trial container
#[derive(Debug, Clone, PartialEq)]
pub struct TrialHandle {
    /// Container name, `Trial` followed by the zero-padded trial number
    pub name: String,
    /// Caller-supplied trial number
    pub number: u32,
    /// Position of the trial's parameter row
    pub index: i64,
    /// Table of scalar stream fields, if the stream has any
    pub events: Option<TableSchema>,
    /// Array channels by field name
    pub arrays: BTreeMap<String, FieldKind>,
}

impl TrialHandle {
    fn container_name(number: u32) -> String {
        format!("Trial{:04}", number)
    }
}

/// Session persistence
///
/// Single writer: callers must not share one store between threads.
#[derive(Default)]
pub struct TrialStore {
    conn: Option<Connection>,
    path: Option<PathBuf>,
}

impl TrialStore {
    /// Create a store with no session open
    pub fn new() -> Self {
        Self::default()
    }

    /// Current UTC time as epoch seconds
    pub fn timestamp() -> f64 {
        Utc::now().timestamp_millis() as f64 / 1000.0
    }

    /// Resolve the session file for `filename`, adding the session extension
    pub fn session_path<P: AsRef<Path>>(filename: P) -> PathBuf {
        let filename = filename.as_ref();
        if filename.extension().and_then(|e| e.to_str()) == Some(SESSION_EXTENSION) {
            return filename.to_path_buf();
        }
        let mut name = OsString::from(filename.as_os_str());
        name.push(".");
        name.push(SESSION_EXTENSION);
        PathBuf::from(name)
    }

    /// Open (creating if absent) the session file and record its metadata
    ///
    /// Fails if the file already holds a session.
    pub fn create_session<P: AsRef<Path>>(
        &mut self,
        filename: P,
        metadata: &SessionMetadata,
    ) -> Result<SessionHandle> {
        let path = Self::session_path(filename);
        let mut conn = Connection::open(&path)?;
        schema::initialize_schema(&conn)?;

        let existing: i64 =
            conn.query_row("SELECT COUNT(*) FROM session_attributes", [], |row| {
                row.get(0)
            })?;
        if existing > 0 {
            return Err(StoreError::SessionExists(path));
        }

        let attributes = match serde_json::to_value(metadata)? {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        let tx = conn.transaction()?;
        for (key, value) in &attributes {
            tx.execute(
                "INSERT INTO session_attributes (key, value) VALUES (?1, ?2)",
                params![key, value.to_string()],
            )?;
        }
        tx.commit()?;

        info!(
            "created session for animal {} in {}",
            metadata.animal_id,
            path.display()
        );
        self.conn = Some(conn);
        self.path = Some(path.clone());
        Ok(SessionHandle { path })
    }

    /// Reopen an existing session file
    pub fn open<P: AsRef<Path>>(filename: P) -> Result<(Self, SessionHandle)> {
        let path = Self::session_path(filename);
        if !path.exists() {
            return Err(StoreError::NotASession(path));
        }
        let conn = Connection::open(&path)?;
        let is_session: Option<String> = conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'session_attributes'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        if is_session.is_none() {
            return Err(StoreError::NotASession(path));
        }

        let store = Self {
            conn: Some(conn),
            path: Some(path.clone()),
        };
        Ok((store, SessionHandle { path }))
    }

    /// Close the session file
    pub fn close(&mut self) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            conn.close().map_err(|(_, e)| StoreError::Database(e))?;
        }
        self.path = None;
        Ok(())
    }

    /// Path of the open session file
    pub fn database_file(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn conn(&self) -> Result<&Connection> {
        self.conn.as_ref().ok_or(StoreError::NoSession)
    }

    fn conn_mut(&mut self) -> Result<&mut Connection> {
        self.conn.as_mut().ok_or(StoreError::NoSession)
    }

    /// Fail unless `session` is the session open in this store
    fn check_session(&self, session: &SessionHandle) -> Result<()> {
        match self.path.as_deref() {
            None => Err(StoreError::NoSession),
            Some(path) if path == session.path() => Ok(()),
            Some(_) => Err(StoreError::ForeignSession(session.path.clone())),
        }
    }

    /// Session attributes as written by [`TrialStore::create_session`]
    pub fn session_attributes(
        &self,
        session: &SessionHandle,
    ) -> Result<BTreeMap<String, serde_json::Value>> {
        self.check_session(session)?;
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT key, value FROM session_attributes")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut attributes = BTreeMap::new();
        for row in rows {
            let (key, value) = row?;
            attributes.insert(key, serde_json::from_str(&value)?);
        }
        Ok(attributes)
    }

    /// Session metadata decoded back into its typed form
    pub fn session_metadata(&self, session: &SessionHandle) -> Result<SessionMetadata> {
        let attributes = self.session_attributes(session)?;
        let object: serde_json::Map<String, serde_json::Value> = attributes.into_iter().collect();
        Ok(serde_json::from_value(serde_json::Value::Object(object))?)
    }

    /// Define the parameter row layout shared by every trial
    ///
    /// Positions are stripped; only names and kinds are kept. A name defined
    /// in more than one set takes the kind of the last set.
    pub fn define_trial_schema(
        &mut self,
        protocol_parameters: &ProtocolDefinition,
        controller_parameters: &ProtocolDefinition,
        events: &ProtocolDefinition,
        session: &SessionHandle,
    ) -> Result<()> {
        self.check_session(session)?;
        let mut merged: Vec<(String, FieldKind)> = Vec::new();
        for (name, kind) in protocol_parameters
            .columns()
            .into_iter()
            .chain(controller_parameters.columns())
            .chain(events.columns())
        {
            match merged.iter_mut().find(|(existing, _)| *existing == name) {
                Some(entry) => entry.1 = kind,
                None => merged.push((name, kind)),
            }
        }
        if merged.is_empty() {
            return Err(StoreError::EmptySchema);
        }
        let table = TableSchema::new(TRIALS_TABLE, merged)?;

        let conn = self.conn_mut()?;
        if schema::table_exists(conn, TRIALS_TABLE)? {
            return Err(StoreError::SchemaAlreadyDefined);
        }
        let tx = conn.transaction()?;
        table.create(&tx)?;
        tx.commit()?;

        info!("defined trial schema with {} columns", table.columns.len());
        Ok(())
    }

    /// Columns of the trial parameter table
    pub fn trial_schema(&self) -> Result<TableSchema> {
        TableSchema::load(self.conn()?, TRIALS_TABLE)?.ok_or(StoreError::SchemaNotDefined)
    }

    /// Create a trial container and append its parameter row
    ///
    /// The trial index is the number of trials already recorded, regardless
    /// of `trial_number`.
    pub fn add_trial(
        &mut self,
        trial_number: u32,
        protocol_parameters: &FieldMap,
        controller_parameters: &ProtocolDefinition,
        stream: &ProtocolDefinition,
        session: &SessionHandle,
        description: &str,
    ) -> Result<TrialHandle> {
        self.check_session(session)?;
        let trials = self.trial_schema()?;
        let name = TrialHandle::container_name(trial_number);

        let mut arrays = BTreeMap::new();
        let mut scalars = Vec::new();
        for (field, kind) in stream.columns() {
            if kind.is_array() {
                arrays.insert(field, kind);
            } else {
                scalars.push((field, kind));
            }
        }
        let events = if scalars.is_empty() {
            None
        } else {
            Some(TableSchema::new(format!("{}_events", name), scalars)?)
        };

        let mut parameters = Vec::new();
        let controller_values = controller_parameters.values();
        for (column, value) in protocol_parameters.iter().chain(controller_values.iter()) {
            if let Some(value) = value {
                let value = trials.column_value(column, value)?;
                match parameters.iter_mut().find(|(c, _)| c == column) {
                    Some(entry) => entry.1 = value,
                    None => parameters.push((column.clone(), value)),
                }
            }
        }

        let conn = self.conn_mut()?;
        let exists: Option<String> = conn
            .query_row(
                "SELECT name FROM trial_groups WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(StoreError::TrialExists(name));
        }

        let tx = conn.transaction()?;
        let index = trials.row_count(&tx)?;
        tx.execute(
            "INSERT INTO trial_groups (name, trial_number, trial_index, description, event_table, event_chunk_rows, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                name,
                trial_number,
                index,
                description,
                events.as_ref().map(|t| t.name.clone()),
                events.as_ref().map(|_| EVENT_CHUNK_ROWS),
                Self::timestamp(),
            ],
        )?;
        for (field, kind) in &arrays {
            tx.execute(
                "INSERT INTO array_channels (trial_name, name, kind, chunk_rows) VALUES (?1, ?2, ?3, ?4)",
                params![name, field, serde_json::to_string(kind)?, ARRAY_CHUNK_ROWS],
            )?;
        }
        if let Some(events) = &events {
            events.create(&tx)?;
        }
        trials.insert(&tx, index, &parameters)?;
        tx.commit()?;

        info!("added {} at index {}", name, index);
        Ok(TrialHandle {
            name,
            number: trial_number,
            index,
            events,
            arrays,
        })
    }

    /// Look up a trial container by name
    pub fn open_trial(&self, name: &str) -> Result<TrialHandle> {
        let conn = self.conn()?;
        let row: Option<(u32, i64, Option<String>)> = conn
            .query_row(
                "SELECT trial_number, trial_index, event_table FROM trial_groups WHERE name = ?1",
                params![name],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let (number, index, event_table) =
            row.ok_or_else(|| StoreError::TrialNotFound(name.to_string()))?;

        let events = match event_table {
            Some(table) => TableSchema::load(conn, &table)?,
            None => None,
        };

        let mut stmt = conn.prepare("SELECT name, kind FROM array_channels WHERE trial_name = ?1")?;
        let rows = stmt.query_map(params![name], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut arrays = BTreeMap::new();
        for row in rows {
            let (field, kind) = row?;
            arrays.insert(field, serde_json::from_str(&kind)?);
        }

        Ok(TrialHandle {
            name: name.to_string(),
            number,
            index,
            events,
            arrays,
        })
    }

    /// All trial containers, ordered by trial index
    pub fn trials(&self, session: &SessionHandle) -> Result<Vec<TrialHandle>> {
        self.check_session(session)?;
        let names: Vec<String> = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare("SELECT name FROM trial_groups ORDER BY trial_index")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            let names = rows.collect::<rusqlite::Result<Vec<String>>>()?;
            names
        };
        names.iter().map(|name| self.open_trial(name)).collect()
    }

    /// Correct values in the most recently appended parameter row
    ///
    /// Absent values leave the stored value untouched.
    pub fn insert_event(&mut self, fields: &FieldMap, trial: &TrialHandle) -> Result<()> {
        let trials = self.trial_schema()?;
        let mut assignments = Vec::new();
        for (column, value) in fields {
            if let Some(value) = value {
                assignments.push((column.clone(), trials.column_value(column, value)?));
            }
        }

        let conn = self.conn_mut()?;
        let last: Option<i64> = conn.query_row(
            &format!("SELECT MAX(row_index) FROM {}", quote_ident(TRIALS_TABLE)),
            [],
            |row| row.get(0),
        )?;
        let last = last.ok_or(StoreError::NoParameterRow)?;
        if last != trial.index {
            warn!(
                "{} is at row {} but the last parameter row is {}",
                trial.name, trial.index, last
            );
        }
        if assignments.is_empty() {
            return Ok(());
        }

        let set: Vec<String> = assignments
            .iter()
            .enumerate()
            .map(|(i, (column, _))| format!("{} = ?{}", quote_ident(column), i + 1))
            .collect();
        let sql = format!(
            "UPDATE {} SET {} WHERE row_index = ?{}",
            quote_ident(TRIALS_TABLE),
            set.join(", "),
            assignments.len() + 1
        );
        let mut values: Vec<SqlValue> = assignments.into_iter().map(|(_, v)| v).collect();
        values.push(SqlValue::Integer(last));

        let tx = conn.transaction()?;
        tx.execute(&sql, rusqlite::params_from_iter(values))?;
        tx.commit()?;

        debug!("updated parameter row {}", last);
        Ok(())
    }

    /// Append one stream row to a trial
    ///
    /// Array fields go to their channels. Scalar fields form one new event
    /// row; fields that are absent or missing keep the previous row's value.
    pub fn insert_stream(&mut self, fields: &FieldMap, trial: &TrialHandle) -> Result<()> {
        let mut array_rows = Vec::new();
        let mut scalars = Vec::new();
        for (field, value) in fields {
            let Some(value) = value else {
                continue;
            };
            if let Some(kind) = trial.arrays.get(field) {
                let blob = schema::to_sql(*kind, value).ok_or_else(|| StoreError::KindMismatch {
                    column: field.clone(),
                    kind: *kind,
                })?;
                array_rows.push((field.clone(), blob));
                continue;
            }
            match &trial.events {
                Some(events) => scalars.push((field.clone(), events.column_value(field, value)?)),
                None => {
                    return Err(StoreError::UnknownColumn {
                        table: trial.name.clone(),
                        column: field.clone(),
                    })
                }
            }
        }

        let conn = self.conn_mut()?;
        let tx = conn.transaction()?;
        for (field, blob) in array_rows {
            tx.execute(
                "INSERT INTO array_rows (trial_name, name, data) VALUES (?1, ?2, ?3)",
                params![trial.name, field, blob],
            )?;
        }

        if let Some(events) = &trial.events {
            let previous = last_row_values(&tx, events)?;
            let next_index: i64 = previous.as_ref().map(|(index, _)| index + 1).unwrap_or(0);

            let mut row: Vec<(String, SqlValue)> = previous.map(|(_, row)| row).unwrap_or_default();
            for (field, value) in scalars {
                match row.iter_mut().find(|(c, _)| *c == field) {
                    Some(entry) => entry.1 = value,
                    None => row.push((field, value)),
                }
            }
            events.insert(&tx, next_index, &row)?;
        }
        tx.commit()?;

        debug!("appended stream row to {}", trial.name);
        Ok(())
    }

    /// Store a homogeneous int32/float32 array under a trial
    pub fn store_array(
        &mut self,
        name: &str,
        data: &FieldValue,
        group: &TrialHandle,
        description: &str,
    ) -> Result<()> {
        let kind = match data {
            FieldValue::Int32Array(_) => FieldKind::Int32Array,
            FieldValue::Float32Array(_) => FieldKind::Float32Array,
            _ => {
                return Err(StoreError::InvalidColumn {
                    column: name.to_string(),
                    reason: "only int32 and float32 arrays can be stored".to_string(),
                })
            }
        };

        let conn = self.conn_mut()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO stored_arrays (group_name, name, description, kind, data) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                group.name,
                name,
                description,
                serde_json::to_string(&kind)?,
                schema::encode_array(data)
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Read back an array stored with [`TrialStore::store_array`]
    pub fn stored_array(&self, name: &str, group: &TrialHandle) -> Result<Option<FieldValue>> {
        let row: Option<(String, Vec<u8>)> = self
            .conn()?
            .query_row(
                "SELECT kind, data FROM stored_arrays WHERE group_name = ?1 AND name = ?2",
                params![group.name, name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            Some((kind, data)) => {
                let kind: FieldKind = serde_json::from_str(&kind)?;
                schema::decode_array(kind, &data)
                    .map(Some)
                    .ok_or_else(|| StoreError::CorruptArray(name.to_string()))
            }
            None => Ok(None),
        }
    }

    /// The parameter row recorded for a trial, located by its trial index
    pub fn trial_parameters(&self, trial: &TrialHandle) -> Result<FieldMap> {
        let trials = self.trial_schema()?;
        let sql = format!(
            "SELECT {} FROM {} WHERE row_index = ?1",
            trials.select_list(),
            quote_ident(TRIALS_TABLE)
        );
        self.conn()?
            .query_row(&sql, params![trial.index], |row| trials.decode_row(row))
            .optional()?
            .ok_or_else(|| StoreError::TrialNotFound(trial.name.clone()))
    }

    /// Number of parameter rows recorded
    pub fn trial_count(&self) -> Result<i64> {
        self.trial_schema()?.row_count(self.conn()?)
    }

    /// All event rows of a trial, in append order
    pub fn event_rows(&self, trial: &TrialHandle) -> Result<Vec<FieldMap>> {
        let Some(events) = &trial.events else {
            return Ok(Vec::new());
        };
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM {} ORDER BY row_index",
            events.select_list(),
            quote_ident(&events.name)
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| events.decode_row(row))?;
        let rows = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// All rows appended to an array channel, in append order
    pub fn array_rows(&self, trial: &TrialHandle, name: &str) -> Result<Vec<FieldValue>> {
        let kind = *trial
            .arrays
            .get(name)
            .ok_or_else(|| StoreError::UnknownColumn {
                table: trial.name.clone(),
                column: name.to_string(),
            })?;
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT data FROM array_rows WHERE trial_name = ?1 AND name = ?2 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![trial.name, name], |row| row.get::<_, Vec<u8>>(0))?;

        let mut values = Vec::new();
        for row in rows {
            let data = row?;
            let value = schema::decode_array(kind, &data)
                .ok_or_else(|| StoreError::CorruptArray(name.to_string()))?;
            values.push(value);
        }
        Ok(values)
    }
}

/// Index and column values of the last row of `table`, NULLs skipped
fn last_row_values(
    conn: &Connection,
    table: &TableSchema,
) -> Result<Option<(i64, Vec<(String, SqlValue)>)>> {
    let sql = format!(
        "SELECT {} FROM {} ORDER BY row_index DESC LIMIT 1",
        table.select_list(),
        quote_ident(&table.name)
    );
    let row = conn
        .query_row(&sql, [], |row| {
            let index: i64 = row.get(0)?;
            let mut values = Vec::new();
            for (i, (column, _)) in table.columns.iter().enumerate() {
                let value: SqlValue = row.get(i + 1)?;
                if value != SqlValue::Null {
                    values.push((column.clone(), value));
                }
            }
            Ok((index, values))
        })
        .optional()?;
    Ok(row)
}
