//! Session file schema
//!
//! Fixed tables hold session attributes, the trial catalogue and array
//! channels. Trial parameter and event tables are generated from field
//! definitions; the `columns` catalogue remembers each column's kind so a
//! reopened file decodes back to typed values.

use byteorder::{ByteOrder, LittleEndian};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, Connection, Row};

use super::error::{Result, StoreError};
use crate::protocol::{FieldKind, FieldMap, FieldValue};

/// Parameter table shared by every trial of a session
pub const TRIALS_TABLE: &str = "trials";

/// Row index column present in every generated table
pub const ROW_INDEX: &str = "row_index";

/// Rows per chunk hint for event tables
pub const EVENT_CHUNK_ROWS: i64 = 256;

/// Rows per chunk hint for array channels
pub const ARRAY_CHUNK_ROWS: i64 = 512;

/// Fixed tables, created when a session file is initialised
pub const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = FULL;

-- Session metadata as JSON values
CREATE TABLE IF NOT EXISTS session_attributes (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- Kinds of generated columns, in declaration order
CREATE TABLE IF NOT EXISTS columns (
    table_name TEXT NOT NULL,
    column_name TEXT NOT NULL,
    ordinal INTEGER NOT NULL,
    kind TEXT NOT NULL,
    PRIMARY KEY (table_name, column_name)
);

-- One row per trial container
CREATE TABLE IF NOT EXISTS trial_groups (
    name TEXT PRIMARY KEY,
    trial_number INTEGER NOT NULL,
    trial_index INTEGER NOT NULL UNIQUE,
    description TEXT NOT NULL,
    event_table TEXT,
    event_chunk_rows INTEGER,
    created_at REAL NOT NULL
);

-- Variable-length array channels; each append is one ragged row
CREATE TABLE IF NOT EXISTS array_channels (
    trial_name TEXT NOT NULL,
    name TEXT NOT NULL,
    kind TEXT NOT NULL,
    chunk_rows INTEGER NOT NULL,
    PRIMARY KEY (trial_name, name)
);

CREATE TABLE IF NOT EXISTS array_rows (
    id INTEGER PRIMARY KEY,
    trial_name TEXT NOT NULL,
    name TEXT NOT NULL,
    data BLOB NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_array_rows_channel ON array_rows(trial_name, name, id);

-- Homogeneous arrays stored once under a trial
CREATE TABLE IF NOT EXISTS stored_arrays (
    group_name TEXT NOT NULL,
    name TEXT NOT NULL,
    description TEXT NOT NULL,
    kind TEXT NOT NULL,
    data BLOB NOT NULL,
    PRIMARY KEY (group_name, name)
);
"#;

pub fn initialize_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

/// Whether a table named `name` exists, catalogued or not
pub fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Quote an identifier for use in generated SQL
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn sql_type(kind: FieldKind) -> &'static str {
    match kind {
        FieldKind::Int32 | FieldKind::Int16 | FieldKind::Bool => "INTEGER",
        FieldKind::Float32 | FieldKind::Time => "REAL",
        FieldKind::FixedString(_) | FieldKind::VarString => "TEXT",
        FieldKind::Int32Array | FieldKind::Float32Array => "BLOB",
    }
}

/// A generated fixed-width table
#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<(String, FieldKind)>,
}

impl TableSchema {
    /// Build a schema, rejecting array kinds and reserved names
    ///
    /// Column names are compared case-insensitively, as SQLite does.
    pub fn new(name: impl Into<String>, columns: Vec<(String, FieldKind)>) -> Result<Self> {
        for (i, (column, kind)) in columns.iter().enumerate() {
            if columns[..i]
                .iter()
                .any(|(earlier, _)| earlier.eq_ignore_ascii_case(column))
            {
                return Err(StoreError::InvalidColumn {
                    column: column.clone(),
                    reason: "duplicates another column ignoring case".to_string(),
                });
            }
            if column.is_empty() || column.eq_ignore_ascii_case(ROW_INDEX) {
                return Err(StoreError::InvalidColumn {
                    column: column.clone(),
                    reason: "reserved or empty name".to_string(),
                });
            }
            if kind.is_array() {
                return Err(StoreError::InvalidColumn {
                    column: column.clone(),
                    reason: "arrays cannot live in a fixed-width table".to_string(),
                });
            }
        }
        Ok(Self {
            name: name.into(),
            columns,
        })
    }

    pub fn kind_of(&self, column: &str) -> Option<FieldKind> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, kind)| *kind)
    }

    /// Create the table and record its columns in the catalogue
    pub fn create(&self, conn: &Connection) -> Result<()> {
        let mut sql = format!(
            "CREATE TABLE {} ({} INTEGER PRIMARY KEY",
            quote_ident(&self.name),
            ROW_INDEX
        );
        for (column, kind) in &self.columns {
            sql.push_str(&format!(", {} {}", quote_ident(column), sql_type(*kind)));
        }
        sql.push(')');
        conn.execute(&sql, [])?;

        for (ordinal, (column, kind)) in self.columns.iter().enumerate() {
            conn.execute(
                "INSERT INTO columns (table_name, column_name, ordinal, kind) VALUES (?1, ?2, ?3, ?4)",
                params![self.name, column, ordinal as i64, serde_json::to_string(kind)?],
            )?;
        }
        Ok(())
    }

    /// Load a generated table's schema from the catalogue
    pub fn load(conn: &Connection, name: &str) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(
            "SELECT column_name, kind FROM columns WHERE table_name = ?1 ORDER BY ordinal",
        )?;
        let rows = stmt.query_map(params![name], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut columns = Vec::new();
        for row in rows {
            let (column, kind) = row?;
            columns.push((column, serde_json::from_str(&kind)?));
        }
        if columns.is_empty() {
            return Ok(None);
        }
        Ok(Some(Self {
            name: name.to_string(),
            columns,
        }))
    }

    /// `SELECT` list covering every column in declaration order
    pub fn select_list(&self) -> String {
        let mut list = vec![ROW_INDEX.to_string()];
        list.extend(self.columns.iter().map(|(c, _)| quote_ident(c)));
        list.join(", ")
    }

    /// Decode a row selected with [`TableSchema::select_list`]
    pub fn decode_row(&self, row: &Row<'_>) -> rusqlite::Result<FieldMap> {
        let mut fields = FieldMap::new();
        for (i, (column, kind)) in self.columns.iter().enumerate() {
            fields.insert(column.clone(), from_sql(*kind, row.get_ref(i + 1)?));
        }
        Ok(fields)
    }

    /// Number of rows currently in the table
    pub fn row_count(&self, conn: &Connection) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(&self.name));
        Ok(conn.query_row(&sql, [], |row| row.get(0))?)
    }

    /// Insert one row at `row_index`; columns not in `values` are NULL
    pub fn insert(&self, conn: &Connection, row_index: i64, values: &[(String, SqlValue)]) -> Result<()> {
        let mut columns = vec![ROW_INDEX.to_string()];
        let mut params: Vec<SqlValue> = vec![SqlValue::Integer(row_index)];
        for (column, value) in values {
            columns.push(quote_ident(column));
            params.push(value.clone());
        }
        let placeholders: Vec<String> = (1..=params.len()).map(|i| format!("?{}", i)).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(&self.name),
            columns.join(", "),
            placeholders.join(", ")
        );
        conn.execute(&sql, rusqlite::params_from_iter(params))?;
        Ok(())
    }

    /// Convert a field to a column value, checking the column exists
    pub fn column_value(&self, column: &str, value: &FieldValue) -> Result<SqlValue> {
        let kind = self.kind_of(column).ok_or_else(|| StoreError::UnknownColumn {
            table: self.name.clone(),
            column: column.to_string(),
        })?;
        to_sql(kind, value).ok_or_else(|| StoreError::KindMismatch {
            column: column.to_string(),
            kind,
        })
    }
}

/// Convert a value to its column representation, widening or narrowing
/// numbers when they fit. `None` means the value does not fit `kind`.
pub fn to_sql(kind: FieldKind, value: &FieldValue) -> Option<SqlValue> {
    let float = || value.as_f64().or_else(|| value.as_i64().map(|v| v as f64));
    match kind {
        FieldKind::Int32 => value
            .as_i64()
            .filter(|v| i32::try_from(*v).is_ok())
            .map(SqlValue::Integer),
        FieldKind::Int16 => value
            .as_i64()
            .filter(|v| i16::try_from(*v).is_ok())
            .map(SqlValue::Integer),
        FieldKind::Bool => match value {
            FieldValue::Bool(b) => Some(SqlValue::Integer(*b as i64)),
            _ => None,
        },
        FieldKind::Float32 => float().map(|v| SqlValue::Real(v as f32 as f64)),
        FieldKind::Time => float().map(SqlValue::Real),
        FieldKind::FixedString(len) => value
            .as_str()
            .map(|s| SqlValue::Text(truncate_utf8(s, len).to_string())),
        FieldKind::VarString => value.as_str().map(|s| SqlValue::Text(s.to_string())),
        FieldKind::Int32Array | FieldKind::Float32Array => {
            if value.matches_kind(kind) {
                Some(SqlValue::Blob(encode_array(value)))
            } else {
                None
            }
        }
    }
}

/// Decode a column value; NULL and unexpected storage classes are absent
pub fn from_sql(kind: FieldKind, value: ValueRef<'_>) -> Option<FieldValue> {
    match (kind, value) {
        (_, ValueRef::Null) => None,
        (FieldKind::Int32, ValueRef::Integer(v)) => i32::try_from(v).ok().map(FieldValue::Int32),
        (FieldKind::Int16, ValueRef::Integer(v)) => i16::try_from(v).ok().map(FieldValue::Int16),
        (FieldKind::Bool, ValueRef::Integer(v)) => Some(FieldValue::Bool(v != 0)),
        (FieldKind::Float32, ValueRef::Real(v)) => Some(FieldValue::Float32(v as f32)),
        (FieldKind::Time, ValueRef::Real(v)) => Some(FieldValue::Time(v)),
        (FieldKind::FixedString(_) | FieldKind::VarString, ValueRef::Text(bytes)) => {
            Some(FieldValue::String(String::from_utf8_lossy(bytes).into_owned()))
        }
        (FieldKind::Int32Array | FieldKind::Float32Array, ValueRef::Blob(bytes)) => {
            decode_array(kind, bytes)
        }
        _ => None,
    }
}

fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Pack an array value as little-endian elements
pub fn encode_array(value: &FieldValue) -> Vec<u8> {
    let mut bytes = Vec::new();
    match value {
        FieldValue::Int32Array(values) => {
            for v in values {
                bytes.extend_from_slice(&v.to_le_bytes());
            }
        }
        FieldValue::Float32Array(values) => {
            for v in values {
                bytes.extend_from_slice(&v.to_le_bytes());
            }
        }
        _ => {}
    }
    bytes
}

/// Unpack little-endian elements; `None` if the length is not a whole
/// number of elements
pub fn decode_array(kind: FieldKind, bytes: &[u8]) -> Option<FieldValue> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    let count = bytes.len() / 4;
    match kind {
        FieldKind::Int32Array => {
            let mut values = vec![0i32; count];
            LittleEndian::read_i32_into(bytes, &mut values);
            Some(FieldValue::Int32Array(values))
        }
        FieldKind::Float32Array => {
            let mut values = vec![0f32; count];
            LittleEndian::read_f32_into(bytes, &mut values);
            Some(FieldValue::Float32Array(values))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("odor"), "\"odor\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_table_rejects_arrays_and_reserved() {
        assert!(TableSchema::new("t", vec![("licks".into(), FieldKind::Int32Array)]).is_err());
        assert!(TableSchema::new("t", vec![(ROW_INDEX.into(), FieldKind::Int32)]).is_err());
    }

    #[test]
    fn test_to_sql_narrowing() {
        assert_eq!(
            to_sql(FieldKind::Int16, &FieldValue::Int32(300)),
            Some(SqlValue::Integer(300))
        );
        assert_eq!(to_sql(FieldKind::Int16, &FieldValue::Int32(70000)), None);
        assert_eq!(
            to_sql(FieldKind::FixedString(3), &FieldValue::String("abcdef".into())),
            Some(SqlValue::Text("abc".into()))
        );
        assert_eq!(to_sql(FieldKind::Int32, &FieldValue::String("1".into())), None);
    }

    #[test]
    fn test_table_rejects_case_insensitive_duplicates() {
        let result = TableSchema::new(
            "t",
            vec![
                ("Odor".into(), FieldKind::Int32),
                ("odor".into(), FieldKind::Int32),
            ],
        );
        assert!(matches!(result, Err(StoreError::InvalidColumn { column, .. }) if column == "odor"));
        assert!(TableSchema::new("t", vec![("ROW_INDEX".into(), FieldKind::Int32)]).is_err());
    }

    #[test]
    fn test_array_blob() {
        let value = FieldValue::Float32Array(vec![1.5, -2.0]);
        let bytes = encode_array(&value);
        assert_eq!(bytes.len(), 8);
        assert_eq!(decode_array(FieldKind::Float32Array, &bytes), Some(value));
        assert_eq!(decode_array(FieldKind::Int32Array, &[1, 2, 3]), None);
    }

    #[test]
    fn test_table_roundtrip_in_memory() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();
        let table = TableSchema::new(
            "events",
            vec![
                ("lick".into(), FieldKind::Int32),
                ("odor".into(), FieldKind::VarString),
            ],
        )
        .unwrap();
        table.create(&conn).unwrap();

        let loaded = TableSchema::load(&conn, "events").unwrap().unwrap();
        assert_eq!(loaded, table);
        assert_eq!(TableSchema::load(&conn, "missing").unwrap(), None);

        let value = table.column_value("lick", &FieldValue::Int32(4)).unwrap();
        table.insert(&conn, 0, &[("lick".into(), value)]).unwrap();
        assert_eq!(table.row_count(&conn).unwrap(), 1);

        let sql = format!("SELECT {} FROM events", table.select_list());
        let row = conn
            .query_row(&sql, [], |row| table.decode_row(row))
            .unwrap();
        assert_eq!(row.get("lick"), Some(&Some(FieldValue::Int32(4))));
        assert_eq!(row.get("odor"), Some(&None));
    }
}
