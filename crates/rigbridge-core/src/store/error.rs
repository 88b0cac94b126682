//! Store errors
//!
//! Every variant is fatal for the session: nothing in the store is retried,
//! since a half-written row leaves the record untrustworthy.

use std::path::PathBuf;
use thiserror::Error;

use crate::protocol::FieldKind;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Invalid stored value: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("No session is open")]
    NoSession,

    #[error("A session is already recorded in {0}")]
    SessionExists(PathBuf),

    #[error("Not a session file: {0}")]
    NotASession(PathBuf),

    #[error("Trial schema has not been defined")]
    SchemaNotDefined,

    #[error("Trial schema is already defined")]
    SchemaAlreadyDefined,

    #[error("Trial schema has no columns")]
    EmptySchema,

    #[error("Session {0} is not the one open in this store")]
    ForeignSession(PathBuf),

    #[error("Trial {0} already exists")]
    TrialExists(String),

    #[error("Trial {0} not found")]
    TrialNotFound(String),

    #[error("Unknown column '{column}' in {table}")]
    UnknownColumn { table: String, column: String },

    #[error("Invalid column '{column}': {reason}")]
    InvalidColumn { column: String, reason: String },

    #[error("Value for '{column}' does not fit kind {kind}")]
    KindMismatch { column: String, kind: FieldKind },

    #[error("No parameter row has been written yet")]
    NoParameterRow,

    #[error("Corrupt array data in '{0}'")]
    CorruptArray(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
