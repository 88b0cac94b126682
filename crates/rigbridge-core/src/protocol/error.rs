//! Protocol errors

use thiserror::Error;

use super::FieldKind;
use crate::config::ConfigError;

/// Errors that can occur during device communication
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Serial port unavailable: {port} ({reason})")]
    ConnectionUnavailable { port: String, reason: String },

    #[error("Transport I/O error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("Malformed field '{field}': {reason}")]
    MalformedField { field: String, reason: String },

    #[error("Malformed packet '{packet}': {reason}")]
    MalformedPacket { packet: String, reason: String },

    #[error("Field '{field}' of kind {kind} cannot be sent to the device")]
    UnsupportedEncoding { field: String, kind: FieldKind },

    #[error("Field '{field}' has no value to send")]
    MissingValue { field: String },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Firmware upload failed: {0}")]
    Upload(String),
}

impl ProtocolError {
    pub(crate) fn malformed(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ProtocolError::MalformedField {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
