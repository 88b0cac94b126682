//! Device protocol
//!
//! Host side of the rig controller's serial protocol: single-byte commands,
//! `*`-delimited reply packets with handshake codes, and typed fields
//! decoded through a caller-supplied protocol definition.

pub mod codec;
pub mod commands;
mod connection;
mod error;
mod field;
pub mod packet;
pub mod rate;
pub mod serial;
pub mod transport;

pub use commands::Command;
pub use connection::DeviceSession;
pub use error::ProtocolError;
pub use field::{FieldDef, FieldKind, FieldMap, FieldValue, ProtocolDefinition, TRIAL_NUMBER_FIELD};
pub use packet::{parse_line, Handshake, ParseOutcome};
pub use rate::{RateMonitor, RateStats};
pub use serial::{list_ports, open_port, PortInfo};
pub use transport::{SerialTransport, Transport};

/// Default baud rate of the rig controller
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Default blocking read timeout per attempt in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;
