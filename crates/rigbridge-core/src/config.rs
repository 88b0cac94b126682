//! Rig configuration
//!
//! Board identity, serial settings and the firmware toolchain template,
//! stored as JSON next to the experiment:
//!
//! ```json
//! {
//!   "os": "linux",
//!   "boards": { "board1": "uno" },
//!   "serial": {
//!     "baud_rate": 115200,
//!     "timeout_ms": 1000,
//!     "ports": { "linux": { "port1": "/dev/ttyACM0" } }
//!   },
//!   "session": { "retries": 10, "retry_stream_reads": false },
//!   "upload": {
//!     "verbosity": "-q",
//!     "command": { "linux": "avrdude" },
//!     "conf": { "linux": "/etc/avrdude.conf" },
//!     "flags": { "uno": "-patmega328p -carduino -b115200" }
//!   }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::protocol::commands::DEFAULT_RETRIES;
use crate::protocol::{DEFAULT_BAUD_RATE, DEFAULT_TIMEOUT_MS};

/// Errors loading or resolving a rig configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Missing '{key}' in [{section}]")]
    MissingKey { section: String, key: String },
}

impl ConfigError {
    fn missing(section: &str, key: &str) -> Self {
        ConfigError::MissingKey {
            section: section.to_string(),
            key: key.to_string(),
        }
    }
}

/// Top-level rig configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RigConfig {
    /// Host platform key used to pick OS-specific entries
    pub os: String,

    /// Board keys mapped to board identities
    pub boards: HashMap<String, String>,

    /// Serial link settings
    pub serial: SerialSettings,

    /// Device session behaviour
    #[serde(default)]
    pub session: SessionSettings,

    /// Firmware upload toolchain
    #[serde(default)]
    pub upload: Option<UploadSettings>,
}

/// Serial link settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialSettings {
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Blocking read timeout per attempt
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// OS key -> port key -> device path
    pub ports: HashMap<String, HashMap<String, String>>,
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

/// Device session behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Attempts per command
    #[serde(default = "default_retries")]
    pub retries: usize,

    /// Retry stream/event requests whose read fails instead of giving up
    /// after the first attempt
    #[serde(default)]
    pub retry_stream_reads: bool,
}

fn default_retries() -> usize {
    DEFAULT_RETRIES
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            retries: DEFAULT_RETRIES,
            retry_stream_reads: false,
        }
    }
}

/// Firmware toolchain template
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadSettings {
    #[serde(default)]
    pub verbosity: String,

    /// OS key -> programmer executable
    pub command: HashMap<String, String>,

    /// OS key -> programmer configuration file
    pub conf: HashMap<String, String>,

    /// Board identity -> programmer flags
    pub flags: HashMap<String, String>,
}

/// A programmer invocation ready to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl UploadSettings {
    /// Build the programmer invocation flashing `hex_path` through `port`
    pub fn command_for(
        &self,
        os: &str,
        board: &str,
        port: &str,
        hex_path: &Path,
    ) -> Result<UploadCommand, ConfigError> {
        let program = self
            .command
            .get(os)
            .ok_or_else(|| ConfigError::missing("upload.command", os))?;
        let conf = self
            .conf
            .get(os)
            .ok_or_else(|| ConfigError::missing("upload.conf", os))?;
        let flags = self
            .flags
            .get(board)
            .ok_or_else(|| ConfigError::missing("upload.flags", board))?;

        let mut args = vec![format!("-C{}", conf)];
        args.extend(self.verbosity.split_whitespace().map(str::to_string));
        args.extend(flags.split_whitespace().map(str::to_string));
        args.push(format!("-P{}", port));
        args.push(format!("-Uflash:w:{}:i", hex_path.display()));

        Ok(UploadCommand {
            program: program.clone(),
            args,
        })
    }
}

/// Configuration resolved for one board/port pair
#[derive(Debug, Clone)]
pub struct ResolvedRig {
    pub os: String,
    pub board: String,
    pub port: String,
    pub baud_rate: u32,
    pub timeout: Duration,
    pub session: SessionSettings,
    pub upload: Option<UploadSettings>,
}

impl RigConfig {
    /// Load configuration from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(content)?)
    }

    /// Resolve the board identity and device path for the given keys
    pub fn resolve(&self, board_key: &str, port_key: &str) -> Result<ResolvedRig, ConfigError> {
        let board = self
            .boards
            .get(board_key)
            .ok_or_else(|| ConfigError::missing("boards", board_key))?;
        let port = self
            .serial
            .ports
            .get(&self.os)
            .ok_or_else(|| ConfigError::missing("serial.ports", &self.os))?
            .get(port_key)
            .ok_or_else(|| ConfigError::missing(&format!("serial.ports.{}", self.os), port_key))?;

        Ok(ResolvedRig {
            os: self.os.clone(),
            board: board.clone(),
            port: port.clone(),
            baud_rate: self.serial.baud_rate,
            timeout: Duration::from_millis(self.serial.timeout_ms),
            session: self.session,
            upload: self.upload.clone(),
        })
    }
}
