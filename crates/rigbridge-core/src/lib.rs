//! # RigBridge Core Library
//!
//! Host-side plumbing for behavioral-experiment rigs driven by a
//! microcontroller over a serial link.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Field definitions and the text/packed-binary wire codec
//! - A command/response session with the rig controller
//! - Stream transmission-rate statistics
//! - Trial persistence into a single session file
//!
//! ## Example
//!
//! ```rust,ignore
//! use rigbridge_core::prelude::*;
//!
//! let config = RigConfig::from_file("rig.json")?;
//! let mut device = DeviceSession::open(&config, "board1", "port1")?;
//!
//! let mut store = TrialStore::new();
//! let session = store.create_session("mouse12_s3", &metadata)?;
//! store.define_trial_schema(&protocol, &controller, &events, &session)?;
//!
//! let trial = store.add_trial(1, &protocol.values(), &controller, &stream, &session, "odor A")?;
//! device.start_trial(&controller)?;
//! while let Some(outcome) = device.request_stream(Some(&stream))? {
//!     let end = outcome.is_end_of_trial();
//!     store.insert_stream(outcome.fields(), &trial)?;
//!     if end {
//!         break;
//!     }
//! }
//! device.end_trial();
//! ```

pub mod config;
pub mod protocol;
pub mod store;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{RigConfig, SessionSettings};
    pub use crate::protocol::{
        DeviceSession, FieldDef, FieldKind, FieldMap, FieldValue, ParseOutcome,
        ProtocolDefinition, ProtocolError,
    };
    pub use crate::store::{SessionHandle, SessionMetadata, StoreError, TrialHandle, TrialStore};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
