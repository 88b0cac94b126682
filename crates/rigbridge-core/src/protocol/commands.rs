//! Device commands
//!
//! Every command starts with a single sentinel byte. Commands that expect an
//! acknowledgement succeed when the first character of the reply matches
//! their status code.

use serde::{Deserialize, Serialize};

/// Default number of attempts per command
pub const DEFAULT_RETRIES: usize = 10;

/// Terminator written after a user-defined command string
pub const USER_COMMAND_TERMINATOR: u8 = b'\r';

/// Commands understood by the experiment sketch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Free-form text command ('V')
    UserDefined,

    /// Request one stream row ('W')
    RequestStream,

    /// Request one event row ('X')
    RequestEvent,

    /// Stop the running trial ('Y')
    EndTrial,

    /// Start a trial with a packed parameter block ('Z')
    StartTrial,

    /// Ask which sketch is running ('[')
    RequestProtocolName,
}

impl Command {
    /// Sentinel byte written before any command payload
    pub fn byte(&self) -> u8 {
        match self {
            Command::UserDefined => 0x56,
            Command::RequestStream => 0x57,
            Command::RequestEvent => 0x58,
            Command::EndTrial => 0x59,
            Command::StartTrial => 0x5A,
            Command::RequestProtocolName => 0x5B,
        }
    }

    /// Leading reply character that acknowledges this command.
    /// Data requests are parsed instead of acknowledged.
    pub fn ack_status(&self) -> Option<char> {
        match self {
            Command::UserDefined | Command::StartTrial => Some('2'),
            Command::EndTrial => Some('3'),
            Command::RequestProtocolName => Some('6'),
            Command::RequestStream | Command::RequestEvent => None,
        }
    }

    /// Check whether `reply` acknowledges this command
    pub fn is_acknowledged_by(&self, reply: &str) -> bool {
        match self.ack_status() {
            Some(status) => reply.starts_with(status),
            None => false,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::UserDefined => "user_def_command",
            Command::RequestStream => "request_stream",
            Command::RequestEvent => "request_event",
            Command::EndTrial => "end_trial",
            Command::StartTrial => "start_trial",
            Command::RequestProtocolName => "request_protocol_name",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_bytes() {
        assert_eq!(Command::UserDefined.byte(), b'V');
        assert_eq!(Command::RequestStream.byte(), b'W');
        assert_eq!(Command::RequestEvent.byte(), b'X');
        assert_eq!(Command::EndTrial.byte(), b'Y');
        assert_eq!(Command::StartTrial.byte(), b'Z');
        assert_eq!(Command::RequestProtocolName.byte(), b'[');
    }

    #[test]
    fn test_acknowledgements() {
        assert!(Command::StartTrial.is_acknowledged_by("2\r\n"));
        assert!(!Command::StartTrial.is_acknowledged_by("3\r\n"));
        assert!(Command::EndTrial.is_acknowledged_by("3"));
        assert!(Command::RequestProtocolName.is_acknowledged_by("6,odor_go_nogo\r\n"));
        assert!(!Command::RequestProtocolName.is_acknowledged_by(""));
        assert!(!Command::RequestStream.is_acknowledged_by("2"));
    }
}
