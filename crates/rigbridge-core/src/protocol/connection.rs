//! Device session
//!
//! Issues commands to the rig controller and interprets the replies. Each
//! call writes a command, then blocks on one reply line; failed attempts are
//! retried a bounded number of times with no backoff.
//!
//! Transport failures never escape a command method. They are logged and
//! count as a failed attempt; once attempts run out the command reports
//! absence (`None`/`false`) and the caller decides whether to escalate.
//! Malformed replies are a definition/firmware mismatch and do propagate.

use std::io;
use std::path::Path;
use std::process;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::codec::encode_field;
use super::{
    parse_line, Command, ParseOutcome, ProtocolDefinition, ProtocolError, RateMonitor, RateStats,
    SerialTransport, Transport, DEFAULT_TIMEOUT_MS, TRIAL_NUMBER_FIELD,
};
use crate::config::{ResolvedRig, RigConfig, SessionSettings, UploadSettings};

/// A command/response session with one rig controller
pub struct DeviceSession {
    /// Link to the controller
    transport: Box<dyn Transport>,
    /// Board identity from the rig config
    board: String,
    /// Host platform key, used to pick the upload toolchain
    os: String,
    /// Blocking read timeout per attempt
    timeout: Duration,
    /// Retry behaviour
    settings: SessionSettings,
    /// Firmware toolchain, if configured
    upload: Option<UploadSettings>,
    /// Stream inter-arrival statistics
    rate: RateMonitor,
    /// Source of stream timestamps in seconds
    clock: Box<dyn FnMut() -> f64 + Send>,
}

impl DeviceSession {
    /// Open the serial port configured for `board_key`/`port_key`
    pub fn open(config: &RigConfig, board_key: &str, port_key: &str) -> Result<Self, ProtocolError> {
        let rig = config.resolve(board_key, port_key)?;
        let transport = SerialTransport::open(&rig.port, rig.baud_rate, rig.timeout)?;
        info!(
            "connected to {} on {} at {} baud",
            rig.board, rig.port, rig.baud_rate
        );
        Ok(Self::from_rig(Box::new(transport), rig))
    }

    /// Create a session over an already-open transport
    pub fn from_rig(transport: Box<dyn Transport>, rig: ResolvedRig) -> Self {
        let mut session = Self::new(transport, rig.session, rig.timeout);
        session.board = rig.board;
        session.os = rig.os;
        session.upload = rig.upload;
        session
    }

    /// Create a session with no board identity or upload toolchain
    pub fn new(transport: Box<dyn Transport>, settings: SessionSettings, timeout: Duration) -> Self {
        let epoch = Instant::now();
        Self {
            transport,
            board: String::new(),
            os: String::new(),
            timeout,
            settings,
            upload: None,
            rate: RateMonitor::new(0.0),
            clock: Box::new(move || epoch.elapsed().as_secs_f64()),
        }
    }

    /// Replace the stream clock, which reads seconds since session start
    pub fn with_clock<F>(mut self, clock: F) -> Self
    where
        F: FnMut() -> f64 + Send + 'static,
    {
        self.clock = Box::new(clock);
        self
    }

    /// Create a session with default settings
    pub fn with_transport(transport: Box<dyn Transport>) -> Self {
        Self::new(
            transport,
            SessionSettings::default(),
            Duration::from_millis(DEFAULT_TIMEOUT_MS),
        )
    }

    pub fn board(&self) -> &str {
        &self.board
    }

    pub fn port_name(&self) -> &str {
        self.transport.port_name()
    }

    pub fn settings(&self) -> SessionSettings {
        self.settings
    }

    /// Stream rate statistics accumulated so far
    pub fn rate_stats(&self) -> RateStats {
        self.rate.stats()
    }

    /// One write/read round trip
    fn transact(&mut self, payload: &[u8]) -> io::Result<Option<String>> {
        self.transport.write(payload)?;
        self.transport.read_line(self.timeout)
    }

    /// Send `payload` until the reply acknowledges `command`
    fn send_acknowledged(&mut self, command: Command, payload: &[u8]) -> Option<String> {
        for attempt in 1..=self.settings.retries {
            match self.transact(payload) {
                Ok(Some(reply)) if command.is_acknowledged_by(&reply) => {
                    debug!("{} acknowledged: {:?}", command.name(), reply);
                    return Some(reply);
                }
                Ok(Some(reply)) => {
                    debug!(
                        "{} attempt {}: unexpected reply {:?}",
                        command.name(),
                        attempt,
                        reply
                    );
                }
                Ok(None) => debug!("{} attempt {}: no reply", command.name(), attempt),
                Err(e) => warn!("{} attempt {} failed: {}", command.name(), attempt, e),
            }
        }
        warn!(
            "{} not acknowledged after {} attempts",
            command.name(),
            self.settings.retries
        );
        None
    }

    /// Request a data row and parse it with `definition`
    fn request_data(
        &mut self,
        command: Command,
        definition: Option<&ProtocolDefinition>,
    ) -> Result<Option<ParseOutcome>, ProtocolError> {
        let attempts = if self.settings.retry_stream_reads {
            self.settings.retries
        } else {
            1
        };

        for attempt in 1..=attempts {
            let reply = self.transact(&[command.byte()]);
            if command == Command::RequestStream {
                let now = (self.clock)();
                self.rate.record(now);
            }

            match reply {
                Ok(Some(line)) => {
                    debug!("{} reply: {:?}", command.name(), line);
                    return parse_line(&line, definition).map(Some);
                }
                Ok(None) => debug!("{} attempt {}: no reply", command.name(), attempt),
                Err(e) => warn!("{} attempt {} failed: {}", command.name(), attempt, e),
            }
        }
        Ok(None)
    }

    /// Request one stream row
    ///
    /// Every request updates the transmission-rate statistics.
    pub fn request_stream(
        &mut self,
        definition: Option<&ProtocolDefinition>,
    ) -> Result<Option<ParseOutcome>, ProtocolError> {
        self.request_data(Command::RequestStream, definition)
    }

    /// Request one event row
    pub fn request_event(
        &mut self,
        definition: Option<&ProtocolDefinition>,
    ) -> Result<Option<ParseOutcome>, ProtocolError> {
        self.request_data(Command::RequestEvent, definition)
    }

    /// Start a trial, sending every parameter packed in wire-position order
    ///
    /// Returns `Ok(false)` when the device never acknowledged. Parameters that
    /// cannot be encoded fail before anything is written.
    pub fn start_trial(&mut self, parameters: &ProtocolDefinition) -> Result<bool, ProtocolError> {
        let mut payload = vec![Command::StartTrial.byte()];
        for def in parameters.by_position() {
            if def.name == TRIAL_NUMBER_FIELD {
                continue;
            }
            let value = def.value.as_ref().ok_or_else(|| ProtocolError::MissingValue {
                field: def.name.clone(),
            })?;
            payload.extend(encode_field(&def.name, def.kind, value)?);
        }

        Ok(self.send_acknowledged(Command::StartTrial, &payload).is_some())
    }

    /// Send a free-form text command
    pub fn user_def_command(&mut self, command: &str) -> bool {
        let mut payload = Vec::with_capacity(command.len() + 2);
        payload.push(Command::UserDefined.byte());
        payload.extend_from_slice(command.as_bytes());
        payload.push(super::commands::USER_COMMAND_TERMINATOR);

        self.send_acknowledged(Command::UserDefined, &payload)
            .is_some()
    }

    /// End the running trial and report the stream rate statistics
    pub fn end_trial(&mut self) -> bool {
        let acknowledged = self
            .send_acknowledged(Command::EndTrial, &[Command::EndTrial.byte()])
            .is_some();

        let stats = self.rate.stats();
        info!(
            max_interval = stats.max_interval,
            overflow_packets = stats.overflow_packets,
            "trial ended (maximum inter-transmission interval {:.3}s, {} transmissions slower than the no-loss rate)",
            stats.max_interval,
            stats.overflow_packets
        );
        acknowledged
    }

    /// Ask the controller which sketch it is running
    pub fn request_protocol_name(&mut self) -> Option<String> {
        let reply = self.send_acknowledged(
            Command::RequestProtocolName,
            &[Command::RequestProtocolName.byte()],
        )?;

        let name = reply
            .split(super::packet::FIELD_SEPARATOR)
            .nth(1)
            .map(|name| name.trim_end_matches(['\r', '\n']).to_string());
        if name.is_none() {
            warn!("protocol name reply has no name: {:?}", reply);
        }
        name
    }

    /// Release the port
    pub fn pause(&mut self) -> Result<(), ProtocolError> {
        Ok(self.transport.pause()?)
    }

    /// Reacquire the port after [`DeviceSession::pause`]
    pub fn resume(&mut self) -> Result<(), ProtocolError> {
        Ok(self.transport.resume()?)
    }

    /// Flash `hex_path` with the configured toolchain
    ///
    /// The port is released while the programmer runs and reacquired
    /// afterwards, whether or not the upload succeeded.
    pub fn upload_firmware(&mut self, hex_path: &Path) -> Result<(), ProtocolError> {
        let upload = self
            .upload
            .as_ref()
            .ok_or_else(|| ProtocolError::Upload("no upload toolchain configured".to_string()))?;
        let command = upload.command_for(&self.os, &self.board, self.transport.port_name(), hex_path)?;

        info!("uploading {} to {}", hex_path.display(), self.board);
        self.transport.pause()?;
        let status = process::Command::new(&command.program)
            .args(&command.args)
            .status();
        self.transport.resume()?;

        match status {
            Ok(status) if status.success() => Ok(()),
            Ok(status) => Err(ProtocolError::Upload(format!(
                "{} exited with {}",
                command.program, status
            ))),
            Err(e) => Err(ProtocolError::Upload(format!(
                "failed to run {}: {}",
                command.program, e
            ))),
        }
    }
}
