//! Device session tests against a scripted transport

use pretty_assertions::assert_eq;
use rigbridge_core::config::SessionSettings;
use rigbridge_core::protocol::{
    DeviceSession, FieldKind, FieldValue, ParseOutcome, ProtocolDefinition, ProtocolError,
    Transport, TRIAL_NUMBER_FIELD,
};
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct MockState {
    replies: VecDeque<Option<String>>,
    written: Vec<Vec<u8>>,
    fail_on_write: bool,
    pauses: usize,
    resumes: usize,
}

/// Mock serial link replaying canned reply lines
#[derive(Clone, Default)]
struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    fn with_replies(replies: &[Option<&str>]) -> Self {
        let mock = Self::default();
        mock.state.lock().unwrap().replies = replies
            .iter()
            .map(|reply| reply.map(str::to_string))
            .collect();
        mock
    }

    fn written(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().written.clone()
    }
}

impl Transport for MockTransport {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_on_write {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "serial write failed"));
        }
        state.written.push(data.to_vec());
        Ok(())
    }

    fn read_line(&mut self, _timeout: Duration) -> io::Result<Option<String>> {
        Ok(self.state.lock().unwrap().replies.pop_front().flatten())
    }

    fn pause(&mut self) -> io::Result<()> {
        self.state.lock().unwrap().pauses += 1;
        Ok(())
    }

    fn resume(&mut self) -> io::Result<()> {
        self.state.lock().unwrap().resumes += 1;
        Ok(())
    }

    fn port_name(&self) -> &str {
        "mock"
    }
}

fn session(mock: &MockTransport, retries: usize, retry_stream_reads: bool) -> DeviceSession {
    DeviceSession::new(
        Box::new(mock.clone()),
        SessionSettings {
            retries,
            retry_stream_reads,
        },
        Duration::from_millis(10),
    )
}

fn stream_definition() -> ProtocolDefinition {
    ProtocolDefinition::new()
        .with_field("lick", 1, FieldKind::Int32)
        .with_field("sniff", 2, FieldKind::Float32)
}

#[test]
fn test_start_trial_packs_parameters_by_position() {
    let mock = MockTransport::with_replies(&[Some("2")]);
    let mut device = session(&mock, 3, false);

    let parameters = ProtocolDefinition::new()
        .with_value("label", 4, FieldKind::FixedString(4), FieldValue::String("ab".into()))
        .with_value("odor", 2, FieldKind::Int16, FieldValue::Int16(300))
        .with_value(TRIAL_NUMBER_FIELD, 1, FieldKind::Int32, FieldValue::Int32(7))
        .with_value("valve", 3, FieldKind::Float32, FieldValue::Float32(1.5));

    assert!(device.start_trial(&parameters).unwrap());

    let mut expected = vec![0x5A, 0x2C, 0x01];
    expected.extend_from_slice(&1.5f32.to_le_bytes());
    expected.extend_from_slice(b"ab\0\0");
    assert_eq!(mock.written(), vec![expected]);
}

#[test]
fn test_start_trial_sends_updated_value() {
    let mock = MockTransport::with_replies(&[Some("2"), Some("2")]);
    let mut device = session(&mock, 3, false);

    let mut parameters =
        ProtocolDefinition::new().with_value("odor", 1, FieldKind::Int16, FieldValue::Int16(1));
    assert!(device.start_trial(&parameters).unwrap());

    assert!(parameters.set_value("odor", FieldValue::Int16(2)));
    assert!(!parameters.set_value("valve", FieldValue::Int16(2)));
    assert!(device.start_trial(&parameters).unwrap());

    assert_eq!(mock.written(), vec![vec![0x5A, 1, 0], vec![0x5A, 2, 0]]);
}

#[test]
fn test_start_trial_missing_value_writes_nothing() {
    let mock = MockTransport::with_replies(&[Some("2")]);
    let mut device = session(&mock, 3, false);

    let parameters = ProtocolDefinition::new().with_field("odor", 1, FieldKind::Int16);
    let result = device.start_trial(&parameters);

    assert!(matches!(result, Err(ProtocolError::MissingValue { field }) if field == "odor"));
    assert!(mock.written().is_empty());
}

#[test]
fn test_start_trial_retries_until_acknowledged() {
    let mock = MockTransport::with_replies(&[None, Some("9"), Some("2")]);
    let mut device = session(&mock, 5, false);

    assert!(device.start_trial(&ProtocolDefinition::new()).unwrap());
    assert_eq!(mock.written().len(), 3);
}

#[test]
fn test_retry_exhaustion_reports_absence() {
    let mock = MockTransport::default();
    let mut device = session(&mock, 4, false);

    assert!(!device.end_trial());
    assert_eq!(mock.written(), vec![vec![0x59]; 4]);
}

#[test]
fn test_write_failure_is_not_fatal() {
    let mock = MockTransport::default();
    mock.state.lock().unwrap().fail_on_write = true;
    let mut device = session(&mock, 2, false);

    assert!(!device.user_def_command("reward"));
    assert_eq!(device.request_stream(Some(&stream_definition())).unwrap(), None);
}

#[test]
fn test_user_def_command_bytes() {
    let mock = MockTransport::with_replies(&[Some("2")]);
    let mut device = session(&mock, 3, false);

    assert!(device.user_def_command("reward"));

    let mut expected = vec![0x56];
    expected.extend_from_slice(b"reward\r");
    assert_eq!(mock.written(), vec![expected]);
}

#[test]
fn test_request_stream_end_of_trial() {
    let mock = MockTransport::with_replies(&[Some("4,10,0.5*5")]);
    let mut device = session(&mock, 3, false);

    let outcome = device
        .request_stream(Some(&stream_definition()))
        .unwrap()
        .unwrap();

    assert!(outcome.is_end_of_trial());
    assert_eq!(
        outcome.fields().get("lick"),
        Some(&Some(FieldValue::Int32(10)))
    );
    assert_eq!(
        outcome.fields().get("sniff"),
        Some(&Some(FieldValue::Float32(0.5)))
    );
    assert_eq!(mock.written(), vec![vec![0x57]]);
}

#[test]
fn test_request_stream_single_attempt_by_default() {
    let mock = MockTransport::with_replies(&[None, Some("4,1,2")]);
    let mut device = session(&mock, 3, false);

    assert_eq!(device.request_stream(Some(&stream_definition())).unwrap(), None);
    assert_eq!(mock.written().len(), 1);
    assert_eq!(device.rate_stats().samples, 1);
}

#[test]
fn test_request_stream_retries_when_enabled() {
    let mock = MockTransport::with_replies(&[None, Some("4,1,2")]);
    let mut device = session(&mock, 3, true);

    let outcome = device.request_stream(Some(&stream_definition())).unwrap();
    assert!(matches!(outcome, Some(ParseOutcome::Fields(_))));
    assert_eq!(mock.written().len(), 2);
    assert_eq!(device.rate_stats().samples, 2);
}

#[test]
fn test_request_stream_feeds_rate_statistics() {
    let mock = MockTransport::with_replies(&[Some("4,1,2"), Some("4,1,2"), Some("4,1,2")]);
    let mut times = VecDeque::from([1.0, 2.0, 5.0]);
    let mut device = session(&mock, 3, false).with_clock(move || times.pop_front().unwrap_or(5.0));

    for _ in 0..3 {
        device.request_stream(Some(&stream_definition())).unwrap();
    }

    let stats = device.rate_stats();
    assert_eq!(stats.max_interval, 3.0);
    assert_eq!(stats.overflow_packets, 2);
    assert_eq!(stats.samples, 3);
}

#[test]
fn test_request_event_does_not_touch_rate() {
    let mock = MockTransport::with_replies(&[Some("1,3,4")]);
    let mut device = session(&mock, 3, false);

    let outcome = device.request_event(Some(&stream_definition())).unwrap().unwrap();
    assert!(!outcome.is_end_of_trial());
    assert_eq!(mock.written(), vec![vec![0x58]]);
    assert_eq!(device.rate_stats().samples, 0);
}

#[test]
fn test_malformed_reply_propagates() {
    let mock = MockTransport::with_replies(&[Some("x,1,2")]);
    let mut device = session(&mock, 3, false);

    let result = device.request_stream(Some(&stream_definition()));
    assert!(matches!(result, Err(ProtocolError::MalformedPacket { .. })));
}

#[test]
fn test_request_protocol_name() {
    let mock = MockTransport::with_replies(&[Some("6,odor_discrimination\r")]);
    let mut device = session(&mock, 3, false);

    assert_eq!(
        device.request_protocol_name(),
        Some("odor_discrimination".to_string())
    );
    assert_eq!(mock.written(), vec![vec![0x5B]]);
}

#[test]
fn test_protocol_name_without_name_field() {
    let mock = MockTransport::with_replies(&[Some("6")]);
    let mut device = session(&mock, 3, false);

    assert_eq!(device.request_protocol_name(), None);
}

#[test]
fn test_upload_without_toolchain() {
    let mock = MockTransport::default();
    let mut device = session(&mock, 3, false);

    let result = device.upload_firmware(std::path::Path::new("sketch.hex"));
    assert!(matches!(result, Err(ProtocolError::Upload(_))));
    assert_eq!(mock.state.lock().unwrap().pauses, 0);
}

#[test]
fn test_pause_and_resume() {
    let mock = MockTransport::default();
    let mut device = session(&mock, 3, false);

    device.pause().unwrap();
    device.resume().unwrap();

    let state = mock.state.lock().unwrap();
    assert_eq!((state.pauses, state.resumes), (1, 1));
}
