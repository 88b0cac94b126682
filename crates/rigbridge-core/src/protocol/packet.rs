//! Packet parsing
//!
//! A device line carries one or more packets:
//! - packets are separated by `*`
//! - fields within a packet are separated by `,`
//! - field 0 of every packet is the handshake code
//!
//! Handshakes 1 and 4 carry field data, decoded by wire position through a
//! protocol definition. Handshake 5 marks the end of a trial. Other codes are
//! skipped.

use super::codec::decode_field;
use super::{FieldMap, ProtocolDefinition, ProtocolError};

/// Separator between packets on a line
pub const PACKET_SEPARATOR: char = '*';

/// Separator between fields within a packet
pub const FIELD_SEPARATOR: char = ',';

/// Handshake codes understood by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    /// Parameter values or an acknowledgement
    Parameters,
    /// A stream or event row is ready
    Stream,
    /// The device finished the trial
    EndOfTrial,
}

impl Handshake {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Handshake::Parameters),
            4 => Some(Handshake::Stream),
            5 => Some(Handshake::EndOfTrial),
            _ => None,
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            Handshake::Parameters => 1,
            Handshake::Stream => 4,
            Handshake::EndOfTrial => 5,
        }
    }
}

/// Result of parsing one device line
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    /// Decoded fields, merged across packets
    Fields(FieldMap),
    /// The line carried an end-of-trial packet. Holds every field decoded
    /// from the same line so the final row can still be recorded.
    EndOfTrial(FieldMap),
}

impl ParseOutcome {
    pub fn fields(&self) -> &FieldMap {
        match self {
            ParseOutcome::Fields(fields) | ParseOutcome::EndOfTrial(fields) => fields,
        }
    }

    pub fn into_fields(self) -> FieldMap {
        match self {
            ParseOutcome::Fields(fields) | ParseOutcome::EndOfTrial(fields) => fields,
        }
    }

    pub fn is_end_of_trial(&self) -> bool {
        matches!(self, ParseOutcome::EndOfTrial(_))
    }
}

/// Parse a raw device line
///
/// Later packets overwrite fields decoded from earlier ones. When no
/// definition is supplied, data packets are recognised but nothing is decoded.
pub fn parse_line(
    line: &str,
    definition: Option<&ProtocolDefinition>,
) -> Result<ParseOutcome, ProtocolError> {
    let mut fields = FieldMap::new();
    let mut end_of_trial = false;

    for packet in line.split(PACKET_SEPARATOR) {
        let packet = packet.trim_end_matches(['\r', '\n']);
        if packet.is_empty() {
            continue;
        }

        let payload: Vec<&str> = packet.split(FIELD_SEPARATOR).collect();
        let code = payload[0].trim();
        let code: u32 = code.parse().map_err(|_| ProtocolError::MalformedPacket {
            packet: packet.to_string(),
            reason: format!("handshake '{}' is not a number", code),
        })?;

        match Handshake::from_code(code) {
            Some(Handshake::Parameters) | Some(Handshake::Stream) => {
                if let Some(definition) = definition {
                    decode_payload(&payload, definition, &mut fields)?;
                }
            }
            Some(Handshake::EndOfTrial) => end_of_trial = true,
            None => {
                tracing::trace!("skipping packet with handshake {}", code);
            }
        }
    }

    if end_of_trial {
        Ok(ParseOutcome::EndOfTrial(fields))
    } else {
        Ok(ParseOutcome::Fields(fields))
    }
}

fn decode_payload(
    payload: &[&str],
    definition: &ProtocolDefinition,
    fields: &mut FieldMap,
) -> Result<(), ProtocolError> {
    for def in definition.iter() {
        let text = payload.get(def.position).ok_or_else(|| {
            ProtocolError::malformed(
                def.name.as_str(),
                format!(
                    "payload has {} values, position {} is missing",
                    payload.len(),
                    def.position
                ),
            )
        })?;
        let value = decode_field(&def.name, def.kind, text)?;
        fields.insert(def.name.clone(), value);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FieldKind, FieldValue};
    use pretty_assertions::assert_eq;

    fn ab_definition() -> ProtocolDefinition {
        ProtocolDefinition::new()
            .with_field("a", 1, FieldKind::Int32)
            .with_field("b", 2, FieldKind::Int32)
    }

    fn ints(pairs: &[(&str, i32)]) -> FieldMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Some(FieldValue::Int32(*v))))
            .collect()
    }

    #[test]
    fn test_handshake_codes() {
        for handshake in [Handshake::Parameters, Handshake::Stream, Handshake::EndOfTrial] {
            assert_eq!(Handshake::from_code(handshake.code()), Some(handshake));
        }
        assert_eq!(Handshake::EndOfTrial.code(), 5);
        assert_eq!(Handshake::from_code(2), None);
    }

    #[test]
    fn test_later_packets_overwrite_and_end_of_trial() {
        let outcome = parse_line("1,10,20*4,30,40*5", Some(&ab_definition())).unwrap();
        assert_eq!(outcome, ParseOutcome::EndOfTrial(ints(&[("a", 30), ("b", 40)])));
    }

    #[test]
    fn test_single_stream_packet() {
        let outcome = parse_line("4,7,8*\r\n", Some(&ab_definition())).unwrap();
        assert_eq!(outcome, ParseOutcome::Fields(ints(&[("a", 7), ("b", 8)])));
    }

    #[test]
    fn test_terminator_on_last_field() {
        let outcome = parse_line("1,7,8\r\n", Some(&ab_definition())).unwrap();
        assert_eq!(outcome.fields(), &ints(&[("a", 7), ("b", 8)]));
    }

    #[test]
    fn test_unknown_handshake_skipped() {
        let outcome = parse_line("9,1,2*4,3,4", Some(&ab_definition())).unwrap();
        assert_eq!(outcome, ParseOutcome::Fields(ints(&[("a", 3), ("b", 4)])));
    }

    #[test]
    fn test_empty_slot_is_absent() {
        let outcome = parse_line("1,,5", Some(&ab_definition())).unwrap();
        let fields = outcome.into_fields();
        assert_eq!(fields.get("a"), Some(&None));
        assert_eq!(fields.get("b"), Some(&Some(FieldValue::Int32(5))));
    }

    #[test]
    fn test_short_payload_is_malformed() {
        let err = parse_line("4,1", Some(&ab_definition())).unwrap_err();
        match err {
            ProtocolError::MalformedField { field, .. } => assert_eq!(field, "b"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_without_definition_only_signals() {
        assert_eq!(
            parse_line("1,10,20", None).unwrap(),
            ParseOutcome::Fields(FieldMap::new())
        );
        assert!(parse_line("5", None).unwrap().is_end_of_trial());
    }

    #[test]
    fn test_empty_line() {
        assert_eq!(
            parse_line("\r\n", Some(&ab_definition())).unwrap(),
            ParseOutcome::Fields(FieldMap::new())
        );
    }

    #[test]
    fn test_non_numeric_handshake() {
        assert!(matches!(
            parse_line("x,1,2", Some(&ab_definition())),
            Err(ProtocolError::MalformedPacket { .. })
        ));
    }
}
