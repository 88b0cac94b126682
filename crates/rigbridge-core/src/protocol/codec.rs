//! Wire codec
//!
//! Converts between typed field values and their wire representation.
//!
//! Inbound values arrive as ASCII text inside a packet payload. Outbound
//! parameters are written as packed little-endian binary, with no framing
//! between fields; the device knows each width from the shared definition.
//!
//! An empty payload slot decodes to `None` for every kind.

use byteorder::{LittleEndian, WriteBytesExt};

use super::{FieldKind, FieldValue, ProtocolError};

/// Separator between elements of an array field
pub const ARRAY_SEPARATOR: char = ';';

/// Decode the text of a payload slot as a value of `kind`
pub fn decode(kind: FieldKind, text: &str) -> Result<Option<FieldValue>, ProtocolError> {
    decode_field(&kind.to_string(), kind, text)
}

/// Decode a named field, reporting `name` in any error
pub fn decode_field(
    name: &str,
    kind: FieldKind,
    text: &str,
) -> Result<Option<FieldValue>, ProtocolError> {
    if text.is_empty() {
        return Ok(None);
    }

    let value = match kind {
        FieldKind::Int32 => FieldValue::Int32(parse_number(name, text)?),
        FieldKind::Int16 => FieldValue::Int16(parse_number(name, text)?),
        FieldKind::Float32 => FieldValue::Float32(parse_number(name, text)?),
        FieldKind::Time => FieldValue::Time(parse_number(name, text)?),
        FieldKind::FixedString(_) | FieldKind::VarString => FieldValue::String(text.to_string()),
        FieldKind::Bool => FieldValue::Bool(parse_bool(name, text)?),
        FieldKind::Int32Array => FieldValue::Int32Array(parse_array(name, text)?),
        FieldKind::Float32Array => FieldValue::Float32Array(parse_array(name, text)?),
    };
    Ok(Some(value))
}

fn parse_number<T>(name: &str, text: &str) -> Result<T, ProtocolError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    text.trim()
        .parse::<T>()
        .map_err(|e| ProtocolError::malformed(name, format!("'{}': {}", text, e)))
}

fn parse_bool(name: &str, text: &str) -> Result<bool, ProtocolError> {
    match text.trim().to_ascii_lowercase().as_str() {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        _ => Err(ProtocolError::malformed(
            name,
            format!("'{}' is not a boolean", text),
        )),
    }
}

/// Split on `;`, dropping the single empty segment a trailing separator leaves
fn parse_array<T>(name: &str, text: &str) -> Result<Vec<T>, ProtocolError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let mut elements: Vec<&str> = text.split(ARRAY_SEPARATOR).collect();
    if elements.last() == Some(&"") {
        elements.pop();
    }
    elements
        .into_iter()
        .map(|element| parse_number(name, element))
        .collect()
}

/// Encode a value as packed binary for an outbound command
///
/// Arrays are inbound-only and cannot be encoded.
pub fn encode(kind: FieldKind, value: &FieldValue) -> Result<Vec<u8>, ProtocolError> {
    encode_field(&kind.to_string(), kind, value)
}

/// Encode a named field, reporting `name` in any error
pub fn encode_field(
    name: &str,
    kind: FieldKind,
    value: &FieldValue,
) -> Result<Vec<u8>, ProtocolError> {
    if kind.is_array() {
        return Err(ProtocolError::UnsupportedEncoding {
            field: name.to_string(),
            kind,
        });
    }
    if !value.matches_kind(kind) {
        return Err(ProtocolError::malformed(
            name,
            format!("value {:?} does not match kind {}", value, kind),
        ));
    }

    let mut bytes = Vec::with_capacity(kind.wire_width().unwrap_or(16));
    match value {
        FieldValue::Int32(v) => bytes.write_i32::<LittleEndian>(*v)?,
        FieldValue::Int16(v) => bytes.write_i16::<LittleEndian>(*v)?,
        FieldValue::Float32(v) => bytes.write_f32::<LittleEndian>(*v)?,
        FieldValue::Time(v) => bytes.write_f64::<LittleEndian>(*v)?,
        FieldValue::Bool(v) => bytes.write_u8(*v as u8)?,
        FieldValue::String(s) => {
            bytes.extend_from_slice(s.as_bytes());
            if let FieldKind::FixedString(len) = kind {
                bytes.resize(len, 0);
            }
        }
        FieldValue::Int32Array(_) | FieldValue::Float32Array(_) => {}
    }
    Ok(bytes)
}

/// Render a value the way the device writes it inside a payload slot
pub fn encode_text(value: &FieldValue) -> String {
    match value {
        FieldValue::Int32(v) => v.to_string(),
        FieldValue::Int16(v) => v.to_string(),
        FieldValue::Float32(v) => v.to_string(),
        FieldValue::Time(v) => v.to_string(),
        FieldValue::Bool(v) => (*v as u8).to_string(),
        FieldValue::String(s) => s.clone(),
        FieldValue::Int32Array(values) => join(values),
        FieldValue::Float32Array(values) => join(values),
    }
}

fn join<T: ToString>(values: &[T]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(&ARRAY_SEPARATOR.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_scalar_roundtrip_through_text() {
        let cases = vec![
            (FieldKind::Int32, FieldValue::Int32(-123456)),
            (FieldKind::Int16, FieldValue::Int16(-300)),
            (FieldKind::Float32, FieldValue::Float32(0.1)),
            (FieldKind::Time, FieldValue::Time(1_700_000_000.125)),
            (FieldKind::VarString, FieldValue::String("odorA".into())),
            (FieldKind::Bool, FieldValue::Bool(true)),
        ];
        for (kind, value) in cases {
            let text = encode_text(&value);
            assert_eq!(decode(kind, &text).unwrap(), Some(value));
        }
    }

    #[test]
    fn test_array_trailing_separator() {
        assert_eq!(
            decode(FieldKind::Int32Array, "1;2;3;").unwrap(),
            Some(FieldValue::Int32Array(vec![1, 2, 3]))
        );
        assert_eq!(
            decode(FieldKind::Int32Array, "1;2;3").unwrap(),
            Some(FieldValue::Int32Array(vec![1, 2, 3]))
        );
        assert_eq!(
            decode(FieldKind::Float32Array, "0.5;1.5;").unwrap(),
            Some(FieldValue::Float32Array(vec![0.5, 1.5]))
        );
    }

    #[test]
    fn test_array_interior_gap_is_malformed() {
        assert!(matches!(
            decode(FieldKind::Int32Array, "1;;3"),
            Err(ProtocolError::MalformedField { .. })
        ));
    }

    #[test]
    fn test_empty_text_is_absent() {
        for kind in [
            FieldKind::Int32,
            FieldKind::Int16,
            FieldKind::Float32,
            FieldKind::Time,
            FieldKind::VarString,
            FieldKind::FixedString(8),
            FieldKind::Bool,
            FieldKind::Int32Array,
        ] {
            assert_eq!(decode(kind, "").unwrap(), None, "kind {}", kind);
        }
        assert_eq!(
            decode(FieldKind::Int32, "0").unwrap(),
            Some(FieldValue::Int32(0))
        );
    }

    #[test]
    fn test_non_numeric_is_malformed() {
        let err = decode_field("duration", FieldKind::Int32, "abc").unwrap_err();
        match err {
            ProtocolError::MalformedField { field, .. } => assert_eq!(field, "duration"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(decode(FieldKind::Int16, "40000").is_err());
    }

    #[test]
    fn test_strings_pass_through() {
        assert_eq!(
            decode(FieldKind::VarString, " spaced ").unwrap(),
            Some(FieldValue::String(" spaced ".into()))
        );
    }

    #[test]
    fn test_encode_packed_widths() {
        assert_eq!(
            encode(FieldKind::Int32, &FieldValue::Int32(1)).unwrap(),
            vec![1, 0, 0, 0]
        );
        assert_eq!(
            encode(FieldKind::Int16, &FieldValue::Int16(-2)).unwrap(),
            vec![0xFE, 0xFF]
        );
        assert_eq!(
            encode(FieldKind::Float32, &FieldValue::Float32(1.0)).unwrap(),
            1.0f32.to_le_bytes().to_vec()
        );
        assert_eq!(
            encode(FieldKind::Time, &FieldValue::Time(2.5)).unwrap().len(),
            8
        );
        assert_eq!(
            encode(FieldKind::FixedString(4), &FieldValue::String("ab".into())).unwrap(),
            vec![b'a', b'b', 0, 0]
        );
    }

    #[test]
    fn test_encode_rejects_arrays_and_mismatches() {
        assert!(matches!(
            encode(FieldKind::Int32Array, &FieldValue::Int32Array(vec![1])),
            Err(ProtocolError::UnsupportedEncoding { .. })
        ));
        assert!(matches!(
            encode(FieldKind::Int16, &FieldValue::Int32(1)),
            Err(ProtocolError::MalformedField { .. })
        ));
    }
}
