//! Typed fields and protocol definitions
//!
//! A protocol definition maps field names to their position inside a device
//! payload and their storage kind. The same definition drives decoding of
//! inbound packets and encoding of outbound parameter sets.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Decoded fields keyed by name. `None` marks a field whose payload slot was
/// empty, which is distinct from a zero or empty-string value.
pub type FieldMap = BTreeMap<String, Option<FieldValue>>;

/// Name of the parameter that identifies a trial on the host side only.
/// It is never transmitted to the device.
pub const TRIAL_NUMBER_FIELD: &str = "trialNumber";

/// Storage and wire kind of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// 32-bit signed integer
    Int32,
    /// 16-bit signed integer
    Int16,
    /// 32-bit float
    Float32,
    /// String stored in a fixed number of bytes
    FixedString(usize),
    /// Variable-length string
    VarString,
    /// Timestamp as double-precision seconds
    Time,
    /// Boolean flag
    Bool,
    /// Variable-length array of 32-bit integers (inbound only)
    Int32Array,
    /// Variable-length array of 32-bit floats (inbound only)
    Float32Array,
}

impl FieldKind {
    /// Whether values of this kind live in an array channel rather than a row
    pub fn is_array(&self) -> bool {
        matches!(self, FieldKind::Int32Array | FieldKind::Float32Array)
    }

    /// Number of bytes this kind occupies on the outbound wire, if fixed
    pub fn wire_width(&self) -> Option<usize> {
        match self {
            FieldKind::Int32 | FieldKind::Float32 => Some(4),
            FieldKind::Int16 => Some(2),
            FieldKind::Time => Some(8),
            FieldKind::Bool => Some(1),
            FieldKind::FixedString(len) => Some(*len),
            FieldKind::VarString | FieldKind::Int32Array | FieldKind::Float32Array => None,
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldKind::Int32 => write!(f, "int32"),
            FieldKind::Int16 => write!(f, "int16"),
            FieldKind::Float32 => write!(f, "float32"),
            FieldKind::FixedString(len) => write!(f, "string[{}]", len),
            FieldKind::VarString => write!(f, "string"),
            FieldKind::Time => write!(f, "time"),
            FieldKind::Bool => write!(f, "bool"),
            FieldKind::Int32Array => write!(f, "int32[]"),
            FieldKind::Float32Array => write!(f, "float32[]"),
        }
    }
}

/// A typed field value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Int32(i32),
    Int16(i16),
    Float32(f32),
    String(String),
    Time(f64),
    Bool(bool),
    Int32Array(Vec<i32>),
    Float32Array(Vec<f32>),
}

impl FieldValue {
    /// Check whether this value can be stored in a field of `kind`
    pub fn matches_kind(&self, kind: FieldKind) -> bool {
        matches!(
            (self, kind),
            (FieldValue::Int32(_), FieldKind::Int32)
                | (FieldValue::Int16(_), FieldKind::Int16)
                | (FieldValue::Float32(_), FieldKind::Float32)
                | (FieldValue::String(_), FieldKind::FixedString(_))
                | (FieldValue::String(_), FieldKind::VarString)
                | (FieldValue::Time(_), FieldKind::Time)
                | (FieldValue::Bool(_), FieldKind::Bool)
                | (FieldValue::Int32Array(_), FieldKind::Int32Array)
                | (FieldValue::Float32Array(_), FieldKind::Float32Array)
        )
    }

    pub fn is_array(&self) -> bool {
        matches!(self, FieldValue::Int32Array(_) | FieldValue::Float32Array(_))
    }

    /// Get as an integer, widening 16-bit values
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Int32(v) => Some(*v as i64),
            FieldValue::Int16(v) => Some(*v as i64),
            FieldValue::Bool(v) => Some(*v as i64),
            _ => None,
        }
    }

    /// Get as a float, widening single-precision values
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Float32(v) => Some(*v as f64),
            FieldValue::Time(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Interpret a JSON value as a value of `kind`
    pub fn from_json(kind: FieldKind, value: &serde_json::Value) -> Option<Self> {
        match kind {
            FieldKind::Int32 => value
                .as_i64()
                .and_then(|v| i32::try_from(v).ok())
                .map(FieldValue::Int32),
            FieldKind::Int16 => value
                .as_i64()
                .and_then(|v| i16::try_from(v).ok())
                .map(FieldValue::Int16),
            FieldKind::Float32 => value.as_f64().map(|v| FieldValue::Float32(v as f32)),
            FieldKind::Time => value.as_f64().map(FieldValue::Time),
            FieldKind::FixedString(_) | FieldKind::VarString => {
                value.as_str().map(|s| FieldValue::String(s.to_string()))
            }
            FieldKind::Bool => value.as_bool().map(FieldValue::Bool),
            FieldKind::Int32Array => value
                .as_array()?
                .iter()
                .map(|v| v.as_i64().and_then(|v| i32::try_from(v).ok()))
                .collect::<Option<Vec<_>>>()
                .map(FieldValue::Int32Array),
            FieldKind::Float32Array => value
                .as_array()?
                .iter()
                .map(|v| v.as_f64().map(|v| v as f32))
                .collect::<Option<Vec<_>>>()
                .map(FieldValue::Float32Array),
        }
    }
}

/// One field of a protocol definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawFieldDef")]
pub struct FieldDef {
    /// Field name
    pub name: String,
    /// 0-based index inside a device payload (index 0 is the handshake code)
    pub position: usize,
    /// Field kind
    pub kind: FieldKind,
    /// Current value, used when the field is sent to the device
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<FieldValue>,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, position: usize, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            position,
            kind,
            value: None,
        }
    }

    pub fn with_value(mut self, value: FieldValue) -> Self {
        self.value = Some(value);
        self
    }
}

#[derive(Deserialize)]
struct RawFieldDef {
    name: String,
    position: usize,
    kind: FieldKind,
    #[serde(default)]
    value: Option<serde_json::Value>,
}

impl TryFrom<RawFieldDef> for FieldDef {
    type Error = String;

    fn try_from(raw: RawFieldDef) -> Result<Self, Self::Error> {
        let value = match raw.value {
            None | Some(serde_json::Value::Null) => None,
            Some(json) => Some(FieldValue::from_json(raw.kind, &json).ok_or_else(|| {
                format!(
                    "value {} does not fit field '{}' of kind {}",
                    json, raw.name, raw.kind
                )
            })?),
        };
        Ok(FieldDef {
            name: raw.name,
            position: raw.position,
            kind: raw.kind,
            value,
        })
    }
}

/// Mapping of field names to their definitions
///
/// Serialized as a list of field definitions; duplicate names are rejected
/// on load.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<FieldDef>", into = "Vec<FieldDef>")]
pub struct ProtocolDefinition {
    fields: BTreeMap<String, FieldDef>,
}

impl ProtocolDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field without a value
    pub fn with_field(mut self, name: impl Into<String>, position: usize, kind: FieldKind) -> Self {
        self.insert(FieldDef::new(name, position, kind));
        self
    }

    /// Add a field carrying a value to send
    pub fn with_value(
        mut self,
        name: impl Into<String>,
        position: usize,
        kind: FieldKind,
        value: FieldValue,
    ) -> Self {
        self.insert(FieldDef::new(name, position, kind).with_value(value));
        self
    }

    /// Insert a definition, returning the one it replaced
    pub fn insert(&mut self, def: FieldDef) -> Option<FieldDef> {
        self.fields.insert(def.name.clone(), def)
    }

    pub fn get(&self, name: &str) -> Option<&FieldDef> {
        self.fields.get(name)
    }

    /// Update the value of an existing field. Returns false if the field is unknown.
    pub fn set_value(&mut self, name: &str, value: FieldValue) -> bool {
        match self.fields.get_mut(name) {
            Some(def) => {
                def.value = Some(value);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterate definitions in name order
    pub fn iter(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.values()
    }

    /// Definitions ordered by ascending wire position, the order the device
    /// expects outbound parameters in
    pub fn by_position(&self) -> Vec<&FieldDef> {
        let mut defs: Vec<&FieldDef> = self.fields.values().collect();
        defs.sort_by(|a, b| a.position.cmp(&b.position).then_with(|| a.name.cmp(&b.name)));
        defs
    }

    /// Field names and kinds with positional metadata stripped
    pub fn columns(&self) -> Vec<(String, FieldKind)> {
        self.fields
            .values()
            .map(|def| (def.name.clone(), def.kind))
            .collect()
    }

    /// Current values of all fields, `None` where no value was set
    pub fn values(&self) -> FieldMap {
        self.fields
            .values()
            .map(|def| (def.name.clone(), def.value.clone()))
            .collect()
    }
}

impl TryFrom<Vec<FieldDef>> for ProtocolDefinition {
    type Error = String;

    fn try_from(defs: Vec<FieldDef>) -> Result<Self, Self::Error> {
        let mut protocol = ProtocolDefinition::new();
        for def in defs {
            let name = def.name.clone();
            if protocol.insert(def).is_some() {
                return Err(format!("duplicate field '{}'", name));
            }
        }
        Ok(protocol)
    }
}

impl From<ProtocolDefinition> for Vec<FieldDef> {
    fn from(protocol: ProtocolDefinition) -> Self {
        protocol.fields.into_values().collect()
    }
}
