// src/engine/model.rs
//
// Data model (spec.md §3): Device and Tag records plus the value/register
// enums shared across the engine. Mirrors the teacher's plain-struct,
// serde-derived config records (see settings.rs::IOProfile) rather than
// anything catalog-specific.

use serde::{Deserialize, Serialize};

use super::error::EngineError;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RegisterType {
    Holding,
    Input,
    Coil,
    Discrete,
}

impl RegisterType {
    /// spec.md §4.1 `isWritable`: true iff `holding` or `coil`.
    pub fn is_writable(self) -> bool {
        matches!(self, RegisterType::Holding | RegisterType::Coil)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Float,
    Int32,
    Uint32,
    Int16,
    Uint16,
    Boolean,
}

impl DataType {
    /// spec.md §4.1 `registerCount`.
    pub fn register_count(self) -> u16 {
        match self {
            DataType::Float | DataType::Int32 | DataType::Uint32 => 2,
            DataType::Int16 | DataType::Uint16 | DataType::Boolean => 1,
        }
    }

    fn is_32bit(self) -> bool {
        matches!(self, DataType::Float | DataType::Int32 | DataType::Uint32)
    }
}

/// A typed tag value (spec.md §9: "dynamic typing ... replaced by a tagged
/// union over the six data types").
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Value {
    Float(f32),
    Int32(i32),
    Uint32(u32),
    Int16(i16),
    Uint16(u16),
    Boolean(bool),
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Float(_) => DataType::Float,
            Value::Int32(_) => DataType::Int32,
            Value::Uint32(_) => DataType::Uint32,
            Value::Int16(_) => DataType::Int16,
            Value::Uint16(_) => DataType::Uint16,
            Value::Boolean(_) => DataType::Boolean,
        }
    }

    /// Value as f64, for the Modem Listener Bank's `round(value)` response path
    /// (spec.md §4.5) and for OPC UA variant conversion.
    pub fn as_f64(&self) -> f64 {
        match *self {
            Value::Float(v) => v as f64,
            Value::Int32(v) => v as f64,
            Value::Uint32(v) => v as f64,
            Value::Int16(v) => v as f64,
            Value::Uint16(v) => v as f64,
            Value::Boolean(v) => {
                if v {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }

    /// Parse a string into a value of the given data type (spec.md §4.7:
    /// "parse value as the tag's declared type (numeric parse from string
    /// accepted)"). A syntactically valid number that overflows the
    /// target integer width (e.g. "70000" for a uint16 tag) is reported as
    /// `ValueOutOfRange` rather than `ValidationFailed` (spec.md §7): the
    /// input parsed fine, it just doesn't fit the declared data type.
    pub fn parse(s: &str, dt: DataType) -> Result<Self, EngineError> {
        let unparseable = || EngineError::validation(format!("cannot parse '{}' as {:?}", s, dt));
        Ok(match dt {
            DataType::Float => Value::Float(s.parse::<f32>().map_err(|_| unparseable())?),
            DataType::Int32 => Value::Int32(s.parse::<i32>().map_err(|e| int_parse_error(e, s, dt))?),
            DataType::Uint32 => Value::Uint32(s.parse::<u32>().map_err(|e| int_parse_error(e, s, dt))?),
            DataType::Int16 => Value::Int16(s.parse::<i16>().map_err(|e| int_parse_error(e, s, dt))?),
            DataType::Uint16 => Value::Uint16(s.parse::<u16>().map_err(|e| int_parse_error(e, s, dt))?),
            DataType::Boolean => {
                let lowered = s.trim().to_ascii_lowercase();
                match lowered.as_str() {
                    "1" | "true" | "on" | "yes" => Value::Boolean(true),
                    "0" | "false" | "off" | "no" => Value::Boolean(false),
                    _ => return Err(unparseable()),
                }
            }
        })
    }
}

/// Classify an integer parse failure: overflow of an otherwise well-formed
/// number is `ValueOutOfRange`, anything else (empty string, stray
/// characters, a bare sign) is `ValidationFailed`.
fn int_parse_error(e: std::num::ParseIntError, s: &str, dt: DataType) -> EngineError {
    use std::num::IntErrorKind;
    match e.kind() {
        IntErrorKind::PosOverflow | IntErrorKind::NegOverflow => {
            EngineError::out_of_range(format!("'{}' does not fit in {:?}", s, dt))
        }
        _ => EngineError::validation(format!("cannot parse '{}' as {:?}", s, dt)),
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Tag {
    pub name: String,
    pub address: u16,
    pub register_type: RegisterType,
    pub data_type: DataType,
    /// Transient: set by the poller or by a successful write, never
    /// present at creation time unless the catalog carries a cached
    /// last-known value.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub current_value: Option<Value>,
}

impl Tag {
    /// spec.md §3 `(registerType, dataType)` compatibility invariant.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.name.trim().is_empty() {
            return Err(EngineError::validation("tag name must not be empty"));
        }
        match (self.register_type, self.data_type) {
            (RegisterType::Coil, DataType::Boolean) => {}
            (RegisterType::Discrete, DataType::Boolean) => {}
            (RegisterType::Coil, _) | (RegisterType::Discrete, _) => {
                return Err(EngineError::validation(format!(
                    "tag '{}': {:?} register only supports boolean",
                    self.name, self.register_type
                )))
            }
            (RegisterType::Holding, DataType::Boolean)
            | (RegisterType::Input, DataType::Boolean) => {
                return Err(EngineError::validation(format!(
                    "tag '{}': boolean is only valid on coil/discrete registers",
                    self.name
                )))
            }
            (RegisterType::Holding, _) | (RegisterType::Input, _) => {}
        }
        Ok(())
    }

    pub fn is_writable(&self) -> bool {
        self.register_type.is_writable()
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceKind {
    Tcp,
    Rtu,
    TcpModem,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SerialParams {
    pub path: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default = "default_parity")]
    pub parity: String,
}

fn default_baud() -> u32 {
    9600
}
fn default_data_bits() -> u8 {
    8
}
fn default_stop_bits() -> u8 {
    1
}
fn default_parity() -> String {
    "none".to_string()
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Device {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: DeviceKind,
    /// tcp / tcp-modem: server host (unused for tcp-modem, which listens).
    #[serde(default)]
    pub address: Option<String>,
    /// tcp: server port. tcp-modem: listen port.
    #[serde(default)]
    pub port: Option<u16>,
    /// rtu: serial transport parameters.
    #[serde(default)]
    pub serial: Option<SerialParams>,
    /// Modbus unit id (default 1).
    #[serde(default = "default_unit_id")]
    pub device_id: u8,
    /// Poll interval in ms (default 2000).
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    /// Transient connection state, not persisted meaningfully across restarts.
    #[serde(default)]
    pub connected: bool,
    pub tags: Vec<Tag>,
}

fn default_unit_id() -> u8 {
    1
}
fn default_poll_interval() -> u64 {
    2000
}

impl Device {
    /// Validate a single device in isolation against spec.md §3's invariants
    /// that don't require comparing against the rest of the catalog.
    pub fn validate_standalone(&self, port_lo: u16, port_hi: u16) -> Result<(), EngineError> {
        if self.name.trim().is_empty() {
            return Err(EngineError::validation("device name must not be empty"));
        }
        if self.tags.is_empty() {
            return Err(EngineError::validation(format!(
                "device '{}' must declare at least one tag",
                self.name
            )));
        }

        let mut seen_names = std::collections::HashSet::new();
        for tag in &self.tags {
            tag.validate()?;
            if !seen_names.insert(tag.name.clone()) {
                return Err(EngineError::validation(format!(
                    "device '{}': duplicate tag name '{}'",
                    self.name, tag.name
                )));
            }
            if tag.data_type.is_32bit()
                && !matches!(tag.register_type, RegisterType::Holding | RegisterType::Input)
            {
                return Err(EngineError::validation(format!(
                    "tag '{}': 32-bit data types require holding or input registers",
                    tag.name
                )));
            }
        }

        match self.kind {
            DeviceKind::Tcp => {
                if self.address.is_none() || self.port.is_none() {
                    return Err(EngineError::validation(
                        "tcp device requires 'address' and 'port'",
                    ));
                }
            }
            DeviceKind::Rtu => {
                if self.serial.is_none() {
                    return Err(EngineError::validation("rtu device requires 'serial'"));
                }
            }
            DeviceKind::TcpModem => {
                let port = self
                    .port
                    .ok_or_else(|| EngineError::validation("tcp-modem device requires 'port'"))?;
                if port < port_lo || port > port_hi {
                    return Err(EngineError::validation(format!(
                        "tcp-modem listen port {} outside configured range [{}, {}]",
                        port, port_lo, port_hi
                    )));
                }
            }
        }

        Ok(())
    }
}
