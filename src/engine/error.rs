// src/engine/error.rs
//
// Uniform error type for the engine (spec.md §7). Hand-rolled with named
// constructor helpers, matching the teacher's IoError shape (see
// io/gvret/tcp.rs's `IoError::connection`/`IoError::timeout` calls) rather
// than a thiserror-derived enum: every device driver in the teacher app
// converts its error to a plain value at the boundary, and callers here
// do the same (HTTP maps to a status code, the OPC UA facade maps to a
// status class).

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Bad admin input (spec.md §7) — HTTP 400.
    ValidationFailed(String),
    /// Unknown device or tag — HTTP 404.
    NotFound(String),
    /// Read-only register class or modem write attempt — HTTP 400 / OPC UA BadNotWritable.
    NotWritable(String),
    /// Transport could not be opened.
    ConnectFailed { device: String, reason: String },
    /// A connect or request exceeded its deadline.
    Timeout { device: String, op: String },
    /// An in-flight request failed at the transport or Modbus-exception level.
    TransportError { device: String, reason: String },
    /// Malformed frame received on a modem session; the session continues.
    ProtocolError(String),
    /// Encode-side failure for writes (value doesn't fit the tag's data type).
    ValueOutOfRange(String),
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        EngineError::ValidationFailed(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        EngineError::NotFound(msg.into())
    }

    pub fn not_writable(msg: impl Into<String>) -> Self {
        EngineError::NotWritable(msg.into())
    }

    pub fn connect_failed(device: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::ConnectFailed {
            device: device.into(),
            reason: reason.into(),
        }
    }

    pub fn timeout(device: impl Into<String>, op: impl Into<String>) -> Self {
        EngineError::Timeout {
            device: device.into(),
            op: op.into(),
        }
    }

    pub fn transport(device: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::TransportError {
            device: device.into(),
            reason: reason.into(),
        }
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        EngineError::ProtocolError(msg.into())
    }

    pub fn out_of_range(msg: impl Into<String>) -> Self {
        EngineError::ValueOutOfRange(msg.into())
    }

    /// Whether this error should mark a device's transport disconnected
    /// (spec.md §4.3 failure policy / §7 propagation policy).
    pub fn recycles_transport(&self) -> bool {
        matches!(
            self,
            EngineError::ConnectFailed { .. }
                | EngineError::Timeout { .. }
                | EngineError::TransportError { .. }
        )
    }

    /// HTTP status code per spec.md §7.
    pub fn http_status(&self) -> u16 {
        match self {
            EngineError::ValidationFailed(_) => 400,
            EngineError::NotWritable(_) => 400,
            EngineError::ValueOutOfRange(_) => 400,
            EngineError::NotFound(_) => 404,
            EngineError::ConnectFailed { .. }
            | EngineError::Timeout { .. }
            | EngineError::TransportError { .. } => 500,
            EngineError::ProtocolError(_) => 500,
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::ValidationFailed(m) => write!(f, "validation failed: {}", m),
            EngineError::NotFound(m) => write!(f, "not found: {}", m),
            EngineError::NotWritable(m) => write!(f, "not writable: {}", m),
            EngineError::ConnectFailed { device, reason } => {
                write!(f, "connect failed for {}: {}", device, reason)
            }
            EngineError::Timeout { device, op } => {
                write!(f, "timeout on {} during {}", device, op)
            }
            EngineError::TransportError { device, reason } => {
                write!(f, "transport error on {}: {}", device, reason)
            }
            EngineError::ProtocolError(m) => write!(f, "protocol error: {}", m),
            EngineError::ValueOutOfRange(m) => write!(f, "value out of range: {}", m),
        }
    }
}

impl std::error::Error for EngineError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_mapping() {
        assert_eq!(EngineError::validation("x").http_status(), 400);
        assert_eq!(EngineError::not_found("x").http_status(), 404);
        assert_eq!(EngineError::not_writable("x").http_status(), 400);
        assert_eq!(EngineError::connect_failed("d", "r").http_status(), 500);
        assert_eq!(EngineError::timeout("d", "connect").http_status(), 500);
        assert_eq!(EngineError::transport("d", "r").http_status(), 500);
        assert_eq!(EngineError::out_of_range("x").http_status(), 400);
    }

    #[test]
    fn recycles_transport_only_for_io_errors() {
        assert!(EngineError::connect_failed("d", "r").recycles_transport());
        assert!(EngineError::timeout("d", "op").recycles_transport());
        assert!(EngineError::transport("d", "r").recycles_transport());
        assert!(!EngineError::validation("x").recycles_transport());
        assert!(!EngineError::not_found("x").recycles_transport());
        assert!(!EngineError::protocol("x").recycles_transport());
    }
}
