// src/config.rs
//
// Process configuration: the constants spec.md §6 enumerates, loaded from
// an optional TOML file and overridable by environment variables. Follows
// the teacher's AppSettings shape (one `#[serde(default = "...")]` free
// function per field) but reads from a plain file path instead of a Tauri
// path resolver, since this crate has no Tauri app handle.

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SerialDefaults {
    #[serde(default = "default_baud")]
    pub baud: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default = "default_parity")]
    pub parity: String, // "none" | "odd" | "even"
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

impl Default for SerialDefaults {
    fn default() -> Self {
        Self {
            baud: default_baud(),
            data_bits: default_data_bits(),
            stop_bits: default_stop_bits(),
            parity: default_parity(),
        }
    }
}

/// Engine-wide configuration constants (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Inclusive lower bound of the modem TCP listener port range.
    #[serde(default = "default_listen_port_lo")]
    pub listen_port_lo: u16,
    /// Inclusive upper bound of the modem TCP listener port range.
    #[serde(default = "default_listen_port_hi")]
    pub listen_port_hi: u16,
    /// OPC UA server endpoint port.
    #[serde(default = "default_opcua_port")]
    pub opcua_port: u16,
    /// HTTP admin interface port.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Default poll interval for devices that don't specify one, in ms.
    #[serde(default = "default_poll_interval_ms")]
    pub default_poll_interval_ms: u64,
    /// Default serial line parameters for RTU devices that don't specify them.
    #[serde(default)]
    pub default_serial: SerialDefaults,
    /// Per-request timeout for Modbus connects and transactions, in ms.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Path to the persisted device catalog.
    #[serde(default = "default_catalog_path")]
    pub catalog_path: String,
}

fn default_listen_port_lo() -> u16 {
    8000
}
fn default_listen_port_hi() -> u16 {
    8100
}
fn default_opcua_port() -> u16 {
    52000
}
fn default_http_port() -> u16 {
    3000
}
fn default_poll_interval_ms() -> u64 {
    2000
}
fn default_request_timeout_ms() -> u64 {
    2000
}
fn default_catalog_path() -> String {
    "devices.json".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            listen_port_lo: default_listen_port_lo(),
            listen_port_hi: default_listen_port_hi(),
            opcua_port: default_opcua_port(),
            http_port: default_http_port(),
            default_poll_interval_ms: default_poll_interval_ms(),
            default_serial: SerialDefaults::default(),
            request_timeout_ms: default_request_timeout_ms(),
            catalog_path: default_catalog_path(),
        }
    }
}

impl EngineConfig {
    /// Load from a TOML file if it exists, falling back to defaults.
    /// Environment variables of the form `MODGATE_<FIELD>` (upper snake case)
    /// override individual scalar fields after the file is parsed.
    pub fn load(path: &Path) -> Result<Self, String> {
        let mut cfg = if path.exists() {
            let content = std::fs::read_to_string(path)
                .map_err(|e| format!("Failed to read config file: {}", e))?;
            toml::from_str(&content).map_err(|e| format!("Invalid config TOML: {}", e))?
        } else {
            EngineConfig::default()
        };

        if let Ok(v) = std::env::var("MODGATE_HTTP_PORT") {
            cfg.http_port = v
                .parse()
                .map_err(|_| "MODGATE_HTTP_PORT must be a u16".to_string())?;
        }
        if let Ok(v) = std::env::var("MODGATE_OPCUA_PORT") {
            cfg.opcua_port = v
                .parse()
                .map_err(|_| "MODGATE_OPCUA_PORT must be a u16".to_string())?;
        }
        if let Ok(v) = std::env::var("MODGATE_CATALOG_PATH") {
            cfg.catalog_path = v;
        }

        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.listen_port_lo, 8000);
        assert_eq!(cfg.listen_port_hi, 8100);
        assert_eq!(cfg.opcua_port, 52000);
        assert_eq!(cfg.http_port, 3000);
        assert_eq!(cfg.default_poll_interval_ms, 2000);
        assert_eq!(cfg.default_serial.baud, 9600);
        assert_eq!(cfg.default_serial.data_bits, 8);
        assert_eq!(cfg.default_serial.stop_bits, 1);
        assert_eq!(cfg.default_serial.parity, "none");
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let cfg = EngineConfig::load(Path::new("/nonexistent/modgate.toml")).unwrap();
        assert_eq!(cfg.http_port, 3000);
    }
}
