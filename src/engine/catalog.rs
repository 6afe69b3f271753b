// src/engine/catalog.rs
//
// Catalog persistence (spec.md §6 "Catalog file" + §9 design note): loads
// the full device array at startup and rewrites it on every admin
// mutation. Grounded on store_manager.rs's atomic write-to-temp-then-
// rename, without its debounce — admin mutations here are already
// serialized one at a time above the core (spec.md §5), so there is
// nothing to coalesce.

use std::path::{Path, PathBuf};

use super::error::EngineError;
use super::model::Device;

/// The external collaborator the core requires (spec.md §1): load the
/// full array on startup, persist the full array on each admin mutation.
pub trait CatalogStore: Send + Sync {
    fn load(&self) -> Result<Vec<Device>, EngineError>;
    fn save(&self, devices: &[Device]) -> Result<(), EngineError>;
}

pub struct JsonFileCatalog {
    path: PathBuf,
}

impl JsonFileCatalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CatalogStore for JsonFileCatalog {
    fn load(&self) -> Result<Vec<Device>, EngineError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path)
            .map_err(|e| EngineError::protocol(format!("failed to read catalog: {}", e)))?;
        serde_json::from_str(&content)
            .map_err(|e| EngineError::protocol(format!("failed to parse catalog: {}", e)))
    }

    fn save(&self, devices: &[Device]) -> Result<(), EngineError> {
        let json = serde_json::to_string_pretty(devices)
            .map_err(|e| EngineError::protocol(format!("failed to serialize catalog: {}", e)))?;

        let temp_path = temp_path_for(&self.path);
        std::fs::write(&temp_path, &json)
            .map_err(|e| EngineError::protocol(format!("failed to write catalog temp file: {}", e)))?;
        std::fs::rename(&temp_path, &self.path)
            .map_err(|e| EngineError::protocol(format!("failed to rename catalog temp file: {}", e)))?;
        Ok(())
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "catalog.json".into());
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::model::DeviceKind;

    fn sample_device() -> Device {
        Device {
            id: "d1".to_string(),
            name: "Meter".to_string(),
            kind: DeviceKind::Tcp,
            address: Some("127.0.0.1".to_string()),
            port: Some(502),
            serial: None,
            device_id: 1,
            poll_interval: 2000,
            connected: false,
            tags: vec![],
        }
    }

    #[test]
    fn load_missing_file_returns_empty() {
        let dir = std::env::temp_dir().join(format!("modgate-catalog-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let catalog = JsonFileCatalog::new(dir.join("does-not-exist.json"));
        assert!(catalog.load().unwrap().is_empty());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn save_then_load_roundtrips() {
        let dir = std::env::temp_dir().join(format!("modgate-catalog-test-{}-2", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let catalog = JsonFileCatalog::new(dir.join("devices.json"));

        let devices = vec![sample_device()];
        catalog.save(&devices).unwrap();
        let loaded = catalog.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "d1");

        // No leftover temp file after a successful save.
        assert!(!dir.join("devices.json.tmp").exists());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn save_overwrites_previous_contents() {
        let dir = std::env::temp_dir().join(format!("modgate-catalog-test-{}-3", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let catalog = JsonFileCatalog::new(dir.join("devices.json"));

        catalog.save(&[sample_device()]).unwrap();
        catalog.save(&[]).unwrap();
        assert!(catalog.load().unwrap().is_empty());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
