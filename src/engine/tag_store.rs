// src/engine/tag_store.rs
//
// Tag Store (spec.md §4.2): the authoritative in-memory map from
// (device-id, tag-name) to its current typed value and metadata. A single
// mutex guards the whole map — no I/O ever happens under the lock.
//
// Grounded on the teacher's store_manager.rs, which collapses a similar
// "many callers, one source of truth" problem into one `Lazy<RwLock<...>>`
// singleton with plain get/set/delete functions. This module keeps the
// same shape (flat map, small synchronous operations) but as a struct the
// engine owns rather than a process-wide singleton, and with a plain
// `Mutex` since spec.md §4.2 asks for serialization, not read/write
// fan-out.

use std::collections::HashMap;
use std::sync::Mutex;

use super::error::EngineError;
use super::model::{DataType, Device, RegisterType, Value};

#[derive(Clone, Debug, PartialEq)]
pub struct TagSlot {
    pub address: u16,
    pub register_type: RegisterType,
    pub data_type: DataType,
    pub current_value: Option<Value>,
}

impl TagSlot {
    pub fn is_writable(&self) -> bool {
        self.register_type.is_writable()
    }
}

#[derive(Clone, Debug)]
struct DeviceEntry {
    name: String,
    tags: HashMap<String, TagSlot>,
    /// Preserves declared tag order for snapshot/poll iteration (spec.md §4.4:
    /// "for each tag in declared order").
    order: Vec<String>,
}

#[derive(Default)]
pub struct TagStore {
    devices: Mutex<HashMap<String, DeviceEntry>>,
}

/// Value + writability, as returned by `snapshot()` for the HTTP read endpoint.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct TagSnapshot {
    pub value: Option<Value>,
    pub writable: bool,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct DeviceSnapshot {
    pub name: String,
    pub tags: HashMap<String, TagSnapshot>,
}

impl TagStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomic bulk insert of all tags of a device (spec.md §4.2 `install`).
    pub fn install(&self, device: &Device) {
        let mut tags = HashMap::with_capacity(device.tags.len());
        let mut order = Vec::with_capacity(device.tags.len());
        for tag in &device.tags {
            order.push(tag.name.clone());
            tags.insert(
                tag.name.clone(),
                TagSlot {
                    address: tag.address,
                    register_type: tag.register_type,
                    data_type: tag.data_type,
                    current_value: tag.current_value,
                },
            );
        }
        let mut devices = self.devices.lock().unwrap();
        devices.insert(
            device.id.clone(),
            DeviceEntry {
                name: device.name.clone(),
                tags,
                order,
            },
        );
    }

    /// Atomic bulk remove of all tags of a device (spec.md §4.2 `uninstall`).
    pub fn uninstall(&self, device_id: &str) {
        self.devices.lock().unwrap().remove(device_id);
    }

    pub fn get(&self, device_id: &str, tag_name: &str) -> Option<TagSlot> {
        let devices = self.devices.lock().unwrap();
        devices.get(device_id)?.tags.get(tag_name).cloned()
    }

    /// Update `currentValue` from a poll or from a post-write republish.
    /// Idempotent (spec.md §4.2).
    pub fn set_from_wire(
        &self,
        device_id: &str,
        tag_name: &str,
        value: Value,
    ) -> Result<(), EngineError> {
        let mut devices = self.devices.lock().unwrap();
        let device = devices
            .get_mut(device_id)
            .ok_or_else(|| EngineError::not_found(format!("unknown device '{}'", device_id)))?;
        let slot = device.tags.get_mut(tag_name).ok_or_else(|| {
            EngineError::not_found(format!("unknown tag '{}.{}'", device_id, tag_name))
        })?;
        slot.current_value = Some(value);
        Ok(())
    }

    /// Find the tag of a device whose register address matches, used by the
    /// Modem Listener Bank to resolve an incoming FC03 request (spec.md §4.5).
    pub fn find_by_address(&self, device_id: &str, address: u16) -> Option<(String, TagSlot)> {
        let devices = self.devices.lock().unwrap();
        let entry = devices.get(device_id)?;
        entry
            .order
            .iter()
            .find_map(|name| entry.tags.get(name).filter(|slot| slot.address == address).map(|slot| (name.clone(), slot.clone())))
    }

    /// Declared-order tag names for a device, used by the Poller (spec.md §4.4).
    pub fn tag_order(&self, device_id: &str) -> Vec<String> {
        self.devices
            .lock()
            .unwrap()
            .get(device_id)
            .map(|d| d.order.clone())
            .unwrap_or_default()
    }

    /// Mapping of device-id -> (name, tag-name -> value+writable) for
    /// `GET /api/values` (spec.md §6).
    pub fn snapshot(&self) -> HashMap<String, DeviceSnapshot> {
        let devices = self.devices.lock().unwrap();
        devices
            .iter()
            .map(|(id, entry)| {
                let tags = entry
                    .tags
                    .iter()
                    .map(|(name, slot)| {
                        (
                            name.clone(),
                            TagSnapshot {
                                value: slot.current_value,
                                writable: slot.is_writable(),
                            },
                        )
                    })
                    .collect();
                (
                    id.clone(),
                    DeviceSnapshot {
                        name: entry.name.clone(),
                        tags,
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::model::{DeviceKind, Tag};

    fn device(id: &str) -> Device {
        Device {
            id: id.to_string(),
            name: format!("dev-{}", id),
            kind: DeviceKind::Tcp,
            address: Some("127.0.0.1".to_string()),
            port: Some(502),
            serial: None,
            device_id: 1,
            poll_interval: 2000,
            connected: false,
            tags: vec![Tag {
                name: "t".to_string(),
                address: 100,
                register_type: RegisterType::Holding,
                data_type: DataType::Uint16,
                current_value: None,
            }],
        }
    }

    #[test]
    fn install_then_get() {
        let store = TagStore::new();
        store.install(&device("d1"));
        let slot = store.get("d1", "t").unwrap();
        assert_eq!(slot.address, 100);
        assert!(slot.current_value.is_none());
    }

    #[test]
    fn set_from_wire_then_get_returns_written_value() {
        let store = TagStore::new();
        store.install(&device("d1"));
        store.set_from_wire("d1", "t", Value::Uint16(65)).unwrap();
        let slot = store.get("d1", "t").unwrap();
        assert_eq!(slot.current_value, Some(Value::Uint16(65)));
    }

    #[test]
    fn set_from_wire_unknown_tag_errors() {
        let store = TagStore::new();
        store.install(&device("d1"));
        assert!(store.set_from_wire("d1", "missing", Value::Uint16(1)).is_err());
        assert!(store.set_from_wire("missing", "t", Value::Uint16(1)).is_err());
    }

    #[test]
    fn uninstall_removes_device() {
        let store = TagStore::new();
        store.install(&device("d1"));
        store.uninstall("d1");
        assert!(store.get("d1", "t").is_none());
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn snapshot_reports_writable_flag() {
        let store = TagStore::new();
        store.install(&device("d1"));
        let snap = store.snapshot();
        let d = &snap["d1"];
        assert_eq!(d.name, "dev-d1");
        assert!(d.tags["t"].writable);
    }

    #[test]
    fn find_by_address_locates_matching_tag() {
        let store = TagStore::new();
        store.install(&device("d1"));
        let (name, slot) = store.find_by_address("d1", 100).unwrap();
        assert_eq!(name, "t");
        assert_eq!(slot.address, 100);
        assert!(store.find_by_address("d1", 999).is_none());
    }

    #[test]
    fn tag_order_preserves_declaration_order() {
        let mut d = device("d1");
        d.tags.push(Tag {
            name: "u".to_string(),
            address: 101,
            register_type: RegisterType::Holding,
            data_type: DataType::Uint16,
            current_value: None,
        });
        let store = TagStore::new();
        store.install(&d);
        assert_eq!(store.tag_order("d1"), vec!["t".to_string(), "u".to_string()]);
    }

    #[test]
    fn concurrent_set_and_get_are_linearizable() {
        use std::sync::Arc;
        use std::thread;

        let store = Arc::new(TagStore::new());
        store.install(&device("d1"));

        let mut handles = Vec::new();
        for i in 0..50u16 {
            let store = store.clone();
            handles.push(thread::spawn(move || {
                store.set_from_wire("d1", "t", Value::Uint16(i)).unwrap();
                store.get("d1", "t").unwrap();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        // No panics/deadlocks, and the final value is one of the written ones.
        let slot = store.get("d1", "t").unwrap();
        match slot.current_value {
            Some(Value::Uint16(v)) => assert!(v < 50),
            other => panic!("unexpected value: {:?}", other),
        }
    }
}
