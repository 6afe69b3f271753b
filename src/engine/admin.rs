// src/engine/admin.rs
//
// Admin Operations (spec.md §4.7): the small set of mutating operations
// the HTTP layer invokes on the core. Each operation threads through the
// catalog, Tag Store, Address-Space Bridge, Client Pool, Poller registry
// and (for modem devices) the Modem Listener Bank's routing table, rolling
// back earlier steps if a later one fails (spec.md §4.7 "Atomicity").
//
// Grounded on the teacher's settings.rs (`validate then persist then
// apply` ordering for a small set of named mutations against a single
// shared state) generalised from its one-shot settings blob to the
// multi-collaborator rollback spec.md requires.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use uuid::Uuid;

use crate::tlog;

use super::bridge::AddressSpaceFacade;
use super::catalog::CatalogStore;
use super::client_pool::ClientPool;
use super::error::EngineError;
use super::model::{Device, DeviceKind, Value};
use super::modem::ModemBank;
use super::poller::{self, PollerHandle};
use super::tag_store::TagStore;

pub struct AdminOps {
    devices: StdMutex<HashMap<String, Device>>,
    store: Arc<TagStore>,
    pool: Arc<ClientPool>,
    bridge: Arc<dyn AddressSpaceFacade>,
    catalog: Arc<dyn CatalogStore>,
    modem: Arc<ModemBank>,
    pollers: StdMutex<HashMap<String, PollerHandle>>,
    port_lo: u16,
    port_hi: u16,
}

impl AdminOps {
    pub fn new(
        store: Arc<TagStore>,
        pool: Arc<ClientPool>,
        bridge: Arc<dyn AddressSpaceFacade>,
        catalog: Arc<dyn CatalogStore>,
        modem: Arc<ModemBank>,
        port_lo: u16,
        port_hi: u16,
    ) -> Self {
        Self {
            devices: StdMutex::new(HashMap::new()),
            store,
            pool,
            bridge,
            catalog,
            modem,
            pollers: StdMutex::new(HashMap::new()),
            port_lo,
            port_hi,
        }
    }

    /// Load-time materialization: install every catalog device without
    /// re-persisting or re-validating uniqueness (the catalog is assumed
    /// internally consistent). Used once by the Lifecycle Controller.
    pub async fn load_from_catalog(&self) -> Result<(), EngineError> {
        let devices = self.catalog.load()?;
        for device in devices {
            self.materialize(&device).await?;
            self.devices.lock().unwrap().insert(device.id.clone(), device);
        }
        Ok(())
    }

    pub fn list_devices(&self) -> Vec<Device> {
        self.devices.lock().unwrap().values().cloned().collect()
    }

    /// spec.md §4.7 "Add device".
    pub async fn add_device(&self, mut device: Device) -> Result<Device, EngineError> {
        if device.id.trim().is_empty() {
            device.id = Uuid::new_v4().to_string();
        }
        device.validate_standalone(self.port_lo, self.port_hi)?;

        {
            let devices = self.devices.lock().unwrap();
            if devices.contains_key(&device.id) {
                return Err(EngineError::validation(format!("device id '{}' already exists", device.id)));
            }
            if device.kind == DeviceKind::TcpModem {
                let port = device.port.unwrap();
                let clash = devices.values().any(|d| {
                    d.kind == DeviceKind::TcpModem && d.port == Some(port) && d.device_id == device.device_id
                });
                if clash {
                    return Err(EngineError::validation(format!(
                        "modem (port={}, unit={}) already registered",
                        port, device.device_id
                    )));
                }
            }
        }

        let snapshot = self.snapshot_devices_with(&device);
        if let Err(e) = self.catalog.save(&snapshot) {
            return Err(e);
        }

        if let Err(e) = self.materialize(&device).await {
            // roll back the persisted catalog.
            let _ = self.catalog.save(&self.list_devices());
            return Err(e);
        }

        self.devices.lock().unwrap().insert(device.id.clone(), device.clone());
        tlog!("[Admin] added device '{}' ({})", device.name, device.id);
        Ok(device)
    }

    /// spec.md §4.7 "Remove device".
    pub async fn remove_device(&self, device_id: &str) -> Result<(), EngineError> {
        let device = self
            .devices
            .lock()
            .unwrap()
            .get(device_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("unknown device '{}'", device_id)))?;

        if let Some(handle) = self.pollers.lock().unwrap().remove(device_id) {
            handle.stop().await;
        }
        self.pool.remove_device(device_id);
        self.bridge.remove_device(device_id);
        if device.kind == DeviceKind::TcpModem {
            self.modem.remove_route(device.port.unwrap(), device.device_id);
        }
        self.store.uninstall(device_id);

        self.devices.lock().unwrap().remove(device_id);
        self.catalog.save(&self.list_devices())?;

        tlog!("[Admin] removed device '{}'", device_id);
        Ok(())
    }

    /// spec.md §4.7 "Write tag" — the shared write path also used by the
    /// OPC UA variable setter (spec.md §4.6): Modbus write, then Tag Store
    /// update, then address-space republish.
    pub async fn write_tag(&self, device_id: &str, tag_name: &str, raw_value: &str) -> Result<(), EngineError> {
        let device = self
            .devices
            .lock()
            .unwrap()
            .get(device_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("unknown device '{}'", device_id)))?;

        if device.kind == DeviceKind::TcpModem {
            return Err(EngineError::not_writable("modem devices have no reverse write path"));
        }

        let tag = device
            .tags
            .iter()
            .find(|t| t.name == tag_name)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("unknown tag '{}.{}'", device_id, tag_name)))?;

        if !tag.is_writable() {
            return Err(EngineError::not_writable(format!("tag '{}' is not writable", tag_name)));
        }

        let value = Value::parse(raw_value, tag.data_type)?;

        self.pool.write_tag(device_id, &tag, value).await?;
        self.store.set_from_wire(device_id, tag_name, value)?;
        self.bridge.republish(device_id, tag_name, value);
        Ok(())
    }

    /// Lifecycle Controller shutdown: cancel every poller cleanly (spec.md §5).
    pub async fn shutdown(&self) {
        let handles: Vec<PollerHandle> = self.pollers.lock().unwrap().drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.stop().await;
        }
    }

    pub fn connections(&self) -> Vec<super::modem::ModemConnection> {
        self.modem.connections()
    }

    pub fn values(&self) -> HashMap<String, super::tag_store::DeviceSnapshot> {
        self.store.snapshot()
    }

    /// Install, register and (for non-modem devices) start polling a device
    /// that has already passed validation and been persisted.
    async fn materialize(&self, device: &Device) -> Result<(), EngineError> {
        self.store.install(device);

        if let Err(e) = self.bridge.add_device(device) {
            self.store.uninstall(&device.id);
            return Err(e);
        }

        match device.kind {
            DeviceKind::TcpModem => {
                self.modem.add_route(device.port.unwrap(), device.device_id, device.id.clone());
            }
            DeviceKind::Tcp | DeviceKind::Rtu => {
                if let Err(e) = self.pool.add_device(device) {
                    self.bridge.remove_device(&device.id);
                    self.store.uninstall(&device.id);
                    return Err(e);
                }
                let handle = poller::spawn(
                    device.id.clone(),
                    device.tags.clone(),
                    Duration::from_millis(device.poll_interval),
                    self.pool.clone(),
                    self.store.clone(),
                    self.bridge.clone(),
                );
                self.pollers.lock().unwrap().insert(device.id.clone(), handle);
            }
        }
        Ok(())
    }

    fn snapshot_devices_with(&self, extra: &Device) -> Vec<Device> {
        let mut devices = self.list_devices();
        devices.push(extra.clone());
        devices
    }
}
