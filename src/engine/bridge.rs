// src/engine/bridge.rs
//
// Address-Space Bridge (spec.md §4.6): registers each device's tags as OPC
// UA variables whose getters read the Tag Store and whose setters call
// through the Modbus Client Pool before updating the Tag Store. Also owns
// construction of the OPC UA server itself (spec.md §1/§6: the bridge
// "simultaneously serves" a real OPC UA address space, not an in-memory
// one nobody binds).
//
// The teacher has no OPC UA surface of its own; `other_examples/manifests`
// shows `async-opcua` used client-side only. This module is grounded on
// that manifest's choice of OPC UA crate family, generalised to the
// server-side `opcua` crate (the same project, server feature) since this
// component serves an address space rather than consuming one. The
// callback-capture shape (closures holding `Arc`/`Weak` handles into the
// Tag Store / Client Pool / bridge itself, looked up by id rather than by
// direct reference) follows spec.md §9's design note and the teacher's
// general preference for `Arc<Mutex<_>>`-shared state over raw pointers
// (see io/modbus_tcp/reader.rs).

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use opcua::server::address_space::{AccessLevel, AddressSpace, AttrFnSetter, UserAccessLevel, VariableBuilder};
use opcua::server::builder::ServerBuilder;
use opcua::server::config::ServerEndpoint;
use opcua::server::Server;
use opcua::types::{DataTypeId, NodeId, Variant};

use crate::tlog;

use super::client_pool::ClientPool;
use super::error::EngineError;
use super::model::{DataType, Device, Tag, Value};
use super::tag_store::TagStore;

fn node_id_for(device_id: &str, tag_name: &str) -> String {
    format!("{}_{}", device_id, tag_name)
}

/// Build and configure (but do not run) the OPC UA server bound to
/// `port`, with a single anonymous, no-security endpoint (spec.md §6 "an
/// anonymous endpoint with no security"). The caller is expected to
/// preflight-bind `port` itself before calling `run()` on the result, so a
/// port already in use surfaces as a fatal startup error (spec.md §7)
/// rather than a panic deep inside the server's own accept loop.
pub fn build_server(port: u16) -> Result<Server, EngineError> {
    let endpoint_url = format!("opc.tcp://0.0.0.0:{}/modgate", port);

    let mut endpoints = BTreeMap::new();
    endpoints.insert(
        "none".to_string(),
        ServerEndpoint::new_none(endpoint_url.clone(), &["ANONYMOUS".to_string()]),
    );

    ServerBuilder::new()
        .application_name("modgate")
        .application_uri("urn:modgate:bridge")
        .product_uri("urn:modgate:bridge")
        .create_sample_keypair(true)
        .discovery_urls(vec![endpoint_url])
        .host_and_port("0.0.0.0", port)
        .endpoints(endpoints)
        .server()
        .ok_or_else(|| EngineError::connect_failed("opcua", format!("failed to configure endpoint on port {}", port)))
}

fn opcua_data_type(dt: DataType) -> DataTypeId {
    match dt {
        DataType::Float => DataTypeId::Float,
        DataType::Int32 => DataTypeId::Int32,
        DataType::Uint32 => DataTypeId::UInt32,
        DataType::Int16 => DataTypeId::Int16,
        DataType::Uint16 => DataTypeId::UInt16,
        DataType::Boolean => DataTypeId::Boolean,
    }
}

fn value_to_variant(value: Value) -> Variant {
    match value {
        Value::Float(v) => Variant::Float(v),
        Value::Int32(v) => Variant::Int32(v),
        Value::Uint32(v) => Variant::UInt32(v),
        Value::Int16(v) => Variant::Int16(v),
        Value::Uint16(v) => Variant::UInt16(v),
        Value::Boolean(v) => Variant::Boolean(v),
    }
}

/// Inverse of [`value_to_variant`], used by the variable write callback.
/// Returns `None` if the client sent a variant that doesn't match the
/// tag's declared data type.
fn variant_to_value(variant: &Variant, dt: DataType) -> Option<Value> {
    match (variant, dt) {
        (Variant::Float(v), DataType::Float) => Some(Value::Float(*v)),
        (Variant::Int32(v), DataType::Int32) => Some(Value::Int32(*v)),
        (Variant::UInt32(v), DataType::Uint32) => Some(Value::Uint32(*v)),
        (Variant::Int16(v), DataType::Int16) => Some(Value::Int16(*v)),
        (Variant::UInt16(v), DataType::Uint16) => Some(Value::Uint16(*v)),
        (Variant::Boolean(v), DataType::Boolean) => Some(Value::Boolean(*v)),
        _ => None,
    }
}

/// What the engine needs from an OPC UA surface: create/destroy a device's
/// variables and republish a value after it changes. Write handling itself
/// lives in the write path (admin / OPC UA setter callback), not here —
/// this trait only covers the parts the Lifecycle Controller drives
/// directly, so it can be swapped for a dependency-free double in tests.
pub trait AddressSpaceFacade: Send + Sync {
    /// spec.md §4.7 add device: create the folder + one variable per tag.
    fn add_device(&self, device: &Device) -> Result<(), EngineError>;
    /// spec.md §4.7 remove device: dispose the folder and its variables.
    fn remove_device(&self, device_id: &str);
    /// Republish a tag's value on its variable (spec.md §4.6, last paragraph).
    fn republish(&self, device_id: &str, tag_name: &str, value: Value);
}

/// OPC UA server-backed implementation. Getters/setters are registered as
/// closures over `Arc` handles to the Tag Store and Client Pool, resolved
/// by `(device_id, tag_name)` on every call rather than captured by value,
/// so a tag's lifetime is independent of the variable object holding it
/// (spec.md §9).
pub struct OpcUaBridge {
    address_space: Arc<std::sync::RwLock<AddressSpace>>,
    namespace: u16,
    store: Arc<TagStore>,
    pool: Arc<ClientPool>,
    /// node ids created per device, so remove_device can dispose them all.
    device_nodes: StdMutex<HashMap<String, Vec<NodeId>>>,
    /// Handle to itself, given to variable write callbacks so they can call
    /// back into `write_and_republish` without creating a reference cycle
    /// (the address space, not the bridge, owns those callbacks' lifetime).
    self_ref: Weak<OpcUaBridge>,
}

impl OpcUaBridge {
    /// Constructs the bridge behind an `Arc` (via `Arc::new_cyclic`) since
    /// its own variable write callbacks need a handle back to `self` to
    /// drive the Client Pool / Tag Store / republish sequence (spec.md
    /// §4.6's variable setters).
    pub fn new(
        address_space: Arc<std::sync::RwLock<AddressSpace>>,
        namespace: u16,
        store: Arc<TagStore>,
        pool: Arc<ClientPool>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            address_space,
            namespace,
            store,
            pool,
            device_nodes: StdMutex::new(HashMap::new()),
            self_ref: weak.clone(),
        })
    }
}

impl AddressSpaceFacade for OpcUaBridge {
    fn add_device(&self, device: &Device) -> Result<(), EngineError> {
        let mut address_space = self
            .address_space
            .write()
            .map_err(|_| EngineError::protocol("address space lock poisoned"))?;

        let folder_id = address_space
            .add_folder(
                &NodeId::new(self.namespace, format!("ModbusDevices/{}", device.name)),
                &device.name,
                &device.name,
                &NodeId::objects_folder_id(),
            )
            .map_err(|_| EngineError::protocol(format!("failed to create folder for '{}'", device.name)))?;

        let mut created = Vec::with_capacity(device.tags.len());
        let mut variables = Vec::with_capacity(device.tags.len());
        for tag in &device.tags {
            let node_id = NodeId::new(self.namespace, node_id_for(&device.id, &tag.name));
            let access = if tag.is_writable() {
                AccessLevel::CURRENT_READ | AccessLevel::CURRENT_WRITE
            } else {
                AccessLevel::CURRENT_READ
            };
            let user_access = if tag.is_writable() {
                UserAccessLevel::CURRENT_READ | UserAccessLevel::CURRENT_WRITE
            } else {
                UserAccessLevel::CURRENT_READ
            };

            let variant = tag
                .current_value
                .map(value_to_variant)
                .unwrap_or_else(|| default_variant(tag.data_type));

            let mut builder = VariableBuilder::new(&node_id, &tag.name, &tag.name)
                .data_type(opcua_data_type(tag.data_type))
                .value(variant)
                .minimum_sampling_interval(device.poll_interval as f64)
                .access_level(access)
                .user_access_level(user_access);

            if tag.is_writable() {
                // spec.md §4.6 "Variable setters": an OPC UA client's Write
                // service call must go through the Client Pool and Tag Store
                // exactly like an HTTP write, not mutate the address space's
                // cached DataValue directly.
                let weak_bridge = self.self_ref.clone();
                let device_id = device.id.clone();
                let tag_name = tag.name.clone();
                let tag_for_write = tag.clone();
                builder = builder.value_setter(AttrFnSetter::new(move |_, _, value: Variant| {
                    if let Some(new_value) = variant_to_value(&value, tag_for_write.data_type) {
                        if let Some(bridge) = weak_bridge.upgrade() {
                            let device_id = device_id.clone();
                            let tag_name = tag_name.clone();
                            let tag_for_write = tag_for_write.clone();
                            tokio::spawn(async move {
                                if let Err(e) = bridge
                                    .write_and_republish(&device_id, &tag_name, new_value, &tag_for_write)
                                    .await
                                {
                                    tlog!("[Bridge] OPC UA write to {}.{} failed: {}", device_id, tag_name, e);
                                }
                            });
                        }
                    }
                    Ok(())
                }));
            }

            let variable = builder.build();
            variables.push(variable);
            created.push(node_id);
        }
        address_space.add_variables(variables, &folder_id);

        self.device_nodes
            .lock()
            .unwrap()
            .insert(device.id.clone(), created);

        tlog!("[Bridge] registered {} tags for device '{}'", device.tags.len(), device.name);
        Ok(())
    }

    fn remove_device(&self, device_id: &str) {
        let nodes = self.device_nodes.lock().unwrap().remove(device_id);
        if let Some(nodes) = nodes {
            if let Ok(mut address_space) = self.address_space.write() {
                for node_id in nodes {
                    address_space.delete(&node_id, true);
                }
            }
        }
    }

    fn republish(&self, device_id: &str, tag_name: &str, value: Value) {
        let node_id = NodeId::new(self.namespace, node_id_for(device_id, tag_name));
        if let Ok(mut address_space) = self.address_space.write() {
            let variant = value_to_variant(value);
            let now = opcua::types::DateTime::now();
            let _ = address_space.set_variable_value(node_id, variant, &now, &now);
        }
    }
}

impl OpcUaBridge {
    /// The OPC UA variable setter path (spec.md §4.6): write through the
    /// Client Pool, then update the Tag Store, then republish — the same
    /// sequence `engine::admin::write_tag` drives for HTTP writes, under
    /// the per-device mutex plus the Tag Store mutex (spec.md §5).
    pub async fn write_and_republish(
        &self,
        device_id: &str,
        tag_name: &str,
        value: Value,
        tag: &Tag,
    ) -> Result<(), EngineError> {
        self.pool.write_tag(device_id, tag, value).await?;
        self.store.set_from_wire(device_id, tag_name, value)?;
        AddressSpaceFacade::republish(self, device_id, tag_name, value);
        Ok(())
    }
}

fn default_variant(dt: DataType) -> Variant {
    match dt {
        DataType::Float => Variant::Float(0.0),
        DataType::Int32 => Variant::Int32(0),
        DataType::Uint32 => Variant::UInt32(0),
        DataType::Int16 => Variant::Int16(0),
        DataType::Uint16 => Variant::UInt16(0),
        DataType::Boolean => Variant::Boolean(false),
    }
}

/// Dependency-free test double standing in for the OPC UA surface: records
/// which devices/tags are installed and their last-republished value,
/// without requiring a running server. Used by `engine::mod` and
/// `engine::admin` tests so they don't pay for real OPC UA startup.
#[derive(Default)]
pub struct LocalAddressSpace {
    inner: StdMutex<HashMap<String, HashMap<String, Value>>>,
}

impl LocalAddressSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value_of(&self, device_id: &str, tag_name: &str) -> Option<Value> {
        self.inner.lock().unwrap().get(device_id)?.get(tag_name).copied()
    }

    pub fn has_device(&self, device_id: &str) -> bool {
        self.inner.lock().unwrap().contains_key(device_id)
    }
}

impl AddressSpaceFacade for LocalAddressSpace {
    fn add_device(&self, device: &Device) -> Result<(), EngineError> {
        let mut tags = HashMap::new();
        for tag in &device.tags {
            if let Some(v) = tag.current_value {
                tags.insert(tag.name.clone(), v);
            }
        }
        self.inner.lock().unwrap().insert(device.id.clone(), tags);
        Ok(())
    }

    fn remove_device(&self, device_id: &str) {
        self.inner.lock().unwrap().remove(device_id);
    }

    fn republish(&self, device_id: &str, tag_name: &str, value: Value) {
        self.inner
            .lock()
            .unwrap()
            .entry(device_id.to_string())
            .or_default()
            .insert(tag_name.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::model::{DeviceKind, RegisterType, Tag};

    fn device() -> Device {
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
            tags: vec![Tag {
                name: "t".to_string(),
                address: 100,
                register_type: RegisterType::Holding,
                data_type: DataType::Uint16,
                current_value: Some(Value::Uint16(65)),
            }],
        }
    }

    #[test]
    fn local_add_then_republish_then_remove() {
        let facade = LocalAddressSpace::new();
        let device = device();
        facade.add_device(&device).unwrap();
        assert_eq!(facade.value_of("d1", "t"), Some(Value::Uint16(65)));

        facade.republish("d1", "t", Value::Uint16(99));
        assert_eq!(facade.value_of("d1", "t"), Some(Value::Uint16(99)));

        facade.remove_device("d1");
        assert!(!facade.has_device("d1"));
    }
}
