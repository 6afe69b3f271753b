// src/engine/mod.rs
//
// Lifecycle Controller (spec.md §2 item 8): startup sequencing and
// shutdown draining for the device-integration engine. Owns the Tag
// Store, Client Pool, Modem Listener Bank and Address-Space Bridge, and
// wires them together through `AdminOps`, which is also what the HTTP
// layer drives for mutations.

pub mod admin;
pub mod bridge;
pub mod catalog;
pub mod client_pool;
pub mod codec;
pub mod error;
pub mod model;
pub mod modem;
pub mod poller;
pub mod tag_store;

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::tlog;

use admin::AdminOps;
use bridge::{AddressSpaceFacade, OpcUaBridge};
use catalog::{CatalogStore, JsonFileCatalog};
use client_pool::ClientPool;
use error::EngineError;
use modem::ModemBank;
use tag_store::TagStore;

/// OPC UA namespace index this bridge registers its nodes under.
const NAMESPACE: u16 = 2;

pub struct Engine {
    pub admin: Arc<AdminOps>,
    modem_listeners: Vec<JoinHandle<()>>,
    /// The OPC UA server's own accept/run loop, driven on a blocking
    /// thread since the `opcua` crate's `Server::run` is synchronous.
    opcua_server: JoinHandle<()>,
}

impl Engine {
    /// spec.md §2 control flow: "configuration is loaded into the Tag
    /// Store; each device is materialized into the Address-Space Bridge
    /// and either attached to a Poller and Client Pool entry, or
    /// registered as a routing target in the Listener Bank."
    pub async fn start(config: &EngineConfig) -> Result<Self, EngineError> {
        // spec.md §7: "No error is fatal to the process except a failure to
        // bind the OPC UA endpoint at startup" (besides the HTTP port,
        // bound by main.rs). `opcua::server::Server::run` binds the listen
        // socket itself on its own thread and has no way to report a bind
        // failure back to the caller, so preflight-bind the port here and
        // drop the listener immediately, leaving the real bind to the
        // server's run loop.
        let opcua_addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.opcua_port));
        std::net::TcpListener::bind(opcua_addr)
            .map_err(|e| EngineError::connect_failed("opcua", format!("failed to bind endpoint {}: {}", opcua_addr, e)))?;

        let opcua_server = bridge::build_server(config.opcua_port)?;
        let address_space = opcua_server.address_space();

        let store = Arc::new(TagStore::new());
        let pool = Arc::new(ClientPool::new(Duration::from_millis(config.request_timeout_ms)));
        let modem = Arc::new(ModemBank::new(store.clone()));
        let catalog: Arc<dyn CatalogStore> = Arc::new(JsonFileCatalog::new(&config.catalog_path));

        let bridge: Arc<OpcUaBridge> = OpcUaBridge::new(address_space, NAMESPACE, store.clone(), pool.clone());
        let facade: Arc<dyn AddressSpaceFacade> = bridge;

        let admin = Arc::new(AdminOps::new(
            store,
            pool,
            facade,
            catalog,
            modem.clone(),
            config.listen_port_lo,
            config.listen_port_hi,
        ));
        admin.load_from_catalog().await?;
        tlog!("[Engine] loaded {} device(s) from catalog", admin.list_devices().len());

        let modem_listeners = modem::spawn_bank(config.listen_port_lo, config.listen_port_hi, modem).await?;

        tlog!("[Engine] opc ua endpoint listening on :{}", config.opcua_port);
        let opcua_handle = tokio::task::spawn_blocking(move || {
            opcua_server.run();
        });

        Ok(Self {
            admin,
            modem_listeners,
            opcua_server: opcua_handle,
        })
    }

    /// Drain all pollers, stop accepting new modem connections, and stop
    /// driving the OPC UA server's run loop.
    pub async fn shutdown(self) {
        tlog!("[Engine] shutting down");
        self.admin.shutdown().await;
        for handle in self.modem_listeners {
            handle.abort();
        }
        self.opcua_server.abort();
    }
}
