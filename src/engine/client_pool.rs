// src/engine/client_pool.rs
//
// Modbus Client Pool (spec.md §4.3): one entry per non-modem device, each
// holding a lazily-opened transport guarded by its own async mutex so at
// most one Modbus transaction is ever in flight on a given device's wire.
//
// Grounded on the teacher's io/modbus_tcp/reader.rs, which dials with
// `tokio_modbus::client::tcp::connect_slave` and shares the resulting
// `client::Context` through an `Arc<Mutex<Context>>` across poll tasks.
// This module generalises that to also dial RTU transports (via
// `tokio-serial`, the same crate `EvanL1-igw`'s manifest and
// `voltage_modbus`'s Cargo.toml both reach for behind their `rtu`
// feature), and to support the write direction spec.md §4.3 requires.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_modbus::client::{self, rtu, tcp, Reader as _, Writer as _};
use tokio_modbus::slave::{Slave, SlaveContext};

use crate::tlog;

use super::codec;
use super::error::EngineError;
use super::model::{DataType, Device, DeviceKind, RegisterType, Tag, Value};

#[derive(Clone, Debug)]
pub enum Transport {
    Tcp { host: String, port: u16 },
    Rtu {
        path: String,
        baud: u32,
        data_bits: u8,
        stop_bits: u8,
        parity: String,
    },
}

impl Transport {
    fn from_device(device: &Device) -> Result<Self, EngineError> {
        match device.kind {
            DeviceKind::Tcp => {
                let host = device
                    .address
                    .clone()
                    .ok_or_else(|| EngineError::validation("tcp device missing address"))?;
                let port = device
                    .port
                    .ok_or_else(|| EngineError::validation("tcp device missing port"))?;
                Ok(Transport::Tcp { host, port })
            }
            DeviceKind::Rtu => {
                let serial = device
                    .serial
                    .clone()
                    .ok_or_else(|| EngineError::validation("rtu device missing serial params"))?;
                Ok(Transport::Rtu {
                    path: serial.path,
                    baud: serial.baud,
                    data_bits: serial.data_bits,
                    stop_bits: serial.stop_bits,
                    parity: serial.parity,
                })
            }
            DeviceKind::TcpModem => Err(EngineError::validation(
                "tcp-modem devices are not issued outbound Modbus requests",
            )),
        }
    }
}

struct Entry {
    device_id: String,
    transport: Transport,
    unit_id: u8,
    timeout: Duration,
    ctx: Mutex<Option<client::Context>>,
    connected: AtomicBool,
}

impl Entry {
    async fn dial(&self) -> Result<client::Context, EngineError> {
        let fut = async {
            match &self.transport {
                Transport::Tcp { host, port } => {
                    let addr: std::net::SocketAddr = format!("{}:{}", host, port)
                        .parse()
                        .map_err(|e| EngineError::connect_failed(&self.device_id, format!("invalid address: {}", e)))?;
                    tcp::connect_slave(addr, Slave(self.unit_id))
                        .await
                        .map_err(|e| EngineError::connect_failed(&self.device_id, e.to_string()))
                }
                Transport::Rtu {
                    path,
                    baud,
                    data_bits,
                    stop_bits,
                    parity,
                } => {
                    let builder = tokio_serial::new(path.clone(), *baud)
                        .data_bits(to_data_bits(*data_bits))
                        .stop_bits(to_stop_bits(*stop_bits))
                        .parity(to_parity(parity));
                    let port = tokio_serial::SerialStream::open(&builder)
                        .map_err(|e| EngineError::connect_failed(&self.device_id, e.to_string()))?;
                    Ok(rtu::attach_slave(port, Slave(self.unit_id)))
                }
            }
        };

        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::timeout(&self.device_id, "connect")),
        }
    }
}

fn to_data_bits(bits: u8) -> tokio_serial::DataBits {
    match bits {
        5 => tokio_serial::DataBits::Five,
        6 => tokio_serial::DataBits::Six,
        7 => tokio_serial::DataBits::Seven,
        _ => tokio_serial::DataBits::Eight,
    }
}

fn to_stop_bits(bits: u8) -> tokio_serial::StopBits {
    match bits {
        2 => tokio_serial::StopBits::Two,
        _ => tokio_serial::StopBits::One,
    }
}

fn to_parity(parity: &str) -> tokio_serial::Parity {
    match parity.to_lowercase().as_str() {
        "odd" => tokio_serial::Parity::Odd,
        "even" => tokio_serial::Parity::Even,
        _ => tokio_serial::Parity::None,
    }
}

/// One logical Modbus client per outbound (non-modem) device.
pub struct ClientPool {
    entries: StdMutex<HashMap<String, Arc<Entry>>>,
    default_timeout: Duration,
}

impl ClientPool {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            entries: StdMutex::new(HashMap::new()),
            default_timeout,
        }
    }

    /// Create a pool entry for a non-modem device. No connection is opened yet.
    pub fn add_device(&self, device: &Device) -> Result<(), EngineError> {
        let transport = Transport::from_device(device)?;
        let entry = Arc::new(Entry {
            device_id: device.id.clone(),
            transport,
            unit_id: device.device_id,
            timeout: self.default_timeout,
            ctx: Mutex::new(None),
            connected: AtomicBool::new(false),
        });
        self.entries.lock().unwrap().insert(device.id.clone(), entry);
        Ok(())
    }

    /// Close and remove a device's entry best-effort (spec.md §4.7 remove device).
    pub fn remove_device(&self, device_id: &str) {
        self.entries.lock().unwrap().remove(device_id);
        // The tokio_modbus Context (and its underlying socket/serial handle)
        // is dropped here, closing the transport best-effort.
    }

    pub fn is_connected(&self, device_id: &str) -> bool {
        self.entries
            .lock()
            .unwrap()
            .get(device_id)
            .map(|e| e.connected.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    fn entry(&self, device_id: &str) -> Result<Arc<Entry>, EngineError> {
        self.entries
            .lock()
            .unwrap()
            .get(device_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("no client pool entry for '{}'", device_id)))
    }

    /// spec.md §4.3 `ensureConnected`.
    pub async fn ensure_connected(&self, device_id: &str) -> Result<(), EngineError> {
        let entry = self.entry(device_id)?;
        let mut guard = entry.ctx.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        match entry.dial().await {
            Ok(ctx) => {
                *guard = Some(ctx);
                entry.connected.store(true, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                entry.connected.store(false, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// spec.md §4.3 `readRegion`, decoded into a typed [`Value`].
    pub async fn read_tag(&self, device_id: &str, tag: &Tag) -> Result<Value, EngineError> {
        let entry = self.entry(device_id)?;
        let mut guard = entry.ctx.lock().await;
        let ctx = guard
            .as_mut()
            .ok_or_else(|| EngineError::transport(device_id, "not connected"))?;

        let count = codec::register_count(tag.data_type);
        let fut = async {
            match tag.register_type {
                RegisterType::Holding => ctx
                    .read_holding_registers(tag.address, count)
                    .await
                    .map(|r| r.map_err(|exc| format!("exception: {}", exc))),
                RegisterType::Input => ctx
                    .read_input_registers(tag.address, count)
                    .await
                    .map(|r| r.map_err(|exc| format!("exception: {}", exc))),
                RegisterType::Coil => ctx
                    .read_coils(tag.address, 1)
                    .await
                    .map(|r| r.map(|bits| vec![if bits[0] { 1u16 } else { 0u16 }]).map_err(|exc| format!("exception: {}", exc))),
                RegisterType::Discrete => ctx
                    .read_discrete_inputs(tag.address, 1)
                    .await
                    .map(|r| r.map(|bits| vec![if bits[0] { 1u16 } else { 0u16 }]).map_err(|exc| format!("exception: {}", exc))),
            }
        };

        let result = match tokio::time::timeout(entry.timeout, fut).await {
            Ok(r) => r,
            Err(_) => {
                drop(guard);
                entry.connected.store(false, Ordering::Relaxed);
                *entry.ctx.lock().await = None;
                return Err(EngineError::timeout(device_id, "read"));
            }
        };

        match result {
            Ok(Ok(words)) => codec::decode(&words, tag.data_type),
            Ok(Err(reason)) | Err(reason) => {
                drop(guard);
                entry.connected.store(false, Ordering::Relaxed);
                *entry.ctx.lock().await = None;
                tlog!(
                    "[ClientPool:{}] read {}@{} failed: {}",
                    device_id, tag.name, tag.address, reason
                );
                Err(EngineError::transport(device_id, reason))
            }
        }
    }

    /// spec.md §4.3 `writeTag`.
    pub async fn write_tag(&self, device_id: &str, tag: &Tag, value: Value) -> Result<(), EngineError> {
        if !tag.is_writable() {
            return Err(EngineError::not_writable(format!(
                "tag '{}' ({:?}) is not writable",
                tag.name, tag.register_type
            )));
        }

        let entry = self.entry(device_id)?;
        let mut guard = entry.ctx.lock().await;
        let ctx = guard
            .as_mut()
            .ok_or_else(|| EngineError::transport(device_id, "not connected"))?;

        let fut = async {
            match (tag.register_type, tag.data_type) {
                (RegisterType::Coil, DataType::Boolean) => {
                    let b = matches!(value, Value::Boolean(true));
                    ctx.write_single_coil(tag.address, b)
                        .await
                        .map(|r| r.map_err(|exc| format!("exception: {}", exc)))
                }
                (RegisterType::Holding, dt) if dt.register_count() == 1 => {
                    let words = codec::encode(value, dt)?;
                    Ok(ctx
                        .write_single_register(tag.address, words[0])
                        .await
                        .map_err(|e| e.to_string())
                        .and_then(|inner| inner.map_err(|exc| format!("exception: {}", exc))))
                }
                (RegisterType::Holding, dt) => {
                    let words = codec::encode(value, dt)?;
                    Ok(ctx
                        .write_multiple_registers(tag.address, &words)
                        .await
                        .map_err(|e| e.to_string())
                        .and_then(|inner| inner.map_err(|exc| format!("exception: {}", exc))))
                }
                _ => {
                    return Err(EngineError::not_writable(format!(
                        "tag '{}' ({:?}/{:?}) is not writable",
                        tag.name, tag.register_type, tag.data_type
                    )))
                }
            }
        };

        let result: Result<Result<(), String>, EngineError> = match tokio::time::timeout(entry.timeout, fut).await {
            Ok(r) => r,
            Err(_) => {
                drop(guard);
                entry.connected.store(false, Ordering::Relaxed);
                *entry.ctx.lock().await = None;
                return Err(EngineError::timeout(device_id, "write"));
            }
        };

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => {
                drop(guard);
                entry.connected.store(false, Ordering::Relaxed);
                *entry.ctx.lock().await = None;
                tlog!("[ClientPool:{}] write {}@{} failed: {}", device_id, tag.name, tag.address, reason);
                Err(EngineError::transport(device_id, reason))
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::model::{DeviceKind, Tag};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn holding_tag(address: u16, dt: DataType) -> Tag {
        Tag {
            name: "t".to_string(),
            address,
            register_type: RegisterType::Holding,
            data_type: dt,
            current_value: None,
        }
    }

    /// A minimal single-shot Modbus/TCP server: reads one MBAP+PDU request,
    /// replies with a canned holding-register response.
    async fn serve_one_holding_read(listener: TcpListener, unit_id: u8, registers: &'static [u16]) {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut header = [0u8; 7];
        sock.read_exact(&mut header).await.unwrap();
        let tx = [header[0], header[1]];
        let mut pdu_rest = [0u8; 4]; // fc(1 consumed separately) start(2) qty(2) minus fc already part of this read size
        // header[6] is unit id, PDU starts after header: fc, start_hi, start_lo, qty_hi, qty_lo (5 bytes)
        let mut pdu = [0u8; 5];
        sock.read_exact(&mut pdu).await.unwrap();
        let _ = (pdu_rest, unit_id);
        let byte_count = (registers.len() * 2) as u8;
        let mut resp = Vec::new();
        resp.extend_from_slice(&tx);
        resp.extend_from_slice(&[0, 0]); // protocol id
        let len = 1 + 1 + 1 + byte_count as u16;
        resp.extend_from_slice(&len.to_be_bytes());
        resp.push(header[6]); // unit id
        resp.push(pdu[0]); // function code echoed
        resp.push(byte_count);
        for r in registers {
            resp.extend_from_slice(&r.to_be_bytes());
        }
        sock.write_all(&resp).await.unwrap();
    }

    #[tokio::test]
    async fn read_holding_register_over_real_tcp_socket() {
        // spec.md §8 scenario 1.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(serve_one_holding_read(listener, 1, &[0x0041]));

        let pool = ClientPool::new(Duration::from_secs(2));
        let device = Device {
            id: "d1".to_string(),
            name: "Meter".to_string(),
            kind: DeviceKind::Tcp,
            address: Some(addr.ip().to_string()),
            port: Some(addr.port()),
            serial: None,
            device_id: 1,
            poll_interval: 2000,
            connected: false,
            tags: vec![],
        };
        pool.add_device(&device).unwrap();
        pool.ensure_connected("d1").await.unwrap();

        let tag = holding_tag(100, DataType::Uint16);
        let value = pool.read_tag("d1", &tag).await.unwrap();
        assert_eq!(value, Value::Uint16(65));

        server.await.unwrap();
    }

    #[tokio::test]
    async fn write_to_input_register_is_not_writable() {
        let pool = ClientPool::new(Duration::from_millis(50));
        let device = Device {
            id: "d1".to_string(),
            name: "Meter".to_string(),
            kind: DeviceKind::Tcp,
            address: Some("127.0.0.1".to_string()),
            port: Some(1), // never connected in this test
            serial: None,
            device_id: 1,
            poll_interval: 2000,
            connected: false,
            tags: vec![],
        };
        pool.add_device(&device).unwrap();
        let tag = Tag {
            name: "t".to_string(),
            address: 0,
            register_type: RegisterType::Input,
            data_type: DataType::Uint16,
            current_value: None,
        };
        let err = pool.write_tag("d1", &tag, Value::Uint16(1)).await.unwrap_err();
        assert!(matches!(err, EngineError::NotWritable(_)));
    }

    #[tokio::test]
    async fn connect_failure_leaves_disconnected() {
        let pool = ClientPool::new(Duration::from_millis(100));
        let device = Device {
            id: "d1".to_string(),
            name: "Meter".to_string(),
            kind: DeviceKind::Tcp,
            address: Some("127.0.0.1".to_string()),
            port: Some(1), // nothing listens on port 1
            serial: None,
            device_id: 1,
            poll_interval: 2000,
            connected: false,
            tags: vec![],
        };
        pool.add_device(&device).unwrap();
        let err = pool.ensure_connected("d1").await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::ConnectFailed { .. } | EngineError::Timeout { .. }
        ));
        assert!(!pool.is_connected("d1"));
    }
}
