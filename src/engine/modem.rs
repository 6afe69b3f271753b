// src/engine/modem.rs
//
// Modem Listener Bank (spec.md §4.5): a contiguous range of TCP listeners
// that accept *incoming* connections from field devices and answer their
// Modbus/TCP read requests out of the Tag Store. Grounded on the
// teacher's io/gvret/tcp.rs accept loop (one task per listener, one task
// per connection, a shared registry updated on connect/disconnect) but
// inverted: there the teacher dials out, here the peer dials in and this
// side plays Modbus server rather than client.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::tlog;

use super::error::EngineError;
use super::model::DataType;
use super::tag_store::TagStore;

const FC_READ_HOLDING_REGISTERS: u8 = 0x03;

#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct ModemConnection {
    pub remote: String,
    pub listen_port: u16,
    pub connected: bool,
}

/// Routes `(listen-port, unit-id)` to the owning device id, and tracks live
/// inbound sessions for the admin `GET /api/connections` surface.
pub struct ModemBank {
    routes: StdMutex<HashMap<(u16, u8), String>>,
    connections: StdMutex<HashMap<String, ModemConnection>>,
    store: Arc<TagStore>,
}

impl ModemBank {
    pub fn new(store: Arc<TagStore>) -> Self {
        Self {
            routes: StdMutex::new(HashMap::new()),
            connections: StdMutex::new(HashMap::new()),
            store,
        }
    }

    pub fn add_route(&self, listen_port: u16, unit_id: u8, device_id: String) {
        self.routes.lock().unwrap().insert((listen_port, unit_id), device_id);
    }

    pub fn remove_route(&self, listen_port: u16, unit_id: u8) {
        self.routes.lock().unwrap().remove(&(listen_port, unit_id));
    }

    fn route_for(&self, listen_port: u16, unit_id: u8) -> Option<String> {
        self.routes.lock().unwrap().get(&(listen_port, unit_id)).cloned()
    }

    /// spec.md §4.5 "Observable admin surface".
    pub fn connections(&self) -> Vec<ModemConnection> {
        self.connections.lock().unwrap().values().cloned().collect()
    }

    fn registry_key(remote: &str, listen_port: u16) -> String {
        format!("{}:{}", remote, listen_port)
    }
}

/// Bind one listener per port in `[port_lo, port_hi]` and spawn its accept
/// loop. Returns the join handles so the lifecycle controller can await
/// them at shutdown; binding stops at the first failure.
pub async fn spawn_bank(
    port_lo: u16,
    port_hi: u16,
    bank: Arc<ModemBank>,
) -> Result<Vec<JoinHandle<()>>, EngineError> {
    let mut handles = Vec::new();
    for port in port_lo..=port_hi {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|e| EngineError::transport(format!("modem-listener:{}", port), e.to_string()))?;
        let bank = bank.clone();
        handles.push(tokio::spawn(async move {
            accept_loop(listener, port, bank).await;
        }));
    }
    tlog!("[ModemBank] listening on ports {}..={}", port_lo, port_hi);
    Ok(handles)
}

async fn accept_loop(listener: TcpListener, listen_port: u16, bank: Arc<ModemBank>) {
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                tlog!("[ModemBank:{}] accept error: {}", listen_port, e);
                continue;
            }
        };
        let bank = bank.clone();
        tokio::spawn(async move {
            handle_session(socket, peer.to_string(), listen_port, bank).await;
        });
    }
}

async fn handle_session(mut socket: TcpStream, remote: String, listen_port: u16, bank: Arc<ModemBank>) {
    let key = ModemBank::registry_key(&remote, listen_port);
    bank.connections.lock().unwrap().insert(
        key.clone(),
        ModemConnection {
            remote: remote.clone(),
            listen_port,
            connected: true,
        },
    );

    loop {
        match read_request(&mut socket).await {
            Ok(Some(req)) => {
                if let Some(response) = build_response(&bank, listen_port, &req) {
                    if socket.write_all(&response).await.is_err() {
                        break;
                    }
                }
                // Unroutable frames and unsupported function codes are dropped
                // silently; the session continues (spec.md §4.5 steps 2, 4).
            }
            Ok(None) => break, // peer closed
            Err(e) => {
                tlog!("[ModemBank:{}] session {} error: {}", listen_port, remote, e);
                break;
            }
        }
    }

    bank.connections.lock().unwrap().remove(&key);
}

struct Request {
    transaction_id: u16,
    unit_id: u8,
    function_code: u8,
    start_address: u16,
}

async fn read_request(socket: &mut TcpStream) -> std::io::Result<Option<Request>> {
    let mut header = [0u8; 7];
    if let Err(e) = socket.read_exact(&mut header).await {
        return match e.kind() {
            std::io::ErrorKind::UnexpectedEof => Ok(None),
            _ => Err(e),
        };
    }
    let transaction_id = u16::from_be_bytes([header[0], header[1]]);
    let length = u16::from_be_bytes([header[4], header[5]]);
    let unit_id = header[6];

    // length counts unitId + PDU bytes that follow; we already consumed unitId.
    let remaining = (length as usize).saturating_sub(1);
    let mut pdu = vec![0u8; remaining];
    socket.read_exact(&mut pdu).await?;

    if pdu.is_empty() {
        return Ok(Some(Request {
            transaction_id,
            unit_id,
            function_code: 0,
            start_address: 0,
        }));
    }

    let function_code = pdu[0];
    let start_address = if pdu.len() >= 3 {
        u16::from_be_bytes([pdu[1], pdu[2]])
    } else {
        0
    };

    Ok(Some(Request {
        transaction_id,
        unit_id,
        function_code,
        start_address,
    }))
}

fn build_response(bank: &ModemBank, listen_port: u16, req: &Request) -> Option<Vec<u8>> {
    if req.function_code != FC_READ_HOLDING_REGISTERS {
        return None;
    }

    let device_id = bank.route_for(listen_port, req.unit_id)?;
    let (_, slot) = bank.store.find_by_address(&device_id, req.start_address)?;
    let value = slot.current_value?;

    let payload: Vec<u8> = if slot.data_type == DataType::Float {
        (value.as_f64() as f32).to_be_bytes().to_vec()
    } else {
        (value.as_f64().round() as i64 as u16).to_be_bytes().to_vec()
    };
    let byte_count = payload.len() as u8;

    let mut resp = Vec::with_capacity(9 + payload.len());
    resp.extend_from_slice(&req.transaction_id.to_be_bytes());
    resp.extend_from_slice(&0u16.to_be_bytes()); // protocol id
    let length = 1 + 1 + 1 + byte_count as u16;
    resp.extend_from_slice(&length.to_be_bytes());
    resp.push(req.unit_id);
    resp.push(FC_READ_HOLDING_REGISTERS);
    resp.push(byte_count);
    resp.extend_from_slice(&payload);
    Some(resp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::model::{Device, DeviceKind, RegisterType, Tag, Value};
    use tokio::net::TcpStream as ClientStream;

    fn modem_device() -> Device {
        Device {
            id: "m1".to_string(),
            name: "Modem".to_string(),
            kind: DeviceKind::TcpModem,
            address: None,
            port: Some(8000),
            serial: None,
            device_id: 7,
            poll_interval: 2000,
            connected: false,
            tags: vec![Tag {
                name: "x".to_string(),
                address: 10,
                register_type: RegisterType::Holding,
                data_type: DataType::Uint16,
                current_value: Some(Value::Uint16(42)),
            }],
        }
    }

    #[tokio::test]
    async fn responds_to_fc03_from_scenario_five() {
        // spec.md §8 scenario 5.
        let store = Arc::new(TagStore::new());
        let device = modem_device();
        store.install(&device);
        let bank = Arc::new(ModemBank::new(store));
        bank.add_route(8000, 7, device.id.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let bank_clone = bank.clone();
        tokio::spawn(async move {
            accept_loop(listener, port, bank_clone).await;
        });
        // Route was registered against port 8000 in the device, but our test
        // listener is bound to an ephemeral port; re-route to match.
        bank.add_route(port, 7, device.id.clone());

        let mut client = ClientStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut frame = Vec::new();
        frame.extend_from_slice(&1u16.to_be_bytes()); // transaction id
        frame.extend_from_slice(&0u16.to_be_bytes()); // protocol id
        frame.extend_from_slice(&6u16.to_be_bytes()); // length
        frame.push(7); // unit id
        frame.push(0x03);
        frame.extend_from_slice(&10u16.to_be_bytes()); // start address
        frame.extend_from_slice(&1u16.to_be_bytes()); // quantity
        client.write_all(&frame).await.unwrap();

        let mut resp = [0u8; 11];
        client.read_exact(&mut resp).await.unwrap();
        assert_eq!(&resp[0..2], &1u16.to_be_bytes());
        assert_eq!(resp[6], 7);
        assert_eq!(resp[7], 0x03);
        assert_eq!(resp[8], 2);
        assert_eq!(&resp[9..11], &42u16.to_be_bytes());
    }

    #[tokio::test]
    async fn unroutable_frame_is_dropped_silently() {
        let store = Arc::new(TagStore::new());
        let bank = Arc::new(ModemBank::new(store));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            accept_loop(listener, port, bank).await;
        });

        let mut client = ClientStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut frame = Vec::new();
        frame.extend_from_slice(&1u16.to_be_bytes());
        frame.extend_from_slice(&0u16.to_be_bytes());
        frame.extend_from_slice(&6u16.to_be_bytes());
        frame.push(99); // unrouted unit id
        frame.push(0x03);
        frame.extend_from_slice(&10u16.to_be_bytes());
        frame.extend_from_slice(&1u16.to_be_bytes());
        client.write_all(&frame).await.unwrap();

        // No response should arrive; dropping the client confirms the
        // session did not wedge on the unroutable frame.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        drop(client);
    }
}
