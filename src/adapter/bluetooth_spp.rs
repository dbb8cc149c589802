// src/adapter/bluetooth_spp.rs
//
// Bluetooth-SPP driver: classic RFCOMM, newline-delimited JSON request/
// response plus unsolicited event pushes. `channel` is a MAC address and a
// small RFCOMM channel number (default 1).
//
// The teacher's only Bluetooth code (`ble_common.rs`, `ble_provision.rs`,
// `smp_upgrade.rs`) speaks BLE GATT via `btleplug`, a different protocol
// family from classic RFCOMM SPP. Rather than force that crate onto a
// connection-oriented byte stream it was never meant for, the request/
// response correlation and event demuxing — the part that is actually
// specific to this protocol — is built against a generic `LineTransport`
// (anything that reads and writes newline-delimited text), grounded on the
// teacher's delimiter-framing idiom in `io/serial/framer.rs`. A concrete
// RFCOMM socket is left pluggable; this module is exercised in tests over
// `tokio::io::duplex`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use super::{AdapterDriver, Capabilities};
use crate::error::AdapterError;
use crate::frame::Frame;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

/// Anything that can exchange newline-delimited text lines. A real RFCOMM
/// socket and an in-memory duplex stream both satisfy this.
#[async_trait]
pub trait LineTransport: Send + Sync {
    async fn write_line(&mut self, line: &str) -> std::io::Result<()>;
    /// Returns `None` on a clean EOF.
    async fn read_line(&mut self) -> std::io::Result<Option<String>>;
}

/// Blanket impl over any split async-read/async-write pair, so
/// `tokio::io::duplex()` halves or a real RFCOMM socket both just work.
pub struct IoLineTransport<R, W> {
    reader: BufReader<R>,
    writer: W,
}

impl<R: tokio::io::AsyncRead, W> IoLineTransport<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }
}

#[async_trait]
impl<R, W> LineTransport for IoLineTransport<R, W>
where
    R: tokio::io::AsyncRead + Unpin + Send + Sync,
    W: tokio::io::AsyncWrite + Unpin + Send + Sync,
{
    async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await
    }

    async fn read_line(&mut self) -> std::io::Result<Option<String>> {
        let mut buf = String::new();
        let n = self.reader.read_line(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(buf.trim_end_matches(['\r', '\n']).to_string()))
    }
}

fn validate_mac(mac: &str) -> Result<(), AdapterError> {
    let parts: Vec<&str> = mac.split(':').collect();
    let ok = parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && u8::from_str_radix(p, 16).is_ok());
    if ok {
        Ok(())
    } else {
        Err(AdapterError::InvalidAddress(format!(
            "'{mac}' is not a MAC address (expected AA:BB:CC:DD:EE:FF)"
        )))
    }
}

enum PumpMsg {
    Request { line: String, reply: std_mpsc::Sender<Value> },
}

/// Parses a frame out of one element of an unsolicited `messages` event
/// array. Shares the relay's flexible id/data encoding by convention, but
/// this protocol always sends them as plain fields, so we keep it direct.
fn frame_from_message(v: &Value) -> Option<Frame> {
    let id = v.get("id")?.as_u64()? as u32;
    let data: Vec<u8> = v
        .get("data")?
        .as_array()?
        .iter()
        .map(|b| b.as_u64().map(|b| b as u8))
        .collect::<Option<Vec<u8>>>()?;
    let extended = v.get("is_extended").and_then(Value::as_bool).unwrap_or(false);
    Some(Frame::new(id, extended, false, data, 0.0))
}

async fn pump_loop(
    mut transport: Box<dyn LineTransport>,
    mut cmd_rx: tokio::sync::mpsc::UnboundedReceiver<PumpMsg>,
    frame_tx: std_mpsc::Sender<Frame>,
    stop: Arc<AtomicBool>,
) {
    let pending: Arc<Mutex<VecDeque<std_mpsc::Sender<Value>>>> = Arc::new(Mutex::new(VecDeque::new()));

    loop {
        if stop.load(Ordering::Relaxed) {
            return;
        }
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(PumpMsg::Request { line, reply }) => {
                        pending.lock().unwrap().push_back(reply);
                        if transport.write_line(&line).await.is_err() {
                            return;
                        }
                    }
                    None => return,
                }
            }
            line = transport.read_line() => {
                match line {
                    Ok(Some(text)) => {
                        let Ok(value) = serde_json::from_str::<Value>(&text) else { continue };
                        if value.get("event").is_some() {
                            // Events are demultiplexed before correlation:
                            // they never consume a pending request slot.
                            if value.get("event").and_then(Value::as_str) == Some("messages") {
                                if let Some(items) = value.get("messages").and_then(Value::as_array) {
                                    for item in items {
                                        if let Some(frame) = frame_from_message(item) {
                                            let _ = frame_tx.send(frame);
                                        }
                                    }
                                }
                            }
                        } else if let Some(reply) = pending.lock().unwrap().pop_front() {
                            let _ = reply.send(value);
                        }
                    }
                    Ok(None) | Err(_) => return,
                }
            }
        }
    }
}

pub struct BluetoothSppDriver {
    mac: String,
    rfcomm_channel: u8,
    transport: Option<Box<dyn LineTransport>>,
    cmd_tx: Mutex<Option<tokio::sync::mpsc::UnboundedSender<PumpMsg>>>,
    frame_rx: Mutex<Option<std_mpsc::Receiver<Frame>>>,
    stop: Arc<AtomicBool>,
}

impl BluetoothSppDriver {
    pub fn new(mac: &str, rfcomm_channel: u8) -> Result<Self, AdapterError> {
        validate_mac(mac)?;
        Ok(Self {
            mac: mac.to_string(),
            rfcomm_channel,
            transport: None,
            cmd_tx: Mutex::new(None),
            frame_rx: Mutex::new(None),
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Injects a concrete transport (a real RFCOMM socket, or a test
    /// double). Without this, `open` fails with `BackendMissing`: no
    /// platform RFCOMM backend ships with this crate.
    pub fn with_transport(mut self, transport: Box<dyn LineTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    fn request(&self, cmd: &str, params: Option<Value>) -> Result<Value, AdapterError> {
        let tx = self.cmd_tx.lock().unwrap();
        let tx = tx
            .as_ref()
            .ok_or_else(|| AdapterError::InvalidConfig("bluetooth-spp channel not open".into()))?;
        let mut obj = json!({"cmd": cmd});
        if let Some(params) = params {
            obj["params"] = params;
        }
        let (reply_tx, reply_rx) = std_mpsc::channel();
        tx.send(PumpMsg::Request {
            line: obj.to_string(),
            reply: reply_tx,
        })
        .map_err(|_| AdapterError::ConnectionLost("pump task ended".into()))?;

        let response = reply_rx
            .recv_timeout(REQUEST_TIMEOUT)
            .map_err(|_| AdapterError::Timeout)?;
        if response.get("success").and_then(Value::as_bool) == Some(true) {
            Ok(response)
        } else {
            let err = response
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unspecified error")
                .to_string();
            Err(AdapterError::ProtocolViolation(err))
        }
    }

    pub fn subscribe(&self) -> Result<(), AdapterError> {
        self.request("subscribe", None).map(|_| ())
    }

    pub fn unsubscribe(&self) -> Result<(), AdapterError> {
        self.request("unsubscribe", None).map(|_| ())
    }

    pub fn send_batch(&self, frames: &[Frame]) -> Result<(), AdapterError> {
        let items: Vec<Value> = frames
            .iter()
            .map(|f| json!({"id": f.id(), "data": f.data(), "is_extended": f.extended()}))
            .collect();
        self.request("send_batch", Some(json!({"messages": items}))).map(|_| ())
    }

    pub fn load_dbc(&self, filename: &str, content: &str) -> Result<(), AdapterError> {
        self.request("load_dbc", Some(json!({"filename": filename, "content": content})))
            .map(|_| ())
    }

    pub fn unload_dbc(&self) -> Result<(), AdapterError> {
        self.request("unload_dbc", None).map(|_| ())
    }

    pub fn get_status(&self) -> Result<Value, AdapterError> {
        self.request("get_status", None)
    }

    pub fn get_messages(&self, count: usize) -> Result<Value, AdapterError> {
        self.request("get_messages", Some(json!({"count": count})))
    }

    pub fn clear_messages(&self) -> Result<(), AdapterError> {
        self.request("clear_messages", None).map(|_| ())
    }
}

impl AdapterDriver for BluetoothSppDriver {
    fn open(&mut self) -> Result<(), AdapterError> {
        let transport = self.transport.take().ok_or_else(|| {
            AdapterError::BackendMissing(format!(
                "no classic-Bluetooth RFCOMM backend wired for {}:{}",
                self.mac, self.rfcomm_channel
            ))
        })?;

        let (cmd_tx, cmd_rx) = tokio::sync::mpsc::unbounded_channel();
        let (frame_tx, frame_rx) = std_mpsc::channel();
        let stop = self.stop.clone();

        std::thread::spawn(move || {
            let rt = tokio::runtime::Runtime::new().expect("tokio runtime");
            rt.block_on(pump_loop(transport, cmd_rx, frame_tx, stop));
        });

        *self.cmd_tx.lock().unwrap() = Some(cmd_tx);
        *self.frame_rx.lock().unwrap() = Some(frame_rx);
        Ok(())
    }

    fn close(&mut self) -> Result<(), AdapterError> {
        self.stop.store(true, Ordering::Relaxed);
        *self.cmd_tx.lock().unwrap() = None;
        *self.frame_rx.lock().unwrap() = None;
        Ok(())
    }

    fn transmit(&self, frame: &Frame) -> Result<(), AdapterError> {
        let params = json!({"id": frame.id(), "data": frame.data(), "is_extended": frame.extended()});
        self.request("send_message", Some(params)).map(|_| ())
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_extended: true,
            supports_remote: false,
            max_dlc: 8,
        }
    }

    fn poll(&self, timeout: Duration) -> Result<Option<Frame>, AdapterError> {
        let guard = self.frame_rx.lock().unwrap();
        match guard.as_ref() {
            Some(rx) => Ok(rx.recv_timeout(timeout).ok()),
            None => Err(AdapterError::InvalidConfig("bluetooth-spp channel not open".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn rejects_malformed_mac_address() {
        match BluetoothSppDriver::new("not-a-mac", 1) {
            Err(AdapterError::InvalidAddress(_)) => {}
            Err(other) => panic!("expected InvalidAddress, got {other:?}"),
            Ok(_) => panic!("expected an error"),
        }
    }

    #[test]
    fn open_without_injected_transport_reports_backend_missing() {
        let mut driver = BluetoothSppDriver::new("AA:BB:CC:DD:EE:FF", 1).unwrap();
        let err = driver.open().unwrap_err();
        assert!(matches!(err, AdapterError::BackendMissing(_)));
    }

    /// Drives the pump loop's FIFO correlation and event demuxing over an
    /// in-memory duplex pipe standing in for the RFCOMM socket, with a
    /// fake "device" on the other end played by this test.
    #[test]
    fn request_response_round_trip_and_event_demux() {
        let (host_io, device_io) = duplex(4096);
        let (host_read, host_write) = tokio::io::split(host_io);
        let (device_read, device_write) = tokio::io::split(device_io);

        let mut driver = BluetoothSppDriver::new("AA:BB:CC:DD:EE:FF", 1)
            .unwrap()
            .with_transport(Box::new(IoLineTransport::new(host_read, host_write)));
        driver.open().unwrap();
        let driver = Arc::new(driver);

        // The request is sent from its own thread since `get_status`
        // blocks until the fake device below writes a reply.
        let requester = {
            let driver = driver.clone();
            std::thread::spawn(move || driver.get_status())
        };

        let rt = tokio::runtime::Runtime::new().unwrap();
        let mut device = IoLineTransport::new(device_read, device_write);

        rt.block_on(async {
            // get_status request arrives at the fake device...
            let req: Value = serde_json::from_str(&device.read_line().await.unwrap().unwrap()).unwrap();
            assert_eq!(req["cmd"], "get_status");
            // ...an unsolicited event is pushed first...
            device
                .write_line(&json!({"event": "messages", "count": 1, "messages": [{"id": 0x123, "data": [1,2,3], "is_extended": false}]}).to_string())
                .await
                .unwrap();
            // ...then the actual correlated response.
            device
                .write_line(&json!({"success": true, "result": {"connected": true}}).to_string())
                .await
                .unwrap();
        });

        let status = requester.join().unwrap().unwrap();
        assert_eq!(status["result"]["connected"], true);

        let frame = driver.poll(Duration::from_secs(1)).unwrap().expect("event frame delivered");
        assert_eq!(frame.id(), 0x123);
        assert_eq!(frame.data(), &[1, 2, 3]);
    }
}
