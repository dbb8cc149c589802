// src/session.rs
//
// Command dispatcher (component H): the single writer of `DeviceSession`.
// Every operation that mutates connection state (connect, disconnect,
// send_frame, start_flash, cancel_flash, load_symbols, clear_symbols,
// clear_stats) goes through one `Mutex`-guarded `Inner`, serializing them
// the way `sessions.rs` serializes IO-session lifecycle commands against
// a single profile-tracking map: one writer, totally ordered, with the
// heavier long-running work (the flash job itself) handed off to a
// background thread so the dispatcher stays responsive to `cancel_flash`
// while a flash is in progress.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::adapter::{AdapterDriver, AdapterVariant};
use crate::aggregator::{Aggregator, IdStats};
use crate::bootloader::{BootloaderEngine, FlashJob, FlashState, ProgressEvent};
use crate::decoder::DecoderAdapter;
use crate::error::DispatchError;
use crate::fanout::{FanOut, SessionSubscriber};
use crate::frame::Frame;
use crate::pump::Pump;
use crate::symboldb::CanDbcDatabase;

/// Worst case a disconnect may have to wait for a running flash to notice
/// its cancellation: the erase phase's own timeout, plus slack.
const DISCONNECT_CANCEL_TIMEOUT: Duration = Duration::from_secs(20);
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Process-wide device connection state. Mutated only by `Dispatcher`.
#[derive(Clone, Debug, Default)]
pub struct DeviceSession {
    pub variant_name: Option<&'static str>,
    pub channel: String,
    pub baudrate: u32,
    pub connected_at: Option<f64>,
    pub flash_in_progress: bool,
}

struct Inner {
    session: DeviceSession,
    driver: Option<Arc<RwLock<AdapterVariant>>>,
    pump: Option<Pump>,
}

/// Serializes the operations that mutate `DeviceSession` against the
/// shared aggregator, decoder, and fan-out. `connect` takes an
/// already-constructed `AdapterVariant` (its channel/baudrate parsing is
/// the concern of each driver's own constructor); the dispatcher's job is
/// only to open it, bind a pump to it, and own the handoff.
pub struct Dispatcher {
    inner: Arc<Mutex<Inner>>,
    aggregator: Arc<Aggregator>,
    decoder: Arc<DecoderAdapter>,
    db: Arc<CanDbcDatabase>,
    fanout: Arc<FanOut>,
    bootloader: Arc<BootloaderEngine>,
    queue_depth: usize,
}

impl Dispatcher {
    pub fn new(queue_depth: usize) -> Self {
        let db = Arc::new(CanDbcDatabase::empty());
        let decoder = Arc::new(DecoderAdapter::new(db.clone()));
        Self {
            inner: Arc::new(Mutex::new(Inner {
                session: DeviceSession::default(),
                driver: None,
                pump: None,
            })),
            aggregator: Arc::new(Aggregator::new()),
            decoder,
            db,
            fanout: Arc::new(FanOut::new()),
            bootloader: Arc::new(BootloaderEngine::new()),
            queue_depth,
        }
    }

    pub fn status(&self) -> DeviceSession {
        self.inner.lock().unwrap().session.clone()
    }

    pub fn stats(&self) -> HashMap<(u32, bool), IdStats> {
        self.aggregator.snapshot()
    }

    pub fn flash_state(&self) -> FlashState {
        self.bootloader.state()
    }

    pub fn attach_subscriber(&self) -> Arc<SessionSubscriber> {
        let sub = SessionSubscriber::new(self.queue_depth);
        self.fanout.attach_session(sub.clone());
        sub
    }

    pub fn detach_subscriber(&self, sub: &Arc<SessionSubscriber>) {
        self.fanout.detach_session(sub);
    }

    /// Binds `variant` (already parameterized by its own constructor),
    /// opening it and starting its pump. Replaces any existing connection
    /// by disconnecting it first (connecting twice in a row without an
    /// explicit disconnect is treated as "reconnect", not an error).
    pub fn connect(
        &self,
        mut variant: AdapterVariant,
        channel: impl Into<String>,
        baudrate: u32,
    ) -> Result<(), DispatchError> {
        let already_connected = self.inner.lock().unwrap().driver.is_some();
        if already_connected {
            self.disconnect()?;
        }

        variant.open()?;
        let variant_name = variant.name();
        tlog!("[session] connected: {variant_name}");
        let driver = Arc::new(RwLock::new(variant));
        let pump = Pump::spawn(
            driver.clone(),
            self.aggregator.clone(),
            self.decoder.clone(),
            self.fanout.clone(),
        );

        let mut inner = self.inner.lock().unwrap();
        inner.driver = Some(driver);
        inner.pump = Some(pump);
        inner.session = DeviceSession {
            variant_name: Some(variant_name),
            channel: channel.into(),
            baudrate,
            connected_at: Some(now_secs()),
            flash_in_progress: false,
        };
        Ok(())
    }

    /// Cancels any flash in progress first, then closes the driver,
    /// stops its pump, and resets per-ID stats (their lifecycle is
    /// "reset on disconnect"). A no-op if nothing is connected.
    pub fn disconnect(&self) -> Result<(), DispatchError> {
        let flashing = self.inner.lock().unwrap().session.flash_in_progress;
        if flashing {
            tlog!("[session] disconnect requested mid-flash, cancelling first");
            self.bootloader.cancel();
            let deadline = Instant::now() + DISCONNECT_CANCEL_TIMEOUT;
            while self.inner.lock().unwrap().session.flash_in_progress {
                if Instant::now() >= deadline {
                    break;
                }
                thread::sleep(CANCEL_POLL_INTERVAL);
            }
        }

        let (driver, pump) = {
            let mut inner = self.inner.lock().unwrap();
            (inner.driver.take(), inner.pump.take())
        };

        if let Some(pump) = pump {
            pump.stop();
        }
        if let Some(driver) = driver {
            driver.write().unwrap().close()?;
        }

        self.aggregator.clear();
        self.inner.lock().unwrap().session = DeviceSession::default();
        tlog!("[session] disconnected");
        Ok(())
    }

    pub fn send_frame(&self, frame: &Frame) -> Result<(), DispatchError> {
        let inner = self.inner.lock().unwrap();
        if inner.session.flash_in_progress {
            return Err(DispatchError::FlashBusy);
        }
        match &inner.driver {
            Some(driver) => driver.read().unwrap().transmit(frame).map_err(DispatchError::from),
            None => Err(DispatchError::NotConnected),
        }
    }

    /// Starts `job` on a background thread and returns immediately;
    /// progress is streamed through `on_progress` as it runs. While a
    /// flash is in progress, `send_frame` is rejected with `FlashBusy`
    /// and a further `start_flash` is rejected the same way.
    pub fn start_flash(
        &self,
        job: FlashJob,
        mut on_progress: impl FnMut(ProgressEvent) + Send + 'static,
    ) -> Result<(), DispatchError> {
        let driver = {
            let mut inner = self.inner.lock().unwrap();
            if inner.session.flash_in_progress {
                return Err(DispatchError::FlashBusy);
            }
            let driver = inner.driver.clone().ok_or(DispatchError::NotConnected)?;
            inner.session.flash_in_progress = true;
            driver
        };

        self.fanout.attach_aggregator_subscriber(self.bootloader.clone());
        let bootloader = self.bootloader.clone();
        let fanout = self.fanout.clone();
        let inner = self.inner.clone();

        tlog!("[session] flash started: module {}", job.module_id);
        thread::spawn(move || {
            let transmit = {
                let driver = driver.clone();
                move |f: &Frame| driver.read().unwrap().transmit(f)
            };
            let result = bootloader.flash(transmit, job, &mut on_progress);
            fanout.detach_aggregator_subscriber();
            inner.lock().unwrap().session.flash_in_progress = false;
            match result {
                Ok(()) => tlog!("[session] flash completed"),
                Err(e) => tlog!("[session] flash failed: {e}"),
            }
        });

        Ok(())
    }

    /// Requests cancellation of a running flash. A no-op if none is
    /// running; honored asynchronously by the flash thread within one
    /// command round-trip (see `BootloaderEngine::cancel`).
    pub fn cancel_flash(&self) -> Result<(), DispatchError> {
        if self.inner.lock().unwrap().session.flash_in_progress {
            self.bootloader.cancel();
        }
        Ok(())
    }

    pub fn load_symbols(&self, dbc_text: &[u8]) -> Result<(), DispatchError> {
        self.db.load(dbc_text).map_err(DispatchError::InvalidSymbols)
    }

    pub fn clear_symbols(&self) {
        self.db.clear();
    }

    pub fn clear_stats(&self) {
        self.aggregator.clear();
    }
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::bluetooth_spp::{BluetoothSppDriver, IoLineTransport, LineTransport};
    use crate::bootloader::{
        reset_frame_id, CMD_ERASE_FLASH, CMD_SET_ADDRESS, RSP_ACK, RSP_READY, TARGET_TO_HOST_ID,
    };
    use serde_json::{json, Value};
    use std::sync::mpsc as std_mpsc;
    use tokio::io::{duplex, split, DuplexStream, ReadHalf, WriteHalf};

    type DuplexTransport = IoLineTransport<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

    fn bluetooth_variant() -> (AdapterVariant, DuplexTransport) {
        let (host_io, device_io) = duplex(8192);
        let (host_read, host_write) = split(host_io);
        let (device_read, device_write) = split(device_io);
        let driver = BluetoothSppDriver::new("AA:BB:CC:DD:EE:FF", 1)
            .unwrap()
            .with_transport(Box::new(IoLineTransport::new(host_read, host_write)));
        (
            AdapterVariant::BluetoothSpp(driver),
            IoLineTransport::new(device_read, device_write),
        )
    }

    #[test]
    fn send_frame_rejects_when_not_connected() {
        let dispatcher = Dispatcher::new(64);
        match dispatcher.send_frame(&Frame::new(0x1, false, false, vec![], 0.0)) {
            Err(DispatchError::NotConnected) => {}
            other => panic!("expected NotConnected, got {other:?}"),
        }
    }

    #[test]
    fn start_flash_rejects_when_not_connected() {
        let dispatcher = Dispatcher::new(64);
        match dispatcher.start_flash(FlashJob::new(0, vec![0xAA; 4]), |_| {}) {
            Err(DispatchError::NotConnected) => {}
            other => panic!("expected NotConnected, got {other:?}"),
        }
    }

    #[test]
    fn connect_then_disconnect_resets_session_state() {
        let dispatcher = Dispatcher::new(64);
        let (variant, mut device) = bluetooth_variant();

        let rt = tokio::runtime::Runtime::new().unwrap();
        let device_thread = thread::spawn(move || {
            rt.block_on(async {
                // Best-effort drain; nothing is sent in this test, so this
                // simply exits once the dispatcher disconnects and drops
                // its end of the duplex pipe.
                let _ = device.read_line().await;
            });
        });

        dispatcher.connect(variant, "AA:BB:CC:DD:EE:FF:1", 0).unwrap();
        let status = dispatcher.status();
        assert_eq!(status.variant_name, Some("bluetooth_spp"));
        assert!(status.connected_at.is_some());
        assert!(!status.flash_in_progress);

        dispatcher.disconnect().unwrap();
        let status = dispatcher.status();
        assert_eq!(status.variant_name, None);
        assert!(!status.flash_in_progress);

        let _ = device_thread.join();
    }

    /// Full round trip: connect over an injected bluetooth transport,
    /// start a flash job, confirm `send_frame` is rejected with
    /// `FlashBusy` while it runs, then cancel it and confirm the
    /// dispatcher becomes idle again promptly rather than waiting out the
    /// 15s `SET_ADDRESS` timeout.
    #[test]
    fn flash_busy_rejects_send_frame_until_cancelled() {
        let dispatcher = Dispatcher::new(64);
        let (variant, mut device) = bluetooth_variant();
        dispatcher.connect(variant, "AA:BB:CC:DD:EE:FF:1", 0).unwrap();

        let (cancel_ready_tx, cancel_ready_rx) = std_mpsc::channel::<()>();
        let rt = tokio::runtime::Runtime::new().unwrap();
        let device_thread = thread::spawn(move || {
            rt.block_on(async {
                loop {
                    let line = match device.read_line().await {
                        Ok(Some(l)) => l,
                        _ => return,
                    };
                    let Ok(req): Result<Value, _> = serde_json::from_str(&line) else { continue };
                    if req["cmd"] != "send_message" {
                        let _ = device.write_line(&json!({"success": true}).to_string()).await;
                        continue;
                    }
                    let _ = device.write_line(&json!({"success": true}).to_string()).await;

                    let params = &req["params"];
                    let id = params["id"].as_u64().unwrap() as u32;
                    let data: Vec<u8> = params["data"]
                        .as_array()
                        .unwrap()
                        .iter()
                        .map(|b| b.as_u64().unwrap() as u8)
                        .collect();

                    if id == reset_frame_id(0) {
                        push_event(&mut device, &[RSP_READY, 0x02]).await;
                    } else if data.first() == Some(&CMD_ERASE_FLASH) {
                        push_event(&mut device, &[RSP_ACK]).await;
                    } else if data.first() == Some(&CMD_SET_ADDRESS) {
                        // No response: the engine should now be stuck in
                        // wait_for_response until cancelled.
                        let _ = cancel_ready_tx.send(());
                    }
                }
            });
        });

        dispatcher
            .start_flash(FlashJob::new(0, vec![0xDE, 0xAD, 0xBE, 0xEF]), |_| {})
            .unwrap();

        cancel_ready_rx.recv_timeout(Duration::from_secs(2)).unwrap();

        match dispatcher.send_frame(&Frame::new(0x1, false, false, vec![], 0.0)) {
            Err(DispatchError::FlashBusy) => {}
            other => panic!("expected FlashBusy, got {other:?}"),
        }

        let started = Instant::now();
        dispatcher.cancel_flash().unwrap();
        while dispatcher.status().flash_in_progress {
            assert!(started.elapsed() < Duration::from_secs(2), "cancel did not clear flash_in_progress promptly");
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(dispatcher.flash_state(), FlashState::Failed);

        dispatcher.disconnect().unwrap();
        let _ = device_thread.join();
    }

    async fn push_event(device: &mut DuplexTransport, data: &[u8]) {
        let _ = device
            .write_line(
                &json!({
                    "event": "messages",
                    "messages": [{"id": TARGET_TO_HOST_ID, "data": data, "is_extended": true}],
                })
                .to_string(),
            )
            .await;
    }
}
