// src/adapter/pcan.rs
//
// PCAN (vendor USB) driver. Grounded on win-can-utils'
// `drivers/pcan.rs` (channel-name parsing, bitrate-to-constant mapping,
// `CanDriver` trait shape), but loaded dynamically via `libloading`
// instead of linking `peak-can-sys` at build time — the PCAN-Basic
// shared library is a runtime dependency on the host machine, not
// something this crate can vendor or require at compile time. This also
// doubles as the `BackendConfig` install-once contract, shared with
// USB-gs.

use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use libloading::{Library, Symbol};

use super::{backend_install, AdapterDriver, BackendConfig, Capabilities};
use crate::error::AdapterError;
use crate::frame::Frame;

/// PCAN-Basic's `TPCANMsg` layout (documented C ABI: 4-byte ID, 1-byte
/// type, 1-byte length, 8 data bytes, with trailing padding).
#[repr(C)]
#[derive(Clone, Copy)]
struct TPCanMsg {
    id: u32,
    msg_type: u8,
    len: u8,
    data: [u8; 8],
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct TPCanTimestamp {
    millis: u32,
    millis_overflow: u16,
    micros: u16,
}

const PCAN_MESSAGE_STANDARD: u8 = 0x00;
const PCAN_MESSAGE_EXTENDED: u8 = 0x02;
const PCAN_MESSAGE_RTR: u8 = 0x01;

const PCAN_ERROR_OK: u32 = 0x0000;
const PCAN_ERROR_QRCVEMPTY: u32 = 0x0020;
const PCAN_ERROR_XMTFULL: u32 = 0x0001;
const PCAN_ERROR_ILLHW: u32 = 0x1400;
const PCAN_ERROR_INITIALIZE: u32 = 0x0002;

type CanInitializeFn =
    unsafe extern "C" fn(channel: u16, btr0btr1: u16, hw_type: u8, io_port: u32, interrupt: u16) -> u32;
type CanUninitializeFn = unsafe extern "C" fn(channel: u16) -> u32;
type CanWriteFn = unsafe extern "C" fn(channel: u16, msg: *mut TPCanMsg) -> u32;
type CanReadFn =
    unsafe extern "C" fn(channel: u16, msg: *mut TPCanMsg, timestamp: *mut TPCanTimestamp) -> u32;

/// Channels are a member of an enumerated set (USB1..USB16).
pub fn parse_channel(s: &str) -> Option<u16> {
    let t = s.trim().to_ascii_uppercase();
    let t = t.strip_prefix("PCAN_").unwrap_or(&t);
    let n: usize = t.strip_prefix("USB")?.parse().ok()?;
    if (1..=16).contains(&n) {
        // PCAN-Basic's PCAN_USBBUS1 constant is 0x51; channels are contiguous from there.
        Some(0x51 + (n as u16 - 1))
    } else {
        None
    }
}

/// Baudrate is one of a finite preset list (documented PCAN-Basic BTR0BTR1 values).
pub fn map_baudrate(bps: u32) -> Option<u16> {
    Some(match bps {
        5_000 => 0x67FB,
        10_000 => 0x67F4,
        20_000 => 0x6713,
        50_000 => 0x4700,
        100_000 => 0x1C00,
        125_000 => 0x031C,
        250_000 => 0x011C,
        500_000 => 0x001C,
        800_000 => 0x0016,
        1_000_000 => 0x0014,
        _ => return None,
    })
}

fn can_error_to_adapter_error(code: u32, device: &str) -> AdapterError {
    if code & PCAN_ERROR_ILLHW != 0 {
        AdapterError::DeviceNotFound(device.to_string())
    } else if code & PCAN_ERROR_INITIALIZE != 0 {
        AdapterError::DeviceBusy(device.to_string())
    } else if code & PCAN_ERROR_XMTFULL != 0 {
        AdapterError::TransmitFailed(format!("{device}: transmit queue full"))
    } else {
        AdapterError::ProtocolViolation(format!("{device}: PCAN error 0x{code:04X}"))
    }
}

struct LoadedBackend {
    _lib: Library,
    initialize: Symbol<'static, CanInitializeFn>,
    uninitialize: Symbol<'static, CanUninitializeFn>,
    write: Symbol<'static, CanWriteFn>,
    read: Symbol<'static, CanReadFn>,
}

pub struct PcanDriver {
    channel_name: String,
    channel: u16,
    baudrate: u32,
    backend: BackendConfig,
    lib: Option<Arc<LoadedBackend>>,
    rx: Mutex<Option<std_mpsc::Receiver<Frame>>>,
    stop: Arc<std::sync::atomic::AtomicBool>,
    pending: Arc<std::sync::atomic::AtomicUsize>,
}

#[cfg(target_os = "windows")]
const DEFAULT_BACKEND_NAME: &str = "PCANBasic.dll";
#[cfg(target_os = "macos")]
const DEFAULT_BACKEND_NAME: &str = "libPCBUSB.dylib";
#[cfg(all(unix, not(target_os = "macos")))]
const DEFAULT_BACKEND_NAME: &str = "libpcanbasic.so";

impl PcanDriver {
    pub fn new(channel_name: &str, baudrate: u32, backend: BackendConfig) -> Result<Self, AdapterError> {
        let channel = parse_channel(channel_name)
            .ok_or_else(|| AdapterError::InvalidConfig(format!("unknown PCAN channel '{channel_name}'")))?;
        if map_baudrate(baudrate).is_none() {
            return Err(AdapterError::InvalidConfig(format!(
                "unsupported PCAN baudrate {baudrate}"
            )));
        }
        Ok(Self {
            channel_name: channel_name.to_string(),
            channel,
            baudrate,
            backend,
            lib: None,
            rx: Mutex::new(None),
            stop: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            pending: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
        })
    }

    fn load_backend(&self) -> Result<Arc<LoadedBackend>, AdapterError> {
        backend_install::ensure_installed(&self.backend, DEFAULT_BACKEND_NAME)?;
        let path = self
            .backend
            .backend_path
            .clone()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| DEFAULT_BACKEND_NAME.to_string());

        unsafe {
            let lib = Library::new(&path)
                .map_err(|e| AdapterError::BackendMissing(format!("{path}: {e}")))?;
            let initialize: Symbol<CanInitializeFn> = lib
                .get(b"CAN_Initialize")
                .map_err(|e| AdapterError::BackendMissing(format!("CAN_Initialize: {e}")))?;
            let uninitialize: Symbol<CanUninitializeFn> = lib
                .get(b"CAN_Uninitialize")
                .map_err(|e| AdapterError::BackendMissing(format!("CAN_Uninitialize: {e}")))?;
            let write: Symbol<CanWriteFn> = lib
                .get(b"CAN_Write")
                .map_err(|e| AdapterError::BackendMissing(format!("CAN_Write: {e}")))?;
            let read: Symbol<CanReadFn> = lib
                .get(b"CAN_Read")
                .map_err(|e| AdapterError::BackendMissing(format!("CAN_Read: {e}")))?;

            // SAFETY: the symbols borrow from `lib`, which we keep alive
            // for as long as the symbols do by bundling them together.
            let initialize: Symbol<'static, CanInitializeFn> = std::mem::transmute(initialize);
            let uninitialize: Symbol<'static, CanUninitializeFn> = std::mem::transmute(uninitialize);
            let write: Symbol<'static, CanWriteFn> = std::mem::transmute(write);
            let read: Symbol<'static, CanReadFn> = std::mem::transmute(read);

            Ok(Arc::new(LoadedBackend {
                _lib: lib,
                initialize,
                uninitialize,
                write,
                read,
            }))
        }
    }
}

impl AdapterDriver for PcanDriver {
    fn open(&mut self) -> Result<(), AdapterError> {
        let backend = self.load_backend()?;
        let btr = map_baudrate(self.baudrate).unwrap();
        let code = unsafe { (backend.initialize)(self.channel, btr, 0, 0, 0) };
        if code != PCAN_ERROR_OK {
            return Err(can_error_to_adapter_error(code, &self.channel_name));
        }

        let (tx, rx) = std_mpsc::channel();
        let stop = self.stop.clone();
        let read_backend = backend.clone();
        let channel = self.channel;

        // A receive thread polls the vendor library at <= 10ms granularity
        // and pushes into a bounded queue. std::sync::mpsc::channel
        // is unbounded; we cap it ourselves by dropping when the consumer
        // falls more than DEPTH frames behind, matching the rest of the
        // pipeline's bounded-queue discipline.
        const DEPTH: usize = 2048;
        self.pending.store(0, std::sync::atomic::Ordering::Relaxed);
        let pending_writer = self.pending.clone();
        std::thread::spawn(move || {
            let mut msg = TPCanMsg {
                id: 0,
                msg_type: 0,
                len: 0,
                data: [0; 8],
            };
            let mut ts = TPCanTimestamp::default();
            while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                let code = unsafe { (read_backend.read)(channel, &mut msg, &mut ts) };
                if code == PCAN_ERROR_OK {
                    let extended = msg.msg_type & PCAN_MESSAGE_EXTENDED != 0;
                    let remote = msg.msg_type & PCAN_MESSAGE_RTR != 0;
                    let data = msg.data[..msg.len as usize].to_vec();
                    let timestamp = ts.millis as f64 / 1000.0 + ts.micros as f64 / 1_000_000.0;
                    if pending_writer.load(std::sync::atomic::Ordering::Relaxed) < DEPTH
                        && tx.send(Frame::new(msg.id, extended, remote, data, timestamp)).is_ok()
                    {
                        pending_writer.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    }
                } else if code != PCAN_ERROR_QRCVEMPTY {
                    break;
                } else {
                    std::thread::sleep(Duration::from_millis(10));
                }
            }
        });

        self.lib = Some(backend);
        *self.rx.lock().unwrap() = Some(rx);
        Ok(())
    }

    fn close(&mut self) -> Result<(), AdapterError> {
        self.stop.store(true, std::sync::atomic::Ordering::Relaxed);
        if let Some(backend) = self.lib.take() {
            unsafe { (backend.uninitialize)(self.channel) };
        }
        *self.rx.lock().unwrap() = None;
        Ok(())
    }

    fn transmit(&self, frame: &Frame) -> Result<(), AdapterError> {
        let backend = self
            .lib
            .as_ref()
            .ok_or_else(|| AdapterError::InvalidConfig("PCAN channel not open".into()))?;
        let mut msg_type = PCAN_MESSAGE_STANDARD;
        if frame.extended() {
            msg_type |= PCAN_MESSAGE_EXTENDED;
        }
        if frame.remote() {
            msg_type |= PCAN_MESSAGE_RTR;
        }
        let mut data = [0u8; 8];
        data[..frame.data().len()].copy_from_slice(frame.data());
        let mut msg = TPCanMsg {
            id: frame.id(),
            msg_type,
            len: frame.dlc(),
            data,
        };
        let code = unsafe { (backend.write)(self.channel, &mut msg) };
        if code == PCAN_ERROR_OK {
            Ok(())
        } else {
            Err(can_error_to_adapter_error(code, &self.channel_name))
        }
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_extended: true,
            supports_remote: true,
            max_dlc: 8,
        }
    }

    fn poll(&self, timeout: Duration) -> Result<Option<Frame>, AdapterError> {
        let guard = self.rx.lock().unwrap();
        match guard.as_ref() {
            Some(rx) => {
                let frame = rx.recv_timeout(timeout).ok();
                if frame.is_some() {
                    self.pending.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
                }
                Ok(frame)
            }
            None => Err(AdapterError::InvalidConfig("PCAN channel not open".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_channel_accepts_usb1_through_usb16() {
        assert_eq!(parse_channel("USB1"), Some(0x51));
        assert_eq!(parse_channel("usb16"), Some(0x51 + 15));
        assert_eq!(parse_channel("PCAN_USB3"), Some(0x53));
        assert_eq!(parse_channel("USB17"), None);
        assert_eq!(parse_channel("LANBUS1"), None);
    }

    #[test]
    fn map_baudrate_is_a_finite_preset_list() {
        assert!(map_baudrate(500_000).is_some());
        assert!(map_baudrate(123_456).is_none());
    }

    #[test]
    fn open_without_a_resolvable_backend_reports_backend_missing() {
        let mut driver = PcanDriver::new(
            "USB1",
            500_000,
            BackendConfig {
                backend_path: Some("/nonexistent/libpcanbasic-test.so".into()),
            },
        )
        .unwrap();
        let err = driver.open().unwrap_err();
        assert!(matches!(err, AdapterError::BackendMissing(_)));
    }

    #[test]
    fn poll_decrements_pending_so_delivery_never_sticks() {
        let driver = PcanDriver::new("USB1", 500_000, BackendConfig::default()).unwrap();
        // Simulate the receive thread having already pushed past any
        // bounded-queue cap before this poll call.
        driver.pending.store(2048, std::sync::atomic::Ordering::Relaxed);
        let (tx, rx) = std_mpsc::channel();
        tx.send(Frame::new(0x100, false, false, vec![1, 2, 3], 0.0)).unwrap();
        *driver.rx.lock().unwrap() = Some(rx);

        let frame = driver.poll(Duration::from_millis(50)).unwrap();
        assert!(frame.is_some());
        assert_eq!(driver.pending.load(std::sync::atomic::Ordering::Relaxed), 2047);
    }

    #[test]
    fn rejects_unknown_channel_at_construction() {
        match PcanDriver::new("USB99", 500_000, BackendConfig::default()) {
            Err(AdapterError::InvalidConfig(_)) => {}
            Err(other) => panic!("expected InvalidConfig, got {other:?}"),
            Ok(_) => panic!("expected an error"),
        }
    }
}
