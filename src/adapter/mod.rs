// src/adapter/mod.rs
//
// Adapter abstraction layer (component B): a uniform contract over
// heterogeneous CAN adapters. A tagged union of driver variants behind a
// narrow capability interface, rather than duck-typed adapter objects.
//
// Every variant implements the pull primitive `poll`; each variant's
// `open` spins up whatever background thread/task is idiomatic for its
// transport (an OS thread polling a vendor DLL, a tokio task polling
// HTTP) and feeds a bounded internal queue so `poll` never blocks the
// transport's own I/O loop.

pub mod bluetooth_spp;
pub mod gs_usb;
pub mod network_relay;
pub mod pcan;

use std::time::Duration;

use crate::error::AdapterError;
use crate::frame::Frame;

/// What a concrete driver supports — queried once after `open`.
#[derive(Clone, Copy, Debug)]
pub struct Capabilities {
    pub supports_extended: bool,
    pub supports_remote: bool,
    pub max_dlc: u8,
}

/// The narrow capability interface every adapter variant implements.
pub trait AdapterDriver: Send {
    fn open(&mut self) -> Result<(), AdapterError>;
    fn close(&mut self) -> Result<(), AdapterError>;
    fn transmit(&self, frame: &Frame) -> Result<(), AdapterError>;
    fn capabilities(&self) -> Capabilities;
    /// Pull primitive: block up to `timeout` for the next received frame.
    fn poll(&self, timeout: Duration) -> Result<Option<Frame>, AdapterError>;
}

/// Tagged union over the required adapter variants. The command
/// dispatcher owns exactly one of these at a time.
pub enum AdapterVariant {
    Pcan(pcan::PcanDriver),
    UsbGs(gs_usb::UsbGsDriver),
    NetworkRelay(network_relay::NetworkRelayDriver),
    BluetoothSpp(bluetooth_spp::BluetoothSppDriver),
}

impl AdapterVariant {
    pub fn name(&self) -> &'static str {
        match self {
            AdapterVariant::Pcan(_) => "pcan",
            AdapterVariant::UsbGs(_) => "usb_gs",
            AdapterVariant::NetworkRelay(_) => "network_relay",
            AdapterVariant::BluetoothSpp(_) => "bluetooth_spp",
        }
    }
}

impl AdapterDriver for AdapterVariant {
    fn open(&mut self) -> Result<(), AdapterError> {
        match self {
            AdapterVariant::Pcan(d) => d.open(),
            AdapterVariant::UsbGs(d) => d.open(),
            AdapterVariant::NetworkRelay(d) => d.open(),
            AdapterVariant::BluetoothSpp(d) => d.open(),
        }
    }

    fn close(&mut self) -> Result<(), AdapterError> {
        match self {
            AdapterVariant::Pcan(d) => d.close(),
            AdapterVariant::UsbGs(d) => d.close(),
            AdapterVariant::NetworkRelay(d) => d.close(),
            AdapterVariant::BluetoothSpp(d) => d.close(),
        }
    }

    fn transmit(&self, frame: &Frame) -> Result<(), AdapterError> {
        match self {
            AdapterVariant::Pcan(d) => d.transmit(frame),
            AdapterVariant::UsbGs(d) => d.transmit(frame),
            AdapterVariant::NetworkRelay(d) => d.transmit(frame),
            AdapterVariant::BluetoothSpp(d) => d.transmit(frame),
        }
    }

    fn capabilities(&self) -> Capabilities {
        match self {
            AdapterVariant::Pcan(d) => d.capabilities(),
            AdapterVariant::UsbGs(d) => d.capabilities(),
            AdapterVariant::NetworkRelay(d) => d.capabilities(),
            AdapterVariant::BluetoothSpp(d) => d.capabilities(),
        }
    }

    fn poll(&self, timeout: Duration) -> Result<Option<Frame>, AdapterError> {
        match self {
            AdapterVariant::Pcan(d) => d.poll(timeout),
            AdapterVariant::UsbGs(d) => d.poll(timeout),
            AdapterVariant::NetworkRelay(d) => d.poll(timeout),
            AdapterVariant::BluetoothSpp(d) => d.poll(timeout),
        }
    }
}

impl AdapterVariant {
    /// The in-band decode the relay attached to the frame most recently
    /// returned by `poll`, if the variant supports one. Every other
    /// variant relies solely on this crate's own symbol database.
    pub fn take_decoded_hint(&self) -> Option<crate::symboldb::DecodeResult> {
        match self {
            AdapterVariant::NetworkRelay(d) => d.take_decoded_hint(),
            _ => None,
        }
    }
}

/// An explicit, process-global-install backend parameter: a native backend
/// library path threaded through driver construction instead of
/// monkey-patching a native library loader.
#[derive(Clone, Debug, Default)]
pub struct BackendConfig {
    /// Optional path to a non-default backend shared library. When
    /// `None`, the variant uses its platform default search path.
    pub backend_path: Option<std::path::PathBuf>,
}

/// Installs a backend shared library exactly once per process, verifying
/// it resolves before first use. Shared by the PCAN and USB-gs drivers,
/// both of which accept a `BackendConfig`.
pub(crate) mod backend_install {
    use super::BackendConfig;
    use crate::error::AdapterError;
    use once_cell::sync::OnceCell;
    use std::sync::Mutex;

    use std::collections::HashMap;

    /// Keyed by `default_name` so each backend family (PCAN, USB-gs, ...)
    /// gets its own independent install slot instead of sharing one.
    static INSTALLED: OnceCell<Mutex<HashMap<String, String>>> = OnceCell::new();

    /// Resolve and idempotently "install" the backend: the first caller
    /// attempts to load the library at `config.backend_path` (or the
    /// platform default); later callers for the same `default_name`
    /// observe the same cached result.
    pub fn ensure_installed(
        config: &BackendConfig,
        default_name: &str,
    ) -> Result<(), AdapterError> {
        let cell = INSTALLED.get_or_init(|| Mutex::new(HashMap::new()));
        let mut guard = cell.lock().unwrap();
        if guard.contains_key(default_name) {
            return Ok(());
        }

        let path = config
            .backend_path
            .clone()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| default_name.to_string());

        match unsafe { libloading::Library::new(&path) } {
            Ok(lib) => {
                // Leak the handle: the backend stays mapped for the life
                // of the process, matching "install it process-globally".
                std::mem::forget(lib);
                guard.insert(default_name.to_string(), path);
                Ok(())
            }
            Err(e) => Err(AdapterError::BackendMissing(format!("{path}: {e}"))),
        }
    }
}
