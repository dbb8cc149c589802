// src/error.rs
//
// Error taxonomy shared across the adapter layer, the bootloader engine,
// and the command dispatcher. Grounded on gs_usb_rs's `error.rs`: one
// `thiserror`-derived enum per subsystem, with `#[from]` conversions into
// the crate-wide `BridgeError`.

use thiserror::Error;

/// Errors raised by an adapter driver, uniform across variants.
#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("required backend library is missing: {0}")]
    BackendMissing(String),
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device is busy: {0}")]
    DeviceBusy(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("device index {index} out of range ({found} device(s) found)")]
    IndexOutOfRange { index: usize, found: usize },
    #[error("transmit failed: {0}")]
    TransmitFailed(String),
    #[error("operation timed out")]
    Timeout,
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
}

/// Errors raised by the bootloader flashing engine.
#[derive(Error, Debug)]
pub enum BootloaderError {
    #[error("no READY heartbeat received after reset")]
    NoReady,
    #[error("erase rejected by target: error code 0x{0:02X}")]
    EraseFailed(u8),
    #[error("command rejected (NACK): code=0x{code:02X} offset=0x{offset:X}")]
    Nack { code: u8, offset: u32 },
    #[error("fewer ACKs arrived than commands sent within the ack window at offset 0x{0:X}")]
    AckMismatch(u32),
    #[error("verify mismatch at offset 0x{offset:X}: expected {expected}, actual {actual}")]
    VerifyMismatch {
        offset: u32,
        expected: String,
        actual: String,
    },
    #[error("firmware image is empty")]
    InvalidLength,
    #[error("firmware image exceeds the application region before truncation")]
    ImageTooLarge,
    #[error("too many heartbeats with no ACK within the bounded wait")]
    HeartbeatStorm,
    #[error("timed out waiting for a response")]
    Timeout,
    #[error("unexpected response byte 0x{0:02X}")]
    UnexpectedResponse(u8),
    #[error("flash session was cancelled")]
    Cancelled,
    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

/// Errors raised by the command dispatcher.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("no adapter is connected")]
    NotConnected,
    #[error("a flash is already in progress")]
    FlashBusy,
    #[error("invalid symbol file: {0}")]
    InvalidSymbols(String),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Bootloader(#[from] BootloaderError),
}

/// Crate-wide error, the union of every subsystem's taxonomy.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Bootloader(#[from] BootloaderError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("decoding unavailable: {0}")]
    DecodeUnavailable(String),
    #[error("no schema for this message")]
    NoSchema,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
