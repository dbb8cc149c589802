// src/adapter/gs_usb.rs
//
// USB-gs driver for gs_usb/candleLight-firmware adapters (CANable, CANable
// Pro, Geschwister Schneider USB/CAN). Enumerates over `nusb`'s synchronous
// `.wait()` surface rather than the teacher's async/tokio reader task, since
// this driver only needs to satisfy the blocking `AdapterDriver::poll`
// contract. Wire layout and control-transfer sequence (HOST_FORMAT then
// BITTIMING then MODE) are carried over from the teacher's
// `io/gs_usb/codec.rs` and `io/gs_usb/nusb_driver.rs` verbatim.

use std::sync::Mutex;
use std::time::Duration;

use nusb::transfer::{Bulk, ControlOut, ControlType, In, Out, Recipient};
use nusb::{DeviceInfo, Endpoint, Interface, MaybeFuture};

use super::{backend_install, AdapterDriver, BackendConfig, Capabilities};
use crate::error::AdapterError;
use crate::frame::Frame;

const HOST_FRAME_SIZE: usize = 20;
const CAN_EFF_FLAG: u32 = 0x8000_0000;
const CAN_RTR_FLAG: u32 = 0x4000_0000;
const CAN_EFF_MASK: u32 = 0x1FFF_FFFF;
const TX_ECHO_ID: u32 = 0;
const RX_ECHO_ID: u32 = 0xFFFF_FFFF;

const GS_USB_VID: u16 = 0x1d50;
const GS_USB_PIDS: &[u16] = &[0x606f, 0x606d];
const GS_USB_HOST_FORMAT: u32 = 0x0000_beef;

const BREQ_HOST_FORMAT: u8 = 0;
const BREQ_BITTIMING: u8 = 1;
const BREQ_MODE: u8 = 2;

const BULK_IN_EP: u8 = 0x81;
const BULK_OUT_EP: u8 = 0x02;

const CONTROL_TIMEOUT: Duration = Duration::from_millis(500);

#[cfg(target_os = "windows")]
const DEFAULT_BACKEND_NAME: &str = "libusb-1.0.dll";
#[cfg(target_os = "macos")]
const DEFAULT_BACKEND_NAME: &str = "libusb-1.0.0.dylib";
#[cfg(all(unix, not(target_os = "macos")))]
const DEFAULT_BACKEND_NAME: &str = "libusb-1.0.so.0";

/// Fixed bit-timing presets for a 48MHz device clock (CANable's STM32F042),
/// 16 time quanta per bit. Lifted from the teacher's `COMMON_BITRATES` table.
fn bittiming_for(bitrate: u32) -> Option<[u32; 5]> {
    // [prop_seg, phase_seg1, phase_seg2, sjw, brp]
    Some(match bitrate {
        10_000 => [0, 13, 2, 1, 300],
        20_000 => [0, 13, 2, 1, 150],
        50_000 => [0, 13, 2, 1, 60],
        100_000 => [0, 13, 2, 1, 30],
        125_000 => [0, 13, 2, 1, 24],
        250_000 => [0, 13, 2, 1, 12],
        500_000 => [0, 13, 2, 1, 6],
        750_000 => [0, 13, 2, 1, 4],
        1_000_000 => [0, 13, 2, 1, 3],
        _ => return None,
    })
}

fn encode_bittiming(bitrate: u32) -> Option<[u8; 20]> {
    let [prop_seg, phase_seg1, phase_seg2, sjw, brp] = bittiming_for(bitrate)?;
    let mut buf = [0u8; 20];
    buf[0..4].copy_from_slice(&prop_seg.to_le_bytes());
    buf[4..8].copy_from_slice(&phase_seg1.to_le_bytes());
    buf[8..12].copy_from_slice(&phase_seg2.to_le_bytes());
    buf[12..16].copy_from_slice(&sjw.to_le_bytes());
    buf[16..20].copy_from_slice(&brp.to_le_bytes());
    Some(buf)
}

fn encode_gs_host_frame(frame: &Frame) -> [u8; HOST_FRAME_SIZE] {
    let mut buf = [0u8; HOST_FRAME_SIZE];
    buf[0..4].copy_from_slice(&TX_ECHO_ID.to_le_bytes());

    let mut can_id = frame.id();
    if frame.extended() {
        can_id |= CAN_EFF_FLAG;
    }
    if frame.remote() {
        can_id |= CAN_RTR_FLAG;
    }
    buf[4..8].copy_from_slice(&can_id.to_le_bytes());
    buf[8] = frame.data().len() as u8;
    buf[9] = 0; // channel
    let len = frame.data().len().min(8);
    buf[12..12 + len].copy_from_slice(&frame.data()[..len]);
    buf
}

/// Decodes a 20-byte gs_usb host frame into a `Frame`, rejecting TX echoes.
/// `timestamp` is the host-side arrival time since gs_usb devices without
/// the hardware-timestamp feature do not supply one on the wire.
fn decode_gs_host_frame(raw: &[u8], timestamp: f64) -> Result<Frame, AdapterError> {
    if raw.len() < HOST_FRAME_SIZE {
        return Err(AdapterError::ProtocolViolation(format!(
            "gs_usb frame too short: {} bytes",
            raw.len()
        )));
    }
    let echo_id = u32::from_le_bytes(raw[0..4].try_into().unwrap());
    if echo_id != RX_ECHO_ID {
        return Err(AdapterError::ProtocolViolation(
            "gs_usb TX echo frame, not RX".into(),
        ));
    }
    let can_id = u32::from_le_bytes(raw[4..8].try_into().unwrap());
    let extended = can_id & CAN_EFF_FLAG != 0;
    let remote = can_id & CAN_RTR_FLAG != 0;
    let id = can_id & CAN_EFF_MASK;
    let dlc = raw[8];
    let data_len = (dlc as usize).min(8);
    let data = raw[12..12 + data_len].to_vec();
    Ok(Frame::new(id, extended, remote, data, timestamp))
}

fn matches_gs_usb(info: &DeviceInfo) -> bool {
    info.vendor_id() == GS_USB_VID && GS_USB_PIDS.contains(&info.product_id())
}

pub struct UsbGsDriver {
    device_index: usize,
    bitrate: u32,
    backend: BackendConfig,
    interface: Mutex<Option<Interface>>,
    bulk_in: Mutex<Option<Endpoint<Bulk, In>>>,
    bulk_out: Mutex<Option<Endpoint<Bulk, Out>>>,
}

impl UsbGsDriver {
    pub fn new(device_index: usize, bitrate: u32, backend: BackendConfig) -> Result<Self, AdapterError> {
        if bittiming_for(bitrate).is_none() {
            return Err(AdapterError::InvalidConfig(format!(
                "unsupported gs_usb bitrate {bitrate}"
            )));
        }
        Ok(Self {
            device_index,
            bitrate,
            backend,
            interface: Mutex::new(None),
            bulk_in: Mutex::new(None),
            bulk_out: Mutex::new(None),
        })
    }

    fn find_device(&self) -> Result<DeviceInfo, AdapterError> {
        let devices: Vec<DeviceInfo> = nusb::list_devices()
            .wait()
            .map_err(|e| AdapterError::DeviceNotFound(format!("USB enumeration failed: {e}")))?
            .filter(matches_gs_usb)
            .collect();

        if devices.is_empty() {
            return Err(AdapterError::DeviceNotFound(
                "no gs_usb-compatible device found".into(),
            ));
        }
        devices
            .get(self.device_index)
            .cloned()
            .ok_or(AdapterError::IndexOutOfRange {
                index: self.device_index,
                found: devices.len(),
            })
    }
}

impl AdapterDriver for UsbGsDriver {
    fn open(&mut self) -> Result<(), AdapterError> {
        backend_install::ensure_installed(&self.backend, DEFAULT_BACKEND_NAME)?;

        let info = self.find_device()?;
        let device = info
            .open()
            .wait()
            .map_err(|e| AdapterError::DeviceBusy(format!("open: {e}")))?;
        let interface = device
            .claim_interface(0)
            .wait()
            .map_err(|e| AdapterError::DeviceBusy(format!("claim interface: {e}")))?;

        let host_format = GS_USB_HOST_FORMAT.to_le_bytes();
        interface
            .control_out(
                ControlOut {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Interface,
                    request: BREQ_HOST_FORMAT,
                    value: 1,
                    index: 0,
                    data: &host_format,
                },
                CONTROL_TIMEOUT,
            )
            .wait()
            .map_err(|e| AdapterError::ProtocolViolation(format!("HOST_FORMAT: {e}")))?;

        let timing = encode_bittiming(self.bitrate)
            .expect("bitrate already validated in UsbGsDriver::new");
        interface
            .control_out(
                ControlOut {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Interface,
                    request: BREQ_BITTIMING,
                    value: 0,
                    index: 0,
                    data: &timing,
                },
                CONTROL_TIMEOUT,
            )
            .wait()
            .map_err(|e| AdapterError::ProtocolViolation(format!("BITTIMING: {e}")))?;

        // mode = 1 (start), flags = 0 (normal, not listen-only)
        let mut mode_bytes = [0u8; 8];
        mode_bytes[0..4].copy_from_slice(&1u32.to_le_bytes());
        interface
            .control_out(
                ControlOut {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Interface,
                    request: BREQ_MODE,
                    value: 0,
                    index: 0,
                    data: &mode_bytes,
                },
                CONTROL_TIMEOUT,
            )
            .wait()
            .map_err(|e| AdapterError::ProtocolViolation(format!("MODE: {e}")))?;

        let bulk_in = interface
            .endpoint::<Bulk, In>(BULK_IN_EP)
            .map_err(|e| AdapterError::ProtocolViolation(format!("bulk IN endpoint: {e}")))?;
        let bulk_out = interface
            .endpoint::<Bulk, Out>(BULK_OUT_EP)
            .map_err(|e| AdapterError::ProtocolViolation(format!("bulk OUT endpoint: {e}")))?;

        *self.interface.lock().unwrap() = Some(interface);
        *self.bulk_in.lock().unwrap() = Some(bulk_in);
        *self.bulk_out.lock().unwrap() = Some(bulk_out);
        Ok(())
    }

    fn close(&mut self) -> Result<(), AdapterError> {
        if let Some(interface) = self.interface.lock().unwrap().as_ref() {
            let mut mode_bytes = [0u8; 8]; // mode = 0 (stop)
            let _ = interface
                .control_out(
                    ControlOut {
                        control_type: ControlType::Vendor,
                        recipient: Recipient::Interface,
                        request: BREQ_MODE,
                        value: 0,
                        index: 0,
                        data: &mode_bytes,
                    },
                    CONTROL_TIMEOUT,
                )
                .wait();
            mode_bytes.fill(0);
        }
        *self.bulk_out.lock().unwrap() = None;
        *self.bulk_in.lock().unwrap() = None;
        *self.interface.lock().unwrap() = None;
        Ok(())
    }

    fn transmit(&self, frame: &Frame) -> Result<(), AdapterError> {
        let mut guard = self.bulk_out.lock().unwrap();
        let ep = guard
            .as_mut()
            .ok_or_else(|| AdapterError::InvalidConfig("USB-gs channel not open".into()))?;
        let bytes = encode_gs_host_frame(frame);
        let completion = ep.transfer_blocking(bytes.to_vec().into(), CONTROL_TIMEOUT);
        completion
            .status
            .map_err(|e| AdapterError::TransmitFailed(format!("bulk OUT: {e}")))
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_extended: true,
            supports_remote: true,
            max_dlc: 8,
        }
    }

    fn poll(&self, timeout: Duration) -> Result<Option<Frame>, AdapterError> {
        let mut guard = self.bulk_in.lock().unwrap();
        let ep = guard
            .as_mut()
            .ok_or_else(|| AdapterError::InvalidConfig("USB-gs channel not open".into()))?;
        let buf = ep.allocate(HOST_FRAME_SIZE);
        let completion = ep.transfer_blocking(buf, timeout);
        match completion.status {
            Ok(()) => {
                if completion.buffer.is_empty() {
                    return Ok(None);
                }
                let timestamp = now_secs();
                decode_gs_host_frame(&completion.buffer, timestamp).map(Some)
            }
            Err(nusb::transfer::TransferError::Cancelled) => Ok(None),
            Err(e) => Err(AdapterError::ConnectionLost(format!("bulk IN: {e}"))),
        }
    }
}

fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unsupported_bitrate_at_construction() {
        match UsbGsDriver::new(0, 123_456, BackendConfig::default()) {
            Err(AdapterError::InvalidConfig(_)) => {}
            Err(other) => panic!("expected InvalidConfig, got {other:?}"),
            Ok(_) => panic!("expected an error"),
        }
    }

    #[test]
    fn encode_decode_round_trip_preserves_extended_id_and_payload() {
        let frame = Frame::new(0x18FF00A5, true, false, vec![1, 2, 3, 4], 0.0);
        let mut wire = encode_gs_host_frame(&frame);
        // Flip echo_id to mark it as an RX frame, as the device would.
        wire[0..4].copy_from_slice(&RX_ECHO_ID.to_le_bytes());

        let decoded = decode_gs_host_frame(&wire, 1.5).unwrap();
        assert_eq!(decoded.id(), 0x18FF00A5);
        assert!(decoded.extended());
        assert_eq!(decoded.data(), &[1, 2, 3, 4]);
    }

    #[test]
    fn tx_echo_frame_is_rejected_as_protocol_violation() {
        let frame = Frame::new(0x123, false, false, vec![], 0.0);
        let wire = encode_gs_host_frame(&frame); // echo_id == TX_ECHO_ID
        let err = decode_gs_host_frame(&wire, 0.0).unwrap_err();
        assert!(matches!(err, AdapterError::ProtocolViolation(_)));
    }

    #[test]
    fn bittiming_table_covers_documented_bitrates() {
        for rate in [10_000, 125_000, 250_000, 500_000, 1_000_000] {
            assert!(bittiming_for(rate).is_some());
        }
        assert!(bittiming_for(999).is_none());
    }
}
