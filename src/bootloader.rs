// src/bootloader.rs
//
// Bootloader flashing engine (component D): drives an STM32-class target
// through its CAN bootloader protocol. The engine never talks to a driver
// directly; it is handed a `transmit` closure and attaches itself to the
// fan-out as a short-lived `AggregatorSubscriber` for the duration of one
// flash job, consuming target responses before they reach session
// subscribers (see `dispatcher.rs`). Progress reporting follows the
// teacher's `smp_upgrade.rs` chunked-upload-with-percent idiom, adapted
// from its BLE/UDP image transfer to this wire protocol's 4-byte writes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::{AdapterError, BootloaderError};
use crate::fanout::AggregatorSubscriber;
use crate::frame::Frame;

pub const HOST_TO_TARGET_ID: u32 = 0x1800_0701;
pub const TARGET_TO_HOST_ID: u32 = 0x1800_0700;

pub fn reset_frame_id(module_id: u8) -> u32 {
    0x08F0_0F02 | ((module_id as u32) << 16)
}

pub const CMD_ERASE_FLASH: u8 = 0x01;
pub const CMD_READ_FLASH: u8 = 0x03;
pub const CMD_JUMP_TO_APP: u8 = 0x04;
pub const CMD_GET_STATUS: u8 = 0x05;
pub const CMD_SET_ADDRESS: u8 = 0x06;
pub const CMD_WRITE_DATA: u8 = 0x07;

pub const RSP_ACK: u8 = 0x10;
pub const RSP_NACK: u8 = 0x11;
pub const RSP_READY: u8 = 0x14;
pub const RSP_DATA: u8 = 0x15;

const HEARTBEAT: [u8; 3] = [RSP_READY, 0x01, 0x00];

/// Heartbeats seen within a single command wait before it's a flood
/// rather than ordinary keep-alive traffic interleaved with the real ACK.
const MAX_HEARTBEATS_PER_WAIT: u32 = 32;

pub const APP_START: u32 = 0x0800_8000;
pub const APP_END: u32 = 0x0803_BFFF;
pub const MAX_IMAGE_SIZE: usize = 0x3_4000;

pub const DEFAULT_WRITE_BATCH_SIZE: usize = 16;
pub const DEFAULT_VERIFY_BATCH_SIZE: usize = 8;

const RESET_TIMEOUT: Duration = Duration::from_secs(3);
const ERASE_TIMEOUT: Duration = Duration::from_secs(15);
const SET_ADDRESS_TIMEOUT: Duration = Duration::from_secs(15);
const ACK_WINDOW: Duration = Duration::from_secs(1);
const JUMP_TIMEOUT: Duration = Duration::from_millis(500);

fn error_name(code: u8) -> String {
    match code {
        0x00 => "none".into(),
        0x01 => "invalid command".into(),
        0x02 => "invalid address".into(),
        0x03 => "erase failed".into(),
        0x04 => "write failed".into(),
        0x05 => "invalid length".into(),
        0x06 => "no valid app".into(),
        0x07 => "timeout".into(),
        other => format!("unknown error 0x{other:02X}"),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlashState {
    Idle,
    AwaitingReady,
    Ready,
    Erasing,
    Erased,
    Addressed,
    Writing,
    Written,
    Verifying,
    Verified,
    Jumping,
    Done,
    Failed,
}

#[derive(Clone, Debug, Serialize)]
pub struct ProgressEvent {
    pub stage: &'static str,
    pub percent: f32,
    pub message: String,
    pub bytes_done: usize,
    pub bytes_total: usize,
}

fn progress(stage: &'static str, message: impl Into<String>, done: usize, total: usize) -> ProgressEvent {
    let percent = if total == 0 { 100.0 } else { (done as f32 / total as f32) * 100.0 };
    ProgressEvent {
        stage,
        percent,
        message: message.into(),
        bytes_done: done,
        bytes_total: total,
    }
}

/// Pads `image` to a multiple of 4 with `0xFF`, then truncates to the
/// application region if it overflows. Returns the prepared image and
/// whether truncation happened.
fn prepare_image(image: &[u8]) -> (Vec<u8>, bool) {
    let mut out = image.to_vec();
    while out.len() % 4 != 0 {
        out.push(0xFF);
    }
    if out.len() > MAX_IMAGE_SIZE {
        out.truncate(MAX_IMAGE_SIZE);
        (out, true)
    } else {
        (out, false)
    }
}

/// A single flash job's parameters.
pub struct FlashJob {
    pub module_id: u8,
    pub image: Vec<u8>,
    pub verify: bool,
    pub jump: bool,
    pub write_batch_size: usize,
    pub verify_batch_size: usize,
}

impl FlashJob {
    pub fn new(module_id: u8, image: Vec<u8>) -> Self {
        Self {
            module_id,
            image,
            verify: true,
            jump: true,
            write_batch_size: DEFAULT_WRITE_BATCH_SIZE,
            verify_batch_size: DEFAULT_VERIFY_BATCH_SIZE,
        }
    }
}

/// Drives one flash job at a time. Attached to the fan-out as an
/// `AggregatorSubscriber` only while `flash` is running; outside of that
/// window `on_frame` declines every frame.
/// How finely waits are chunked so `cancel` takes effect within one
/// chunk instead of only at the end of the caller's full timeout.
const CANCEL_CHECK_INTERVAL: Duration = Duration::from_millis(100);

pub struct BootloaderEngine {
    tx: std_mpsc::Sender<Frame>,
    rx: Mutex<std_mpsc::Receiver<Frame>>,
    active: AtomicBool,
    cancel: AtomicBool,
    state: Mutex<FlashState>,
}

impl BootloaderEngine {
    pub fn new() -> Self {
        let (tx, rx) = std_mpsc::channel();
        Self {
            tx,
            rx: Mutex::new(rx),
            active: AtomicBool::new(false),
            cancel: AtomicBool::new(false),
            state: Mutex::new(FlashState::Idle),
        }
    }

    pub fn state(&self) -> FlashState {
        *self.state.lock().unwrap()
    }

    /// Requests that the in-progress flash job stop at its next
    /// cancellation check point. Has no effect when idle.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    fn set_state(&self, state: FlashState) {
        *self.state.lock().unwrap() = state;
    }

    fn recv(&self, timeout: Duration) -> Option<Frame> {
        self.rx.lock().unwrap().recv_timeout(timeout).ok()
    }

    fn check_cancelled(&self) -> Result<(), BootloaderError> {
        if self.cancel.load(Ordering::Relaxed) {
            Err(BootloaderError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Waits for the boot handshake: a frame whose first byte is `READY`.
    /// Returns the version byte, if the target sent one.
    fn wait_for_ready(&self, timeout: Duration) -> Result<Option<u8>, BootloaderError> {
        let deadline = Instant::now() + timeout;
        loop {
            self.check_cancelled()?;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(BootloaderError::NoReady);
            }
            let chunk = remaining.min(CANCEL_CHECK_INTERVAL);
            match self.recv(chunk) {
                Some(frame) if frame.data().first() == Some(&RSP_READY) => {
                    return Ok(frame.data().get(1).copied());
                }
                _ => continue,
            }
        }
    }

    /// Waits for a command response, discarding canonical heartbeats
    /// along the way. A plain expiry with few or no heartbeats seen is a
    /// `Timeout`; a flood of heartbeats crowding out the real ACK within
    /// the same wait is a `HeartbeatStorm` instead.
    fn wait_for_response(&self, timeout: Duration) -> Result<Frame, BootloaderError> {
        let deadline = Instant::now() + timeout;
        let mut heartbeats = 0u32;
        loop {
            self.check_cancelled()?;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(BootloaderError::Timeout);
            }
            let chunk = remaining.min(CANCEL_CHECK_INTERVAL);
            match self.recv(chunk) {
                Some(frame) if frame.data().len() >= 3 && frame.data()[..3] == HEARTBEAT => {
                    heartbeats += 1;
                    if heartbeats > MAX_HEARTBEATS_PER_WAIT {
                        return Err(BootloaderError::HeartbeatStorm);
                    }
                    continue;
                }
                Some(frame) => return Ok(frame),
                None => continue,
            }
        }
    }

    fn transmit_command(
        &self,
        transmit: &mut impl FnMut(&Frame) -> Result<(), AdapterError>,
        payload: Vec<u8>,
    ) -> Result<(), BootloaderError> {
        let frame = Frame::new(HOST_TO_TARGET_ID, true, false, payload, 0.0);
        transmit(&frame).map_err(BootloaderError::from)
    }

    /// Runs one complete flash job against `transmit`, reporting progress
    /// through `on_progress`. The caller is responsible for attaching
    /// this engine to the fan-out (and detaching it afterward); `flash`
    /// only toggles whether `on_frame` accepts frames.
    pub fn flash(
        &self,
        mut transmit: impl FnMut(&Frame) -> Result<(), AdapterError>,
        job: FlashJob,
        mut on_progress: impl FnMut(ProgressEvent),
    ) -> Result<(), BootloaderError> {
        self.cancel.store(false, Ordering::Relaxed);
        self.active.store(true, Ordering::Relaxed);
        let result = self.run(&mut transmit, job, &mut on_progress);
        self.active.store(false, Ordering::Relaxed);
        if let Err(ref e) = result {
            self.set_state(FlashState::Failed);
            let message = match e {
                BootloaderError::Nack { code, .. } => format!("target rejected command: {}", error_name(*code)),
                other => other.to_string(),
            };
            on_progress(progress("error", message, 0, 0));
        }
        result
    }

    fn run(
        &self,
        transmit: &mut impl FnMut(&Frame) -> Result<(), AdapterError>,
        job: FlashJob,
        on_progress: &mut impl FnMut(ProgressEvent),
    ) -> Result<(), BootloaderError> {
        let (image, truncated) = prepare_image(&job.image);
        if image.is_empty() {
            return Err(BootloaderError::InvalidLength);
        }
        if truncated {
            on_progress(progress(
                "write",
                "image exceeds the application region; truncated to fit",
                0,
                image.len(),
            ));
        }

        self.set_state(FlashState::AwaitingReady);
        on_progress(progress("reset", "resetting module", 0, 0));
        let reset_frame = Frame::new(reset_frame_id(job.module_id), true, false, vec![0; 8], 0.0);
        transmit(&reset_frame)?;
        self.wait_for_ready(RESET_TIMEOUT)?;
        self.set_state(FlashState::Ready);

        self.set_state(FlashState::Erasing);
        on_progress(progress("erase", "erasing flash", 0, image.len()));
        self.transmit_command(transmit, vec![CMD_ERASE_FLASH])?;
        let resp = self.wait_for_response(ERASE_TIMEOUT)?;
        check_ack(&resp, 0)?;
        self.set_state(FlashState::Erased);

        let mut addr_bytes = vec![CMD_SET_ADDRESS];
        addr_bytes.extend_from_slice(&APP_START.to_be_bytes());
        self.transmit_command(transmit, addr_bytes)?;
        let resp = self.wait_for_response(SET_ADDRESS_TIMEOUT)?;
        check_ack(&resp, APP_START)?;
        self.set_state(FlashState::Addressed);

        self.set_state(FlashState::Writing);
        self.pipeline_write(transmit, &image, job.write_batch_size, on_progress)?;
        self.set_state(FlashState::Written);

        if job.verify {
            self.set_state(FlashState::Verifying);
            self.pipeline_verify(transmit, &image, job.verify_batch_size, on_progress)?;
            self.set_state(FlashState::Verified);
        }

        if job.jump {
            self.set_state(FlashState::Jumping);
            on_progress(progress("jump", "jumping to application", image.len(), image.len()));
            self.transmit_command(transmit, vec![CMD_JUMP_TO_APP])?;
            // The target stops emitting bootloader traffic once it has
            // actually jumped, so silence here is the expected outcome,
            // not a failure.
            match self.wait_for_response(JUMP_TIMEOUT) {
                Ok(resp) => check_ack(&resp, APP_START)?,
                Err(BootloaderError::Timeout) => {}
                Err(e) => return Err(e),
            }
        }

        self.set_state(FlashState::Done);
        on_progress(progress("complete", "flash complete", image.len(), image.len()));
        Ok(())
    }

    /// Streams `image` in 4-byte chunks, pipelining up to `batch_size`
    /// writes before draining that many ACKs in order.
    fn pipeline_write(
        &self,
        transmit: &mut impl FnMut(&Frame) -> Result<(), AdapterError>,
        image: &[u8],
        batch_size: usize,
        on_progress: &mut impl FnMut(ProgressEvent),
    ) -> Result<(), BootloaderError> {
        let chunks: Vec<&[u8]> = image.chunks(4).collect();
        let mut offset = 0u32;
        let mut last_report = 0usize;

        for batch in chunks.chunks(batch_size.max(1)) {
            self.check_cancelled()?;
            for chunk in batch {
                let mut payload = vec![CMD_WRITE_DATA, 0x04];
                payload.extend_from_slice(chunk);
                self.transmit_command(transmit, payload)?;
            }
            for _ in 0..batch.len() {
                // `wait_for_response` already discards heartbeats without
                // spending one of this batch's ACK slots on them, so a
                // heartbeat interleaved mid-batch can't shadow a real ACK.
                let resp = self
                    .wait_for_response(ACK_WINDOW)
                    .map_err(|_| BootloaderError::AckMismatch(offset))?;
                check_ack(&resp, offset)?;
                offset += 4;
            }
            let done = (offset as usize).min(image.len());
            if done - last_report >= 128 || done == image.len() {
                on_progress(progress("write", "writing flash", done, image.len()));
                last_report = done;
            }
        }
        Ok(())
    }

    /// Reads the image back via `READ_FLASH` in up-to-7-byte spans,
    /// pipelined the same way as writes, and compares byte-for-byte.
    fn pipeline_verify(
        &self,
        transmit: &mut impl FnMut(&Frame) -> Result<(), AdapterError>,
        image: &[u8],
        batch_size: usize,
        on_progress: &mut impl FnMut(ProgressEvent),
    ) -> Result<(), BootloaderError> {
        let spans: Vec<(u32, &[u8])> = image
            .chunks(7)
            .enumerate()
            .map(|(i, span)| (APP_START + (i * 7) as u32, span))
            .collect();
        let mut last_report = 0usize;

        for batch in spans.chunks(batch_size.max(1)) {
            self.check_cancelled()?;
            for (addr, span) in batch {
                let mut payload = vec![CMD_READ_FLASH];
                payload.extend_from_slice(&addr.to_be_bytes());
                payload.push(span.len() as u8);
                self.transmit_command(transmit, payload)?;
            }
            for (addr, expected) in batch {
                let resp = self
                    .wait_for_response(ACK_WINDOW)
                    .map_err(|_| BootloaderError::AckMismatch(*addr - APP_START))?;
                match resp.data().first() {
                    Some(&RSP_DATA) => {
                        let actual = &resp.data()[1..];
                        if actual != *expected {
                            return Err(BootloaderError::VerifyMismatch {
                                offset: *addr - APP_START,
                                expected: hex::encode(expected),
                                actual: hex::encode(actual),
                            });
                        }
                    }
                    Some(&RSP_NACK) => {
                        let code = resp.data().get(1).copied().unwrap_or(0);
                        return Err(BootloaderError::Nack { code, offset: *addr - APP_START });
                    }
                    other => return Err(BootloaderError::UnexpectedResponse(other.copied().unwrap_or(0))),
                }
            }
            let done = ((*batch.last().map(|(a, s)| a + s.len() as u32).get_or_insert(0)) as usize)
                .saturating_sub(APP_START as usize);
            if done - last_report >= 128 || batch.len() < batch_size {
                on_progress(progress("verify", "verifying flash", done.min(image.len()), image.len()));
                last_report = done;
            }
        }
        Ok(())
    }
}

impl Default for BootloaderEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl AggregatorSubscriber for BootloaderEngine {
    fn on_frame(&self, frame: &Frame) -> bool {
        if !self.active.load(Ordering::Relaxed) {
            return false;
        }
        if frame.id() == TARGET_TO_HOST_ID && frame.extended() {
            let _ = self.tx.send(frame.clone());
            true
        } else {
            false
        }
    }
}

fn check_ack(resp: &Frame, offset: u32) -> Result<(), BootloaderError> {
    match resp.data().first() {
        Some(&RSP_ACK) => Ok(()),
        Some(&RSP_NACK) => {
            let code = resp.data().get(1).copied().unwrap_or(0);
            Err(BootloaderError::Nack { code, offset })
        }
        other => Err(BootloaderError::UnexpectedResponse(other.copied().unwrap_or(0))),
    }
}
