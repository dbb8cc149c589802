// Cross-module scenarios exercising the bootloader engine's abort paths
// end-to-end: a NACK during the write phase must stop the job without
// sending anything further, and a verify-phase mismatch must surface the
// exact offset/expected/actual rather than a generic failure.

use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::Duration;

use canbridge_lib::bootloader::{
    reset_frame_id, BootloaderEngine, FlashJob, APP_START, CMD_ERASE_FLASH, CMD_JUMP_TO_APP, CMD_READ_FLASH,
    CMD_SET_ADDRESS, CMD_WRITE_DATA, RSP_ACK, RSP_DATA, RSP_NACK, RSP_READY,
};
use canbridge_lib::error::BootloaderError;
use canbridge_lib::fanout::AggregatorSubscriber;
use canbridge_lib::frame::Frame;

fn target_frame(bytes: &[u8]) -> Frame {
    Frame::new(0x1800_0700, true, false, bytes.to_vec(), 0.0)
}

/// S4 — Write NACK: the target NACKs the write chunk at offset 0x80; the
/// engine must fail with that NACK's code/offset and must not transmit
/// anything past it.
#[test]
fn write_nack_aborts_without_further_chunks() {
    let engine = Arc::new(BootloaderEngine::new());
    let image = vec![0xAAu8; 0x100]; // 64 four-byte chunks; offset 0x80 is chunk #32

    let (sent_tx, sent_rx) = std_mpsc::channel::<Frame>();
    let responder_engine = engine.clone();
    let responder = std::thread::spawn(move || {
        let mut write_chunk_index: u32 = 0;
        let mut nacked = false;
        let mut frames_after_nack = 0usize;
        while let Ok(frame) = sent_rx.recv_timeout(Duration::from_secs(2)) {
            if nacked {
                frames_after_nack += 1;
                continue;
            }
            if frame.id() == reset_frame_id(0) {
                responder_engine.on_frame(&target_frame(&[RSP_READY, 0x02]));
            } else if matches!(frame.data().first(), Some(&CMD_ERASE_FLASH) | Some(&CMD_SET_ADDRESS)) {
                responder_engine.on_frame(&target_frame(&[RSP_ACK]));
            } else if frame.data().first() == Some(&CMD_WRITE_DATA) {
                let offset = write_chunk_index * 4;
                if offset == 0x80 {
                    responder_engine.on_frame(&target_frame(&[RSP_NACK, 0x04]));
                    nacked = true;
                } else {
                    responder_engine.on_frame(&target_frame(&[RSP_ACK]));
                }
                write_chunk_index += 1;
            }
        }
        frames_after_nack
    });

    let mut job = FlashJob::new(0, image);
    job.verify = false;
    job.jump = false;
    // One chunk per batch, so the engine always sees the NACK before it
    // would pipeline ahead to the next chunk.
    job.write_batch_size = 1;
    let result = engine.flash(
        |f| {
            sent_tx.send(f.clone()).unwrap();
            Ok(())
        },
        job,
        |_| {},
    );
    drop(sent_tx);
    let frames_after_nack = responder.join().unwrap();

    match result {
        Err(BootloaderError::Nack { code, offset }) => {
            assert_eq!(code, 0x04);
            assert_eq!(offset, 0x80);
        }
        other => panic!("expected Nack{{code: 4, offset: 0x80}}, got {other:?}"),
    }
    assert_eq!(frames_after_nack, 0, "engine must not send chunks past the NACK");
}

/// S5 — Verify mismatch: a read-back at one address disagrees with the
/// image that was written; the engine must fail with the exact offset and
/// expected/actual bytes rather than a bare "mismatch" error.
#[test]
fn verify_mismatch_reports_offset_and_bytes() {
    let engine = Arc::new(BootloaderEngine::new());
    // Verify reads in 7-byte spans starting at APP_START; two full spans.
    let image: Vec<u8> = (0..14u8).collect();

    let (sent_tx, sent_rx) = std_mpsc::channel::<Frame>();
    let responder_engine = engine.clone();
    let responder = std::thread::spawn(move || {
        while let Ok(frame) = sent_rx.recv_timeout(Duration::from_secs(2)) {
            if frame.id() == reset_frame_id(0) {
                responder_engine.on_frame(&target_frame(&[RSP_READY, 0x02]));
            } else if matches!(
                frame.data().first(),
                Some(&CMD_ERASE_FLASH) | Some(&CMD_SET_ADDRESS) | Some(&CMD_WRITE_DATA)
            ) {
                responder_engine.on_frame(&target_frame(&[RSP_ACK]));
            } else if frame.data().first() == Some(&CMD_READ_FLASH) {
                let addr = u32::from_be_bytes(frame.data()[1..5].try_into().unwrap());
                let offset = addr - APP_START;
                let len = frame.data()[5] as usize;
                let mut reply = vec![RSP_DATA];
                if offset == 7 {
                    reply.extend_from_slice(&vec![0u8; len]);
                } else {
                    reply.extend_from_slice(&image_bytes_at(offset as usize, len));
                }
                responder_engine.on_frame(&target_frame(&reply));
            } else if frame.data().first() == Some(&CMD_JUMP_TO_APP) {
                responder_engine.on_frame(&target_frame(&[RSP_ACK]));
            }
        }
    });

    fn image_bytes_at(offset: usize, len: usize) -> Vec<u8> {
        (offset..offset + len).map(|i| i as u8).collect()
    }

    let mut job = FlashJob::new(0, image);
    job.verify = true;
    job.jump = false;
    let result = engine.flash(
        |f| {
            sent_tx.send(f.clone()).unwrap();
            Ok(())
        },
        job,
        |_| {},
    );
    drop(sent_tx);
    responder.join().unwrap();

    match result {
        Err(BootloaderError::VerifyMismatch { offset, expected, actual }) => {
            assert_eq!(offset, 7);
            assert_eq!(expected, hex::encode([7u8, 8, 9, 10, 11, 12, 13]));
            assert_eq!(actual, hex::encode([0u8; 7]));
        }
        other => panic!("expected VerifyMismatch at offset 7, got {other:?}"),
    }
}
