// src/pump.rs
//
// Receive pump (component C): the sole reader of a bound driver's receive
// channel. One pump thread per open adapter, grounded on the teacher's
// `io/serial/reader.rs` "one background task per source" shape, adapted
// from an async reader task to a blocking poll loop since `AdapterDriver`
// is synchronous.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::adapter::{AdapterDriver, AdapterVariant};
use crate::aggregator::Aggregator;
use crate::decoder::DecoderAdapter;
use crate::fanout::FanOut;

const POLL_TIMEOUT: Duration = Duration::from_millis(200);
const DRAIN_TIMEOUT: Duration = Duration::from_millis(1);
const MONOTONIC_EPSILON: f64 = 1e-6;

/// One pump per bound driver. Owns nothing the driver itself doesn't
/// already own; it only coordinates the poll-decode-dispatch loop and
/// its own shutdown.
pub struct Pump {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Pump {
    /// Starts polling `driver` in a dedicated thread. `driver` is shared
    /// with whatever owns `open`/`close`/`transmit` on it; those only
    /// need `&mut self` at connect/disconnect time, so an `RwLock`
    /// rather than a `Mutex` lets the pump's read-locked `poll` coexist
    /// with transmits happening from another thread.
    pub fn spawn(
        driver: Arc<RwLock<AdapterVariant>>,
        aggregator: Arc<Aggregator>,
        decoder: Arc<DecoderAdapter>,
        fanout: Arc<FanOut>,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();

        let handle = std::thread::spawn(move || {
            let mut last_timestamp = f64::NEG_INFINITY;
            while !thread_stop.load(Ordering::Relaxed) {
                let polled_with_hint = {
                    let guard = driver.read().unwrap();
                    guard.poll(POLL_TIMEOUT).map(|f| f.map(|frame| (frame, guard.take_decoded_hint())))
                };
                match polled_with_hint {
                    Ok(Some((frame, relay_hint))) => {
                        last_timestamp =
                            ingest(&frame, relay_hint, last_timestamp, &aggregator, &decoder, &fanout);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tlog!("[pump] poll error, backing off: {e}");
                        std::thread::sleep(Duration::from_millis(50));
                    }
                }
            }

            // Drain whatever the driver still has buffered before this
            // thread exits, so a close doesn't silently lose frames that
            // already arrived.
            loop {
                let polled_with_hint = {
                    let guard = driver.read().unwrap();
                    guard.poll(DRAIN_TIMEOUT).map(|f| f.map(|frame| (frame, guard.take_decoded_hint())))
                };
                match polled_with_hint {
                    Ok(Some((frame, relay_hint))) => {
                        last_timestamp =
                            ingest(&frame, relay_hint, last_timestamp, &aggregator, &decoder, &fanout);
                    }
                    _ => break,
                }
            }
        });

        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Signals the pump thread to stop and blocks until it has drained
    /// and exited.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Pump {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Normalizes `frame`'s timestamp against `last_timestamp` (never
/// decreasing), then hands it to the aggregator and the fan-out in that
/// order, and returns the timestamp that was actually used.
///
/// `relay_hint` is a decode the adapter itself already attached to the
/// frame (only NetworkRelay does this); it's used when this crate's own
/// symbol database has no schema for the frame, rather than discarded.
fn ingest(
    frame: &crate::frame::Frame,
    relay_hint: Option<crate::symboldb::DecodeResult>,
    last_timestamp: f64,
    aggregator: &Aggregator,
    decoder: &DecoderAdapter,
    fanout: &FanOut,
) -> f64 {
    let mut frame = frame.clone();
    if frame.timestamp <= last_timestamp {
        frame.timestamp = last_timestamp + MONOTONIC_EPSILON;
    }
    let timestamp = frame.timestamp;

    aggregator.observe(&frame, decoder);
    let decoded = decoder
        .decode(frame.id(), frame.extended(), frame.data())
        .or(relay_hint);
    fanout.dispatch(&frame, decoded);

    timestamp
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::pcan::PcanDriver;
    use crate::adapter::BackendConfig;
    use crate::frame::Frame;
    use crate::symboldb::CanDbcDatabase;

    #[test]
    fn ingest_restores_monotonicity_when_source_timestamps_go_backward() {
        let aggregator = Aggregator::new();
        let decoder = DecoderAdapter::new(Arc::new(CanDbcDatabase::empty()));
        let fanout = FanOut::new();

        let first = Frame::new(0x1, false, false, vec![1], 10.0);
        let t1 = ingest(&first, None, f64::NEG_INFINITY, &aggregator, &decoder, &fanout);
        assert_eq!(t1, 10.0);

        let second = Frame::new(0x1, false, false, vec![2], 5.0); // goes backward
        let t2 = ingest(&second, None, t1, &aggregator, &decoder, &fanout);
        assert!(t2 > t1);
    }

    #[test]
    fn pump_delivers_frames_to_fanout_and_aggregator_then_stops_cleanly() {
        let aggregator = Arc::new(Aggregator::new());
        let decoder = Arc::new(DecoderAdapter::new(Arc::new(CanDbcDatabase::empty())));
        let fanout = Arc::new(FanOut::new());
        let session = crate::fanout::SessionSubscriber::new(8);
        fanout.attach_session(session.clone());

        let driver = Arc::new(RwLock::new(AdapterVariant::Pcan(
            PcanDriver::new("USB1", 500_000, BackendConfig::default()).unwrap(),
        )));

        let pump = Pump::spawn(driver, aggregator.clone(), decoder, fanout.clone());
        // Real PCAN hardware is absent in this environment, so `poll`
        // will keep returning errors; confirm the pump still starts and
        // can be stopped without hanging or panicking.
        std::thread::sleep(Duration::from_millis(20));
        pump.stop();
        let _ = session.is_empty();
    }
}
