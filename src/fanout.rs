// src/fanout.rs
//
// Subscriber fan-out (component G). Two subscriber classes:
//  - session subscribers: bounded queue, drop-oldest on overflow, never
//    block the pump.
//  - the (single) aggregator subscriber: synchronous, in-order, and the
//    pump MUST NOT advance until it returns.
//
// Grounded on the teacher's per-subscriber bounded-queue pattern in
// `io/multi_source` (each listener gets its own channel so a slow
// consumer never backs up the others).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::frame::Frame;
use crate::symboldb::DecodeResult;

/// A frame as delivered to a session subscriber, with its decode attached
/// if a schema matched (frame and decode arrive together).
#[derive(Clone, Debug)]
pub struct AnnotatedFrame {
    pub frame: Frame,
    pub decoded: Option<DecodeResult>,
}

pub const DEFAULT_QUEUE_DEPTH: usize = 1024;

struct Inner {
    queue: VecDeque<AnnotatedFrame>,
    capacity: usize,
}

/// A live observer's handle. Owns a bounded queue and a dropped-frame
/// counter; reads the counter alongside its next read.
pub struct SessionSubscriber {
    inner: Mutex<Inner>,
    dropped: AtomicU64,
}

impl SessionSubscriber {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::with_capacity(capacity),
                capacity,
            }),
            dropped: AtomicU64::new(0),
        })
    }

    /// Push a frame. If the queue is full, drop the oldest entry and
    /// increment the drop counter. Never blocks.
    fn push(&self, frame: AnnotatedFrame) {
        let mut inner = self.inner.lock().unwrap();
        if inner.queue.len() >= inner.capacity {
            inner.queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        inner.queue.push_back(frame);
    }

    /// Pop the next frame along with the current dropped-frame count.
    pub fn recv(&self) -> Option<(AnnotatedFrame, u64)> {
        let mut inner = self.inner.lock().unwrap();
        let frame = inner.queue.pop_front()?;
        Some((frame, self.dropped.load(Ordering::Relaxed)))
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Receives every frame synchronously and in order. At most one may be
/// attached at a time; the pump waits for `on_frame` to return before
/// handing the frame to anyone else.
pub trait AggregatorSubscriber: Send + Sync {
    /// Returns `true` if this subscriber "consumed" the frame — consumed
    /// frames still update aggregator counters but must not reach
    /// session subscribers.
    fn on_frame(&self, frame: &Frame) -> bool;
}

/// Broadcasts one frame to every attached session subscriber plus the
/// single optional aggregator subscriber, giving it first refusal on
/// every frame before session subscribers ever see it.
pub struct FanOut {
    sessions: Mutex<Vec<Arc<SessionSubscriber>>>,
    aggregator_subscriber: Mutex<Option<Arc<dyn AggregatorSubscriber>>>,
}

impl FanOut {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(Vec::new()),
            aggregator_subscriber: Mutex::new(None),
        }
    }

    pub fn attach_session(&self, sub: Arc<SessionSubscriber>) {
        self.sessions.lock().unwrap().push(sub);
    }

    pub fn detach_session(&self, sub: &Arc<SessionSubscriber>) {
        self.sessions
            .lock()
            .unwrap()
            .retain(|s| !Arc::ptr_eq(s, sub));
    }

    /// At most one aggregator subscriber may be attached at a time.
    pub fn attach_aggregator_subscriber(&self, sub: Arc<dyn AggregatorSubscriber>) {
        *self.aggregator_subscriber.lock().unwrap() = Some(sub);
    }

    pub fn detach_aggregator_subscriber(&self) {
        *self.aggregator_subscriber.lock().unwrap() = None;
    }

    /// Deliver one frame. Returns `true` if the aggregator subscriber
    /// consumed it (in which case session subscribers do not see it).
    pub fn dispatch(&self, frame: &Frame, decoded: Option<DecodeResult>) -> bool {
        let consumed = {
            let guard = self.aggregator_subscriber.lock().unwrap();
            match guard.as_ref() {
                Some(sub) => sub.on_frame(frame),
                None => false,
            }
        };

        if !consumed {
            let annotated = AnnotatedFrame {
                frame: frame.clone(),
                decoded,
            };
            for sub in self.sessions.lock().unwrap().iter() {
                sub.push(annotated.clone());
            }
        }
        consumed
    }
}

impl Default for FanOut {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_oldest_on_overflow_and_counts_drops() {
        let sub = SessionSubscriber::new(2);
        for i in 0..4u8 {
            sub.push(AnnotatedFrame {
                frame: Frame::new(0x1, false, false, vec![i], i as f64),
                decoded: None,
            });
        }
        assert_eq!(sub.dropped_count(), 2);
        let (first, _) = sub.recv().unwrap();
        assert_eq!(first.frame.data(), &[2]);
        let (second, _) = sub.recv().unwrap();
        assert_eq!(second.frame.data(), &[3]);
        assert!(sub.recv().is_none());
    }

    struct ConsumeAll;
    impl AggregatorSubscriber for ConsumeAll {
        fn on_frame(&self, _frame: &Frame) -> bool {
            true
        }
    }

    #[test]
    fn aggregator_subscriber_hides_frame_from_sessions() {
        let fanout = FanOut::new();
        let session = SessionSubscriber::new(8);
        fanout.attach_session(session.clone());
        fanout.attach_aggregator_subscriber(Arc::new(ConsumeAll));

        let consumed = fanout.dispatch(&Frame::new(0x18000700, true, false, vec![0x14], 0.0), None);
        assert!(consumed);
        assert!(session.is_empty());
    }

    #[test]
    fn non_consumed_frame_reaches_session_subscribers() {
        let fanout = FanOut::new();
        let session = SessionSubscriber::new(8);
        fanout.attach_session(session.clone());

        fanout.dispatch(&Frame::new(0x1, false, false, vec![], 0.0), None);
        assert_eq!(session.len(), 1);
    }
}
