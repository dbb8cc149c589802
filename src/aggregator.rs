// src/aggregator.rs
//
// Per-ID statistics table (component E). Single writer (the receive pump);
// readers take a snapshot per key. Grounded on the teacher's buffer_store
// append-and-snapshot pattern, simplified to a single HashMap guarded by
// an RwLock since there is exactly one writer thread.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::decoder::DecoderAdapter;
use crate::frame::Frame;
use crate::symboldb::DecodeResult;

#[derive(Clone, Debug)]
pub struct IdStats {
    pub count: u64,
    pub last_timestamp: f64,
    pub last_payload: Vec<u8>,
    /// Raw last inter-arrival in ms, rounded to 0.1ms. Zero on first sight.
    /// This is deliberately not smoothed — see Open Question in SPEC_FULL.
    pub period_ms: f64,
    pub last_decoded: Option<DecodeResult>,
}

pub struct Aggregator {
    stats: RwLock<HashMap<(u32, bool), IdStats>>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self {
            stats: RwLock::new(HashMap::new()),
        }
    }

    /// Update the stats entry for `frame`'s key, consulting `decoder` for
    /// the cached decode. Only the pump thread should call this.
    pub fn observe(&self, frame: &Frame, decoder: &DecoderAdapter) {
        let key = frame.key();
        let decoded = decoder.decode(frame.id(), frame.extended(), frame.data());

        let mut table = self.stats.write().unwrap();
        let entry = table.entry(key).or_insert_with(|| IdStats {
            count: 0,
            last_timestamp: frame.timestamp,
            last_payload: Vec::new(),
            period_ms: 0.0,
            last_decoded: None,
        });

        let period_ms = if entry.count == 0 {
            0.0
        } else {
            (round_tenth((frame.timestamp - entry.last_timestamp) * 1000.0)).max(0.0)
        };

        entry.count += 1;
        entry.last_timestamp = frame.timestamp;
        entry.last_payload = frame.data().to_vec();
        entry.period_ms = period_ms;
        entry.last_decoded = decoded;
    }

    pub fn get(&self, id: u32, extended: bool) -> Option<IdStats> {
        self.stats.read().unwrap().get(&(id, extended)).cloned()
    }

    pub fn snapshot(&self) -> HashMap<(u32, bool), IdStats> {
        self.stats.read().unwrap().clone()
    }

    /// Atomically empties the map and resets counters. Does not affect
    /// subscribers.
    pub fn clear(&self) {
        self.stats.write().unwrap().clear();
    }
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new()
    }
}

fn round_tenth(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symboldb::CanDbcDatabase;
    use std::sync::Arc;

    fn decoder() -> DecoderAdapter {
        DecoderAdapter::new(Arc::new(CanDbcDatabase::empty()))
    }

    #[test]
    fn count_matches_number_of_observations() {
        let agg = Aggregator::new();
        let dec = decoder();
        for i in 0..5 {
            let f = Frame::new(0x100, false, false, vec![i], i as f64);
            agg.observe(&f, &dec);
        }
        assert_eq!(agg.get(0x100, false).unwrap().count, 5);
    }

    #[test]
    fn first_sight_has_zero_period() {
        let agg = Aggregator::new();
        let dec = decoder();
        let f = Frame::new(0x200, false, false, vec![], 10.0);
        agg.observe(&f, &dec);
        assert_eq!(agg.get(0x200, false).unwrap().period_ms, 0.0);
    }

    #[test]
    fn period_is_raw_interarrival_in_ms() {
        let agg = Aggregator::new();
        let dec = decoder();
        agg.observe(&Frame::new(0x200, false, false, vec![], 10.0), &dec);
        agg.observe(&Frame::new(0x200, false, false, vec![], 10.25), &dec);
        assert_eq!(agg.get(0x200, false).unwrap().period_ms, 250.0);
    }

    #[test]
    fn standard_and_extended_same_id_are_disjoint() {
        let agg = Aggregator::new();
        let dec = decoder();
        agg.observe(&Frame::new(0x100, false, false, vec![1], 0.0), &dec);
        agg.observe(&Frame::new(0x100, true, false, vec![2], 0.0), &dec);
        assert_eq!(agg.get(0x100, false).unwrap().count, 1);
        assert_eq!(agg.get(0x100, true).unwrap().count, 1);
        assert_eq!(agg.get(0x100, false).unwrap().last_payload, vec![1]);
        assert_eq!(agg.get(0x100, true).unwrap().last_payload, vec![2]);
    }

    #[test]
    fn clear_then_clear_is_a_noop() {
        let agg = Aggregator::new();
        let dec = decoder();
        agg.observe(&Frame::new(0x1, false, false, vec![], 0.0), &dec);
        agg.clear();
        agg.clear();
        assert!(agg.get(0x1, false).is_none());
    }
}
