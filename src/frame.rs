// src/frame.rs
//
// Canonical in-memory CAN frame (component A).

use serde::{Deserialize, Serialize};

/// An immutable CAN frame. Frames are value-typed and freely copyable
/// (clone is cheap for the typical 0-8 byte payload).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Frame {
    id: u32,
    extended: bool,
    remote: bool,
    data: Vec<u8>,
    /// Monotonic seconds since an epoch local to the process start.
    pub timestamp: f64,
}

/// Standard (11-bit) CAN ID mask.
pub const CAN_SFF_MASK: u32 = 0x7FF;
/// Extended (29-bit) CAN ID mask.
pub const CAN_EFF_MASK: u32 = 0x1FFF_FFFF;

impl Frame {
    /// Construct a frame, truncating `data` to 8 bytes per the DLC invariant.
    ///
    /// Panics if `id` exceeds the addressing width implied by `extended` —
    /// callers must never rely on a high bit to convey extended-ness; it is
    /// always a separate, explicit flag.
    pub fn new(id: u32, extended: bool, remote: bool, data: Vec<u8>, timestamp: f64) -> Self {
        let max_id = if extended { CAN_EFF_MASK } else { CAN_SFF_MASK };
        assert!(id <= max_id, "CAN id 0x{:X} exceeds {}-bit range", id, if extended { 29 } else { 11 });
        assert!(data.len() <= 8, "CAN payload exceeds 8 bytes");
        Self {
            id,
            extended,
            remote,
            data,
            timestamp,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn extended(&self) -> bool {
        self.extended
    }

    pub fn remote(&self) -> bool {
        self.remote
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn dlc(&self) -> u8 {
        self.data.len() as u8
    }

    /// The `(id, extended)` addressing key used throughout the system.
    /// Two frames with the same numeric id but different `extended` are
    /// distinct keys — never synthesize extended-ness from the id.
    pub fn key(&self) -> (u32, bool) {
        (self.id, self.extended)
    }

    /// `0x<hex>` padded to 8 hex digits when extended, otherwise 3.
    pub fn display_id(&self) -> String {
        if self.extended {
            format!("0x{:08X}", self.id)
        } else {
            format!("0x{:03X}", self.id)
        }
    }
}

impl PartialEq for Frame {
    /// Equality ignores `timestamp` by design.
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.extended == other.extended
            && self.remote == other.remote
            && self.data == other.data
    }
}
