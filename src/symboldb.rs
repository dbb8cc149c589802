// src/symboldb.rs
//
// The SymbolDatabase capability: a lookup result keyed by
// (id, extended), consulted by the decoder adapter. DBC parsing itself is
// out of scope for this crate — the one concrete implementation here
// delegates the actual grammar to the `can-dbc` crate (already part of
// the teacher's stack, used the same way `dbc_import.rs` uses it), so we
// consume a parser rather than write one.

use std::collections::HashMap;
use std::sync::RwLock;

/// Byte order for a signal's bit layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ByteOrder {
    LittleEndian,
    BigEndian,
}

/// One signal definition within a message schema.
#[derive(Clone, Debug)]
pub struct SignalDef {
    pub name: String,
    pub start_bit: u16,
    pub width: u16,
    pub byte_order: ByteOrder,
    pub signed: bool,
    pub scale: f64,
    pub offset: f64,
    pub unit: Option<String>,
    pub enum_map: HashMap<i64, String>,
}

/// A decoded message layout, keyed by `(id, extended)`. Replaced
/// atomically on symbol-file upload; never mutated in place.
#[derive(Clone, Debug)]
pub struct MessageSchema {
    pub name: String,
    pub signals: Vec<SignalDef>,
}

/// The decoded value of one signal.
#[derive(Clone, Debug, serde::Serialize)]
pub struct DecodedSignal {
    pub name: String,
    /// Rendered value: an enum label when one matches, else the scaled number.
    pub value: String,
    pub raw: Option<i64>,
    pub unit: Option<String>,
    pub scale: Option<f64>,
    pub offset: Option<f64>,
}

/// Result of a successful decode.
#[derive(Clone, Debug, serde::Serialize)]
pub struct DecodeResult {
    pub message_name: String,
    pub signals: Vec<DecodedSignal>,
}

/// Lookup/decode capability the decoder adapter consumes. DBC parsing and
/// persistence of the uploaded blob live behind this trait, not in this
/// crate's core.
pub trait SymbolDatabase: Send + Sync {
    /// Extended-ness is part of the key; implementations must never
    /// synthesize it from a high bit of `frame_id`.
    fn lookup(&self, frame_id: u32, extended: bool) -> Option<MessageSchema>;
}

fn bits_to_raw(data: &[u8], start_bit: u16, width: u16, order: ByteOrder, signed: bool) -> i64 {
    // Collect the width bits starting at start_bit per byte order, matching
    // can-dbc's Motorola/Intel bit numbering conventions.
    let mut raw: u64 = 0;
    match order {
        ByteOrder::LittleEndian => {
            for i in 0..width {
                let bit_pos = start_bit + i;
                let byte_idx = (bit_pos / 8) as usize;
                let bit_idx = bit_pos % 8;
                if byte_idx >= data.len() {
                    continue;
                }
                let bit = (data[byte_idx] >> bit_idx) & 1;
                raw |= (bit as u64) << i;
            }
        }
        ByteOrder::BigEndian => {
            // Motorola bit numbering: start_bit is the MSB, bits walk
            // downward within bytes and across byte boundaries.
            let mut pos = start_bit as i32;
            for i in 0..width {
                let byte_idx = (pos / 8) as usize;
                let bit_idx = 7 - (pos % 8);
                if byte_idx < data.len() {
                    let bit = (data[byte_idx] >> bit_idx) & 1;
                    raw |= (bit as u64) << (width - 1 - i);
                }
                pos -= 1;
                if pos % 8 == 7 {
                    // crossed a byte boundary going down; nothing special needed,
                    // the index math above already accounts for it.
                }
                if pos < 0 {
                    break;
                }
            }
        }
    }
    if signed && width < 64 {
        let sign_bit = 1u64 << (width - 1);
        if raw & sign_bit != 0 {
            let mask = (1u64 << width) - 1;
            return ((raw ^ mask).wrapping_add(1) as i64).wrapping_neg();
        }
    }
    raw as i64
}

/// Numeric formatting hint: 1 decimal when scale >= 1,
/// 2 decimals when scale >= 0.01, otherwise 3. Consumers may reformat.
fn format_scaled(value: f64, scale: f64) -> String {
    if scale >= 1.0 {
        format!("{:.1}", value)
    } else if scale >= 0.01 {
        format!("{:.2}", value)
    } else {
        format!("{:.3}", value)
    }
}

/// Decode `data` against `schema`.
pub fn decode_with_schema(schema: &MessageSchema, data: &[u8]) -> DecodeResult {
    let signals = schema
        .signals
        .iter()
        .map(|sig| {
            let raw = bits_to_raw(data, sig.start_bit, sig.width, sig.byte_order, sig.signed);
            if let Some(label) = sig.enum_map.get(&raw) {
                DecodedSignal {
                    name: sig.name.clone(),
                    value: label.clone(),
                    raw: Some(raw),
                    unit: sig.unit.clone(),
                    scale: Some(sig.scale),
                    offset: Some(sig.offset),
                }
            } else {
                let scaled = raw as f64 * sig.scale + sig.offset;
                DecodedSignal {
                    name: sig.name.clone(),
                    value: format_scaled(scaled, sig.scale),
                    raw: None,
                    unit: sig.unit.clone(),
                    scale: Some(sig.scale),
                    offset: Some(sig.offset),
                }
            }
        })
        .collect();
    DecodeResult {
        message_name: schema.name.clone(),
        signals,
    }
}

/// Lookup table from `VAL_` sections, keyed by (raw message id, signal
/// name) the same way `dbc_import.rs`'s `build_value_desc_map` keys it.
fn build_value_desc_map(vds: &[can_dbc::ValueDescription]) -> HashMap<(u32, String), HashMap<i64, String>> {
    let mut map: HashMap<(u32, String), HashMap<i64, String>> = HashMap::new();
    for vd in vds {
        if let can_dbc::ValueDescription::Signal {
            message_id,
            name,
            value_descriptions,
        } = vd
        {
            let entries = value_descriptions
                .iter()
                .map(|v| (v.id, v.description.clone()))
                .collect();
            map.insert((message_id.raw(), name.clone()), entries);
        }
    }
    map
}

/// A `SymbolDatabase` backed by a parsed DBC file, replaceable atomically
/// behind a `RwLock` — decode never holds the write lock longer than the
/// time to read one schema out.
pub struct CanDbcDatabase {
    messages: RwLock<HashMap<(u32, bool), MessageSchema>>,
}

impl CanDbcDatabase {
    pub fn empty() -> Self {
        Self {
            messages: RwLock::new(HashMap::new()),
        }
    }

    /// Parse a DBC text blob with `can-dbc` and replace the schema table
    /// atomically. A DBC `MessageId` already distinguishes `Standard` from
    /// `Extended` without relying on a raw high bit, so the (id, extended)
    /// key falls directly out of that enum rather than needing to be
    /// reconstructed by masking.
    pub fn load(&self, dbc_text: &[u8]) -> Result<(), String> {
        let text = std::str::from_utf8(dbc_text).map_err(|e| e.to_string())?;
        let dbc = can_dbc::Dbc::try_from(text).map_err(|e| format!("{e:?}"))?;
        let value_desc_map = build_value_desc_map(&dbc.value_descriptions);
        let mut table = HashMap::new();
        for message in dbc.messages {
            let raw_id = message.id.raw();
            let (id, extended) = match message.id {
                can_dbc::MessageId::Standard(id) => (id as u32, false),
                can_dbc::MessageId::Extended(id) => (id, true),
            };
            let signals = message
                .signals
                .into_iter()
                .map(|s| {
                    let enum_map = value_desc_map
                        .get(&(raw_id, s.name.clone()))
                        .cloned()
                        .unwrap_or_default();
                    SignalDef {
                        name: s.name,
                        start_bit: s.start_bit as u16,
                        width: s.size as u16,
                        byte_order: match s.byte_order {
                            can_dbc::ByteOrder::LittleEndian => ByteOrder::LittleEndian,
                            can_dbc::ByteOrder::BigEndian => ByteOrder::BigEndian,
                        },
                        signed: matches!(s.value_type, can_dbc::ValueType::Signed),
                        scale: s.factor,
                        offset: s.offset,
                        unit: if s.unit.is_empty() { None } else { Some(s.unit) },
                        enum_map,
                    }
                })
                .collect();
            table.insert(
                (id, extended),
                MessageSchema {
                    name: message.name,
                    signals,
                },
            );
        }
        *self.messages.write().unwrap() = table;
        Ok(())
    }

    /// Atomically empties the schema table.
    pub fn clear(&self) {
        *self.messages.write().unwrap() = HashMap::new();
    }
}

impl SymbolDatabase for CanDbcDatabase {
    fn lookup(&self, frame_id: u32, extended: bool) -> Option<MessageSchema> {
        self.messages.read().unwrap().get(&(frame_id, extended)).cloned()
    }
}
