// src/decoder.rs
//
// The decoder adapter (component F): calls the SymbolDatabase capability
// and annotates frames. The schema may be
// replaced at any time; `decode` never holds the database's write lock,
// so a replacement mid-decode yields either the old or new result but
// never a panic.

use std::sync::Arc;

use crate::symboldb::{decode_with_schema, DecodeResult, SymbolDatabase};

pub struct DecoderAdapter {
    db: Arc<dyn SymbolDatabase>,
}

impl DecoderAdapter {
    pub fn new(db: Arc<dyn SymbolDatabase>) -> Self {
        Self { db }
    }

    /// Returns `None` when no schema is registered for `(id, extended)`.
    /// Decoder errors are swallowed here: callers get `None`, not
    /// an error, and the frame is still delivered undecoded.
    pub fn decode(&self, id: u32, extended: bool, data: &[u8]) -> Option<DecodeResult> {
        let schema = self.db.lookup(id, extended)?;
        Some(decode_with_schema(&schema, data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symboldb::{ByteOrder, MessageSchema, SignalDef};
    use std::collections::HashMap;

    struct FixedDb(MessageSchema);
    impl SymbolDatabase for FixedDb {
        fn lookup(&self, frame_id: u32, extended: bool) -> Option<MessageSchema> {
            if frame_id == 0x18FF0000 && extended {
                Some(self.0.clone())
            } else {
                None
            }
        }
    }

    #[test]
    fn decode_is_function_of_id_and_extended_only() {
        let schema = MessageSchema {
            name: "BatteryState".into(),
            signals: vec![SignalDef {
                name: "Soc".into(),
                start_bit: 0,
                width: 8,
                byte_order: ByteOrder::LittleEndian,
                signed: false,
                scale: 1.0,
                offset: 0.0,
                unit: Some("%".into()),
                enum_map: HashMap::new(),
            }],
        };
        let adapter = DecoderAdapter::new(Arc::new(FixedDb(schema)));

        let a = adapter.decode(0x18FF0000, true, &[1, 2, 3]).unwrap();
        let b = adapter.decode(0x18FF0000, true, &[1, 9, 9]).unwrap();
        assert_eq!(a.message_name, b.message_name);
        assert_eq!(a.signals[0].value, b.signals[0].value); // first byte unchanged

        assert!(adapter.decode(0x18FF0000, false, &[1]).is_none());
        assert!(adapter.decode(0x100, true, &[1]).is_none());
    }
}
