// src/store.rs
//
// Persistence store (component K): a symbol-file store with a
// most-recently-loaded pointer, and a named transmit-list store. Grounded
// on `store_manager.rs`'s in-memory-cache-plus-disk model and on
// `transmit.rs`'s save/load-by-name transmit-list commands. Unlike the UI
// store (which debounces frequent small writes), uploads here happen at
// user-initiated action rate, so each write goes straight to disk instead
// of through a debounce channel.

use std::fs;
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

const POINTER_FILE: &str = ".current";

/// One uploaded symbol file, cached in memory after the blob hits disk.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SymbolStoreEntry {
    pub name: String,
    pub uploaded_at: f64,
    pub blob: Vec<u8>,
}

/// One frame to be queued for transmission, as saved in a transmit list.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TransmitEntry {
    pub id: u32,
    pub extended: bool,
    pub remote: bool,
    pub data: Vec<u8>,
    pub label: Option<String>,
}

/// A named, ordered set of frames to transmit, keyed by symbol-file stem.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransmitListDocument {
    pub name: String,
    pub items: Vec<TransmitEntry>,
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Directory-backed key→blob store for uploaded symbol files, with a
/// pointer file naming the most recently loaded entry — reloaded at
/// startup the way `settings.rs` auto-reloads `default_catalog`.
pub struct SymbolStore {
    dir: PathBuf,
    current: RwLock<Option<SymbolStoreEntry>>,
}

impl SymbolStore {
    pub fn open(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let store = Self {
            dir,
            current: RwLock::new(None),
        };
        store.reload_pointer()?;
        Ok(store)
    }

    fn pointer_path(&self) -> PathBuf {
        self.dir.join(POINTER_FILE)
    }

    fn entry_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn reload_pointer(&self) -> std::io::Result<()> {
        let Ok(name) = fs::read_to_string(self.pointer_path()) else {
            return Ok(());
        };
        let name = name.trim();
        if name.is_empty() {
            return Ok(());
        }
        if let Ok(blob) = fs::read(self.entry_path(name)) {
            *self.current.write().unwrap() = Some(SymbolStoreEntry {
                name: name.to_string(),
                uploaded_at: now_secs(),
                blob,
            });
        }
        Ok(())
    }

    /// Writes `blob` under `name` and atomically becomes the current
    /// entry, replacing whatever was loaded before.
    pub fn upload(&self, name: impl Into<String>, blob: Vec<u8>) -> std::io::Result<()> {
        let name = name.into();
        fs::write(self.entry_path(&name), &blob)?;
        fs::write(self.pointer_path(), &name)?;
        *self.current.write().unwrap() = Some(SymbolStoreEntry {
            name,
            uploaded_at: now_secs(),
            blob,
        });
        Ok(())
    }

    pub fn current(&self) -> Option<SymbolStoreEntry> {
        self.current.read().unwrap().clone()
    }

    pub fn list(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|name| name != POINTER_FILE)
            .collect()
    }

    /// Removes `name` from disk. If it was the current entry, the pointer
    /// is cleared and no entry is current until the next `upload`.
    pub fn delete(&self, name: &str) -> std::io::Result<()> {
        let path = self.entry_path(name);
        if path.exists() {
            fs::remove_file(path)?;
        }
        let mut current = self.current.write().unwrap();
        if current.as_ref().map(|e| e.name.as_str()) == Some(name) {
            *current = None;
            let _ = fs::remove_file(self.pointer_path());
        }
        Ok(())
    }
}

/// Directory-backed store of named transmit-list documents, saved and
/// loaded as JSON files keyed by name (the symbol-file stem, per the Host
/// API's `save_transmit_list`/`load_transmit_list` contract).
pub struct TransmitListStore {
    dir: PathBuf,
}

impl TransmitListStore {
    pub fn open(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn doc_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    pub fn save(&self, name: &str, items: Vec<TransmitEntry>) -> std::io::Result<()> {
        let doc = TransmitListDocument {
            name: name.to_string(),
            items,
        };
        let text = serde_json::to_string_pretty(&doc)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        fs::write(self.doc_path(name), text)
    }

    pub fn load(&self, name: &str) -> std::io::Result<Vec<TransmitEntry>> {
        let text = fs::read_to_string(self.doc_path(name))?;
        let doc: TransmitListDocument = serde_json::from_str(&text)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        Ok(doc.items)
    }

    pub fn list(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter_map(|name| name.strip_suffix(".json").map(|s| s.to_string()))
            .collect()
    }
}
