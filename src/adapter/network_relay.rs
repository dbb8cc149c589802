// src/adapter/network_relay.rs
//
// NetworkRelay driver: an HTTP-polled upstream relay. `channel` is
// `host:port`; the driver connects, clears the relay's buffer once, then
// polls `/api/messages` on an interval, applying a high-water-mark on the
// server's frame timestamps so a re-poll never redelivers what it already
// saw. Grounded on the teacher's `io/modbus_tcp/reader.rs` poll-task shape
// (one background task, one interval timer, pushes into the pipeline) and
// on `reqwest` already being part of the teacher's dependency stack
// (`device_scan.rs` uses it for mDNS/HTTP probing elsewhere in the repo).
//
// The sync `AdapterDriver` contract is bridged to `reqwest`'s async client
// by giving the driver its own single-threaded tokio runtime, the same way
// the PCAN driver gives itself an OS thread for its blocking vendor calls.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;

use super::{AdapterDriver, Capabilities};
use crate::error::AdapterError;
use crate::frame::Frame;
use crate::symboldb::{DecodeResult, DecodedSignal};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_ERROR_LIMIT: u32 = 10;
const DEFAULT_PULL_COUNT: u32 = 64;

/// Parses the relay's flexible id encoding: a JSON number or a `"0x..."` /
/// bare-hex string.
fn parse_id_field(v: &Value) -> Option<u32> {
    match v {
        Value::Number(n) => n.as_u64().map(|n| n as u32),
        Value::String(s) => {
            let s = s.trim();
            let s = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
            u32::from_str_radix(s, 16).ok()
        }
        _ => None,
    }
}

/// Parses the relay's flexible data encoding: a byte array, or a hex string
/// with or without space separators.
fn parse_data_field(v: &Value) -> Option<Vec<u8>> {
    match v {
        Value::Array(items) => items
            .iter()
            .map(|b| b.as_u64().map(|b| b as u8))
            .collect::<Option<Vec<u8>>>(),
        Value::String(s) => {
            let cleaned: String = s.chars().filter(|c| !c.is_whitespace()).collect();
            if cleaned.len() % 2 != 0 {
                return None;
            }
            (0..cleaned.len())
                .step_by(2)
                .map(|i| u8::from_str_radix(&cleaned[i..i + 2], 16).ok())
                .collect()
        }
        _ => None,
    }
}

struct ParsedFrame {
    timestamp: f64,
    frame: Frame,
    decoded: Option<DecodeResult>,
}

/// Parses the relay's optional in-band decode: a message carried alongside
/// raw id/data may already have `message_name` and `signals[]` attached,
/// each signal a `{name, value}` pair with optional `raw`/`unit`/`scale`/`offset`.
fn parse_decoded_hint(v: &Value) -> Option<DecodeResult> {
    let message_name = v.get("message_name").and_then(Value::as_str)?.to_string();
    let signals = v
        .get("signals")
        .and_then(Value::as_array)?
        .iter()
        .filter_map(|s| {
            Some(DecodedSignal {
                name: s.get("name").and_then(Value::as_str)?.to_string(),
                value: s.get("value").and_then(Value::as_str)?.to_string(),
                raw: s.get("raw").and_then(Value::as_i64),
                unit: s.get("unit").and_then(Value::as_str).map(str::to_string),
                scale: s.get("scale").and_then(Value::as_f64),
                offset: s.get("offset").and_then(Value::as_f64),
            })
        })
        .collect();
    Some(DecodeResult { message_name, signals })
}

fn parse_message(v: &Value) -> Option<ParsedFrame> {
    let id = parse_id_field(v.get("id")?)?;
    let data = parse_data_field(v.get("data")?)?;
    let extended = v.get("is_extended").and_then(Value::as_bool).unwrap_or(false);
    let timestamp = v.get("timestamp").and_then(Value::as_f64).unwrap_or(0.0);
    Some(ParsedFrame {
        timestamp,
        frame: Frame::new(id, extended, false, data, timestamp),
        decoded: parse_decoded_hint(v),
    })
}

/// Sorts a batch by timestamp and drops anything at or below `high_water`,
/// per the relay contract's ordering and dedup rules.
fn filter_and_sort(mut batch: Vec<ParsedFrame>, high_water: f64) -> Vec<ParsedFrame> {
    batch.retain(|f| f.timestamp > high_water);
    batch.sort_by(|a, b| a.timestamp.partial_cmp(&b.timestamp).unwrap());
    batch
}

type RelayFrame = (Frame, Option<DecodeResult>);

pub struct NetworkRelayDriver {
    base_url: String,
    channel: String,
    baudrate: u32,
    poll_interval: Duration,
    error_limit: u32,
    client: reqwest::Client,
    rx: Mutex<Option<std_mpsc::Receiver<RelayFrame>>>,
    stop: Arc<AtomicBool>,
    last_error: Arc<Mutex<Option<String>>>,
    last_decoded: Mutex<Option<DecodeResult>>,
}

impl NetworkRelayDriver {
    pub fn new(host_port: &str, baudrate: u32) -> Result<Self, AdapterError> {
        if host_port.rsplit_once(':').is_none() {
            return Err(AdapterError::InvalidAddress(format!(
                "expected host:port, got '{host_port}'"
            )));
        }
        Ok(Self {
            base_url: format!("http://{host_port}"),
            channel: host_port.to_string(),
            baudrate,
            poll_interval: DEFAULT_POLL_INTERVAL,
            error_limit: DEFAULT_ERROR_LIMIT,
            client: reqwest::Client::new(),
            rx: Mutex::new(None),
            stop: Arc::new(AtomicBool::new(false)),
            last_error: Arc::new(Mutex::new(None)),
            last_decoded: Mutex::new(None),
        })
    }

    /// Takes the in-band decode the relay attached to the frame most
    /// recently returned by `poll`, if it carried one. Consumed exactly
    /// once per frame; the pump calls this right after a successful poll.
    pub fn take_decoded_hint(&self) -> Option<DecodeResult> {
        self.last_decoded.lock().unwrap().take()
    }

    /// Uploads a symbol file to the relay as a `text/plain` body.
    pub fn upload_symbols(&self, content: &[u8]) -> Result<(), AdapterError> {
        let rt = tokio::runtime::Runtime::new()
            .map_err(|e| AdapterError::ConnectionLost(e.to_string()))?;
        let url = format!("{}/api/dbc", self.base_url);
        let client = self.client.clone();
        let body = content.to_vec();
        rt.block_on(async move {
            client
                .post(&url)
                .header("Content-Type", "text/plain")
                .body(body)
                .send()
                .await
                .map_err(|e| AdapterError::ConnectionLost(e.to_string()))?
                .error_for_status()
                .map_err(|e| AdapterError::ConnectionLost(e.to_string()))
        })?;
        Ok(())
    }

    pub fn clear_symbols(&self) -> Result<(), AdapterError> {
        let rt = tokio::runtime::Runtime::new()
            .map_err(|e| AdapterError::ConnectionLost(e.to_string()))?;
        let url = format!("{}/api/dbc", self.base_url);
        let client = self.client.clone();
        rt.block_on(async move {
            client
                .delete(&url)
                .send()
                .await
                .map_err(|e| AdapterError::ConnectionLost(e.to_string()))
        })?;
        Ok(())
    }
}

impl AdapterDriver for NetworkRelayDriver {
    fn open(&mut self) -> Result<(), AdapterError> {
        let rt = tokio::runtime::Runtime::new()
            .map_err(|e| AdapterError::ConnectionLost(e.to_string()))?;
        let base_url = self.base_url.clone();
        let client = self.client.clone();
        let baudrate = self.baudrate;
        let channel_name = self
            .channel
            .rsplit_once(':')
            .map(|(h, _)| h.to_string())
            .unwrap_or_else(|| self.channel.clone());

        // Connect, clear the server buffer once, reset the high-water mark.
        rt.block_on(async {
            client
                .post(format!("{base_url}/api/connect"))
                .json(&serde_json::json!({"channel": channel_name, "baudrate": baudrate}))
                .send()
                .await
                .map_err(|e| AdapterError::ConnectionLost(e.to_string()))?
                .error_for_status()
                .map_err(|e| AdapterError::ConnectionLost(e.to_string()))?;
            client
                .delete(format!("{base_url}/api/messages"))
                .send()
                .await
                .map_err(|e| AdapterError::ConnectionLost(e.to_string()))
        })?;

        let (tx, rx) = std_mpsc::channel();
        let stop = self.stop.clone();
        let last_error = self.last_error.clone();
        let poll_interval = self.poll_interval;
        let error_limit = self.error_limit;

        std::thread::spawn(move || {
            rt.block_on(async move {
                let mut high_water = 0.0f64;
                let mut consecutive_errors = 0u32;
                while !stop.load(Ordering::Relaxed) {
                    let url = format!("{base_url}/api/messages?count={DEFAULT_PULL_COUNT}");
                    match client.get(&url).send().await {
                        Ok(resp) => match resp.json::<Value>().await {
                            Ok(body) => {
                                consecutive_errors = 0;
                                let items = body
                                    .get("messages")
                                    .and_then(Value::as_array)
                                    .cloned()
                                    .unwrap_or_default();
                                let parsed: Vec<ParsedFrame> =
                                    items.iter().filter_map(parse_message).collect();
                                let batch = filter_and_sort(parsed, high_water);
                                for pf in batch {
                                    high_water = high_water.max(pf.timestamp);
                                    if tx.send((pf.frame, pf.decoded)).is_err() {
                                        return;
                                    }
                                }
                            }
                            Err(_) => consecutive_errors += 1,
                        },
                        Err(_) => consecutive_errors += 1,
                    }
                    if consecutive_errors >= error_limit {
                        *last_error.lock().unwrap() =
                            Some("too many consecutive poll errors".to_string());
                        return;
                    }
                    tokio::time::sleep(poll_interval).await;
                }
            });
        });

        *self.rx.lock().unwrap() = Some(rx);
        Ok(())
    }

    fn close(&mut self) -> Result<(), AdapterError> {
        self.stop.store(true, Ordering::Relaxed);
        *self.rx.lock().unwrap() = None;
        Ok(())
    }

    fn transmit(&self, frame: &Frame) -> Result<(), AdapterError> {
        let rt = tokio::runtime::Runtime::new()
            .map_err(|e| AdapterError::ConnectionLost(e.to_string()))?;
        let url = format!("{}/api/messages", self.base_url);
        let client = self.client.clone();
        let body = serde_json::json!({
            "id": frame.id(),
            "data": frame.data(),
            "is_extended": frame.extended(),
        });
        rt.block_on(async move {
            client
                .post(&url)
                .json(&body)
                .send()
                .await
                .map_err(|e| AdapterError::TransmitFailed(e.to_string()))?
                .error_for_status()
                .map_err(|e| AdapterError::TransmitFailed(e.to_string()))
        })?;
        Ok(())
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_extended: true,
            supports_remote: false,
            max_dlc: 8,
        }
    }

    fn poll(&self, timeout: Duration) -> Result<Option<Frame>, AdapterError> {
        let guard = self.rx.lock().unwrap();
        match guard.as_ref() {
            Some(rx) => match rx.recv_timeout(timeout) {
                Ok((frame, decoded)) => {
                    *self.last_decoded.lock().unwrap() = decoded;
                    Ok(Some(frame))
                }
                Err(std_mpsc::RecvTimeoutError::Timeout) => Ok(None),
                Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                    let reason = self
                        .last_error
                        .lock()
                        .unwrap()
                        .clone()
                        .unwrap_or_else(|| "poll loop ended".to_string());
                    Err(AdapterError::ConnectionLost(reason))
                }
            },
            None => Err(AdapterError::InvalidConfig("relay not connected".into())),
        }
    }
}
