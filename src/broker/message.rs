//! Message envelope and its on-disk record.

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

use crate::error::{Error, Result};

/// Last timestamp handed out in this process (unix micros).
static LAST_STAMP: AtomicI64 = AtomicI64::new(0);

/// File format of a pending message: `{key, creation_date, message}`.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct MessageRecord {
    pub key: String,
    pub creation_date: String,
    pub message: Value,
}

/// A routed message. Fields are fixed once the message exists.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    key: String,
    payload: Value,
    creation_timestamp: String,
    valid: bool,
    path: Option<PathBuf>,
}

impl Message {
    /// Create a message stamped with the current wall-clock time.
    pub fn new(key: impl Into<String>, payload: Value) -> Self {
        Self {
            key: key.into(),
            payload,
            creation_timestamp: format_timestamp(next_stamp()),
            valid: true,
            path: None,
        }
    }

    /// Create a message from any serializable payload.
    pub fn from_serializable<T: Serialize + ?Sized>(key: impl Into<String>, payload: &T) -> Result<Self> {
        Ok(Self::new(key, serde_json::to_value(payload)?))
    }

    /// Placeholder for a message file that could not be read.
    pub fn invalid(path: impl Into<PathBuf>) -> Self {
        Self {
            key: String::new(),
            payload: Value::Null,
            creation_timestamp: String::new(),
            valid: false,
            path: Some(path.into()),
        }
    }

    /// Read a message file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let record: MessageRecord =
            serde_json::from_str(&content).map_err(|e| Error::malformed(path, e))?;

        if parse_timestamp(&record.creation_date).is_none() {
            return Err(Error::malformed(
                path,
                format!("bad creation_date '{}'", record.creation_date),
            ));
        }

        tracing::debug!("Loaded message {} from {}", record.creation_date, path.display());
        Ok(Self {
            key: record.key,
            payload: record.message,
            creation_timestamp: record.creation_date,
            valid: true,
            path: Some(path.to_path_buf()),
        })
    }

    /// Write this message as a pretty-printed record. Never replaces an
    /// existing file.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(&self.to_record())?;
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        file.write_all(content.as_bytes())?;
        Ok(())
    }

    pub fn to_record(&self) -> MessageRecord {
        MessageRecord {
            key: self.key.clone(),
            creation_date: self.creation_timestamp.clone(),
            message: self.payload.clone(),
        }
    }

    /// File name used when the message is appended to a queue.
    pub fn file_name(&self) -> String {
        format!("{}.json", self.creation_timestamp)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn into_payload(self) -> Value {
        self.payload
    }

    /// Deserialize the payload into a concrete type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    pub fn creation_timestamp(&self) -> &str {
        &self.creation_timestamp
    }

    /// Creation timestamp in unix microseconds.
    pub fn creation_micros(&self) -> Option<i64> {
        parse_timestamp(&self.creation_timestamp)
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Backing file this message was loaded from, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

/// Current time in unix micros, strictly increasing within the process.
fn next_stamp() -> i64 {
    let now = Utc::now().timestamp_micros();
    let mut last = LAST_STAMP.load(Ordering::Relaxed);
    loop {
        let candidate = if now > last { now } else { last + 1 };
        match LAST_STAMP.compare_exchange_weak(last, candidate, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return candidate,
            Err(actual) => last = actual,
        }
    }
}

/// Render unix micros as `<secs>.<micros>`.
pub fn format_timestamp(micros: i64) -> String {
    format!("{}.{:06}", micros.div_euclid(1_000_000), micros.rem_euclid(1_000_000))
}

/// Parse `<secs>[.<fraction>]` into unix micros. Fractions shorter than six
/// digits are right-padded; longer ones are truncated.
pub fn parse_timestamp(s: &str) -> Option<i64> {
    let (secs, frac) = s.split_once('.').unwrap_or((s, ""));
    if secs.is_empty() || !secs.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if !frac.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let secs: i64 = secs.parse().ok()?;
    let mut digits: String = frac.chars().take(6).collect();
    while digits.len() < 6 {
        digits.push('0');
    }
    let micros: i64 = digits.parse().ok()?;

    secs.checked_mul(1_000_000)?.checked_add(micros)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_message() {
        let msg = Message::new("orders", json!({"id": 1}));

        assert_eq!(msg.key(), "orders");
        assert_eq!(msg.payload(), &json!({"id": 1}));
        assert!(msg.is_valid());
        assert!(msg.creation_micros().unwrap() > 0);
        assert!(msg.path().is_none());
    }

    #[test]
    fn test_stamps_strictly_increase() {
        let stamps: Vec<i64> = (0..1000)
            .map(|_| Message::new("k", Value::Null).creation_micros().unwrap())
            .collect();

        assert!(stamps.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_timestamp_format() {
        assert_eq!(format_timestamp(1_700_000_000_000_042), "1700000000.000042");
        assert_eq!(parse_timestamp("1700000000.000042"), Some(1_700_000_000_000_042));
        // Short fractions as written by older brokers.
        assert_eq!(parse_timestamp("1700000000.5"), Some(1_700_000_000_500_000));
        assert_eq!(parse_timestamp("1700000000"), Some(1_700_000_000_000_000));
        assert_eq!(parse_timestamp("1700000000.1234567"), Some(1_700_000_000_123_456));
        assert_eq!(parse_timestamp("abc"), None);
        assert_eq!(parse_timestamp(".5"), None);
        assert_eq!(parse_timestamp("12.3x"), None);
    }

    #[test]
    fn test_write_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let msg = Message::new("orders", json!({"qty": 3, "sku": "A-1"}));
        let path = dir.path().join(msg.file_name());

        msg.write_to(&path).unwrap();
        let raw: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["key"], "orders");
        assert_eq!(raw["creation_date"], msg.creation_timestamp());
        assert_eq!(raw["message"]["sku"], "A-1");

        let loaded = Message::load(&path).unwrap();
        assert_eq!(loaded.key(), msg.key());
        assert_eq!(loaded.payload(), msg.payload());
        assert_eq!(loaded.creation_timestamp(), msg.creation_timestamp());
        assert_eq!(loaded.path(), Some(path.as_path()));
    }

    #[test]
    fn test_write_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let msg = Message::new("orders", json!("first"));
        let path = dir.path().join(msg.file_name());
        msg.write_to(&path).unwrap();

        let err = msg.write_to(&path).unwrap_err();
        assert!(matches!(err, Error::Io(ref e) if e.kind() == std::io::ErrorKind::AlreadyExists));
        assert_eq!(Message::load(&path).unwrap().payload(), &json!("first"));
    }

    #[test]
    fn test_load_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1.json");

        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(Message::load(&path), Err(Error::MalformedMessage { .. })));

        fs::write(&path, r#"{"key": "k", "message": 1}"#).unwrap();
        assert!(matches!(Message::load(&path), Err(Error::MalformedMessage { .. })));

        fs::write(&path, r#"{"key": "k", "creation_date": "soon", "message": 1}"#).unwrap();
        assert!(matches!(Message::load(&path), Err(Error::MalformedMessage { .. })));
    }

    #[test]
    fn test_payload_as() {
        #[derive(Deserialize, Serialize, PartialEq, Debug)]
        struct Trade {
            symbol: String,
            price: f64,
        }

        let trade = Trade { symbol: "BTC".into(), price: 1.5 };
        let msg = Message::from_serializable("trades", &trade).unwrap();
        assert_eq!(msg.payload_as::<Trade>().unwrap(), trade);
    }

    #[test]
    fn test_invalid_message() {
        let msg = Message::invalid("/tmp/x.json");
        assert!(!msg.is_valid());
        assert_eq!(msg.payload(), &Value::Null);
        assert_eq!(msg.path(), Some(Path::new("/tmp/x.json")));
    }
}
