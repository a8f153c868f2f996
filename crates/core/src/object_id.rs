//! ObjectId-style document identifiers and typed document references
//!
//! Layout: 12 bytes → 24 lowercase hex characters.
//! 4 bytes big-endian seconds since epoch, 5 bytes device/random,
//! 3 bytes big-endian per-process counter (24-bit wrap, zero skipped).
//! A reasonable compromise between uniqueness and cost.

use crate::error::{DbError, DbResult};
use crate::time::now_utc_secs;
use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;

static COUNTER: AtomicU32 = AtomicU32::new(0);
static DEVICE_ID: OnceLock<[u8; 5]> = OnceLock::new();

fn device_bytes() -> [u8; 5] {
    *DEVICE_ID.get_or_init(|| {
        let raw = uuid::Uuid::new_v4();
        let b = raw.as_bytes();
        [b[0], b[1], b[2], b[3], b[4]]
    })
}

fn next_counter() -> u32 {
    let raw = COUNTER.fetch_add(1, Ordering::Relaxed);
    let c = raw.wrapping_add(1) & 0x00FF_FFFF;
    if c == 0 {
        1
    } else {
        c
    }
}

/// 12-byte document identifier, rendered as 24 lowercase hex characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId([u8; 12]);

impl ObjectId {
    /// Generate a fresh id from the clock, the process device bytes, and
    /// the per-process counter.
    pub fn new() -> Self {
        let mut b = [0u8; 12];
        b[0..4].copy_from_slice(&now_utc_secs().to_be_bytes());
        b[4..9].copy_from_slice(&device_bytes());
        let c = next_counter();
        b[9] = ((c >> 16) & 0xFF) as u8;
        b[10] = ((c >> 8) & 0xFF) as u8;
        b[11] = (c & 0xFF) as u8;
        ObjectId(b)
    }

    /// Lowercase 24-hex encoding.
    pub fn to_hex(&self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut out = String::with_capacity(24);
        for byte in self.0 {
            out.push(HEX[(byte >> 4) as usize] as char);
            out.push(HEX[(byte & 0x0F) as usize] as char);
        }
        out
    }

    /// Parse a 24-hex string. Rejects any other length and non-hex input.
    pub fn from_hex(hex: &str) -> DbResult<Self> {
        if hex.len() != 24 {
            return Err(DbError::invalid_argument(format!(
                "object id must be 24 hex chars, got {}",
                hex.len()
            )));
        }
        let mut b = [0u8; 12];
        let bytes = hex.as_bytes();
        for (i, out) in b.iter_mut().enumerate() {
            let hi = hex_nibble(bytes[i * 2])?;
            let lo = hex_nibble(bytes[i * 2 + 1])?;
            *out = (hi << 4) | lo;
        }
        Ok(ObjectId(b))
    }

    /// Seconds-since-epoch component of the id.
    pub fn timestamp_secs(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        ObjectId::new()
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

fn hex_nibble(c: u8) -> DbResult<u8> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(10 + c - b'a'),
        b'A'..=b'F' => Ok(10 + c - b'A'),
        _ => Err(DbError::invalid_argument("object id contains non-hex character")),
    }
}

/// Reference to a document in another collection.
///
/// Encoded inside a document as `{"collection": "...", "_id": "..."}`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocRef {
    /// Target collection name
    pub collection: String,
    /// Target document `_id`
    pub id: String,
}

impl DocRef {
    /// Build a reference from parts.
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        DocRef {
            collection: collection.into(),
            id: id.into(),
        }
    }

    /// A reference is valid iff both parts are non-empty.
    pub fn is_valid(&self) -> bool {
        !self.collection.is_empty() && !self.id.is_empty()
    }

    /// Decode a reference from a JSON value; anything that is not an object
    /// with string `collection` and `_id` fields yields an invalid ref.
    pub fn from_value(v: &Value) -> Self {
        let mut r = DocRef::default();
        if let Value::Object(obj) = v {
            if let Some(Value::String(col)) = obj.get("collection") {
                r.collection = col.clone();
            }
            if let Some(Value::String(id)) = obj.get("_id") {
                r.id = id.clone();
            }
        }
        r
    }

    /// Encode this reference as a JSON value.
    pub fn to_value(&self) -> Value {
        serde_json::json!({ "collection": self.collection, "_id": self.id })
    }
}
