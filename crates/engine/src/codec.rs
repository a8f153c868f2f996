//! Document codec
//!
//! Documents are canonical MessagePack objects with no framing and no
//! checksum. Serialization is a two-pass contract: a measure pass computes
//! the exact byte size, then the serialize pass must produce exactly that
//! many bytes. The same streaming machinery drives the change detector:
//! re-serializing against the existing blob byte-by-byte decides whether a
//! commit actually changed anything without allocating a second buffer.
//!
//! Failure policy: serialize failures are `IoError`, decode failures are
//! `Corrupted`.

use packdb_core::{DbError, DbResult};
use serde_json::Value;
use std::io::{self, Write};

/// Sink that only counts bytes.
struct CountingWriter {
    written: usize,
}

impl Write for CountingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.written += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Sink writing into a fixed slice; refuses to grow past its capacity.
struct SliceWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl Write for SliceWriter<'_> {
    fn write(&mut self, chunk: &[u8]) -> io::Result<usize> {
        if self.pos + chunk.len() > self.buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "serialized output exceeds measured size",
            ));
        }
        self.buf[self.pos..self.pos + chunk.len()].copy_from_slice(chunk);
        self.pos += chunk.len();
        Ok(chunk.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Sink comparing the stream against an expected byte string.
///
/// Aborts the serializer with a marker error on the first mismatch so a
/// changed document is detected without finishing the pass.
struct CompareWriter<'a> {
    expected: &'a [u8],
    pos: usize,
    mismatch: bool,
}

impl Write for CompareWriter<'_> {
    fn write(&mut self, chunk: &[u8]) -> io::Result<usize> {
        let end = self.pos + chunk.len();
        if end > self.expected.len() || self.expected[self.pos..end] != *chunk {
            self.mismatch = true;
            return Err(io::Error::new(io::ErrorKind::Other, "blob mismatch"));
        }
        self.pos = end;
        Ok(chunk.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Size of the MessagePack encoding of `value`, in bytes.
pub fn measure(value: &Value) -> DbResult<usize> {
    let mut counter = CountingWriter { written: 0 };
    rmp_serde::encode::write(&mut counter, value)
        .map_err(|e| DbError::io(format!("measure msgpack failed: {}", e)))?;
    Ok(counter.written)
}

/// Serialize `value` into `buf`, resizing it to the measured size.
///
/// The serialize pass must produce exactly the measured byte count;
/// anything else is an `IoError`.
pub fn encode_into(value: &Value, buf: &mut Vec<u8>) -> DbResult<()> {
    let size = measure(value)?;
    buf.resize(size, 0);
    let mut writer = SliceWriter { buf, pos: 0 };
    rmp_serde::encode::write(&mut writer, value)
        .map_err(|e| DbError::io(format!("serialize msgpack failed: {}", e)))?;
    if writer.pos != size {
        return Err(DbError::io("serialize msgpack size mismatch"));
    }
    Ok(())
}

/// Serialize `value` to a fresh buffer.
pub fn encode(value: &Value) -> DbResult<Vec<u8>> {
    let mut buf = Vec::new();
    encode_into(value, &mut buf)?;
    Ok(buf)
}

/// Whether serializing `value` reproduces `existing` byte-for-byte.
///
/// Callers check sizes first; this streams the serializer against the
/// existing blob and short-circuits on the first differing byte.
pub fn matches_blob(value: &Value, existing: &[u8]) -> DbResult<bool> {
    let mut writer = CompareWriter {
        expected: existing,
        pos: 0,
        mismatch: false,
    };
    match rmp_serde::encode::write(&mut writer, value) {
        Ok(()) => Ok(writer.pos == existing.len()),
        Err(_) if writer.mismatch => Ok(false),
        Err(e) => Err(DbError::io(format!("compare msgpack failed: {}", e))),
    }
}

/// Decode a blob into a document value.
///
/// An empty blob is logically an empty object. A blob that fails to decode
/// is `Corrupted`.
pub fn decode(blob: &[u8]) -> DbResult<Value> {
    if blob.is_empty() {
        return Ok(Value::Object(serde_json::Map::new()));
    }
    rmp_serde::from_slice(blob).map_err(|_| DbError::corrupted("msgpack decode failed"))
}
