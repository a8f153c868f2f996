//! In-memory document records
//!
//! A record is the owning container of a document: its metadata plus the
//! MessagePack blob. The blob is the authoritative representation; any
//! decoded form is a cache owned by a view.
//!
//! Records are shared between a collection's cache and any live views via
//! [`SharedRecord`]; the `removed` flag is the cooperative invalidation
//! channel — once set it never clears, and a view must fail its next
//! commit.

use crate::object_id::ObjectId;
use crate::time::now_utc_ms;
use parking_lot::Mutex;
use std::sync::Arc;

/// Metadata attached to every document record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentMeta {
    /// 24-hex ObjectId, assigned at create time, immutable
    pub id: String,
    /// UTC milliseconds
    pub created_at: u64,
    /// UTC milliseconds
    pub updated_at: u64,
    /// True iff the blob differs from the last persisted version
    pub dirty: bool,
    /// One-way tombstone flag; a view of a removed record fails commit
    pub removed: bool,
}

/// Owning container of `{meta, blob}`.
///
/// An empty blob is logically an empty object.
#[derive(Debug, Clone, Default)]
pub struct DocumentRecord {
    /// Record metadata
    pub meta: DocumentMeta,
    /// MessagePack bytes; authoritative
    pub blob: Vec<u8>,
}

impl DocumentRecord {
    /// Allocate a fresh record: new id, timestamps set to now, dirty.
    pub fn fresh() -> Self {
        let now = now_utc_ms();
        DocumentRecord {
            meta: DocumentMeta {
                id: ObjectId::new().to_hex(),
                created_at: now,
                updated_at: now,
                dirty: true,
                removed: false,
            },
            blob: Vec::new(),
        }
    }

    /// Build a record for a document loaded from disk.
    ///
    /// Timestamps are reset to now: the on-disk format carries no metadata,
    /// so load time is the best available approximation.
    pub fn loaded(id: impl Into<String>, blob: Vec<u8>) -> Self {
        let now = now_utc_ms();
        DocumentRecord {
            meta: DocumentMeta {
                id: id.into(),
                created_at: now,
                updated_at: now,
                dirty: false,
                removed: false,
            },
            blob,
        }
    }

    /// Wrap into the shared handle used by caches and views.
    pub fn into_shared(self) -> SharedRecord {
        Arc::new(Mutex::new(self))
    }
}

/// Shared ownership handle over a record.
///
/// Lifetime is that of the longest holder: the collection cache entry or
/// any outstanding view.
pub type SharedRecord = Arc<Mutex<DocumentRecord>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_record_is_dirty_with_id() {
        let r = DocumentRecord::fresh();
        assert_eq!(r.meta.id.len(), 24);
        assert!(r.meta.dirty);
        assert!(!r.meta.removed);
        assert_eq!(r.meta.created_at, r.meta.updated_at);
        assert!(r.blob.is_empty());
    }

    #[test]
    fn loaded_record_is_clean() {
        let r = DocumentRecord::loaded("0123456789abcdef01234567", vec![0x80]);
        assert!(!r.meta.dirty);
        assert_eq!(r.blob, vec![0x80]);
    }

    #[test]
    fn shared_record_is_mutable_through_handle() {
        let shared = DocumentRecord::fresh().into_shared();
        {
            let mut rec = shared.lock();
            rec.meta.removed = true;
        }
        assert!(shared.lock().meta.removed);
    }
}
