//! Document views
//!
//! A `DocView` is a short-lived handle over a shared record. The decoded
//! document is an owned child of the view, produced lazily on first access
//! and dropped by `discard()` or destruction; the record's blob stays
//! authoritative until `commit()` re-serializes.
//!
//! Commit is change-detecting: when the re-serialized document has the same
//! size as the existing blob, the serializer streams against it and a
//! byte-identical result clears the view without bumping `updated_at` or
//! marking anything dirty.

use crate::codec;
use crate::database::DbInner;
use packdb_core::{
    now_utc_ms, DbError, DbResult, DbStatus, DocRef, DocumentMeta, Schema, SharedRecord,
};
use serde_json::{Map, Value};
use std::cell::{Cell, RefCell};
use std::sync::{Arc, Weak};

/// Write-through hook used in cache-off mode: persists the record
/// immediately after a successful commit.
pub(crate) type CommitSink = Arc<dyn Fn(&SharedRecord) -> DbResult<()> + Send + Sync>;

/// Short-lived, lazily-decoded, mutate-then-commit handle over a shared
/// document record.
///
/// Views may outlive their owning collection; a removed or dropped record
/// fails the next `commit()` with `NotFound` and is safe to `discard()`.
pub struct DocView {
    rec: Option<SharedRecord>,
    schema: Option<Arc<Schema>>,
    db: Weak<DbInner>,
    sink: Option<CommitSink>,
    decoded: RefCell<Option<Value>>,
    local_dirty: Cell<bool>,
}

impl DocView {
    pub(crate) fn new(
        rec: Option<SharedRecord>,
        schema: Option<Arc<Schema>>,
        db: Weak<DbInner>,
        sink: Option<CommitSink>,
    ) -> Self {
        DocView {
            rec,
            schema,
            db,
            sink,
            decoded: RefCell::new(None),
            local_dirty: Cell::new(false),
        }
    }

    /// A view with no backing record; reads yield nulls, commit fails.
    pub(crate) fn detached() -> Self {
        DocView::new(None, None, Weak::new(), None)
    }

    /// Whether this view has a backing record.
    pub fn exists(&self) -> bool {
        self.rec.is_some()
    }

    /// Snapshot of the record's metadata; defaults when detached.
    pub fn meta(&self) -> DocumentMeta {
        self.rec
            .as_ref()
            .map(|r| r.lock().meta.clone())
            .unwrap_or_default()
    }

    /// The record's id; empty when detached.
    pub fn id(&self) -> String {
        self.meta().id
    }

    fn record_status(&self, st: DbStatus) {
        if let Some(db) = self.db.upgrade() {
            db.record_status(st);
        }
    }

    fn track<T>(&self, r: DbResult<T>) -> DbResult<T> {
        self.record_status(DbStatus::from_result(&r));
        r
    }

    /// Decode the blob into the view's owned slot, if not already done.
    ///
    /// An absent record or empty blob decodes to an empty object. The
    /// schema's post-load hook runs once per decode.
    fn ensure_decoded(&self) -> DbResult<()> {
        if self.decoded.borrow().is_some() {
            return Ok(());
        }
        let mut value = match &self.rec {
            None => Value::Object(Map::new()),
            Some(rec) => {
                let guard = rec.lock();
                match codec::decode(&guard.blob) {
                    Ok(v) => v,
                    Err(e) => {
                        drop(guard);
                        self.record_status(e.status());
                        return Err(e);
                    }
                }
            }
        };
        if let (Some(schema), Value::Object(obj)) = (&self.schema, &mut value) {
            schema.run_post_load(obj);
        }
        *self.decoded.borrow_mut() = Some(value);
        Ok(())
    }

    /// Read a field by key. Missing fields, non-object roots, and decode
    /// failures all read as `Null`.
    pub fn get(&self, key: &str) -> Value {
        if self.ensure_decoded().is_err() {
            return Value::Null;
        }
        let slot = self.decoded.borrow();
        match slot.as_ref() {
            Some(Value::Object(obj)) => obj.get(key).cloned().unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }

    /// Read a positional element of an array-rooted document.
    pub fn get_index(&self, index: usize) -> Value {
        if self.ensure_decoded().is_err() {
            return Value::Null;
        }
        let slot = self.decoded.borrow();
        match slot.as_ref() {
            Some(Value::Array(arr)) => arr.get(index).cloned().unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }

    /// Read a field, converting to `T`, with a fallback for absent or
    /// mismatched values.
    pub fn get_or<T: serde::de::DeserializeOwned>(&self, key: &str, default: T) -> T {
        let v = self.get(key);
        if v.is_null() {
            return default;
        }
        serde_json::from_value(v).unwrap_or(default)
    }

    /// Write a field by key. Marks the view locally dirty; a non-object
    /// root makes this a no-op.
    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        if self.ensure_decoded().is_err() {
            return;
        }
        self.local_dirty.set(true);
        if let Some(Value::Object(obj)) = self.decoded.borrow_mut().as_mut() {
            obj.insert(key.to_string(), value.into());
        }
    }

    /// Write a positional element of an array-rooted document. Marks the
    /// view locally dirty; out-of-range indices and non-array roots are
    /// no-ops.
    pub fn set_index(&mut self, index: usize, value: impl Into<Value>) {
        if self.ensure_decoded().is_err() {
            return;
        }
        self.local_dirty.set(true);
        if let Some(Value::Array(arr)) = self.decoded.borrow_mut().as_mut() {
            if let Some(slot) = arr.get_mut(index) {
                *slot = value.into();
            }
        }
    }

    /// Remove a field by key. Marks the view locally dirty.
    pub fn remove_key(&mut self, key: &str) {
        if self.ensure_decoded().is_err() {
            return;
        }
        self.local_dirty.set(true);
        if let Some(Value::Object(obj)) = self.decoded.borrow_mut().as_mut() {
            obj.remove(key);
        }
    }

    /// Clone of the decoded document as an object; empty for non-object
    /// roots and detached views.
    pub fn as_object(&self) -> Map<String, Value> {
        if self.ensure_decoded().is_err() {
            return Map::new();
        }
        match self.decoded.borrow().as_ref() {
            Some(Value::Object(obj)) => obj.clone(),
            _ => Map::new(),
        }
    }

    /// Mutable access to the decoded object. Marks the view locally dirty.
    pub fn with_object_mut<R>(
        &mut self,
        f: impl FnOnce(&mut Map<String, Value>) -> R,
    ) -> DbResult<R> {
        self.ensure_decoded()?;
        let mut slot = self.decoded.borrow_mut();
        match slot.as_mut() {
            Some(Value::Object(obj)) => {
                self.local_dirty.set(true);
                Ok(f(obj))
            }
            _ => Err(DbError::invalid_argument("document root is not an object")),
        }
    }

    /// Replace the decoded document wholesale. Marks the view locally
    /// dirty.
    pub(crate) fn replace_object(&mut self, obj: Map<String, Value>) {
        *self.decoded.borrow_mut() = Some(Value::Object(obj));
        self.local_dirty.set(true);
    }

    pub(crate) fn is_locally_dirty(&self) -> bool {
        self.local_dirty.get()
    }

    /// Interpret a field as a document reference; invalid on any type
    /// mismatch.
    pub fn get_ref(&self, field: &str) -> DocRef {
        DocRef::from_value(&self.get(field))
    }

    /// Resolve the reference in `field` through the database, recursively
    /// populating nested references up to `max_depth`.
    ///
    /// `max_depth == 0` and non-reference fields are `InvalidArgument`;
    /// a failed lookup returns an empty view.
    pub fn populate(&self, field: &str, max_depth: u8) -> DbResult<DocView> {
        if max_depth == 0 {
            return self.track(Err(DbError::invalid_argument("max depth reached")));
        }
        let r = self.get_ref(field);
        if !r.is_valid() {
            return self.track(Err(DbError::invalid_argument(
                "field is not a document reference",
            )));
        }
        let db = match self.db.upgrade() {
            Some(db) => db,
            None => {
                return self.track(Err(DbError::invalid_argument(
                    "view is not attached to a database",
                )))
            }
        };
        match db.find_by_id(&r.collection, &r.id) {
            Ok(view) => {
                if max_depth > 1 {
                    for (key, value) in view.as_object() {
                        if DocRef::from_value(&value).is_valid() {
                            let _ = view.populate(&key, max_depth - 1);
                        }
                    }
                }
                Ok(view)
            }
            Err(_) => Ok(DocView::detached()),
        }
    }

    /// Serialize the decoded document back into the record.
    ///
    /// Nothing decoded is a no-op. A byte-identical re-serialization clears
    /// local dirt without touching the record. Otherwise the blob is
    /// replaced, `updated_at` bumped, and the record marked dirty; in
    /// cache-off mode the commit sink then persists it.
    pub fn commit(&mut self) -> DbResult<()> {
        if self.decoded.borrow().is_none() {
            return self.track(Ok(()));
        }
        let rec = match &self.rec {
            Some(r) => Arc::clone(r),
            None => return self.track(Err(DbError::invalid_argument("no backing record"))),
        };
        let value = self
            .decoded
            .borrow()
            .clone()
            .expect("decoded slot checked above");

        let changed = {
            let mut guard = rec.lock();
            if guard.meta.removed {
                return self.track(Err(DbError::not_found("document removed")));
            }
            let size = match codec::measure(&value) {
                Ok(s) => s,
                Err(e) => return self.track(Err(e)),
            };
            if size == guard.blob.len() {
                match codec::matches_blob(&value, &guard.blob) {
                    Ok(true) => {
                        self.local_dirty.set(false);
                        return self.track(Ok(()));
                    }
                    Ok(false) => {}
                    Err(e) => return self.track(Err(e)),
                }
            }
            if let Err(e) = codec::encode_into(&value, &mut guard.blob) {
                return self.track(Err(e));
            }
            guard.meta.updated_at = now_utc_ms();
            guard.meta.dirty = true;
            true
        };

        self.local_dirty.set(false);
        if changed {
            if let Some(sink) = &self.sink {
                return self.track(sink(&rec));
            }
        }
        self.track(Ok(()))
    }

    /// Drop the decoded document; the blob is unchanged.
    pub fn discard(&mut self) {
        *self.decoded.borrow_mut() = None;
        self.local_dirty.set(false);
    }
}

impl std::fmt::Debug for DocView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocView")
            .field("id", &self.id())
            .field("decoded", &self.decoded.borrow().is_some())
            .field("local_dirty", &self.local_dirty.get())
            .finish()
    }
}
