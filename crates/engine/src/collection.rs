//! Collections
//!
//! A collection is an in-memory cache plus a filesystem-backed store for
//! one named group of documents. In cache mode, mutations mark records
//! dirty and deletions tombstone ids; the periodic flush pushes both to
//! disk. In cache-off mode nothing is retained: reads go to disk and every
//! mutation writes through immediately via the views' commit sink.
//!
//! Lock discipline: the collection lock guards `records`, `tombstones`,
//! `dirty`, and `cache_enabled`. It is acquired after the database lock and
//! before any record lock; disk scans (cache-off unique check, cache-off
//! find/update) run without it.

use crate::codec;
use crate::database::DbInner;
use crate::fs::{FsCoordinator, DOC_EXT};
use crate::vfs::join_path;
use crate::view::DocView;
use packdb_core::{
    DbError, DbEvent, DbResult, DbStatus, DocumentRecord, Schema, SharedRecord,
};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

struct CollectionState {
    records: BTreeMap<String, SharedRecord>,
    tombstones: Vec<String>,
    dirty: bool,
    cache_enabled: bool,
}

/// A named group of documents stored as files in one directory.
pub struct Collection {
    name: String,
    schema: Arc<Schema>,
    base_dir: String,
    fs: FsCoordinator,
    db: Weak<DbInner>,
    state: Mutex<CollectionState>,
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection").field("name", &self.name).finish()
    }
}

impl Collection {
    pub(crate) fn new(
        name: impl Into<String>,
        schema: Arc<Schema>,
        base_dir: impl Into<String>,
        cache_enabled: bool,
        fs: FsCoordinator,
        db: Weak<DbInner>,
    ) -> Self {
        Collection {
            name: name.into(),
            schema,
            base_dir: base_dir.into(),
            fs,
            db,
            state: Mutex::new(CollectionState {
                records: BTreeMap::new(),
                tombstones: Vec::new(),
                dirty: false,
                cache_enabled,
            }),
        }
    }

    /// Collection name; doubles as the on-disk subdirectory.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The schema this collection validates against.
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Whether any record is dirty or any tombstone is pending.
    pub fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }

    /// Whether the in-memory cache is enabled.
    pub fn cache_enabled(&self) -> bool {
        self.state.lock().cache_enabled
    }

    fn dir(&self) -> String {
        join_path(&self.base_dir, &self.name)
    }

    fn doc_path(&self, id: &str) -> String {
        join_path(&self.dir(), &format!("{}{}", id, DOC_EXT))
    }

    fn track<T>(&self, r: DbResult<T>) -> DbResult<T> {
        if let Some(db) = self.db.upgrade() {
            db.record_status(DbStatus::from_result(&r));
        }
        r
    }

    fn emit(&self, ev: DbEvent) {
        if let Some(db) = self.db.upgrade() {
            db.emit_event(ev);
        }
    }

    fn view_over(&self, rec: SharedRecord) -> DocView {
        DocView::new(Some(rec), Some(Arc::clone(&self.schema)), self.db.clone(), None)
    }

    /// Build a view; in cache-off mode it carries a commit sink that
    /// persists the record immediately on successful commit.
    fn make_view(&self, rec: SharedRecord, cache_enabled: bool) -> DocView {
        if cache_enabled {
            return self.view_over(rec);
        }
        let fs = self.fs.clone();
        let dir = self.dir();
        let sink = Arc::new(move |record: &SharedRecord| persist_record(&fs, &dir, record));
        DocView::new(
            Some(rec),
            Some(Arc::clone(&self.schema)),
            self.db.clone(),
            Some(sink),
        )
    }

    fn persist_immediate(&self, rec: &SharedRecord) -> DbResult<()> {
        persist_record(&self.fs, &self.dir(), rec)
    }

    fn read_doc_from_file(&self, id: &str) -> DbResult<SharedRecord> {
        let bytes = self.fs.read_file(&self.doc_path(id))?;
        Ok(DocumentRecord::loaded(id, bytes).into_shared())
    }

    // ========================================================================
    // Create
    // ========================================================================

    /// Create a document from an object. Returns the new id.
    pub fn create(&self, data: &Map<String, Value>) -> DbResult<String> {
        let result = self.create_inner(data);
        if result.is_ok() {
            self.emit(DbEvent::DocumentCreated);
        }
        self.track(result)
    }

    fn create_inner(&self, data: &Map<String, Value>) -> DbResult<String> {
        let mut doc = data.clone();
        if self.schema.has_validate() {
            self.schema.run_pre_save(&mut doc)?;
        }

        if self.cache_enabled() {
            let mut state = self.state.lock();
            check_unique_cached(&state.records, &self.schema, &doc, "")?;
            let mut record = DocumentRecord::fresh();
            codec::encode_into(&Value::Object(doc), &mut record.blob)?;
            let id = record.meta.id.clone();
            state.records.insert(id.clone(), record.into_shared());
            state.dirty = true;
            Ok(id)
        } else {
            self.check_unique_on_disk(&doc, "")?;
            let mut record = DocumentRecord::fresh();
            codec::encode_into(&Value::Object(doc), &mut record.blob)?;
            let id = record.meta.id.clone();
            let rec = record.into_shared();
            self.persist_immediate(&rec)?;
            Ok(id)
        }
    }

    /// Create a document from a JSON value; the value must be an object.
    pub fn create_value(&self, data: &Value) -> DbResult<String> {
        match data.as_object() {
            Some(obj) => self.create(obj),
            None => self.track(Err(DbError::invalid_argument("document must be an object"))),
        }
    }

    /// Bulk create from an array of objects. Non-object entries are
    /// skipped; returns the list of created ids.
    pub fn create_many(&self, arr: &[Value]) -> DbResult<Vec<String>> {
        let mut ids = Vec::with_capacity(arr.len());
        for entry in arr {
            let Some(obj) = entry.as_object() else {
                continue;
            };
            if let Ok(id) = self.create(obj) {
                ids.push(id);
            }
        }
        self.track(Ok(ids))
    }

    /// Bulk create from a JSON value; the value must be an array.
    pub fn create_many_value(&self, data: &Value) -> DbResult<Vec<String>> {
        match data.as_array() {
            Some(arr) => self.create_many(arr),
            None => self.track(Err(DbError::invalid_argument(
                "document must be an array of objects",
            ))),
        }
    }

    // ========================================================================
    // Find
    // ========================================================================

    /// Find a document by id.
    ///
    /// Cache hits return a view sharing the cached record; misses read the
    /// file and, in cache mode, insert the loaded record into the cache.
    pub fn find_by_id(&self, id: &str) -> DbResult<DocView> {
        let cache_enabled = {
            let state = self.state.lock();
            if state.cache_enabled {
                if let Some(rec) = state.records.get(id) {
                    let view = self.view_over(Arc::clone(rec));
                    drop(state);
                    return self.track(Ok(view));
                }
                // Tombstoned ids are gone even though the file survives
                // until the next flush
                if state.tombstones.iter().any(|t| t == id) {
                    drop(state);
                    return self.track(Err(DbError::not_found("document not found")));
                }
            }
            state.cache_enabled
        };

        let rec = match self.read_doc_from_file(id) {
            Ok(rec) => rec,
            Err(e) => return self.track(Err(e)),
        };
        let rec = if cache_enabled {
            let mut state = self.state.lock();
            Arc::clone(
                state
                    .records
                    .entry(id.to_string())
                    .or_insert_with(|| Arc::clone(&rec)),
            )
        } else {
            rec
        };
        self.track(Ok(self.make_view(rec, cache_enabled)))
    }

    /// All documents matching the predicate.
    pub fn find_many(&self, pred: impl Fn(&DocView) -> bool) -> DbResult<Vec<DocView>> {
        let mut out = Vec::new();
        if self.cache_enabled() {
            let state = self.state.lock();
            for rec in state.records.values() {
                let view = self.view_over(Arc::clone(rec));
                if pred(&view) {
                    out.push(view);
                }
            }
        } else {
            for id in self.fs.list_doc_ids(&self.dir())? {
                let Ok(rec) = self.read_doc_from_file(&id) else {
                    continue;
                };
                let view = self.make_view(rec, false);
                if pred(&view) {
                    out.push(view);
                }
            }
        }
        self.track(Ok(out))
    }

    /// First document matching the predicate, or `NotFound`.
    pub fn find_one(&self, pred: impl Fn(&DocView) -> bool) -> DbResult<DocView> {
        if self.cache_enabled() {
            let mut found = None;
            let state = self.state.lock();
            for rec in state.records.values() {
                let view = self.view_over(Arc::clone(rec));
                if pred(&view) {
                    found = Some(view);
                    break;
                }
            }
            drop(state);
            if let Some(view) = found {
                return self.track(Ok(view));
            }
        } else {
            for id in self.fs.list_doc_ids(&self.dir())? {
                let Ok(rec) = self.read_doc_from_file(&id) else {
                    continue;
                };
                let view = self.make_view(rec, false);
                if pred(&view) {
                    return self.track(Ok(view));
                }
            }
        }
        self.track(Err(DbError::not_found("document not found")))
    }

    /// First document whose fields equal every `{key, value}` pair of the
    /// filter, or `NotFound`.
    pub fn find_one_filter(&self, filter: &Map<String, Value>) -> DbResult<DocView> {
        self.find_one(|v| filter_matches(v, filter))
    }

    // ========================================================================
    // Update
    // ========================================================================

    /// Re-run schema validation and the unique check on the mutated view,
    /// discarding its changes on rejection. The validated (defaults
    /// applied) object is written back into the view.
    fn revalidate_cached(
        &self,
        state: &CollectionState,
        view: &mut DocView,
        self_id: &str,
    ) -> DbResult<()> {
        if !self.schema.has_validate() {
            return Ok(());
        }
        let mut obj = view.as_object();
        if let Err(e) = self.schema.run_pre_save(&mut obj) {
            view.discard();
            return Err(e);
        }
        if let Err(e) = check_unique_cached(&state.records, &self.schema, &obj, self_id) {
            view.discard();
            return Err(e);
        }
        view.replace_object(obj);
        Ok(())
    }

    /// Cache-off counterpart of [`Self::revalidate_cached`].
    fn revalidate_on_disk(&self, view: &mut DocView, self_id: &str) -> DbResult<()> {
        if !self.schema.has_validate() {
            return Ok(());
        }
        let mut obj = view.as_object();
        if let Err(e) = self.schema.run_pre_save(&mut obj) {
            view.discard();
            return Err(e);
        }
        if let Err(e) = self.check_unique_on_disk(&obj, self_id) {
            view.discard();
            return Err(e);
        }
        view.replace_object(obj);
        Ok(())
    }

    /// Update a document by id through a mutator closure.
    pub fn update_by_id(&self, id: &str, mutator: impl FnOnce(&mut DocView)) -> DbResult<()> {
        let result = self.update_by_id_inner(id, mutator);
        if let Ok(true) = result {
            self.emit(DbEvent::DocumentUpdated);
        }
        self.track(result.map(|_| ()))
    }

    fn update_by_id_inner(
        &self,
        id: &str,
        mutator: impl FnOnce(&mut DocView),
    ) -> DbResult<bool> {
        if self.cache_enabled() {
            let mut state = self.state.lock();
            let rec = state
                .records
                .get(id)
                .cloned()
                .ok_or_else(|| DbError::not_found("document not found"))?;
            let mut view = self.view_over(Arc::clone(&rec));
            mutator(&mut view);
            self.revalidate_cached(&state, &mut view, id)?;
            view.commit()?;
            let updated = rec.lock().meta.dirty;
            if updated {
                state.dirty = true;
            }
            Ok(updated)
        } else {
            let rec = self.read_doc_from_file(id)?;
            let mut view = self.make_view(Arc::clone(&rec), false);
            mutator(&mut view);
            self.revalidate_on_disk(&mut view, id)?;
            view.commit()?;
            Ok(true)
        }
    }

    /// Update the first document matching the predicate; with `create`,
    /// upsert a new document when nothing matches.
    pub fn update_one(
        &self,
        pred: impl Fn(&DocView) -> bool,
        mutator: impl Fn(&mut DocView),
        create: bool,
    ) -> DbResult<()> {
        self.update_one_impl(&pred, &mutator, &mutator, create)
    }

    /// Update the first document matching a JSON filter with a JSON patch;
    /// with `create`, upsert a document seeded from filter then patch.
    pub fn update_one_filter(
        &self,
        filter: &Map<String, Value>,
        patch: &Map<String, Value>,
        create: bool,
    ) -> DbResult<()> {
        let pred = |v: &DocView| filter_matches(v, filter);
        let apply = |v: &mut DocView| apply_patch(v, patch);
        let seed = |v: &mut DocView| {
            apply_patch(v, filter);
            apply_patch(v, patch);
        };
        self.update_one_impl(&pred, &apply, &seed, create)
    }

    fn update_one_impl(
        &self,
        pred: &dyn Fn(&DocView) -> bool,
        apply: &dyn Fn(&mut DocView),
        seed: &dyn Fn(&mut DocView),
        create: bool,
    ) -> DbResult<()> {
        let result = self.update_one_inner(pred, apply, seed, create);
        match &result {
            Ok((_, true)) => self.emit(DbEvent::DocumentCreated),
            Ok((true, _)) => self.emit(DbEvent::DocumentUpdated),
            _ => {}
        }
        self.track(result.map(|_| ()))
    }

    fn update_one_inner(
        &self,
        pred: &dyn Fn(&DocView) -> bool,
        apply: &dyn Fn(&mut DocView),
        seed: &dyn Fn(&mut DocView),
        create: bool,
    ) -> DbResult<(bool, bool)> {
        let mut matched = false;
        let mut updated = false;

        if self.cache_enabled() {
            let mut state = self.state.lock();
            for (id, rec) in &state.records {
                let mut view = self.view_over(Arc::clone(rec));
                if !pred(&view) {
                    continue;
                }
                matched = true;
                apply(&mut view);
                self.revalidate_cached(&state, &mut view, id)?;
                view.commit()?;
                updated = rec.lock().meta.dirty;
                break;
            }
            if updated {
                state.dirty = true;
            }
            if !matched && create {
                let rec = DocumentRecord::fresh().into_shared();
                let id = rec.lock().meta.id.clone();
                let mut view = self.view_over(Arc::clone(&rec));
                let _ = view.as_object();
                seed(&mut view);
                self.revalidate_cached(&state, &mut view, &id)?;
                view.commit()?;
                state.records.insert(id, rec);
                state.dirty = true;
                return Ok((false, true));
            }
        } else {
            for id in self.fs.list_doc_ids(&self.dir())? {
                let Ok(rec) = self.read_doc_from_file(&id) else {
                    continue;
                };
                let mut view = self.make_view(rec, false);
                if !pred(&view) {
                    continue;
                }
                matched = true;
                apply(&mut view);
                self.revalidate_on_disk(&mut view, &id)?;
                view.commit()?;
                updated = true;
                break;
            }
            if !matched && create {
                let rec = DocumentRecord::fresh().into_shared();
                let id = rec.lock().meta.id.clone();
                let mut view = self.make_view(Arc::clone(&rec), false);
                let _ = view.as_object();
                seed(&mut view);
                self.revalidate_on_disk(&mut view, &id)?;
                view.commit()?;
                return Ok((false, true));
            }
        }

        if !matched {
            return Err(DbError::not_found("document not found"));
        }
        Ok((updated, false))
    }

    /// Update every document matching the predicate. Documents failing
    /// re-validation are skipped. Returns the number of commits.
    pub fn update_many(
        &self,
        pred: impl Fn(&DocView) -> bool,
        mutator: impl Fn(&mut DocView),
    ) -> DbResult<usize> {
        let mut count = 0;
        if self.cache_enabled() {
            let mut state = self.state.lock();
            for (id, rec) in &state.records {
                let mut view = self.view_over(Arc::clone(rec));
                if !pred(&view) {
                    continue;
                }
                mutator(&mut view);
                if self.revalidate_cached(&state, &mut view, id).is_err() {
                    continue;
                }
                if view.commit().is_ok() {
                    count += 1;
                }
            }
            if count > 0 {
                state.dirty = true;
            }
        } else {
            for id in self.fs.list_doc_ids(&self.dir())? {
                let Ok(rec) = self.read_doc_from_file(&id) else {
                    continue;
                };
                let mut view = self.make_view(rec, false);
                if !pred(&view) {
                    continue;
                }
                mutator(&mut view);
                if self.revalidate_on_disk(&mut view, &id).is_err() {
                    continue;
                }
                if view.commit().is_ok() {
                    count += 1;
                }
            }
        }
        self.track(Ok(count))
    }

    /// Update via a selecting mutator: the closure mutates the view and
    /// returns whether it selected the document; unselected views are
    /// discarded.
    pub fn update_many_mut(&self, selector: impl Fn(&mut DocView) -> bool) -> DbResult<usize> {
        let mut count = 0;
        if self.cache_enabled() {
            let mut state = self.state.lock();
            for (id, rec) in &state.records {
                let mut view = self.view_over(Arc::clone(rec));
                if !selector(&mut view) {
                    view.discard();
                    continue;
                }
                if self.revalidate_cached(&state, &mut view, id).is_err() {
                    continue;
                }
                if view.commit().is_ok() {
                    count += 1;
                }
            }
            if count > 0 {
                state.dirty = true;
            }
        } else {
            for id in self.fs.list_doc_ids(&self.dir())? {
                let Ok(rec) = self.read_doc_from_file(&id) else {
                    continue;
                };
                let mut view = self.make_view(rec, false);
                if !selector(&mut view) {
                    view.discard();
                    continue;
                }
                if self.revalidate_on_disk(&mut view, &id).is_err() {
                    continue;
                }
                if view.commit().is_ok() {
                    count += 1;
                }
            }
        }
        self.track(Ok(count))
    }

    /// Apply a JSON patch to every document matching the predicate.
    pub fn update_many_patch(
        &self,
        patch: &Map<String, Value>,
        pred: impl Fn(&DocView) -> bool,
    ) -> DbResult<usize> {
        self.update_many(pred, |v| apply_patch(v, patch))
    }

    /// Apply a JSON patch to every document matching a JSON filter.
    pub fn update_many_filter(
        &self,
        patch: &Map<String, Value>,
        filter: &Map<String, Value>,
    ) -> DbResult<usize> {
        self.update_many(|v| filter_matches(v, filter), |v| apply_patch(v, patch))
    }

    // ========================================================================
    // Remove
    // ========================================================================

    /// Remove a document by id.
    ///
    /// Cache mode tombstones the id for the next flush and marks the
    /// record removed so outstanding views fail their commit; cache-off
    /// mode removes the file directly.
    pub fn remove_by_id(&self, id: &str) -> DbResult<()> {
        let result = self.remove_by_id_inner(id);
        if result.is_ok() {
            self.emit(DbEvent::DocumentDeleted);
        }
        self.track(result)
    }

    fn remove_by_id_inner(&self, id: &str) -> DbResult<()> {
        if self.cache_enabled() {
            let mut state = self.state.lock();
            let rec = state
                .records
                .remove(id)
                .ok_or_else(|| DbError::not_found("document not found"))?;
            rec.lock().meta.removed = true;
            state.tombstones.push(id.to_string());
            state.dirty = true;
            Ok(())
        } else {
            self.fs.remove_file(&self.doc_path(id))
        }
    }

    /// Remove every document matching the predicate; returns the count.
    pub fn remove_many(&self, pred: impl Fn(&DocView) -> bool) -> DbResult<usize> {
        if self.cache_enabled() {
            let mut state = self.state.lock();
            let matching: Vec<String> = state
                .records
                .iter()
                .filter(|(_, rec)| pred(&self.view_over(Arc::clone(rec))))
                .map(|(id, _)| id.clone())
                .collect();
            for id in &matching {
                if let Some(rec) = state.records.remove(id) {
                    rec.lock().meta.removed = true;
                    state.tombstones.push(id.clone());
                }
            }
            if !matching.is_empty() {
                state.dirty = true;
            }
            self.track(Ok(matching.len()))
        } else {
            let mut count = 0;
            for id in self.fs.list_doc_ids(&self.dir())? {
                let Ok(rec) = self.read_doc_from_file(&id) else {
                    continue;
                };
                let view = self.make_view(rec, false);
                if !pred(&view) {
                    continue;
                }
                if self.fs.remove_file_if_exists(&self.doc_path(&id))? {
                    count += 1;
                }
            }
            self.track(Ok(count))
        }
    }

    // ========================================================================
    // Mode, size, flush
    // ========================================================================

    /// Switch the cache mode. Disabling flushes pending work first, then
    /// clears the cache and tombstones.
    pub fn set_cache_enabled(&self, enabled: bool) -> DbResult<()> {
        {
            let state = self.state.lock();
            if state.cache_enabled == enabled {
                return Ok(());
            }
        }
        if enabled {
            self.state.lock().cache_enabled = true;
            return Ok(());
        }
        self.flush_dirty_to_fs()?;
        let mut state = self.state.lock();
        state.records.clear();
        state.tombstones.clear();
        state.dirty = false;
        state.cache_enabled = false;
        Ok(())
    }

    /// Number of documents: cached records, or `*.mp` files on disk in
    /// cache-off mode.
    pub fn size(&self) -> usize {
        {
            let state = self.state.lock();
            if state.cache_enabled {
                return state.records.len();
            }
        }
        self.fs.count_doc_files(&self.dir()).unwrap_or(0)
    }

    /// Mark every cached record removed; used when the collection is
    /// dropped so outstanding views fail their next commit.
    pub fn mark_all_removed(&self) {
        let state = self.state.lock();
        for rec in state.records.values() {
            rec.lock().meta.removed = true;
        }
    }

    /// Populate the cache from the collection directory. A missing
    /// directory is fine; unreadable files are skipped. No-op in cache-off
    /// mode.
    pub fn load_from_fs(&self) -> DbResult<()> {
        if !self.cache_enabled() {
            return Ok(());
        }
        let ids = self.fs.list_doc_ids(&self.dir())?;
        let mut loaded = Vec::with_capacity(ids.len());
        for id in ids {
            match self.read_doc_from_file(&id) {
                Ok(rec) => loaded.push((id, rec)),
                Err(e) => {
                    debug!(collection = %self.name, id = %id, error = %e, "skipping unreadable document");
                }
            }
        }
        let mut state = self.state.lock();
        for (id, rec) in loaded {
            state.records.entry(id).or_insert(rec);
        }
        Ok(())
    }

    /// Flush tombstones and dirty records to disk.
    ///
    /// Work is snapshotted under the collection lock (blob copies, dirty
    /// flags cleared), then deletions and atomic writes run against the
    /// filesystem. The cycle aborts on the first write error; snapshots not
    /// yet written are re-marked dirty so the next cycle retries them.
    ///
    /// Returns whether any file was written or removed.
    pub fn flush_dirty_to_fs(&self) -> DbResult<bool> {
        let (to_delete, to_write) = {
            let mut state = self.state.lock();
            if !state.cache_enabled {
                return Ok(false);
            }
            let to_delete = std::mem::take(&mut state.tombstones);
            let mut to_write = Vec::new();
            for rec in state.records.values() {
                let mut guard = rec.lock();
                if guard.meta.dirty {
                    to_write.push((guard.meta.id.clone(), guard.blob.clone()));
                    guard.meta.dirty = false;
                }
            }
            state.dirty = false;
            (to_delete, to_write)
        };

        let mut did_work = !to_delete.is_empty();
        for id in &to_delete {
            if let Err(e) = self.fs.remove_file_if_exists(&self.doc_path(id)) {
                warn!(collection = %self.name, id = %id, error = %e, "tombstone removal failed");
            }
        }

        for (i, (id, blob)) in to_write.iter().enumerate() {
            if let Err(e) = self.fs.atomic_write(&self.doc_path(id), blob) {
                let mut state = self.state.lock();
                for (pending_id, _) in &to_write[i..] {
                    if let Some(rec) = state.records.get(pending_id) {
                        rec.lock().meta.dirty = true;
                    }
                }
                state.dirty = true;
                return Err(e);
            }
            did_work = true;
        }
        Ok(did_work)
    }

    // ========================================================================
    // Unique constraints
    // ========================================================================

    fn check_unique_on_disk(&self, obj: &Map<String, Value>, self_id: &str) -> DbResult<()> {
        if !self.schema.has_unique_fields() {
            return Ok(());
        }
        let ids = self.fs.list_doc_ids(&self.dir())?;
        for id in ids {
            if !self_id.is_empty() && id == self_id {
                continue;
            }
            let rec = self.read_doc_from_file(&id)?;
            // Transient record: decoded for comparison only, never cached
            let decoded = {
                let guard = rec.lock();
                codec::decode(&guard.blob)
            };
            let Ok(Value::Object(other)) = decoded else {
                continue;
            };
            compare_unique_fields(&self.schema, obj, &other)?;
        }
        Ok(())
    }
}

/// Scan the cached records for a unique-field collision, excluding
/// `self_id`.
fn check_unique_cached(
    records: &BTreeMap<String, SharedRecord>,
    schema: &Schema,
    obj: &Map<String, Value>,
    self_id: &str,
) -> DbResult<()> {
    if !schema.has_unique_fields() {
        return Ok(());
    }
    for (id, rec) in records {
        if !self_id.is_empty() && id == self_id {
            continue;
        }
        let decoded = {
            let guard = rec.lock();
            codec::decode(&guard.blob)
        };
        let Ok(Value::Object(other)) = decoded else {
            continue;
        };
        compare_unique_fields(schema, obj, &other)?;
    }
    Ok(())
}

/// Reject when any declared unique scalar field of `candidate` collides
/// with `other`.
fn compare_unique_fields(
    schema: &Schema,
    candidate: &Map<String, Value>,
    other: &Map<String, Value>,
) -> DbResult<()> {
    for f in &schema.fields {
        if !f.unique || !f.field_type.is_scalar() {
            continue;
        }
        let Some(value) = candidate.get(&f.name) else {
            continue;
        };
        if value.is_null() {
            continue;
        }
        match other.get(&f.name) {
            Some(existing) if !existing.is_null() && existing == value => {
                return Err(DbError::validation("unique constraint violated"));
            }
            _ => {}
        }
    }
    Ok(())
}

/// A filter matches when every `{key, value}` pair equals the document's
/// field value.
fn filter_matches(view: &DocView, filter: &Map<String, Value>) -> bool {
    filter.iter().all(|(key, value)| view.get(key) == *value)
}

fn apply_patch(view: &mut DocView, patch: &Map<String, Value>) {
    for (key, value) in patch {
        view.set(key, value.clone());
    }
}

/// Write a record's blob to its document file and clear its dirty flag.
/// Shared by cache-off write-through and the views' commit sink.
fn persist_record(fs: &FsCoordinator, dir: &str, rec: &SharedRecord) -> DbResult<()> {
    let (id, blob) = {
        let guard = rec.lock();
        (guard.meta.id.clone(), guard.blob.clone())
    };
    if id.is_empty() {
        return Err(DbError::invalid_argument("no record"));
    }
    let path = join_path(dir, &format!("{}{}", id, DOC_EXT));
    fs.atomic_write(&path, &blob)?;
    let mut guard = rec.lock();
    guard.meta.dirty = false;
    guard.meta.removed = false;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::{MountOptions, StdVfs};
    use packdb_core::{FieldType, SchemaField};
    use serde_json::json;
    use tempfile::TempDir;

    fn test_fs() -> (TempDir, FsCoordinator) {
        let dir = TempDir::new().unwrap();
        let vfs = StdVfs::mount(dir.path().join("fs"), MountOptions::default()).unwrap();
        (dir, FsCoordinator::new(vfs))
    }

    fn collection_with(schema: Schema, cache_enabled: bool) -> (TempDir, Collection) {
        let (dir, fs) = test_fs();
        let col = Collection::new(
            "users",
            Arc::new(schema),
            "/db",
            cache_enabled,
            fs,
            Weak::new(),
        );
        (dir, col)
    }

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn create_and_find_round_trip() {
        let (_dir, col) = collection_with(Schema::new(), true);
        let id = col.create(&obj(json!({ "name": "ada" }))).unwrap();
        assert_eq!(id.len(), 24);

        let view = col.find_by_id(&id).unwrap();
        assert_eq!(view.get("name"), json!("ada"));
        assert!(col.is_dirty());
        assert_eq!(col.size(), 1);
    }

    #[test]
    fn create_value_rejects_non_objects() {
        let (_dir, col) = collection_with(Schema::new(), true);
        assert!(col.create_value(&json!([1, 2])).is_err());
        assert!(col.create_value(&json!("scalar")).is_err());
        assert!(col.create_value(&json!({ "k": 1 })).is_ok());
    }

    #[test]
    fn create_many_skips_non_objects() {
        let (_dir, col) = collection_with(Schema::new(), true);
        let ids = col
            .create_many(&[json!({ "a": 1 }), json!(42), json!({ "b": 2 })])
            .unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(col.size(), 2);
    }

    #[test]
    fn schema_defaults_apply_on_create() {
        let schema = Schema::new()
            .field(SchemaField::new("role", FieldType::String).with_default(json!("user")));
        let (_dir, col) = collection_with(schema, true);
        let id = col.create(&obj(json!({ "name": "ada" }))).unwrap();
        let view = col.find_by_id(&id).unwrap();
        assert_eq!(view.get("role"), json!("user"));
    }

    #[test]
    fn schema_type_mismatch_rejects_create() {
        let schema = Schema::new().field(SchemaField::new("age", FieldType::Int));
        let (_dir, col) = collection_with(schema, true);
        let err = col.create(&obj(json!({ "age": "old" }))).unwrap_err();
        assert!(err.is_validation());
        assert_eq!(col.size(), 0);
    }

    #[test]
    fn find_by_id_unknown_is_not_found() {
        let (_dir, col) = collection_with(Schema::new(), true);
        assert!(col.find_by_id("0123456789abcdef01234567").unwrap_err().is_not_found());
    }

    #[test]
    fn find_one_and_find_many_with_predicates() {
        let (_dir, col) = collection_with(Schema::new(), true);
        col.create(&obj(json!({ "n": 1 }))).unwrap();
        col.create(&obj(json!({ "n": 2 }))).unwrap();
        col.create(&obj(json!({ "n": 3 }))).unwrap();

        let all = col.find_many(|_| true).unwrap();
        assert_eq!(all.len(), 3);

        let odd = col
            .find_many(|v| v.get_or("n", 0i64) % 2 == 1)
            .unwrap();
        assert_eq!(odd.len(), 2);

        let two = col.find_one(|v| v.get("n") == json!(2)).unwrap();
        assert_eq!(two.get("n"), json!(2));

        assert!(col.find_one(|v| v.get("n") == json!(9)).unwrap_err().is_not_found());
    }

    #[test]
    fn find_one_filter_matches_all_pairs() {
        let (_dir, col) = collection_with(Schema::new(), true);
        col.create(&obj(json!({ "a": 1, "b": "x" }))).unwrap();
        col.create(&obj(json!({ "a": 1, "b": "y" }))).unwrap();

        let hit = col.find_one_filter(&obj(json!({ "a": 1, "b": "y" }))).unwrap();
        assert_eq!(hit.get("b"), json!("y"));

        assert!(col
            .find_one_filter(&obj(json!({ "a": 2, "b": "y" })))
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn update_by_id_mutates_and_marks_dirty() {
        let (_dir, col) = collection_with(Schema::new(), true);
        let id = col.create(&obj(json!({ "name": "u" }))).unwrap();
        col.flush_dirty_to_fs().unwrap();
        assert!(!col.is_dirty());

        col.update_by_id(&id, |v| v.set("name", json!("u2"))).unwrap();
        assert!(col.is_dirty());
        assert_eq!(col.find_by_id(&id).unwrap().get("name"), json!("u2"));
    }

    #[test]
    fn update_by_id_unknown_is_not_found() {
        let (_dir, col) = collection_with(Schema::new(), true);
        assert!(col
            .update_by_id("0123456789abcdef01234567", |_| {})
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn update_one_upserts_when_asked() {
        let (_dir, col) = collection_with(Schema::new(), true);

        // No match, no create
        let err = col
            .update_one(|v| v.get("k") == json!("x"), |_| {}, false)
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(col.size(), 0);

        // No match, create
        col.update_one(
            |v| v.get("k") == json!("x"),
            |v| v.set("k", json!("x")),
            true,
        )
        .unwrap();
        assert_eq!(col.size(), 1);

        // Match now
        col.update_one(
            |v| v.get("k") == json!("x"),
            |v| v.set("seen", json!(true)),
            false,
        )
        .unwrap();
        let found = col.find_one(|v| v.get("k") == json!("x")).unwrap();
        assert_eq!(found.get("seen"), json!(true));
    }

    #[test]
    fn update_one_filter_merges_filter_then_patch_on_upsert() {
        let (_dir, col) = collection_with(Schema::new(), true);
        col.update_one_filter(
            &obj(json!({ "username": "new" })),
            &obj(json!({ "role": "admin" })),
            true,
        )
        .unwrap();

        let v = col.find_one_filter(&obj(json!({ "username": "new" }))).unwrap();
        assert_eq!(v.get("role"), json!("admin"));
        assert_eq!(v.get("username"), json!("new"));
    }

    #[test]
    fn update_many_counts_commits() {
        let (_dir, col) = collection_with(Schema::new(), true);
        for n in 0..4 {
            col.create(&obj(json!({ "n": n }))).unwrap();
        }
        let count = col
            .update_many(
                |v| v.get_or("n", 0i64) >= 2,
                |v| v.set("big", json!(true)),
            )
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(col.find_many(|v| v.get("big") == json!(true)).unwrap().len(), 2);
    }

    #[test]
    fn update_many_filter_patches_matches() {
        let (_dir, col) = collection_with(Schema::new(), true);
        col.create(&obj(json!({ "group": "a" }))).unwrap();
        col.create(&obj(json!({ "group": "a" }))).unwrap();
        col.create(&obj(json!({ "group": "b" }))).unwrap();

        let count = col
            .update_many_filter(&obj(json!({ "flag": 1 })), &obj(json!({ "group": "a" })))
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn update_many_mut_discards_unselected() {
        let (_dir, col) = collection_with(Schema::new(), true);
        col.create(&obj(json!({ "n": 1 }))).unwrap();
        col.create(&obj(json!({ "n": 2 }))).unwrap();

        let count = col
            .update_many_mut(|v| {
                if v.get_or("n", 0i64) == 1 {
                    v.set("picked", json!(true));
                    true
                } else {
                    v.set("picked", json!(false)); // discarded
                    false
                }
            })
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(col.find_many(|v| !v.get("picked").is_null()).unwrap().len(), 1);
    }

    #[test]
    fn remove_by_id_tombstones_and_hides() {
        let (_dir, col) = collection_with(Schema::new(), true);
        let id = col.create(&obj(json!({ "k": 1 }))).unwrap();
        col.remove_by_id(&id).unwrap();

        assert!(col.find_by_id(&id).unwrap_err().is_not_found());
        assert!(col.remove_by_id(&id).unwrap_err().is_not_found());
        assert_eq!(col.size(), 0);
        assert!(col.is_dirty());
    }

    #[test]
    fn removed_document_is_gone_before_the_file_is() {
        let (_dir, col) = collection_with(Schema::new(), true);
        let id = col.create(&obj(json!({ "k": 1 }))).unwrap();
        col.flush_dirty_to_fs().unwrap();
        assert!(col.fs.exists(&col.doc_path(&id)));

        col.remove_by_id(&id).unwrap();
        // The file is still on disk, but the id must not resolve
        assert!(col.fs.exists(&col.doc_path(&id)));
        assert!(col.find_by_id(&id).unwrap_err().is_not_found());

        col.flush_dirty_to_fs().unwrap();
        assert!(!col.fs.exists(&col.doc_path(&id)));
    }

    #[test]
    fn removed_record_fails_outstanding_view_commit() {
        let (_dir, col) = collection_with(Schema::new(), true);
        let id = col.create(&obj(json!({ "k": 1 }))).unwrap();
        let mut view = col.find_by_id(&id).unwrap();
        view.set("k", json!(2));

        col.remove_by_id(&id).unwrap();
        assert!(view.commit().unwrap_err().is_not_found());
    }

    #[test]
    fn remove_many_counts_and_tombstones() {
        let (_dir, col) = collection_with(Schema::new(), true);
        for n in 0..5 {
            col.create(&obj(json!({ "n": n }))).unwrap();
        }
        let removed = col.remove_many(|v| v.get_or("n", 0i64) < 2).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(col.size(), 3);
    }

    #[test]
    fn unique_constraint_in_cache() {
        let schema = Schema::new().field(SchemaField::new("email", FieldType::String).unique());
        let (_dir, col) = collection_with(schema, true);

        col.create(&obj(json!({ "email": "x" }))).unwrap();
        let err = col.create(&obj(json!({ "email": "x" }))).unwrap_err();
        assert!(err.is_validation());
        col.create(&obj(json!({ "email": "y" }))).unwrap();
        assert_eq!(col.size(), 2);
    }

    #[test]
    fn unique_constraint_excludes_self_on_update() {
        let schema = Schema::new().field(SchemaField::new("email", FieldType::String).unique());
        let (_dir, col) = collection_with(schema, true);

        let a = col.create(&obj(json!({ "email": "a" }))).unwrap();
        let b = col.create(&obj(json!({ "email": "b" }))).unwrap();

        // Updating a with its own email is fine
        col.update_by_id(&a, |v| v.set("email", json!("a"))).unwrap();

        // Updating b to a's email is rejected and b keeps its email
        let err = col
            .update_by_id(&b, |v| v.set("email", json!("a")))
            .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(col.find_by_id(&b).unwrap().get("email"), json!("b"));
    }

    #[test]
    fn unique_ignored_for_container_fields() {
        let schema = Schema::new().field(SchemaField::new("tags", FieldType::Array).unique());
        let (_dir, col) = collection_with(schema, true);
        col.create(&obj(json!({ "tags": [1] }))).unwrap();
        col.create(&obj(json!({ "tags": [1] }))).unwrap();
        assert_eq!(col.size(), 2);
    }

    #[test]
    fn flush_writes_and_removes_files() {
        let (_dir, col) = collection_with(Schema::new(), true);
        let keep = col.create(&obj(json!({ "k": "keep" }))).unwrap();
        let gone = col.create(&obj(json!({ "k": "gone" }))).unwrap();

        assert!(col.flush_dirty_to_fs().unwrap());
        assert!(col.fs.exists(&col.doc_path(&keep)));
        assert!(col.fs.exists(&col.doc_path(&gone)));

        col.remove_by_id(&gone).unwrap();
        assert!(col.flush_dirty_to_fs().unwrap());
        assert!(col.fs.exists(&col.doc_path(&keep)));
        assert!(!col.fs.exists(&col.doc_path(&gone)));

        // Quiescent: nothing left to do
        assert!(!col.flush_dirty_to_fs().unwrap());
        assert!(!col.is_dirty());
    }

    #[test]
    fn load_from_fs_rehydrates_cache() {
        let (dir, fs) = test_fs();
        let schema = Arc::new(Schema::new());
        let id;
        {
            let col = Collection::new("users", Arc::clone(&schema), "/db", true, fs.clone(), Weak::new());
            id = col.create(&obj(json!({ "name": "ada" }))).unwrap();
            col.flush_dirty_to_fs().unwrap();
        }
        let col = Collection::new("users", schema, "/db", true, fs, Weak::new());
        col.load_from_fs().unwrap();
        assert_eq!(col.size(), 1);
        assert_eq!(col.find_by_id(&id).unwrap().get("name"), json!("ada"));
        drop(dir);
    }

    #[test]
    fn load_from_missing_dir_is_ok() {
        let (_dir, col) = collection_with(Schema::new(), true);
        col.load_from_fs().unwrap();
        assert_eq!(col.size(), 0);
    }

    #[test]
    fn cache_off_mode_writes_through() {
        let (_dir, col) = collection_with(Schema::new(), false);
        let id = col.create(&obj(json!({ "k": "v" }))).unwrap();

        // File exists without any flush
        assert!(col.fs.exists(&col.doc_path(&id)));
        assert!(!col.is_dirty());
        assert_eq!(col.size(), 1);

        // Cache stays empty
        assert_eq!(col.state.lock().records.len(), 0);

        let view = col.find_by_id(&id).unwrap();
        assert_eq!(view.get("k"), json!("v"));
    }

    #[test]
    fn cache_off_update_persists_immediately() {
        let (_dir, col) = collection_with(Schema::new(), false);
        let id = col.create(&obj(json!({ "n": 1 }))).unwrap();
        col.update_by_id(&id, |v| v.set("n", json!(2))).unwrap();

        let bytes = col.fs.read_file(&col.doc_path(&id)).unwrap();
        assert_eq!(codec::decode(&bytes).unwrap(), json!({ "n": 2 }));
    }

    #[test]
    fn cache_off_remove_deletes_file() {
        let (_dir, col) = collection_with(Schema::new(), false);
        let id = col.create(&obj(json!({ "k": 1 }))).unwrap();
        col.remove_by_id(&id).unwrap();
        assert!(!col.fs.exists(&col.doc_path(&id)));
        assert!(col.remove_by_id(&id).unwrap_err().is_not_found());
    }

    #[test]
    fn cache_off_unique_scans_disk() {
        let schema = Schema::new().field(SchemaField::new("email", FieldType::String).unique());
        let (_dir, col) = collection_with(schema, false);
        col.create(&obj(json!({ "email": "x" }))).unwrap();
        assert!(col.create(&obj(json!({ "email": "x" }))).unwrap_err().is_validation());
        col.create(&obj(json!({ "email": "y" }))).unwrap();
        assert_eq!(col.size(), 2);
        // Disk scan never populates the cache
        assert_eq!(col.state.lock().records.len(), 0);
    }

    #[test]
    fn disabling_cache_flushes_then_clears() {
        let (_dir, col) = collection_with(Schema::new(), true);
        let id = col.create(&obj(json!({ "k": 1 }))).unwrap();
        assert!(col.is_dirty());

        col.set_cache_enabled(false).unwrap();
        assert!(!col.cache_enabled());
        assert_eq!(col.state.lock().records.len(), 0);
        assert!(col.fs.exists(&col.doc_path(&id)));

        // Same value is a no-op
        col.set_cache_enabled(false).unwrap();

        // Re-enabling starts with an empty cache, disk reads still work
        col.set_cache_enabled(true).unwrap();
        assert_eq!(col.find_by_id(&id).unwrap().get("k"), json!(1));
    }

    #[test]
    fn mark_all_removed_poisons_cached_records() {
        let (_dir, col) = collection_with(Schema::new(), true);
        let id = col.create(&obj(json!({ "k": 1 }))).unwrap();
        let mut view = col.find_by_id(&id).unwrap();
        view.set("k", json!(2));

        col.mark_all_removed();
        assert!(view.commit().unwrap_err().is_not_found());
    }
}
