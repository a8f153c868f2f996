//! Database: collection registry, flush scheduler, snapshot/restore
//!
//! The `Database` owns the collections and schemas, fans events and errors
//! out to listeners, and drives one background flush task that calls
//! `sync_now()` every `interval_ms`. Dropped collections are removed from
//! memory immediately and from disk on the next sync cycle.
//!
//! Lock discipline: the database lock guards the registry, pending drops,
//! config, and the diagnostics cache. It is acquired before any collection
//! lock. Listener callbacks always run on snapshots taken outside every
//! lock.

use crate::codec;
use crate::collection::Collection;
use crate::fs::{FsCoordinator, DOC_EXT};
use crate::vfs::{join_path, MountOptions, StdVfs, Vfs};
use crate::view::DocView;
use packdb_core::{
    now_utc_ms, DbConfig, DbError, DbEvent, DbResult, DbStatus, ErrorFn, EventFn, Schema,
};
use parking_lot::{Condvar, Mutex};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Default)]
struct DiagCache {
    docs_per_collection: BTreeMap<String, u64>,
    last_refresh_ms: u64,
}

struct DbState {
    collections: BTreeMap<String, Arc<Collection>>,
    schemas: BTreeMap<String, Arc<Schema>>,
    pending_drops: Vec<String>,
    cfg: DbConfig,
    diag: DiagCache,
}

#[derive(Default)]
struct Listeners {
    events: Vec<EventFn>,
    errors: Vec<ErrorFn>,
}

#[derive(Default)]
struct SyncSignal {
    stop: Mutex<bool>,
    cv: Condvar,
}

struct SyncTask {
    handle: JoinHandle<()>,
    signal: Arc<SyncSignal>,
}

pub(crate) struct DbInner {
    base_dir: String,
    fs: FsCoordinator,
    state: Mutex<DbState>,
    listeners: Mutex<Listeners>,
    last_error: Mutex<DbStatus>,
    sync_task: Mutex<Option<SyncTask>>,
}

impl DbInner {
    /// Record a terminal status; non-Ok statuses fan out to error
    /// listeners outside any lock.
    pub(crate) fn record_status(&self, st: DbStatus) {
        *self.last_error.lock() = st.clone();
        if !st.is_ok() {
            let callbacks = self.listeners.lock().errors.clone();
            for cb in callbacks {
                cb(&st);
            }
        }
    }

    fn track<T>(&self, r: DbResult<T>) -> DbResult<T> {
        self.record_status(DbStatus::from_result(&r));
        r
    }

    /// Deliver an event to listeners, outside any lock.
    pub(crate) fn emit_event(&self, ev: DbEvent) {
        let callbacks = self.listeners.lock().events.clone();
        for cb in callbacks {
            cb(ev);
        }
    }

    /// Return the cached collection, or allocate it: load from disk,
    /// insert into the registry, and emit `CollectionCreated` when the
    /// insertion was new.
    pub(crate) fn collection(self: &Arc<Self>, name: &str) -> DbResult<Arc<Collection>> {
        if name.is_empty() {
            return self.track(Err(DbError::invalid_argument("collection name is empty")));
        }
        let (schema, cache_enabled) = {
            let state = self.state.lock();
            if let Some(col) = state.collections.get(name) {
                let col = Arc::clone(col);
                drop(state);
                return self.track(Ok(col));
            }
            let schema = state
                .schemas
                .get(name)
                .cloned()
                .unwrap_or_else(|| Arc::new(Schema::new()));
            (schema, state.cfg.cache_enabled)
        };

        let col = Arc::new(Collection::new(
            name,
            schema,
            self.base_dir.clone(),
            cache_enabled,
            self.fs.clone(),
            Arc::downgrade(self),
        ));
        if let Err(e) = col.load_from_fs() {
            return self.track(Err(e));
        }

        let (col, inserted) = {
            let mut state = self.state.lock();
            match state.collections.get(name) {
                Some(existing) => (Arc::clone(existing), false),
                None => {
                    state.collections.insert(name.to_string(), Arc::clone(&col));
                    (col, true)
                }
            }
        };
        if inserted {
            self.emit_event(DbEvent::CollectionCreated);
        }
        self.track(Ok(col))
    }

    /// Resolve a document by collection name and id; used by the facade
    /// and by `DocView::populate`.
    pub(crate) fn find_by_id(self: &Arc<Self>, collection: &str, id: &str) -> DbResult<DocView> {
        self.collection(collection)?.find_by_id(id)
    }

    /// One flush cycle: directory removals for dropped collections, then
    /// per-collection flushes. The cycle aborts on the first flush
    /// IoError. `Sync` is emitted at most once, and only if any sub-step
    /// reported work.
    fn sync_now(self: &Arc<Self>) -> DbResult<()> {
        let (drops, cols) = {
            let mut state = self.state.lock();
            let drops = std::mem::take(&mut state.pending_drops);
            let cols: Vec<Arc<Collection>> = state.collections.values().cloned().collect();
            (drops, cols)
        };

        let mut any_changes = false;
        let mut final_result: DbResult<()> = Ok(());

        for name in drops {
            let dir = join_path(&self.base_dir, &name);
            match self.fs.remove_tree(&dir) {
                Ok(()) => {
                    self.emit_event(DbEvent::CollectionDropped);
                    any_changes = true;
                }
                Err(e) => {
                    warn!(collection = %name, error = %e, "failed to remove dropped collection directory");
                    self.record_status(e.status());
                    final_result = Err(e);
                }
            }
        }

        for col in cols {
            match col.flush_dirty_to_fs() {
                Ok(did_work) => any_changes |= did_work,
                Err(e) => return self.track(Err(e)),
            }
        }

        if any_changes {
            self.refresh_diag_from_fs();
            self.emit_event(DbEvent::Sync);
        }
        self.track(final_result)
    }

    /// Refresh the diagnostics cache from disk. Expensive; called on open
    /// and after a sync cycle that did work, never from `get_diag`.
    fn refresh_diag_from_fs(&self) {
        let mut per_col = BTreeMap::new();
        if let Ok(entries) = self.fs.list_entries(&self.base_dir) {
            for entry in entries.into_iter().filter(|e| e.is_dir) {
                let dir = join_path(&self.base_dir, &entry.name);
                let count = self.fs.count_doc_files(&dir).unwrap_or(0);
                if count > 0 {
                    per_col.insert(entry.name, count as u64);
                }
            }
        }
        let mut state = self.state.lock();
        state.diag.docs_per_collection = per_col;
        state.diag.last_refresh_ms = now_utc_ms();
    }

    fn start_sync_task(self: &Arc<Self>) {
        let mut task = self.sync_task.lock();
        if task.is_some() {
            return;
        }
        let (interval_ms, stack_size) = {
            let state = self.state.lock();
            (state.cfg.interval_ms, state.cfg.stack_size)
        };
        let signal = Arc::new(SyncSignal::default());
        let thread_signal = Arc::clone(&signal);
        let weak = Arc::downgrade(self);
        let interval = Duration::from_millis(interval_ms.max(1));

        let handle = std::thread::Builder::new()
            .name("packdb-sync".to_string())
            .stack_size(stack_size)
            .spawn(move || sync_loop(weak, thread_signal, interval))
            .expect("failed to spawn sync task thread");

        *task = Some(SyncTask { handle, signal });
    }

    /// Synchronous teardown: signal the task, wake it, and join. A stop
    /// arriving mid-cycle lets the current cycle finish first.
    fn stop_sync_task(&self) {
        let task = self.sync_task.lock().take();
        if let Some(task) = task {
            // Set the flag under the waiter's mutex so the notify cannot
            // race a sleeper between its check and its wait.
            {
                let mut stop = task.signal.stop.lock();
                *stop = true;
                task.signal.cv.notify_all();
            }
            let _ = task.handle.join();
        }
    }
}

fn sync_loop(db: Weak<DbInner>, signal: Arc<SyncSignal>, interval: Duration) {
    loop {
        {
            let mut stop = signal.stop.lock();
            if *stop {
                return;
            }
            signal.cv.wait_for(&mut stop, interval);
            if *stop {
                return;
            }
        }
        match db.upgrade() {
            Some(db) => {
                let _ = db.sync_now();
            }
            None => return,
        }
    }
}

/// Embedded JSON-document database.
///
/// Documents are MessagePack blobs, one file per document, one directory
/// per collection under the virtual base directory. A single background
/// task flushes dirty records and tombstones periodically; `sync_now()`
/// runs one cycle on demand.
///
/// # Example
///
/// ```no_run
/// use packdb_engine::Database;
/// use packdb_core::DbConfig;
/// use serde_json::json;
///
/// fn main() -> packdb_core::DbResult<()> {
///     let db = Database::open("./data", DbConfig::default())?;
///     let id = db.create("users", json!({ "name": "ada" }).as_object().unwrap())?;
///     let user = db.find_by_id("users", &id)?;
///     assert_eq!(user.get("name"), json!("ada"));
///     db.sync_now()?;
///     Ok(())
/// }
/// ```
pub struct Database {
    inner: Arc<DbInner>,
}

impl Database {
    /// Open a database backed by a host directory.
    ///
    /// Mounts a [`StdVfs`] at `path` (honoring `format_on_fail`), then
    /// initializes per `cfg`. With `cold_sync`, every collection found on
    /// disk is loaded eagerly; with `autosync`, the flush task starts.
    pub fn open(path: impl AsRef<Path>, cfg: DbConfig) -> DbResult<Database> {
        if !cfg.init_file_system {
            return Err(DbError::invalid_argument(
                "init_file_system is disabled; supply a filesystem via open_with_vfs",
            ));
        }
        let vfs = StdVfs::mount(
            path,
            MountOptions {
                format_on_fail: cfg.format_on_fail,
                max_open_files: cfg.max_open_files,
                partition_label: cfg.partition_label.clone(),
            },
        )
        .map_err(|e| DbError::io(format!("filesystem mount failed: {}", e)))?;
        Self::open_with_vfs(cfg, vfs)
    }

    /// Open a database over an externally-owned filesystem handle.
    pub fn open_with_vfs(mut cfg: DbConfig, vfs: Arc<dyn Vfs>) -> DbResult<Database> {
        let base_dir = DbConfig::normalize_base_dir(&cfg.base_dir);
        cfg.base_dir = base_dir.clone();
        let fs = FsCoordinator::new(vfs);
        fs.ensure_dir(&base_dir)?;

        let inner = Arc::new(DbInner {
            base_dir: base_dir.clone(),
            fs,
            state: Mutex::new(DbState {
                collections: BTreeMap::new(),
                schemas: BTreeMap::new(),
                pending_drops: Vec::new(),
                cfg: cfg.clone(),
                diag: DiagCache::default(),
            }),
            listeners: Mutex::new(Listeners::default()),
            last_error: Mutex::new(DbStatus::ok()),
            sync_task: Mutex::new(None),
        });

        if cfg.cold_sync {
            for name in disk_collection_names(&inner.fs, &base_dir)? {
                inner.collection(&name)?;
            }
        }
        inner.refresh_diag_from_fs();
        if cfg.autosync {
            inner.start_sync_task();
        }

        info!(
            base_dir = %base_dir,
            interval_ms = cfg.interval_ms,
            autosync = cfg.autosync,
            cold_sync = cfg.cold_sync,
            cache_enabled = cfg.cache_enabled,
            "database opened"
        );
        Ok(Database { inner })
    }

    /// The normalized virtual base directory.
    pub fn base_dir(&self) -> &str {
        &self.inner.base_dir
    }

    /// Return the named collection, creating it lazily on first
    /// reference.
    pub fn collection(&self, name: &str) -> DbResult<Arc<Collection>> {
        self.inner.collection(name)
    }

    /// Register a schema for collections created later under `name`.
    pub fn register_schema(&self, name: impl Into<String>, schema: Schema) -> DbResult<()> {
        self.inner
            .state
            .lock()
            .schemas
            .insert(name.into(), Arc::new(schema));
        self.inner.track(Ok(()))
    }

    /// Remove a registered schema.
    pub fn unregister_schema(&self, name: &str) -> DbResult<()> {
        self.inner.state.lock().schemas.remove(name);
        self.inner.track(Ok(()))
    }

    /// Register a generic event callback.
    pub fn on_event(&self, cb: impl Fn(DbEvent) + Send + Sync + 'static) {
        self.inner.listeners.lock().events.push(Arc::new(cb));
    }

    /// Register an error callback.
    pub fn on_error(&self, cb: impl Fn(&DbStatus) + Send + Sync + 'static) {
        self.inner.listeners.lock().errors.push(Arc::new(cb));
    }

    /// Register a sync-only callback; shorthand for `on_event` filtered to
    /// [`DbEvent::Sync`].
    pub fn on_sync(&self, cb: impl Fn() + Send + Sync + 'static) {
        self.on_event(move |ev| {
            if ev == DbEvent::Sync {
                cb();
            }
        });
    }

    /// Most recent terminal status of any operation.
    pub fn last_error(&self) -> DbStatus {
        self.inner.last_error.lock().clone()
    }

    /// Run one flush cycle now.
    pub fn sync_now(&self) -> DbResult<()> {
        self.inner.sync_now()
    }

    /// Drop a collection: removed from memory immediately, directory
    /// removed at the next sync. Unknown names are Ok.
    pub fn drop_collection(&self, name: &str) -> DbResult<()> {
        let removed = {
            let mut state = self.inner.state.lock();
            match state.collections.remove(name) {
                Some(col) => {
                    state.diag.docs_per_collection.remove(name);
                    state.pending_drops.push(name.to_string());
                    Some(col)
                }
                None => None,
            }
        };
        if let Some(col) = removed {
            // Outstanding views must fail their next commit
            col.mark_all_removed();
        }
        self.inner.track(Ok(()))
    }

    /// Drop every collection and document, wiping the base directory.
    ///
    /// The sync task is stopped for the duration and restarted when
    /// `autosync` is configured. Emits one `Sync`.
    pub fn drop_all(&self) -> DbResult<()> {
        self.inner.stop_sync_task();

        let (cols, autosync) = {
            let mut state = self.inner.state.lock();
            let cols: Vec<Arc<Collection>> = state.collections.values().cloned().collect();
            state.collections.clear();
            state.pending_drops.clear();
            state.diag.docs_per_collection.clear();
            (cols, state.cfg.autosync)
        };
        for col in cols {
            col.mark_all_removed();
        }

        let result = self
            .inner
            .fs
            .remove_tree(&self.inner.base_dir)
            .and_then(|_| self.inner.fs.ensure_dir(&self.inner.base_dir));
        if let Err(e) = result {
            return self.inner.track(Err(e));
        }

        self.inner.refresh_diag_from_fs();
        if autosync {
            self.inner.start_sync_task();
        }
        self.inner.emit_event(DbEvent::Sync);
        self.inner.track(Ok(()))
    }

    /// Change the sync configuration; restarts the flush task as needed
    /// and propagates the cache mode to live collections.
    pub fn change_config(&self, mut cfg: DbConfig) -> DbResult<()> {
        self.inner.stop_sync_task();
        cfg.base_dir = self.inner.base_dir.clone();

        let (cols, autosync) = {
            let mut state = self.inner.state.lock();
            state.cfg = cfg.clone();
            let cols: Vec<Arc<Collection>> = state.collections.values().cloned().collect();
            (cols, cfg.autosync)
        };
        for col in cols {
            if let Err(e) = col.set_cache_enabled(cfg.cache_enabled) {
                warn!(collection = %col.name(), error = %e, "cache mode change failed");
            }
        }

        if autosync {
            self.inner.start_sync_task();
        }
        self.inner.track(Ok(()))
    }

    /// Union of loaded and on-disk collection names, sorted.
    pub fn collection_names(&self) -> Vec<String> {
        let mut seen: BTreeSet<String> = self
            .inner
            .state
            .lock()
            .collections
            .keys()
            .cloned()
            .collect();
        if let Ok(names) = disk_collection_names(&self.inner.fs, &self.inner.base_dir) {
            seen.extend(names);
        }
        seen.into_iter().collect()
    }

    /// Diagnostics snapshot: live collection sizes overlaid on the cached
    /// disk counts, plus the current config. Never touches the
    /// filesystem.
    pub fn get_diag(&self) -> Value {
        let (cached, last_refresh_ms, live, cfg) = {
            let state = self.inner.state.lock();
            let live: Vec<(String, u64)> = state
                .collections
                .iter()
                .map(|(name, col)| (name.clone(), col.size() as u64))
                .collect();
            (
                state.diag.docs_per_collection.clone(),
                state.diag.last_refresh_ms,
                live,
                state.cfg.clone(),
            )
        };

        let mut per = Map::new();
        for (name, count) in &live {
            per.insert(name.clone(), Value::from(*count));
        }
        for (name, count) in &cached {
            per.entry(name.clone()).or_insert_with(|| Value::from(*count));
        }
        let collections = per.len() as u64;

        self.inner.record_status(DbStatus::ok());
        serde_json::json!({
            "documentsPerCollection": per,
            "collections": collections,
            "lastRefreshMs": last_refresh_ms,
            "config": {
                "baseDir": self.inner.base_dir,
                "intervalMs": cfg.interval_ms,
                "autosync": cfg.autosync,
                "coldSync": cfg.cold_sync,
                "cacheEnabled": cfg.cache_enabled,
                "stackSize": cfg.stack_size,
                "priority": cfg.priority,
                "coreId": cfg.core_id,
            },
        })
    }

    /// Walk every collection directory and embed each document (with its
    /// `_id` appended) into one JSON snapshot. Unreadable files are
    /// skipped.
    pub fn get_snapshot(&self) -> DbResult<Value> {
        let mut cols_obj = Map::new();
        let entries = self.inner.fs.list_entries(&self.inner.base_dir)?;
        for entry in entries.into_iter().filter(|e| e.is_dir) {
            let dir = join_path(&self.inner.base_dir, &entry.name);
            let mut docs = Vec::new();
            for id in self.inner.fs.list_doc_ids(&dir)? {
                let path = join_path(&dir, &format!("{}{}", id, DOC_EXT));
                let Ok(bytes) = self.inner.fs.read_file(&path) else {
                    continue;
                };
                let Ok(Value::Object(mut doc)) = codec::decode(&bytes) else {
                    continue;
                };
                doc.insert("_id".to_string(), Value::String(id));
                docs.push(Value::Object(doc));
            }
            cols_obj.insert(entry.name, Value::Array(docs));
        }
        self.inner
            .track(Ok(serde_json::json!({ "collections": cols_obj })))
    }

    /// Restore the database from a snapshot produced by
    /// [`Self::get_snapshot`].
    ///
    /// Drops everything, then re-writes each document file atomically.
    /// Entries without a non-empty `_id` are skipped; the restore aborts
    /// on the first IoError. Emits one `Sync`.
    pub fn restore_from_snapshot(&self, snapshot: &Value) -> DbResult<()> {
        let Some(cols) = snapshot.get("collections").and_then(Value::as_object) else {
            return self
                .inner
                .track(Err(DbError::invalid_argument("missing collections")));
        };
        let cols = cols.clone();

        self.drop_all()?;

        let result = (|| -> DbResult<()> {
            for (name, entries) in &cols {
                if name.is_empty() {
                    continue;
                }
                let Some(entries) = entries.as_array() else {
                    continue;
                };
                let dir = join_path(&self.inner.base_dir, name);
                self.inner.fs.ensure_dir(&dir)?;
                for entry in entries {
                    let Some(doc) = entry.as_object() else {
                        continue;
                    };
                    let id = match doc.get("_id").and_then(Value::as_str) {
                        Some(id) if !id.is_empty() => id.to_string(),
                        _ => continue,
                    };
                    let mut doc = doc.clone();
                    doc.remove("_id");
                    let bytes = codec::encode(&Value::Object(doc))?;
                    let path = join_path(&dir, &format!("{}{}", id, DOC_EXT));
                    self.inner.fs.atomic_write(&path, &bytes)?;
                }
            }
            Ok(())
        })();
        if let Err(e) = result {
            return self.inner.track(Err(e));
        }

        self.inner.refresh_diag_from_fs();
        self.inner.emit_event(DbEvent::Sync);
        self.inner.track(Ok(()))
    }

    // ========================================================================
    // Convenience dispatchers
    // ========================================================================

    /// Create a document in the named collection.
    pub fn create(&self, collection: &str, doc: &Map<String, Value>) -> DbResult<String> {
        self.collection(collection)?.create(doc)
    }

    /// Bulk create in the named collection.
    pub fn create_many(&self, collection: &str, docs: &[Value]) -> DbResult<Vec<String>> {
        self.collection(collection)?.create_many(docs)
    }

    /// Find a document by id in the named collection.
    pub fn find_by_id(&self, collection: &str, id: &str) -> DbResult<DocView> {
        self.inner.find_by_id(collection, id)
    }

    /// Find all documents matching the predicate in the named collection.
    pub fn find_many(
        &self,
        collection: &str,
        pred: impl Fn(&DocView) -> bool,
    ) -> DbResult<Vec<DocView>> {
        self.collection(collection)?.find_many(pred)
    }

    /// Find the first document matching the predicate in the named
    /// collection.
    pub fn find_one(
        &self,
        collection: &str,
        pred: impl Fn(&DocView) -> bool,
    ) -> DbResult<DocView> {
        self.collection(collection)?.find_one(pred)
    }

    /// Find the first document matching a JSON filter in the named
    /// collection.
    pub fn find_one_filter(
        &self,
        collection: &str,
        filter: &Map<String, Value>,
    ) -> DbResult<DocView> {
        self.collection(collection)?.find_one_filter(filter)
    }

    /// Update a document by id in the named collection.
    pub fn update_by_id(
        &self,
        collection: &str,
        id: &str,
        mutator: impl FnOnce(&mut DocView),
    ) -> DbResult<()> {
        self.collection(collection)?.update_by_id(id, mutator)
    }

    /// Update the first matching document; with `create`, upsert.
    pub fn update_one(
        &self,
        collection: &str,
        pred: impl Fn(&DocView) -> bool,
        mutator: impl Fn(&mut DocView),
        create: bool,
    ) -> DbResult<()> {
        self.collection(collection)?.update_one(pred, mutator, create)
    }

    /// Update the first document matching a filter with a patch; with
    /// `create`, upsert from filter then patch.
    pub fn update_one_filter(
        &self,
        collection: &str,
        filter: &Map<String, Value>,
        patch: &Map<String, Value>,
        create: bool,
    ) -> DbResult<()> {
        self.collection(collection)?.update_one_filter(filter, patch, create)
    }

    /// Update every matching document; returns the count.
    pub fn update_many(
        &self,
        collection: &str,
        pred: impl Fn(&DocView) -> bool,
        mutator: impl Fn(&mut DocView),
    ) -> DbResult<usize> {
        self.collection(collection)?.update_many(pred, mutator)
    }

    /// Apply a patch to every document matching a filter; returns the
    /// count.
    pub fn update_many_filter(
        &self,
        collection: &str,
        patch: &Map<String, Value>,
        filter: &Map<String, Value>,
    ) -> DbResult<usize> {
        self.collection(collection)?.update_many_filter(patch, filter)
    }

    /// Remove a document by id from the named collection.
    pub fn remove_by_id(&self, collection: &str, id: &str) -> DbResult<()> {
        self.collection(collection)?.remove_by_id(id)
    }

    /// Remove every matching document; returns the count.
    pub fn remove_many(
        &self,
        collection: &str,
        pred: impl Fn(&DocView) -> bool,
    ) -> DbResult<usize> {
        self.collection(collection)?.remove_many(pred)
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.inner.stop_sync_task();
    }
}

fn disk_collection_names(fs: &FsCoordinator, base_dir: &str) -> DbResult<Vec<String>> {
    Ok(fs
        .list_entries(base_dir)?
        .into_iter()
        .filter(|e| e.is_dir)
        .map(|e| e.name)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use packdb_core::{FieldType, SchemaField, StatusCode};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    fn manual_db(dir: &TempDir) -> Database {
        Database::open(
            dir.path().join("fs"),
            DbConfig {
                autosync: false,
                ..DbConfig::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn open_normalizes_base_dir() {
        let dir = TempDir::new().unwrap();
        let db = Database::open(
            dir.path().join("fs"),
            DbConfig {
                base_dir: "data/".into(),
                autosync: false,
                ..DbConfig::default()
            },
        )
        .unwrap();
        assert_eq!(db.base_dir(), "/data");
    }

    #[test]
    fn collection_is_created_once() {
        let dir = TempDir::new().unwrap();
        let db = manual_db(&dir);
        let created = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&created);
        db.on_event(move |ev| {
            if ev == DbEvent::CollectionCreated {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });

        let a = db.collection("users").unwrap();
        let b = db.collection("users").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn empty_collection_name_is_invalid() {
        let dir = TempDir::new().unwrap();
        let db = manual_db(&dir);
        let err = db.collection("").unwrap_err();
        assert_eq!(err.code(), StatusCode::InvalidArgument);
        assert_eq!(db.last_error().code, StatusCode::InvalidArgument);
    }

    #[test]
    fn registered_schema_applies_to_new_collection() {
        let dir = TempDir::new().unwrap();
        let db = manual_db(&dir);
        db.register_schema(
            "users",
            Schema::new()
                .field(SchemaField::new("role", FieldType::String).with_default(json!("user"))),
        )
        .unwrap();

        let id = db.create("users", &obj(json!({ "name": "ada" }))).unwrap();
        assert_eq!(db.find_by_id("users", &id).unwrap().get("role"), json!("user"));
    }

    #[test]
    fn sync_emits_once_per_working_cycle() {
        let dir = TempDir::new().unwrap();
        let db = manual_db(&dir);
        let syncs = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&syncs);
        db.on_sync(move || {
            s.fetch_add(1, Ordering::SeqCst);
        });

        db.create("users", &obj(json!({ "a": 1 }))).unwrap();
        db.create("posts", &obj(json!({ "b": 2 }))).unwrap();
        db.sync_now().unwrap();
        assert_eq!(syncs.load(Ordering::SeqCst), 1);

        // Quiescent cycle emits nothing
        db.sync_now().unwrap();
        assert_eq!(syncs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_collection_unknown_is_ok_and_known_is_deferred() {
        let dir = TempDir::new().unwrap();
        let db = manual_db(&dir);
        db.drop_collection("ghosts").unwrap();

        db.create("users", &obj(json!({ "a": 1 }))).unwrap();
        db.sync_now().unwrap();
        let users_dir = join_path(db.base_dir(), "users");
        assert!(db.inner.fs.exists(&users_dir));

        let dropped = Arc::new(AtomicUsize::new(0));
        let d = Arc::clone(&dropped);
        db.on_event(move |ev| {
            if ev == DbEvent::CollectionDropped {
                d.fetch_add(1, Ordering::SeqCst);
            }
        });

        db.drop_collection("users").unwrap();
        // Directory still on disk until the next sync
        assert!(db.inner.fs.exists(&users_dir));
        db.sync_now().unwrap();
        assert!(!db.inner.fs.exists(&users_dir));
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_all_wipes_and_reinitializes() {
        let dir = TempDir::new().unwrap();
        let db = manual_db(&dir);
        db.create("users", &obj(json!({ "a": 1 }))).unwrap();
        db.create("posts", &obj(json!({ "b": 2 }))).unwrap();
        db.sync_now().unwrap();

        db.drop_all().unwrap();
        assert_eq!(db.collection_names().len(), 0);
        assert_eq!(db.collection("users").unwrap().size(), 0);

        let diag = db.get_diag();
        assert_eq!(diag["collections"], json!(0));
    }

    #[test]
    fn collection_names_unions_memory_and_disk() {
        let dir = TempDir::new().unwrap();
        {
            let db = manual_db(&dir);
            db.create("on_disk", &obj(json!({ "a": 1 }))).unwrap();
            db.sync_now().unwrap();
        }
        let db = manual_db(&dir);
        db.collection("in_memory").unwrap();
        assert_eq!(db.collection_names(), vec!["in_memory", "on_disk"]);
    }

    #[test]
    fn cold_sync_loads_collections_eagerly() {
        let dir = TempDir::new().unwrap();
        let id;
        {
            let db = manual_db(&dir);
            id = db.create("users", &obj(json!({ "name": "ada" }))).unwrap();
            db.sync_now().unwrap();
        }
        let db = Database::open(
            dir.path().join("fs"),
            DbConfig {
                autosync: false,
                cold_sync: true,
                ..DbConfig::default()
            },
        )
        .unwrap();
        // Loaded without an explicit collection() call
        assert_eq!(db.inner.state.lock().collections.len(), 1);
        assert_eq!(db.find_by_id("users", &id).unwrap().get("name"), json!("ada"));
    }

    #[test]
    fn diag_prefers_live_counts_and_skips_fs() {
        let dir = TempDir::new().unwrap();
        let db = manual_db(&dir);
        db.create("users", &obj(json!({ "a": 1 }))).unwrap();
        db.sync_now().unwrap();
        db.create("users", &obj(json!({ "a": 2 }))).unwrap();

        // Live count (2) wins over the flushed disk count (1)
        let diag = db.get_diag();
        assert_eq!(diag["documentsPerCollection"]["users"], json!(2));
        assert_eq!(diag["collections"], json!(1));
        assert_eq!(diag["config"]["baseDir"], json!("/db"));
        assert_eq!(diag["config"]["autosync"], json!(false));
    }

    #[test]
    fn snapshot_restore_round_trip() {
        let dir = TempDir::new().unwrap();
        let db = manual_db(&dir);
        let u1 = db.create("users", &obj(json!({ "name": "ada", "age": 36 }))).unwrap();
        let p1 = db.create("posts", &obj(json!({ "title": "hello" }))).unwrap();
        db.sync_now().unwrap();

        let snapshot = db.get_snapshot().unwrap();
        db.drop_all().unwrap();
        db.restore_from_snapshot(&snapshot).unwrap();

        assert_eq!(db.find_by_id("users", &u1).unwrap().get("name"), json!("ada"));
        assert_eq!(db.find_by_id("users", &u1).unwrap().get("age"), json!(36));
        assert_eq!(db.find_by_id("posts", &p1).unwrap().get("title"), json!("hello"));

        let diag = db.get_diag();
        assert_eq!(diag["documentsPerCollection"]["users"], json!(1));
        assert_eq!(diag["documentsPerCollection"]["posts"], json!(1));
    }

    #[test]
    fn restore_requires_collections_object() {
        let dir = TempDir::new().unwrap();
        let db = manual_db(&dir);
        let err = db.restore_from_snapshot(&json!({})).unwrap_err();
        assert_eq!(err.code(), StatusCode::InvalidArgument);

        let err = db
            .restore_from_snapshot(&json!({ "collections": [1, 2] }))
            .unwrap_err();
        assert_eq!(err.code(), StatusCode::InvalidArgument);
    }

    #[test]
    fn restore_skips_entries_without_id() {
        let dir = TempDir::new().unwrap();
        let db = manual_db(&dir);
        db.restore_from_snapshot(&json!({
            "collections": {
                "users": [
                    { "name": "no-id" },
                    { "_id": "", "name": "empty-id" },
                    { "_id": "0123456789abcdef01234567", "name": "kept" },
                    "not-an-object"
                ]
            }
        }))
        .unwrap();
        assert_eq!(db.collection("users").unwrap().size(), 1);
    }

    #[test]
    fn error_listener_sees_failures() {
        let dir = TempDir::new().unwrap();
        let db = manual_db(&dir);
        let errors = Arc::new(Mutex::new(Vec::new()));
        let e = Arc::clone(&errors);
        db.on_error(move |st| {
            e.lock().push(st.code);
        });

        let _ = db.find_by_id("users", "0123456789abcdef01234567");
        let seen = errors.lock().clone();
        assert!(seen.contains(&StatusCode::NotFound));
        assert_eq!(db.last_error().code, StatusCode::NotFound);
    }

    #[test]
    fn last_error_resets_on_success() {
        let dir = TempDir::new().unwrap();
        let db = manual_db(&dir);
        let _ = db.find_by_id("users", "0123456789abcdef01234567");
        assert_eq!(db.last_error().code, StatusCode::NotFound);

        db.create("users", &obj(json!({ "a": 1 }))).unwrap();
        assert!(db.last_error().is_ok());
    }

    #[test]
    fn document_events_fire_once_each() {
        let dir = TempDir::new().unwrap();
        let db = manual_db(&dir);
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = Arc::clone(&log);
        db.on_event(move |ev| l.lock().push(ev));

        let id = db.create("users", &obj(json!({ "n": 1 }))).unwrap();
        db.update_by_id("users", &id, |v| v.set("n", json!(2))).unwrap();
        db.remove_by_id("users", &id).unwrap();

        let seen = log.lock().clone();
        let count = |ev: DbEvent| seen.iter().filter(|e| **e == ev).count();
        assert_eq!(count(DbEvent::CollectionCreated), 1);
        assert_eq!(count(DbEvent::DocumentCreated), 1);
        assert_eq!(count(DbEvent::DocumentUpdated), 1);
        assert_eq!(count(DbEvent::DocumentDeleted), 1);
    }

    #[test]
    fn upsert_emits_created_not_updated() {
        let dir = TempDir::new().unwrap();
        let db = manual_db(&dir);
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = Arc::clone(&log);
        db.on_event(move |ev| l.lock().push(ev));

        db.update_one_filter(
            "users",
            &obj(json!({ "username": "new" })),
            &obj(json!({ "role": "admin" })),
            true,
        )
        .unwrap();

        let seen = log.lock().clone();
        assert!(seen.contains(&DbEvent::DocumentCreated));
        assert!(!seen.contains(&DbEvent::DocumentUpdated));
    }

    #[test]
    fn autosync_task_flushes_in_background() {
        let dir = TempDir::new().unwrap();
        let db = Database::open(
            dir.path().join("fs"),
            DbConfig {
                interval_ms: 20,
                ..DbConfig::default()
            },
        )
        .unwrap();

        let synced = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&synced);
        db.on_sync(move || {
            s.fetch_add(1, Ordering::SeqCst);
        });

        let id = db.create("users", &obj(json!({ "n": 1 }))).unwrap();
        let path = join_path(&join_path(db.base_dir(), "users"), &format!("{}.mp", id));

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while synced.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(synced.load(Ordering::SeqCst) >= 1);
        assert!(db.inner.fs.exists(&path));
    }

    #[test]
    fn change_config_restarts_task_and_propagates_cache_mode() {
        let dir = TempDir::new().unwrap();
        let db = manual_db(&dir);
        db.create("users", &obj(json!({ "n": 1 }))).unwrap();
        assert!(db.collection("users").unwrap().cache_enabled());

        db.change_config(DbConfig {
            autosync: false,
            cache_enabled: false,
            ..DbConfig::default()
        })
        .unwrap();

        let col = db.collection("users").unwrap();
        assert!(!col.cache_enabled());
        // The pending record was flushed by the mode change
        assert_eq!(col.size(), 1);
    }

    #[test]
    fn stop_is_synchronous_on_drop() {
        let dir = TempDir::new().unwrap();
        let db = Database::open(
            dir.path().join("fs"),
            DbConfig {
                interval_ms: 5,
                ..DbConfig::default()
            },
        )
        .unwrap();
        db.create("users", &obj(json!({ "n": 1 }))).unwrap();
        drop(db); // must not hang or panic
    }
}
