//! Filesystem coordinator
//!
//! Every filesystem call in the process goes through one global lock: the
//! backing device driver is treated as non-reentrant. The coordinator also
//! owns the atomic write primitive (write-to-tmp then rename) and the
//! recursive directory removal used when collections are dropped.
//!
//! Lock discipline: the coordinator lock is always innermost. It is held
//! for single filesystem calls, never across user callbacks, and recursive
//! removal re-acquires it per step so a deep tree cannot starve the flush
//! path.

use crate::vfs::{join_path, DirEntry, Vfs};
use packdb_core::{DbError, DbResult};
use parking_lot::Mutex;
use std::io::{BufWriter, Write};
use std::sync::Arc;
use tracing::warn;

/// Buffer size for document writes; coalesces the small chunks a codec
/// produces into sensible device writes.
const WRITE_BUF_BYTES: usize = 256;

/// Extension for document files.
pub const DOC_EXT: &str = ".mp";

/// Counts bytes accepted by the inner writer.
struct CountWrites<W: Write> {
    inner: W,
    written: u64,
}

impl<W: Write> Write for CountWrites<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Serialized access to the filesystem.
///
/// Cloning shares the same lock and backing [`Vfs`].
#[derive(Clone)]
pub struct FsCoordinator {
    vfs: Arc<dyn Vfs>,
    lock: Arc<Mutex<()>>,
}

impl FsCoordinator {
    /// Wrap a filesystem handle with the global lock.
    pub fn new(vfs: Arc<dyn Vfs>) -> Self {
        FsCoordinator {
            vfs,
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Read a whole file. Missing file is `NotFound`.
    pub fn read_file(&self, path: &str) -> DbResult<Vec<u8>> {
        let _guard = self.lock.lock();
        self.vfs.read(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DbError::not_found("file not found")
            } else {
                DbError::io(format!("read '{}' failed: {}", path, e))
            }
        })
    }

    /// Atomically write a file.
    ///
    /// 1. Ensure the parent directory exists.
    /// 2. Write `<path>.tmp` through a small buffering stream.
    /// 3. Verify the byte count; remove the tmp file on any shortfall.
    /// 4. Rename tmp over the final path; remove tmp if the rename fails.
    pub fn atomic_write(&self, path: &str, bytes: &[u8]) -> DbResult<()> {
        let _guard = self.lock.lock();

        if let Some(dir) = parent_dir(path) {
            self.vfs
                .create_dir_all(dir)
                .map_err(|e| DbError::io(format!("mkdir '{}' failed: {}", dir, e)))?;
        }

        let tmp = format!("{}.tmp", path);
        let file = self
            .vfs
            .open_write(&tmp)
            .map_err(|e| DbError::io(format!("open '{}' for write failed: {}", tmp, e)))?;

        let mut writer = BufWriter::with_capacity(
            WRITE_BUF_BYTES,
            CountWrites {
                inner: file,
                written: 0,
            },
        );
        let write_result = writer.write_all(bytes).and_then(|_| writer.flush());
        let written = writer.get_ref().written;
        drop(writer);

        if write_result.is_err() || written != bytes.len() as u64 {
            self.remove_tmp(&tmp);
            return Err(DbError::io(format!("write '{}' failed", path)));
        }

        if let Err(e) = self.vfs.rename(&tmp, path) {
            self.remove_tmp(&tmp);
            return Err(DbError::io(format!("rename '{}' failed: {}", path, e)));
        }
        Ok(())
    }

    fn remove_tmp(&self, tmp: &str) {
        if self.vfs.exists(tmp) {
            if let Err(e) = self.vfs.remove_file(tmp) {
                warn!(path = %tmp, error = %e, "failed to clean up tmp file");
            }
        }
    }

    /// Remove a file if it exists. Returns whether a file was removed;
    /// a missing file is not an error.
    pub fn remove_file_if_exists(&self, path: &str) -> DbResult<bool> {
        let _guard = self.lock.lock();
        if !self.vfs.exists(path) {
            return Ok(false);
        }
        self.vfs
            .remove_file(path)
            .map_err(|e| DbError::io(format!("remove '{}' failed: {}", path, e)))?;
        Ok(true)
    }

    /// Remove a file. Missing file is `NotFound`.
    pub fn remove_file(&self, path: &str) -> DbResult<()> {
        let _guard = self.lock.lock();
        if !self.vfs.exists(path) {
            return Err(DbError::not_found("document not found"));
        }
        self.vfs
            .remove_file(path)
            .map_err(|e| DbError::io(format!("remove '{}' failed: {}", path, e)))
    }

    /// Whether the path exists.
    pub fn exists(&self, path: &str) -> bool {
        let _guard = self.lock.lock();
        self.vfs.exists(path)
    }

    /// Create a directory and any missing parents.
    pub fn ensure_dir(&self, path: &str) -> DbResult<()> {
        let _guard = self.lock.lock();
        self.vfs
            .create_dir_all(path)
            .map_err(|e| DbError::io(format!("mkdir '{}' failed: {}", path, e)))
    }

    /// List a directory's entries; a missing directory lists as empty.
    pub fn list_entries(&self, dir: &str) -> DbResult<Vec<DirEntry>> {
        let _guard = self.lock.lock();
        if !self.vfs.exists(dir) {
            return Ok(Vec::new());
        }
        if !self.vfs.is_dir(dir) {
            return Err(DbError::io(format!("'{}' is not a directory", dir)));
        }
        self.vfs
            .read_dir(dir)
            .map_err(|e| DbError::io(format!("open dir '{}' failed: {}", dir, e)))
    }

    /// List document ids in a collection directory: `<id>.mp` files with
    /// the extension stripped.
    pub fn list_doc_ids(&self, dir: &str) -> DbResult<Vec<String>> {
        let entries = self.list_entries(dir)?;
        Ok(entries
            .into_iter()
            .filter(|e| !e.is_dir)
            .filter_map(|e| e.name.strip_suffix(DOC_EXT).map(str::to_string))
            .collect())
    }

    /// Count document files in a directory.
    pub fn count_doc_files(&self, dir: &str) -> DbResult<usize> {
        Ok(self.list_doc_ids(dir)?.len())
    }

    /// Recursively remove a path. Non-existent paths are no-ops.
    ///
    /// Depth-first: directory-ness is checked under the lock, children are
    /// enumerated under the lock, but recursion happens without holding it.
    pub fn remove_tree(&self, path: &str) -> DbResult<()> {
        let is_dir = {
            let _guard = self.lock.lock();
            if !self.vfs.exists(path) {
                return Ok(());
            }
            self.vfs.is_dir(path)
        };

        if !is_dir {
            let _guard = self.lock.lock();
            if self.vfs.exists(path) {
                self.vfs
                    .remove_file(path)
                    .map_err(|e| DbError::io(format!("remove '{}' failed: {}", path, e)))?;
            }
            return Ok(());
        }

        let children = self.list_entries(path)?;
        for child in children {
            let full = join_path(path, &child.name);
            if child.is_dir {
                self.remove_tree(&full)?;
            } else {
                let _guard = self.lock.lock();
                if self.vfs.exists(&full) {
                    self.vfs
                        .remove_file(&full)
                        .map_err(|e| DbError::io(format!("remove '{}' failed: {}", full, e)))?;
                }
            }
        }

        let _guard = self.lock.lock();
        if self.vfs.exists(path) {
            self.vfs
                .remove_dir(path)
                .map_err(|e| DbError::io(format!("rmdir '{}' failed: {}", path, e)))?;
        }
        Ok(())
    }
}

fn parent_dir(path: &str) -> Option<&str> {
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(i) => Some(&path[..i]),
        None => None,
    }
}
