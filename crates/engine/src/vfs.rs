//! Filesystem abstraction
//!
//! The database addresses storage through virtual absolute paths
//! (`/db/users/<id>.mp`). [`Vfs`] is the seam: object-safe so tests can
//! wrap it with fault injection, minimal so a flash filesystem could sit
//! behind it. [`StdVfs`] maps the virtual tree onto a host directory.

use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// One directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// File or directory name (no path component)
    pub name: String,
    /// Whether the entry is a directory
    pub is_dir: bool,
}

/// Abstract byte-addressed file tree with atomic rename.
///
/// All paths are virtual absolute paths (`/a/b/c`). Implementations must
/// be safe to call from multiple threads; the engine serializes calls
/// through a single global lock regardless.
pub trait Vfs: Send + Sync {
    /// Read a whole file. `ErrorKind::NotFound` when absent.
    fn read(&self, path: &str) -> io::Result<Vec<u8>>;
    /// Open a file for writing, truncating any existing content.
    fn open_write(&self, path: &str) -> io::Result<Box<dyn Write + Send>>;
    /// Rename a file. The destination is replaced atomically.
    fn rename(&self, from: &str, to: &str) -> io::Result<()>;
    /// Remove a file.
    fn remove_file(&self, path: &str) -> io::Result<()>;
    /// Remove an empty directory.
    fn remove_dir(&self, path: &str) -> io::Result<()>;
    /// Create a directory and any missing parents.
    fn create_dir_all(&self, path: &str) -> io::Result<()>;
    /// List a directory's entries.
    fn read_dir(&self, path: &str) -> io::Result<Vec<DirEntry>>;
    /// Whether the path exists.
    fn exists(&self, path: &str) -> bool;
    /// Whether the path exists and is a directory.
    fn is_dir(&self, path: &str) -> bool;
}

/// Mount options for [`StdVfs::mount`].
#[derive(Debug, Clone, Default)]
pub struct MountOptions {
    /// Wipe and re-create the mount root when it exists but is unusable.
    pub format_on_fail: bool,
    /// Advisory on a host OS; carried for diagnostics.
    pub max_open_files: u16,
    /// Advisory on a host OS; carried for diagnostics.
    pub partition_label: Option<String>,
}

/// Host-directory-backed filesystem.
///
/// Virtual absolute paths are resolved beneath a single root directory,
/// which plays the role of the flash partition.
pub struct StdVfs {
    root: PathBuf,
}

impl StdVfs {
    /// Mount a host directory as the filesystem root.
    ///
    /// Creates the root if missing. With `format_on_fail`, a root path that
    /// exists but is not a directory is removed and re-created.
    pub fn mount(root: impl AsRef<Path>, opts: MountOptions) -> io::Result<Arc<Self>> {
        let root = root.as_ref().to_path_buf();
        if root.exists() && !root.is_dir() {
            if !opts.format_on_fail {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("mount root '{}' is not a directory", root.display()),
                ));
            }
            std::fs::remove_file(&root)?;
        }
        std::fs::create_dir_all(&root)?;
        Ok(Arc::new(StdVfs { root }))
    }

    /// The host directory backing this filesystem.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> io::Result<PathBuf> {
        let rel = path.trim_start_matches('/');
        let rel_path = Path::new(rel);
        // Reject traversal out of the mount root
        for comp in rel_path.components() {
            match comp {
                Component::Normal(_) | Component::CurDir => {}
                _ => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("invalid path '{}'", path),
                    ))
                }
            }
        }
        Ok(self.root.join(rel_path))
    }
}

impl Vfs for StdVfs {
    fn read(&self, path: &str) -> io::Result<Vec<u8>> {
        std::fs::read(self.resolve(path)?)
    }

    fn open_write(&self, path: &str) -> io::Result<Box<dyn Write + Send>> {
        let file = std::fs::File::create(self.resolve(path)?)?;
        Ok(Box::new(file))
    }

    fn rename(&self, from: &str, to: &str) -> io::Result<()> {
        std::fs::rename(self.resolve(from)?, self.resolve(to)?)
    }

    fn remove_file(&self, path: &str) -> io::Result<()> {
        std::fs::remove_file(self.resolve(path)?)
    }

    fn remove_dir(&self, path: &str) -> io::Result<()> {
        std::fs::remove_dir(self.resolve(path)?)
    }

    fn create_dir_all(&self, path: &str) -> io::Result<()> {
        std::fs::create_dir_all(self.resolve(path)?)
    }

    fn read_dir(&self, path: &str) -> io::Result<Vec<DirEntry>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(self.resolve(path)?)? {
            let entry = entry?;
            out.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: entry.file_type()?.is_dir(),
            });
        }
        Ok(out)
    }

    fn exists(&self, path: &str) -> bool {
        self.resolve(path).map(|p| p.exists()).unwrap_or(false)
    }

    fn is_dir(&self, path: &str) -> bool {
        self.resolve(path).map(|p| p.is_dir()).unwrap_or(false)
    }
}

/// Join two virtual path segments.
///
/// An absolute second segment wins, mirroring the usual join semantics.
pub fn join_path(a: &str, b: &str) -> String {
    if !b.is_empty() && b.starts_with('/') {
        return b.to_string();
    }
    if a.is_empty() {
        return b.to_string();
    }
    if b.is_empty() {
        return a.to_string();
    }
    if a.ends_with('/') {
        format!("{}{}", a, b)
    } else {
        format!("{}/{}", a, b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn mounted() -> (TempDir, Arc<StdVfs>) {
        let dir = TempDir::new().unwrap();
        let vfs = StdVfs::mount(dir.path().join("fs"), MountOptions::default()).unwrap();
        (dir, vfs)
    }

    #[test]
    fn write_read_round_trip() {
        let (_dir, vfs) = mounted();
        vfs.create_dir_all("/db/users").unwrap();
        let mut w = vfs.open_write("/db/users/a.mp").unwrap();
        w.write_all(b"hello").unwrap();
        w.flush().unwrap();
        drop(w);
        assert_eq!(vfs.read("/db/users/a.mp").unwrap(), b"hello");
    }

    #[test]
    fn read_missing_is_not_found() {
        let (_dir, vfs) = mounted();
        let err = vfs.read("/db/nope.mp").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn rename_replaces_destination() {
        let (_dir, vfs) = mounted();
        vfs.create_dir_all("/db").unwrap();
        vfs.open_write("/db/a.tmp").unwrap().write_all(b"new").unwrap();
        vfs.open_write("/db/a").unwrap().write_all(b"old").unwrap();
        vfs.rename("/db/a.tmp", "/db/a").unwrap();
        assert_eq!(vfs.read("/db/a").unwrap(), b"new");
        assert!(!vfs.exists("/db/a.tmp"));
    }

    #[test]
    fn read_dir_lists_files_and_dirs() {
        let (_dir, vfs) = mounted();
        vfs.create_dir_all("/db/users").unwrap();
        vfs.open_write("/db/users/a.mp").unwrap().write_all(b"x").unwrap();
        vfs.create_dir_all("/db/users/sub").unwrap();

        let mut entries = vfs.read_dir("/db/users").unwrap();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "a.mp");
        assert!(!entries[0].is_dir);
        assert_eq!(entries[1].name, "sub");
        assert!(entries[1].is_dir);
    }

    #[test]
    fn path_traversal_is_rejected() {
        let (_dir, vfs) = mounted();
        assert!(vfs.read("/../outside").is_err());
        assert!(vfs.create_dir_all("/db/../../x").is_err());
    }

    #[test]
    fn mount_formats_unusable_root_when_asked() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("fs");
        std::fs::write(&root, b"not a dir").unwrap();

        assert!(StdVfs::mount(&root, MountOptions::default()).is_err());

        let vfs = StdVfs::mount(
            &root,
            MountOptions {
                format_on_fail: true,
                ..MountOptions::default()
            },
        )
        .unwrap();
        assert!(vfs.is_dir("/"));
    }

    #[test]
    fn join_path_rules() {
        assert_eq!(join_path("/db", "users"), "/db/users");
        assert_eq!(join_path("/db/", "users"), "/db/users");
        assert_eq!(join_path("/db", "/abs"), "/abs");
        assert_eq!(join_path("", "users"), "users");
        assert_eq!(join_path("/db", ""), "/db");
    }
}
