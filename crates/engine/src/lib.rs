//! PackDB engine
//!
//! This crate orchestrates the database proper:
//! - Database: collection registry, flush scheduler, snapshot/restore
//! - Collection: per-collection cache + filesystem-backed store
//! - DocView: lazy-decode / mutate / commit handle over a shared record
//! - FsCoordinator: the single global filesystem lock and atomic writes
//! - Vfs: the filesystem seam (host-directory backed by default)
//! - codec: the measure → serialize → compare MessagePack pipeline

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod collection;
pub mod database;
pub mod fs;
pub mod vfs;
pub mod view;

pub use collection::Collection;
pub use database::Database;
pub use fs::FsCoordinator;
pub use vfs::{join_path, DirEntry, MountOptions, StdVfs, Vfs};
pub use view::DocView;

// Re-export the core types alongside the engine surface
pub use packdb_core::{
    now_utc_ms, DbConfig, DbError, DbEvent, DbResult, DbStatus, DocRef, DocumentMeta,
    DocumentRecord, FieldType, ObjectId, Schema, SchemaField, SharedRecord, StatusCode,
};
