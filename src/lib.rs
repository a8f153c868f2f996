//! # PackDB
//!
//! An embedded JSON-document database: documents are stored as compact
//! MessagePack blobs, one file per document, one directory per collection,
//! flushed to disk by a single periodic sync task.
//!
//! # Quick Start
//!
//! ```no_run
//! use packdb::{Database, DbConfig, Schema, SchemaField, FieldType};
//! use serde_json::json;
//!
//! fn main() -> packdb::DbResult<()> {
//!     let db = Database::open("./my-data", DbConfig::default())?;
//!
//!     // Schemas are optional; register before first access
//!     db.register_schema(
//!         "users",
//!         Schema::new()
//!             .field(SchemaField::new("email", FieldType::String).unique())
//!             .field(SchemaField::new("role", FieldType::String).with_default(json!("user"))),
//!     )?;
//!
//!     // Create, read, update, delete
//!     let id = db.create("users", json!({ "email": "ada@db" }).as_object().unwrap())?;
//!     let user = db.find_by_id("users", &id)?;
//!     assert_eq!(user.get("role"), json!("user"));
//!
//!     db.update_by_id("users", &id, |v| v.set("role", json!("admin")))?;
//!     db.remove_by_id("users", &id)?;
//!
//!     // Push pending work to disk now instead of waiting for the task
//!     db.sync_now()?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! The [`Database`] struct is the main entry point; collections, document
//! views, and the filesystem coordinator live in `packdb-engine`, shared
//! types in `packdb-core`. Both are re-exported here — only this surface
//! is stable.

pub use packdb_engine::*;
