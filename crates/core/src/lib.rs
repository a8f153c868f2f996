//! Core types for PackDB
//!
//! This crate defines the foundational types used throughout the system:
//! - DbError / StatusCode / DbStatus: the unified error model
//! - ObjectId / DocRef: document identifiers and typed references
//! - DocumentMeta / DocumentRecord / SharedRecord: the in-memory record
//! - Schema / SchemaField / FieldType: per-collection validation
//! - DbEvent: the event surface
//! - DbConfig: scheduler + mount configuration

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod event;
pub mod object_id;
pub mod record;
pub mod schema;
pub mod time;

pub use config::DbConfig;
pub use error::{DbError, DbResult, DbStatus, StatusCode};
pub use event::{DbEvent, ErrorFn, EventFn};
pub use object_id::{DocRef, ObjectId};
pub use record::{DocumentMeta, DocumentRecord, SharedRecord};
pub use schema::{FieldType, PostLoadFn, PreSaveFn, Schema, SchemaField, ValidateFn};
pub use time::now_utc_ms;
