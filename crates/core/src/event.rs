//! Database event surface
//!
//! Events are delivered at most once per triggering operation, always
//! outside internal locks.

use crate::error::DbStatus;
use std::sync::Arc;

/// Kinds of database events observable through `Database::on_event`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DbEvent {
    /// A flush cycle wrote or removed at least one file
    Sync,
    /// A collection was created (first reference or cold sync)
    CollectionCreated,
    /// A dropped collection's directory was removed from disk
    CollectionDropped,
    /// A document was created
    DocumentCreated,
    /// A document was updated (bytes actually changed)
    DocumentUpdated,
    /// A document was deleted
    DocumentDeleted,
}

impl DbEvent {
    /// Canonical name.
    pub fn as_str(&self) -> &'static str {
        match self {
            DbEvent::Sync => "Sync",
            DbEvent::CollectionCreated => "CollectionCreated",
            DbEvent::CollectionDropped => "CollectionDropped",
            DbEvent::DocumentCreated => "DocumentCreated",
            DbEvent::DocumentUpdated => "DocumentUpdated",
            DbEvent::DocumentDeleted => "DocumentDeleted",
        }
    }

    /// Human-readable description.
    pub fn describe(&self) -> &'static str {
        match self {
            DbEvent::Sync => "Sync completed",
            DbEvent::CollectionCreated => "Collection created",
            DbEvent::CollectionDropped => "Collection dropped",
            DbEvent::DocumentCreated => "Document created",
            DbEvent::DocumentUpdated => "Document updated",
            DbEvent::DocumentDeleted => "Document deleted",
        }
    }
}

impl std::fmt::Display for DbEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Event listener callback.
pub type EventFn = Arc<dyn Fn(DbEvent) + Send + Sync>;

/// Error listener callback; receives the terminal status of failed
/// operations.
pub type ErrorFn = Arc<dyn Fn(&DbStatus) + Send + Sync>;
