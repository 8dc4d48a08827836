//! Generic storage layer: schemas, the table-agnostic engine, and the
//! search-query builder.
//!
//! Every content domain (bookmarks, tabs, history, saved pages) is one
//! [`StorageEngine`] over its own database file, described by a static
//! [`schema::DomainSchema`]. The engine's mutex doubles as the per-domain
//! coarse lock of the concurrency model.

pub mod engine;
pub mod query;
pub mod schema;

pub use engine::{
    BlobData, FieldValue, IdFilter, StorageEngine, StorageError, StorageResult, MAX_RESULT_ROWS,
};
pub use schema::{schema_for, BlobKind, DomainSchema, FieldKind, FieldSpec};
