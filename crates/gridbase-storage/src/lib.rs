//! SQLite-backed storage for gridbase tables.
//!
//! This crate owns everything that touches the database:
//! - Schema creation (`schema::init`)
//! - Table/field/record primitives (structural changes bump the owning
//!   table's revision)
//! - The revision-guarded batch cell write engine
//! - The per-record formula recomputation pass
//! - Record listing with in-memory filter/sort/paging
//! - The append-only audit log, written inside the same transaction as the
//!   mutation it documents

mod query;
mod schema;
pub mod storage;
mod types;

pub use query::{Filter, FilterOp, ListQuery, RecordPage, Sort};
pub use storage::{Storage, StoreError};
pub use types::{
    AuditAction, AuditEntry, BatchWriteOutcome, CellConflict, CellSlot, CellWrite, CreateRecord,
    Record, RecordData, Role, TableMeta, UpdateRecord, UserRef,
};

pub type Result<T> = std::result::Result<T, StoreError>;
