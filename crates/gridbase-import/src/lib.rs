//! CSV ingestion for gridbase tables.
//!
//! The pipeline reuses the same per-field validation rules as the batch
//! write path, runs in dry-run (report-only) or commit mode, reports
//! progress per table, and keeps the most recent failure manifest around
//! for download as CSV.

mod import;
mod progress;

pub use import::{
    ColumnIssue, CommitReport, DryRunReport, ImportError, ImportOptions, ImportOutcome, Importer,
    RowError, TextEncoding,
};
pub use progress::{
    FailedRow, FailureReport, FailureSource, ImportPhase, ProgressSnapshot, ProgressStore,
};
