//! Core in-memory data model for gridbase tables.
//!
//! This crate is intentionally free of I/O so it can be shared by every
//! write path. It exposes:
//! - Field metadata (`FieldType`, `FieldOptions`, `Field`)
//! - JSON-friendly cell values (`CellValue`)
//! - The per-field validator/coercer used by batch writes and CSV import
//! - The restricted arithmetic formula evaluator

mod field;
pub mod formula;
mod validate;
mod value;

pub use field::{Field, FieldOptions, FieldType};
pub use validate::{coerce_csv_cell, round_to_precision, validate_cell, BoolTokens, ValueError};
pub use value::{CellValue, CoercedCell};
