use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;

use csv::ByteRecord;
use encoding_rs::WINDOWS_1252;
use gridbase_model::{coerce_csv_cell, BoolTokens, Field};
use gridbase_storage::{AuditAction, CreateRecord, Role, Storage, StoreError, UserRef};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::progress::{
    percent_of, FailedRow, FailureReport, FailureSource, ImportPhase, ProgressSnapshot,
    ProgressStore,
};
use chrono::Utc;

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("csv input was empty")]
    EmptyInput,
    #[error("csv parse error at row {row}: {reason}")]
    Parse { row: u64, reason: String },
    #[error("role {0} is not allowed to import")]
    Forbidden(Role),
    #[error("unknown field id in mapping: {0}")]
    UnknownMappedField(i64),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ImportError>;

/// How to decode raw CSV bytes into text fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextEncoding {
    /// Attempt UTF-8 first; fields with invalid UTF-8 fall back to
    /// Windows-1252. Matches common spreadsheet-exported CSVs.
    Auto,
    /// Decode as UTF-8 and reject invalid byte sequences.
    Utf8,
    /// Decode as Windows-1252 (aka CP-1252).
    Windows1252,
}

#[derive(Clone, Debug)]
pub struct ImportOptions {
    /// Field delimiter; comma by default, tab supported.
    pub delimiter: u8,
    pub encoding: TextEncoding,
    /// Whether the first row is a header. When false, columns are named
    /// `col1..colN`.
    pub has_header: bool,
    /// Explicit column index → field id mapping. Overrides header matching.
    pub mapping: Option<HashMap<usize, i64>>,
    /// When false, a non-empty cell in an unmapped column flags its row.
    pub ignore_unknown_columns: bool,
    pub dry_run: bool,
    pub rollback_on_error: bool,
    pub bool_tokens: BoolTokens,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            delimiter: b',',
            encoding: TextEncoding::Auto,
            has_header: true,
            mapping: None,
            ignore_unknown_columns: true,
            dry_run: false,
            rollback_on_error: true,
            bool_tokens: BoolTokens::default(),
        }
    }
}

/// One validation problem within a row, attributed to a column.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColumnIssue {
    /// 0-based source column. `None` for failures not tied to a column
    /// (e.g. the insert that aborted a commit run).
    pub column_index: Option<usize>,
    pub field_id: Option<i64>,
    pub message: String,
}

/// All problems for one source row, by 1-based line number (header
/// included in the numbering when present).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RowError {
    pub row_number: usize,
    pub issues: Vec<ColumnIssue>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DryRunReport {
    pub total_rows: usize,
    pub valid: usize,
    pub invalid: usize,
    pub errors: Vec<RowError>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommitReport {
    pub total_rows: usize,
    /// Records retained after any rollback.
    pub inserted: usize,
    /// Validation failures plus the aborting insert failure, if any.
    pub invalid: usize,
    pub errors: Vec<RowError>,
    pub rolled_back: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ImportOutcome {
    DryRun(DryRunReport),
    Commit(CommitReport),
}

/// CSV import pipeline over a [`Storage`], sharing one process-wide
/// progress/failure store.
#[derive(Clone)]
pub struct Importer {
    storage: Storage,
    progress: Arc<ProgressStore>,
}

struct ValidRow {
    values: HashMap<i64, serde_json::Value>,
    row_number: usize,
}

impl Importer {
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            progress: Arc::new(ProgressStore::new()),
        }
    }

    pub fn with_progress_store(storage: Storage, progress: Arc<ProgressStore>) -> Self {
        Self { storage, progress }
    }

    pub fn progress(&self, table_id: i64) -> ProgressSnapshot {
        self.progress.progress(table_id)
    }

    pub fn failure_report(&self, table_id: i64) -> Option<FailureReport> {
        self.progress.failure_report(table_id)
    }

    /// The most recent failure manifest rendered as CSV bytes, if any.
    pub fn failure_report_csv(&self, table_id: i64) -> Option<Vec<u8>> {
        self.progress.failure_report(table_id).map(|r| r.to_csv())
    }

    /// Import CSV bytes into a table. Validation failures are collected
    /// per row (fail-soft); in commit mode the first insertion failure
    /// aborts the rest of the file (fail-fast) and triggers rollback
    /// unless disabled.
    pub fn import_csv(
        &self,
        table_id: i64,
        user: &UserRef,
        bytes: &[u8],
        options: &ImportOptions,
    ) -> Result<ImportOutcome> {
        if bytes.is_empty() {
            return Err(ImportError::EmptyInput);
        }
        if !matches!(user.role, Role::Editor | Role::Admin) {
            return Err(ImportError::Forbidden(user.role));
        }
        self.storage.get_table(table_id)?;
        let fields = self.storage.list_fields(table_id)?;

        let rows = parse_rows(bytes, options)?;
        if rows.is_empty() {
            return Err(ImportError::EmptyInput);
        }

        let (header, body) = split_header(rows, options.has_header);
        let run_id = self.progress.begin_run(table_id, body.len());
        debug!(table_id, %run_id, rows = body.len(), dry_run = options.dry_run, "import started");

        let mapping = build_mapping(&header, &fields, options)?;

        // Validation pass: fail-soft, every row gets a verdict.
        let mut errors: Vec<RowError> = Vec::new();
        let mut valid_rows: Vec<ValidRow> = Vec::new();
        let header_offset = if options.has_header { 2 } else { 1 };

        for (index, row) in body.iter().enumerate() {
            let row_number = index + header_offset;
            let mut issues: Vec<ColumnIssue> = Vec::new();
            let mut values: HashMap<i64, serde_json::Value> = HashMap::new();

            for (column_index, field) in &mapping {
                let raw = row.get(*column_index).map(String::as_str).unwrap_or("");
                let Some(field) = field else {
                    if !options.ignore_unknown_columns && !raw.trim().is_empty() {
                        issues.push(ColumnIssue {
                            column_index: Some(*column_index),
                            field_id: None,
                            message: format!("unknown column col{}", column_index + 1),
                        });
                    }
                    continue;
                };

                match coerce_csv_cell(field, raw, &options.bool_tokens) {
                    Ok(Some(value)) => {
                        values.insert(field.id, serde_json::to_value(value).map_err(StoreError::from)?);
                    }
                    Ok(None) => {}
                    Err(err) => {
                        issues.push(ColumnIssue {
                            column_index: Some(*column_index),
                            field_id: Some(field.id),
                            message: err.to_string(),
                        });
                    }
                }
            }

            if issues.is_empty() {
                valid_rows.push(ValidRow { values, row_number });
            } else {
                errors.push(RowError { row_number, issues });
            }
        }

        if options.dry_run {
            return Ok(ImportOutcome::DryRun(self.finish_dry_run(
                table_id, &header, &body, &errors, valid_rows.len(), options,
            )));
        }

        self.commit(table_id, user, &header, &body, errors, valid_rows, options)
            .map(ImportOutcome::Commit)
    }

    fn finish_dry_run(
        &self,
        table_id: i64,
        header: &[String],
        body: &[Vec<String>],
        errors: &[RowError],
        valid: usize,
        options: &ImportOptions,
    ) -> DryRunReport {
        self.progress.update(table_id, |p| {
            p.status = ImportPhase::Done;
            p.processed = p.total;
            p.percent = 100;
            p.message = Some("dry run completed".to_string());
            p.finished_at = Some(Utc::now());
        });

        let report = (!errors.is_empty()).then(|| FailureReport {
            generated_at: Utc::now(),
            source: FailureSource::DryRun,
            has_header: options.has_header,
            delimiter: options.delimiter as char,
            total_rows: body.len(),
            failed_count: errors.len(),
            headers: header.to_vec(),
            rows: errors
                .iter()
                .map(|e| failed_row(header, body, e.row_number, options, format_issues(e)))
                .collect(),
        });
        self.progress.set_failure_report(table_id, report);

        DryRunReport {
            total_rows: body.len(),
            valid,
            invalid: errors.len(),
            errors: errors.to_vec(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn commit(
        &self,
        table_id: i64,
        user: &UserRef,
        header: &[String],
        body: &[Vec<String>],
        mut errors: Vec<RowError>,
        valid_rows: Vec<ValidRow>,
        options: &ImportOptions,
    ) -> Result<CommitReport> {
        self.progress.update(table_id, |p| {
            p.status = ImportPhase::Inserting;
            p.processed = 0;
            p.percent = 0;
        });

        let total_to_insert = valid_rows.len();
        let mut created: Vec<i64> = Vec::new();
        let mut insert_error: Option<(usize, String)> = None;

        for (i, row) in valid_rows.into_iter().enumerate() {
            let payload = CreateRecord {
                values: row.values,
                ..Default::default()
            };
            match self.storage.create_record(table_id, &payload) {
                Ok(record) => {
                    created.push(record.id);
                    let processed = i + 1;
                    self.progress.update(table_id, |p| {
                        p.processed = processed;
                        p.total = total_to_insert;
                        p.percent = percent_of(processed, total_to_insert);
                    });
                }
                Err(err) => {
                    let message = err.to_string();
                    self.progress.update(table_id, |p| {
                        p.status = ImportPhase::Error;
                        p.message = Some(message.clone());
                    });
                    insert_error = Some((row.row_number, message));
                    break;
                }
            }
        }

        let mut rolled_back = false;
        if insert_error.is_some() && options.rollback_on_error && !created.is_empty() {
            match self.storage.delete_records(&created) {
                Ok(deleted) => {
                    debug!(table_id, deleted, "import rolled back");
                    rolled_back = true;
                }
                Err(err) => {
                    warn!(table_id, error = %err, "import rollback failed");
                }
            }
        }

        let retained = if rolled_back { 0 } else { created.len() };
        self.storage.audit(
            AuditAction::Import,
            Some(user.id),
            Some(table_id),
            None,
            retained as i64,
        )?;

        // The manifest describes an insertion failure only; validation
        // failures are returned in the report but never retain a manifest.
        // A run whose inserts all succeed clears any prior manifest.
        let report = insert_error.as_ref().map(|(row_number, message)| FailureReport {
            generated_at: Utc::now(),
            source: FailureSource::Import,
            has_header: options.has_header,
            delimiter: options.delimiter as char,
            total_rows: body.len(),
            failed_count: 1,
            headers: header.to_vec(),
            rows: vec![failed_row(
                header,
                body,
                *row_number,
                options,
                vec![message.clone()],
            )],
        });
        self.progress.set_failure_report(table_id, report);

        if insert_error.is_some() {
            self.progress.update(table_id, |p| {
                p.status = ImportPhase::Error;
                p.finished_at = Some(Utc::now());
            });
        } else {
            self.progress.update(table_id, |p| {
                p.status = ImportPhase::Done;
                p.total = body.len();
                p.processed = body.len();
                p.percent = 100;
                p.finished_at = Some(Utc::now());
            });
        }

        if let Some((row_number, message)) = insert_error {
            errors.push(RowError {
                row_number,
                issues: vec![ColumnIssue {
                    column_index: None,
                    field_id: None,
                    message,
                }],
            });
        }
        errors.sort_by_key(|e| e.row_number);
        let invalid = errors.len();

        Ok(CommitReport {
            total_rows: body.len(),
            inserted: retained,
            invalid,
            errors,
            rolled_back,
        })
    }
}

fn split_header(rows: Vec<Vec<String>>, has_header: bool) -> (Vec<String>, Vec<Vec<String>>) {
    if has_header {
        let mut rows = rows.into_iter();
        let header = rows.next().unwrap_or_default();
        (header, rows.collect())
    } else {
        let width = rows.first().map(Vec::len).unwrap_or(0);
        let header = (0..width).map(|i| format!("col{}", i + 1)).collect();
        (header, rows)
    }
}

/// Resolve each source column to a field: the explicit client mapping wins;
/// otherwise headers match fields by exact name, then by field id rendered
/// as a string. Unmatched columns carry no field.
fn build_mapping(
    header: &[String],
    fields: &[Field],
    options: &ImportOptions,
) -> Result<Vec<(usize, Option<Field>)>> {
    let by_id: HashMap<i64, &Field> = fields.iter().map(|f| (f.id, f)).collect();

    if let Some(mapping) = options.mapping.as_ref().filter(|m| !m.is_empty()) {
        let mut out = Vec::with_capacity(mapping.len());
        let mut indices: Vec<&usize> = mapping.keys().collect();
        indices.sort();
        for index in indices {
            let field_id = mapping[index];
            let field = by_id
                .get(&field_id)
                .copied()
                .ok_or(ImportError::UnknownMappedField(field_id))?;
            out.push((*index, Some(field.clone())));
        }
        return Ok(out);
    }

    let by_name: HashMap<&str, &Field> = fields.iter().map(|f| (f.name.as_str(), f)).collect();
    Ok(header
        .iter()
        .enumerate()
        .map(|(index, name)| {
            let field = by_name
                .get(name.as_str())
                .copied()
                .or_else(|| {
                    name.parse::<i64>()
                        .ok()
                        .and_then(|id| by_id.get(&id).copied())
                })
                .cloned();
            (index, field)
        })
        .collect())
}

fn format_issues(error: &RowError) -> Vec<String> {
    error
        .issues
        .iter()
        .map(|issue| match (issue.column_index, issue.field_id) {
            (Some(col), Some(fid)) => format!("col{}(#{}): {}", col + 1, fid, issue.message),
            (Some(col), None) => format!("col{}: {}", col + 1, issue.message),
            _ => issue.message.clone(),
        })
        .collect()
}

fn failed_row(
    header: &[String],
    body: &[Vec<String>],
    row_number: usize,
    options: &ImportOptions,
    errors: Vec<String>,
) -> FailedRow {
    let offset = if options.has_header { 2 } else { 1 };
    let source = body.get(row_number.saturating_sub(offset));
    let values = header
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let cell = source
                .and_then(|row| row.get(i))
                .cloned()
                .unwrap_or_default();
            (name.clone(), cell)
        })
        .collect();
    FailedRow {
        row_number,
        values,
        errors,
    }
}

/// Parse raw bytes into rows of decoded strings. Quote-aware via the csv
/// crate (embedded delimiters/newlines, doubled-quote escaping, CR/LF),
/// flexible about ragged column counts. Rows with nothing but empty cells
/// are dropped.
fn parse_rows(bytes: &[u8], options: &ImportOptions) -> Result<Vec<Vec<String>>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(options.delimiter)
        // Headers are handled manually so row numbering stays consistent.
        .has_headers(false)
        .flexible(true)
        .from_reader(bytes);

    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut record = ByteRecord::new();
    let mut record_index: u64 = 0;

    loop {
        record.clear();
        match reader.read_byte_record(&mut record) {
            Ok(false) => break,
            Ok(true) => {
                record_index += 1;
                let row = decode_record(&record, record_index, options.encoding)?;
                // Single-field blank lines are noise; a delimited row of
                // empty cells is a real (empty) record and keeps its line
                // number.
                if row.len() <= 1 && row.iter().all(|cell| cell.trim().is_empty()) {
                    continue;
                }
                rows.push(row);
            }
            Err(err) => return Err(map_csv_error(err, record_index + 1)),
        }
    }

    Ok(rows)
}

fn decode_record(
    record: &ByteRecord,
    row: u64,
    encoding: TextEncoding,
) -> Result<Vec<String>> {
    let mut out = Vec::with_capacity(record.len());
    for (idx, field) in record.iter().enumerate() {
        let s = decode_field(field, row, idx as u64 + 1, encoding)?;
        out.push(s.into_owned());
    }
    Ok(out)
}

fn decode_field<'a>(
    field: &'a [u8],
    row: u64,
    column: u64,
    encoding: TextEncoding,
) -> Result<Cow<'a, str>> {
    // Strip a UTF-8 BOM at the start of the file; spreadsheet exports
    // commonly carry one.
    let field = if row == 1 && column == 1 && field.starts_with(&[0xEF, 0xBB, 0xBF]) {
        &field[3..]
    } else {
        field
    };

    match encoding {
        TextEncoding::Utf8 => std::str::from_utf8(field)
            .map(Cow::Borrowed)
            .map_err(|e| ImportError::Parse {
                row,
                reason: format!("invalid UTF-8 in column {column}: {e}"),
            }),
        TextEncoding::Windows1252 => {
            let (cow, _, _) = WINDOWS_1252.decode(field);
            Ok(cow)
        }
        TextEncoding::Auto => match std::str::from_utf8(field) {
            Ok(s) => Ok(Cow::Borrowed(s)),
            Err(_) => {
                let (cow, _, _) = WINDOWS_1252.decode(field);
                Ok(cow)
            }
        },
    }
}

fn map_csv_error(err: csv::Error, fallback_row: u64) -> ImportError {
    let reason = err.to_string();
    let pos = err.position().cloned();

    match err.into_kind() {
        csv::ErrorKind::Io(e) => ImportError::Io(e),
        _ => {
            let row = pos
                .map(|p| p.record())
                .filter(|r| *r > 0)
                .unwrap_or(fallback_row);
            ImportError::Parse { row, reason }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> ImportOptions {
        ImportOptions::default()
    }

    #[test]
    fn parses_quoted_fields_and_crlf() {
        let bytes = b"name,note\r\n\"Smith, Jane\",\"says \"\"hi\"\"\"\r\nplain,\"multi\nline\"\r\n";
        let rows = parse_rows(bytes, &opts()).expect("parse");
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1], vec!["Smith, Jane", "says \"hi\""]);
        assert_eq!(rows[2], vec!["plain", "multi\nline"]);
    }

    #[test]
    fn tab_delimiter() {
        let bytes = b"a\tb\n1\t2\n";
        let options = ImportOptions {
            delimiter: b'\t',
            ..opts()
        };
        let rows = parse_rows(bytes, &options).expect("parse");
        assert_eq!(rows, vec![vec!["a", "b"], vec!["1", "2"]]);
    }

    #[test]
    fn strips_utf8_bom() {
        let bytes = b"\xEF\xBB\xBFname\nvalue\n";
        let rows = parse_rows(bytes, &opts()).expect("parse");
        assert_eq!(rows[0], vec!["name"]);
    }

    #[test]
    fn latin1_fallback_in_auto_mode() {
        // 0xE9 is 'é' in Windows-1252 and invalid UTF-8.
        let bytes = b"name\ncaf\xE9\n";
        let rows = parse_rows(bytes, &opts()).expect("parse");
        assert_eq!(rows[1], vec!["café"]);
    }

    #[test]
    fn only_single_field_blank_lines_are_dropped() {
        let bytes = b"a,b\n\n1,2\n  \n  ,  \n";
        let rows = parse_rows(bytes, &opts()).expect("parse");
        assert_eq!(rows.len(), 3);
        // A delimited row of empty cells survives as an empty record.
        assert_eq!(rows[2], vec!["  ", "  "]);
    }

    #[test]
    fn synthesized_headers_without_header_row() {
        let rows = vec![vec!["1".to_string(), "2".to_string()]];
        let (header, body) = split_header(rows, false);
        assert_eq!(header, vec!["col1", "col2"]);
        assert_eq!(body.len(), 1);
    }
}
