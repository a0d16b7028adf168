use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

/// Phase of the most recent import run against a table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportPhase {
    #[default]
    Idle,
    Validating,
    Inserting,
    Done,
    Error,
}

/// Observable state of the most recent import run for a table.
///
/// `run_id` is minted fresh per run, so a caller polling progress can tell
/// when a newer import has overwritten the one it started (last-writer-wins
/// is the documented behavior for concurrent runs on one table).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub status: ImportPhase,
    pub total: usize,
    pub processed: usize,
    pub percent: u8,
    pub message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub run_id: Option<Uuid>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureSource {
    DryRun,
    Import,
}

/// One failed source row: its 1-based line number, the original column
/// values in header order, and the error messages attributed to it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FailedRow {
    pub row_number: usize,
    pub values: Vec<(String, String)>,
    pub errors: Vec<String>,
}

/// Manifest of the most recent failed import or dry-run for a table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    pub generated_at: DateTime<Utc>,
    pub source: FailureSource,
    pub has_header: bool,
    pub delimiter: char,
    pub total_rows: usize,
    pub failed_count: usize,
    pub headers: Vec<String>,
    pub rows: Vec<FailedRow>,
}

impl FailureReport {
    /// Render the manifest as CSV bytes for download: line number, the
    /// original cells in header order, then the joined error messages.
    pub fn to_csv(&self) -> Vec<u8> {
        let mut writer = csv::Writer::from_writer(Vec::new());

        let mut header = Vec::with_capacity(self.headers.len() + 2);
        header.push("row".to_string());
        header.extend(self.headers.iter().cloned());
        header.push("errors".to_string());
        // Writing into a Vec<u8> cannot fail.
        let _ = writer.write_record(&header);

        for row in &self.rows {
            let mut out = Vec::with_capacity(self.headers.len() + 2);
            out.push(row.row_number.to_string());
            for name in &self.headers {
                let cell = row
                    .values
                    .iter()
                    .find(|(k, _)| k == name)
                    .map(|(_, v)| v.clone())
                    .unwrap_or_default();
                out.push(cell);
            }
            out.push(row.errors.join("; "));
            let _ = writer.write_record(&out);
        }

        writer.into_inner().unwrap_or_default()
    }
}

#[derive(Debug, Default)]
struct TableImportState {
    progress: ProgressSnapshot,
    report: Option<FailureReport>,
}

/// Process-wide import state, keyed by table id.
///
/// A second import started against the same table before the first finishes
/// overwrites the first's progress and report; the `run_id` in each snapshot
/// makes that takeover observable.
#[derive(Debug, Default)]
pub struct ProgressStore {
    inner: Mutex<HashMap<i64, TableImportState>>,
}

impl ProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a fresh run for a table, replacing any previous progress.
    pub fn begin_run(&self, table_id: i64, total: usize) -> Uuid {
        let run_id = Uuid::new_v4();
        let mut inner = self.inner.lock().expect("progress mutex poisoned");
        let state = inner.entry(table_id).or_default();
        state.progress = ProgressSnapshot {
            status: ImportPhase::Validating,
            total,
            processed: 0,
            percent: 0,
            message: None,
            started_at: Some(Utc::now()),
            finished_at: None,
            run_id: Some(run_id),
        };
        run_id
    }

    /// Merge a change into a table's snapshot.
    pub fn update(&self, table_id: i64, apply: impl FnOnce(&mut ProgressSnapshot)) {
        let mut inner = self.inner.lock().expect("progress mutex poisoned");
        let state = inner.entry(table_id).or_default();
        apply(&mut state.progress);
    }

    /// Current snapshot, defaulting to idle when no import was ever run.
    pub fn progress(&self, table_id: i64) -> ProgressSnapshot {
        let inner = self.inner.lock().expect("progress mutex poisoned");
        inner
            .get(&table_id)
            .map(|state| state.progress.clone())
            .unwrap_or_default()
    }

    /// Store or clear the failure manifest. A report with zero failed rows
    /// is equivalent to clearing.
    pub fn set_failure_report(&self, table_id: i64, report: Option<FailureReport>) {
        let mut inner = self.inner.lock().expect("progress mutex poisoned");
        let state = inner.entry(table_id).or_default();
        state.report = report.filter(|r| r.failed_count > 0);
    }

    pub fn failure_report(&self, table_id: i64) -> Option<FailureReport> {
        let inner = self.inner.lock().expect("progress mutex poisoned");
        inner.get(&table_id).and_then(|state| state.report.clone())
    }
}

pub(crate) fn percent_of(processed: usize, total: usize) -> u8 {
    let total = total.max(1);
    let pct = (processed as f64 / total as f64 * 100.0).round();
    pct.clamp(0.0, 100.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_idle() {
        let store = ProgressStore::new();
        let snapshot = store.progress(42);
        assert_eq!(snapshot.status, ImportPhase::Idle);
        assert_eq!(snapshot.total, 0);
        assert_eq!(snapshot.percent, 0);
        assert_eq!(snapshot.run_id, None);
    }

    #[test]
    fn runs_get_distinct_ids_and_overwrite() {
        let store = ProgressStore::new();
        let first = store.begin_run(1, 10);
        store.update(1, |p| {
            p.processed = 5;
            p.percent = 50;
        });
        let second = store.begin_run(1, 3);
        assert_ne!(first, second);

        let snapshot = store.progress(1);
        assert_eq!(snapshot.run_id, Some(second));
        assert_eq!(snapshot.total, 3);
        assert_eq!(snapshot.processed, 0);
    }

    #[test]
    fn zero_failure_report_clears() {
        let store = ProgressStore::new();
        let report = FailureReport {
            generated_at: Utc::now(),
            source: FailureSource::DryRun,
            has_header: true,
            delimiter: ',',
            total_rows: 4,
            failed_count: 1,
            headers: vec!["a".into()],
            rows: vec![FailedRow {
                row_number: 2,
                values: vec![("a".into(), "x".into())],
                errors: vec!["a expects number".into()],
            }],
        };
        store.set_failure_report(7, Some(report.clone()));
        assert!(store.failure_report(7).is_some());

        let clean = FailureReport {
            failed_count: 0,
            rows: Vec::new(),
            ..report
        };
        store.set_failure_report(7, Some(clean));
        assert_eq!(store.failure_report(7), None);
    }

    #[test]
    fn report_renders_as_csv() {
        let report = FailureReport {
            generated_at: Utc::now(),
            source: FailureSource::Import,
            has_header: true,
            delimiter: ',',
            total_rows: 2,
            failed_count: 1,
            headers: vec!["name".into(), "qty".into()],
            rows: vec![FailedRow {
                row_number: 3,
                values: vec![("name".into(), "ok".into()), ("qty".into(), "x".into())],
                errors: vec!["qty expects number".into()],
            }],
        };
        let csv = String::from_utf8(report.to_csv()).expect("utf8");
        let mut lines = csv.lines();
        assert_eq!(lines.next(), Some("row,name,qty,errors"));
        assert_eq!(lines.next(), Some("3,ok,x,qty expects number"));
    }

    #[test]
    fn percent_rounds_and_clamps() {
        assert_eq!(percent_of(0, 0), 0);
        assert_eq!(percent_of(1, 3), 33);
        assert_eq!(percent_of(2, 3), 67);
        assert_eq!(percent_of(3, 3), 100);
        assert_eq!(percent_of(5, 3), 100);
    }
}
