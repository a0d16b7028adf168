use std::collections::HashMap;

use gridbase_import::{
    ImportError, ImportOptions, ImportOutcome, ImportPhase, Importer,
};
use gridbase_model::{CellValue, FieldType};
use gridbase_storage::{AuditAction, ListQuery, Role, Storage, UserRef};
use pretty_assertions::assert_eq;
use serde_json::json;

fn editor() -> UserRef {
    UserRef {
        id: 3,
        role: Role::Editor,
    }
}

struct Fixture {
    importer: Importer,
    storage: Storage,
    table_id: i64,
    name_id: i64,
    qty_id: i64,
    flag_id: i64,
}

fn fixture() -> Fixture {
    let storage = Storage::open_in_memory().expect("open");
    let table = storage.create_table("parts", None, None).expect("table");
    let name = storage
        .create_field(table.id, "name", FieldType::Text, None, false)
        .expect("name");
    let qty = storage
        .create_field(
            table.id,
            "qty",
            FieldType::Number,
            Some(json!({ "min": 0.0, "precision": 2 })),
            false,
        )
        .expect("qty");
    let flag = storage
        .create_field(table.id, "flag", FieldType::Boolean, None, false)
        .expect("flag");
    storage
        .create_field(table.id, "locked", FieldType::Text, None, true)
        .expect("locked");
    Fixture {
        importer: Importer::new(storage.clone()),
        storage,
        table_id: table.id,
        name_id: name.id,
        qty_id: qty.id,
        flag_id: flag.id,
    }
}

fn record_count(storage: &Storage, table_id: i64) -> usize {
    storage
        .list_records(table_id, &ListQuery::default())
        .expect("list")
        .total
}

#[test]
fn dry_run_reports_without_writing() {
    let fx = fixture();
    let csv = b"name,qty\nbolts,4\nnuts,abc\nwashers,2\n";

    let outcome = fx
        .importer
        .import_csv(
            fx.table_id,
            &editor(),
            csv,
            &ImportOptions {
                dry_run: true,
                ..Default::default()
            },
        )
        .expect("dry run");

    let report = match outcome {
        ImportOutcome::DryRun(r) => r,
        other => panic!("expected dry run outcome, got {other:?}"),
    };
    assert_eq!(report.total_rows, 3);
    assert_eq!(report.valid, 2);
    assert_eq!(report.invalid, 1);
    // Header is line 1, so the bad "nuts" row is line 3.
    assert_eq!(report.errors[0].row_number, 3);
    assert_eq!(report.errors[0].issues[0].field_id, Some(fx.qty_id));

    assert_eq!(record_count(&fx.storage, fx.table_id), 0);

    let progress = fx.importer.progress(fx.table_id);
    assert_eq!(progress.status, ImportPhase::Done);
    assert!(progress.run_id.is_some());

    let manifest = fx.importer.failure_report(fx.table_id).expect("manifest");
    assert_eq!(manifest.failed_count, 1);
    assert_eq!(manifest.rows[0].row_number, 3);

    // Committing the same bytes inserts exactly the reported valid count.
    let outcome = fx
        .importer
        .import_csv(fx.table_id, &editor(), csv, &ImportOptions::default())
        .expect("commit");
    match outcome {
        ImportOutcome::Commit(r) => assert_eq!(r.inserted, report.valid),
        other => panic!("expected commit outcome, got {other:?}"),
    }
    assert_eq!(record_count(&fx.storage, fx.table_id), report.valid);
}

#[test]
fn commit_inserts_valid_rows_and_skips_invalid() {
    let fx = fixture();
    let csv = b"name,qty\nbolts,4\nnuts,abc\nwashers,2\n";

    let outcome = fx
        .importer
        .import_csv(fx.table_id, &editor(), csv, &ImportOptions::default())
        .expect("commit");

    let report = match outcome {
        ImportOutcome::Commit(r) => r,
        other => panic!("expected commit outcome, got {other:?}"),
    };
    assert_eq!(report.total_rows, 3);
    assert_eq!(report.inserted, 2);
    assert_eq!(report.invalid, 1);
    assert!(!report.rolled_back);

    assert_eq!(record_count(&fx.storage, fx.table_id), 2);

    let progress = fx.importer.progress(fx.table_id);
    assert_eq!(progress.status, ImportPhase::Done);
    assert_eq!(progress.percent, 100);

    // The manifest only ever describes an insertion failure; a run whose
    // inserts all succeed keeps none, even with skipped rows.
    assert_eq!(fx.importer.failure_report(fx.table_id), None);
}

#[test]
fn successful_inserts_clear_manifest_despite_skipped_rows() {
    let fx = fixture();
    let csv = b"name,qty\nbolts,4\nnuts,abc\n";

    // Seed a manifest from a failing dry run.
    fx.importer
        .import_csv(
            fx.table_id,
            &editor(),
            csv,
            &ImportOptions {
                dry_run: true,
                ..Default::default()
            },
        )
        .expect("dry run");
    assert!(fx.importer.failure_report(fx.table_id).is_some());

    // The commit skips the invalid row but every insertion succeeds, so
    // the prior manifest is cleared.
    let outcome = fx
        .importer
        .import_csv(fx.table_id, &editor(), csv, &ImportOptions::default())
        .expect("commit");
    match outcome {
        ImportOutcome::Commit(r) => {
            assert_eq!(r.inserted, 1);
            assert_eq!(r.invalid, 1);
        }
        other => panic!("expected commit outcome, got {other:?}"),
    }
    assert_eq!(fx.importer.failure_report(fx.table_id), None);
}

#[test]
fn clean_commit_clears_previous_manifest() {
    let fx = fixture();
    let bad = b"name,qty\nnuts,abc\n";
    let good = b"name,qty\nbolts,4\n";

    fx.importer
        .import_csv(fx.table_id, &editor(), bad, &ImportOptions::default())
        .expect("bad run");
    assert!(fx.importer.failure_report(fx.table_id).is_some());

    fx.importer
        .import_csv(fx.table_id, &editor(), good, &ImportOptions::default())
        .expect("good run");
    assert_eq!(fx.importer.failure_report(fx.table_id), None);
}

#[test]
fn insert_failure_rolls_back_earlier_rows() {
    let fx = fixture();
    // Rows 1 and 2 leave the readonly column blank; row 3 writes to it,
    // which only fails at insert time.
    let csv = b"name,qty,locked\nbolts,4,\nnuts,1,\nwashers,2,x\n";

    let outcome = fx
        .importer
        .import_csv(fx.table_id, &editor(), csv, &ImportOptions::default())
        .expect("commit");

    let report = match outcome {
        ImportOutcome::Commit(r) => r,
        other => panic!("expected commit outcome, got {other:?}"),
    };
    assert_eq!(report.inserted, 0);
    assert!(report.rolled_back);
    assert_eq!(report.invalid, 1);
    assert_eq!(report.errors[0].row_number, 4);

    assert_eq!(record_count(&fx.storage, fx.table_id), 0);
    assert_eq!(fx.importer.progress(fx.table_id).status, ImportPhase::Error);

    let entry = fx
        .storage
        .audit_entries(fx.table_id)
        .expect("audit")
        .into_iter()
        .rev()
        .find(|e| e.action == AuditAction::Import)
        .expect("import entry");
    assert_eq!(entry.row_count, 0);
}

#[test]
fn rollback_can_be_disabled() {
    let fx = fixture();
    let csv = b"name,qty,locked\nbolts,4,\nnuts,1,\nwashers,2,x\n";

    let outcome = fx
        .importer
        .import_csv(
            fx.table_id,
            &editor(),
            csv,
            &ImportOptions {
                rollback_on_error: false,
                ..Default::default()
            },
        )
        .expect("commit");

    let report = match outcome {
        ImportOutcome::Commit(r) => r,
        other => panic!("expected commit outcome, got {other:?}"),
    };
    assert_eq!(report.inserted, 2);
    assert!(!report.rolled_back);
    assert_eq!(record_count(&fx.storage, fx.table_id), 2);
}

#[test]
fn explicit_mapping_with_unknown_field_is_an_error() {
    let fx = fixture();
    let mut mapping = HashMap::new();
    mapping.insert(0usize, 9999i64);

    let err = fx
        .importer
        .import_csv(
            fx.table_id,
            &editor(),
            b"x\n1\n",
            &ImportOptions {
                mapping: Some(mapping),
                ..Default::default()
            },
        )
        .expect_err("bad mapping");
    assert!(matches!(err, ImportError::UnknownMappedField(9999)));
    assert_eq!(record_count(&fx.storage, fx.table_id), 0);
}

#[test]
fn unmatched_columns_are_skipped_or_flagged() {
    let fx = fixture();
    let csv = b"name,mystery\nbolts,surprise\n";

    // Default: unknown columns are ignored and the row still imports.
    let outcome = fx
        .importer
        .import_csv(fx.table_id, &editor(), csv, &ImportOptions::default())
        .expect("lenient");
    match outcome {
        ImportOutcome::Commit(r) => assert_eq!(r.inserted, 1),
        other => panic!("expected commit outcome, got {other:?}"),
    }

    // Strict: a populated unknown column fails its row.
    let outcome = fx
        .importer
        .import_csv(
            fx.table_id,
            &editor(),
            csv,
            &ImportOptions {
                ignore_unknown_columns: false,
                dry_run: true,
                ..Default::default()
            },
        )
        .expect("strict");
    match outcome {
        ImportOutcome::DryRun(r) => {
            assert_eq!(r.valid, 0);
            assert_eq!(r.errors[0].issues[0].column_index, Some(1));
        }
        other => panic!("expected dry run outcome, got {other:?}"),
    }
}

#[test]
fn blank_cell_rows_keep_line_numbers_of_later_rows() {
    let fx = fixture();
    // Line 2 is a delimited row of empty cells; it validates as an empty
    // record and must not shift the bad row's reported line number.
    let csv = b"name,qty\n , \nnuts,abc\n";

    let outcome = fx
        .importer
        .import_csv(
            fx.table_id,
            &editor(),
            csv,
            &ImportOptions {
                dry_run: true,
                ..Default::default()
            },
        )
        .expect("dry run");

    let report = match outcome {
        ImportOutcome::DryRun(r) => r,
        other => panic!("expected dry run outcome, got {other:?}"),
    };
    assert_eq!(report.total_rows, 2);
    assert_eq!(report.valid, 1);
    assert_eq!(report.errors[0].row_number, 3);
}

#[test]
fn viewer_cannot_import() {
    let fx = fixture();
    let viewer = UserRef {
        id: 1,
        role: Role::Viewer,
    };
    let err = fx
        .importer
        .import_csv(fx.table_id, &viewer, b"name\nbolts\n", &ImportOptions::default())
        .expect_err("forbidden");
    assert!(matches!(err, ImportError::Forbidden(Role::Viewer)));
}

#[test]
fn empty_input_is_an_error() {
    let fx = fixture();
    let err = fx
        .importer
        .import_csv(fx.table_id, &editor(), b"", &ImportOptions::default())
        .expect_err("empty");
    assert!(matches!(err, ImportError::EmptyInput));

    // Only blank lines is just as empty.
    let err = fx
        .importer
        .import_csv(fx.table_id, &editor(), b"\n\n  \n", &ImportOptions::default())
        .expect_err("blank");
    assert!(matches!(err, ImportError::EmptyInput));
}

#[test]
fn tab_delimited_without_header_uses_explicit_mapping() {
    let fx = fixture();
    let mut mapping = HashMap::new();
    mapping.insert(0usize, fx.name_id);
    mapping.insert(1usize, fx.qty_id);

    let outcome = fx
        .importer
        .import_csv(
            fx.table_id,
            &editor(),
            b"bolts\t4\nnuts\t1\n",
            &ImportOptions {
                delimiter: b'\t',
                has_header: false,
                mapping: Some(mapping),
                ..Default::default()
            },
        )
        .expect("commit");

    match outcome {
        ImportOutcome::Commit(r) => {
            assert_eq!(r.total_rows, 2);
            assert_eq!(r.inserted, 2);
        }
        other => panic!("expected commit outcome, got {other:?}"),
    }
}

#[test]
fn headers_match_by_field_id_string() {
    let fx = fixture();
    let csv = format!("name,{}\nbolts,4\n", fx.qty_id);

    let outcome = fx
        .importer
        .import_csv(
            fx.table_id,
            &editor(),
            csv.as_bytes(),
            &ImportOptions::default(),
        )
        .expect("commit");
    match outcome {
        ImportOutcome::Commit(r) => assert_eq!(r.inserted, 1),
        other => panic!("expected commit outcome, got {other:?}"),
    }

    let page = fx
        .storage
        .list_records(fx.table_id, &ListQuery::default())
        .expect("list");
    assert_eq!(page.data[0].values[&fx.qty_id], CellValue::Number(4.0));
}

#[test]
fn imported_values_are_coerced_like_batch_writes() {
    let fx = fixture();
    let csv = b"name,qty,flag\nbolts,\"1,234.5\",yes\nnuts,0.125,0\n";

    fx.importer
        .import_csv(fx.table_id, &editor(), csv, &ImportOptions::default())
        .expect("commit");

    let page = fx
        .storage
        .list_records(fx.table_id, &ListQuery::default())
        .expect("list");
    assert_eq!(page.data[0].values[&fx.qty_id], CellValue::Number(1234.5));
    assert_eq!(page.data[0].values[&fx.flag_id], CellValue::Boolean(true));
    // 0.125 rounds half away from zero at precision 2.
    assert_eq!(page.data[1].values[&fx.qty_id], CellValue::Number(0.13));
    assert_eq!(page.data[1].values[&fx.flag_id], CellValue::Boolean(false));
}

#[test]
fn manifest_downloads_as_csv() {
    let fx = fixture();
    let csv = b"name,qty\nnuts,abc\n";

    fx.importer
        .import_csv(
            fx.table_id,
            &editor(),
            csv,
            &ImportOptions {
                dry_run: true,
                ..Default::default()
            },
        )
        .expect("dry run");

    let bytes = fx.importer.failure_report_csv(fx.table_id).expect("csv");
    let text = String::from_utf8(bytes).expect("utf8");
    let mut lines = text.lines();
    assert_eq!(lines.next(), Some("row,name,qty,errors"));
    let failed = lines.next().expect("failed row");
    assert!(failed.starts_with("2,nuts,abc,"));
    assert!(failed.contains("qty expects number"));
}

#[test]
fn formula_columns_cannot_be_imported() {
    let fx = fixture();
    let total = fx
        .storage
        .create_field(fx.table_id, "total", FieldType::Formula, None, false)
        .expect("formula field");
    let csv = b"name,total\nbolts,1 + 1\n";

    let outcome = fx
        .importer
        .import_csv(
            fx.table_id,
            &editor(),
            csv,
            &ImportOptions {
                dry_run: true,
                ..Default::default()
            },
        )
        .expect("dry run");
    match outcome {
        ImportOutcome::DryRun(r) => {
            assert_eq!(r.valid, 0);
            assert_eq!(r.errors[0].issues[0].field_id, Some(total.id));
        }
        other => panic!("expected dry run outcome, got {other:?}"),
    }
}
