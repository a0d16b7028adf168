use crate::query::{cmp_cells, filter_matches, ListQuery, RecordPage};
use crate::schema;
use crate::types::{
    AuditAction, AuditEntry, BatchWriteOutcome, CellConflict, CellSlot, CellWrite, CreateRecord,
    Record, RecordData, Role, TableMeta, UpdateRecord, UserRef,
};
use chrono::{DateTime, Utc};
use gridbase_model::{formula, validate_cell, CellValue, CoercedCell, Field, FieldOptions, FieldType, ValueError};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use serde_json::Value as Json;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Validation(#[from] ValueError),
    #[error("table not found: {0}")]
    TableNotFound(i64),
    #[error("record not found: {0}")]
    RecordNotFound(i64),
    #[error("field not found: {0}")]
    FieldNotFound(i64),
    #[error("unsupported field type: {0}")]
    UnsupportedFieldType(String),
    #[error("record {0} is readonly")]
    ReadonlyRecord(i64),
    #[error("field {0} is readonly")]
    ReadonlyField(String),
    #[error("{0} is not a formula field")]
    NotFormulaField(String),
    #[error("writes required")]
    EmptyBatch,
    #[error("revision conflict: latest revision is {latest}")]
    RevisionConflict {
        latest: i64,
        conflicts: Vec<CellConflict>,
    },
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone)]
pub struct Storage {
    conn: Arc<Mutex<Connection>>,
}

impl Storage {
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        schema::init(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.busy_timeout(Duration::from_secs(5))?;
        schema::init(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_uri(uri: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI;
        let conn = Connection::open_with_flags(uri, flags)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        schema::init(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ---- tables ----

    pub fn create_table(
        &self,
        name: &str,
        metadata: Option<Json>,
        export_roles: Option<Vec<Role>>,
    ) -> Result<TableMeta> {
        let export_roles =
            export_roles.unwrap_or_else(|| vec![Role::Editor, Role::Exporter, Role::Admin]);
        let roles_json = serde_json::to_value(&export_roles)?;

        let mut conn = self.conn.lock().expect("storage mutex poisoned");
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO tables (name, revision, metadata, export_roles) VALUES (?1, 0, ?2, ?3)",
            params![name, metadata, roles_json],
        )?;
        let id = tx.last_insert_rowid();
        append_audit(&tx, AuditAction::SchemaChange, None, Some(id), None, 1)?;
        tx.commit()?;

        Ok(TableMeta {
            id,
            name: name.to_string(),
            revision: 0,
            metadata,
            export_roles,
        })
    }

    pub fn get_table(&self, id: i64) -> Result<TableMeta> {
        let conn = self.conn.lock().expect("storage mutex poisoned");
        fetch_table(&conn, id)
    }

    pub fn list_tables(&self) -> Result<Vec<TableMeta>> {
        let conn = self.conn.lock().expect("storage mutex poisoned");
        let mut stmt =
            conn.prepare("SELECT id, name, revision, metadata, export_roles FROM tables ORDER BY id")?;
        let rows = stmt.query_map([], table_from_row)?;
        let mut tables = Vec::new();
        for table in rows {
            tables.push(table?);
        }
        Ok(tables)
    }

    /// Update table metadata. A structural change, so the revision advances.
    pub fn update_table(
        &self,
        id: i64,
        name: Option<&str>,
        metadata: Option<Json>,
        export_roles: Option<Vec<Role>>,
    ) -> Result<TableMeta> {
        let mut conn = self.conn.lock().expect("storage mutex poisoned");
        let tx = conn.transaction()?;
        let mut table = fetch_table(&tx, id)?;

        if let Some(name) = name {
            table.name = name.to_string();
        }
        if let Some(metadata) = metadata {
            table.metadata = Some(metadata);
        }
        if let Some(roles) = export_roles {
            table.export_roles = roles;
        }
        table.revision += 1;

        tx.execute(
            "UPDATE tables SET name = ?2, metadata = ?3, export_roles = ?4, revision = ?5 WHERE id = ?1",
            params![
                id,
                &table.name,
                table.metadata.clone(),
                serde_json::to_value(&table.export_roles)?,
                table.revision
            ],
        )?;
        append_audit(&tx, AuditAction::SchemaChange, None, Some(id), None, 1)?;
        tx.commit()?;
        Ok(table)
    }

    pub fn delete_table(&self, id: i64) -> Result<()> {
        let mut conn = self.conn.lock().expect("storage mutex poisoned");
        let tx = conn.transaction()?;
        fetch_table(&tx, id)?;
        tx.execute("DELETE FROM tables WHERE id = ?1", params![id])?;
        append_audit(&tx, AuditAction::SchemaChange, None, Some(id), None, 1)?;
        tx.commit()?;
        Ok(())
    }

    // ---- fields ----

    pub fn create_field(
        &self,
        table_id: i64,
        name: &str,
        field_type: FieldType,
        options: Option<Json>,
        readonly: bool,
    ) -> Result<Field> {
        let mut conn = self.conn.lock().expect("storage mutex poisoned");
        let tx = conn.transaction()?;
        fetch_table(&tx, table_id)?;

        tx.execute(
            "INSERT INTO fields (table_id, name, field_type, options, readonly) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![table_id, name, field_type.as_str(), options.clone(), readonly as i64],
        )?;
        let id = tx.last_insert_rowid();
        bump_revision(&tx, table_id)?;
        append_audit(&tx, AuditAction::SchemaChange, None, Some(table_id), None, 1)?;
        tx.commit()?;

        Ok(Field {
            id,
            table_id,
            name: name.to_string(),
            field_type,
            options: FieldOptions::from_json(options.as_ref()),
            readonly,
        })
    }

    pub fn get_field(&self, table_id: i64, field_id: i64) -> Result<Field> {
        let conn = self.conn.lock().expect("storage mutex poisoned");
        fetch_field(&conn, table_id, field_id)
    }

    pub fn list_fields(&self, table_id: i64) -> Result<Vec<Field>> {
        let conn = self.conn.lock().expect("storage mutex poisoned");
        fetch_fields(&conn, table_id)
    }

    pub fn update_field(
        &self,
        table_id: i64,
        field_id: i64,
        name: Option<&str>,
        options: Option<Json>,
        readonly: Option<bool>,
    ) -> Result<Field> {
        let mut conn = self.conn.lock().expect("storage mutex poisoned");
        let tx = conn.transaction()?;
        let mut field = fetch_field(&tx, table_id, field_id)?;

        if let Some(name) = name {
            field.name = name.to_string();
        }
        if let Some(options) = options.as_ref() {
            field.options = FieldOptions::from_json(Some(options));
        }
        if let Some(readonly) = readonly {
            field.readonly = readonly;
        }

        tx.execute(
            "UPDATE fields SET name = ?2, options = ?3, readonly = ?4 WHERE id = ?1",
            params![
                field_id,
                &field.name,
                serde_json::to_value(&field.options)?,
                field.readonly as i64
            ],
        )?;
        bump_revision(&tx, table_id)?;
        append_audit(&tx, AuditAction::SchemaChange, None, Some(table_id), None, 1)?;
        tx.commit()?;
        Ok(field)
    }

    pub fn delete_field(&self, table_id: i64, field_id: i64) -> Result<()> {
        let mut conn = self.conn.lock().expect("storage mutex poisoned");
        let tx = conn.transaction()?;
        fetch_field(&tx, table_id, field_id)?;
        tx.execute("DELETE FROM fields WHERE id = ?1", params![field_id])?;
        bump_revision(&tx, table_id)?;
        append_audit(&tx, AuditAction::SchemaChange, None, Some(table_id), None, 1)?;
        tx.commit()?;
        Ok(())
    }

    // ---- records ----

    /// Create a record with its initial cell values. Every value runs
    /// through the shared validator and formulas are recomputed before the
    /// transaction commits, so a record is never observable half-validated.
    pub fn create_record(&self, table_id: i64, payload: &CreateRecord) -> Result<Record> {
        let mut conn = self.conn.lock().expect("storage mutex poisoned");
        let tx = conn.transaction()?;
        fetch_table(&tx, table_id)?;
        let fields = fetch_fields(&tx, table_id)?;
        let by_id: HashMap<i64, &Field> = fields.iter().map(|f| (f.id, f)).collect();

        tx.execute(
            "INSERT INTO records (table_id, readonly, metadata) VALUES (?1, ?2, ?3)",
            params![table_id, payload.readonly as i64, payload.metadata.clone()],
        )?;
        let record_id = tx.last_insert_rowid();

        let mut keys: BTreeSet<i64> = payload.values.keys().copied().collect();
        keys.extend(payload.formulas.keys().copied());

        for field_id in keys {
            let field = by_id
                .get(&field_id)
                .copied()
                .ok_or(StoreError::FieldNotFound(field_id))?;
            if field.readonly {
                return Err(StoreError::ReadonlyField(field.name.clone()));
            }
            let formula_expr = payload.formulas.get(&field_id).map(String::as_str);
            if formula_expr.is_some() && field.field_type != FieldType::Formula {
                return Err(StoreError::NotFormulaField(field.name.clone()));
            }
            let coerced = validate_cell(field, payload.values.get(&field_id), formula_expr)?;
            upsert_cell(&tx, record_id, field_id, &coerced)?;
        }

        recompute_formulas(&tx, &fields, record_id)?;
        tx.commit()?;

        Ok(Record {
            id: record_id,
            table_id,
            readonly: payload.readonly,
            metadata: payload.metadata.clone(),
        })
    }

    pub fn get_record(&self, table_id: i64, record_id: i64) -> Result<RecordData> {
        let conn = self.conn.lock().expect("storage mutex poisoned");
        let record = fetch_record(&conn, table_id, record_id)?;
        let cells = fetch_record_cells(&conn, record_id)?;
        Ok(RecordData {
            record,
            values: cells.into_iter().map(|(id, slot)| (id, slot.value)).collect(),
        })
    }

    pub fn update_record(
        &self,
        table_id: i64,
        record_id: i64,
        payload: &UpdateRecord,
    ) -> Result<Record> {
        let mut conn = self.conn.lock().expect("storage mutex poisoned");
        let tx = conn.transaction()?;
        let mut record = fetch_record(&tx, table_id, record_id)?;

        let touches_anything = payload.readonly.is_some()
            || payload.metadata.is_some()
            || payload.values.is_some()
            || payload.formulas.is_some();
        if record.readonly && touches_anything {
            return Err(StoreError::ReadonlyRecord(record_id));
        }

        if let Some(readonly) = payload.readonly {
            record.readonly = readonly;
        }
        if let Some(metadata) = payload.metadata.clone() {
            record.metadata = Some(metadata);
        }
        tx.execute(
            "UPDATE records SET readonly = ?2, metadata = ?3 WHERE id = ?1",
            params![record_id, record.readonly as i64, record.metadata.clone()],
        )?;

        if payload.values.is_some() || payload.formulas.is_some() {
            let fields = fetch_fields(&tx, table_id)?;
            let by_id: HashMap<i64, &Field> = fields.iter().map(|f| (f.id, f)).collect();
            let empty_values = HashMap::new();
            let empty_formulas = HashMap::new();
            let values = payload.values.as_ref().unwrap_or(&empty_values);
            let formulas = payload.formulas.as_ref().unwrap_or(&empty_formulas);

            let mut keys: BTreeSet<i64> = values.keys().copied().collect();
            keys.extend(formulas.keys().copied());

            for field_id in keys {
                let field = by_id
                    .get(&field_id)
                    .copied()
                    .ok_or(StoreError::FieldNotFound(field_id))?;
                if field.readonly {
                    return Err(StoreError::ReadonlyField(field.name.clone()));
                }
                let formula_expr = formulas.get(&field_id).map(String::as_str);
                if formula_expr.is_some() && field.field_type != FieldType::Formula {
                    return Err(StoreError::NotFormulaField(field.name.clone()));
                }
                let coerced = validate_cell(field, values.get(&field_id), formula_expr)?;
                upsert_cell(&tx, record_id, field_id, &coerced)?;
            }

            recompute_formulas(&tx, &fields, record_id)?;
        }

        tx.commit()?;
        Ok(record)
    }

    pub fn delete_record(&self, table_id: i64, record_id: i64) -> Result<()> {
        let conn = self.conn.lock().expect("storage mutex poisoned");
        fetch_record(&conn, table_id, record_id)?;
        conn.execute("DELETE FROM records WHERE id = ?1", params![record_id])?;
        Ok(())
    }

    /// Delete a set of records in one transaction. Used by import rollback.
    pub fn delete_records(&self, record_ids: &[i64]) -> Result<usize> {
        if record_ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock().expect("storage mutex poisoned");
        let tx = conn.transaction()?;
        let mut deleted = 0;
        for id in record_ids {
            deleted += tx.execute("DELETE FROM records WHERE id = ?1", params![id])?;
        }
        tx.commit()?;
        Ok(deleted)
    }

    /// List records with optional filters, a single-field sort and paging.
    ///
    /// Filtering and sorting happen in memory over the loaded cells; cost is
    /// proportional to the table's record count, which is acceptable at the
    /// scale this store targets.
    pub fn list_records(&self, table_id: i64, query: &ListQuery) -> Result<RecordPage> {
        let conn = self.conn.lock().expect("storage mutex poisoned");
        fetch_table(&conn, table_id)?;
        let fields = fetch_fields(&conn, table_id)?;
        let field_ids: BTreeSet<i64> = fields.iter().map(|f| f.id).collect();

        let mut stmt = conn.prepare(
            "SELECT id, table_id, readonly, metadata FROM records WHERE table_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![table_id], record_from_row)?;
        let mut records = Vec::new();
        for record in rows {
            records.push(record?);
        }

        let mut values: HashMap<i64, HashMap<i64, CellValue>> = HashMap::new();
        {
            let mut stmt = conn.prepare(
                r#"
                SELECT cv.record_id, cv.field_id, cv.value
                FROM cell_values cv
                JOIN records r ON r.id = cv.record_id
                WHERE r.table_id = ?1
                ORDER BY cv.record_id
                "#,
            )?;
            let rows = stmt.query_map(params![table_id], |r| {
                let record_id: i64 = r.get(0)?;
                let field_id: i64 = r.get(1)?;
                let value: Option<Json> = r.get(2)?;
                Ok((record_id, field_id, value))
            })?;
            for row in rows {
                let (record_id, field_id, value) = row?;
                let value = match value {
                    Some(v) => serde_json::from_value(v)?,
                    None => CellValue::Null,
                };
                values.entry(record_id).or_default().insert(field_id, value);
            }
        }

        let mut filtered: Vec<Record> = records
            .into_iter()
            .filter(|record| {
                let cells = values.get(&record.id);
                query.filters.iter().all(|filter| {
                    // A filter on a field the table does not have matches
                    // nothing.
                    field_ids.contains(&filter.field_id)
                        && filter_matches(
                            cells.and_then(|c| c.get(&filter.field_id)),
                            filter,
                        )
                })
            })
            .collect();

        if let Some(sort) = query.sort {
            filtered.sort_by(|a, b| {
                let av = values.get(&a.id).and_then(|c| c.get(&sort.field_id));
                let bv = values.get(&b.id).and_then(|c| c.get(&sort.field_id));
                let ord = cmp_cells(av, bv);
                let ord = if sort.descending { ord.reverse() } else { ord };
                ord.then(a.id.cmp(&b.id))
            });
        }

        let total = filtered.len();
        let size = query.size.clamp(1, 100);
        let page = query.page.max(1);
        let start = (page - 1).saturating_mul(size).min(total);
        let end = (start + size).min(total);

        let data = filtered[start..end]
            .iter()
            .map(|record| RecordData {
                record: record.clone(),
                values: values.get(&record.id).cloned().unwrap_or_default(),
            })
            .collect();

        Ok(RecordPage {
            data,
            page,
            size,
            total,
        })
    }

    // ---- cells ----

    pub fn get_cell(&self, record_id: i64, field_id: i64) -> Result<Option<CellSlot>> {
        let conn = self.conn.lock().expect("storage mutex poisoned");
        fetch_cell(&conn, record_id, field_id)
    }

    /// Apply a batch of cell writes guarded by the table's revision.
    ///
    /// The revision comparison, conflict detection, validation, upserts,
    /// formula recomputation, revision increment and audit append all run
    /// inside one transaction, so two concurrent batches against the same
    /// table cannot both pass the check against the same revision.
    pub fn batch_write_cells(
        &self,
        table_id: i64,
        expected_revision: i64,
        writes: &[CellWrite],
        user: &UserRef,
    ) -> Result<BatchWriteOutcome> {
        if writes.is_empty() {
            return Err(StoreError::EmptyBatch);
        }

        let mut conn = self.conn.lock().expect("storage mutex poisoned");
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let table = fetch_table(&tx, table_id)?;
        let fields = fetch_fields(&tx, table_id)?;
        let by_id: HashMap<i64, &Field> = fields.iter().map(|f| (f.id, f)).collect();

        if expected_revision != table.revision {
            let conflicts = detect_conflicts(&tx, &by_id, writes)?;
            debug!(
                table_id,
                expected_revision,
                latest = table.revision,
                conflicts = conflicts.len(),
                "rejecting stale batch write"
            );
            return Err(StoreError::RevisionConflict {
                latest: table.revision,
                conflicts,
            });
        }

        let record_ids: BTreeSet<i64> = writes.iter().map(|w| w.record_id).collect();
        let mut records: HashMap<i64, Record> = HashMap::new();
        for id in &record_ids {
            records.insert(*id, fetch_record(&tx, table_id, *id)?);
        }

        for write in writes {
            let record = records
                .get(&write.record_id)
                .ok_or(StoreError::RecordNotFound(write.record_id))?;
            let field = by_id
                .get(&write.field_id)
                .copied()
                .ok_or(StoreError::FieldNotFound(write.field_id))?;
            if record.readonly {
                return Err(StoreError::ReadonlyRecord(record.id));
            }
            if field.readonly {
                return Err(StoreError::ReadonlyField(field.name.clone()));
            }
            if write.formula_expr.is_some() && field.field_type != FieldType::Formula {
                return Err(StoreError::NotFormulaField(field.name.clone()));
            }
        }

        // Validate the whole batch before the first upsert so an invalid
        // write never leaves partial state behind.
        let mut coerced: Vec<CoercedCell> = Vec::with_capacity(writes.len());
        for write in writes {
            let field = by_id
                .get(&write.field_id)
                .copied()
                .ok_or(StoreError::FieldNotFound(write.field_id))?;
            coerced.push(validate_cell(
                field,
                write.value.as_ref(),
                write.formula_expr.as_deref(),
            )?);
        }

        for (write, cell) in writes.iter().zip(&coerced) {
            upsert_cell(&tx, write.record_id, write.field_id, cell)?;
        }

        for record_id in &record_ids {
            recompute_formulas(&tx, &fields, *record_id)?;
        }

        let revision = table.revision + 1;
        tx.execute(
            "UPDATE tables SET revision = ?2 WHERE id = ?1",
            params![table_id, revision],
        )?;
        append_audit(
            &tx,
            AuditAction::WriteCells,
            Some(user.id),
            Some(table_id),
            None,
            writes.len() as i64,
        )?;
        tx.commit()?;

        debug!(table_id, revision, written = writes.len(), "batch write committed");
        Ok(BatchWriteOutcome {
            revision,
            written: writes.len(),
        })
    }

    // ---- audit ----

    pub fn audit(
        &self,
        action: AuditAction,
        user_id: Option<i64>,
        table_id: Option<i64>,
        view_id: Option<i64>,
        row_count: i64,
    ) -> Result<()> {
        let conn = self.conn.lock().expect("storage mutex poisoned");
        append_audit(&conn, action, user_id, table_id, view_id, row_count)
    }

    pub fn audit_entries(&self, table_id: i64) -> Result<Vec<AuditEntry>> {
        let conn = self.conn.lock().expect("storage mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, action, user_id, table_id, view_id, row_count FROM audit_log WHERE table_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![table_id], |r| {
            let action: String = r.get(1)?;
            Ok((
                r.get::<_, i64>(0)?,
                action,
                r.get::<_, Option<i64>>(2)?,
                r.get::<_, Option<i64>>(3)?,
                r.get::<_, Option<i64>>(4)?,
                r.get::<_, i64>(5)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, action, user_id, table_id, view_id, row_count) = row?;
            let action = AuditAction::parse(&action)
                .ok_or_else(|| StoreError::UnsupportedFieldType(action.clone()))?;
            entries.push(AuditEntry {
                id,
                action,
                user_id,
                table_id,
                view_id,
                row_count,
            });
        }
        Ok(entries)
    }
}

// ---- row mapping ----

fn table_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<TableMeta> {
    let roles: Json = r.get(4)?;
    let export_roles =
        serde_json::from_value(roles).map_err(|_| rusqlite::Error::InvalidQuery)?;
    Ok(TableMeta {
        id: r.get(0)?,
        name: r.get(1)?,
        revision: r.get(2)?,
        metadata: r.get(3)?,
        export_roles,
    })
}

fn record_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Record> {
    Ok(Record {
        id: r.get(0)?,
        table_id: r.get(1)?,
        readonly: r.get::<_, i64>(2)? != 0,
        metadata: r.get(3)?,
    })
}

fn fetch_table(conn: &Connection, id: i64) -> Result<TableMeta> {
    let row = conn
        .query_row(
            "SELECT id, name, revision, metadata, export_roles FROM tables WHERE id = ?1",
            params![id],
            table_from_row,
        )
        .optional()?;
    row.ok_or(StoreError::TableNotFound(id))
}

fn field_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<(Field, String)> {
    let type_tag: String = r.get(3)?;
    let options: Option<Json> = r.get(4)?;
    let field = Field {
        id: r.get(0)?,
        table_id: r.get(1)?,
        name: r.get(2)?,
        // Placeholder; replaced by the caller after the tag is checked.
        field_type: FieldType::Text,
        options: FieldOptions::from_json(options.as_ref()),
        readonly: r.get::<_, i64>(5)? != 0,
    };
    Ok((field, type_tag))
}

fn resolve_field((mut field, type_tag): (Field, String)) -> Result<Field> {
    field.field_type =
        FieldType::parse(&type_tag).ok_or(StoreError::UnsupportedFieldType(type_tag))?;
    Ok(field)
}

fn fetch_field(conn: &Connection, table_id: i64, field_id: i64) -> Result<Field> {
    let row = conn
        .query_row(
            "SELECT id, table_id, name, field_type, options, readonly FROM fields WHERE id = ?1 AND table_id = ?2",
            params![field_id, table_id],
            field_from_row,
        )
        .optional()?;
    row.map(resolve_field)
        .transpose()?
        .ok_or(StoreError::FieldNotFound(field_id))
}

fn fetch_fields(conn: &Connection, table_id: i64) -> Result<Vec<Field>> {
    let mut stmt = conn.prepare(
        "SELECT id, table_id, name, field_type, options, readonly FROM fields WHERE table_id = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![table_id], field_from_row)?;
    let mut fields = Vec::new();
    for row in rows {
        fields.push(resolve_field(row?)?);
    }
    Ok(fields)
}

fn fetch_record(conn: &Connection, table_id: i64, record_id: i64) -> Result<Record> {
    let row = conn
        .query_row(
            "SELECT id, table_id, readonly, metadata FROM records WHERE id = ?1 AND table_id = ?2",
            params![record_id, table_id],
            record_from_row,
        )
        .optional()?;
    row.ok_or(StoreError::RecordNotFound(record_id))
}

fn cell_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<(Option<Json>, Option<String>, bool, Option<String>)> {
    Ok((
        r.get(0)?,
        r.get(1)?,
        r.get::<_, i64>(2)? != 0,
        r.get(3)?,
    ))
}

fn slot_from_parts(
    parts: (Option<Json>, Option<String>, bool, Option<String>),
) -> Result<CellSlot> {
    let (value, formula_expr, is_dirty, computed_at) = parts;
    let value = match value {
        Some(v) => serde_json::from_value(v)?,
        None => CellValue::Null,
    };
    let computed_at = computed_at
        .as_deref()
        .map(DateTime::parse_from_rfc3339)
        .transpose()
        .map_err(|_| StoreError::Json(serde::de::Error::custom("invalid computed_at timestamp")))?
        .map(|dt| dt.with_timezone(&Utc));
    Ok(CellSlot {
        value,
        formula_expr,
        is_dirty,
        computed_at,
    })
}

fn fetch_cell(conn: &Connection, record_id: i64, field_id: i64) -> Result<Option<CellSlot>> {
    let row = conn
        .query_row(
            "SELECT value, formula_expr, is_dirty, computed_at FROM cell_values WHERE record_id = ?1 AND field_id = ?2",
            params![record_id, field_id],
            cell_from_row,
        )
        .optional()?;
    row.map(slot_from_parts).transpose()
}

fn fetch_record_cells(conn: &Connection, record_id: i64) -> Result<Vec<(i64, CellSlot)>> {
    let mut stmt = conn.prepare(
        "SELECT field_id, value, formula_expr, is_dirty, computed_at FROM cell_values WHERE record_id = ?1",
    )?;
    let rows = stmt.query_map(params![record_id], |r| {
        let field_id: i64 = r.get(0)?;
        Ok((
            field_id,
            (
                r.get::<_, Option<Json>>(1)?,
                r.get::<_, Option<String>>(2)?,
                r.get::<_, i64>(3)? != 0,
                r.get::<_, Option<String>>(4)?,
            ),
        ))
    })?;

    let mut cells = Vec::new();
    for row in rows {
        let (field_id, parts) = row?;
        cells.push((field_id, slot_from_parts(parts)?));
    }
    Ok(cells)
}

fn upsert_cell(conn: &Connection, record_id: i64, field_id: i64, cell: &CoercedCell) -> Result<()> {
    let value = serde_json::to_value(&cell.value)?;
    conn.execute(
        r#"
        INSERT INTO cell_values (record_id, field_id, value, formula_expr, is_dirty)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(record_id, field_id) DO UPDATE SET
          value = excluded.value,
          formula_expr = excluded.formula_expr,
          is_dirty = excluded.is_dirty
        "#,
        params![
            record_id,
            field_id,
            value,
            cell.formula_expr.as_deref(),
            cell.is_dirty as i64
        ],
    )?;
    Ok(())
}

/// Re-evaluate every formula field of one record against its numeric cells.
///
/// The context exposes each number under both the field's name and its
/// stringified id, so expressions written either way resolve. This is a full
/// per-record pass on every write — no dependency tracking — and is
/// idempotent for unchanged inputs.
fn recompute_formulas(conn: &Connection, fields: &[Field], record_id: i64) -> Result<()> {
    let cells = fetch_record_cells(conn, record_id)?;
    let by_field: HashMap<i64, &CellSlot> = cells.iter().map(|(id, slot)| (*id, slot)).collect();

    let mut ctx: HashMap<String, f64> = HashMap::new();
    for field in fields {
        if field.field_type != FieldType::Number {
            continue;
        }
        if let Some(n) = by_field.get(&field.id).and_then(|slot| slot.value.as_number()) {
            ctx.insert(field.name.clone(), n);
            ctx.insert(field.id.to_string(), n);
        }
    }

    let now = Utc::now().to_rfc3339();
    for field in fields {
        if field.field_type != FieldType::Formula {
            continue;
        }
        let Some(expr) = by_field.get(&field.id).and_then(|slot| slot.formula_expr.as_deref())
        else {
            continue;
        };

        let result = formula::evaluate(expr, &ctx);
        let result = match (result, field.options.precision) {
            (Some(n), Some(p)) => Some(gridbase_model::round_to_precision(n, p)),
            (other, _) => other,
        };
        let value = serde_json::to_value(CellValue::from(result))?;

        conn.execute(
            r#"
            INSERT INTO cell_values (record_id, field_id, value, is_dirty, computed_at)
            VALUES (?1, ?2, ?3, 0, ?4)
            ON CONFLICT(record_id, field_id) DO UPDATE SET
              value = excluded.value,
              is_dirty = 0,
              computed_at = excluded.computed_at
            "#,
            params![record_id, field.id, value, now],
        )?;
    }

    Ok(())
}

/// Compute the conflicts for a stale batch: a direct comparison over only
/// the touched (record, field) pairs. A write whose attempted value and
/// formula already match the stored cell is a no-op, not a conflict.
fn detect_conflicts(
    conn: &Connection,
    fields: &HashMap<i64, &Field>,
    writes: &[CellWrite],
) -> Result<Vec<CellConflict>> {
    let mut conflicts = Vec::new();

    for write in writes {
        // Unknown fields are reported by the non-conflict path.
        let Some(field) = fields.get(&write.field_id).copied() else {
            continue;
        };

        let current = fetch_cell(conn, write.record_id, write.field_id)?;
        let current_value = current
            .as_ref()
            .map(|slot| serde_json::to_value(&slot.value))
            .transpose()?
            .unwrap_or(Json::Null);
        let current_formula = current.as_ref().and_then(|slot| slot.formula_expr.clone());

        // Normalize the attempted write the same way a successful batch
        // would; if the value does not validate, compare the raw input so
        // the caller still sees what it tried to write.
        let (attempted_value, attempted_formula) =
            match validate_cell(field, write.value.as_ref(), write.formula_expr.as_deref()) {
                Ok(cell) => (serde_json::to_value(&cell.value)?, cell.formula_expr),
                Err(_) => (
                    write.value.clone().unwrap_or(Json::Null),
                    write.formula_expr.clone(),
                ),
            };

        let differs = if field.field_type == FieldType::Formula {
            // A formula cell's stored value is the computed output, so only
            // the expression is meaningful for conflict comparison.
            current_formula != attempted_formula
        } else {
            current_value != attempted_value || current_formula != attempted_formula
        };

        if differs {
            conflicts.push(CellConflict {
                record_id: write.record_id,
                field_id: write.field_id,
                current_value,
                attempted_value,
                current_formula_expr: current_formula,
                attempted_formula_expr: attempted_formula,
            });
        }
    }

    Ok(conflicts)
}

fn bump_revision(conn: &Connection, table_id: i64) -> Result<()> {
    conn.execute(
        "UPDATE tables SET revision = revision + 1 WHERE id = ?1",
        params![table_id],
    )?;
    Ok(())
}

fn append_audit(
    conn: &Connection,
    action: AuditAction,
    user_id: Option<i64>,
    table_id: Option<i64>,
    view_id: Option<i64>,
    row_count: i64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO audit_log (action, user_id, table_id, view_id, row_count) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![action.as_str(), user_id, table_id, view_id, row_count],
    )?;
    Ok(())
}
