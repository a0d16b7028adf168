use rusqlite::Connection;

pub(crate) fn init(conn: &Connection) -> rusqlite::Result<()> {
    // Ensure foreign keys are enforced (disabled by default in SQLite).
    conn.pragma_update(None, "foreign_keys", "ON")?;

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS tables (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          name TEXT NOT NULL,
          revision INTEGER NOT NULL DEFAULT 0,
          metadata JSON,
          export_roles JSON NOT NULL,
          created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS fields (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          table_id INTEGER NOT NULL REFERENCES tables(id) ON DELETE CASCADE,
          name TEXT NOT NULL,
          field_type TEXT NOT NULL,
          options JSON,
          readonly INTEGER NOT NULL DEFAULT 0,
          UNIQUE (table_id, name)
        );

        CREATE INDEX IF NOT EXISTS idx_fields_table ON fields(table_id);

        CREATE TABLE IF NOT EXISTS records (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          table_id INTEGER NOT NULL REFERENCES tables(id) ON DELETE CASCADE,
          readonly INTEGER NOT NULL DEFAULT 0,
          metadata JSON,
          created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        );

        CREATE INDEX IF NOT EXISTS idx_records_table ON records(table_id);

        CREATE TABLE IF NOT EXISTS cell_values (
          record_id INTEGER NOT NULL REFERENCES records(id) ON DELETE CASCADE,
          field_id INTEGER NOT NULL REFERENCES fields(id) ON DELETE CASCADE,
          value JSON,
          formula_expr TEXT,
          is_dirty INTEGER NOT NULL DEFAULT 0,
          computed_at TEXT,
          PRIMARY KEY (record_id, field_id)
        );

        CREATE INDEX IF NOT EXISTS idx_cell_values_record ON cell_values(record_id);

        CREATE TABLE IF NOT EXISTS audit_log (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
          action TEXT NOT NULL,
          user_id INTEGER,
          table_id INTEGER,
          view_id INTEGER,
          row_count INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_audit_log_table ON audit_log(table_id);
        "#,
    )?;

    Ok(())
}
