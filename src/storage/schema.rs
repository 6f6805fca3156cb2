//! Database schema definitions and migrations
//!
//! The base tables are created with `CREATE TABLE IF NOT EXISTS`. Columns added
//! after the first release are listed in [`ADDED_COLUMNS`] and applied with
//! `ALTER TABLE` when an older checkpoint is opened, so a resume never needs an
//! external repair step.

use rusqlite::Connection;

/// SQL schema for the checkpoint database (version 1 layout)
pub const SCHEMA_SQL: &str = r#"
-- One row per engine run
CREATE TABLE IF NOT EXISTS runs (
    run_id TEXT PRIMARY KEY,
    scraper TEXT NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    status TEXT NOT NULL
);

-- Per-item checkpoint state
CREATE TABLE IF NOT EXISTS work_items (
    run_id TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
    key TEXT NOT NULL,
    method TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    attempts_by_method TEXT,
    loop_count INTEGER DEFAULT 0,
    records_found TEXT,
    last_error TEXT,
    updated_at TEXT,
    PRIMARY KEY (run_id, key)
);

CREATE INDEX IF NOT EXISTS idx_work_items_status ON work_items(run_id, status);
"#;

/// Columns introduced after version 1: (table, column, definition)
pub const ADDED_COLUMNS: &[(&str, &str, &str)] = &[
    ("runs", "config_hash", "TEXT NOT NULL DEFAULT ''"),
    ("runs", "current_round", "INTEGER NOT NULL DEFAULT 0"),
    ("runs", "pending_count", "INTEGER NOT NULL DEFAULT 0"),
    ("runs", "in_progress_count", "INTEGER NOT NULL DEFAULT 0"),
    ("runs", "done_count", "INTEGER NOT NULL DEFAULT 0"),
    ("runs", "failed_count", "INTEGER NOT NULL DEFAULT 0"),
    ("work_items", "handoff_pending", "INTEGER NOT NULL DEFAULT 0"),
    ("work_items", "consecutive_failures", "INTEGER NOT NULL DEFAULT 0"),
    ("work_items", "invalid_count", "INTEGER NOT NULL DEFAULT 0"),
];

/// Current schema version, stored in `PRAGMA user_version`
pub const SCHEMA_VERSION: u32 = 2;

/// Initializes the schema and migrates older layouts forward
pub fn initialize_schema(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA_SQL)?;

    for (table, column, definition) in ADDED_COLUMNS {
        if !column_exists(conn, table, column)? {
            tracing::info!("Migrating checkpoint: adding {}.{}", table, column);
            conn.execute_batch(&format!(
                "ALTER TABLE {} ADD COLUMN {} {}",
                table, column, definition
            ))?;
        }
    }

    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    Ok(())
}

/// Gets the schema version recorded in the database
pub fn get_schema_version(conn: &Connection) -> Result<u32, rusqlite::Error> {
    conn.query_row("PRAGMA user_version", [], |row| row.get(0))
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names.iter().any(|name| name == column))
}
