//! SQLite checkpoint implementation
//!
//! This module provides a SQLite-based implementation of the CheckpointStore trait.

use crate::state::{ItemStatus, RunCounters, RunRecord, RunStatus, WorkItem};
use crate::storage::schema::initialize_schema;
use crate::storage::traits::{CheckpointStore, StorageError, StorageResult};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

const RUN_COLUMNS: &str = "run_id, scraper, started_at, finished_at, status, config_hash,
     current_round, pending_count, in_progress_count, done_count, failed_count";

const ITEM_COLUMNS: &str = "key, method, status, attempts_by_method, loop_count, records_found,
     last_error, updated_at, handoff_pending, consecutive_failures, invalid_count";

/// SQLite checkpoint backend
pub struct SqliteCheckpoint {
    conn: Connection,

    /// In-progress churn waiting for the next flush, keyed by (run_id, key)
    buffered: HashMap<(String, String), WorkItem>,

    /// Buffered writes that trigger an automatic flush
    batch_size: usize,
}

impl SqliteCheckpoint {
    /// Opens or creates a checkpoint database
    ///
    /// Parent directories are created as needed. Older schemas are migrated in
    /// place.
    pub fn open(path: &Path, batch_size: usize) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;

        // A committed DONE must survive power loss
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = FULL;
            PRAGMA foreign_keys = ON;
            PRAGMA busy_timeout = 5000;
        ",
        )?;

        initialize_schema(&conn)?;

        Ok(Self {
            conn,
            buffered: HashMap::new(),
            batch_size: batch_size.max(1),
        })
    }

    /// Creates an in-memory checkpoint (for tests and dry runs)
    pub fn in_memory(batch_size: usize) -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        initialize_schema(&conn)?;
        Ok(Self {
            conn,
            buffered: HashMap::new(),
            batch_size: batch_size.max(1),
        })
    }

    fn write_items<'a>(
        conn: &mut Connection,
        items: impl IntoIterator<Item = (&'a str, &'a WorkItem)>,
    ) -> StorageResult<()> {
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO work_items (run_id, key, method, status, attempts_by_method,
                     loop_count, records_found, last_error, updated_at, handoff_pending,
                     consecutive_failures, invalid_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT(run_id, key) DO UPDATE SET
                     method = excluded.method,
                     status = excluded.status,
                     attempts_by_method = excluded.attempts_by_method,
                     loop_count = excluded.loop_count,
                     records_found = excluded.records_found,
                     last_error = excluded.last_error,
                     updated_at = excluded.updated_at,
                     handoff_pending = excluded.handoff_pending,
                     consecutive_failures = excluded.consecutive_failures,
                     invalid_count = excluded.invalid_count",
            )?;

            for (run_id, item) in items {
                stmt.execute(params![
                    run_id,
                    item.key,
                    item.method,
                    item.status.to_db_string(),
                    encode_map(&item.attempts_by_method)?,
                    item.loop_count,
                    encode_map(&item.records_found)?,
                    item.last_error,
                    item.updated_at.to_rfc3339(),
                    item.handoff_pending,
                    item.consecutive_failures,
                    item.invalid_count,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn query_run(&self, sql: &str, run_id: Option<&str>) -> StorageResult<Option<RunRecord>> {
        let mut stmt = self.conn.prepare(sql)?;
        let run = match run_id {
            Some(id) => stmt.query_row(params![id], run_from_row).optional()?,
            None => stmt.query_row([], run_from_row).optional()?,
        };
        Ok(run)
    }
}

impl CheckpointStore for SqliteCheckpoint {
    // ===== Run Management =====

    fn create_run(&mut self, run: &RunRecord) -> StorageResult<()> {
        if self.find_run(&run.run_id)?.is_some() {
            return Err(StorageError::RunExists(run.run_id.clone()));
        }

        self.conn.execute(
            "INSERT INTO runs (run_id, scraper, started_at, finished_at, status, config_hash,
                 current_round)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                run.run_id,
                run.scraper,
                run.started_at.to_rfc3339(),
                run.finished_at.map(|t| t.to_rfc3339()),
                run.status.to_db_string(),
                run.config_hash,
                run.current_round,
            ],
        )?;
        Ok(())
    }

    fn find_run(&self, run_id: &str) -> StorageResult<Option<RunRecord>> {
        self.query_run(
            &format!("SELECT {} FROM runs WHERE run_id = ?1", RUN_COLUMNS),
            Some(run_id),
        )
    }

    fn latest_run(&self) -> StorageResult<Option<RunRecord>> {
        self.query_run(
            &format!(
                "SELECT {} FROM runs ORDER BY started_at DESC, rowid DESC LIMIT 1",
                RUN_COLUMNS
            ),
            None,
        )
    }

    fn update_run(&mut self, run: &RunRecord) -> StorageResult<()> {
        let updated = self.conn.execute(
            "UPDATE runs SET status = ?1, finished_at = ?2, current_round = ?3,
                 pending_count = ?4, in_progress_count = ?5, done_count = ?6, failed_count = ?7
             WHERE run_id = ?8",
            params![
                run.status.to_db_string(),
                run.finished_at.map(|t| t.to_rfc3339()),
                run.current_round,
                run.counters.pending,
                run.counters.in_progress,
                run.counters.done,
                run.counters.failed,
                run.run_id,
            ],
        )?;

        if updated == 0 {
            return Err(StorageError::RunNotFound(run.run_id.clone()));
        }
        Ok(())
    }

    fn delete_run(&mut self, run_id: &str) -> StorageResult<()> {
        self.buffered.retain(|(run, _), _| run != run_id);
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM work_items WHERE run_id = ?1", params![run_id])?;
        tx.execute("DELETE FROM runs WHERE run_id = ?1", params![run_id])?;
        tx.commit()?;
        Ok(())
    }

    // ===== Item Management =====

    fn load(&mut self, run_id: &str) -> StorageResult<(RunRecord, Vec<WorkItem>)> {
        self.flush()?;

        let run = self
            .find_run(run_id)?
            .ok_or_else(|| StorageError::RunNotFound(run_id.to_string()))?;

        // Whatever was in flight when the process died starts over
        let reverted = self.conn.execute(
            "UPDATE work_items SET status = ?1 WHERE run_id = ?2 AND status = ?3",
            params![
                ItemStatus::Pending.to_db_string(),
                run_id,
                ItemStatus::InProgress.to_db_string()
            ],
        )?;
        if reverted > 0 {
            tracing::info!(
                "Reverted {} interrupted item(s) to pending for run {}",
                reverted,
                run_id
            );
        }

        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM work_items WHERE run_id = ?1 ORDER BY rowid",
            ITEM_COLUMNS
        ))?;
        let items = stmt
            .query_map(params![run_id], item_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok((run, items))
    }

    fn seed_items(&mut self, run_id: &str, items: &[WorkItem]) -> StorageResult<usize> {
        let tx = self.conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO work_items (run_id, key, method, status, attempts_by_method,
                     loop_count, records_found, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for item in items {
                inserted += stmt.execute(params![
                    run_id,
                    item.key,
                    item.method,
                    item.status.to_db_string(),
                    encode_map(&item.attempts_by_method)?,
                    item.loop_count,
                    encode_map(&item.records_found)?,
                    item.updated_at.to_rfc3339(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    fn upsert_item(&mut self, run_id: &str, item: &WorkItem) -> StorageResult<()> {
        self.buffered
            .insert((run_id.to_string(), item.key.clone()), item.clone());

        if item.status.is_terminal() || self.buffered.len() >= self.batch_size {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> StorageResult<()> {
        if self.buffered.is_empty() {
            return Ok(());
        }

        let batch = std::mem::take(&mut self.buffered);
        let result = Self::write_items(
            &mut self.conn,
            batch.iter().map(|((run, _), item)| (run.as_str(), item)),
        );

        if result.is_err() {
            // Keep the writes so a later flush can retry them
            for (k, v) in batch {
                self.buffered.entry(k).or_insert(v);
            }
        } else {
            tracing::trace!("Flushed {} checkpoint write(s)", batch.len());
        }
        result
    }

    fn pending_writes(&self) -> usize {
        self.buffered.len()
    }

    fn reset_terminal(&mut self, run_id: &str, include_failed: bool) -> StorageResult<usize> {
        self.flush()?;

        let statuses: Vec<&str> = if include_failed {
            vec![
                ItemStatus::Done.to_db_string(),
                ItemStatus::FailedTerminal.to_db_string(),
            ]
        } else {
            vec![ItemStatus::Done.to_db_string()]
        };

        let mut reset = 0;
        let now = Utc::now().to_rfc3339();
        for status in statuses {
            reset += self.conn.execute(
                "UPDATE work_items SET status = ?1, attempts_by_method = NULL, loop_count = 0,
                     consecutive_failures = 0, invalid_count = 0, handoff_pending = 0,
                     last_error = NULL, updated_at = ?2
                 WHERE run_id = ?3 AND status = ?4",
                params![ItemStatus::Pending.to_db_string(), now, run_id, status],
            )?;
        }
        Ok(reset)
    }

    // ===== Statistics =====

    fn count_items(&self, run_id: &str) -> StorageResult<RunCounters> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM work_items WHERE run_id = ?1 GROUP BY status")?;

        let mut counters = RunCounters::default();
        let rows = stmt.query_map(params![run_id], |row| {
            Ok((row.get::<_, Option<String>>(0)?, row.get::<_, i64>(1)?))
        })?;

        for row in rows {
            let (status, count) = row?;
            counters.add_many(parse_status(status.as_deref()), count.max(0) as u64);
        }

        Ok(counters)
    }

    fn failed_items(&self, run_id: &str) -> StorageResult<Vec<(String, Option<String>)>> {
        let mut stmt = self.conn.prepare(
            "SELECT key, last_error FROM work_items WHERE run_id = ?1 AND status = ?2 ORDER BY key",
        )?;
        let rows = stmt
            .query_map(
                params![run_id, ItemStatus::FailedTerminal.to_db_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

/// Unknown or missing statuses fall back to pending
fn parse_status(raw: Option<&str>) -> ItemStatus {
    raw.and_then(|s| ItemStatus::from_db_string(&s.trim().to_ascii_lowercase()))
        .unwrap_or(ItemStatus::Pending)
}

fn encode_map<V: serde::Serialize>(map: &BTreeMap<String, V>) -> StorageResult<String> {
    serde_json::to_string(map).map_err(|e| StorageError::Serialization(e.to_string()))
}

/// Decodes a JSON counter map, treating NULL or garbage as empty
fn decode_map<V: serde::de::DeserializeOwned>(raw: Option<String>) -> BTreeMap<String, V> {
    match raw {
        Some(text) if !text.trim().is_empty() => serde_json::from_str(&text).unwrap_or_else(|e| {
            tracing::warn!("Ignoring unreadable counter map '{}': {}", text, e);
            BTreeMap::new()
        }),
        _ => BTreeMap::new(),
    }
}

fn parse_time(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| s.parse::<DateTime<Utc>>().ok())
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
    Ok(RunRecord {
        run_id: row.get(0)?,
        scraper: row.get(1)?,
        started_at: parse_time(row.get(2)?).unwrap_or_else(Utc::now),
        finished_at: parse_time(row.get(3)?),
        status: RunStatus::from_db_string(&row.get::<_, String>(4)?).unwrap_or(RunStatus::Running),
        config_hash: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
        current_round: row.get::<_, Option<u32>>(6)?.unwrap_or(0),
        counters: RunCounters {
            pending: row.get::<_, Option<u64>>(7)?.unwrap_or(0),
            in_progress: row.get::<_, Option<u64>>(8)?.unwrap_or(0),
            done: row.get::<_, Option<u64>>(9)?.unwrap_or(0),
            failed: row.get::<_, Option<u64>>(10)?.unwrap_or(0),
        },
    })
}

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<WorkItem> {
    Ok(WorkItem {
        key: row.get(0)?,
        method: row.get(1)?,
        status: parse_status(row.get::<_, Option<String>>(2)?.as_deref()),
        attempts_by_method: decode_map(row.get(3)?),
        loop_count: row.get::<_, Option<u32>>(4)?.unwrap_or(0),
        records_found: decode_map(row.get(5)?),
        last_error: row.get(6)?,
        updated_at: parse_time(row.get(7)?).unwrap_or_else(Utc::now),
        handoff_pending: row.get::<_, Option<bool>>(8)?.unwrap_or(false),
        consecutive_failures: row.get::<_, Option<u32>>(9)?.unwrap_or(0),
        invalid_count: row.get::<_, Option<u32>>(10)?.unwrap_or(0),
    })
}
