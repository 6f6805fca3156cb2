//! Record sinks
//!
//! Workers hand every record an extractor produces to a [`RecordSink`] before
//! the item is marked DONE, so a finished item always has its records on disk.

use super::{OutputError, OutputResult};
use crate::WorkItem;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Destination for extracted records
pub trait RecordSink: Send + Sync {
    /// Writes the records of one successful item
    fn write(&self, run_id: &str, item: &WorkItem, records: &[Value]) -> OutputResult<()>;

    /// Forces buffered records to their destination
    fn flush(&self) -> OutputResult<()> {
        Ok(())
    }
}

/// One line of the JSON Lines output
#[derive(Debug, Serialize)]
struct RecordLine<'a> {
    run_id: &'a str,
    key: &'a str,
    method: &'a str,
    record: &'a Value,
}

/// Appends records to a JSON Lines file
pub struct JsonlSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonlSink {
    /// Opens `path` for appending, creating parent directories as needed
    pub fn open(path: &Path) -> OutputResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RecordSink for JsonlSink {
    fn write(&self, run_id: &str, item: &WorkItem, records: &[Value]) -> OutputResult<()> {
        let mut writer = self.writer.lock();
        for record in records {
            let line = RecordLine {
                run_id,
                key: &item.key,
                method: &item.method,
                record,
            };
            serde_json::to_writer(&mut *writer, &line)
                .map_err(|e| OutputError::Format(e.to_string()))?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        Ok(())
    }

    fn flush(&self) -> OutputResult<()> {
        self.writer.lock().flush()?;
        Ok(())
    }
}

/// Discards records (dry runs and tests)
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl RecordSink for NullSink {
    fn write(&self, _run_id: &str, _item: &WorkItem, _records: &[Value]) -> OutputResult<()> {
        Ok(())
    }
}
