//! Run id resolution
//!
//! A run is identified by a string id so an operator can resume it explicitly.
//! The id comes from the environment first, then from a sidecar file next to the
//! output, and is generated otherwise.

use chrono::Utc;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Name of the sidecar file holding the id of the run in progress
pub const RUN_POINTER_FILE: &str = ".current_run_id";

/// Where a resolved run id came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunIdSource {
    Env,
    Sidecar,
    Generated,
}

/// Path of the sidecar file under `output_dir`
pub fn run_pointer_path(output_dir: &Path) -> PathBuf {
    output_dir.join(RUN_POINTER_FILE)
}

/// Resolves the run id for this invocation
///
/// `env_value` is the raw value of the run id variable; blank values are
/// ignored. A generated id is not persisted here, call [`write_run_pointer`]
/// once the run actually starts.
pub fn resolve_run_id(
    env_value: Option<&str>,
    output_dir: &Path,
    scraper: &str,
) -> io::Result<(String, RunIdSource)> {
    if let Some(id) = env_value.map(str::trim).filter(|s| !s.is_empty()) {
        return Ok((id.to_string(), RunIdSource::Env));
    }

    match fs::read_to_string(run_pointer_path(output_dir)) {
        Ok(contents) => {
            let id = contents.trim();
            if !id.is_empty() {
                return Ok((id.to_string(), RunIdSource::Sidecar));
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    Ok((generate_run_id(scraper), RunIdSource::Generated))
}

/// Generates `<scraper>_<YYYYmmdd_HHMMSS>`
pub fn generate_run_id(scraper: &str) -> String {
    format!("{}_{}", scraper, Utc::now().format("%Y%m%d_%H%M%S"))
}

/// Records `run_id` as the run to resume
pub fn write_run_pointer(output_dir: &Path, run_id: &str) -> io::Result<()> {
    fs::create_dir_all(output_dir)?;
    fs::write(run_pointer_path(output_dir), format!("{}\n", run_id))
}

/// Removes the sidecar once a run has completed
pub fn clear_run_pointer(output_dir: &Path) -> io::Result<()> {
    match fs::remove_file(run_pointer_path(output_dir)) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
