use super::{Identity, IdentityError, IdentityKind};
use crate::config::IdentityConfig;
use crate::ConfigError;
use std::path::{Path, PathBuf};

/// Where the identity pool comes from
pub trait IdentitySource: Send + Sync {
    fn list(&self) -> Result<Vec<Identity>, IdentityError>;
}

/// Identities listed inline in the configuration
#[derive(Debug, Clone, Default)]
pub struct StaticIdentitySource {
    identities: Vec<Identity>,
}

impl StaticIdentitySource {
    pub fn new(identities: Vec<Identity>) -> Self {
        Self { identities }
    }
}

impl IdentitySource for StaticIdentitySource {
    fn list(&self) -> Result<Vec<Identity>, IdentityError> {
        Ok(self.identities.clone())
    }
}

/// Identities read from a text file
///
/// One identity per line as `id` or `id,proxy-url`. Blank lines and lines
/// starting with `#` are skipped.
#[derive(Debug, Clone)]
pub struct FileIdentitySource {
    path: PathBuf,
}

impl FileIdentitySource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn parse_line(&self, number: usize, line: &str) -> Result<Identity, IdentityError> {
        let parse_error = |reason: String| IdentityError::Parse {
            path: self.path.display().to_string(),
            line: number,
            reason,
        };

        let (id, proxy) = match line.split_once(',') {
            Some((id, proxy)) => (id.trim(), Some(proxy.trim())),
            None => (line.trim(), None),
        };

        if id.is_empty() {
            return Err(parse_error("empty id".to_string()));
        }

        match proxy.filter(|p| !p.is_empty()) {
            Some(proxy) => {
                url::Url::parse(proxy).map_err(|e| parse_error(format!("bad proxy: {}", e)))?;
                Ok(Identity::with_proxy(id, proxy))
            }
            None => Ok(Identity {
                id: id.to_string(),
                kind: IdentityKind::Account,
                ..Identity::direct()
            }),
        }
    }
}

impl IdentitySource for FileIdentitySource {
    fn list(&self) -> Result<Vec<Identity>, IdentityError> {
        let contents = std::fs::read_to_string(&self.path).map_err(|e| IdentityError::Read {
            path: self.path.display().to_string(),
            source: e,
        })?;

        contents
            .lines()
            .enumerate()
            .filter(|(_, line)| {
                let trimmed = line.trim();
                !trimmed.is_empty() && !trimmed.starts_with('#')
            })
            .map(|(index, line)| self.parse_line(index + 1, line))
            .collect()
    }
}

/// Builds the pool for a run
///
/// Inline identities come first, then the file's. An empty pool is an error
/// when identities are required; otherwise every worker gets its own direct
/// identity.
pub fn load_identities(
    config: &IdentityConfig,
    worker_count: usize,
) -> Result<Vec<Identity>, crate::HarvestError> {
    let mut identities = StaticIdentitySource::new(config.entries.clone()).list()?;

    if let Some(file) = &config.file {
        let from_file = FileIdentitySource::new(file).list()?;
        tracing::info!("Loaded {} identities from {}", from_file.len(), file);
        identities.extend(from_file);
    }

    if identities.is_empty() {
        if config.required {
            return Err(ConfigError::MissingIdentities.into());
        }
        tracing::debug!("No identities configured, using {} direct identities", worker_count);
        return Ok((1..=worker_count.max(1))
            .map(|n| Identity {
                id: format!("direct-{}", n),
                ..Identity::direct()
            })
            .collect());
    }

    Ok(identities)
}
