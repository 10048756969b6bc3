//! Confirmed identity links: game id -> chat member
//!
//! Persisted as a flat JSON object `{ "<steamid64>": "<member id>" }`. Saves go
//! to a temp file in the target directory which is then renamed over the
//! target, so a crash never leaves a truncated mapping behind.

use dashmap::DashMap;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::types::MemberId;

#[derive(Debug, thiserror::Error)]
pub enum LinkStoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Mapping file {path} is not a JSON object: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub struct IdentityMap {
    path: Option<PathBuf>,
    links: DashMap<String, MemberId>,
}

impl IdentityMap {
    /// A map that is never written to disk
    pub fn in_memory() -> Self {
        Self {
            path: None,
            links: DashMap::new(),
        }
    }

    /// Load from `path`. A missing file yields an empty map bound to `path`;
    /// entries whose value is not a valid member id are skipped.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, LinkStoreError> {
        let path = path.into();
        let links = DashMap::new();

        if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(|source| LinkStoreError::Io {
                path: path.clone(),
                source,
            })?;
            let raw: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&content)
                .map_err(|source| LinkStoreError::Json {
                    path: path.clone(),
                    source,
                })?;

            for (external, value) in raw {
                match parse_member(&value) {
                    Some(member) => {
                        links.insert(external, member);
                    }
                    None => warn!(external = %external, value = %value, "Skipping invalid mapping entry"),
                }
            }
            info!(count = links.len(), path = %path.display(), "Loaded identity mappings");
        } else {
            debug!(path = %path.display(), "Mapping file not found, starting empty");
        }

        Ok(Self {
            path: Some(path),
            links,
        })
    }

    pub fn get(&self, external: &str) -> Option<MemberId> {
        self.links.get(external).map(|entry| *entry.value())
    }

    /// Insert or overwrite a link, returning the previous member
    pub fn insert(&self, external: impl Into<String>, member: MemberId) -> Option<MemberId> {
        self.links.insert(external.into(), member)
    }

    pub fn remove(&self, external: &str) -> Option<MemberId> {
        self.links.remove(external).map(|(_, member)| member)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// All linked members, deduplicated and sorted
    pub fn members(&self) -> Vec<MemberId> {
        let mut members: Vec<MemberId> = self.links.iter().map(|entry| *entry.value()).collect();
        members.sort_unstable();
        members.dedup();
        members
    }

    pub fn snapshot(&self) -> BTreeMap<String, MemberId> {
        self.links
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    /// Persist the map. No-op for in-memory maps.
    pub fn save(&self) -> Result<(), LinkStoreError> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        write_atomic(path, &self.snapshot())?;
        debug!(count = self.len(), path = %path.display(), "Saved identity mappings");
        Ok(())
    }
}

fn parse_member(value: &serde_json::Value) -> Option<MemberId> {
    match value {
        serde_json::Value::Number(n) => n.as_u64().map(MemberId),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn write_atomic(path: &Path, links: &BTreeMap<String, MemberId>) -> Result<(), LinkStoreError> {
    let io_err = |source: std::io::Error| LinkStoreError::Io {
        path: path.to_path_buf(),
        source,
    };

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir).map_err(io_err)?;

    let body = serde_json::to_vec_pretty(links).map_err(|source| LinkStoreError::Json {
        path: path.to_path_buf(),
        source,
    })?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".mapping-")
        .suffix(".json")
        .tempfile_in(&dir)
        .map_err(io_err)?;
    tmp.write_all(&body).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}
