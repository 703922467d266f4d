//! Persisted engine-side backup annotations.
//!
//! Backends only store what their wire formats allow, so intents the engine
//! must remember across restarts (retention flags requested at creation time,
//! before the backup has reached every backend) are kept here. The cache is a
//! single JSON file with dirty tracking; the model flushes it at the end of
//! each sync pass.

use crate::model::backup::CreateOptions;
use crate::Result;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::debug;

pub struct MetadataCache {
    path: Option<PathBuf>,
    entries: BTreeMap<String, CreateOptions>,
    dirty: bool,
}

impl MetadataCache {
    /// Load the cache from `path`, starting empty if the file doesn't exist.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match std::fs::read(&path) {
            Ok(data) => serde_json::from_slice(&data)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), entries = entries.len(), "Loaded metadata cache");
        Ok(Self {
            path: Some(path),
            entries,
            dirty: false,
        })
    }

    /// A cache that never touches disk. Used by tests and embedders that
    /// don't need annotations to survive restarts.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: BTreeMap::new(),
            dirty: false,
        }
    }

    /// Remember the options a backup was requested with, keyed by slug.
    pub fn set(&mut self, slug: &str, options: CreateOptions) {
        self.entries.insert(slug.to_string(), options);
        self.dirty = true;
    }

    pub fn get(&self, slug: &str) -> Option<&CreateOptions> {
        self.entries.get(slug)
    }

    pub fn remove(&mut self, slug: &str) {
        if self.entries.remove(slug).is_some() {
            self.dirty = true;
        }
    }

    /// Write the cache out if anything changed since the last flush.
    pub fn flush_if_dirty(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        if let Some(path) = &self.path {
            std::fs::write(path, serde_json::to_vec_pretty(&self.entries)?)?;
            debug!(path = %path.display(), "Flushed metadata cache");
        }
        self.dirty = false;
        Ok(())
    }
}
