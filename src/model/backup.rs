//! The unified backup aggregate.
//!
//! One logical backup can exist on zero or more backends at a time; a
//! [`Backup`] merges the per-backend views under the slug assigned by
//! whichever backend created it. An aggregate whose last backend record is
//! removed must be dropped from the owning collection immediately; it never
//! persists in a deleted state.

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One backend's view of a backup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendRecord {
    /// Backend-internal identifier (e.g. a remote file id).
    pub id: String,

    /// Name of the backend this record came from.
    pub backend: String,

    /// Stable cross-backend identifier, assigned at creation.
    pub slug: String,

    pub name: String,
    pub date: DateTime<Utc>,
    pub size: u64,
    pub backup_type: String,
    pub version: Option<String>,
    pub protected: bool,

    /// Retained records are exempt from retention-policy deletion.
    pub retained: bool,

    /// Ignored records are excluded from purging and upload.
    pub ignore: bool,

    /// Backend-specific metadata, passed through for observability.
    #[serde(default)]
    pub details: serde_json::Value,
}

/// Options supplied when a backup is created through the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOptions {
    /// Requested creation timestamp.
    pub when: DateTime<Utc>,

    /// Name template, rendered against the local creation time.
    pub name_template: String,

    /// Per-backend "retain immediately after creation" requests. These
    /// propagate to the destination record when the backup is uploaded later.
    #[serde(default)]
    pub retain: BTreeMap<String, bool>,
}

impl CreateOptions {
    pub fn new(when: DateTime<Utc>, name_template: impl Into<String>) -> Self {
        Self {
            when,
            name_template: name_template.into(),
            retain: BTreeMap::new(),
        }
    }

    /// Render the name template against the local creation time. Supported
    /// placeholders: `{year}`, `{month}`, `{day}`, `{hour}`, `{minute}`,
    /// `{date}`, `{time}`.
    pub fn resolve_name(&self, tz: Tz) -> String {
        let local = tz.from_utc_datetime(&self.when.naive_utc());
        self.name_template
            .replace("{year}", &format!("{:04}", local.year()))
            .replace("{month}", &format!("{:02}", local.month()))
            .replace("{day}", &format!("{:02}", local.day()))
            .replace("{hour}", &format!("{:02}", local.hour()))
            .replace("{minute}", &format!("{:02}", local.minute()))
            .replace("{date}", &local.format("%Y-%m-%d").to_string())
            .replace("{time}", &local.format("%H:%M").to_string())
    }
}

/// A logical backup as seen across all backends.
#[derive(Debug, Clone)]
pub struct Backup {
    slug: String,
    sources: BTreeMap<String, BackendRecord>,
    purge_next: BTreeMap<String, bool>,
    options: Option<CreateOptions>,
}

impl Backup {
    pub fn new(record: BackendRecord) -> Self {
        let mut backup = Self {
            slug: record.slug.clone(),
            sources: BTreeMap::new(),
            purge_next: BTreeMap::new(),
            options: None,
        };
        backup.add_source(record);
        backup
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }

    pub fn add_source(&mut self, record: BackendRecord) {
        self.sources.insert(record.backend.clone(), record);
    }

    pub fn remove_source(&mut self, backend: &str) {
        self.sources.remove(backend);
        self.purge_next.remove(backend);
    }

    pub fn source(&self, backend: &str) -> Option<&BackendRecord> {
        self.sources.get(backend)
    }

    pub fn source_mut(&mut self, backend: &str) -> Option<&mut BackendRecord> {
        self.sources.get_mut(backend)
    }

    pub fn sources(&self) -> impl Iterator<Item = &BackendRecord> {
        self.sources.values()
    }

    pub fn set_options(&mut self, options: CreateOptions) {
        self.options = Some(options);
    }

    pub fn options(&self) -> Option<&CreateOptions> {
        self.options.as_ref()
    }

    /// Advisory "this backend will delete this one next" flag.
    pub fn update_purge(&mut self, backend: &str, purge: bool) {
        self.purge_next.insert(backend.to_string(), purge);
    }

    pub fn purges(&self) -> &BTreeMap<String, bool> {
        &self.purge_next
    }

    pub fn name(&self) -> Option<&str> {
        self.sources.values().next().map(|r| r.name.as_str())
    }

    pub fn date(&self) -> Option<DateTime<Utc>> {
        self.sources.values().next().map(|r| r.date)
    }

    pub fn size(&self) -> u64 {
        self.sources.values().next().map(|r| r.size).unwrap_or(0)
    }

    pub fn backup_type(&self) -> Option<&str> {
        self.sources.values().next().map(|r| r.backup_type.as_str())
    }

    pub fn version(&self) -> Option<&str> {
        self.sources.values().find_map(|r| r.version.as_deref())
    }

    pub fn protected(&self) -> bool {
        self.sources.values().next().map(|r| r.protected).unwrap_or(false)
    }

    /// Whether this backend's copy is exempt from retention.
    pub fn retained_at(&self, backend: &str) -> bool {
        self.sources.get(backend).map(|r| r.retained).unwrap_or(false)
    }

    /// A backup is ignorable only if every present backend record says so.
    pub fn ignore(&self) -> bool {
        !self.sources.is_empty() && self.sources.values().all(|r| r.ignore)
    }

    pub fn is_deleted(&self) -> bool {
        self.sources.is_empty()
    }
}
