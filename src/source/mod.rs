//! Backend capability traits.
//!
//! The engine is polymorphic over its two storage backends: a local source
//! (where backups are created) and a remote destination (where they are
//! replicated). Concrete backends are swappable, including the in-memory
//! [`memory::MemoryBackend`] used by the crate's own tests. The core depends
//! only on this capability contract plus the [`ByteStream`] byte contract —
//! wire formats, auth and listing details all live behind it.

pub mod memory;

use crate::model::backup::{Backup, BackendRecord, CreateOptions};
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;

/// A seekable, sized archive byte stream.
///
/// Chunked uploads need to rewind to server-confirmed offsets, so plain
/// `AsyncRead` isn't enough; this is the minimal contract both directions of
/// the resumable transfer protocol share.
#[async_trait]
pub trait ByteStream: Send {
    fn size(&self) -> u64;

    fn position(&self) -> u64;

    async fn seek(&mut self, position: u64) -> Result<()>;

    /// Read up to `max` bytes from the current position. An empty buffer
    /// means end of stream.
    async fn read_chunk(&mut self, max: usize) -> Result<Bytes>;
}

/// An in-memory [`ByteStream`].
pub struct MemoryStream {
    data: Bytes,
    position: u64,
}

impl MemoryStream {
    pub fn new(data: Bytes) -> Self {
        Self { data, position: 0 }
    }
}

#[async_trait]
impl ByteStream for MemoryStream {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn position(&self) -> u64 {
        self.position
    }

    async fn seek(&mut self, position: u64) -> Result<()> {
        self.position = position.min(self.data.len() as u64);
        Ok(())
    }

    async fn read_chunk(&mut self, max: usize) -> Result<Bytes> {
        let start = self.position as usize;
        let end = (start + max).min(self.data.len());
        self.position = end as u64;
        Ok(self.data.slice(start..end))
    }
}

/// One storage backend participating in synchronization.
///
/// `create` is only meaningful on the source side and `save` is how archives
/// arrive at a backend from elsewhere; the in-memory double implements both
/// so either role can be exercised in tests.
#[async_trait]
pub trait BackupSource: Send + Sync {
    fn name(&self) -> &str;

    fn enabled(&self) -> bool;

    /// The backend exists but cannot be used until the user configures it
    /// (e.g. credentials were never authorized).
    fn needs_configuration(&self) -> bool {
        false
    }

    /// Retention ceiling for this backend. Zero means unlimited.
    fn max_count(&self) -> usize;

    /// Called after reading state but before any changes are made, to check
    /// for additional errors (e.g. an ambiguous pre-existing backup folder).
    async fn check_before_changes(&self) -> Result<()> {
        Ok(())
    }

    /// List this backend's current backups, keyed by slug.
    async fn get(&self) -> Result<BTreeMap<String, BackendRecord>>;

    /// Create a brand-new backup (source side).
    async fn create(&self, options: &CreateOptions) -> Result<BackendRecord>;

    /// Store an archive streamed from another backend.
    async fn save(&self, backup: &Backup, stream: Box<dyn ByteStream>) -> Result<BackendRecord>;

    /// Open this backend's archive bytes for reading.
    async fn read(&self, record: &BackendRecord) -> Result<Box<dyn ByteStream>>;

    async fn delete(&self, record: &BackendRecord) -> Result<()>;

    /// Mark/unmark a backup as exempt from retention.
    async fn retain(&self, record: &BackendRecord, retain: bool) -> Result<()>;

    /// Mark/unmark a backup as ignored by the engine.
    async fn ignore(&self, record: &BackendRecord, ignore: bool) -> Result<()>;
}

/// The replication target. Everything a source can do, plus an upload switch.
#[async_trait]
pub trait BackupDestination: BackupSource {
    /// Whether uploading new archives to this backend is currently allowed.
    fn upload_enabled(&self) -> bool {
        true
    }
}
