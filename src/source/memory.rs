//! In-memory backend used by the engine's tests (and embedders' tests).
//!
//! Behaves like a real backend with byte-accurate archives, plus the knobs
//! tests need: flag toggles, one-shot error injection, and a gate that can
//! hold `check_before_changes` open to exercise concurrency behavior.

use crate::model::backup::{Backup, BackendRecord, CreateOptions};
use crate::source::{BackupDestination, BackupSource, ByteStream, MemoryStream};
use crate::time::Clock;
use crate::{EngineError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

struct State {
    records: BTreeMap<String, BackendRecord>,
    archives: BTreeMap<String, Bytes>,
    enabled: bool,
    upload: bool,
    max_count: usize,
    needs_configuration: bool,
    precondition_failure: Option<String>,
    next_error: Option<EngineError>,
}

pub struct MemoryBackend {
    name: String,
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
    gate: watch::Sender<bool>,
}

impl MemoryBackend {
    pub fn new(name: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        let (gate, _) = watch::channel(false);
        Self {
            name: name.into(),
            clock,
            state: Mutex::new(State {
                records: BTreeMap::new(),
                archives: BTreeMap::new(),
                enabled: true,
                upload: true,
                max_count: 0,
                needs_configuration: false,
                precondition_failure: None,
                next_error: None,
            }),
            gate,
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.state.lock().unwrap().enabled = enabled;
    }

    pub fn set_upload_enabled(&self, upload: bool) {
        self.state.lock().unwrap().upload = upload;
    }

    pub fn set_max_count(&self, max_count: usize) {
        self.state.lock().unwrap().max_count = max_count;
    }

    pub fn set_needs_configuration(&self, needs: bool) {
        self.state.lock().unwrap().needs_configuration = needs;
    }

    /// Make `check_before_changes` fail until cleared.
    pub fn set_precondition_failure(&self, message: Option<&str>) {
        self.state.lock().unwrap().precondition_failure = message.map(str::to_string);
    }

    /// Fail the next `get` with this error, once.
    pub fn inject_error(&self, error: EngineError) {
        self.state.lock().unwrap().next_error = Some(error);
    }

    /// Hold `check_before_changes` open until [`release`](Self::release).
    pub fn hold(&self) {
        self.gate.send_replace(true);
    }

    pub fn release(&self) {
        self.gate.send_replace(false);
    }

    /// Seed a backup with explicit archive bytes.
    pub fn insert(&self, record: BackendRecord, archive: Bytes) {
        let mut state = self.state.lock().unwrap();
        state.archives.insert(record.slug.clone(), archive);
        state.records.insert(record.slug.clone(), record);
    }

    pub fn record(&self, slug: &str) -> Option<BackendRecord> {
        self.state.lock().unwrap().records.get(slug).cloned()
    }

    pub fn archive(&self, slug: &str) -> Option<Bytes> {
        self.state.lock().unwrap().archives.get(slug).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BackupSource for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn enabled(&self) -> bool {
        self.state.lock().unwrap().enabled
    }

    fn needs_configuration(&self) -> bool {
        self.state.lock().unwrap().needs_configuration
    }

    fn max_count(&self) -> usize {
        self.state.lock().unwrap().max_count
    }

    async fn check_before_changes(&self) -> Result<()> {
        let mut gate = self.gate.subscribe();
        while *gate.borrow() {
            if gate.changed().await.is_err() {
                break;
            }
        }
        let failure = self.state.lock().unwrap().precondition_failure.clone();
        match failure {
            Some(message) => Err(EngineError::PreconditionFailed(message)),
            None => Ok(()),
        }
    }

    async fn get(&self) -> Result<BTreeMap<String, BackendRecord>> {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.next_error.take() {
            return Err(error);
        }
        Ok(state.records.clone())
    }

    async fn create(&self, options: &CreateOptions) -> Result<BackendRecord> {
        let slug = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        let archive = Bytes::from(slug.repeat(128).into_bytes());
        let record = BackendRecord {
            id: format!("{}-{slug}", self.name),
            backend: self.name.clone(),
            slug: slug.clone(),
            name: options.resolve_name(self.clock.timezone()),
            date: options.when,
            size: archive.len() as u64,
            backup_type: "full".to_string(),
            version: None,
            protected: false,
            retained: false,
            ignore: false,
            details: serde_json::Value::Null,
        };
        self.insert(record.clone(), archive);
        Ok(record)
    }

    async fn save(&self, backup: &Backup, mut stream: Box<dyn ByteStream>) -> Result<BackendRecord> {
        let mut data = Vec::with_capacity(stream.size() as usize);
        loop {
            let chunk = stream.read_chunk(64 * 1024).await?;
            if chunk.is_empty() {
                break;
            }
            data.extend_from_slice(&chunk);
        }
        let template = backup
            .sources()
            .next()
            .ok_or_else(|| EngineError::Logic("saving a backup with no records".to_string()))?;
        let record = BackendRecord {
            id: format!("{}-{}", self.name, backup.slug()),
            backend: self.name.clone(),
            slug: backup.slug().to_string(),
            name: template.name.clone(),
            date: template.date,
            size: data.len() as u64,
            backup_type: template.backup_type.clone(),
            version: template.version.clone(),
            protected: template.protected,
            retained: false,
            ignore: false,
            details: template.details.clone(),
        };
        self.insert(record.clone(), Bytes::from(data));
        Ok(record)
    }

    async fn read(&self, record: &BackendRecord) -> Result<Box<dyn ByteStream>> {
        let archive = self
            .archive(&record.slug)
            .ok_or_else(|| EngineError::NoBackup(record.slug.clone()))?;
        Ok(Box::new(MemoryStream::new(archive)))
    }

    async fn delete(&self, record: &BackendRecord) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.records.remove(&record.slug).is_none() {
            return Err(EngineError::NoBackup(record.slug.clone()));
        }
        state.archives.remove(&record.slug);
        Ok(())
    }

    async fn retain(&self, record: &BackendRecord, retain: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match state.records.get_mut(&record.slug) {
            Some(stored) => {
                stored.retained = retain;
                Ok(())
            }
            None => Err(EngineError::NoBackup(record.slug.clone())),
        }
    }

    async fn ignore(&self, record: &BackendRecord, ignore: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match state.records.get_mut(&record.slug) {
            Some(stored) => {
                stored.ignore = ignore;
                Ok(())
            }
            None => Err(EngineError::NoBackup(record.slug.clone())),
        }
    }
}

#[async_trait]
impl BackupDestination for MemoryBackend {
    fn upload_enabled(&self) -> bool {
        self.state.lock().unwrap().upload
    }
}
