//! Operation serialization and sync scheduling.
//!
//! [`Coordinator`] wraps the model behind two pieces of machinery:
//!
//! - A soft lock: every mutating operation atomically checks-and-sets one
//!   busy flag and fails fast with [`EngineError::PleaseWait`] when another
//!   operation is in flight. Nothing queues; callers retry.
//! - A single-flight background sync task. [`Coordinator::sync`] spawns one
//!   (or joins the one already running) and waits for it; the outcome is
//!   recorded rather than raised, and drives the retry backoff: success
//!   resets it, transient failures grow it, user-actionable failures pin it
//!   at the ceiling, cancellation leaves it alone.

use crate::config::Config;
use crate::model::backup::{Backup, CreateOptions};
use crate::model::{EngineStatus, Model};
use crate::observer::StatusObserver;
use crate::source::{BackupSource, ByteStream};
use crate::time::Clock;
use crate::utils::Backoff;
use crate::{EngineError, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// First retry delay after a transient sync failure.
const BACKOFF_BASE: Duration = Duration::from_secs(10);
const BACKOFF_MULTIPLIER: u32 = 2;

struct SyncState {
    backoff: Backoff,
    last_success: Option<DateTime<Utc>>,
    last_failure: Option<DateTime<Utc>>,
    /// Set while the most recent sync outcome was a failure.
    last_error: Option<String>,
}

struct RunningSync {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    done: watch::Receiver<bool>,
}

/// RAII hold on the coordinator's busy flag.
struct SoftLock {
    busy: Arc<Mutex<bool>>,
}

impl SoftLock {
    fn acquire(busy: &Arc<Mutex<bool>>) -> Result<Self> {
        let mut flag = busy.lock().unwrap();
        if *flag {
            return Err(EngineError::PleaseWait);
        }
        *flag = true;
        drop(flag);
        Ok(Self { busy: busy.clone() })
    }
}

impl Drop for SoftLock {
    fn drop(&mut self) {
        *self.busy.lock().unwrap() = false;
    }
}

pub struct Coordinator {
    model: Arc<AsyncMutex<Model>>,
    clock: Arc<dyn Clock>,
    config: Config,
    observer: Arc<dyn StatusObserver>,
    busy: Arc<Mutex<bool>>,
    state: Arc<Mutex<SyncState>>,
    running: Mutex<Option<RunningSync>>,

    /// Snapshots published by the model; status queries read these instead
    /// of contending for the model while a sync pass holds it.
    status: watch::Receiver<EngineStatus>,
    backends: Vec<Arc<dyn BackupSource>>,
}

impl Coordinator {
    pub fn new(
        config: Config,
        clock: Arc<dyn Clock>,
        model: Model,
        observer: Arc<dyn StatusObserver>,
    ) -> Self {
        let max_delay = Duration::from_secs(config.schedule.max_sync_interval_seconds);
        let status = model.status();
        let backends = model.backend_handles();
        Self {
            model: Arc::new(AsyncMutex::new(model)),
            clock,
            config,
            observer,
            busy: Arc::new(Mutex::new(false)),
            state: Arc::new(Mutex::new(SyncState {
                backoff: Backoff::new(BACKOFF_BASE, BACKOFF_MULTIPLIER, max_delay),
                last_success: None,
                last_failure: None,
                last_error: None,
            })),
            running: Mutex::new(None),
            status,
            backends,
        }
    }

    /// Kick off a background sync if none is running. Returns immediately.
    pub fn start_sync(&self) {
        let _ = self.join_or_spawn();
    }

    /// Run (or join the already-running) sync and wait for it to finish.
    ///
    /// The sync's own outcome is recorded, not raised: query it through
    /// [`last_error`](Self::last_error) and [`next_sync_attempt`](Self::next_sync_attempt).
    pub async fn sync(&self) {
        let mut done = self.join_or_spawn();
        loop {
            if *done.borrow() {
                return;
            }
            if done.changed().await.is_err() {
                return;
            }
        }
    }

    fn join_or_spawn(&self) -> watch::Receiver<bool> {
        let mut running = self.running.lock().unwrap();
        if let Some(task) = running.as_ref() {
            if !task.handle.is_finished() {
                return task.done.clone();
            }
        }
        let (done_tx, done_rx) = watch::channel(false);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Self::run_sync(
            self.model.clone(),
            self.clock.clone(),
            self.observer.clone(),
            self.busy.clone(),
            self.state.clone(),
            cancel.clone(),
            done_tx,
        ));
        *running = Some(RunningSync {
            cancel,
            handle,
            done: done_rx.clone(),
        });
        done_rx
    }

    async fn run_sync(
        model: Arc<AsyncMutex<Model>>,
        clock: Arc<dyn Clock>,
        observer: Arc<dyn StatusObserver>,
        busy: Arc<Mutex<bool>>,
        state: Arc<Mutex<SyncState>>,
        cancel: CancellationToken,
        done: watch::Sender<bool>,
    ) {
        observer.sync_started();
        let result = Self::locked_sync(&model, &clock, &busy, &cancel).await;
        match result {
            Ok(()) => {
                {
                    let mut st = state.lock().unwrap();
                    st.backoff.reset();
                    st.last_success = Some(clock.now());
                    st.last_error = None;
                }
                info!("Sync completed");
                observer.sync_succeeded();
            }
            Err(error) => {
                {
                    let mut st = state.lock().unwrap();
                    st.last_failure = Some(clock.now());
                    st.last_error = Some(error.to_string());
                    if error.is_cancelled() {
                        // User asked for this; the retry schedule is not at
                        // fault and stays put.
                    } else if error.retry_soon() {
                        st.backoff.backoff();
                    } else {
                        st.backoff.max_out();
                    }
                }
                warn!(error = %error, "Sync failed");
                observer.sync_failed(&error);
            }
        }
        let _ = done.send(true);
    }

    async fn locked_sync(
        model: &AsyncMutex<Model>,
        clock: &Arc<dyn Clock>,
        busy: &Arc<Mutex<bool>>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let _guard = SoftLock::acquire(busy)?;
        let now = clock.now();
        tokio::select! {
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
            result = async {
                let mut model = model.lock().await;
                model.sync(now, cancel).await
            } => result,
        }
    }

    /// Cancel the in-flight sync, if any, and wait for it to wind down.
    pub async fn cancel(&self) {
        let task = self.running.lock().unwrap().take();
        if let Some(task) = task {
            task.cancel.cancel();
            let _ = task.handle.await;
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.running
            .lock()
            .unwrap()
            .as_ref()
            .map(|task| !task.handle.is_finished())
            .unwrap_or(false)
    }

    /// The most recent sync failure, if the last sync failed.
    pub fn last_error(&self) -> Option<String> {
        self.state.lock().unwrap().last_error.clone()
    }

    /// When the next sync should run: after the backoff delay if the last
    /// one failed, otherwise at the earlier of the next scheduled backup and
    /// the maximum sync interval. Answered from the published snapshot, so
    /// it never waits on a running sync.
    pub fn next_sync_attempt(&self) -> DateTime<Utc> {
        let now = self.clock.now();
        let (failed, last_failure, last_success, delay) = {
            let st = self.state.lock().unwrap();
            (
                st.last_error.is_some(),
                st.last_failure,
                st.last_success,
                st.backoff.peek(),
            )
        };
        if failed {
            let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            return last_failure.unwrap_or(now) + delay;
        }
        let by_interval = last_success.unwrap_or(now)
            + chrono::Duration::seconds(self.config.schedule.max_sync_interval_seconds as i64);
        match self.status.borrow().next_backup {
            Some(next_backup) => by_interval.min(next_backup),
            None => by_interval,
        }
    }

    /// Create a backup immediately, outside the schedule.
    pub async fn start_backup(&self, options: CreateOptions) -> Result<()> {
        let _guard = SoftLock::acquire(&self.busy)?;
        let mut model = self.model.lock().await;
        model.create_backup(options).await
    }

    /// Delete one backup from the named backends.
    pub async fn delete(&self, backends: &[String], slug: &str) -> Result<()> {
        let _guard = SoftLock::acquire(&self.busy)?;
        let mut model = self.model.lock().await;
        model.delete_backup(backends, slug).await
    }

    /// Apply per-backend retention exemptions to one backup.
    pub async fn retain(&self, retentions: &HashMap<String, bool>, slug: &str) -> Result<()> {
        let _guard = SoftLock::acquire(&self.busy)?;
        let mut model = self.model.lock().await;
        for (backend, retain) in retentions {
            model.set_retained(backend, slug, *retain).await?;
        }
        Ok(())
    }

    /// Mark or unmark one backend's copy as ignored by the engine.
    pub async fn ignore(&self, backend: &str, slug: &str, ignored: bool) -> Result<()> {
        let _guard = SoftLock::acquire(&self.busy)?;
        let mut model = self.model.lock().await;
        model.set_ignored(backend, slug, ignored).await
    }

    /// Copy a backup from the destination back to the source.
    pub async fn upload_backup(&self, slug: &str) -> Result<()> {
        let _guard = SoftLock::acquire(&self.busy)?;
        let mut model = self.model.lock().await;
        model.restore_backup(slug).await
    }

    /// Open a backup's archive for reading, preferring the source copy.
    /// Read-only: served from the published snapshot and backend handles,
    /// so downloads keep working while a sync pass holds the model.
    pub async fn download(&self, slug: &str) -> Result<Box<dyn ByteStream>> {
        let backup = self
            .status
            .borrow()
            .backups
            .iter()
            .find(|b| b.slug() == slug)
            .cloned()
            .ok_or_else(|| EngineError::NoBackup(slug.to_string()))?;
        for backend in &self.backends {
            if let Some(record) = backup.source(backend.name()) {
                return backend.read(record).await;
            }
        }
        Err(EngineError::NoBackup(slug.to_string()))
    }

    /// All known backups, oldest first, from the last published snapshot.
    pub fn backups(&self) -> Vec<Backup> {
        self.status.borrow().backups.clone()
    }

    /// Permit the next sync pass to delete multiple backups at once.
    pub async fn approve_multiple_deletes(&self) {
        self.model.lock().await.approve_multiple_deletes();
    }

    /// Restart the scheduled-backup cooldown after credentials changed.
    pub async fn note_credentials_saved(&self) {
        self.model.lock().await.restart_cooldown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MetadataCache;
    use crate::model::backup::testing::record;
    use crate::observer::NullObserver;
    use crate::source::memory::MemoryBackend;
    use crate::time::testing::FakeClock;
    use bytes::Bytes;
    use chrono::TimeZone;

    struct Fixture {
        clock: Arc<FakeClock>,
        source: Arc<MemoryBackend>,
        dest: Arc<MemoryBackend>,
        coordinator: Coordinator,
    }

    fn start_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.schedule.days_between_backups = 0.0;
        config.schedule.startup_delay_minutes = 0;
        config
    }

    fn fixture(config: Config) -> Fixture {
        let clock = Arc::new(FakeClock::new(start_time(), config.timezone()));
        let source = Arc::new(MemoryBackend::new("local", clock.clone()));
        let dest = Arc::new(MemoryBackend::new("remote", clock.clone()));
        let observer: Arc<dyn StatusObserver> = Arc::new(NullObserver);
        let model = Model::new(
            config.clone(),
            clock.clone(),
            source.clone(),
            dest.clone(),
            observer.clone(),
            MetadataCache::in_memory(),
        );
        let coordinator = Coordinator::new(config, clock.clone(), model, observer);
        Fixture {
            clock,
            source,
            dest,
            coordinator,
        }
    }

    async fn let_sync_start(fx: &Fixture) {
        fx.coordinator.start_sync();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_operations_fail_fast_while_syncing() {
        let fx = fixture(config());
        fx.source.hold();
        let_sync_start(&fx).await;
        assert!(fx.coordinator.is_syncing());

        // The soft lock is held by the sync task.
        let options = CreateOptions::new(fx.clock.now(), "Manual backup");
        let result = fx.coordinator.start_backup(options.clone()).await;
        assert!(matches!(result, Err(EngineError::PleaseWait)));
        assert!(fx.source.is_empty());

        fx.source.release();
        fx.coordinator.sync().await;
        assert!(!fx.coordinator.is_syncing());
        assert!(fx.coordinator.last_error().is_none());

        // Once the sync completes the same operation goes through.
        fx.coordinator.start_backup(options).await.unwrap();
        assert_eq!(fx.source.len(), 1);
    }

    #[tokio::test]
    async fn test_sync_joins_existing_run() {
        let fx = fixture(config());
        fx.source.hold();
        let_sync_start(&fx).await;
        // Joining doesn't spawn a second task; both wait on the same run.
        let release = {
            let source = fx.source.clone();
            tokio::spawn(async move {
                for _ in 0..10 {
                    tokio::task::yield_now().await;
                }
                source.release();
            })
        };
        fx.coordinator.sync().await;
        release.await.unwrap();
        assert!(fx.coordinator.last_error().is_none());
    }

    #[tokio::test]
    async fn test_cancel_leaves_backoff_untouched() {
        let fx = fixture(config());
        fx.source.insert(record("local", "aaa", start_time()), Bytes::from("a"));
        fx.source.hold();
        let_sync_start(&fx).await;

        fx.coordinator.cancel().await;
        assert!(!fx.coordinator.is_syncing());
        let error = fx.coordinator.last_error().unwrap();
        assert!(error.contains("cancelled"), "unexpected error: {error}");

        // Backoff was never grown, so the next attempt is immediate.
        assert_eq!(fx.coordinator.next_sync_attempt(), fx.clock.now());
        fx.source.release();
    }

    #[tokio::test]
    async fn test_transient_failures_grow_backoff() {
        let fx = fixture(config());

        fx.source.inject_error(EngineError::ServerError(503));
        fx.coordinator.sync().await;
        assert!(fx.coordinator.last_error().is_some());
        assert_eq!(
            fx.coordinator.next_sync_attempt(),
            fx.clock.now() + chrono::Duration::seconds(10)
        );

        fx.source.inject_error(EngineError::Timeout);
        fx.coordinator.sync().await;
        assert_eq!(
            fx.coordinator.next_sync_attempt(),
            fx.clock.now() + chrono::Duration::seconds(20)
        );

        // Success resets the schedule.
        fx.coordinator.sync().await;
        assert!(fx.coordinator.last_error().is_none());
        assert_eq!(
            fx.coordinator.next_sync_attempt(),
            fx.clock.now() + chrono::Duration::seconds(3600)
        );
    }

    #[tokio::test]
    async fn test_user_actionable_failure_maxes_out_backoff() {
        let fx = fixture(config());
        fx.dest.set_precondition_failure(Some("ambiguous backup folder"));

        fx.coordinator.sync().await;
        let error = fx.coordinator.last_error().unwrap();
        assert!(error.contains("ambiguous"), "unexpected error: {error}");
        // Straight to the ceiling: retrying sooner can't help.
        assert_eq!(
            fx.coordinator.next_sync_attempt(),
            fx.clock.now() + chrono::Duration::seconds(3600)
        );
    }

    #[tokio::test]
    async fn test_retain_delete_and_download() {
        let fx = fixture(config());
        fx.source.insert(record("local", "aaa", start_time()), Bytes::from("archive"));
        fx.coordinator.sync().await;
        assert_eq!(fx.coordinator.backups().len(), 1);

        let retentions = HashMap::from([("local".to_string(), true)]);
        fx.coordinator.retain(&retentions, "aaa").await.unwrap();
        assert!(fx.source.record("aaa").unwrap().retained);

        let mut stream = fx.coordinator.download("aaa").await.unwrap();
        let bytes = stream.read_chunk(1024).await.unwrap();
        assert_eq!(bytes, Bytes::from("archive"));

        fx.coordinator
            .delete(&["local".to_string(), "remote".to_string()], "aaa")
            .await
            .unwrap();
        assert!(fx.source.is_empty());
        assert!(fx.coordinator.backups().is_empty());

        let missing = fx.coordinator.download("aaa").await;
        assert!(matches!(missing, Err(EngineError::NoBackup(_))));
    }

    #[tokio::test]
    async fn test_upload_backup_restores_from_destination() {
        let fx = fixture(config());
        fx.dest.insert(record("remote", "aaa", start_time()), Bytes::from("archive"));
        fx.coordinator.sync().await;

        fx.coordinator.upload_backup("aaa").await.unwrap();
        assert_eq!(fx.source.archive("aaa"), Some(Bytes::from("archive")));
    }

    #[tokio::test]
    async fn test_status_queries_answer_while_sync_holds_the_model() {
        let fx = fixture(config());
        fx.source.insert(record("local", "aaa", start_time()), Bytes::from("archive"));
        fx.coordinator.sync().await;
        assert_eq!(fx.coordinator.backups().len(), 1);

        // Park the next pass inside the backend; queries must keep working
        // off the published snapshot instead of waiting for the model.
        fx.source.hold();
        let_sync_start(&fx).await;
        assert!(fx.coordinator.is_syncing());

        assert_eq!(fx.coordinator.backups().len(), 1);
        assert!(fx.coordinator.next_sync_attempt() > fx.clock.now());
        let mut stream = tokio::time::timeout(
            Duration::from_millis(500),
            fx.coordinator.download("aaa"),
        )
        .await
        .expect("download must not wait for the sync pass")
        .unwrap();
        assert_eq!(stream.read_chunk(1024).await.unwrap(), Bytes::from("archive"));

        fx.source.release();
        fx.coordinator.sync().await;
        assert!(fx.coordinator.last_error().is_none());
    }

    #[tokio::test]
    async fn test_low_space_is_user_actionable() {
        let fx = fixture(config());
        fx.source.inject_error(EngineError::LowSpace);

        fx.coordinator.sync().await;
        let error = fx.coordinator.last_error().unwrap();
        assert!(error.contains("free space"), "unexpected error: {error}");
        // Making room needs the user; retrying sooner can't help.
        assert_eq!(
            fx.coordinator.next_sync_attempt(),
            fx.clock.now() + chrono::Duration::seconds(3600)
        );
    }
}
