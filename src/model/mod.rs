//! The synchronization state machine.
//!
//! [`Model`] owns the unified backup collection and drives one full pass per
//! [`Model::sync`] call:
//!
//! 1. Reconcile listings from both backends into the collection
//! 2. Pre-change validation (`check_before_changes`)
//! 3. Purge each backend against its retention scheme
//! 4. Recompute advisory purge flags
//! 5. Create a scheduled backup when one is due
//! 6. Upload source backups to the destination, newest first
//! 7. Optionally delete source copies that are fully replicated
//! 8. Flush the metadata cache
//!
//! The collection is only mutated from inside `sync` and the coordinator's
//! soft-locked operations, so no interior locking is needed here.

pub mod backup;

use crate::cache::MetadataCache;
use crate::config::Config;
use crate::observer::StatusObserver;
use crate::retention::{
    DeleteAfterUploadScheme, GenerationalScheme, OldestScheme, PurgeCandidate, RetentionScheme,
};
use crate::source::{BackupDestination, BackupSource};
use crate::time::Clock;
use crate::{EngineError, Result};
use backup::{Backup, BackendRecord, CreateOptions};
use chrono::{DateTime, Duration, LocalResult, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Slug used when simulating an upload's effect on destination retention.
/// Never collides with real slugs, which backends generate as hex.
const SIMULATED_SLUG: &str = "incoming-simulation";

/// Read-only view of the engine's state, published over a watch channel so
/// status queries never contend with a long-running sync pass. A snapshot is
/// sent after every structural mutation; readers see the state as of the last
/// completed mutation, never a half-applied one.
#[derive(Debug, Clone, Default)]
pub struct EngineStatus {
    /// All known backups, oldest first.
    pub backups: Vec<Backup>,
    /// When the next scheduled backup is due, as of the last publish.
    pub next_backup: Option<DateTime<Utc>>,
}

pub struct Model {
    config: Config,
    clock: Arc<dyn Clock>,
    source: Arc<dyn BackupSource>,
    dest: Arc<dyn BackupDestination>,
    /// The destination coerced to its source capabilities, so both backends
    /// can be handled uniformly.
    dest_as_source: Arc<dyn BackupSource>,
    observer: Arc<dyn StatusObserver>,
    cache: MetadataCache,

    backups: BTreeMap<String, Backup>,

    /// Scheduled creations that come due before this hold off, giving the
    /// user a window after startup or credential changes to intervene.
    cooldown_until: DateTime<Utc>,

    /// One-shot approval for deleting multiple backups in a single pass.
    multi_delete_approved: bool,

    status: watch::Sender<EngineStatus>,
}

impl Model {
    pub fn new<S, D>(
        config: Config,
        clock: Arc<dyn Clock>,
        source: Arc<S>,
        dest: Arc<D>,
        observer: Arc<dyn StatusObserver>,
        cache: MetadataCache,
    ) -> Self
    where
        S: BackupSource + 'static,
        D: BackupDestination + 'static,
    {
        let cooldown_until =
            clock.now() + Duration::minutes(config.schedule.startup_delay_minutes as i64);
        let model = Self {
            config,
            clock,
            source,
            dest_as_source: dest.clone(),
            dest,
            observer,
            cache,
            backups: BTreeMap::new(),
            cooldown_until,
            multi_delete_approved: false,
            status: watch::channel(EngineStatus::default()).0,
        };
        model.publish_status();
        model
    }

    /// Restart the startup cooldown, e.g. after credentials were saved.
    pub fn restart_cooldown(&mut self) {
        self.cooldown_until = self.clock.now()
            + Duration::minutes(self.config.schedule.startup_delay_minutes as i64);
        self.publish_status();
    }

    /// Subscribe to published state snapshots.
    pub fn status(&self) -> watch::Receiver<EngineStatus> {
        self.status.subscribe()
    }

    /// Handles to both backends, for serving archive reads without going
    /// through the model.
    pub fn backend_handles(&self) -> Vec<Arc<dyn BackupSource>> {
        vec![self.source.clone(), self.dest_as_source.clone()]
    }

    fn publish_status(&self) {
        self.status.send_replace(EngineStatus {
            backups: self.backups().into_iter().cloned().collect(),
            next_backup: self.peek_next_backup(self.clock.now()).0,
        });
    }

    /// Permit the next sync pass to delete more than one backup per backend.
    pub fn approve_multiple_deletes(&mut self) {
        self.multi_delete_approved = true;
    }

    /// All backups, oldest first.
    pub fn backups(&self) -> Vec<&Backup> {
        let mut all: Vec<&Backup> = self.backups.values().collect();
        all.sort_by_key(|b| (b.date(), b.slug().to_string()));
        all
    }

    pub fn backup(&self, slug: &str) -> Option<&Backup> {
        self.backups.get(slug)
    }

    pub fn backend_by_name(&self, name: &str) -> Option<Arc<dyn BackupSource>> {
        if name == self.source.name() {
            Some(self.source.clone())
        } else if name == self.dest.name() {
            Some(self.dest_as_source.clone())
        } else {
            None
        }
    }

    /// Run one full synchronization pass.
    pub async fn sync(&mut self, now: DateTime<Utc>, cancel: &CancellationToken) -> Result<()> {
        let outcome = self.sync_inner(now, cancel).await;
        // Approval is a one-shot grant, consumed whether or not the pass
        // made it to the deletions.
        self.multi_delete_approved = false;
        // A failed pass may still have reconciled listings.
        self.publish_status();
        outcome
    }

    async fn sync_inner(&mut self, now: DateTime<Utc>, cancel: &CancellationToken) -> Result<()> {
        self.reconcile().await?;
        self.source.check_before_changes().await?;
        self.dest_as_source.check_before_changes().await?;
        check_cancelled(cancel)?;

        if self.dest.enabled() {
            self.purge(&self.source.clone()).await?;
            self.purge(&self.dest_as_source.clone()).await?;
        }
        self.update_purge_flags();

        if let Some(next) = self.next_backup(now) {
            if now >= next && self.source.enabled() && self.dest.enabled() {
                check_cancelled(cancel)?;
                if self.config.retention.delete_before_new {
                    self.purge(&self.source.clone()).await?;
                }
                let options = CreateOptions::new(now, &self.config.schedule.backup_name);
                self.create_backup(options).await?;
                self.purge(&self.source.clone()).await?;
                self.update_purge_flags();
            }
        }

        if self.dest.enabled() && self.dest.upload_enabled() {
            for slug in self.pending_uploads() {
                check_cancelled(cancel)?;
                // A purge above may have taken this one out already.
                let still_pending = self
                    .backups
                    .get(&slug)
                    .map(|b| {
                        b.source(self.source.name()).is_some()
                            && b.source(self.dest.name()).is_none()
                    })
                    .unwrap_or(false);
                if !still_pending {
                    continue;
                }
                if !self.upload_would_survive(&slug) {
                    // Everything further down the list is older still.
                    debug!(slug = %slug, "Not uploading: it would be deleted immediately");
                    break;
                }
                if self.config.retention.delete_before_new {
                    self.purge(&self.dest_as_source.clone()).await?;
                }
                self.upload_one(&slug).await?;
                self.purge(&self.dest_as_source.clone()).await?;
                self.update_purge_flags();
            }
        }

        if self.config.retention.delete_after_upload {
            self.delete_uploaded().await?;
            self.update_purge_flags();
        }

        self.cache.flush_if_dirty()?;
        Ok(())
    }

    /// Merge both backends' listings into the collection, dropping backups
    /// that no longer exist anywhere.
    async fn reconcile(&mut self) -> Result<()> {
        for backend in [self.source.clone(), self.dest_as_source.clone()] {
            let listed = if backend.enabled() {
                backend.get().await?
            } else {
                BTreeMap::new()
            };
            for (slug, record) in &listed {
                match self.backups.get_mut(slug) {
                    Some(existing) => existing.add_source(record.clone()),
                    None => {
                        self.backups.insert(slug.clone(), Backup::new(record.clone()));
                    }
                }
            }
            let vanished: Vec<String> = self
                .backups
                .iter()
                .filter(|(slug, b)| {
                    b.source(backend.name()).is_some() && !listed.contains_key(*slug)
                })
                .map(|(slug, _)| slug.clone())
                .collect();
            for slug in vanished {
                debug!(slug = %slug, backend = backend.name(), "Backup vanished from backend");
                self.remove_record(&slug, backend.name());
            }
        }

        // Reattach persisted creation intents to reconciled backups.
        let slugs: Vec<String> = self.backups.keys().cloned().collect();
        for slug in slugs {
            if let Some(options) = self.cache.get(&slug).cloned() {
                if let Some(backup) = self.backups.get_mut(&slug) {
                    backup.set_options(options);
                }
            }
        }
        Ok(())
    }

    fn remove_record(&mut self, slug: &str, backend: &str) {
        if let Some(backup) = self.backups.get_mut(slug) {
            backup.remove_source(backend);
            if backup.is_deleted() {
                self.backups.remove(slug);
                self.cache.remove(slug);
            }
        }
    }

    /// Delete backups at `backend` until its retention scheme is satisfied.
    async fn purge(&mut self, backend: &Arc<dyn BackupSource>) -> Result<()> {
        loop {
            let pending = self.purge_list(&**backend);
            let Some(next) = pending.first() else {
                return Ok(());
            };
            if pending.len() > 1
                && self.config.retention.confirm_multiple_deletes
                && !self.multi_delete_approved
            {
                let counts = self.purge_counts();
                self.observer.deletes_pending_confirmation(&counts);
                return Err(EngineError::DeleteMultiplePending { counts });
            }
            info!(
                slug = %next.slug,
                backend = backend.name(),
                reason = %next.reason,
                "Deleting backup per retention policy"
            );
            let slug = next.slug.clone();
            self.delete_from(backend, &slug).await?;
        }
    }

    /// Everything `backend`'s scheme would delete, in order, if deletion ran
    /// to completion right now.
    pub fn purge_list(&self, backend: &dyn BackupSource) -> Vec<PurgeCandidate> {
        if !backend.enabled() {
            return Vec::new();
        }
        let mut pool: Vec<&Backup> = self.backups.values().collect();
        let mut purges = Vec::new();
        while let Some(candidate) = self.next_purge_in(backend, &pool, false) {
            pool.retain(|b| b.slug() != candidate.slug);
            purges.push(candidate);
        }
        purges
    }

    fn purge_counts(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for backend in [self.source.clone(), self.dest_as_source.clone()] {
            counts.insert(backend.name().to_string(), self.purge_list(&*backend).len());
        }
        counts
    }

    fn next_purge_in(
        &self,
        backend: &dyn BackupSource,
        pool: &[&Backup],
        find_next: bool,
    ) -> Option<PurgeCandidate> {
        if backend.max_count() == 0 || !backend.enabled() || pool.is_empty() {
            return None;
        }
        let eligible: Vec<&Backup> = pool
            .iter()
            .filter(|b| {
                b.source(backend.name()).map(|r| !r.retained).unwrap_or(false) && !b.ignore()
            })
            .copied()
            .collect();
        if eligible.is_empty() {
            return None;
        }
        self.scheme_for(backend, find_next).next_purge(&eligible)
    }

    fn scheme_for(&self, backend: &dyn BackupSource, find_next: bool) -> Box<dyn RetentionScheme> {
        let mut keep = backend.max_count();
        if find_next {
            keep = keep.saturating_sub(1);
        }
        match &self.config.retention.generational {
            Some(generational) => Box::new(GenerationalScheme::new(
                self.clock.timezone(),
                generational.clone(),
                keep,
            )),
            None => Box::new(OldestScheme::new(keep)),
        }
    }

    /// Recompute the advisory "deleted next" flag on every backup. Pure
    /// function of current state; called after every structural mutation so
    /// observers never see stale flags.
    fn update_purge_flags(&mut self) {
        for backend in [self.source.clone(), self.dest_as_source.clone()] {
            let candidate = {
                let pool: Vec<&Backup> = self.backups.values().collect();
                self.next_purge_in(&*backend, &pool, true).map(|c| c.slug)
            };
            for backup in self.backups.values_mut() {
                let flagged = candidate.as_deref() == Some(backup.slug());
                backup.update_purge(backend.name(), flagged);
            }
        }
        self.publish_status();
    }

    /// When the next scheduled backup is due, or `None` when scheduling is
    /// disabled or the destination isn't ready. Reports a startup deferral
    /// through the observer.
    pub fn next_backup(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let (next, deferred) = self.peek_next_backup(now);
        if deferred {
            self.observer.waiting_for_startup();
        }
        next
    }

    /// The next due time plus whether the startup cooldown is deferring it.
    /// No observer side effects, so snapshot publishing can use it freely.
    fn peek_next_backup(&self, now: DateTime<Utc>) -> (Option<DateTime<Utc>>, bool) {
        let last = self.backups.values().filter_map(|b| b.date()).max();
        let Some(next) = self.next_backup_after(now, last) else {
            return (None, false);
        };
        if next <= now && now < self.cooldown_until {
            return (Some(self.cooldown_until), true);
        }
        (Some(next), false)
    }

    fn next_backup_after(
        &self,
        now: DateTime<Utc>,
        last: Option<DateTime<Utc>>,
    ) -> Option<DateTime<Utc>> {
        let days_between = self.config.schedule.days_between_backups;
        if days_between <= 0.0 || self.dest.needs_configuration() {
            return None;
        }
        let Some(last) = last else {
            return Some(now);
        };

        let interval = Duration::milliseconds((days_between * 86_400_000.0) as i64);
        let Some((hour, minute)) = self.config.time_of_day() else {
            let next = last + interval;
            return Some(next.max(now));
        };

        // Anchor on the last backup's local calendar day: wall-clock
        // arithmetic keeps the configured time of day stable across DST.
        let tz = self.clock.timezone();
        let last_local = tz.from_utc_datetime(&last.naive_utc());
        let candidate = last_local.date_naive().and_hms_opt(hour, minute, 0)?;
        let next_naive = if last_local.naive_local() < candidate {
            candidate
        } else {
            candidate + interval
        };
        let next = resolve_local(tz, next_naive).with_timezone(&Utc);
        Some(next.max(now))
    }

    /// Create a backup at the source and track it.
    pub async fn create_backup(&mut self, options: CreateOptions) -> Result<()> {
        if !self.source.enabled() {
            return Ok(());
        }
        info!(name = %options.resolve_name(self.clock.timezone()), "Creating backup");
        let mut record = self.source.create(&options).await?;
        let slug = record.slug.clone();
        if options.retain.get(self.source.name()).copied().unwrap_or(false) {
            self.source.retain(&record, true).await?;
            record.retained = true;
        }
        // A destination retain request can only be honored once the backup
        // gets there, which may be a different process lifetime.
        let wants_dest_retain =
            options.retain.get(self.dest.name()).copied().unwrap_or(false);
        let mut backup = Backup::new(record);
        backup.set_options(options.clone());
        if wants_dest_retain {
            self.cache.set(&slug, options);
        }
        self.backups.insert(slug, backup);
        self.publish_status();
        Ok(())
    }

    /// Source backups missing from the destination, newest first.
    fn pending_uploads(&self) -> Vec<String> {
        let mut pending: Vec<(DateTime<Utc>, String)> = self
            .backups
            .values()
            .filter(|b| {
                b.source(self.source.name()).map(|r| !r.ignore).unwrap_or(false)
                    && b.source(self.dest.name()).is_none()
                    && !b.ignore()
            })
            .filter_map(|b| b.date().map(|d| (d, b.slug().to_string())))
            .collect();
        pending.sort();
        pending.reverse();
        pending.into_iter().map(|(_, slug)| slug).collect()
    }

    /// Simulate adding this backup at the destination and check it wouldn't
    /// be the very next deletion candidate there.
    fn upload_would_survive(&self, slug: &str) -> bool {
        let Some(date) = self.backups.get(slug).and_then(|b| b.date()) else {
            return false;
        };
        let dummy = Backup::new(BackendRecord {
            id: SIMULATED_SLUG.to_string(),
            backend: self.dest.name().to_string(),
            slug: SIMULATED_SLUG.to_string(),
            name: SIMULATED_SLUG.to_string(),
            date,
            size: 0,
            backup_type: String::new(),
            version: None,
            protected: false,
            retained: false,
            ignore: false,
            details: serde_json::Value::Null,
        });
        let mut pool: Vec<&Backup> = self.backups.values().collect();
        pool.push(&dummy);
        match self.next_purge_in(&*self.dest_as_source, &pool, false) {
            Some(candidate) => candidate.slug != SIMULATED_SLUG,
            None => true,
        }
    }

    async fn upload_one(&mut self, slug: &str) -> Result<()> {
        let (snapshot, record) = {
            let backup = self
                .backups
                .get(slug)
                .ok_or_else(|| EngineError::NoBackup(slug.to_string()))?;
            let record = backup
                .source(self.source.name())
                .ok_or_else(|| EngineError::NoBackup(slug.to_string()))?
                .clone();
            (backup.clone(), record)
        };
        info!(slug, name = %record.name, "Uploading backup to destination");
        let stream = self.source.read(&record).await?;
        let mut saved = self.dest_as_source.save(&snapshot, stream).await?;

        let wants_retain = self
            .backups
            .get(slug)
            .and_then(|b| b.options())
            .and_then(|o| o.retain.get(self.dest.name()))
            .copied()
            .unwrap_or(false);
        if wants_retain {
            self.dest_as_source.retain(&saved, true).await?;
            saved.retained = true;
            // Intent honored; nothing left to remember across restarts.
            self.cache.remove(slug);
        }
        if let Some(backup) = self.backups.get_mut(slug) {
            backup.add_source(saved);
        }
        Ok(())
    }

    /// Delete source copies that exist at the destination. Deliberate
    /// replication cleanup, so multi-delete confirmation doesn't apply.
    async fn delete_uploaded(&mut self) -> Result<()> {
        let scheme =
            DeleteAfterUploadScheme::new(self.source.name(), vec![self.dest.name().to_string()]);
        loop {
            let candidate = {
                let pool: Vec<&Backup> = self
                    .backups
                    .values()
                    .filter(|b| {
                        b.source(self.source.name()).map(|r| !r.retained).unwrap_or(false)
                            && !b.ignore()
                    })
                    .collect();
                scheme.next_purge(&pool)
            };
            let Some(candidate) = candidate else {
                return Ok(());
            };
            info!(slug = %candidate.slug, "Deleting uploaded backup from source");
            let source = self.source.clone();
            self.delete_from(&source, &candidate.slug).await?;
        }
    }

    async fn delete_from(&mut self, backend: &Arc<dyn BackupSource>, slug: &str) -> Result<()> {
        let record = match self.backups.get(slug).and_then(|b| b.source(backend.name())) {
            Some(record) => record.clone(),
            None => return Ok(()),
        };
        backend.delete(&record).await?;
        self.remove_record(slug, backend.name());
        Ok(())
    }

    /// Delete one backup from the named backends.
    pub async fn delete_backup(&mut self, backends: &[String], slug: &str) -> Result<()> {
        if !self.backups.contains_key(slug) {
            return Err(EngineError::NoBackup(slug.to_string()));
        }
        for name in backends {
            let backend = self
                .backend_by_name(name)
                .ok_or_else(|| EngineError::Logic(format!("unknown backend '{name}'")))?;
            self.delete_from(&backend, slug).await?;
        }
        self.update_purge_flags();
        Ok(())
    }

    /// Set or clear the retention exemption for one backend's copy.
    pub async fn set_retained(&mut self, backend: &str, slug: &str, retain: bool) -> Result<()> {
        let handle = self
            .backend_by_name(backend)
            .ok_or_else(|| EngineError::Logic(format!("unknown backend '{backend}'")))?;
        let record = self
            .backups
            .get(slug)
            .and_then(|b| b.source(backend))
            .ok_or_else(|| EngineError::NoBackup(slug.to_string()))?
            .clone();
        handle.retain(&record, retain).await?;
        if let Some(record) = self.backups.get_mut(slug).and_then(|b| b.source_mut(backend)) {
            record.retained = retain;
        }
        self.update_purge_flags();
        Ok(())
    }

    /// Set or clear the ignore flag for one backend's copy.
    pub async fn set_ignored(&mut self, backend: &str, slug: &str, ignored: bool) -> Result<()> {
        let handle = self
            .backend_by_name(backend)
            .ok_or_else(|| EngineError::Logic(format!("unknown backend '{backend}'")))?;
        let record = self
            .backups
            .get(slug)
            .and_then(|b| b.source(backend))
            .ok_or_else(|| EngineError::NoBackup(slug.to_string()))?
            .clone();
        handle.ignore(&record, ignored).await?;
        if let Some(record) = self.backups.get_mut(slug).and_then(|b| b.source_mut(backend)) {
            record.ignore = ignored;
        }
        self.update_purge_flags();
        Ok(())
    }

    /// Copy a backup from the destination back to the source (restore).
    pub async fn restore_backup(&mut self, slug: &str) -> Result<()> {
        let (snapshot, record) = {
            let backup = self
                .backups
                .get(slug)
                .ok_or_else(|| EngineError::NoBackup(slug.to_string()))?;
            let record = backup
                .source(self.dest.name())
                .ok_or_else(|| EngineError::NoBackup(slug.to_string()))?
                .clone();
            (backup.clone(), record)
        };
        info!(slug, name = %record.name, "Restoring backup to source");
        let stream = self.dest_as_source.read(&record).await?;
        let saved = self.source.save(&snapshot, stream).await?;
        if let Some(backup) = self.backups.get_mut(slug) {
            backup.add_source(saved);
        }
        self.update_purge_flags();
        Ok(())
    }

}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(EngineError::Cancelled)
    } else {
        Ok(())
    }
}

/// Resolve a naive local time in `tz`, taking the earlier side of ambiguous
/// times and skipping forward over nonexistent ones (DST gaps).
fn resolve_local(tz: Tz, naive: NaiveDateTime) -> DateTime<Tz> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(t) => t,
        LocalResult::Ambiguous(earliest, _) => earliest,
        LocalResult::None => {
            for step in 1..=48 {
                let probe = naive + Duration::minutes(30 * step);
                match tz.from_local_datetime(&probe) {
                    LocalResult::Single(t) => return t,
                    LocalResult::Ambiguous(earliest, _) => return earliest,
                    LocalResult::None => continue,
                }
            }
            // Unreachable for real timezones; interpret as UTC rather than
            // failing scheduling outright.
            tz.from_utc_datetime(&naive)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::backup::testing::record;
    use super::*;
    use crate::observer::testing::RecordingObserver;
    use crate::observer::NullObserver;
    use crate::source::memory::MemoryBackend;
    use crate::time::testing::FakeClock;
    use bytes::Bytes;

    struct Fixture {
        clock: Arc<FakeClock>,
        source: Arc<MemoryBackend>,
        dest: Arc<MemoryBackend>,
        model: Model,
    }

    fn start_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn config() -> Config {
        let mut config = Config::default();
        // Most tests want scheduling out of the way and no startup hold.
        config.schedule.days_between_backups = 0.0;
        config.schedule.startup_delay_minutes = 0;
        config
    }

    fn fixture(config: Config) -> Fixture {
        fixture_with(config, Arc::new(NullObserver))
    }

    fn fixture_with(config: Config, observer: Arc<dyn StatusObserver>) -> Fixture {
        let clock = Arc::new(FakeClock::new(start_time(), config.timezone()));
        let source = Arc::new(MemoryBackend::new("local", clock.clone()));
        let dest = Arc::new(MemoryBackend::new("remote", clock.clone()));
        let model = Model::new(
            config,
            clock.clone(),
            source.clone(),
            dest.clone(),
            observer,
            MetadataCache::in_memory(),
        );
        Fixture {
            clock,
            source,
            dest,
            model,
        }
    }

    fn days_ago(n: i64) -> DateTime<Utc> {
        start_time() - Duration::days(n)
    }

    async fn sync(fx: &mut Fixture) -> Result<()> {
        let now = fx.clock.now();
        fx.model.sync(now, &CancellationToken::new()).await
    }

    #[tokio::test]
    async fn test_reconcile_merges_and_drops() {
        let mut fx = fixture(config());
        fx.source.insert(record("local", "aaa", days_ago(2)), Bytes::from("a"));
        fx.dest.insert(record("remote", "aaa", days_ago(2)), Bytes::from("a"));
        fx.dest.insert(record("remote", "bbb", days_ago(1)), Bytes::from("b"));

        sync(&mut fx).await.unwrap();
        assert_eq!(fx.model.backups().len(), 2);
        let merged = fx.model.backup("aaa").unwrap();
        assert!(merged.source("local").is_some());
        assert!(merged.source("remote").is_some());

        // An externally deleted backup disappears on the next pass.
        let gone = fx.dest.record("bbb").unwrap();
        fx.dest.delete(&gone).await.unwrap();
        sync(&mut fx).await.unwrap();
        assert!(fx.model.backup("bbb").is_none());
        assert_eq!(fx.model.backups().len(), 1);
    }

    #[tokio::test]
    async fn test_first_sync_creates_and_uploads() {
        let mut config = config();
        config.schedule.days_between_backups = 3.0;
        let mut fx = fixture(config);

        sync(&mut fx).await.unwrap();
        assert_eq!(fx.source.len(), 1);
        assert_eq!(fx.dest.len(), 1);
        let backup = fx.model.backups()[0];
        assert!(backup.source("local").is_some());
        assert!(backup.source("remote").is_some());
        // Archive bytes made it over intact.
        let slug = backup.slug();
        assert_eq!(fx.source.archive(slug), fx.dest.archive(slug));
    }

    #[tokio::test]
    async fn test_interval_scheduling_without_time_of_day() {
        let mut config = config();
        config.schedule.days_between_backups = 3.0;
        let mut fx = fixture(config);
        fx.source.insert(record("local", "aaa", days_ago(1)), Bytes::from("a"));

        sync(&mut fx).await.unwrap();
        assert_eq!(
            fx.model.next_backup(fx.clock.now()),
            Some(days_ago(1) + Duration::days(3))
        );
        // Nothing new was created; the schedule isn't due yet.
        assert_eq!(fx.source.len(), 1);
    }

    #[tokio::test]
    async fn test_time_of_day_scheduling() {
        let mut config = config();
        config.schedule.days_between_backups = 1.0;
        config.schedule.time_of_day = Some("08:30".to_string());
        let mut fx = fixture(config);

        // Last backup before that day's slot: the slot that day stands.
        fx.clock.set_now(Utc.with_ymd_and_hms(2025, 6, 1, 7, 0, 0).unwrap());
        let early = Utc.with_ymd_and_hms(2025, 6, 1, 6, 0, 0).unwrap();
        fx.source.insert(record("local", "aaa", early), Bytes::from("a"));
        sync(&mut fx).await.unwrap();
        assert_eq!(
            fx.model.next_backup(fx.clock.now()),
            Some(Utc.with_ymd_and_hms(2025, 6, 1, 8, 30, 0).unwrap())
        );
        // Not due yet, so nothing was created.
        assert_eq!(fx.source.len(), 1);
    }

    #[tokio::test]
    async fn test_time_of_day_after_slot_moves_to_next_interval() {
        let mut config = config();
        config.schedule.days_between_backups = 1.0;
        config.schedule.time_of_day = Some("08:30".to_string());
        let mut fx = fixture(config);

        // Last backup after its day's slot: move a full interval forward.
        fx.clock.set_now(Utc.with_ymd_and_hms(2025, 6, 1, 7, 0, 0).unwrap());
        let late = Utc.with_ymd_and_hms(2025, 5, 31, 10, 0, 0).unwrap();
        fx.source.insert(record("local", "aaa", late), Bytes::from("a"));
        sync(&mut fx).await.unwrap();
        assert_eq!(
            fx.model.next_backup(fx.clock.now()),
            Some(Utc.with_ymd_and_hms(2025, 6, 1, 8, 30, 0).unwrap())
        );
        assert_eq!(fx.source.len(), 1);
    }

    #[tokio::test]
    async fn test_dst_spring_forward_keeps_one_backup_per_local_day() {
        let mut config = config();
        config.schedule.days_between_backups = 1.0;
        config.schedule.time_of_day = Some("02:30".to_string());
        config.schedule.timezone = "Europe/Berlin".to_string();
        let mut fx = fixture(config);

        // 2025-03-29 02:30 Berlin (CET, UTC+1).
        let last = Utc.with_ymd_and_hms(2025, 3, 29, 1, 30, 0).unwrap();
        fx.clock.set_now(last + Duration::hours(1));
        fx.source.insert(record("local", "aaa", last), Bytes::from("a"));
        sync(&mut fx).await.unwrap();

        // 02:30 doesn't exist on 2025-03-30 (clocks jump 02:00 -> 03:00);
        // the slot resolves to 03:00 local = 01:00 UTC, still the next day.
        let next = fx.model.next_backup(fx.clock.now()).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 3, 30, 1, 0, 0).unwrap());

        // The cycle after lands back on 02:30 local (now CEST, UTC+2).
        let r = fx.source.record("aaa").unwrap();
        fx.source.delete(&r).await.unwrap();
        fx.source.insert(record("local", "bbb", next), Bytes::from("b"));
        fx.clock.set_now(next + Duration::hours(1));
        sync(&mut fx).await.unwrap();
        let after = fx.model.next_backup(fx.clock.now()).unwrap();
        assert_eq!(after, Utc.with_ymd_and_hms(2025, 3, 31, 0, 30, 0).unwrap());
    }

    #[tokio::test]
    async fn test_startup_cooldown_defers_first_backup() {
        let mut config = config();
        config.schedule.days_between_backups = 3.0;
        config.schedule.startup_delay_minutes = 10;
        let observer = Arc::new(RecordingObserver::default());
        let mut fx = fixture_with(config, observer.clone());

        // No prior backup: due immediately, but deferred to the cooldown end.
        sync(&mut fx).await.unwrap();
        assert!(fx.source.is_empty());
        assert_eq!(
            fx.model.next_backup(fx.clock.now()),
            Some(start_time() + Duration::minutes(10))
        );
        assert!(observer.events().contains(&"waiting_for_startup".to_string()));

        // Once the cooldown passes the backup is made.
        fx.clock.advance(std::time::Duration::from_secs(11 * 60));
        sync(&mut fx).await.unwrap();
        assert_eq!(fx.source.len(), 1);
    }

    #[tokio::test]
    async fn test_upload_stops_at_instant_deletion() {
        let mut fx = fixture(config());
        fx.dest.set_max_count(1);
        for (slug, age) in [("aaa", 3), ("bbb", 2), ("ccc", 1)] {
            fx.source.insert(record("local", slug, days_ago(age)), Bytes::from(slug));
        }

        sync(&mut fx).await.unwrap();
        // Only the newest went up; uploading the others would have them
        // deleted immediately by the destination's retention.
        assert_eq!(fx.dest.len(), 1);
        assert!(fx.dest.record("ccc").is_some());
        assert_eq!(fx.source.len(), 3);
    }

    #[tokio::test]
    async fn test_multiple_deletes_need_confirmation() {
        let mut fx = fixture(config());
        fx.source.set_max_count(1);
        fx.dest.set_upload_enabled(false);
        for (slug, age) in [("aaa", 3), ("bbb", 2), ("ccc", 1)] {
            fx.source.insert(record("local", slug, days_ago(age)), Bytes::from(slug));
        }

        let result = sync(&mut fx).await;
        match result {
            Err(EngineError::DeleteMultiplePending { counts }) => {
                assert_eq!(counts.get("local"), Some(&2));
                assert_eq!(counts.get("remote"), Some(&0));
            }
            other => panic!("expected DeleteMultiplePending, got {other:?}"),
        }
        assert_eq!(fx.source.len(), 3);

        // Approval is one-shot and lets the purge run.
        fx.model.approve_multiple_deletes();
        sync(&mut fx).await.unwrap();
        assert_eq!(fx.source.len(), 1);
        assert!(fx.source.record("ccc").is_some());
    }

    #[tokio::test]
    async fn test_retained_backups_survive_purge() {
        let mut fx = fixture(config());
        fx.source.set_max_count(1);
        fx.dest.set_upload_enabled(false);
        let mut keeper = record("local", "aaa", days_ago(3));
        keeper.retained = true;
        fx.source.insert(keeper, Bytes::from("a"));
        fx.source.insert(record("local", "bbb", days_ago(1)), Bytes::from("b"));

        sync(&mut fx).await.unwrap();
        // The retained copy doesn't count against (or get consumed by)
        // the ceiling.
        assert_eq!(fx.source.len(), 2);
    }

    #[tokio::test]
    async fn test_delete_after_upload() {
        let mut config = config();
        config.retention.delete_after_upload = true;
        config.retention.confirm_multiple_deletes = false;
        let mut fx = fixture(config);
        fx.source.insert(record("local", "aaa", days_ago(2)), Bytes::from("a"));
        fx.source.insert(record("local", "bbb", days_ago(1)), Bytes::from("b"));

        sync(&mut fx).await.unwrap();
        assert!(fx.source.is_empty());
        assert_eq!(fx.dest.len(), 2);
        // The logical backups live on via their destination copies.
        assert_eq!(fx.model.backups().len(), 2);
        for backup in fx.model.backups() {
            assert!(backup.source("local").is_none());
            assert!(backup.source("remote").is_some());
        }
    }

    #[tokio::test]
    async fn test_purge_flags_mark_next_victim() {
        let mut fx = fixture(config());
        fx.dest.set_max_count(2);
        for (slug, age) in [("aaa", 3), ("bbb", 2)] {
            fx.source.insert(record("local", slug, days_ago(age)), Bytes::from(slug));
            fx.dest.insert(record("remote", slug, days_ago(age)), Bytes::from(slug));
        }

        sync(&mut fx).await.unwrap();
        assert_eq!(fx.model.backup("aaa").unwrap().purges().get("remote"), Some(&true));
        assert_eq!(fx.model.backup("bbb").unwrap().purges().get("remote"), Some(&false));
    }

    #[tokio::test]
    async fn test_retain_intent_applied_when_upload_lands() {
        let mut fx = fixture(config());
        let mut options = CreateOptions::new(fx.clock.now(), "Backup {date}");
        options.retain.insert("remote".to_string(), true);
        fx.model.create_backup(options).await.unwrap();
        assert_eq!(fx.source.len(), 1);

        sync(&mut fx).await.unwrap();
        let backup = fx.model.backups()[0];
        let remote = backup.source("remote").unwrap();
        assert!(remote.retained);
        assert!(fx.dest.record(&remote.slug).unwrap().retained);
    }

    #[tokio::test]
    async fn test_precondition_failure_stops_sync() {
        let mut fx = fixture(config());
        fx.source.insert(record("local", "aaa", days_ago(1)), Bytes::from("a"));
        fx.dest.set_precondition_failure(Some("ambiguous backup folder"));

        let result = sync(&mut fx).await;
        assert!(matches!(result, Err(EngineError::PreconditionFailed(_))));
        assert!(fx.dest.is_empty());
    }

    #[tokio::test]
    async fn test_restore_copies_destination_to_source() {
        let mut fx = fixture(config());
        fx.dest.insert(record("remote", "aaa", days_ago(1)), Bytes::from("archive"));
        sync(&mut fx).await.unwrap();

        fx.model.restore_backup("aaa").await.unwrap();
        assert_eq!(fx.source.archive("aaa"), Some(Bytes::from("archive")));
        assert!(fx.model.backup("aaa").unwrap().source("local").is_some());
    }

    #[tokio::test]
    async fn test_cancellation_aborts_before_changes() {
        let mut fx = fixture(config());
        fx.source.insert(record("local", "aaa", days_ago(1)), Bytes::from("a"));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = fx.model.sync(fx.clock.now(), &cancel).await;
        assert!(matches!(result, Err(EngineError::Cancelled)));
        assert!(fx.dest.is_empty());
    }
}
