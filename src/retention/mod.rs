//! Retention policies.
//!
//! A retention scheme is a pure function over a backup collection: given the
//! backups eligible for deletion at one backend, it proposes at most one
//! deletion candidate (with a human-readable reason). Callers loop, deleting
//! and re-asking, until `None` comes back.
//!
//! Three schemes:
//! - [`OldestScheme`]: keep the newest `keep` backups, delete the oldest.
//! - [`GenerationalScheme`]: GFS-style day/week/month/year slots.
//! - [`DeleteAfterUploadScheme`]: delete source copies already replicated to
//!   every destination.

use crate::config::GenConfig;
use crate::model::backup::Backup;
use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use std::collections::BTreeSet;

/// A proposed deletion: which backup, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurgeCandidate {
    pub slug: String,
    pub reason: String,
}

pub trait RetentionScheme: Send + Sync {
    /// Propose the next backup to delete, or `None` if the collection
    /// satisfies the policy.
    fn next_purge(&self, backups: &[&Backup]) -> Option<PurgeCandidate>;
}

/// Orders backups by date, slug-tie-broken so proposals are deterministic.
fn sort_key(backup: &Backup) -> (DateTime<Utc>, String) {
    (
        backup.date().unwrap_or(DateTime::<Utc>::MIN_UTC),
        backup.slug().to_string(),
    )
}

fn oldest<'a>(backups: &[&'a Backup]) -> Option<&'a Backup> {
    backups.iter().min_by_key(|b| sort_key(b)).copied()
}

/// Deletes the single oldest backup once the collection exceeds `keep`.
pub struct OldestScheme {
    keep: usize,
}

impl OldestScheme {
    pub fn new(keep: usize) -> Self {
        Self { keep }
    }
}

impl RetentionScheme for OldestScheme {
    fn next_purge(&self, backups: &[&Backup]) -> Option<PurgeCandidate> {
        if backups.len() <= self.keep {
            return None;
        }
        oldest(backups).map(|backup| PurgeCandidate {
            slug: backup.slug().to_string(),
            reason: "oldest".to_string(),
        })
    }
}

/// Deletes source copies that have been fully replicated.
///
/// Filters to backups present at `source` and at every entry of
/// `destinations`, then always proposes the oldest of those. The source's own
/// max count is irrelevant here; being replicated is the deletion trigger.
pub struct DeleteAfterUploadScheme {
    source: String,
    destinations: Vec<String>,
}

impl DeleteAfterUploadScheme {
    pub fn new(source: impl Into<String>, destinations: Vec<String>) -> Self {
        Self {
            source: source.into(),
            destinations,
        }
    }
}

impl RetentionScheme for DeleteAfterUploadScheme {
    fn next_purge(&self, backups: &[&Backup]) -> Option<PurgeCandidate> {
        let replicated: Vec<&Backup> = backups
            .iter()
            .filter(|b| {
                b.source(&self.source).is_some()
                    && self.destinations.iter().all(|d| b.source(d).is_some())
            })
            .copied()
            .collect();
        oldest(&replicated).map(|backup| PurgeCandidate {
            slug: backup.slug().to_string(),
            reason: "uploaded".to_string(),
        })
    }
}

/// One generational slot: a `[start, end)` local-time window with a preferred
/// calendar day inside it.
struct Partition {
    start: DateTime<Tz>,
    end: DateTime<Tz>,
    prefer: DateTime<Tz>,
    tag: &'static str,

    /// Delete-only partitions exist solely to compute a deletion reason;
    /// they never protect a backup from deletion.
    delete_only: bool,
}

impl Partition {
    /// Window width, used to pick the most specific deletion reason.
    fn delta(&self) -> Duration {
        self.end - self.start
    }

    fn contains(&self, date: DateTime<Utc>) -> bool {
        let local = date.with_timezone(&self.start.timezone());
        local >= self.start && local < self.end
    }

    /// Among backups in the window, prefer those on the preferred local
    /// calendar day (latest of them); otherwise the earliest in range.
    fn select<'a>(&self, backups: &[&'a Backup], tz: Tz) -> Option<&'a Backup> {
        let in_range: Vec<&Backup> = backups
            .iter()
            .filter(|b| b.date().map(|d| self.contains(d)).unwrap_or(false))
            .copied()
            .collect();

        let prefer_day = self.prefer.date_naive();
        let on_preferred_day: Vec<&Backup> = in_range
            .iter()
            .filter(|b| {
                b.date()
                    .map(|d| d.with_timezone(&tz).date_naive() == prefer_day)
                    .unwrap_or(false)
            })
            .copied()
            .collect();

        if !on_preferred_day.is_empty() {
            return on_preferred_day.iter().max_by_key(|b| sort_key(b)).copied();
        }
        oldest(&in_range)
    }
}

/// Start of a local calendar day, tolerating DST gaps at midnight.
fn local_day_start(tz: Tz, date: NaiveDate) -> DateTime<Tz> {
    let midnight = date.and_hms_opt(0, 0, 0).unwrap();
    match tz.from_local_datetime(&midnight) {
        LocalResult::Single(dt) => dt,
        LocalResult::Ambiguous(earliest, _) => earliest,
        LocalResult::None => tz
            .from_local_datetime(&(midnight + Duration::hours(1)))
            .earliest()
            .unwrap_or_else(|| tz.from_utc_datetime(&midnight)),
    }
}

fn days_in_month(year: i32, month: u32) -> i64 {
    let first = NaiveDate::from_ymd_opt(year, month, 1).unwrap();
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1).unwrap()
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1).unwrap()
    };
    (next - first).num_days()
}

/// GFS-style retention: one backup per configured day/week/month/year slot,
/// counted backward from the local calendar date of the newest backup.
pub struct GenerationalScheme {
    config: GenConfig,
    keep: usize,
    tz: Tz,
}

impl GenerationalScheme {
    pub fn new(tz: Tz, config: GenConfig, keep: usize) -> Self {
        Self { config, keep, tz }
    }

    fn build_partitions(&self, anchor: NaiveDate) -> Vec<Partition> {
        let tz = self.tz;
        let mut partitions = Vec::new();

        // One partition per configured slot plus, for every category in use,
        // a trailing delete-only partition used only to explain deletions.
        if self.config.days > 0 {
            for x in 0..=self.config.days {
                let date = anchor - Duration::days(x as i64);
                let start = local_day_start(tz, date);
                let end = local_day_start(tz, date + Duration::days(1));
                partitions.push(Partition {
                    start,
                    end,
                    prefer: start,
                    tag: "daily",
                    delete_only: x == self.config.days,
                });
            }
        }

        if self.config.weeks > 0 {
            let day_of_week = match self.config.day_of_week.as_str() {
                "mon" => 0,
                "tue" => 1,
                "wed" => 2,
                "thu" => 3,
                "fri" => 4,
                "sat" => 5,
                "sun" => 6,
                _ => 0,
            };
            let monday = anchor - Duration::days(anchor.weekday().num_days_from_monday() as i64);
            for x in 0..=self.config.weeks {
                let week_start = monday - Duration::weeks(x as i64);
                let end = local_day_start(tz, week_start + Duration::days(7));
                let start = local_day_start(tz, week_start + Duration::days(day_of_week));
                partitions.push(Partition {
                    start,
                    end,
                    prefer: start,
                    tag: "weekly",
                    delete_only: x == self.config.weeks,
                });
            }
        }

        if self.config.months > 0 {
            for x in 0..=self.config.months {
                let mut year_offset = (x / 12) as i32;
                let mut month_offset = (x % 12) as i32;
                if (anchor.month() as i32) - month_offset < 1 {
                    year_offset += 1;
                    month_offset -= 12;
                }
                let year = anchor.year() - year_offset;
                let month = (anchor.month() as i32 - month_offset) as u32;
                let first = NaiveDate::from_ymd_opt(year, month, 1).unwrap();
                let start = local_day_start(tz, first);
                let end = local_day_start(tz, first + Duration::days(days_in_month(year, month)));
                let prefer =
                    local_day_start(tz, first + Duration::days(self.config.day_of_month as i64 - 1));
                partitions.push(Partition {
                    start,
                    end,
                    prefer,
                    tag: "monthly",
                    delete_only: x == self.config.months,
                });
            }
        }

        if self.config.years > 0 {
            for x in 0..=self.config.years {
                let year = anchor.year() - x as i32;
                let first = NaiveDate::from_ymd_opt(year, 1, 1).unwrap();
                let start = local_day_start(tz, first);
                let end = local_day_start(tz, NaiveDate::from_ymd_opt(year + 1, 1, 1).unwrap());
                let prefer =
                    local_day_start(tz, first + Duration::days(self.config.day_of_year as i64 - 1));
                partitions.push(Partition {
                    start,
                    end,
                    prefer,
                    tag: "yearly",
                    delete_only: x == self.config.years,
                });
            }
        }

        partitions
    }

    /// The most specific (smallest-window) partition containing the backup's
    /// date names the deletion reason; delete-only partitions count here.
    fn reason_for(&self, partitions: &[Partition], backup: &Backup) -> String {
        let date = match backup.date() {
            Some(date) => date,
            None => return "default".to_string(),
        };
        partitions
            .iter()
            .filter(|p| p.contains(date))
            .min_by_key(|p| p.delta())
            .map(|p| p.tag.to_string())
            .unwrap_or_else(|| "default".to_string())
    }
}

impl RetentionScheme for GenerationalScheme {
    fn next_purge(&self, backups: &[&Backup]) -> Option<PurgeCandidate> {
        if backups.is_empty() {
            return None;
        }

        let mut sorted: Vec<&Backup> = backups.to_vec();
        sorted.sort_by_key(|b| sort_key(b));

        let newest = sorted.last().and_then(|b| b.date())?;
        let anchor = newest.with_timezone(&self.tz).date_naive();
        let partitions = self.build_partitions(anchor);

        let mut keepers: BTreeSet<&str> = BTreeSet::new();
        for partition in partitions.iter().filter(|p| !p.delete_only) {
            if let Some(keeper) = partition.select(&sorted, self.tz) {
                keepers.insert(keeper.slug());
            }
        }

        // Ascending date order makes the aggressive early-delete path pick
        // the oldest extra, same as the non-aggressive path.
        let extras: Vec<&Backup> = sorted
            .iter()
            .filter(|b| !keepers.contains(b.slug()))
            .copied()
            .collect();

        let candidate = |backup: &Backup| PurgeCandidate {
            slug: backup.slug().to_string(),
            reason: self.reason_for(&partitions, backup),
        };

        if self.config.aggressive && !extras.is_empty() {
            return Some(candidate(extras[0]));
        }
        if sorted.len() <= self.keep && !self.config.aggressive {
            return None;
        }
        if !extras.is_empty() {
            return Some(candidate(extras[0]));
        }
        if sorted.len() > self.keep {
            // Every backup is a keeper but the ceiling is still violated, so
            // the oldest keeper has to go.
            return oldest(&sorted).map(candidate);
        }
        None
    }
}
