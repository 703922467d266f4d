//! Configuration management for the sync engine.
//!
//! Loads configuration from a TOML file; every field has a serde default so a
//! partial file (or none at all) yields a working engine. The CLI/config-file
//! surface that produces the file is owned by the embedding application.

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Days between scheduled backups. Zero or negative disables scheduling.
    #[serde(default = "default_days_between")]
    pub days_between_backups: f64,

    /// Optional local time of day for scheduled backups, as "HH:MM".
    #[serde(default)]
    pub time_of_day: Option<String>,

    /// How long after startup (or credential save) to hold off on scheduled
    /// backups, giving the user time to see what's going on.
    #[serde(default = "default_startup_delay_minutes")]
    pub startup_delay_minutes: u64,

    /// Upper bound between syncs even when nothing is due.
    #[serde(default = "default_max_sync_interval_seconds")]
    pub max_sync_interval_seconds: u64,

    /// Name template for scheduled backups.
    #[serde(default = "default_name_template")]
    pub backup_name: String,

    /// IANA timezone name for local calendar math.
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Generational (GFS) retention; `None` means plain oldest-first.
    #[serde(default)]
    pub generational: Option<GenConfig>,

    /// Require explicit confirmation before deleting more than one backup in
    /// a single purge pass.
    #[serde(default = "default_true")]
    pub confirm_multiple_deletes: bool,

    /// Delete source copies as soon as they are replicated to every
    /// destination.
    #[serde(default)]
    pub delete_after_upload: bool,

    /// Purge before creating/uploading instead of only after.
    #[serde(default)]
    pub delete_before_new: bool,
}

/// Generational retention slots, counted backward from the newest backup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenConfig {
    #[serde(default)]
    pub days: u32,
    #[serde(default)]
    pub weeks: u32,
    #[serde(default)]
    pub months: u32,
    #[serde(default)]
    pub years: u32,

    /// Preferred weekday for weekly slots ("mon".."sun").
    #[serde(default = "default_day_of_week")]
    pub day_of_week: String,

    /// Preferred day of the month for monthly slots (1-based).
    #[serde(default = "default_day_of_one")]
    pub day_of_month: u32,

    /// Preferred day of the year for yearly slots (1-based).
    #[serde(default = "default_day_of_one")]
    pub day_of_year: u32,

    /// Delete backups outside every slot immediately instead of waiting for
    /// the count ceiling.
    #[serde(default)]
    pub aggressive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Upper bound for a single upload chunk, rounded down to a multiple of
    /// the 256 KiB base unit.
    #[serde(default = "default_max_chunk_bytes")]
    pub max_chunk_bytes: u64,

    /// Optional upload rate limit in bytes per second.
    #[serde(default)]
    pub upload_limit_bytes_per_second: Option<f64>,

    /// Connect/read timeout for backend requests, seconds.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    /// Give up resuming an upload session after this many failed attempts.
    #[serde(default = "default_session_attempts")]
    pub max_session_attempts: u32,

    /// Upload sessions older than this are started over.
    #[serde(default = "default_session_expiration_days")]
    pub session_expiration_days: u64,
}

fn default_days_between() -> f64 {
    3.0
}

fn default_startup_delay_minutes() -> u64 {
    10
}

fn default_max_sync_interval_seconds() -> u64 {
    60 * 60
}

fn default_name_template() -> String {
    "Full Backup {year}-{month}-{day} {hour}:{minute}".to_string()
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_true() -> bool {
    true
}

fn default_day_of_week() -> String {
    "mon".to_string()
}

fn default_day_of_one() -> u32 {
    1
}

fn default_max_chunk_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_timeout_seconds() -> u64 {
    30
}

fn default_session_attempts() -> u32 {
    100
}

fn default_session_expiration_days() -> u64 {
    6
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            days_between_backups: default_days_between(),
            time_of_day: None,
            startup_delay_minutes: default_startup_delay_minutes(),
            max_sync_interval_seconds: default_max_sync_interval_seconds(),
            backup_name: default_name_template(),
            timezone: default_timezone(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            generational: None,
            confirm_multiple_deletes: true,
            delete_after_upload: false,
            delete_before_new: false,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_chunk_bytes: default_max_chunk_bytes(),
            upload_limit_bytes_per_second: None,
            timeout_seconds: default_timeout_seconds(),
            max_session_attempts: default_session_attempts(),
            session_expiration_days: default_session_expiration_days(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Parsed `time_of_day`, or `None` when unset or malformed.
    pub fn time_of_day(&self) -> Option<(u32, u32)> {
        let raw = self.schedule.time_of_day.as_deref()?;
        let (hour, minute) = raw.split_once(':')?;
        let hour: u32 = hour.parse().ok()?;
        let minute: u32 = minute.parse().ok()?;
        if hour > 23 || minute > 59 {
            return None;
        }
        Some((hour, minute))
    }

    pub fn timezone(&self) -> chrono_tz::Tz {
        self.schedule.timezone.parse().unwrap_or(chrono_tz::Tz::UTC)
    }
}
