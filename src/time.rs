//! Clock abstraction.
//!
//! Everything time-sensitive in the engine (scheduling, retention windows,
//! rate limiting, backoff sleeps) goes through [`Clock`] so tests can drive
//! time deterministically. The timezone lives here too: retention partitions
//! and time-of-day scheduling are local-calendar computations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::time::{Duration, Instant};

#[async_trait]
pub trait Clock: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// Monotonic elapsed time since an arbitrary fixed origin.
    fn monotonic(&self) -> Duration;

    /// Suspend the calling task for `duration`.
    async fn sleep(&self, duration: Duration);

    /// The local timezone used for calendar math.
    fn timezone(&self) -> Tz;
}

pub struct SystemClock {
    tz: Tz,
    origin: Instant,
}

impl SystemClock {
    pub fn new(tz: Tz) -> Self {
        Self {
            tz,
            origin: Instant::now(),
        }
    }
}

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic(&self) -> Duration {
        self.origin.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn timezone(&self) -> Tz {
        self.tz
    }
}
