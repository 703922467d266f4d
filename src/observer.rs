//! Status publication seam.
//!
//! The engine reports lifecycle events through an injected observer instead
//! of a global status registry, so embedders can wire them to a dashboard,
//! notifications, or nothing at all.

use crate::EngineError;
use std::collections::HashMap;

/// Callbacks for engine lifecycle events. All default to no-ops so observers
/// implement only what they care about.
pub trait StatusObserver: Send + Sync {
    fn sync_started(&self) {}

    fn sync_succeeded(&self) {}

    fn sync_failed(&self, _error: &EngineError) {}

    /// The engine is deferring its first sync until the startup cooldown
    /// passes.
    fn waiting_for_startup(&self) {}

    /// Deleting more than one backup at once needs user confirmation; the
    /// counts are pending deletions per backend.
    fn deletes_pending_confirmation(&self, _counts: &HashMap<String, usize>) {}
}

/// Discards every event.
pub struct NullObserver;

impl StatusObserver for NullObserver {}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records events for assertions.
    #[derive(Default)]
    pub struct RecordingObserver {
        pub events: Mutex<Vec<String>>,
    }

    impl RecordingObserver {
        pub fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn push(&self, event: impl Into<String>) {
            self.events.lock().unwrap().push(event.into());
        }
    }

    impl StatusObserver for RecordingObserver {
        fn sync_started(&self) {
            self.push("sync_started");
        }

        fn sync_succeeded(&self) {
            self.push("sync_succeeded");
        }

        fn sync_failed(&self, error: &EngineError) {
            self.push(format!("sync_failed: {error}"));
        }

        fn waiting_for_startup(&self) {
            self.push("waiting_for_startup");
        }

        fn deletes_pending_confirmation(&self, counts: &HashMap<String, usize>) {
            self.push(format!("deletes_pending: {}", counts.len()));
        }
    }
}
