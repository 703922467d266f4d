//! Backup Synchronization Engine
//!
//! Keeps point-in-time backups consistent across two storage backends (a
//! local source and a remote destination):
//! - Unified backup collection merged from per-backend listings
//! - Scheduling of new backups (interval and time-of-day aware)
//! - Retention policies (oldest-first and generational/GFS)
//! - Resumable chunked transfers over HTTP with rate limiting
//! - Single-flight coordination with backoff-driven retry

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod model;
pub mod observer;
pub mod retention;
pub mod source;
pub mod time;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use coordinator::Coordinator;
pub use model::Model;
pub use utils::errors::EngineError;
pub type Result<T> = std::result::Result<T, EngineError>;
