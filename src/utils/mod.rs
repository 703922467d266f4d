//! Small shared utilities: error taxonomy, retry backoff, rate limiting,
//! logging setup.

pub mod backoff;
pub mod errors;
pub mod logging;
pub mod token_bucket;

pub use backoff::Backoff;
pub use token_bucket::TokenBucket;
