//! # Broker Configuration Module
//!
//! Environment-driven configuration for the asynchronous broker.
//!
//! ## Environment Variables
//!
//! ### `MSGBROKER_WORKERS`
//!
//! Number of worker coroutines in the bridging pool. Default: `4`.
//!
//! ### `MSGBROKER_STACK_SIZE`
//!
//! Stack size of each worker coroutine. Accepts decimal (`65536`) or
//! hexadecimal (`0x10000`). Default: `0x10000` (64 KB).
//!
//! Handlers run on these stacks, so deep call chains need more room:
//! - Simple handlers: `0x4000` (16 KB)
//! - Typical handlers: `0x10000` (64 KB)
//! - Deep recursion: `0x40000` (256 KB)
//!
//! ### `MSGBROKER_POOL_NAME`
//!
//! Name of the worker pool, used in coroutine names, logs and errors.
//! Default: `msgbroker`.
//!
//! ### `MSGBROKER_HANDLER_OVERLAP`
//!
//! What to do when several handlers support the same message kind:
//! `first` (use the first registered) or `reject` (fail the dispatch).
//! Default: `first`.
//!
//! ## Usage
//!
//! ```rust
//! use msgbroker::config::BrokerConfig;
//!
//! let config = BrokerConfig::from_env();
//! println!("Workers: {}", config.pool.num_workers);
//! ```

use std::env;
use tracing::warn;

use crate::resolver::HandlerOverlap;
use crate::worker_pool::WorkerPoolConfig;

/// Broker configuration loaded from environment variables.
#[derive(Debug, Clone, Default)]
pub struct BrokerConfig {
    /// Worker pool used to bridge blocking handlers
    pub pool: WorkerPoolConfig,
    /// Tie-break for overlapping handler registrations
    pub overlap: HandlerOverlap,
}

impl BrokerConfig {
    /// Load configuration from environment variables.
    ///
    /// Unparseable values fall back to the defaults with a warning.
    #[must_use]
    pub fn from_env() -> Self {
        let overlap = match env::var("MSGBROKER_HANDLER_OVERLAP") {
            Ok(val) => val.parse::<HandlerOverlap>().unwrap_or_else(|e: String| {
                warn!(value = %val, error = %e, "Invalid MSGBROKER_HANDLER_OVERLAP, using default");
                HandlerOverlap::default()
            }),
            Err(_) => HandlerOverlap::default(),
        };

        Self {
            pool: WorkerPoolConfig::from_env(),
            overlap,
        }
    }

    pub fn new(pool: WorkerPoolConfig, overlap: HandlerOverlap) -> Self {
        Self { pool, overlap }
    }
}
