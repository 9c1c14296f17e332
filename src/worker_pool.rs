//! # Worker Pool Module
//!
//! Provides the executors the asynchronous broker hands bridged handler calls to.
//!
//! ## Features
//!
//! - **Worker Pools**: Spawn N worker coroutines that share one job queue
//! - **Unbounded Queue**: Uses may's unbounded MPSC channel; submission never blocks
//! - **Panic Recovery**: A panicking job is logged and counted, the worker keeps running
//! - **Metrics**: Track queue depth, dispatch count, completion count and panics
//!
//! ## Configuration
//!
//! - `MSGBROKER_WORKERS`: Number of worker coroutines (default: 4)
//! - `MSGBROKER_STACK_SIZE`: Stack size per worker coroutine, decimal or `0x` hex (default: 0x10000)
//! - `MSGBROKER_POOL_NAME`: Name used in logs and errors (default: `msgbroker`)

use may::sync::mpsc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::error::{BrokerError, Result};

/// A zero-argument unit of work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Something that runs jobs, eventually, on some thread of control.
///
/// No ordering or priority is promised beyond eventual execution.
pub trait Executor: Send + Sync {
    /// Submit a job.
    ///
    /// # Errors
    ///
    /// [`BrokerError::WorkerUnavailable`] when the executor can no longer accept work.
    fn execute(&self, job: Job) -> Result<()>;

    /// Whether jobs run on the submitting thread of control, sharing its
    /// context slot. Pooled executors leave this `false`.
    fn runs_on_caller(&self) -> bool {
        false
    }
}

/// Parse a stack size given in decimal or `0x` hex.
pub(crate) fn parse_stack_size(value: &str) -> Option<usize> {
    let value = value.trim();
    if let Some(hex) = value.strip_prefix("0x") {
        usize::from_str_radix(hex, 16).ok()
    } else {
        value.parse().ok()
    }
}

/// Configuration for a worker pool
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Pool name for logs and errors
    pub name: String,
    /// Number of worker coroutines
    pub num_workers: usize,
    /// Stack size for worker coroutines
    pub stack_size: usize,
}

impl WorkerPoolConfig {
    /// Load configuration from environment variables
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let name = std::env::var("MSGBROKER_POOL_NAME").unwrap_or(defaults.name);

        let num_workers = std::env::var("MSGBROKER_WORKERS")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|n| *n > 0)
            .unwrap_or(defaults.num_workers);

        let stack_size = std::env::var("MSGBROKER_STACK_SIZE")
            .ok()
            .and_then(|s| parse_stack_size(&s))
            .unwrap_or(defaults.stack_size);

        Self {
            name,
            num_workers,
            stack_size,
        }
    }

    /// Create a custom configuration
    pub fn new(name: impl Into<String>, num_workers: usize, stack_size: usize) -> Self {
        Self {
            name: name.into(),
            num_workers,
            stack_size,
        }
    }
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            name: "msgbroker".to_string(),
            num_workers: 4,
            stack_size: 0x10000, // 64KB
        }
    }
}

/// Metrics for a worker pool
#[derive(Debug, Default)]
pub struct WorkerPoolMetrics {
    /// Jobs submitted but not yet picked up by a worker (approximate)
    pub queue_depth: AtomicUsize,
    /// Total jobs submitted
    pub dispatched_count: AtomicU64,
    /// Total jobs finished, including ones that panicked
    pub completed_count: AtomicU64,
    /// Jobs that panicked
    pub panic_count: AtomicU64,
}

impl WorkerPoolMetrics {
    /// Create new metrics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a dispatch event
    pub fn record_dispatch(&self) {
        self.dispatched_count.fetch_add(1, Ordering::Relaxed);
        self.queue_depth.fetch_add(1, Ordering::Relaxed);
    }

    /// Undo a dispatch whose job never reached the queue
    pub fn record_rejected(&self) {
        self.dispatched_count.fetch_sub(1, Ordering::Relaxed);
        self.queue_depth.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record a worker taking a job off the queue
    pub fn record_dequeue(&self) {
        self.queue_depth.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record a completion event
    pub fn record_completion(&self) {
        self.completed_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a job panic
    pub fn record_panic(&self) {
        self.panic_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current queue depth
    #[must_use]
    pub fn get_queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::Relaxed)
    }

    /// Get total dispatched count
    #[must_use]
    pub fn get_dispatched_count(&self) -> u64 {
        self.dispatched_count.load(Ordering::Relaxed)
    }

    /// Get total completed count
    #[must_use]
    pub fn get_completed_count(&self) -> u64 {
        self.completed_count.load(Ordering::Relaxed)
    }

    /// Get total panic count
    #[must_use]
    pub fn get_panic_count(&self) -> u64 {
        self.panic_count.load(Ordering::Relaxed)
    }
}

/// A pool of worker coroutines sharing one unbounded job queue.
///
/// Dropping the pool closes the queue; workers finish the jobs already queued
/// and exit.
pub struct WorkerPool {
    /// Configuration for the pool
    config: WorkerPoolConfig,
    /// Sender for dispatching jobs to workers
    sender: mpsc::Sender<Job>,
    /// Metrics for monitoring
    metrics: Arc<WorkerPoolMetrics>,
}

impl WorkerPool {
    /// Create a new worker pool and spawn its workers.
    ///
    /// The May coroutine runtime is configured globally through `may::config()`;
    /// set its worker thread count before creating the first pool.
    ///
    /// # Errors
    ///
    /// [`BrokerError::WorkerUnavailable`] if not a single worker coroutine could be spawned.
    pub fn new(config: WorkerPoolConfig) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<Job>();
        let metrics = Arc::new(WorkerPoolMetrics::new());

        // Create a shared receiver wrapped in Arc for all workers to share
        let rx = Arc::new(rx);

        info!(
            pool = %config.name,
            num_workers = config.num_workers,
            stack_size = config.stack_size,
            "Creating worker pool"
        );

        let mut spawned = 0usize;
        for worker_id in 0..config.num_workers {
            let rx_clone = Arc::clone(&rx);
            let pool_name = config.name.clone();
            let metrics_clone = Arc::clone(&metrics);

            // SAFETY: may::coroutine::Builder::spawn() is marked unsafe by the may runtime.
            // Jobs are Send + 'static and own everything they touch; panics are caught
            // inside the worker loop so they never unwind across the coroutine boundary.
            let spawn_result = unsafe {
                may::coroutine::Builder::new()
                    .name(format!("{}-worker-{}", config.name, worker_id))
                    .stack_size(config.stack_size)
                    .spawn(move || {
                        debug!(pool = %pool_name, worker_id = worker_id, "Worker coroutine started");

                        // All workers share the same receiver, so they load balance
                        // across incoming jobs until the channel closes.
                        while let Ok(job) = rx_clone.recv() {
                            metrics_clone.record_dequeue();
                            if let Err(panic) =
                                std::panic::catch_unwind(std::panic::AssertUnwindSafe(job))
                            {
                                metrics_clone.record_panic();
                                error!(
                                    pool = %pool_name,
                                    worker_id = worker_id,
                                    panic_message = %panic_message(panic.as_ref()),
                                    "Job panicked - CRITICAL"
                                );
                            }
                            metrics_clone.record_completion();
                        }

                        debug!(pool = %pool_name, worker_id = worker_id, "Worker coroutine exiting");
                    })
            };

            match spawn_result {
                Ok(_) => spawned += 1,
                Err(e) => error!(
                    pool = %config.name,
                    worker_id = worker_id,
                    error = %e,
                    "Failed to spawn worker coroutine"
                ),
            }
        }

        if spawned == 0 {
            return Err(BrokerError::WorkerUnavailable(config.name));
        }

        Ok(Self {
            config,
            sender: tx,
            metrics,
        })
    }

    /// Create a pool configured from the environment.
    ///
    /// # Errors
    ///
    /// See [`WorkerPool::new`].
    pub fn from_env() -> Result<Self> {
        Self::new(WorkerPoolConfig::from_env())
    }

    /// Get metrics for this worker pool
    #[must_use]
    pub fn metrics(&self) -> &Arc<WorkerPoolMetrics> {
        &self.metrics
    }

    /// Get configuration for this worker pool
    #[must_use]
    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }
}

impl Executor for WorkerPool {
    fn execute(&self, job: Job) -> Result<()> {
        self.metrics.record_dispatch();

        if let Err(e) = self.sender.send(job) {
            // Channel disconnected - workers are gone
            self.metrics.record_rejected();
            error!(
                pool = %self.config.name,
                error = %e,
                "Worker pool channel disconnected"
            );
            return Err(BrokerError::WorkerUnavailable(self.config.name.clone()));
        }

        Ok(())
    }
}

/// Runs every job immediately on the submitting thread.
///
/// Useful for single-threaded runtimes and deterministic tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn execute(&self, job: Job) -> Result<()> {
        job();
        Ok(())
    }

    fn runs_on_caller(&self) -> bool {
        true
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
