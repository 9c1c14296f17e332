//! # msgbroker
//!
//! **msgbroker** is an in-process, coroutine-backed message broker: callers hand it typed
//! messages and it routes each one to exactly one registered handler, synchronously or
//! asynchronously, carrying an ambient request [`Context`] across thread boundaries.
//!
//! ## Overview
//!
//! - **[`message`]** - the [`Message`] trait, reply types, fallback replies and [`MessageKind`] tags
//! - **[`handler`]** - blocking and natively asynchronous handler traits, and the [`HandlerRegistry`]
//! - **[`resolver`]** - handler lookup with a concurrent per-kind cache
//! - **[`broker`]** - the synchronous [`MessageBroker`] and the bridging [`AsyncMessageBroker`]
//! - **[`reply`]** - [`AsyncReply`], a cold deferred result with single-value adapters
//! - **[`context`]** - attribute bags and the propagation service that moves them between threads
//! - **[`worker_pool`]** - the [`Executor`] seam and a `may` coroutine [`WorkerPool`]
//! - **[`config`]** / **[`logging`]** - environment-driven configuration and `tracing` setup
//!
//! ## Dispatch Flow
//!
//! ```text
//! caller ──send / send_async(message)──▶ broker
//!                                          │
//!                         resolver.resolve(kind)  (cache hit, or one registry scan)
//!                                          │
//!              ┌───────────────────────────┴───────────────────────────┐
//!     blocking handler                                       native async handler
//!   send: call on caller thread                          send: block, single-value rule
//!   send_async: job on worker pool,                      send_async: reply returned as is
//!   context snapshot installed and cleared
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use msgbroker::{AsyncMessageBroker, ContextPropagator, HandlerRegistry, InlineExecutor, Message};
//!
//! struct Greet(String);
//! impl Message for Greet {
//!     type Reply = String;
//! }
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register_fn("greet", |m: &Greet| Ok(format!("hello {}", m.0)));
//!
//! let broker = AsyncMessageBroker::new(
//!     Arc::new(registry),
//!     Arc::new(InlineExecutor),
//!     ContextPropagator::local(),
//! );
//!
//! assert_eq!(broker.send(Greet("ada".into())).unwrap(), "hello ada");
//!
//! let reply = broker.send_async(Greet("bob".into())).unwrap();
//! assert_eq!(reply.wait().unwrap(), "hello bob");
//! ```
//!
//! ## Runtime
//!
//! [`WorkerPool`] runs jobs on `may` coroutines. Configure the runtime once at startup,
//! before the first pool is created:
//!
//! ```rust,no_run
//! may::config().set_workers(4);
//! let config = msgbroker::BrokerConfig::from_env();
//! let pool = msgbroker::WorkerPool::new(config.pool).expect("worker pool");
//! ```

pub mod broker;
pub mod config;
pub mod context;
pub mod error;
pub mod handler;
pub mod ids;
pub mod logging;
pub mod message;
pub mod reply;
pub mod resolver;
pub mod worker_pool;

pub use broker::{AsyncMessageBroker, MessageBroker};
pub use config::BrokerConfig;
pub use context::{Context, ContextPropagator, ContextScope, ContextStorage};
pub use error::{BrokerError, Result};
pub use handler::{
    AsyncMessageHandler, HandlerEntry, HandlerRegistry, HandlerSource, MessageHandler,
};
pub use ids::DispatchId;
pub use message::{Command, Message, MessageKind, Query};
pub use reply::{AsyncReply, Emitter, ReplyState, Subscription};
pub use resolver::{HandlerOverlap, HandlerResolver};
pub use worker_pool::{Executor, InlineExecutor, Job, WorkerPool, WorkerPoolConfig};
