//! # Context Module
//!
//! The context module carries ambient request data (the caller's identity, a locale,
//! a tenant, a correlation id...) alongside a dispatch without threading a parameter
//! through every handler signature.
//!
//! ## Overview
//!
//! - [`Context`] - a mutable attribute bag keyed by name
//! - [`ContextStorage`] - where the "current" context of a thread of control lives
//! - [`ContextPropagator`] - the service handlers and brokers use to read, set,
//!   reset and carry the current context across threads
//! - [`ContextScope`] - RAII guard that clears the slot on every exit path
//!
//! ## Propagation Discipline
//!
//! Any component that runs work on another thread on behalf of a request must:
//!
//! 1. capture the current context on the origin thread ([`ContextPropagator::snapshot`])
//! 2. install that independent copy on the destination thread before running handler
//!    code ([`ContextPropagator::enter`], or [`ContextPropagator::enter_isolated`] on a
//!    pooled worker)
//! 3. clear the destination slot when the handler returns or panics (dropping the
//!    [`ContextScope`])
//!
//! [`ContextPropagator::propagate`] bundles the three steps around a closure.
//!
//! The default storage keeps one slot per `may` coroutine, so a handler that parks
//! and resumes on another worker thread still sees its own context.
//!
//! ## Usage
//!
//! ```rust
//! use msgbroker::context::{Context, ContextPropagator};
//!
//! let propagator = ContextPropagator::local();
//! let ctx = Context::new();
//! ctx.set_serializable("tenant", Some("acme".to_string()));
//!
//! let _scope = propagator.enter(Some(ctx));
//! let tenant = propagator
//!     .current()
//!     .ok()
//!     .and_then(|c| c.get_as::<String>("tenant"));
//! assert_eq!(tenant.as_deref().map(String::as_str), Some("acme"));
//! ```

mod core;
mod propagation;
mod storage;

pub use self::core::*;
pub use propagation::*;
pub use storage::*;
