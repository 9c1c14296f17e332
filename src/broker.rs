//! # Broker Module
//!
//! The dispatch engine. Both brokers resolve a handler through a shared
//! [`HandlerResolver`] and invoke it exactly once per call; neither retries nor
//! swallows errors.
//!
//! ## Synchronous Dispatch
//!
//! [`MessageBroker::send`] runs the handler on the calling thread. A natively
//! asynchronous handler is subscribed to and blocked on, using the message's
//! fallback reply when it does not emit exactly one value.
//!
//! ## Asynchronous Dispatch
//!
//! [`AsyncMessageBroker::send_async`] resolves eagerly (a missing handler fails
//! at call time) and returns a cold [`AsyncReply`]:
//!
//! - a natively asynchronous handler's reply is returned unchanged
//! - a blocking handler is bridged: on subscription the current context is
//!   snapshotted on the subscribing thread and a job is submitted to the
//!   [`Executor`]; the job installs the snapshot, calls the handler, leaves the
//!   worker's slot empty and emits exactly one value (or the failure)
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use msgbroker::broker::MessageBroker;
//! use msgbroker::handler::HandlerRegistry;
//! use msgbroker::message::Message;
//!
//! struct Add(u32, u32);
//! impl Message for Add {
//!     type Reply = u32;
//! }
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register_fn("add", |m: &Add| Ok(m.0 + m.1));
//!
//! let broker = MessageBroker::new(Arc::new(registry));
//! assert_eq!(broker.send(Add(2, 3)).unwrap(), 5);
//! ```

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, trace};

use crate::config::BrokerConfig;
use crate::context::ContextPropagator;
use crate::error::{BrokerError, Result};
use crate::handler::{HandlerSource, Invoker};
use crate::ids::DispatchId;
use crate::message::{Message, MessageKind};
use crate::reply::AsyncReply;
use crate::resolver::{HandlerOverlap, HandlerResolver};
use crate::worker_pool::{panic_message, Executor, WorkerPool};

/// Whole milliseconds since `started`, saturating at `u64::MAX`.
fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Routes each message to its handler on the calling thread.
#[derive(Debug, Clone)]
pub struct MessageBroker {
    resolver: Arc<HandlerResolver>,
}

impl MessageBroker {
    /// Create a broker resolving handlers from `source` with first-match overlap.
    pub fn new(source: Arc<dyn HandlerSource>) -> Self {
        Self::with_overlap(source, HandlerOverlap::default())
    }

    pub fn with_overlap(source: Arc<dyn HandlerSource>, overlap: HandlerOverlap) -> Self {
        Self::with_resolver(Arc::new(HandlerResolver::with_overlap(source, overlap)))
    }

    /// Create a broker sharing an existing resolver (and its cache).
    pub fn with_resolver(resolver: Arc<HandlerResolver>) -> Self {
        Self { resolver }
    }

    #[must_use]
    pub fn resolver(&self) -> &Arc<HandlerResolver> {
        &self.resolver
    }

    /// Resolve the typed handler for `M`.
    pub(crate) fn invoker<M: Message>(&self) -> Result<(Arc<str>, Invoker<M>)> {
        let kind = MessageKind::of::<M>();
        let entry = self.resolver.require(&kind)?;
        let invoker = entry.invoker::<M>()?;
        Ok((Arc::from(entry.name()), invoker))
    }

    /// Dispatch `message` and return its reply.
    ///
    /// # Errors
    ///
    /// - [`BrokerError::NoHandlerFound`] when no handler supports `M`
    /// - [`BrokerError::AmbiguousHandlers`] under the reject overlap policy
    /// - [`BrokerError::HandlerFailed`] carrying the handler's own error
    /// - for natively asynchronous handlers, everything [`AsyncReply::wait_for`] returns
    pub fn send<M: Message>(&self, message: M) -> Result<M::Reply> {
        let dispatch_id = DispatchId::new();
        let kind = MessageKind::of::<M>();
        let started = Instant::now();

        trace!(
            dispatch_id = %dispatch_id,
            message_kind = %kind,
            "Sending message synchronously"
        );

        let (handler_name, invoker) = self.invoker::<M>()?;

        let result = match invoker {
            Invoker::Blocking(handler) => handler.handle(&message).map_err(BrokerError::HandlerFailed),
            Invoker::Native(handler) => handler.handle_async(&message).wait_for(&message),
        };

        let elapsed_ms = elapsed_ms(started);
        match &result {
            Ok(_) => trace!(
                dispatch_id = %dispatch_id,
                handler_name = %handler_name,
                message_kind = %kind,
                elapsed_ms = elapsed_ms,
                "Message handled"
            ),
            Err(e) => error!(
                dispatch_id = %dispatch_id,
                handler_name = %handler_name,
                message_kind = %kind,
                elapsed_ms = elapsed_ms,
                error = %e,
                "Message handling failed"
            ),
        }

        result
    }
}

/// Routes messages to handlers and bridges blocking handlers onto an [`Executor`].
#[derive(Clone)]
pub struct AsyncMessageBroker {
    broker: MessageBroker,
    executor: Arc<dyn Executor>,
    propagator: ContextPropagator,
}

impl AsyncMessageBroker {
    /// Create an async broker over `source`.
    ///
    /// `propagator` must be the one request code uses to set the current
    /// context; it is snapshotted on subscription and installed on the worker.
    pub fn new(
        source: Arc<dyn HandlerSource>,
        executor: Arc<dyn Executor>,
        propagator: ContextPropagator,
    ) -> Self {
        Self::with_broker(MessageBroker::new(source), executor, propagator)
    }

    /// Wrap an existing synchronous broker, sharing its resolver cache.
    pub fn with_broker(
        broker: MessageBroker,
        executor: Arc<dyn Executor>,
        propagator: ContextPropagator,
    ) -> Self {
        Self {
            broker,
            executor,
            propagator,
        }
    }

    /// Create an async broker backed by a fresh [`WorkerPool`] built from `config`.
    ///
    /// # Errors
    ///
    /// [`BrokerError::WorkerUnavailable`] when the pool cannot start any worker.
    pub fn from_config(
        source: Arc<dyn HandlerSource>,
        config: &BrokerConfig,
        propagator: ContextPropagator,
    ) -> Result<Self> {
        let pool = WorkerPool::new(config.pool.clone())?;
        info!(
            pool = %config.pool.name,
            overlap = %config.overlap,
            "Async message broker created"
        );
        Ok(Self::with_broker(
            MessageBroker::with_overlap(source, config.overlap),
            Arc::new(pool),
            propagator,
        ))
    }

    #[must_use]
    pub fn broker(&self) -> &MessageBroker {
        &self.broker
    }

    #[must_use]
    pub fn propagator(&self) -> &ContextPropagator {
        &self.propagator
    }

    /// Synchronous dispatch on the calling thread. See [`MessageBroker::send`].
    ///
    /// # Errors
    ///
    /// See [`MessageBroker::send`].
    pub fn send<M: Message>(&self, message: M) -> Result<M::Reply> {
        self.broker.send(message)
    }

    /// Dispatch `message` asynchronously.
    ///
    /// Nothing runs until the returned reply is subscribed to. A bridged reply
    /// emits exactly one value or fails; handler panics surface as
    /// [`BrokerError::HandlerPanicked`].
    ///
    /// # Errors
    ///
    /// Resolution errors ([`BrokerError::NoHandlerFound`],
    /// [`BrokerError::AmbiguousHandlers`]) are returned immediately.
    pub fn send_async<M: Message>(&self, message: M) -> Result<AsyncReply<M::Reply>> {
        let kind = MessageKind::of::<M>();
        trace!(message_kind = %kind, "Sending message asynchronously");

        let (handler_name, invoker) = self.broker.invoker::<M>()?;

        let handler = match invoker {
            Invoker::Native(handler) => {
                debug!(
                    handler_name = %handler_name,
                    message_kind = %kind,
                    "Delegating to natively asynchronous handler"
                );
                return Ok(handler.handle_async(&message));
            }
            Invoker::Blocking(handler) => handler,
        };

        let executor = Arc::clone(&self.executor);
        let propagator = self.propagator.clone();
        let on_caller = executor.runs_on_caller();

        Ok(AsyncReply::of::<M>(move |emitter| {
            let dispatch_id = DispatchId::new();
            // Captured on the subscribing thread, installed on the worker.
            let snapshot = propagator.snapshot();
            let worker_emitter = emitter.clone();
            let worker_handler_name = Arc::clone(&handler_name);

            let job = Box::new(move || {
                worker_emitter.running();
                let started = Instant::now();

                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    // A pooled worker must end every job with an empty slot.
                    let _scope = if on_caller {
                        propagator.enter(snapshot)
                    } else {
                        propagator.enter_isolated(snapshot)
                    };
                    handler.handle(&message)
                }));

                let elapsed_ms = elapsed_ms(started);
                match outcome {
                    Ok(Ok(reply)) => {
                        trace!(
                            dispatch_id = %dispatch_id,
                            handler_name = %worker_handler_name,
                            message_kind = %kind,
                            elapsed_ms = elapsed_ms,
                            "Bridged handler completed"
                        );
                        worker_emitter.next(reply);
                        worker_emitter.complete();
                    }
                    Ok(Err(e)) => {
                        error!(
                            dispatch_id = %dispatch_id,
                            handler_name = %worker_handler_name,
                            message_kind = %kind,
                            elapsed_ms = elapsed_ms,
                            error = %e,
                            "Bridged handler failed"
                        );
                        worker_emitter.fail(BrokerError::HandlerFailed(e));
                    }
                    Err(panic) => {
                        let message = panic_message(panic.as_ref());
                        error!(
                            dispatch_id = %dispatch_id,
                            handler_name = %worker_handler_name,
                            message_kind = %kind,
                            panic_message = %message,
                            "Bridged handler panicked"
                        );
                        worker_emitter.fail(BrokerError::HandlerPanicked {
                            handler: worker_handler_name.to_string(),
                            message,
                        });
                    }
                }
            });

            if let Err(e) = executor.execute(job) {
                error!(
                    dispatch_id = %dispatch_id,
                    handler_name = %handler_name,
                    message_kind = %kind,
                    error = %e,
                    "Failed to submit bridged handler"
                );
                emitter.fail(e);
            }
        }))
    }
}

impl std::fmt::Debug for AsyncMessageBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncMessageBroker")
            .field("broker", &self.broker)
            .field("propagator", &self.propagator)
            .finish()
    }
}
