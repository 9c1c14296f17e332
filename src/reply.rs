//! # Reply Module
//!
//! [`AsyncReply`] is the deferred result returned by the asynchronous broker and by
//! natively asynchronous handlers.
//!
//! ## Semantics
//!
//! - **Cold**: building an `AsyncReply` runs nothing. The producer closure is
//!   invoked by [`AsyncReply::subscribe`] (or any of the blocking adapters).
//! - **Single subscription**: `subscribe` consumes the reply, so a reply can be
//!   observed once. Observing again means calling `send_async` again, which
//!   re-executes the handler; nothing is replayed.
//! - **Multi emission**: a producer may emit any number of values before it
//!   completes or fails.
//! - **Single-value adapters**: [`Subscription::single`] reduces the stream to one
//!   value. Exactly one emitted value is returned as is. Zero or several values
//!   resolve to the fallback reply when one is given, otherwise to
//!   [`BrokerError::EmptyReply`] or [`BrokerError::AmbiguousReply`]. A failure
//!   always wins over the fallback.
//!
//! ## State Machine
//!
//! `Created` → `Submitted` (on subscribe) → `Running` (first value, or the bridged
//! job starts) → `Completed` | `Failed`. Terminal states never change.
//!
//! ## Usage
//!
//! ```rust
//! use msgbroker::message::Message;
//! use msgbroker::reply::AsyncReply;
//!
//! struct Greet;
//! impl Message for Greet {
//!     type Reply = String;
//! }
//!
//! let reply = AsyncReply::<String>::of::<Greet>(|emitter| {
//!     emitter.next("hello".to_string());
//!     emitter.complete();
//! });
//! assert_eq!(reply.wait().unwrap(), "hello");
//! ```

use may::sync::mpsc;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::error::{BrokerError, Result};
use crate::message::{Message, MessageKind};

/// Lifecycle of an [`AsyncReply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ReplyState {
    /// Built, nothing submitted yet
    Created = 0,
    /// Subscribed; the producer has been started
    Submitted = 1,
    /// The producer is running or has emitted a value
    Running = 2,
    /// The producer completed
    Completed = 3,
    /// The producer failed or went away without completing
    Failed = 4,
}

impl ReplyState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ReplyState::Created,
            1 => ReplyState::Submitted,
            2 => ReplyState::Running,
            3 => ReplyState::Completed,
            _ => ReplyState::Failed,
        }
    }

    /// `Completed` or `Failed`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, ReplyState::Completed | ReplyState::Failed)
    }
}

/// Shared state cell. Only moves forward, never out of a terminal state.
#[derive(Clone)]
struct StatusCell(Arc<AtomicU8>);

impl StatusCell {
    fn new() -> Self {
        Self(Arc::new(AtomicU8::new(ReplyState::Created as u8)))
    }

    fn get(&self) -> ReplyState {
        ReplyState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move to `to`. Returns false when the cell is terminal or already past `to`.
    fn advance(&self, to: ReplyState) -> bool {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let state = ReplyState::from_u8(current);
            if state.is_terminal() || state >= to {
                return false;
            }
            match self.0.compare_exchange_weak(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}

enum Signal<R> {
    Next(R),
    Failed(BrokerError),
    Completed,
}

/// Producer side of an [`AsyncReply`], handed to the producer closure on subscription.
///
/// Clones feed the same subscription. Once any clone completes or fails,
/// every further signal is dropped.
pub struct Emitter<R> {
    tx: mpsc::Sender<Signal<R>>,
    status: StatusCell,
}

impl<R> Clone for Emitter<R> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            status: self.status.clone(),
        }
    }
}

impl<R: Send> Emitter<R> {
    /// Mark the producer as running without emitting anything.
    pub fn running(&self) {
        self.status.advance(ReplyState::Running);
    }

    /// Emit a value. Returns false if the reply is already terminal or the
    /// subscriber has gone away.
    pub fn next(&self, value: R) -> bool {
        if self.status.get().is_terminal() {
            return false;
        }
        self.status.advance(ReplyState::Running);
        self.tx.send(Signal::Next(value)).is_ok()
    }

    /// Complete the reply. Returns false if it was already terminal.
    pub fn complete(&self) -> bool {
        if !self.status.advance(ReplyState::Completed) {
            return false;
        }
        let _ = self.tx.send(Signal::Completed);
        true
    }

    /// Fail the reply. Returns false if it was already terminal.
    pub fn fail(&self, error: BrokerError) -> bool {
        if !self.status.advance(ReplyState::Failed) {
            return false;
        }
        let _ = self.tx.send(Signal::Failed(error));
        true
    }

    #[must_use]
    pub fn state(&self) -> ReplyState {
        self.status.get()
    }
}

type Producer<R> = Box<dyn FnOnce(Emitter<R>) + Send + 'static>;

/// A cold, single-subscription, possibly multi-value deferred reply.
#[must_use = "an AsyncReply does nothing until it is subscribed to"]
pub struct AsyncReply<R> {
    kind: MessageKind,
    producer: Producer<R>,
    status: StatusCell,
}

impl<R: Send + 'static> AsyncReply<R> {
    /// Build a reply for messages of `kind` from a producer closure.
    ///
    /// The closure runs on the subscribing thread when the reply is subscribed to.
    /// It may emit synchronously or hand the [`Emitter`] to another thread.
    pub fn create(kind: MessageKind, producer: impl FnOnce(Emitter<R>) + Send + 'static) -> Self {
        Self {
            kind,
            producer: Box::new(producer),
            status: StatusCell::new(),
        }
    }

    /// [`AsyncReply::create`] with the kind of message type `M`.
    pub fn of<M>(producer: impl FnOnce(Emitter<R>) + Send + 'static) -> Self
    where
        M: Message<Reply = R>,
    {
        Self::create(MessageKind::of::<M>(), producer)
    }

    /// A reply that emits `values` in order, then completes.
    pub fn from_values<M>(values: Vec<R>) -> Self
    where
        M: Message<Reply = R>,
    {
        Self::of::<M>(move |emitter| {
            for value in values {
                emitter.next(value);
            }
            emitter.complete();
        })
    }

    /// A reply that fails with `error` as soon as it is subscribed to.
    pub fn failed<M>(error: BrokerError) -> Self
    where
        M: Message<Reply = R>,
    {
        Self::of::<M>(move |emitter| {
            emitter.fail(error);
        })
    }

    #[must_use]
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    #[must_use]
    pub fn state(&self) -> ReplyState {
        self.status.get()
    }

    /// Start the producer and return the stream of its signals.
    pub fn subscribe(self) -> Subscription<R> {
        let AsyncReply {
            kind,
            producer,
            status,
        } = self;

        status.advance(ReplyState::Submitted);
        trace!(message_kind = %kind, "Reply subscribed");

        let (tx, rx) = mpsc::channel();
        let emitter = Emitter {
            tx,
            status: status.clone(),
        };
        producer(emitter);

        Subscription {
            kind,
            rx,
            status,
            finished: false,
        }
    }

    /// Block until the reply finishes and return its single value.
    ///
    /// # Errors
    ///
    /// Any failure signalled by the producer, or [`BrokerError::EmptyReply`] /
    /// [`BrokerError::AmbiguousReply`] when not exactly one value was emitted.
    pub fn wait(self) -> Result<R> {
        self.subscribe().single(None)
    }

    /// Like [`AsyncReply::wait`] but resolves zero or several values to `fallback`.
    ///
    /// # Errors
    ///
    /// See [`Subscription::single`].
    pub fn wait_or(self, fallback: Option<R>) -> Result<R> {
        self.subscribe().single(fallback)
    }

    /// Like [`AsyncReply::wait`] using the fallback reply declared by `message`.
    ///
    /// # Errors
    ///
    /// See [`Subscription::single`].
    pub fn wait_for<M>(self, message: &M) -> Result<R>
    where
        M: Message<Reply = R>,
    {
        self.wait_or(message.fallback_reply())
    }

    /// Block until the reply finishes and return every emitted value.
    ///
    /// # Errors
    ///
    /// The first failure signalled by the producer.
    pub fn collect_all(self) -> Result<Vec<R>> {
        self.subscribe().collect()
    }
}

impl<R> fmt::Debug for AsyncReply<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncReply")
            .field("kind", &self.kind)
            .field("state", &self.status.get())
            .finish()
    }
}

/// Blocking iterator over the values of a subscribed [`AsyncReply`].
///
/// Yields `Ok(value)` per emitted value and ends after completion. A failure is
/// yielded once as `Err` and ends the iteration. If every [`Emitter`] is dropped
/// before the reply completes, [`BrokerError::ReplyAbandoned`] is yielded.
pub struct Subscription<R> {
    kind: MessageKind,
    rx: mpsc::Receiver<Signal<R>>,
    status: StatusCell,
    finished: bool,
}

impl<R> Subscription<R> {
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    #[must_use]
    pub fn state(&self) -> ReplyState {
        self.status.get()
    }

    /// Drain the subscription and reduce it to exactly one value.
    ///
    /// # Errors
    ///
    /// - the producer's failure, whether or not a fallback is given
    /// - [`BrokerError::EmptyReply`] when nothing was emitted and there is no fallback
    /// - [`BrokerError::AmbiguousReply`] when several values were emitted and there is no fallback
    pub fn single(mut self, fallback: Option<R>) -> Result<R> {
        let kind = self.kind;
        let mut first = None;
        let mut count = 0usize;

        for item in &mut self {
            let value = item?;
            count += 1;
            if first.is_none() {
                first = Some(value);
            }
        }

        match (count, first) {
            (1, Some(value)) => Ok(value),
            (0, _) => {
                debug!(message_kind = %kind, has_fallback = fallback.is_some(), "Reply completed empty");
                fallback.ok_or(BrokerError::EmptyReply(kind))
            }
            (count, _) => {
                debug!(
                    message_kind = %kind,
                    count = count,
                    has_fallback = fallback.is_some(),
                    "Reply emitted more than one value"
                );
                fallback.ok_or(BrokerError::AmbiguousReply { kind, count })
            }
        }
    }
}

impl<R> Iterator for Subscription<R> {
    type Item = Result<R>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.rx.recv() {
            Ok(Signal::Next(value)) => Some(Ok(value)),
            Ok(Signal::Completed) => {
                self.finished = true;
                None
            }
            Ok(Signal::Failed(error)) => {
                self.finished = true;
                Some(Err(error))
            }
            Err(_) => {
                self.finished = true;
                self.status.advance(ReplyState::Failed);
                Some(Err(BrokerError::ReplyAbandoned(self.kind)))
            }
        }
    }
}

impl<R> fmt::Debug for Subscription<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("kind", &self.kind)
            .field("state", &self.status.get())
            .field("finished", &self.finished)
            .finish()
    }
}
