//! # Handler Module
//!
//! Handlers turn a message into a reply. The broker never calls a handler type
//! directly; it works with type-erased [`HandlerEntry`] values produced by a
//! [`HandlerSource`], usually a [`HandlerRegistry`].
//!
//! ## Handler Flavours
//!
//! - [`MessageHandler`] - blocking: `handle(&message) -> anyhow::Result<Reply>`.
//!   The asynchronous broker runs these on a worker pool.
//! - [`AsyncMessageHandler`] - natively asynchronous: returns an [`AsyncReply`]
//!   that may emit several values. The synchronous broker blocks on it and applies
//!   the message's fallback reply when it does not emit exactly one value.
//!
//! Plain closures can be registered through [`FnHandler`] and [`AsyncFnHandler`].
//!
//! ## Usage
//!
//! ```rust
//! use msgbroker::handler::HandlerRegistry;
//! use msgbroker::message::Message;
//!
//! struct Echo(String);
//! impl Message for Echo {
//!     type Reply = String;
//! }
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register_fn("echo", |msg: &Echo| Ok(msg.0.clone()));
//! assert_eq!(registry.names(), vec!["echo".to_string()]);
//! ```

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{BrokerError, Result};
use crate::message::{Message, MessageKind};
use crate::reply::AsyncReply;

/// A blocking handler for messages of type `M`.
///
/// Implementations must be safe to call from several threads at once.
pub trait MessageHandler<M: Message>: Send + Sync + 'static {
    /// Whether this handler accepts messages of `kind`.
    ///
    /// Defaults to "exactly `M`". Override to switch a handler off or to
    /// gate it on configuration; a handler is only ever offered kinds equal to `M`.
    fn supports(&self, kind: &MessageKind) -> bool {
        kind.is::<M>()
    }

    /// Handle `message`. Errors reach the caller unchanged inside
    /// [`BrokerError::HandlerFailed`].
    fn handle(&self, message: &M) -> anyhow::Result<M::Reply>;
}

/// A natively asynchronous handler for messages of type `M`.
pub trait AsyncMessageHandler<M: Message>: Send + Sync + 'static {
    /// See [`MessageHandler::supports`].
    fn supports(&self, kind: &MessageKind) -> bool {
        kind.is::<M>()
    }

    /// Start handling `message`. The returned reply must be cold: work starts
    /// when it is subscribed to.
    fn handle_async(&self, message: &M) -> AsyncReply<M::Reply>;
}

/// Adapts a closure into a [`MessageHandler`].
pub struct FnHandler<M, F> {
    f: F,
    _message: PhantomData<fn(&M)>,
}

impl<M, F> FnHandler<M, F>
where
    M: Message,
    F: Fn(&M) -> anyhow::Result<M::Reply> + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _message: PhantomData,
        }
    }
}

impl<M, F> MessageHandler<M> for FnHandler<M, F>
where
    M: Message,
    F: Fn(&M) -> anyhow::Result<M::Reply> + Send + Sync + 'static,
{
    fn handle(&self, message: &M) -> anyhow::Result<M::Reply> {
        (self.f)(message)
    }
}

/// Adapts a closure into an [`AsyncMessageHandler`].
pub struct AsyncFnHandler<M, F> {
    f: F,
    _message: PhantomData<fn(&M)>,
}

impl<M, F> AsyncFnHandler<M, F>
where
    M: Message,
    F: Fn(&M) -> AsyncReply<M::Reply> + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _message: PhantomData,
        }
    }
}

impl<M, F> AsyncMessageHandler<M> for AsyncFnHandler<M, F>
where
    M: Message,
    F: Fn(&M) -> AsyncReply<M::Reply> + Send + Sync + 'static,
{
    fn handle_async(&self, message: &M) -> AsyncReply<M::Reply> {
        (self.f)(message)
    }
}

/// The typed handler behind a [`HandlerEntry`].
pub enum Invoker<M: Message> {
    Blocking(Arc<dyn MessageHandler<M>>),
    Native(Arc<dyn AsyncMessageHandler<M>>),
}

impl<M: Message> Clone for Invoker<M> {
    fn clone(&self) -> Self {
        match self {
            Invoker::Blocking(handler) => Invoker::Blocking(Arc::clone(handler)),
            Invoker::Native(handler) => Invoker::Native(Arc::clone(handler)),
        }
    }
}

impl<M: Message> Invoker<M> {
    /// Whether the handler produces its own asynchronous reply.
    #[must_use]
    pub fn is_native_async(&self) -> bool {
        matches!(self, Invoker::Native(_))
    }
}

type SupportsFn = Box<dyn Fn(&MessageKind) -> bool + Send + Sync>;

/// A registered handler with its message type erased.
///
/// The broker asks an entry whether it supports a kind, then recovers the
/// typed [`Invoker`] with [`HandlerEntry::invoker`].
pub struct HandlerEntry {
    name: Arc<str>,
    kind: MessageKind,
    native_async: bool,
    supports: SupportsFn,
    invoker: Box<dyn Any + Send + Sync>,
}

impl HandlerEntry {
    /// Wrap a blocking handler for `M`.
    pub fn blocking<M, H>(name: impl Into<Arc<str>>, handler: H) -> Self
    where
        M: Message,
        H: MessageHandler<M>,
    {
        let handler: Arc<dyn MessageHandler<M>> = Arc::new(handler);
        let probe = Arc::clone(&handler);
        Self {
            name: name.into(),
            kind: MessageKind::of::<M>(),
            native_async: false,
            supports: Box::new(move |kind| probe.supports(kind)),
            invoker: Box::new(Invoker::Blocking(handler)),
        }
    }

    /// Wrap a natively asynchronous handler for `M`.
    pub fn native<M, H>(name: impl Into<Arc<str>>, handler: H) -> Self
    where
        M: Message,
        H: AsyncMessageHandler<M>,
    {
        let handler: Arc<dyn AsyncMessageHandler<M>> = Arc::new(handler);
        let probe = Arc::clone(&handler);
        Self {
            name: name.into(),
            kind: MessageKind::of::<M>(),
            native_async: true,
            supports: Box::new(move |kind| probe.supports(kind)),
            invoker: Box::new(Invoker::Native(handler)),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The message kind this handler was registered for.
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    #[must_use]
    pub fn is_native_async(&self) -> bool {
        self.native_async
    }

    /// Whether this handler accepts messages of `kind`.
    #[must_use]
    pub fn supports(&self, kind: &MessageKind) -> bool {
        self.kind == *kind && (self.supports)(kind)
    }

    /// Recover the typed handler for message type `M`.
    ///
    /// # Errors
    ///
    /// [`BrokerError::NoHandlerFound`] when the entry was registered for another message type.
    pub fn invoker<M: Message>(&self) -> Result<Invoker<M>> {
        self.invoker
            .downcast_ref::<Invoker<M>>()
            .cloned()
            .ok_or_else(|| BrokerError::NoHandlerFound(MessageKind::of::<M>()))
    }
}

impl fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("native_async", &self.native_async)
            .finish()
    }
}

/// Enumerates candidate handlers for the resolver.
///
/// Enumeration order is the tie-break under the first-match overlap policy,
/// so implementations should return entries in a stable order.
pub trait HandlerSource: Send + Sync {
    fn handlers(&self) -> Vec<Arc<HandlerEntry>>;
}

/// In-memory [`HandlerSource`] that keeps handlers in registration order.
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    entries: Vec<Arc<HandlerEntry>>,
}

impl HandlerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pre-built entry.
    ///
    /// Names are labels for logs and errors; registering a second handler for
    /// an already covered kind is allowed and logged.
    pub fn add(&mut self, entry: HandlerEntry) -> &mut Self {
        if let Some(existing) = self.entries.iter().find(|e| e.kind() == entry.kind()) {
            warn!(
                handler_name = %entry.name(),
                existing_handler = %existing.name(),
                message_kind = %entry.kind(),
                "Handler overlaps an existing registration for this message kind"
            );
        }

        info!(
            handler_name = %entry.name(),
            message_kind = %entry.kind(),
            native_async = entry.is_native_async(),
            total_handlers = self.entries.len() + 1,
            "Handler registered successfully"
        );

        self.entries.push(Arc::new(entry));
        self
    }

    /// Register a blocking handler.
    pub fn register<M, H>(&mut self, name: &str, handler: H) -> &mut Self
    where
        M: Message,
        H: MessageHandler<M>,
    {
        self.add(HandlerEntry::blocking::<M, H>(name, handler))
    }

    /// Register a natively asynchronous handler.
    pub fn register_async<M, H>(&mut self, name: &str, handler: H) -> &mut Self
    where
        M: Message,
        H: AsyncMessageHandler<M>,
    {
        self.add(HandlerEntry::native::<M, H>(name, handler))
    }

    /// Register a closure as a blocking handler.
    pub fn register_fn<M, F>(&mut self, name: &str, f: F) -> &mut Self
    where
        M: Message,
        F: Fn(&M) -> anyhow::Result<M::Reply> + Send + Sync + 'static,
    {
        self.register::<M, _>(name, FnHandler::new(f))
    }

    /// Register a closure as a natively asynchronous handler.
    pub fn register_async_fn<M, F>(&mut self, name: &str, f: F) -> &mut Self
    where
        M: Message,
        F: Fn(&M) -> AsyncReply<M::Reply> + Send + Sync + 'static,
    {
        self.register_async::<M, _>(name, AsyncFnHandler::new(f))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Handler names in registration order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name().to_string()).collect()
    }
}

impl HandlerSource for HandlerRegistry {
    fn handlers(&self) -> Vec<Arc<HandlerEntry>> {
        self.entries.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Ping;
    impl Message for Ping {
        type Reply = &'static str;
    }

    struct Other;
    impl Message for Other {
        type Reply = u32;
    }

    struct Disabled;
    impl MessageHandler<Ping> for Disabled {
        fn supports(&self, _kind: &MessageKind) -> bool {
            false
        }

        fn handle(&self, _message: &Ping) -> anyhow::Result<&'static str> {
            Ok("never")
        }
    }

    #[test]
    fn test_entry_supports_only_its_kind() {
        let entry = HandlerEntry::blocking::<Ping, _>("ping", FnHandler::new(|_: &Ping| Ok("pong")));
        assert!(entry.supports(&MessageKind::of::<Ping>()));
        assert!(!entry.supports(&MessageKind::of::<Other>()));
        assert!(!entry.is_native_async());
        assert_eq!(entry.name(), "ping");
    }

    #[test]
    fn test_entry_honours_handler_predicate() {
        let entry = HandlerEntry::blocking::<Ping, _>("off", Disabled);
        assert!(!entry.supports(&MessageKind::of::<Ping>()));
    }

    #[test]
    fn test_invoker_downcast() {
        let entry = HandlerEntry::blocking::<Ping, _>("ping", FnHandler::new(|_: &Ping| Ok("pong")));
        match entry.invoker::<Ping>().unwrap() {
            Invoker::Blocking(handler) => assert_eq!(handler.handle(&Ping).unwrap(), "pong"),
            Invoker::Native(_) => panic!("expected blocking invoker"),
        }
        assert!(matches!(
            entry.invoker::<Other>(),
            Err(BrokerError::NoHandlerFound(_))
        ));
    }

    #[test]
    fn test_native_entry() {
        let entry = HandlerEntry::native::<Ping, _>(
            "ping-async",
            AsyncFnHandler::new(|_: &Ping| AsyncReply::from_values::<Ping>(vec!["pong"])),
        );
        assert!(entry.is_native_async());
        let invoker = entry.invoker::<Ping>().unwrap();
        assert!(invoker.is_native_async());
    }

    #[test]
    fn test_registry_keeps_registration_order() {
        let mut registry = HandlerRegistry::new();
        registry
            .register_fn("first", |_: &Ping| Ok("1"))
            .register_fn("second", |_: &Other| Ok(2))
            .register_async_fn("third", |_: &Ping| AsyncReply::from_values::<Ping>(vec!["3"]));

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.names(), vec!["first", "second", "third"]);
        let handlers = registry.handlers();
        assert_eq!(handlers[0].name(), "first");
        assert_eq!(handlers[2].name(), "third");
    }
}
