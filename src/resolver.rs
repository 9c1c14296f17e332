//! # Resolver Module
//!
//! Maps a [`MessageKind`] to the handler that serves it and remembers the answer.
//!
//! ## Caching
//!
//! The first lookup for a kind scans the [`HandlerSource`]; the result is kept in a
//! concurrent map and later lookups never touch the source again. Two threads
//! resolving the same kind for the first time may both scan; both store an
//! equivalent entry and the last write wins. Kinds with no handler are not cached,
//! so a handler registered later can still be found by a fresh resolver.
//!
//! ## Overlapping Handlers
//!
//! When several handlers support the same kind, [`HandlerOverlap`] decides:
//! `FirstMatch` keeps the first in enumeration order, `Reject` fails every
//! dispatch of that kind with [`BrokerError::AmbiguousHandlers`].

use dashmap::DashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use crate::error::{BrokerError, Result};
use crate::handler::{HandlerEntry, HandlerSource};
use crate::message::MessageKind;

/// Policy for kinds supported by more than one handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandlerOverlap {
    /// Use the first supporting handler in source enumeration order.
    #[default]
    FirstMatch,
    /// Refuse to pick; dispatch fails with [`BrokerError::AmbiguousHandlers`].
    Reject,
}

impl FromStr for HandlerOverlap {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "first" | "first_match" | "first-match" => Ok(HandlerOverlap::FirstMatch),
            "reject" | "strict" => Ok(HandlerOverlap::Reject),
            other => Err(format!("unknown handler overlap policy '{other}'")),
        }
    }
}

impl fmt::Display for HandlerOverlap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerOverlap::FirstMatch => f.write_str("first"),
            HandlerOverlap::Reject => f.write_str("reject"),
        }
    }
}

/// Finds and caches the handler for each message kind.
pub struct HandlerResolver {
    source: Arc<dyn HandlerSource>,
    cache: DashMap<MessageKind, Arc<HandlerEntry>>,
    overlap: HandlerOverlap,
}

impl HandlerResolver {
    pub fn new(source: Arc<dyn HandlerSource>) -> Self {
        Self::with_overlap(source, HandlerOverlap::default())
    }

    pub fn with_overlap(source: Arc<dyn HandlerSource>, overlap: HandlerOverlap) -> Self {
        Self {
            source,
            cache: DashMap::new(),
            overlap,
        }
    }

    #[must_use]
    pub fn overlap(&self) -> HandlerOverlap {
        self.overlap
    }

    /// The handler for `kind`, or `None` when no handler supports it.
    ///
    /// # Errors
    ///
    /// [`BrokerError::AmbiguousHandlers`] under [`HandlerOverlap::Reject`] when
    /// more than one handler supports `kind`.
    pub fn resolve(&self, kind: &MessageKind) -> Result<Option<Arc<HandlerEntry>>> {
        if let Some(entry) = self.cache.get(kind) {
            trace!(
                handler_name = %entry.name(),
                message_kind = %kind,
                "Found handler in cache"
            );
            return Ok(Some(Arc::clone(entry.value())));
        }

        debug!(message_kind = %kind, "Looking for a handler");
        match self.find(kind)? {
            Some(entry) => {
                info!(
                    handler_name = %entry.name(),
                    message_kind = %kind,
                    "Found handler"
                );
                self.cache.insert(*kind, Arc::clone(&entry));
                Ok(Some(entry))
            }
            None => {
                warn!(message_kind = %kind, "Found no handler");
                Ok(None)
            }
        }
    }

    /// Like [`HandlerResolver::resolve`] but absence is an error.
    ///
    /// # Errors
    ///
    /// [`BrokerError::NoHandlerFound`] when no handler supports `kind`, plus
    /// everything [`HandlerResolver::resolve`] returns.
    pub fn require(&self, kind: &MessageKind) -> Result<Arc<HandlerEntry>> {
        self.resolve(kind)?
            .ok_or(BrokerError::NoHandlerFound(*kind))
    }

    fn find(&self, kind: &MessageKind) -> Result<Option<Arc<HandlerEntry>>> {
        let mut candidates = self
            .source
            .handlers()
            .into_iter()
            .filter(|entry| entry.supports(kind));

        match self.overlap {
            HandlerOverlap::FirstMatch => Ok(candidates.next()),
            HandlerOverlap::Reject => {
                let matches: Vec<Arc<HandlerEntry>> = candidates.collect();
                if matches.len() > 1 {
                    let handlers: Vec<String> =
                        matches.iter().map(|e| e.name().to_string()).collect();
                    warn!(
                        message_kind = %kind,
                        handlers = ?handlers,
                        "Multiple handlers support message kind"
                    );
                    return Err(BrokerError::AmbiguousHandlers {
                        kind: *kind,
                        handlers,
                    });
                }
                Ok(matches.into_iter().next())
            }
        }
    }

    /// Kinds currently cached.
    #[must_use]
    pub fn cached_kinds(&self) -> Vec<MessageKind> {
        self.cache.iter().map(|entry| *entry.key()).collect()
    }

    /// Forget every cached resolution.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }
}

impl fmt::Debug for HandlerResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerResolver")
            .field("overlap", &self.overlap)
            .field("cached", &self.cache.len())
            .finish()
    }
}
