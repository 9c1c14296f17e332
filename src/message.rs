//! # Message Module
//!
//! Messages are the typed requests a caller hands to the broker. Each message type
//! declares the reply type it expects, and may declare a fallback reply used when an
//! asynchronous handler emits more (or fewer) values than the single reply a caller
//! asked for.
//!
//! ## Roles
//!
//! [`Command`] and [`Query`] are documentation markers: a command changes state,
//! a query only reads it. The broker treats both the same way.
//!
//! ```rust
//! use msgbroker::message::{Message, Query};
//!
//! struct CountPets {
//!     species: String,
//! }
//!
//! impl Message for CountPets {
//!     type Reply = u64;
//!
//!     fn fallback_reply(&self) -> Option<u64> {
//!         Some(0)
//!     }
//! }
//!
//! impl Query for CountPets {}
//! ```

use std::any::TypeId;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A typed request routed by the broker to exactly one handler.
pub trait Message: Send + 'static {
    /// The reply produced by the handler.
    type Reply: Send + 'static;

    /// Default reply used when an asynchronous result cannot be reduced to a
    /// single value. `None` means "no fallback".
    fn fallback_reply(&self) -> Option<Self::Reply> {
        None
    }
}

/// Marker for messages that change state.
pub trait Command: Message {}

/// Marker for messages that only read state.
pub trait Query: Message {}

/// Stable runtime tag identifying a concrete message type.
///
/// Equality and hashing use the [`TypeId`]; the type name is kept for logs
/// and error messages.
#[derive(Clone, Copy)]
pub struct MessageKind {
    id: TypeId,
    name: &'static str,
}

impl MessageKind {
    /// The kind of message type `M`.
    #[inline]
    #[must_use]
    pub fn of<M: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<M>(),
            name: std::any::type_name::<M>(),
        }
    }

    /// Whether this kind identifies message type `M`.
    #[inline]
    #[must_use]
    pub fn is<M: ?Sized + 'static>(&self) -> bool {
        self.id == TypeId::of::<M>()
    }

    /// Fully qualified type name of the message.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    #[must_use]
    pub fn type_id(&self) -> TypeId {
        self.id
    }
}

impl PartialEq for MessageKind {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for MessageKind {}

impl Hash for MessageKind {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageKind({})", self.name)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}
