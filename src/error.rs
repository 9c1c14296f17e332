//! Error types for msgbroker.

use thiserror::Error;

use crate::message::MessageKind;

/// Every way a dispatch can fail.
///
/// Handler failures are carried verbatim in [`BrokerError::HandlerFailed`];
/// the broker never retries and never substitutes a reply except through a
/// message's declared fallback reply.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Resolution found no handler supporting the message kind.
    #[error("No handler found for message kind {0}")]
    NoHandlerFound(MessageKind),

    /// The handler returned an error. The original error is kept intact.
    #[error("Handler failed: {0}")]
    HandlerFailed(#[source] anyhow::Error),

    /// The handler panicked while running on a worker.
    #[error("Handler '{handler}' panicked: {message}")]
    HandlerPanicked { handler: String, message: String },

    /// A single reply was expected but several values were emitted and the
    /// message declares no fallback reply.
    #[error("Expected a single reply for {kind} but {count} were emitted")]
    AmbiguousReply { kind: MessageKind, count: usize },

    /// A single reply was expected but the source completed without a value
    /// and the message declares no fallback reply.
    #[error("Reply source for {0} completed without a value")]
    EmptyReply(MessageKind),

    /// More than one handler supports the kind and the resolver is
    /// configured to reject overlapping registrations.
    #[error("Multiple handlers support {kind}: {handlers:?}")]
    AmbiguousHandlers {
        kind: MessageKind,
        handlers: Vec<String>,
    },

    /// The current-context slot is empty.
    #[error("No Context available")]
    NoContext,

    /// The executor refused the job (worker channel closed).
    #[error("Worker pool '{0}' is not accepting jobs")]
    WorkerUnavailable(String),

    /// The reply producer went away without completing or failing.
    #[error("Reply source for {0} was dropped before completing")]
    ReplyAbandoned(MessageKind),
}

impl BrokerError {
    /// The message kind this error refers to, when it refers to one.
    #[must_use]
    pub fn message_kind(&self) -> Option<MessageKind> {
        match self {
            BrokerError::NoHandlerFound(kind)
            | BrokerError::EmptyReply(kind)
            | BrokerError::ReplyAbandoned(kind)
            | BrokerError::AmbiguousReply { kind, .. }
            | BrokerError::AmbiguousHandlers { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Returns the error raised by handler code, if this is a handler failure.
    #[must_use]
    pub fn handler_error(&self) -> Option<&anyhow::Error> {
        match self {
            BrokerError::HandlerFailed(cause) => Some(cause),
            _ => None,
        }
    }

    /// Unwraps the original handler error, or gives `self` back.
    pub fn into_handler_error(self) -> std::result::Result<anyhow::Error, BrokerError> {
        match self {
            BrokerError::HandlerFailed(cause) => Ok(cause),
            other => Err(other),
        }
    }
}

/// Result type alias using BrokerError.
pub type Result<T> = std::result::Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    struct Ping;

    #[test]
    fn test_no_handler_message_names_kind() {
        let kind = MessageKind::of::<Ping>();
        let err = BrokerError::NoHandlerFound(kind);
        assert!(err.to_string().contains("Ping"));
        assert_eq!(err.message_kind(), Some(kind));
    }

    #[test]
    fn test_handler_error_is_kept_verbatim() {
        #[derive(Debug, PartialEq)]
        struct Boom(u8);
        impl std::fmt::Display for Boom {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "boom {}", self.0)
            }
        }
        impl std::error::Error for Boom {}

        let err = BrokerError::HandlerFailed(anyhow::Error::new(Boom(7)));
        assert_eq!(
            err.handler_error().and_then(|e| e.downcast_ref::<Boom>()),
            Some(&Boom(7))
        );
        let cause = err.into_handler_error().unwrap();
        assert_eq!(cause.downcast::<Boom>().unwrap(), Boom(7));
    }

    #[test]
    fn test_into_handler_error_returns_other_variants() {
        let err = BrokerError::NoContext;
        assert!(matches!(
            err.into_handler_error(),
            Err(BrokerError::NoContext)
        ));
    }
}
