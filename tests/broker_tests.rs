#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::fixtures::{registry, Boom};
use common::messages::*;
use common::sources::CountingSource;
use msgbroker::{BrokerError, HandlerOverlap, HandlerRegistry, MessageBroker, MessageKind};
use std::sync::Arc;
use tracing_util::TestTracing;

#[test]
fn test_send_returns_handler_reply() {
    let _tracing = TestTracing::init();
    let broker = MessageBroker::new(Arc::new(registry()));
    assert_eq!(broker.send(Greet).unwrap(), "hello");
}

#[test]
fn test_send_without_handler_names_the_kind() {
    let broker = MessageBroker::new(Arc::new(registry()));
    let err = broker.send(Orphan).unwrap_err();
    assert!(matches!(err, BrokerError::NoHandlerFound(kind) if kind == MessageKind::of::<Orphan>()));
    assert!(err.to_string().contains("Orphan"));
}

#[test]
fn test_registry_is_scanned_once_per_kind() {
    let source = CountingSource::new(registry());
    let broker = MessageBroker::new(source.clone());

    for _ in 0..10 {
        assert_eq!(broker.send(Greet).unwrap(), "hello");
    }
    assert_eq!(source.scans(), 1);

    // A different kind costs one more scan, then is cached too.
    assert_eq!(broker.send(Pick).unwrap(), "F");
    assert_eq!(broker.send(Pick).unwrap(), "F");
    assert_eq!(source.scans(), 2);
}

#[test]
fn test_missing_handler_rescans() {
    let source = CountingSource::new(HandlerRegistry::new());
    let broker = MessageBroker::new(source.clone());
    assert!(broker.send(Orphan).is_err());
    assert!(broker.send(Orphan).is_err());
    assert_eq!(source.scans(), 2);
}

#[test]
fn test_concurrent_first_resolution() {
    let source = CountingSource::new(registry());
    let broker = MessageBroker::new(source.clone());

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let broker = broker.clone();
            std::thread::spawn(move || broker.send(Greet))
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap().unwrap(), "hello");
    }

    let scans = source.scans();
    assert!((1..=16).contains(&scans), "unexpected scan count {scans}");
    assert_eq!(broker.resolver().cached_kinds(), vec![MessageKind::of::<Greet>()]);

    broker.send(Greet).unwrap();
    assert_eq!(source.scans(), scans);
}

#[test]
fn test_handler_error_is_propagated_verbatim() {
    let broker = MessageBroker::new(Arc::new(registry()));
    let err = broker.send(Explode("kaboom".into())).unwrap_err();
    let cause = err.into_handler_error().unwrap();
    assert_eq!(cause.downcast::<Boom>().unwrap(), Boom("kaboom".into()));
}

#[test]
fn test_native_handler_with_fallback() {
    let broker = MessageBroker::new(Arc::new(registry()));
    assert_eq!(broker.send(Pick).unwrap(), "F");
}

#[test]
fn test_native_handler_without_fallback_is_ambiguous() {
    let broker = MessageBroker::new(Arc::new(registry()));
    match broker.send(PickStrict) {
        Err(BrokerError::AmbiguousReply { kind, count }) => {
            assert!(kind.is::<PickStrict>());
            assert_eq!(count, 2);
        }
        other => panic!("expected AmbiguousReply, got {other:?}"),
    }
}

#[test]
fn test_overlap_policies() {
    let build = || {
        let mut registry = HandlerRegistry::new();
        registry
            .register_fn("first", |_: &Greet| Ok("first".to_string()))
            .register_fn("second", |_: &Greet| Ok("second".to_string()));
        Arc::new(registry)
    };

    let first = MessageBroker::with_overlap(build(), HandlerOverlap::FirstMatch);
    assert_eq!(first.send(Greet).unwrap(), "first");

    let strict = MessageBroker::with_overlap(build(), HandlerOverlap::Reject);
    match strict.send(Greet) {
        Err(BrokerError::AmbiguousHandlers { handlers, .. }) => {
            assert_eq!(handlers, vec!["first".to_string(), "second".to_string()]);
        }
        other => panic!("expected AmbiguousHandlers, got {other:?}"),
    }
}
