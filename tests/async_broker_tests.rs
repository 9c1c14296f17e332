#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::fixtures::{registry, Boom};
use common::messages::*;
use msgbroker::{
    AsyncMessageBroker, AsyncReply, BrokerConfig, BrokerError, Context, ContextPropagator,
    Executor, HandlerOverlap, HandlerRegistry, Job, Message, ReplyState, WorkerPool,
    WorkerPoolConfig,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::ThreadId;
use std::time::Duration;
use tracing_util::TestTracing;

fn pool() -> Arc<WorkerPool> {
    may::config().set_workers(2);
    Arc::new(WorkerPool::new(WorkerPoolConfig::new("async-tests", 2, 0x10000)).unwrap())
}

fn broker_with(registry: HandlerRegistry, propagator: ContextPropagator) -> AsyncMessageBroker {
    AsyncMessageBroker::new(Arc::new(registry), pool(), propagator)
}

/// Counts submissions and reports, after each job, whether the worker's slot was left empty.
struct LeakCheckingExecutor {
    inner: Arc<WorkerPool>,
    propagator: ContextPropagator,
    submitted: AtomicUsize,
    leaks: mpsc::Sender<bool>,
}

impl Executor for LeakCheckingExecutor {
    fn execute(&self, job: Job) -> msgbroker::Result<()> {
        self.submitted.fetch_add(1, Ordering::SeqCst);
        let propagator = self.propagator.clone();
        let leaks = self.leaks.clone();
        self.inner.execute(Box::new(move || {
            job();
            let _ = leaks.send(propagator.try_current().is_some());
        }))
    }
}

#[test]
fn test_send_async_fails_eagerly_without_handler() {
    let broker = broker_with(registry(), ContextPropagator::local());
    assert!(matches!(
        broker.send_async(Orphan),
        Err(BrokerError::NoHandlerFound(kind)) if kind.is::<Orphan>()
    ));
}

#[test]
fn test_bridged_reply_runs_on_worker() {
    let _tracing = TestTracing::init();
    let caller = std::thread::current().id();
    let (tx, rx) = mpsc::channel::<ThreadId>();
    let tx = std::sync::Mutex::new(tx);

    let mut registry = HandlerRegistry::new();
    registry.register_fn("greet", move |_: &Greet| {
        let _ = tx.lock().unwrap().send(std::thread::current().id());
        Ok("hello".to_string())
    });
    let broker = broker_with(registry, ContextPropagator::local());

    let reply = broker.send_async(Greet).unwrap();
    assert_eq!(reply.wait().unwrap(), "hello");

    let worker = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_ne!(worker, caller);
}

#[test]
fn test_bridged_reply_is_cold() {
    let (leaks, _leak_rx) = mpsc::channel();
    let propagator = ContextPropagator::local();
    let executor = Arc::new(LeakCheckingExecutor {
        inner: pool(),
        propagator: propagator.clone(),
        submitted: AtomicUsize::new(0),
        leaks,
    });
    let broker = AsyncMessageBroker::new(Arc::new(registry()), executor.clone(), propagator);

    let reply = broker.send_async(Greet).unwrap();
    assert_eq!(reply.state(), ReplyState::Created);
    assert_eq!(executor.submitted.load(Ordering::SeqCst), 0);

    let subscription = reply.subscribe();
    assert_eq!(executor.submitted.load(Ordering::SeqCst), 1);
    assert_eq!(subscription.single(None).unwrap(), "hello");

    // Dropping an unsubscribed reply never submits anything.
    drop(broker.send_async(Greet).unwrap());
    assert_eq!(executor.submitted.load(Ordering::SeqCst), 1);
}

#[test]
fn test_native_reply_is_returned_unchanged() {
    let broker = broker_with(registry(), ContextPropagator::local());
    let values = broker.send_async(Pick).unwrap().collect_all().unwrap();
    assert_eq!(values, vec!["A", "B"]);
}

#[test]
fn test_fallback_reply_resolves_multiple_emissions() {
    let broker = broker_with(registry(), ContextPropagator::local());
    let reply = broker.send_async(Pick).unwrap();
    assert_eq!(reply.wait_for(&Pick).unwrap(), "F");
}

#[test]
fn test_multiple_emissions_without_fallback_fail() {
    let broker = broker_with(registry(), ContextPropagator::local());
    let reply = broker.send_async(PickStrict).unwrap();
    assert!(matches!(
        reply.wait_for(&PickStrict),
        Err(BrokerError::AmbiguousReply { count: 2, .. })
    ));
}

#[test]
fn test_handler_failure_reaches_subscriber() {
    let broker = broker_with(registry(), ContextPropagator::local());
    let err = broker
        .send_async(Explode("late".into()))
        .unwrap()
        .wait()
        .unwrap_err();
    let cause = err.into_handler_error().unwrap();
    assert_eq!(cause.downcast_ref::<Boom>(), Some(&Boom("late".into())));
}

#[test]
fn test_handler_panic_becomes_error() {
    let broker = broker_with(registry(), ContextPropagator::local());
    match broker.send_async(Panic).unwrap().wait() {
        Err(BrokerError::HandlerPanicked { handler, message }) => {
            assert_eq!(handler, "panic");
            assert!(message.contains("handler exploded"));
        }
        other => panic!("expected HandlerPanicked, got {other:?}"),
    }

    // The pool survives the panic.
    assert_eq!(broker.send_async(Greet).unwrap().wait().unwrap(), "hello");
}

#[test]
fn test_context_is_copied_to_worker_and_cleared() {
    let propagator = ContextPropagator::local();
    let (leaks, leak_rx) = mpsc::channel();
    let executor = Arc::new(LeakCheckingExecutor {
        inner: pool(),
        propagator: propagator.clone(),
        submitted: AtomicUsize::new(0),
        leaks,
    });

    let observer = propagator.clone();
    let mut registry = HandlerRegistry::new();
    registry.register_fn("whoami", move |_: &Greet| {
        let ctx = observer.current()?;
        // Mutating the worker's copy must not reach the caller's context.
        ctx.set_serializable("seen-by-worker", Some(true));
        Ok(ctx
            .get_as::<String>("user")
            .map(|u| (*u).clone())
            .unwrap_or_default())
    });
    let broker = AsyncMessageBroker::new(Arc::new(registry), executor, propagator.clone());

    let ctx = Context::new();
    ctx.set_serializable("user", Some("ada".to_string()));
    propagator.set(ctx.clone());

    assert_eq!(broker.send_async(Greet).unwrap().wait().unwrap(), "ada");
    assert!(!ctx.contains("seen-by-worker"));

    let leaked = leak_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(!leaked, "context leaked onto the worker thread");
    propagator.reset();
}

/// Reports the `user` attribute seen before and after parking for `millis`.
struct Nap {
    millis: u64,
}

impl Message for Nap {
    type Reply = String;
}

#[test]
fn test_parked_handlers_keep_their_own_context() {
    let _tracing = TestTracing::init();
    let propagator = ContextPropagator::local();
    let observer = propagator.clone();
    let mut registry = HandlerRegistry::new();
    registry.register_fn("nap", move |m: &Nap| {
        let user = || {
            observer
                .try_current()
                .and_then(|c| c.get_as::<String>("user"))
                .map(|u| (*u).clone())
        };
        let before = user();
        may::coroutine::sleep(Duration::from_millis(m.millis));
        let after = user();
        Ok(format!("{before:?}->{after:?}"))
    });
    let broker = broker_with(registry, propagator.clone());

    let request = |user: &str, millis: u64| {
        let ctx = Context::new();
        ctx.set_serializable("user", Some(user.to_string()));
        propagator.set(ctx);
        let subscription = broker.send_async(Nap { millis }).unwrap().subscribe();
        propagator.reset();
        subscription
    };

    // Both handlers are parked at the same time on the two workers.
    let a = request("A", 20);
    let b = request("B", 200);
    assert_eq!(a.single(None).unwrap(), r#"Some("A")->Some("A")"#);
    assert_eq!(b.single(None).unwrap(), r#"Some("B")->Some("B")"#);

    // Later context-free requests reuse both workers and must start empty.
    for _ in 0..4 {
        let reply = broker.send_async(Nap { millis: 5 }).unwrap();
        assert_eq!(reply.wait().unwrap(), "None->None");
    }
}

#[test]
fn test_handler_without_context_fails_with_no_context() {
    let propagator = ContextPropagator::local();
    let observer = propagator.clone();
    let mut registry = HandlerRegistry::new();
    registry.register_fn("needs-context", move |_: &Greet| {
        observer.current()?;
        Ok(String::new())
    });
    let broker = broker_with(registry, propagator);

    let err = broker.send_async(Greet).unwrap().wait().unwrap_err();
    let cause = err.into_handler_error().unwrap();
    assert!(matches!(
        cause.downcast_ref::<BrokerError>(),
        Some(BrokerError::NoContext)
    ));
}

#[test]
fn test_each_subscription_reexecutes() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let mut registry = HandlerRegistry::new();
    registry.register_fn("count", move |_: &Greet| {
        Ok(counter.fetch_add(1, Ordering::SeqCst).to_string())
    });
    let broker = broker_with(registry, ContextPropagator::local());

    assert_eq!(broker.send_async(Greet).unwrap().wait().unwrap(), "0");
    assert_eq!(broker.send_async(Greet).unwrap().wait().unwrap(), "1");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_native_async_handler_emitting_from_worker() {
    struct Tick(u8);
    impl Message for Tick {
        type Reply = u8;
    }

    let mut registry = HandlerRegistry::new();
    registry.register_async_fn("tick", |m: &Tick| {
        let n = m.0;
        AsyncReply::of::<Tick>(move |emitter| {
            std::thread::spawn(move || {
                for i in 0..n {
                    emitter.next(i);
                }
                emitter.complete();
            });
        })
    });
    let broker = broker_with(registry, ContextPropagator::local());

    assert_eq!(broker.send_async(Tick(3)).unwrap().collect_all().unwrap(), vec![0, 1, 2]);
    assert_eq!(broker.send(Tick(1)).unwrap(), 0);
    assert!(matches!(broker.send(Tick(0)), Err(BrokerError::EmptyReply(_))));
}

#[test]
fn test_from_config_uses_overlap_policy() {
    may::config().set_workers(2);
    let config = BrokerConfig::new(
        WorkerPoolConfig::new("config-tests", 1, 0x10000),
        HandlerOverlap::Reject,
    );
    let mut registry = HandlerRegistry::new();
    registry
        .register_fn("a", |_: &Greet| Ok("a".to_string()))
        .register_fn("b", |_: &Greet| Ok("b".to_string()));

    let broker =
        AsyncMessageBroker::from_config(Arc::new(registry), &config, ContextPropagator::local())
            .unwrap();
    assert!(matches!(
        broker.send_async(Greet),
        Err(BrokerError::AmbiguousHandlers { .. })
    ));
}
