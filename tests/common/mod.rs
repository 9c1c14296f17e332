#![allow(dead_code)]

pub mod messages {
    use msgbroker::{Command, Message, Query};

    /// Query answered with a fixed greeting.
    pub struct Greet;

    impl Message for Greet {
        type Reply = String;
    }

    impl Query for Greet {}

    /// Query whose handler emits several values; declares a fallback.
    pub struct Pick;

    impl Message for Pick {
        type Reply = &'static str;

        fn fallback_reply(&self) -> Option<&'static str> {
            Some("F")
        }
    }

    /// Same as `Pick` without a fallback.
    pub struct PickStrict;

    impl Message for PickStrict {
        type Reply = &'static str;
    }

    /// Command that fails in its handler.
    pub struct Explode(pub String);

    impl Message for Explode {
        type Reply = ();
    }

    impl Command for Explode {}

    /// Command whose handler panics.
    pub struct Panic;

    impl Message for Panic {
        type Reply = ();
    }

    /// Never registered.
    pub struct Orphan;

    impl Message for Orphan {
        type Reply = u32;
    }
}

pub mod sources {
    use msgbroker::{HandlerEntry, HandlerRegistry, HandlerSource};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Wraps a registry and counts how many times it was enumerated.
    pub struct CountingSource {
        inner: HandlerRegistry,
        scans: AtomicUsize,
    }

    impl CountingSource {
        pub fn new(inner: HandlerRegistry) -> Arc<Self> {
            Arc::new(Self {
                inner,
                scans: AtomicUsize::new(0),
            })
        }

        pub fn scans(&self) -> usize {
            self.scans.load(Ordering::SeqCst)
        }
    }

    impl HandlerSource for CountingSource {
        fn handlers(&self) -> Vec<Arc<HandlerEntry>> {
            self.scans.fetch_add(1, Ordering::SeqCst);
            self.inner.handlers()
        }
    }
}

pub mod fixtures {
    use super::messages::*;
    use msgbroker::{AsyncReply, HandlerRegistry};

    /// Error type raised by the `Explode` handler, so tests can downcast it.
    #[derive(Debug, PartialEq, Eq)]
    pub struct Boom(pub String);

    impl std::fmt::Display for Boom {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "boom: {}", self.0)
        }
    }

    impl std::error::Error for Boom {}

    /// A registry covering every fixture message except `Orphan`.
    pub fn registry() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry
            .register_fn("greet", |_: &Greet| Ok("hello".to_string()))
            .register_async_fn("pick", |_: &Pick| {
                AsyncReply::from_values::<Pick>(vec!["A", "B"])
            })
            .register_async_fn("pick-strict", |_: &PickStrict| {
                AsyncReply::from_values::<PickStrict>(vec!["A", "B"])
            })
            .register_fn("explode", |m: &Explode| Err(Boom(m.0.clone()).into()))
            .register_fn("panic", |_: &Panic| -> anyhow::Result<()> {
                panic!("handler exploded")
            });
        registry
    }
}
