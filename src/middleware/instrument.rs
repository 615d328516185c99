//! Metrics middleware.
//!
//! For every invocation of the wrapped handler, labelled with the operation
//! name given to [`Instrument::new`]:
//!
//! 1. `calls_total` += 1, `in_flight_total` += 1, start the clock;
//! 2. call the inner handler;
//! 3. on any error, `errors_total` += 1;
//! 4. `in_flight_total` -= 1 and observe the elapsed milliseconds into
//!    `request_duration_milliseconds`;
//! 5. return the inner result unchanged.
//!
//! Step 4 lives in a drop guard, so it also runs when the inner handler
//! panics and unwinds, and when the caller drops the future mid-flight
//! (timeouts, cancelled `select!`). The gauge always returns to where it
//! started. An invocation that never produced a result is not counted as an
//! error.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use metrics::{Counter, Gauge, Histogram};

use super::Layer;
use crate::context::Context;
use crate::error::Error;
use crate::handler::{BoxedHandler, Handler};
use crate::payload::{Sink, Source};
use crate::registry::MetricSet;

/// Wraps a handler with the four [`MetricSet`] instruments.
pub struct Instrument {
    method: String,
    metrics: MetricSet,
}

impl Instrument {
    pub fn new(method: impl Into<String>, metrics: &MetricSet) -> Self {
        Self { method: method.into(), metrics: metrics.clone() }
    }
}

impl Layer for Instrument {
    fn wrap(&self, next: BoxedHandler) -> BoxedHandler {
        Arc::new(Instrumented { next, probes: Probes::resolve(&self.metrics, &self.method) })
    }
}

/// Instrument handles already bound to one `method` label value.
struct Probes {
    calls: Counter,
    errors: Counter,
    in_flight: Gauge,
    duration: Histogram,
}

impl Probes {
    fn resolve(metrics: &MetricSet, method: &str) -> Self {
        Self {
            calls: metrics.calls.with_label_values(method),
            errors: metrics.errors.with_label_values(method),
            in_flight: metrics.in_flight.with_label_values(method),
            duration: metrics.duration.with_label_values(method),
        }
    }
}

struct Instrumented {
    next: BoxedHandler,
    probes: Probes,
}

#[async_trait]
impl Handler for Instrumented {
    async fn call(&self, ctx: Context, sink: &mut Sink, source: Source) -> Result<(), Error> {
        self.probes.calls.increment(1);
        self.probes.in_flight.increment(1.0);
        let _settle = Settle { probes: &self.probes, start: Instant::now() };

        let result = self.next.call(ctx, sink, source).await;
        if result.is_err() {
            self.probes.errors.increment(1);
        }
        result
    }
}

/// Runs step 4 exactly once, however the invocation ends.
struct Settle<'a> {
    probes: &'a Probes,
    start: Instant,
}

impl Drop for Settle<'_> {
    fn drop(&mut self) {
        self.probes.in_flight.decrement(1.0);
        self.probes.duration.record(self.start.elapsed().as_secs_f64() * 1000.0);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::handler::handler_fn;
    use crate::registry::Registry;

    fn metrics() -> MetricSet {
        MetricSet::must_register(&Registry::new(), "test", "instrument")
    }

    fn returning(result: fn() -> Result<Bytes, Error>) -> BoxedHandler {
        Arc::new(handler_fn(move |_ctx, _source| async move { result() }))
    }

    async fn invoke(h: &BoxedHandler) -> Result<(), Error> {
        h.call(Context::background(), &mut Sink::new(), Source::default()).await
    }

    #[tokio::test]
    async fn success_counts_a_call_but_no_error() {
        let m = metrics();
        let h = Instrument::new("start", &m).wrap(returning(|| Ok(Bytes::new())));

        invoke(&h).await.unwrap();

        assert_eq!(m.calls.get("start"), 1);
        assert_eq!(m.errors.get("start"), 0);
        assert_eq!(m.in_flight.get("start"), 0.0);
        let snap = m.duration.snapshot("start").unwrap();
        assert_eq!(snap.count, 1);
        assert!(snap.sum >= 0.0);
    }

    #[tokio::test]
    async fn either_error_kind_counts_once_and_passes_through() {
        let m = metrics();
        let layer = Instrument::new("start", &m);
        let client = layer.wrap(returning(|| Err(Error::client("c-1", "bad input"))));
        let server = layer.wrap(returning(|| Err(Error::server("s-1", "db down"))));

        let err = invoke(&client).await.unwrap_err();
        assert!(matches!(&err, Error::Client(e) if e.id == "c-1"));
        let err = invoke(&server).await.unwrap_err();
        assert!(matches!(&err, Error::Server(e) if e.id == "s-1"));

        assert_eq!(m.calls.get("start"), 2);
        assert_eq!(m.errors.get("start"), 2);
        assert_eq!(m.in_flight.get("start"), 0.0);
        assert_eq!(m.duration.snapshot("start").unwrap().count, 2);
    }

    #[tokio::test]
    async fn labels_are_independent() {
        let m = metrics();
        let start = Instrument::new("start", &m).wrap(returning(|| Ok(Bytes::new())));
        let finish =
            Instrument::new("finish", &m).wrap(returning(|| Err(Error::client("x", "no"))));

        invoke(&start).await.unwrap();
        invoke(&start).await.unwrap();
        invoke(&finish).await.unwrap_err();

        assert_eq!((m.calls.get("start"), m.errors.get("start")), (2, 0));
        assert_eq!((m.calls.get("finish"), m.errors.get("finish")), (1, 1));
    }

    #[tokio::test]
    async fn gauge_tracks_concurrent_invocations() {
        let m = metrics();
        let (release, gate) = tokio::sync::watch::channel(false);
        let inner = handler_fn(move |_ctx, _source| {
            let mut gate = gate.clone();
            async move {
                let _ = gate.wait_for(|open| *open).await;
                Ok::<_, Error>(Bytes::new())
            }
        });
        let h = Instrument::new("start", &m).wrap(Arc::new(inner));

        let tasks: Vec<_> = (0..3)
            .map(|_| {
                let h = Arc::clone(&h);
                tokio::spawn(async move { invoke(&h).await })
            })
            .collect();

        while m.in_flight.get("start") < 3.0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(m.calls.get("start"), 3);

        release.send(true).unwrap();
        for t in tasks {
            t.await.unwrap().unwrap();
        }
        assert_eq!(m.in_flight.get("start"), 0.0);
        assert_eq!(m.duration.snapshot("start").unwrap().count, 3);
    }

    #[tokio::test]
    async fn panic_still_settles_the_gauge() {
        let m = metrics();
        let h = Instrument::new("start", &m).wrap(Arc::new(handler_fn(|_ctx, _source| async {
            if true {
                panic!("contract violation");
            }
            Ok::<_, Error>(Bytes::new())
        })));

        let joined = tokio::spawn(async move { invoke(&h).await }).await;
        assert!(joined.unwrap_err().is_panic());

        assert_eq!(m.calls.get("start"), 1);
        assert_eq!(m.errors.get("start"), 0);
        assert_eq!(m.in_flight.get("start"), 0.0);
        assert_eq!(m.duration.snapshot("start").unwrap().count, 1);
    }

    #[tokio::test]
    async fn dropped_future_still_settles_the_gauge() {
        let m = metrics();
        let h = Instrument::new("start", &m).wrap(Arc::new(handler_fn(|_ctx, _source| async {
            std::future::pending::<()>().await;
            Ok::<_, Error>(Bytes::new())
        })));

        let timed_out = tokio::time::timeout(Duration::from_millis(10), invoke(&h)).await;
        assert!(timed_out.is_err());

        assert_eq!(m.calls.get("start"), 1);
        assert_eq!(m.in_flight.get("start"), 0.0);
        assert_eq!(m.duration.snapshot("start").unwrap().count, 1);
    }
}
