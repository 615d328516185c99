//! Middleware layer.
//!
//! Middleware wraps a handler to add one cross-cutting concern without
//! changing the handler's contract. Every layer here forwards the inner
//! handler's `Result` untouched; only [`Authorize`] ever produces an error of
//! its own, and it does so *instead of* calling the inner handler.
//!
//! | Layer | Concern |
//! |---|---|
//! | [`Authorize`] | short-circuit on a context flag |
//! | [`Logging`] | one `tracing` record per invocation, with elapsed time |
//! | [`Instrument`] | calls, errors, in-flight and duration metrics |
//!
//! # Ordering
//!
//! [`Chain`] applies layers outermost-first, in the order they were added.
//! The reference stack is:
//!
//! ```text
//! caller
//!   → Authorize          rejects before anything is measured or logged
//!     → Logging          elapsed time includes instrumentation overhead
//!       → Instrument     elapsed time is the business handler alone
//!         → handler
//! ```
//!
//! Any order is valid; it only changes whose overhead each timer includes.
//! Each layer keeps its own clock.

pub mod authorize;
pub mod instrument;
pub mod logging;

use crate::handler::{BoxedHandler, Handler, boxed};

pub use authorize::Authorize;
pub use instrument::Instrument;
pub use logging::Logging;

/// Something that wraps a handler into a new handler.
///
/// Implemented for the built-in layers and for any
/// `Fn(BoxedHandler) -> BoxedHandler`.
pub trait Layer: Send + Sync {
    fn wrap(&self, next: BoxedHandler) -> BoxedHandler;
}

impl<F> Layer for F
where
    F: Fn(BoxedHandler) -> BoxedHandler + Send + Sync,
{
    fn wrap(&self, next: BoxedHandler) -> BoxedHandler {
        self(next)
    }
}

/// An ordered list of layers, applied outermost-first.
///
/// ```rust
/// use handlers::{Chain, Registry, MetricSet, handler_fn};
/// use handlers::middleware::{Authorize, Instrument, Logging};
///
/// let registry = Registry::new();
/// let metrics = MetricSet::must_register(&registry, "example", "onboarding");
///
/// let start = Chain::new()
///     .layer(Authorize::new())
///     .layer(Logging::new("start"))
///     .layer(Instrument::new("start", &metrics))
///     .around(handler_fn(|_ctx, source| async move {
///         Ok::<_, handlers::Error>(source.into_bytes())
///     }));
/// # let _ = start;
/// ```
#[derive(Default)]
pub struct Chain {
    layers: Vec<Box<dyn Layer>>,
}

impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `layer` inside every layer added so far.
    pub fn layer(mut self, layer: impl Layer + 'static) -> Self {
        self.layers.push(Box::new(layer));
        self
    }

    /// Wraps `handler` in every layer and returns the composed handler.
    pub fn around(&self, handler: impl Handler) -> BoxedHandler {
        self.layers
            .iter()
            .rev()
            .fold(boxed(handler), |next, layer| layer.wrap(next))
    }
}
