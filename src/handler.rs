//! Handler trait and type erasure.
//!
//! # What a handler is
//!
//! One business operation, with no idea how it was reached:
//!
//! ```text
//! (Context, &mut Sink, Source) -> Result<(), Error>
//! ```
//!
//! No transport, no metrics, no logging, no authorization. Those are applied
//! from the outside by wrapping (see [`middleware`](crate::middleware)).
//!
//! # How handlers are stored
//!
//! Every wrapper holds the next stage as a [`BoxedHandler`], an
//! `Arc<dyn Handler>`. Wrapping never mutates the inner handler; it produces
//! a new value that owns a reference to it:
//!
//! ```text
//! OnboardStart { stores }                        ← business handler
//!        ↓ Arc::new(..)
//! Arc<dyn Handler>                               ← BoxedHandler
//!        ↓ Instrument.wrap(next)
//! Arc<Instrumented { next, probes }>             ← another BoxedHandler
//! ```
//!
//! The cost per stage is one virtual call and one boxed future.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::context::Context;
use crate::error::Error;
use crate::payload::{Sink, Source};

/// A transport-agnostic operation.
///
/// Implement it on a struct that holds the operation's collaborators
/// (stores, clients), or use [`handler_fn`] for a closure.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn call(&self, ctx: Context, sink: &mut Sink, source: Source) -> Result<(), Error>;
}

/// A shared, type-erased handler.
pub type BoxedHandler = Arc<dyn Handler>;

#[async_trait]
impl<H: Handler + ?Sized> Handler for Arc<H> {
    async fn call(&self, ctx: Context, sink: &mut Sink, source: Source) -> Result<(), Error> {
        (**self).call(ctx, sink, source).await
    }
}

/// Erases a concrete handler.
pub fn boxed(handler: impl Handler) -> BoxedHandler {
    Arc::new(handler)
}

/// Turns an async closure into a [`Handler`].
///
/// The closure receives the context and the request payload and returns the
/// response bytes; they are written to the sink only on success.
///
/// ```rust
/// use bytes::Bytes;
/// use handlers::{Context, Error, Sink, Source, handler_fn, Handler};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let echo = handler_fn(|_ctx: Context, source: Source| async move {
///     Ok::<Bytes, Error>(source.into_bytes())
/// });
///
/// let mut sink = Sink::new();
/// echo.call(Context::background(), &mut sink, Source::new("hi")).await.unwrap();
/// assert_eq!(sink.as_bytes(), b"hi");
/// # }
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Context, Source) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Bytes, Error>> + Send + 'static,
{
    FnHandler(f)
}

/// Newtype returned by [`handler_fn`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Context, Source) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Bytes, Error>> + Send + 'static,
{
    async fn call(&self, ctx: Context, sink: &mut Sink, source: Source) -> Result<(), Error> {
        let body = (self.0)(ctx, source).await?;
        sink.write(&body);
        Ok(())
    }
}
