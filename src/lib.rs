//! # handlers
//!
//! Business logic as transport-agnostic handlers. Cross-cutting concerns
//! are layers wrapped around them.
//!
//! ## The contract
//!
//! A handler is one operation over bytes in and bytes out:
//!
//! ```text
//! (Context, &mut Sink, Source) -> Result<(), Error>
//! ```
//!
//! The transport that produced the request (a GraphQL resolver, an HTTP
//! route, a queue consumer) is not our concern. Neither is the store the
//! handler talks to. What is ours:
//!
//! - **Two error kinds, no more** — [`ClientError`] for the caller's
//!   mistakes, [`ServerError`] for ours. Middleware never looks deeper.
//! - **Layers** — [`Authorize`](middleware::Authorize),
//!   [`Logging`](middleware::Logging) and
//!   [`Instrument`](middleware::Instrument), stacked with [`Chain`].
//! - **Metrics** — `calls_total`, `errors_total`, `in_flight_total` and
//!   `request_duration_milliseconds`, keyed by `method`, in a [`Registry`].
//! - **One dispatch point** — [`execute`] turns the result into an
//!   [`Outcome`].
//!
//! ## Quick start
//!
//! ```rust
//! use handlers::{Chain, Context, Error, MetricSet, Outcome, Registry, execute, handler_fn};
//! use handlers::middleware::{Authorize, Instrument, Logging};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! // Once, at startup. A name collision here is fatal.
//! let registry = Registry::new();
//! let metrics = MetricSet::must_register(&registry, "example", "onboarding");
//!
//! let start = Chain::new()
//!     .layer(Authorize::new())
//!     .layer(Logging::new("start"))
//!     .layer(Instrument::new("start", &metrics))
//!     .around(handler_fn(|_ctx, _source| async {
//!         Err::<bytes::Bytes, _>(Error::client("3c157e31", "wrong username"))
//!     }));
//!
//! let ctx = Context::background().with_value("is_admin", true);
//! match execute(&start, ctx, &()).await {
//!     Outcome::Success(_) => {}
//!     Outcome::Rejected(e) => println!("Input Error: {}", e.message),
//!     Outcome::Failed(_) => println!("Internal Error"),
//! }
//!
//! assert_eq!(metrics.calls.get("start"), 1);
//! assert_eq!(metrics.errors.get("start"), 1);
//! # }
//! ```

mod config;
mod context;
mod error;
mod handler;
mod payload;
mod registry;
mod root;

pub mod middleware;

pub use config::{Config, ConfigError};
pub use context::{CANCELLED_ID, Context, DEADLINE_EXCEEDED_ID};
pub use error::{BoxError, ClientError, Error, ErrorKind, ServerError};
pub use handler::{BoxedHandler, FnHandler, Handler, boxed, handler_fn};
pub use middleware::{Chain, Layer};
pub use payload::{DECODE_ID, ENCODE_ID, Sink, Source};
pub use registry::{
    Collector, CounterVec, DEFAULT_BUCKETS, GaugeVec, HistogramSnapshot, HistogramVec, METHOD_LABEL,
    MetricSet, Opts, Registry, RegistryError,
};
pub use root::{Outcome, execute};
pub use tokio_util::sync::CancellationToken;
