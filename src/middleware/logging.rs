//! Completion logging middleware.
//!
//! Emits exactly one `tracing` event per invocation, after the inner handler
//! returns. Nothing is logged on the way in.
//!
//! | Outcome | Level | `outcome` field |
//! |---|---|---|
//! | `Ok(())` | `INFO` | `ok` |
//! | `ClientError` | `INFO` | `client_error` |
//! | `ServerError` | `WARN` | `server_error` |
//! | never returned (panic, dropped future) | `WARN` | `abandoned` |
//!
//! Example output with the default `fmt` subscriber:
//!
//! ```text
//! INFO handlers::middleware::logging: handler completed method="start" outcome="client_error" elapsed_ms=0.041 elapsed_ns=41000
//! ```

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{info, warn};

use super::Layer;
use crate::context::Context;
use crate::error::{Error, ErrorKind};
use crate::handler::{BoxedHandler, Handler};
use crate::payload::{Sink, Source};

/// Logs the elapsed time of every invocation under an operation name.
pub struct Logging {
    method: Arc<str>,
}

impl Logging {
    pub fn new(method: impl Into<String>) -> Self {
        Self { method: Arc::from(method.into()) }
    }
}

impl Layer for Logging {
    fn wrap(&self, next: BoxedHandler) -> BoxedHandler {
        Arc::new(Logged { next, method: Arc::clone(&self.method) })
    }
}

struct Logged {
    next: BoxedHandler,
    method: Arc<str>,
}

#[async_trait]
impl Handler for Logged {
    async fn call(&self, ctx: Context, sink: &mut Sink, source: Source) -> Result<(), Error> {
        let mut record = Record { method: &self.method, start: Instant::now(), outcome: None };
        let result = self.next.call(ctx, sink, source).await;
        record.outcome = Some(result.as_ref().map(|_| ()).map_err(Error::kind));
        result
    }
}

/// Emits the event on drop so abandoned invocations are logged too.
struct Record<'a> {
    method: &'a str,
    start: Instant,
    outcome: Option<Result<(), ErrorKind>>,
}

impl Drop for Record<'_> {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        let elapsed_ns = elapsed.as_nanos();
        let method = self.method;

        match self.outcome {
            Some(Ok(())) => {
                info!(method, outcome = "ok", elapsed_ms, elapsed_ns, "handler completed")
            }
            Some(Err(ErrorKind::Client)) => {
                info!(method, outcome = "client_error", elapsed_ms, elapsed_ns, "handler completed")
            }
            Some(Err(ErrorKind::Server)) => {
                warn!(method, outcome = "server_error", elapsed_ms, elapsed_ns, "handler completed")
            }
            None => warn!(
                method,
                outcome = "abandoned",
                elapsed_ms,
                elapsed_ns,
                "handler abandoned before completion"
            ),
        }
    }
}
