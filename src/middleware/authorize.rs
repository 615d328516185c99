//! Authorization middleware.
//!
//! Reads a boolean flag from the [`Context`] and decides whether the wrapped
//! handler runs at all:
//!
//! | Flag | Result |
//! |---|---|
//! | absent (or not a `bool`) | `ServerError`: the caller forgot to set it |
//! | `false` | `ClientError`: the caller may not do this |
//! | `true` | whatever the inner handler returns |
//!
//! No I/O, no logging. The only side effect is the context read.

use std::sync::Arc;

use async_trait::async_trait;

use super::Layer;
use crate::config::Config;
use crate::context::Context;
use crate::error::{ClientError, Error, ServerError};
use crate::handler::{BoxedHandler, Handler};
use crate::payload::{Sink, Source};

/// Context key read when no other key is configured.
pub const DEFAULT_KEY: &str = "is_admin";

/// Error id for a context that does not carry the flag.
pub const FLAG_MISSING_ID: &str = "authorization.flag_missing";

/// Error id for a caller whose flag is `false`.
pub const DENIED_ID: &str = "authorization.denied";

/// Gates a handler on a boolean context flag.
pub struct Authorize {
    key: Arc<str>,
}

impl Authorize {
    /// Reads [`DEFAULT_KEY`].
    pub fn new() -> Self {
        Self::with_key(DEFAULT_KEY)
    }

    pub fn with_key(key: impl Into<String>) -> Self {
        Self { key: Arc::from(key.into()) }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::with_key(config.authorization_key.clone())
    }
}

impl Default for Authorize {
    fn default() -> Self {
        Self::new()
    }
}

impl Layer for Authorize {
    fn wrap(&self, next: BoxedHandler) -> BoxedHandler {
        Arc::new(Authorized { next, key: Arc::clone(&self.key) })
    }
}

struct Authorized {
    next: BoxedHandler,
    key: Arc<str>,
}

#[async_trait]
impl Handler for Authorized {
    async fn call(&self, ctx: Context, sink: &mut Sink, source: Source) -> Result<(), Error> {
        let flag = ctx.value::<bool>(&self.key).copied();
        match flag {
            None => Err(ServerError::new(
                FLAG_MISSING_ID,
                "authorization flag missing from context",
            )
            .into()),
            Some(false) => Err(ClientError::new(DENIED_ID, "caller not authorized").into()),
            Some(true) => self.next.call(ctx, sink, source).await,
        }
    }
}
