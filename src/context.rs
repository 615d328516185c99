//! Immutable, derivable execution context.
//!
//! A [`Context`] travels from the caller through every middleware into the
//! business handler. It carries two things:
//!
//! - **values** — cross-cutting data (e.g. the authorization flag) looked up
//!   by a string key, so the handler signature never has to widen;
//! - **cancellation** — a token plus an optional deadline, shared with every
//!   context derived from it.
//!
//! Nothing ever mutates a context. `with_*` methods return a *derived* child
//! that points at its parent; siblings never see each other's values.
//!
//! ```text
//! background ── with_value("is_admin", true) ── with_timeout(2s) ── handler
//!                      ▲ lookups walk this chain innermost-first
//! ```

use std::any::Any;
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, ServerError};

/// Error id returned by [`Context::check`] after explicit cancellation.
pub const CANCELLED_ID: &str = "context.cancelled";

/// Error id returned by [`Context::check`] once the deadline has passed.
pub const DEADLINE_EXCEEDED_ID: &str = "context.deadline_exceeded";

type Value = Arc<dyn Any + Send + Sync>;

/// Cheap to clone: one `Arc` increment.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

struct Inner {
    parent: Option<Context>,
    entry: Option<(Cow<'static, str>, Value)>,
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// The root context: no values, no deadline, never cancelled on its own.
    pub fn background() -> Self {
        Self {
            inner: Arc::new(Inner {
                parent: None,
                entry: None,
                token: CancellationToken::new(),
                deadline: None,
            }),
        }
    }

    /// Derives a child that additionally carries `value` under `key`.
    ///
    /// A later `with_value` on the same key shadows this one for the child
    /// and its descendants only.
    pub fn with_value<T>(&self, key: impl Into<Cow<'static, str>>, value: T) -> Self
    where
        T: Any + Send + Sync,
    {
        let entry = (key.into(), Arc::new(value) as Value);
        self.derive(Some(entry), self.inner.token.clone(), self.inner.deadline)
    }

    /// Looks up the nearest value stored under `key`.
    ///
    /// Returns `None` if the key is absent *or* holds a value of another type.
    pub fn value<T: Any>(&self, key: &str) -> Option<&T> {
        let mut cur = Some(self);
        while let Some(ctx) = cur {
            if let Some((k, v)) = &ctx.inner.entry {
                if &**k == key {
                    return (**v).downcast_ref::<T>();
                }
            }
            cur = ctx.inner.parent.as_ref();
        }
        None
    }

    /// Derives a child with its own cancellation token.
    ///
    /// Cancelling the returned token cancels the child and everything derived
    /// from it. Cancelling the parent still cancels the child.
    pub fn with_cancel(&self) -> (Self, CancellationToken) {
        let token = self.inner.token.child_token();
        let ctx = self.derive(None, token.clone(), self.inner.deadline);
        (ctx, token)
    }

    /// Derives a child that expires at `deadline`, or at the parent's
    /// deadline if that is earlier.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.inner.deadline {
            Some(parent) => parent.min(deadline),
            None => deadline,
        };
        self.derive(None, self.inner.token.clone(), Some(deadline))
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// `true` once the token is cancelled or the deadline has passed.
    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled() || self.deadline_passed()
    }

    /// Resolves when the context is cancelled or its deadline passes.
    ///
    /// Long-running steps `select!` on this next to their own work.
    pub async fn cancelled(&self) {
        match self.inner.deadline {
            Some(deadline) => {
                tokio::select! {
                    () = self.inner.token.cancelled() => {}
                    () = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.inner.token.cancelled().await,
        }
    }

    /// Returns the `ServerError` a handler should bail out with, if any.
    pub fn check(&self) -> Result<(), Error> {
        if self.inner.token.is_cancelled() {
            return Err(ServerError::new(CANCELLED_ID, "context cancelled").into());
        }
        if self.deadline_passed() {
            return Err(ServerError::new(DEADLINE_EXCEEDED_ID, "context deadline exceeded").into());
        }
        Ok(())
    }

    fn deadline_passed(&self) -> bool {
        self.inner.deadline.is_some_and(|d| Instant::now() >= d)
    }

    fn derive(
        &self,
        entry: Option<(Cow<'static, str>, Value)>,
        token: CancellationToken,
        deadline: Option<Instant>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner { parent: Some(self.clone()), entry, token, deadline }),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys = Vec::new();
        let mut cur = Some(self);
        while let Some(ctx) = cur {
            if let Some((k, _)) = &ctx.inner.entry {
                keys.push(&**k);
            }
            cur = ctx.inner.parent.as_ref();
        }
        f.debug_struct("Context")
            .field("keys", &keys)
            .field("deadline", &self.inner.deadline)
            .field("cancelled", &self.inner.token.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn values_are_scoped_to_derived_children() {
        let root = Context::background();
        let admin = root.with_value("is_admin", true);
        let sibling = root.with_value("user", String::from("alice"));

        assert_eq!(admin.value::<bool>("is_admin"), Some(&true));
        assert_eq!(root.value::<bool>("is_admin"), None);
        assert_eq!(sibling.value::<bool>("is_admin"), None);
        assert_eq!(sibling.value::<String>("user").map(String::as_str), Some("alice"));
    }

    #[test]
    fn inner_value_shadows_outer() {
        let ctx = Context::background()
            .with_value("is_admin", true)
            .with_value("is_admin", false);
        assert_eq!(ctx.value::<bool>("is_admin"), Some(&false));
    }

    #[test]
    fn wrong_type_reads_as_absent() {
        let ctx = Context::background().with_value("is_admin", "yes");
        assert_eq!(ctx.value::<bool>("is_admin"), None);
    }

    #[tokio::test]
    async fn cancelling_parent_cancels_children() {
        let (parent, token) = Context::background().with_cancel();
        let child = parent.with_value("k", 1u32);

        assert!(!child.is_cancelled());
        token.cancel();
        assert!(child.is_cancelled());
        child.cancelled().await;

        let err = child.check().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Server);
        assert_eq!(err.id(), CANCELLED_ID);
    }

    #[tokio::test]
    async fn cancelling_child_leaves_parent_alone() {
        let parent = Context::background();
        let (child, token) = parent.with_cancel();
        token.cancel();

        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_fires_and_keeps_the_earlier_one() {
        let ctx = Context::background().with_timeout(Duration::from_millis(50));
        let looser = ctx.with_timeout(Duration::from_secs(60));
        assert_eq!(looser.deadline(), ctx.deadline());

        looser.cancelled().await;
        assert!(looser.is_cancelled());
        assert_eq!(looser.check().unwrap_err().id(), DEADLINE_EXCEEDED_ID);
    }
}
