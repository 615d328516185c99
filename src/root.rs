//! Composition root: run a composed handler once and classify the result.
//!
//! This is the only place that branches on the error kind. The three
//! [`Outcome`] variants are the three caller-visible paths: show the result,
//! show the validation message, or show an opaque failure notice.

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{error, info};

use crate::context::Context;
use crate::error::{ClientError, Error, ServerError};
use crate::handler::Handler;
use crate::payload::{Sink, Source};

/// How one execution ended, from the caller's point of view.
#[derive(Debug)]
pub enum Outcome {
    /// The handler succeeded; these are the bytes it wrote.
    Success(Bytes),
    /// The caller's fault. Safe to show `message` to the caller.
    Rejected(ClientError),
    /// The system's fault. Show a generic notice; `id` and `cause` are for logs.
    Failed(ServerError),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Hydrates the success body into `T`, or hands back the error.
    pub fn decode<T: DeserializeOwned>(self) -> Result<T, Error> {
        match self {
            Self::Success(bytes) => Source::new(bytes).decode(),
            Self::Rejected(e) => Err(e.into()),
            Self::Failed(e) => Err(e.into()),
        }
    }

    fn from_result(result: Result<(), Error>, sink: Sink) -> Self {
        match result {
            Ok(()) => Self::Success(sink.freeze()),
            Err(Error::Client(e)) => Self::Rejected(e),
            Err(Error::Server(e)) => Self::Failed(e),
        }
    }
}

/// Serializes `request`, runs `handler` once, and classifies the result.
///
/// A request that cannot be serialized never reaches the handler; it comes
/// back as [`Outcome::Failed`].
pub async fn execute<H, R>(handler: &H, ctx: Context, request: &R) -> Outcome
where
    H: Handler + ?Sized,
    R: Serialize + ?Sized,
{
    let mut sink = Sink::new();
    let result = match Source::encode(request) {
        Ok(source) => handler.call(ctx, &mut sink, source).await,
        Err(e) => Err(e),
    };
    let outcome = Outcome::from_result(result, sink);

    match &outcome {
        Outcome::Success(body) => info!(bytes = body.len(), "request succeeded"),
        Outcome::Rejected(e) => info!(id = %e.id, message = %e.message, "request rejected"),
        Outcome::Failed(e) => match &e.cause {
            Some(cause) => {
                error!(id = %e.id, message = %e.message, cause = %cause, "request failed")
            }
            None => error!(id = %e.id, message = %e.message, "request failed"),
        },
    }
    outcome
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::handler::handler_fn;
    use crate::payload::DECODE_ID;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Greeting {
        name: String,
    }

    #[tokio::test]
    async fn success_carries_the_response() {
        let h = handler_fn(|_ctx, source: Source| async move {
            let req: Greeting = source.decode()?;
            let mut sink = Sink::new();
            sink.encode(&Greeting { name: format!("hello {}", req.name) })?;
            Ok::<_, Error>(sink.freeze())
        });

        let outcome = execute(&h, Context::background(), &Greeting { name: "alice".into() }).await;
        assert!(outcome.is_success());
        assert_eq!(outcome.decode::<Greeting>().unwrap(), Greeting { name: "hello alice".into() });
    }

    #[tokio::test]
    async fn kinds_map_to_distinct_outcomes() {
        let client = handler_fn(|_ctx, _source| async {
            Err::<Bytes, _>(Error::client("c", "wrong username"))
        });
        let server = handler_fn(|_ctx, _source| async {
            Err::<Bytes, _>(Error::server("s", "database connection failure").with_cause("timeout"))
        });

        match execute(&client, Context::background(), &()).await {
            Outcome::Rejected(e) => assert_eq!(e.message, "wrong username"),
            other => panic!("expected Rejected, got {other:?}"),
        }
        match execute(&server, Context::background(), &()).await {
            Outcome::Failed(e) => assert_eq!(e.id, "s"),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn request_of_the_wrong_shape_fails_inside_the_handler() {
        let h = handler_fn(|_ctx, source: Source| async move {
            let _: Greeting = source.decode()?;
            Ok::<_, Error>(Bytes::new())
        });

        match execute(&h, Context::background(), &42).await {
            Outcome::Failed(e) => assert_eq!(e.id, DECODE_ID),
            other => panic!("expected Failed, got {other:?}"),
        }
    }
}
