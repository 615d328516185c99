//! Handler error taxonomy.
//!
//! Every handler returns `Result<(), Error>`. [`Error`] is closed over two
//! kinds and nothing else:
//!
//! | Kind | Meaning | Caller treatment |
//! |---|---|---|
//! | [`ClientError`] | bad input or a business-rule rejection | show the message, never alarm |
//! | [`ServerError`] | dependency down, invariant broken, anything else | opaque notice, alert |
//!
//! Middleware forwards both untouched. Only the composition root
//! ([`execute`](crate::execute)) branches on the kind, and it branches on the
//! kind alone: `id` exists to correlate a log line with a failure site.

use std::fmt;

/// Boxed underlying cause carried by either error kind.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Discriminant of an [`Error`], for callers that only need the kind.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ErrorKind {
    Client,
    Server,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client_error",
            Self::Server => "server_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure caused by the caller: invalid input or a rejected business rule.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct ClientError {
    pub id: String,
    pub message: String,
    #[source]
    pub cause: Option<BoxError>,
}

/// A failure inside the system: a dependency, a broken invariant, a bug.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct ServerError {
    pub id: String,
    pub message: String,
    #[source]
    pub cause: Option<BoxError>,
}

impl ClientError {
    pub fn new(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self { id: id.into(), message: message.into(), cause: None }
    }

    pub fn with_cause(mut self, cause: impl Into<BoxError>) -> Self {
        self.cause = Some(cause.into());
        self
    }
}

impl ServerError {
    pub fn new(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self { id: id.into(), message: message.into(), cause: None }
    }

    pub fn with_cause(mut self, cause: impl Into<BoxError>) -> Self {
        self.cause = Some(cause.into());
        self
    }
}

/// The error type returned by every [`Handler`](crate::Handler).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Server(#[from] ServerError),
}

impl Error {
    /// Shorthand for `Error::Client(ClientError::new(id, message))`.
    pub fn client(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Client(ClientError::new(id, message))
    }

    /// Shorthand for `Error::Server(ServerError::new(id, message))`.
    pub fn server(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Server(ServerError::new(id, message))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Client(_) => ErrorKind::Client,
            Self::Server(_) => ErrorKind::Server,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Client(e) => &e.id,
            Self::Server(e) => &e.id,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Client(e) => &e.message,
            Self::Server(e) => &e.message,
        }
    }

    /// Attaches an underlying cause without changing the kind.
    pub fn with_cause(self, cause: impl Into<BoxError>) -> Self {
        match self {
            Self::Client(e) => Self::Client(e.with_cause(cause)),
            Self::Server(e) => Self::Server(e.with_cause(cause)),
        }
    }
}
