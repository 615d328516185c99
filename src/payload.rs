//! Byte-level request source and response sink.
//!
//! The chain never looks inside a payload. Only the business handler decodes
//! its [`Source`] into a typed request and encodes its typed response into
//! the [`Sink`]. The encoding is JSON via `serde_json`.
//!
//! A payload that fails to decode or encode is a contract violation between
//! the caller and the handler, not a user mistake. Both directions surface
//! it the same way: a [`ServerError`] whose cause is the `serde_json` error.

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Error, ServerError};

/// Error id for a payload that could not be hydrated into the request type.
pub const DECODE_ID: &str = "payload.decode";

/// Error id for a value that could not be serialized.
pub const ENCODE_ID: &str = "payload.encode";

/// The serialized request handed to a handler.
///
/// Cloning shares the underlying buffer.
#[derive(Clone, Debug, Default)]
pub struct Source {
    bytes: Bytes,
}

impl Source {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self { bytes: bytes.into() }
    }

    /// Serializes `value` into a new source. Used by callers building a request.
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Self, Error> {
        serde_json::to_vec(value).map(Self::new).map_err(encode_failed)
    }

    /// Hydrates the payload into `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, Error> {
        serde_json::from_slice(&self.bytes).map_err(|e| {
            ServerError::new(DECODE_ID, "failed to decode payload").with_cause(e).into()
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }
}

/// Accumulates the serialized response written by a handler.
#[derive(Debug, Default)]
pub struct Sink {
    buf: BytesMut,
}

impl Sink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Appends `value` serialized as JSON.
    ///
    /// On failure the sink may hold a partial document; the caller discards
    /// the sink together with the error.
    pub fn encode<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), Error> {
        serde_json::to_writer((&mut self.buf).writer(), value).map_err(encode_failed)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Consumes the sink and returns the written bytes.
    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}

fn encode_failed(e: serde_json::Error) -> Error {
    ServerError::new(ENCODE_ID, "failed to encode payload").with_cause(e).into()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::error::ErrorKind;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct SignUp {
        username: String,
        email: Option<String>,
        age: u32,
        tags: Vec<String>,
        attributes: BTreeMap<String, i64>,
    }

    #[test]
    fn request_survives_the_byte_boundary() {
        let req = SignUp {
            username: "alice".into(),
            email: None,
            age: 31,
            tags: vec!["beta".into(), "eu".into()],
            attributes: BTreeMap::from([("score".into(), -4)]),
        };

        let source = Source::encode(&req).unwrap();
        let decoded: SignUp = source.decode().unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn malformed_payload_is_a_server_error() {
        let source = Source::new(&b"{\"username\": 7"[..]);
        let err = source.decode::<SignUp>().unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Server);
        assert_eq!(err.id(), DECODE_ID);
    }

    #[test]
    fn unencodable_value_is_a_server_error() {
        // JSON object keys must be strings.
        let value = BTreeMap::from([(vec![1u8], 1)]);
        let mut sink = Sink::new();
        let err = sink.encode(&value).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Server);
        assert_eq!(err.id(), ENCODE_ID);
        assert!(Source::encode(&value).is_err());
    }

    #[test]
    fn sink_collects_writes_in_order() {
        let mut sink = Sink::new();
        assert!(sink.is_empty());
        sink.write(b"[1,");
        sink.encode(&2).unwrap();
        sink.write(b"]");
        assert_eq!(&sink.freeze()[..], b"[1,2]");
    }
}
