//! Payload codecs: the pluggable encode/decode step between application
//! messages and frame payload bytes.
//!
//! Implementations must be deterministic and free of side effects; both ends of
//! a connection are expected to use the same codec.
use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::marker::PhantomData;

#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("payload for topic {topic} is not valid utf-8")]
    Utf8 {
        topic: String,
        #[source]
        source: std::string::FromUtf8Error,
    },
    #[error("failed to serialize payload")]
    Serialize(#[source] serde_json::Error),
    #[error("failed to deserialize payload for topic {topic}")]
    Deserialize {
        topic: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0}")]
    Other(String),
}

/// Symmetric message <-> bytes contract.
///
/// ```
/// use pylon_wire::codec::{PayloadCodec, Utf8Codec};
///
/// let codec = Utf8Codec;
/// let bytes = codec.encode(&"hello".to_string()).expect("encode");
/// assert_eq!(codec.decode("greetings", bytes).expect("decode"), "hello");
/// ```
pub trait PayloadCodec: Send + Sync + 'static {
    type Message: Send + Sync + 'static;

    fn encode(&self, message: &Self::Message) -> Result<Bytes, CodecError>;

    /// `topic` is the topic the payload arrived on, for codecs that route by topic.
    fn decode(&self, topic: &str, payload: Bytes) -> Result<Self::Message, CodecError>;
}

/// Pass-through codec for raw payloads.
#[derive(Debug, Default, Clone, Copy)]
pub struct BytesCodec;

impl PayloadCodec for BytesCodec {
    type Message = Bytes;

    fn encode(&self, message: &Bytes) -> Result<Bytes, CodecError> {
        Ok(message.clone())
    }

    fn decode(&self, _topic: &str, payload: Bytes) -> Result<Bytes, CodecError> {
        Ok(payload)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Utf8Codec;

impl PayloadCodec for Utf8Codec {
    type Message = String;

    fn encode(&self, message: &String) -> Result<Bytes, CodecError> {
        Ok(Bytes::copy_from_slice(message.as_bytes()))
    }

    fn decode(&self, topic: &str, payload: Bytes) -> Result<String, CodecError> {
        String::from_utf8(payload.to_vec()).map_err(|source| CodecError::Utf8 {
            topic: topic.to_string(),
            source,
        })
    }
}

/// JSON payloads through serde.
pub struct JsonCodec<T> {
    _message: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            _message: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for JsonCodec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("JsonCodec")
    }
}

impl<T> PayloadCodec for JsonCodec<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    type Message = T;

    fn encode(&self, message: &T) -> Result<Bytes, CodecError> {
        serde_json::to_vec(message)
            .map(Bytes::from)
            .map_err(CodecError::Serialize)
    }

    fn decode(&self, topic: &str, payload: Bytes) -> Result<T, CodecError> {
        serde_json::from_slice(&payload).map_err(|source| CodecError::Deserialize {
            topic: topic.to_string(),
            source,
        })
    }
}
