// Wire format for the pylon session protocol.
//
// Every frame starts with a single message-type byte. Request and reply frames
// carry a u32 request id next, then the topic (u8 length + UTF-8 bytes), then the
// payload (u32 length + bytes). All integers are big-endian.
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::ops::Range;

pub mod codec;

pub use codec::{BytesCodec, CodecError, JsonCodec, PayloadCodec, Utf8Codec};

/// Largest topic the single length byte can describe.
pub const MAX_TOPIC_LEN: usize = u8::MAX as usize;
/// Default cap applied to declared payload lengths on decode.
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 16 * 1024 * 1024;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),
    #[error("topic is {0} bytes, limit is 255")]
    TopicTooLong(usize),
    #[error("payload length {len} exceeds limit {max}")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("incomplete frame")]
    Incomplete,
    #[error("topic is not valid utf-8")]
    InvalidTopic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Heartbeat = 1,
    Disconnect = 2,
    Subscribe = 3,
    Data = 4,
    Unsubscribe = 5,
    DataRequest = 6,
    Reply = 7,
}

impl MessageType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn has_request_id(self) -> bool {
        matches!(self, MessageType::DataRequest | MessageType::Reply)
    }

    pub fn has_topic(self) -> bool {
        !matches!(self, MessageType::Heartbeat | MessageType::Disconnect)
    }

    pub fn has_payload(self) -> bool {
        matches!(
            self,
            MessageType::Data | MessageType::DataRequest | MessageType::Reply
        )
    }
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            1 => MessageType::Heartbeat,
            2 => MessageType::Disconnect,
            3 => MessageType::Subscribe,
            4 => MessageType::Data,
            5 => MessageType::Unsubscribe,
            6 => MessageType::DataRequest,
            7 => MessageType::Reply,
            other => return Err(Error::UnknownMessageType(other)),
        })
    }
}

/// One complete protocol message.
///
/// ```
/// use bytes::Bytes;
/// use pylon_wire::{DEFAULT_MAX_PAYLOAD_BYTES, Frame};
///
/// let frame = Frame::Data {
///     topic: "orders".to_string(),
///     payload: Bytes::from_static(b"hello"),
/// };
/// let mut encoded = frame.encode().expect("encode");
/// let decoded = Frame::decode(&mut encoded, DEFAULT_MAX_PAYLOAD_BYTES).expect("decode");
/// assert_eq!(decoded, frame);
/// assert!(encoded.is_empty());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Heartbeat,
    // Logout from the client, or the server's acknowledgement of one.
    Disconnect,
    Subscribe {
        topic: String,
    },
    Unsubscribe {
        topic: String,
    },
    Data {
        topic: String,
        payload: Bytes,
    },
    DataRequest {
        request_id: u32,
        topic: String,
        payload: Bytes,
    },
    Reply {
        request_id: u32,
        topic: String,
        payload: Bytes,
    },
}

impl Frame {
    /// Assemble a frame from already-read parts. Fields the message type does not
    /// carry are ignored.
    pub fn from_parts(
        message_type: MessageType,
        request_id: u32,
        topic: String,
        payload: Bytes,
    ) -> Self {
        match message_type {
            MessageType::Heartbeat => Frame::Heartbeat,
            MessageType::Disconnect => Frame::Disconnect,
            MessageType::Subscribe => Frame::Subscribe { topic },
            MessageType::Unsubscribe => Frame::Unsubscribe { topic },
            MessageType::Data => Frame::Data { topic, payload },
            MessageType::DataRequest => Frame::DataRequest {
                request_id,
                topic,
                payload,
            },
            MessageType::Reply => Frame::Reply {
                request_id,
                topic,
                payload,
            },
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Frame::Heartbeat => MessageType::Heartbeat,
            Frame::Disconnect => MessageType::Disconnect,
            Frame::Subscribe { .. } => MessageType::Subscribe,
            Frame::Unsubscribe { .. } => MessageType::Unsubscribe,
            Frame::Data { .. } => MessageType::Data,
            Frame::DataRequest { .. } => MessageType::DataRequest,
            Frame::Reply { .. } => MessageType::Reply,
        }
    }

    pub fn topic(&self) -> Option<&str> {
        match self {
            Frame::Heartbeat | Frame::Disconnect => None,
            Frame::Subscribe { topic }
            | Frame::Unsubscribe { topic }
            | Frame::Data { topic, .. }
            | Frame::DataRequest { topic, .. }
            | Frame::Reply { topic, .. } => Some(topic),
        }
    }

    pub fn payload(&self) -> Option<&Bytes> {
        match self {
            Frame::Data { payload, .. }
            | Frame::DataRequest { payload, .. }
            | Frame::Reply { payload, .. } => Some(payload),
            _ => None,
        }
    }

    pub fn request_id(&self) -> Option<u32> {
        match self {
            Frame::DataRequest { request_id, .. } | Frame::Reply { request_id, .. } => {
                Some(*request_id)
            }
            _ => None,
        }
    }

    pub fn encoded_len(&self) -> usize {
        let message_type = self.message_type();
        let mut len = 1;
        if message_type.has_request_id() {
            len += 4;
        }
        if let Some(topic) = self.topic() {
            len += 1 + topic.len();
        }
        if let Some(payload) = self.payload() {
            len += 4 + payload.len();
        }
        len
    }

    /// Append the encoded frame to `buf`. Nothing is written when validation fails.
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<()> {
        if let Some(topic) = self.topic() {
            validate_topic(topic)?;
        }
        if let Some(payload) = self.payload() {
            check_payload_len(payload.len(), u32::MAX as usize)?;
        }
        buf.reserve(self.encoded_len());
        buf.put_u8(self.message_type().as_u8());
        if let Some(request_id) = self.request_id() {
            buf.put_u32(request_id);
        }
        if let Some(topic) = self.topic() {
            buf.put_u8(topic.len() as u8);
            buf.put_slice(topic.as_bytes());
        }
        if let Some(payload) = self.payload() {
            buf.put_u32(payload.len() as u32);
            buf.put_slice(payload);
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode one frame from the front of `buf`.
    ///
    /// On `Error::Incomplete` the buffer is left untouched so the caller can read
    /// more bytes and retry. Declared payload lengths above `max_payload_bytes` are
    /// rejected before anything is sliced out.
    pub fn decode(buf: &mut Bytes, max_payload_bytes: usize) -> Result<Self> {
        let mut cursor: &[u8] = buf.as_ref();
        let total = cursor.len();
        if !cursor.has_remaining() {
            return Err(Error::Incomplete);
        }
        let message_type = MessageType::try_from(cursor.get_u8())?;

        let mut request_id = 0;
        if message_type.has_request_id() {
            need(cursor, 4)?;
            request_id = cursor.get_u32();
        }

        let mut topic_range: Option<Range<usize>> = None;
        if message_type.has_topic() {
            need(cursor, 1)?;
            let len = cursor.get_u8() as usize;
            need(cursor, len)?;
            let start = total - cursor.remaining();
            cursor.advance(len);
            topic_range = Some(start..start + len);
        }

        let mut payload_range: Option<Range<usize>> = None;
        if message_type.has_payload() {
            need(cursor, 4)?;
            let len = cursor.get_u32() as usize;
            check_payload_len(len, max_payload_bytes)?;
            need(cursor, len)?;
            let start = total - cursor.remaining();
            cursor.advance(len);
            payload_range = Some(start..start + len);
        }

        let consumed = total - cursor.remaining();
        let frame = buf.split_to(consumed);
        let topic = match topic_range {
            Some(range) => topic_from_bytes(&frame[range])?,
            None => String::new(),
        };
        let payload = payload_range
            .map(|range| frame.slice(range))
            .unwrap_or_default();
        Ok(Self::from_parts(message_type, request_id, topic, payload))
    }
}

fn need(cursor: &[u8], len: usize) -> Result<()> {
    if cursor.len() < len {
        return Err(Error::Incomplete);
    }
    Ok(())
}

pub fn validate_topic(topic: &str) -> Result<()> {
    if topic.len() > MAX_TOPIC_LEN {
        return Err(Error::TopicTooLong(topic.len()));
    }
    Ok(())
}

pub fn topic_from_bytes(bytes: &[u8]) -> Result<String> {
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|_| Error::InvalidTopic)
}

pub fn check_payload_len(len: usize, max_payload_bytes: usize) -> Result<()> {
    let max = max_payload_bytes.min(u32::MAX as usize);
    if len > max {
        return Err(Error::PayloadTooLarge { len, max });
    }
    Ok(())
}
