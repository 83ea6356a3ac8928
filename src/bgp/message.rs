use std::fmt;
use std::io;
use std::net::Ipv4Addr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use super::update::UpdateMessage;

pub const BGP_MARKER: [u8; 16] = [0xFF; 16];
pub const BGP_VERSION: u8 = 4;
pub const BGP_HEADER_LEN: usize = 19;
pub const BGP_MAX_MESSAGE_LEN: usize = 4096;
pub const OPEN_BODY_LEN: usize = 9;

/// Errors produced while decoding the wire format.
///
/// Every variant is fatal to the session that produced it: the byte stream is
/// assumed to be desynchronized.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("truncated message")]
    TruncatedMessage,

    #[error("unknown message type {0}")]
    UnknownMessageType(u8),

    #[error("invalid header marker")]
    BadMarker,

    #[error("invalid message length {0}")]
    BadLength(u16),

    #[error("invalid prefix length {0}")]
    InvalidPrefixLength(u8),

    #[error("malformed attribute (type {type_code}): {reason}")]
    MalformedAttribute { type_code: u8, reason: String },

    #[error("missing well-known attribute (type {0})")]
    MissingAttribute(u8),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl DecodeError {
    pub fn malformed(type_code: u8, reason: impl Into<String>) -> Self {
        DecodeError::MalformedAttribute {
            type_code,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Open = 1,
    Update = 2,
    Notification = 3,
    Keepalive = 4,
}

impl TryFrom<u8> for MessageType {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageType::Open),
            2 => Ok(MessageType::Update),
            3 => Ok(MessageType::Notification),
            4 => Ok(MessageType::Keepalive),
            _ => Err(DecodeError::UnknownMessageType(value)),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Open => "OPEN",
            MessageType::Update => "UPDATE",
            MessageType::Notification => "NOTIFICATION",
            MessageType::Keepalive => "KEEPALIVE",
        };
        f.write_str(name)
    }
}

/// BGP message header: 16-byte marker, 2-byte total length, 1-byte type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub length: u16,
    pub msg_type: MessageType,
}

impl Header {
    /// Decode a BGP header from a buffer.
    ///
    /// Validates the marker and that the length lies within 19..=4096 before
    /// interpreting the type octet.
    pub fn decode(data: &mut impl Buf) -> Result<Self, DecodeError> {
        if data.remaining() < BGP_HEADER_LEN {
            return Err(DecodeError::TruncatedMessage);
        }

        let mut marker = [0u8; 16];
        data.copy_to_slice(&mut marker);
        if marker != BGP_MARKER {
            return Err(DecodeError::BadMarker);
        }

        let length = data.get_u16();
        if (length as usize) < BGP_HEADER_LEN || (length as usize) > BGP_MAX_MESSAGE_LEN {
            return Err(DecodeError::BadLength(length));
        }
        let msg_type = MessageType::try_from(data.get_u8())?;

        Ok(Header { length, msg_type })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(&BGP_MARKER);
        buf.put_u16(self.length);
        buf.put_u8(self.msg_type as u8);
    }
}

/// OPEN body: version, AS, hold time, identifier. Optional parameters are not
/// negotiated by this speaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenMessage {
    pub version: u8,
    pub asn: u16,
    pub hold_time: u16,
    pub router_id: Ipv4Addr,
}

impl OpenMessage {
    pub fn new(asn: u16, hold_time: u16, router_id: Ipv4Addr) -> Self {
        Self {
            version: BGP_VERSION,
            asn,
            hold_time,
            router_id,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.version);
        buf.put_u16(self.asn);
        buf.put_u16(self.hold_time);
        buf.put_slice(&self.router_id.octets());
    }

    /// Decode an OPEN body. Bytes past the fixed fields, such as optional
    /// parameters, are skipped.
    pub fn decode(data: &mut impl Buf) -> Result<Self, DecodeError> {
        if data.remaining() < OPEN_BODY_LEN {
            return Err(DecodeError::TruncatedMessage);
        }

        let version = data.get_u8();
        let asn = data.get_u16();
        let hold_time = data.get_u16();
        let router_id = Ipv4Addr::from(data.get_u32());
        data.advance(data.remaining());

        Ok(Self {
            version,
            asn,
            hold_time,
            router_id,
        })
    }
}

/// BGP NOTIFICATION message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub code: u8,
    pub subcode: u8,
    pub data: Vec<u8>,
}

impl Notification {
    pub fn new(code: u8, subcode: u8, data: Vec<u8>) -> Self {
        Self { code, subcode, data }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.code);
        buf.put_u8(self.subcode);
        buf.put_slice(&self.data);
    }

    pub fn decode(data: &mut impl Buf) -> Result<Self, DecodeError> {
        if data.remaining() < 2 {
            return Err(DecodeError::TruncatedMessage);
        }
        let code = data.get_u8();
        let subcode = data.get_u8();
        let mut rest = vec![0u8; data.remaining()];
        data.copy_to_slice(&mut rest);

        Ok(Self {
            code,
            subcode,
            data: rest,
        })
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code {} subcode {}", self.code, self.subcode)
    }
}

/// A complete BGP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Open(OpenMessage),
    Update(UpdateMessage),
    Notification(Notification),
    Keepalive,
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Open(_) => MessageType::Open,
            Message::Update(_) => MessageType::Update,
            Message::Notification(_) => MessageType::Notification,
            Message::Keepalive => MessageType::Keepalive,
        }
    }

    /// Decode a complete BGP message (including header) from a buffer.
    pub fn decode(data: &mut impl Buf) -> Result<Self, DecodeError> {
        let header = Header::decode(data)?;

        let body_len = header.length as usize - BGP_HEADER_LEN;
        if data.remaining() < body_len {
            return Err(DecodeError::TruncatedMessage);
        }

        let mut body = data.copy_to_bytes(body_len);
        Self::decode_body(header.msg_type, &mut body)
    }

    /// Decode a message body given its type from the header.
    pub fn decode_body(msg_type: MessageType, body: &mut Bytes) -> Result<Self, DecodeError> {
        match msg_type {
            MessageType::Open => Ok(Message::Open(OpenMessage::decode(body)?)),
            MessageType::Update => Ok(Message::Update(UpdateMessage::decode(body)?)),
            MessageType::Notification => Ok(Message::Notification(Notification::decode(body)?)),
            MessageType::Keepalive if body.has_remaining() => Err(DecodeError::BadLength(
                (BGP_HEADER_LEN + body.remaining()) as u16,
            )),
            MessageType::Keepalive => Ok(Message::Keepalive),
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        let mut body = BytesMut::new();
        match self {
            Message::Open(open) => open.encode(&mut body),
            Message::Update(update) => update.encode(&mut body),
            Message::Notification(notification) => notification.encode(&mut body),
            Message::Keepalive => {}
        }

        let header = Header {
            length: (BGP_HEADER_LEN + body.len()) as u16,
            msg_type: self.message_type(),
        };
        header.encode(buf);
        buf.put(body);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(BGP_HEADER_LEN);
        self.encode(&mut buf);
        buf.freeze()
    }
}

/// Frames a byte stream into BGP messages for `FramedRead`, and writes
/// messages back out for the session's write half.
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageCodec;

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = DecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, DecodeError> {
        if src.len() < BGP_HEADER_LEN {
            return Ok(None);
        }

        let header = Header::decode(&mut &src[..BGP_HEADER_LEN])?;
        let length = header.length as usize;
        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(length).freeze();
        frame.advance(BGP_HEADER_LEN);
        Message::decode_body(header.msg_type, &mut frame).map(Some)
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Message>, DecodeError> {
        match self.decode(buf)? {
            Some(message) => Ok(Some(message)),
            None if buf.is_empty() => Ok(None),
            None => Err(DecodeError::TruncatedMessage),
        }
    }
}

impl Encoder<&Message> for MessageCodec {
    type Error = DecodeError;

    fn encode(&mut self, message: &Message, dst: &mut BytesMut) -> Result<(), DecodeError> {
        message.encode(dst);
        Ok(())
    }
}
