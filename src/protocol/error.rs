//! Protocol error types

use std::fmt;
use std::io;

use super::ReasonCode;

/// Failure while reading the raw fixed header and body off the transport.
///
/// Always fatal to the connection and never answered on the wire.
#[derive(Debug)]
pub enum FrameError {
    /// Remaining length used more than four bytes
    MalformedLength,
    /// Remaining length above the configured maximum packet size
    TooLarge { size: usize, max: usize },
    /// Peer closed the transport in the middle of a frame
    Truncated,
    /// Underlying read failed
    Io(io::Error),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedLength => write!(f, "malformed remaining length"),
            Self::TooLarge { size, max } => {
                write!(f, "frame of {} bytes exceeds maximum of {}", size, max)
            }
            Self::Truncated => write!(f, "transport closed mid-frame"),
            Self::Io(e) => write!(f, "read failed: {}", e),
        }
    }
}

impl std::error::Error for FrameError {}

impl From<io::Error> for FrameError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            FrameError::Truncated
        } else {
            FrameError::Io(e)
        }
    }
}

/// A well-framed packet whose contents are invalid
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Ran past the end of the packet body
    UnexpectedEnd,
    /// Type nibble 0, or AUTH on a 3.1.1 connection
    InvalidPacketType(u8),
    /// Fixed header flag nibble does not match the packet type
    InvalidFlags(u8),
    /// QoS bits set to 3
    InvalidQoS(u8),
    /// String field is not valid UTF-8 or contains U+0000
    InvalidUtf8,
    /// Reason code byte not in the table
    InvalidReasonCode(u8),
    /// Subscription options byte has reserved bits set
    InvalidSubscriptionOptions(u8),
    /// Property value is not what its identifier requires
    InvalidProperty(u8),
    /// Bytes left over after the last field of a packet
    TrailingBytes(usize),
    /// Any other structural violation
    Malformed(&'static str),
    /// CONNECT refused; the code must be echoed in CONNACK before closing
    ConnectRejected(ReasonCode),
}

impl DecodeError {
    /// Reason code to report for this error, if the protocol defines one
    pub fn reason_code(&self) -> ReasonCode {
        match self {
            Self::ConnectRejected(code) => *code,
            Self::InvalidPacketType(_) => ReasonCode::ProtocolError,
            _ => ReasonCode::MalformedPacket,
        }
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEnd => write!(f, "packet body ended early"),
            Self::InvalidPacketType(t) => write!(f, "invalid packet type: {}", t),
            Self::InvalidFlags(b) => write!(f, "invalid fixed header flags: {:#04x}", b),
            Self::InvalidQoS(q) => write!(f, "invalid QoS value: {}", q),
            Self::InvalidUtf8 => write!(f, "invalid UTF-8 string"),
            Self::InvalidReasonCode(r) => write!(f, "invalid reason code: {:#04x}", r),
            Self::InvalidSubscriptionOptions(b) => {
                write!(f, "invalid subscription options: {:#04x}", b)
            }
            Self::InvalidProperty(id) => write!(f, "invalid value for property {:#04x}", id),
            Self::TrailingBytes(n) => write!(f, "{} unexpected trailing bytes", n),
            Self::Malformed(msg) => write!(f, "malformed packet: {}", msg),
            Self::ConnectRejected(code) => write!(f, "connect rejected: {}", code),
        }
    }
}

impl std::error::Error for DecodeError {}

/// A packet value that cannot be represented on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Encoded body exceeds 268,435,455 bytes
    PacketTooLarge,
    /// String or binary field longer than 65,535 bytes
    FieldTooLong,
    /// QoS>0 PUBLISH without a packet identifier, or identifier 0
    MissingPacketId,
    /// Packet kind does not exist in the negotiated protocol version
    Unsupported(&'static str),
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PacketTooLarge => write!(f, "packet too large"),
            Self::FieldTooLong => write!(f, "field exceeds 65535 bytes"),
            Self::MissingPacketId => write!(f, "missing packet identifier"),
            Self::Unsupported(what) => write!(f, "unsupported in this protocol version: {}", what),
        }
    }
}

impl std::error::Error for EncodeError {}

/// Well-framed but semantically invalid traffic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    Decode(DecodeError),
    Encode(EncodeError),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode(e) => write!(f, "decode error: {}", e),
            Self::Encode(e) => write!(f, "encode error: {}", e),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<DecodeError> for ProtocolError {
    fn from(e: DecodeError) -> Self {
        ProtocolError::Decode(e)
    }
}

impl From<EncodeError> for ProtocolError {
    fn from(e: EncodeError) -> Self {
        ProtocolError::Encode(e)
    }
}
