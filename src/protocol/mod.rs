//! MQTT protocol types shared by the codec, the connection state machine
//! and the handlers.
//!
//! Both protocol levels the broker speaks (3.1.1 and 5.0) use the same
//! packet model; fields that only exist on the wire for 5.0 (properties,
//! reason codes on acks) are simply left at their defaults for 3.1.1.

mod error;
mod packet;
mod properties;
mod reason;

pub use error::{DecodeError, EncodeError, FrameError, ProtocolError};
pub use packet::*;
pub use properties::{Properties, Property, PropertyValue};
pub use reason::ReasonCode;

/// Protocol level carried in the CONNECT variable header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ProtocolVersion {
    /// MQTT 3.1.1, protocol level 4
    #[default]
    V311 = 4,
    /// MQTT 5.0, protocol level 5
    V5 = 5,
}

impl ProtocolVersion {
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            4 => Some(Self::V311),
            5 => Some(Self::V5),
            _ => None,
        }
    }

    /// Whether packets of this version carry a property block
    #[inline]
    pub fn has_properties(self) -> bool {
        self == Self::V5
    }
}

/// Quality of Service levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::AtMostOnce),
            1 => Some(Self::AtLeastOnce),
            2 => Some(Self::ExactlyOnce),
            _ => None,
        }
    }
}

/// Per-filter options byte of a SUBSCRIBE payload.
///
/// 3.1.1 only uses the two QoS bits; 5.0 adds no-local, retain-as-published
/// and the retain-handling field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubscriptionOptions {
    pub qos: QoS,
    pub no_local: bool,
    pub retain_as_published: bool,
    pub retain_handling: u8,
}

impl SubscriptionOptions {
    pub fn with_qos(qos: QoS) -> Self {
        Self {
            qos,
            ..Default::default()
        }
    }

    /// Parse a 5.0 options byte. Reserved bits and retain-handling 3 are rejected.
    pub fn from_byte(byte: u8) -> Option<Self> {
        if byte & 0xC0 != 0 {
            return None;
        }
        let retain_handling = (byte >> 4) & 0x03;
        if retain_handling == 3 {
            return None;
        }
        Some(Self {
            qos: QoS::from_u8(byte & 0x03)?,
            no_local: byte & 0x04 != 0,
            retain_as_published: byte & 0x08 != 0,
            retain_handling,
        })
    }

    pub fn to_byte(self) -> u8 {
        let mut byte = self.qos as u8;
        if self.no_local {
            byte |= 0x04;
        }
        if self.retain_as_published {
            byte |= 0x08;
        }
        byte | (self.retain_handling << 4)
    }
}

/// Control packet kind, the high nibble of the fixed header's first byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
    Auth = 15,
}

impl PacketType {
    pub const ALL: [PacketType; 15] = [
        Self::Connect,
        Self::ConnAck,
        Self::Publish,
        Self::PubAck,
        Self::PubRec,
        Self::PubRel,
        Self::PubComp,
        Self::Subscribe,
        Self::SubAck,
        Self::Unsubscribe,
        Self::UnsubAck,
        Self::PingReq,
        Self::PingResp,
        Self::Disconnect,
        Self::Auth,
    ];

    /// Packet type encoded in a fixed-header byte
    pub fn from_header(byte: u8) -> Option<Self> {
        match byte >> 4 {
            0 => None,
            n => Some(Self::ALL[n as usize - 1]),
        }
    }

    /// Flag nibble the fixed header must carry, `None` for PUBLISH whose
    /// flags encode DUP/QoS/RETAIN.
    pub fn required_flags(self) -> Option<u8> {
        match self {
            Self::Publish => None,
            Self::PubRel | Self::Subscribe | Self::Unsubscribe => Some(0x02),
            _ => Some(0x00),
        }
    }
}
