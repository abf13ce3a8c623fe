//! MQTT 5.0 property block
//!
//! A property block is a variable-length byte count followed by a sequence of
//! (identifier, typed value) pairs. The value type is fixed by the identifier.
//! Properties are kept in wire order; lookups are linear, which is fine for
//! the handful a packet carries.

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{
    encode_remaining_length, remaining_length_len, write_binary, write_string, Reader,
};
use crate::protocol::{DecodeError, EncodeError};

/// Wire representation of a property value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Byte(u8),
    TwoByte(u16),
    FourByte(u32),
    VarInt(u32),
    Utf8(String),
    Binary(Bytes),
    Pair(String, String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Byte,
    TwoByte,
    FourByte,
    VarInt,
    Utf8,
    Binary,
    Pair,
}

fn kind_of(id: u8) -> Option<Kind> {
    let kind = match id {
        0x01 | 0x17 | 0x19 | 0x24 | 0x25 | 0x28 | 0x29 | 0x2A => Kind::Byte,
        0x13 | 0x21 | 0x22 | 0x23 => Kind::TwoByte,
        0x02 | 0x11 | 0x18 | 0x27 => Kind::FourByte,
        0x0B => Kind::VarInt,
        0x03 | 0x08 | 0x12 | 0x15 | 0x1A | 0x1C | 0x1F => Kind::Utf8,
        0x09 | 0x16 => Kind::Binary,
        0x26 => Kind::Pair,
        _ => return None,
    };
    Some(kind)
}

/// A single (identifier, value) pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    pub id: u8,
    pub value: PropertyValue,
}

impl Property {
    pub const PAYLOAD_FORMAT_INDICATOR: u8 = 0x01;
    pub const MESSAGE_EXPIRY_INTERVAL: u8 = 0x02;
    pub const CONTENT_TYPE: u8 = 0x03;
    pub const RESPONSE_TOPIC: u8 = 0x08;
    pub const CORRELATION_DATA: u8 = 0x09;
    pub const SUBSCRIPTION_IDENTIFIER: u8 = 0x0B;
    pub const SESSION_EXPIRY_INTERVAL: u8 = 0x11;
    pub const ASSIGNED_CLIENT_IDENTIFIER: u8 = 0x12;
    pub const SERVER_KEEP_ALIVE: u8 = 0x13;
    pub const AUTHENTICATION_METHOD: u8 = 0x15;
    pub const AUTHENTICATION_DATA: u8 = 0x16;
    pub const WILL_DELAY_INTERVAL: u8 = 0x18;
    pub const REASON_STRING: u8 = 0x1F;
    pub const RECEIVE_MAXIMUM: u8 = 0x21;
    pub const TOPIC_ALIAS_MAXIMUM: u8 = 0x22;
    pub const MAXIMUM_QOS: u8 = 0x24;
    pub const RETAIN_AVAILABLE: u8 = 0x25;
    pub const USER_PROPERTY: u8 = 0x26;
    pub const MAXIMUM_PACKET_SIZE: u8 = 0x27;

    /// Build a property, checking the value matches the identifier's type
    pub fn new(id: u8, value: PropertyValue) -> Result<Self, EncodeError> {
        let kind = kind_of(id).ok_or(EncodeError::Unsupported("unknown property id"))?;
        let matches = matches!(
            (kind, &value),
            (Kind::Byte, PropertyValue::Byte(_))
                | (Kind::TwoByte, PropertyValue::TwoByte(_))
                | (Kind::FourByte, PropertyValue::FourByte(_))
                | (Kind::VarInt, PropertyValue::VarInt(_))
                | (Kind::Utf8, PropertyValue::Utf8(_))
                | (Kind::Binary, PropertyValue::Binary(_))
                | (Kind::Pair, PropertyValue::Pair(_, _))
        );
        if !matches {
            return Err(EncodeError::Unsupported("property value type"));
        }
        Ok(Self { id, value })
    }

    fn encoded_len(&self) -> usize {
        1 + match &self.value {
            PropertyValue::Byte(_) => 1,
            PropertyValue::TwoByte(_) => 2,
            PropertyValue::FourByte(_) => 4,
            PropertyValue::VarInt(v) => remaining_length_len(*v),
            PropertyValue::Utf8(s) => 2 + s.len(),
            PropertyValue::Binary(b) => 2 + b.len(),
            PropertyValue::Pair(k, v) => 4 + k.len() + v.len(),
        }
    }

    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u8(self.id);
        match &self.value {
            PropertyValue::Byte(v) => buf.put_u8(*v),
            PropertyValue::TwoByte(v) => buf.put_u16(*v),
            PropertyValue::FourByte(v) => buf.put_u32(*v),
            PropertyValue::VarInt(v) => {
                encode_remaining_length(*v, buf)?;
            }
            PropertyValue::Utf8(s) => write_string(buf, s)?,
            PropertyValue::Binary(b) => write_binary(buf, b)?,
            PropertyValue::Pair(k, v) => {
                write_string(buf, k)?;
                write_string(buf, v)?;
            }
        }
        Ok(())
    }
}

/// Ordered property list of one packet (or of a will)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    items: Vec<Property>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Property> {
        self.items.iter()
    }

    pub fn push(&mut self, property: Property) {
        self.items.push(property);
    }

    /// First value carried under `id`
    pub fn get(&self, id: u8) -> Option<&PropertyValue> {
        self.items.iter().find(|p| p.id == id).map(|p| &p.value)
    }

    pub fn session_expiry_interval(&self) -> Option<u32> {
        match self.get(Property::SESSION_EXPIRY_INTERVAL) {
            Some(PropertyValue::FourByte(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn receive_maximum(&self) -> Option<u16> {
        match self.get(Property::RECEIVE_MAXIMUM) {
            Some(PropertyValue::TwoByte(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn reason_string(&self) -> Option<&str> {
        match self.get(Property::REASON_STRING) {
            Some(PropertyValue::Utf8(s)) => Some(s),
            _ => None,
        }
    }

    pub fn user_properties(&self) -> impl Iterator<Item = (&str, &str)> {
        self.items.iter().filter_map(|p| match &p.value {
            PropertyValue::Pair(k, v) => Some((k.as_str(), v.as_str())),
            _ => None,
        })
    }

    /// Size of the block body, excluding its own length prefix
    pub fn body_len(&self) -> usize {
        self.items.iter().map(Property::encoded_len).sum()
    }

    /// Size of the whole block including the length prefix
    pub fn encoded_len(&self) -> usize {
        let body = self.body_len();
        remaining_length_len(u32::try_from(body).unwrap_or(u32::MAX)) + body
    }

    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let len = u32::try_from(self.body_len()).map_err(|_| EncodeError::PacketTooLarge)?;
        encode_remaining_length(len, buf)?;
        for property in &self.items {
            property.encode(buf)?;
        }
        Ok(())
    }

    /// Read a property block from the cursor.
    ///
    /// An identifier this broker does not know ends parsing of the block; the
    /// remaining bytes of the block are skipped and the cursor is left just
    /// past it.
    pub fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let len = reader.varint()? as usize;
        let mut block = Reader::new(reader.take(len)?);
        let mut items = Vec::new();

        while !block.is_empty() {
            let id = block.u8()?;
            let Some(kind) = kind_of(id) else {
                tracing::debug!("unknown property {:#04x}, skipping rest of block", id);
                break;
            };
            let value = match kind {
                Kind::Byte => PropertyValue::Byte(block.u8()?),
                Kind::TwoByte => PropertyValue::TwoByte(block.u16()?),
                Kind::FourByte => PropertyValue::FourByte(block.u32()?),
                Kind::VarInt => PropertyValue::VarInt(block.varint()?),
                Kind::Utf8 => PropertyValue::Utf8(block.string()?.to_string()),
                Kind::Binary => PropertyValue::Binary(Bytes::copy_from_slice(block.binary()?)),
                Kind::Pair => {
                    let key = block.string()?.to_string();
                    let value = block.string()?.to_string();
                    PropertyValue::Pair(key, value)
                }
            };
            items.push(Property { id, value });
        }

        Ok(Self { items })
    }
}

impl FromIterator<Property> for Properties {
    fn from_iter<I: IntoIterator<Item = Property>>(iter: I) -> Self {
        Self {
            items: iter.into_iter().collect(),
        }
    }
}
