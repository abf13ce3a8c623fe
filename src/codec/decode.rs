//! Packet decoder
//!
//! Turns one frame body into a [`Packet`]. Dispatch is purely on the header
//! byte; the protocol version decides whether property blocks and 5.0 reason
//! codes are present.

use std::sync::Arc;

use bytes::Bytes;

use super::{decode_remaining_length, Frame, Reader};
use crate::protocol::{
    Ack, Auth, ConnAck, Connect, DecodeError, Disconnect, FrameError, Packet, PacketType,
    Properties, ProtocolVersion, Publish, QoS, ReasonCode, SubAck, Subscribe, Subscription,
    SubscriptionOptions, UnsubAck, Unsubscribe, Will,
};

/// Stateful decoder; learns the protocol version from CONNECT
#[derive(Debug, Default, Clone)]
pub struct PacketDecoder {
    version: Option<ProtocolVersion>,
}

impl PacketDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decoder for a peer whose version is already known (client side, tests)
    pub fn for_version(version: ProtocolVersion) -> Self {
        Self {
            version: Some(version),
        }
    }

    pub fn version(&self) -> Option<ProtocolVersion> {
        self.version
    }

    pub fn set_version(&mut self, version: ProtocolVersion) {
        self.version = Some(version);
    }

    fn v5(&self) -> bool {
        self.version == Some(ProtocolVersion::V5)
    }

    fn properties(&self, r: &mut Reader<'_>) -> Result<Properties, DecodeError> {
        if self.v5() {
            Properties::decode(r)
        } else {
            Ok(Properties::default())
        }
    }

    pub fn decode_frame(&mut self, frame: &Frame) -> Result<Packet, DecodeError> {
        self.decode(frame.header, frame.body.clone())
    }

    /// Decode a packet body given its fixed-header byte
    pub fn decode(&mut self, header: u8, body: Bytes) -> Result<Packet, DecodeError> {
        let packet_type =
            PacketType::from_header(header).ok_or(DecodeError::InvalidPacketType(header >> 4))?;
        let flags = header & 0x0F;
        if let Some(required) = packet_type.required_flags() {
            if flags != required {
                return Err(DecodeError::InvalidFlags(header));
            }
        }

        let mut r = Reader::new(&body);
        let packet = match packet_type {
            PacketType::Connect => Packet::Connect(Box::new(self.connect(&mut r)?)),
            PacketType::ConnAck => Packet::ConnAck(self.connack(&mut r)?),
            PacketType::Publish => Packet::Publish(self.publish(flags, &mut r, &body)?),
            PacketType::PubAck => Packet::PubAck(self.ack(&mut r)?),
            PacketType::PubRec => Packet::PubRec(self.ack(&mut r)?),
            PacketType::PubRel => Packet::PubRel(self.ack(&mut r)?),
            PacketType::PubComp => Packet::PubComp(self.ack(&mut r)?),
            PacketType::Subscribe => Packet::Subscribe(self.subscribe(&mut r)?),
            PacketType::SubAck => Packet::SubAck(self.suback(&mut r)?),
            PacketType::Unsubscribe => Packet::Unsubscribe(self.unsubscribe(&mut r)?),
            PacketType::UnsubAck => Packet::UnsubAck(self.unsuback(&mut r)?),
            PacketType::PingReq => Packet::PingReq,
            PacketType::PingResp => Packet::PingResp,
            PacketType::Disconnect => {
                let (reason_code, properties) = self.reason_and_properties(&mut r)?;
                Packet::Disconnect(Disconnect {
                    reason_code,
                    properties,
                })
            }
            PacketType::Auth => {
                if !self.v5() {
                    return Err(DecodeError::InvalidPacketType(15));
                }
                let (reason_code, properties) = self.reason_and_properties(&mut r)?;
                Packet::Auth(Auth {
                    reason_code,
                    properties,
                })
            }
        };
        r.finish()?;
        Ok(packet)
    }

    /// Decode one complete packet from the front of `buf`.
    ///
    /// Returns the packet and the bytes it occupied, or `None` when `buf`
    /// does not yet hold a whole packet.
    pub fn decode_slice(&mut self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        let Some((&header, rest)) = buf.split_first() else {
            return Ok(None);
        };
        let (len, len_bytes) = match decode_remaining_length(rest) {
            Ok(Some(v)) => v,
            Ok(None) => return Ok(None),
            Err(FrameError::MalformedLength) => {
                return Err(DecodeError::Malformed("remaining length too long"))
            }
            Err(_) => return Err(DecodeError::Malformed("bad remaining length")),
        };
        let total = 1 + len_bytes + len as usize;
        if buf.len() < total {
            return Ok(None);
        }
        let body = Bytes::copy_from_slice(&buf[1 + len_bytes..total]);
        Ok(Some((self.decode(header, body)?, total)))
    }

    fn connect(&mut self, r: &mut Reader<'_>) -> Result<Connect, DecodeError> {
        let name = r.string()?;
        let level = r.u8()?;
        if name != "MQTT" {
            return Err(DecodeError::ConnectRejected(
                ReasonCode::UnsupportedProtocolVersion,
            ));
        }
        let protocol_version = ProtocolVersion::from_level(level).ok_or(
            DecodeError::ConnectRejected(ReasonCode::UnsupportedProtocolVersion),
        )?;
        self.version = Some(protocol_version);

        let flags = r.u8()?;
        let malformed = DecodeError::ConnectRejected(ReasonCode::MalformedPacket);
        if flags & 0x01 != 0 {
            return Err(malformed);
        }
        let clean_start = flags & 0x02 != 0;
        let will_flag = flags & 0x04 != 0;
        let will_qos = (flags >> 3) & 0x03;
        let will_retain = flags & 0x20 != 0;
        let password_flag = flags & 0x40 != 0;
        let username_flag = flags & 0x80 != 0;

        if !will_flag && (will_qos != 0 || will_retain) {
            return Err(malformed);
        }
        let will_qos = QoS::from_u8(will_qos).ok_or(malformed.clone())?;
        if protocol_version == ProtocolVersion::V311 && password_flag && !username_flag {
            return Err(malformed);
        }

        let keep_alive = r.u16()?;
        let properties = self.properties(r)?;

        let client_id = r.string()?;
        if client_id.is_empty() {
            return Err(DecodeError::ConnectRejected(ReasonCode::ClientIdNotValid));
        }

        let will = if will_flag {
            let properties = self.properties(r)?;
            let topic = r.string()?.to_string();
            let payload = Bytes::copy_from_slice(r.binary()?);
            Some(Will {
                topic,
                payload,
                qos: will_qos,
                retain: will_retain,
                properties,
            })
        } else {
            None
        };

        let username = if username_flag {
            Some(r.string()?.to_string())
        } else {
            None
        };
        let password = if password_flag {
            Some(Bytes::copy_from_slice(r.binary()?))
        } else {
            None
        };

        Ok(Connect {
            protocol_version,
            client_id: client_id.to_string(),
            clean_start,
            keep_alive,
            username,
            password,
            will,
            properties,
        })
    }

    fn connack(&self, r: &mut Reader<'_>) -> Result<ConnAck, DecodeError> {
        let ack_flags = r.u8()?;
        if ack_flags & 0xFE != 0 {
            return Err(DecodeError::Malformed("CONNACK flags"));
        }
        let code = r.u8()?;
        let reason_code = if self.v5() {
            ReasonCode::from_u8(code)
        } else {
            ReasonCode::from_v3_connack(code)
        }
        .ok_or(DecodeError::InvalidReasonCode(code))?;

        Ok(ConnAck {
            session_present: ack_flags & 0x01 != 0,
            reason_code,
            properties: self.properties(r)?,
        })
    }

    fn publish(&self, flags: u8, r: &mut Reader<'_>, body: &Bytes) -> Result<Publish, DecodeError> {
        let qos_bits = (flags >> 1) & 0x03;
        let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;
        let dup = flags & 0x08 != 0;
        if dup && qos == QoS::AtMostOnce {
            return Err(DecodeError::Malformed("DUP set on QoS 0 publish"));
        }

        let topic = r.string()?;
        if topic.contains(['+', '#']) {
            return Err(DecodeError::Malformed("wildcard in topic name"));
        }

        let packet_id = match qos {
            QoS::AtMostOnce => None,
            _ => match r.u16()? {
                0 => return Err(DecodeError::Malformed("packet identifier 0")),
                id => Some(id),
            },
        };
        let properties = self.properties(r)?;
        let start = r.position();
        r.rest();

        Ok(Publish {
            dup,
            qos,
            retain: flags & 0x01 != 0,
            topic: Arc::from(topic),
            packet_id,
            payload: body.slice(start..),
            properties,
        })
    }

    fn ack(&self, r: &mut Reader<'_>) -> Result<Ack, DecodeError> {
        let packet_id = r.u16()?;
        let (reason_code, properties) = self.reason_and_properties(r)?;
        Ok(Ack {
            packet_id,
            reason_code,
            properties,
        })
    }

    /// Trailing (reason code, properties) pair of 5.0 acks, DISCONNECT and
    /// AUTH. Both parts may be omitted on the wire.
    fn reason_and_properties(
        &self,
        r: &mut Reader<'_>,
    ) -> Result<(ReasonCode, Properties), DecodeError> {
        if !self.v5() || r.is_empty() {
            return Ok((ReasonCode::Success, Properties::default()));
        }
        let code = r.u8()?;
        let reason_code = ReasonCode::from_u8(code).ok_or(DecodeError::InvalidReasonCode(code))?;
        let properties = if r.is_empty() {
            Properties::default()
        } else {
            Properties::decode(r)?
        };
        Ok((reason_code, properties))
    }

    fn packet_id(r: &mut Reader<'_>) -> Result<u16, DecodeError> {
        match r.u16()? {
            0 => Err(DecodeError::Malformed("packet identifier 0")),
            id => Ok(id),
        }
    }

    fn subscribe(&self, r: &mut Reader<'_>) -> Result<Subscribe, DecodeError> {
        let packet_id = Self::packet_id(r)?;
        let properties = self.properties(r)?;

        let mut subscriptions = Vec::new();
        while !r.is_empty() {
            let filter = r.string()?;
            if filter.is_empty() {
                return Err(DecodeError::Malformed("empty topic filter"));
            }
            let byte = r.u8()?;
            let options = if self.v5() {
                SubscriptionOptions::from_byte(byte)
            } else if byte & 0xFC == 0 {
                QoS::from_u8(byte).map(SubscriptionOptions::with_qos)
            } else {
                None
            }
            .ok_or(DecodeError::InvalidSubscriptionOptions(byte))?;

            subscriptions.push(Subscription {
                filter: filter.to_string(),
                options,
            });
        }
        if subscriptions.is_empty() {
            return Err(DecodeError::Malformed("SUBSCRIBE without filters"));
        }

        Ok(Subscribe {
            packet_id,
            subscriptions,
            properties,
        })
    }

    fn suback(&self, r: &mut Reader<'_>) -> Result<SubAck, DecodeError> {
        let packet_id = r.u16()?;
        let properties = self.properties(r)?;
        let reason_codes = r
            .rest()
            .iter()
            .map(|&code| {
                if self.v5() {
                    ReasonCode::from_u8(code)
                } else {
                    ReasonCode::from_v3_suback(code)
                }
                .ok_or(DecodeError::InvalidReasonCode(code))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(SubAck {
            packet_id,
            reason_codes,
            properties,
        })
    }

    fn unsubscribe(&self, r: &mut Reader<'_>) -> Result<Unsubscribe, DecodeError> {
        let packet_id = Self::packet_id(r)?;
        let properties = self.properties(r)?;

        let mut filters = Vec::new();
        while !r.is_empty() {
            let filter = r.string()?;
            if filter.is_empty() {
                return Err(DecodeError::Malformed("empty topic filter"));
            }
            filters.push(filter.to_string());
        }
        if filters.is_empty() {
            return Err(DecodeError::Malformed("UNSUBSCRIBE without filters"));
        }

        Ok(Unsubscribe {
            packet_id,
            filters,
            properties,
        })
    }

    fn unsuback(&self, r: &mut Reader<'_>) -> Result<UnsubAck, DecodeError> {
        let packet_id = r.u16()?;
        if !self.v5() {
            return Ok(UnsubAck {
                packet_id,
                reason_codes: Vec::new(),
                properties: Properties::default(),
            });
        }
        let properties = Properties::decode(r)?;
        let reason_codes = r
            .rest()
            .iter()
            .map(|&code| ReasonCode::from_u8(code).ok_or(DecodeError::InvalidReasonCode(code)))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(UnsubAck {
            packet_id,
            reason_codes,
            properties,
        })
    }
}
