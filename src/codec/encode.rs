//! Packet encoder

use bytes::{BufMut, Bytes, BytesMut};

use super::{encode_remaining_length, write_binary, write_string};
use crate::protocol::{
    Ack, ConnAck, Connect, EncodeError, Packet, Properties, ProtocolVersion, Publish, QoS,
    ReasonCode, SubAck, Subscribe, UnsubAck, Unsubscribe,
};

/// Serializes packets for one protocol version
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketEncoder {
    version: ProtocolVersion,
}

impl PacketEncoder {
    pub fn new(version: ProtocolVersion) -> Self {
        Self { version }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    fn v5(&self) -> bool {
        self.version == ProtocolVersion::V5
    }

    /// Encode into a fresh buffer
    pub fn to_bytes(&self, packet: &Packet) -> Result<Bytes, EncodeError> {
        let mut buf = BytesMut::new();
        self.encode(packet, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Append the full wire form of `packet` (fixed header included) to `buf`
    pub fn encode(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let mut body = BytesMut::new();
        let header = match packet {
            Packet::Connect(c) => {
                self.connect(c, &mut body)?;
                0x10
            }
            Packet::ConnAck(c) => {
                self.connack(c, &mut body)?;
                0x20
            }
            Packet::Publish(p) => self.publish(p, &mut body)?,
            Packet::PubAck(a) => {
                self.ack(a, &mut body)?;
                0x40
            }
            Packet::PubRec(a) => {
                self.ack(a, &mut body)?;
                0x50
            }
            Packet::PubRel(a) => {
                self.ack(a, &mut body)?;
                0x62
            }
            Packet::PubComp(a) => {
                self.ack(a, &mut body)?;
                0x70
            }
            Packet::Subscribe(s) => {
                self.subscribe(s, &mut body)?;
                0x82
            }
            Packet::SubAck(s) => {
                self.suback(s, &mut body)?;
                0x90
            }
            Packet::Unsubscribe(u) => {
                self.unsubscribe(u, &mut body)?;
                0xA2
            }
            Packet::UnsubAck(u) => {
                self.unsuback(u, &mut body)?;
                0xB0
            }
            Packet::PingReq => 0xC0,
            Packet::PingResp => 0xD0,
            Packet::Disconnect(d) => {
                self.reason_and_properties(d.reason_code, &d.properties, &mut body)?;
                0xE0
            }
            Packet::Auth(a) => {
                if !self.v5() {
                    return Err(EncodeError::Unsupported("AUTH"));
                }
                self.reason_and_properties(a.reason_code, &a.properties, &mut body)?;
                0xF0
            }
        };

        buf.reserve(5 + body.len());
        buf.put_u8(header);
        let len = u32::try_from(body.len()).map_err(|_| EncodeError::PacketTooLarge)?;
        encode_remaining_length(len, buf)?;
        buf.extend_from_slice(&body);
        Ok(())
    }

    fn properties(&self, props: &Properties, body: &mut BytesMut) -> Result<(), EncodeError> {
        if self.v5() {
            props.encode(body)?;
        }
        Ok(())
    }

    fn connect(&self, c: &Connect, body: &mut BytesMut) -> Result<(), EncodeError> {
        write_string(body, "MQTT")?;
        body.put_u8(self.version as u8);

        let mut flags = 0u8;
        if c.clean_start {
            flags |= 0x02;
        }
        if let Some(will) = &c.will {
            flags |= 0x04 | ((will.qos as u8) << 3);
            if will.retain {
                flags |= 0x20;
            }
        }
        if c.password.is_some() {
            flags |= 0x40;
        }
        if c.username.is_some() {
            flags |= 0x80;
        }
        body.put_u8(flags);
        body.put_u16(c.keep_alive);
        self.properties(&c.properties, body)?;

        write_string(body, &c.client_id)?;
        if let Some(will) = &c.will {
            self.properties(&will.properties, body)?;
            write_string(body, &will.topic)?;
            write_binary(body, &will.payload)?;
        }
        if let Some(username) = &c.username {
            write_string(body, username)?;
        }
        if let Some(password) = &c.password {
            write_binary(body, password)?;
        }
        Ok(())
    }

    fn connack(&self, c: &ConnAck, body: &mut BytesMut) -> Result<(), EncodeError> {
        body.put_u8(u8::from(c.session_present));
        if self.v5() {
            body.put_u8(c.reason_code as u8);
            c.properties.encode(body)?;
        } else {
            body.put_u8(c.reason_code.to_v3_connack());
        }
        Ok(())
    }

    fn publish(&self, p: &Publish, body: &mut BytesMut) -> Result<u8, EncodeError> {
        let mut header = 0x30 | ((p.qos as u8) << 1);
        if p.dup {
            header |= 0x08;
        }
        if p.retain {
            header |= 0x01;
        }

        write_string(body, &p.topic)?;
        if p.qos != QoS::AtMostOnce {
            match p.packet_id {
                Some(id) if id != 0 => body.put_u16(id),
                _ => return Err(EncodeError::MissingPacketId),
            }
        }
        self.properties(&p.properties, body)?;
        body.extend_from_slice(&p.payload);
        Ok(header)
    }

    fn ack(&self, a: &Ack, body: &mut BytesMut) -> Result<(), EncodeError> {
        body.put_u16(a.packet_id);
        self.reason_and_properties(a.reason_code, &a.properties, body)
    }

    /// 5.0 trailer: omitted entirely for Success without properties,
    /// reason code alone when there are no properties.
    fn reason_and_properties(
        &self,
        code: ReasonCode,
        props: &Properties,
        body: &mut BytesMut,
    ) -> Result<(), EncodeError> {
        if !self.v5() || (code == ReasonCode::Success && props.is_empty()) {
            return Ok(());
        }
        body.put_u8(code as u8);
        if !props.is_empty() {
            props.encode(body)?;
        }
        Ok(())
    }

    fn subscribe(&self, s: &Subscribe, body: &mut BytesMut) -> Result<(), EncodeError> {
        body.put_u16(s.packet_id);
        self.properties(&s.properties, body)?;
        for sub in &s.subscriptions {
            write_string(body, &sub.filter)?;
            let options = if self.v5() {
                sub.options.to_byte()
            } else {
                sub.options.qos as u8
            };
            body.put_u8(options);
        }
        Ok(())
    }

    fn suback(&self, s: &SubAck, body: &mut BytesMut) -> Result<(), EncodeError> {
        body.put_u16(s.packet_id);
        self.properties(&s.properties, body)?;
        for code in &s.reason_codes {
            body.put_u8(if self.v5() {
                *code as u8
            } else {
                code.to_v3_suback()
            });
        }
        Ok(())
    }

    fn unsubscribe(&self, u: &Unsubscribe, body: &mut BytesMut) -> Result<(), EncodeError> {
        body.put_u16(u.packet_id);
        self.properties(&u.properties, body)?;
        for filter in &u.filters {
            write_string(body, filter)?;
        }
        Ok(())
    }

    fn unsuback(&self, u: &UnsubAck, body: &mut BytesMut) -> Result<(), EncodeError> {
        body.put_u16(u.packet_id);
        if self.v5() {
            u.properties.encode(body)?;
            body.extend(u.reason_codes.iter().map(|c| *c as u8));
        }
        Ok(())
    }
}
