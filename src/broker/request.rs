//! A decoded packet bound to the connection it arrived on

use std::sync::Arc;

use super::{Connection, ConnectionError};
use crate::protocol::{Packet, PacketType, ProtocolVersion};

/// Unit of dispatch
#[derive(Debug, Clone)]
pub struct Request {
    conn: Arc<Connection>,
    client_id: Arc<str>,
    packet: Packet,
}

impl Request {
    pub fn new(conn: Arc<Connection>, packet: Packet) -> Self {
        let client_id = conn.client_id().cloned().unwrap_or_else(|| Arc::from(""));
        Self {
            conn,
            client_id,
            packet,
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn client_id(&self) -> &Arc<str> {
        &self.client_id
    }

    pub fn packet(&self) -> &Packet {
        &self.packet
    }

    pub fn packet_type(&self) -> PacketType {
        self.packet.packet_type()
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.conn.protocol_version()
    }

    /// Send `packet` back to the originating client
    pub async fn reply(&self, packet: Packet) -> Result<(), ConnectionError> {
        self.conn.send_packet(&packet).await
    }

    /// Ask the originating connection to terminate
    pub fn terminate(&self) {
        self.conn.stop();
    }
}
