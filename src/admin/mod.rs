//! Admin Module
//!
//! Operator operations over a running [`Broker`]. Every call answers with a
//! [`Response`] carrying a numeric code, a message from the code table and a
//! JSON payload. [`AdminServer`] exposes the same calls over HTTP.

mod http;

pub use http::AdminServer;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::broker::Broker;
use crate::protocol::QoS;
use crate::topic::validate_topic_name;

pub const CODE_OK: u16 = 200;
pub const CODE_PARAM_ERROR: u16 = 4003;
pub const CODE_NOT_FOUND: u16 = 4009;
pub const CODE_ENCODE_ERROR: u16 = 5001;

pub fn code_message(code: u16) -> &'static str {
    match code {
        CODE_OK => "OK",
        CODE_PARAM_ERROR => "parameter error",
        CODE_NOT_FOUND => "not found",
        CODE_ENCODE_ERROR => "encode error",
        _ => "unknown error",
    }
}

/// Result envelope of every admin operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub code: u16,
    pub msg: String,
    pub data: Value,
}

impl Response {
    pub fn new(code: u16, data: Value) -> Self {
        Self {
            code,
            msg: code_message(code).to_string(),
            data,
        }
    }

    /// 200 with `data` serialized, or 5001 if it cannot be
    pub fn ok<T: Serialize>(data: T) -> Self {
        match serde_json::to_value(data) {
            Ok(data) => Self::new(CODE_OK, data),
            Err(e) => Self::error(CODE_ENCODE_ERROR, e.to_string()),
        }
    }

    /// Error response; `detail` is appended to the table message
    pub fn error(code: u16, detail: impl std::fmt::Display) -> Self {
        Self {
            code,
            msg: format!("{}: {}", code_message(code), detail),
            data: Value::Null,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == CODE_OK
    }
}

/// Message submitted by an operator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishMsg {
    pub topic: String,
    #[serde(default)]
    pub payload: String,
    #[serde(default)]
    pub qos: u8,
    #[serde(default)]
    pub retain: bool,
}

impl PublishMsg {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: 0,
            retain: false,
        }
    }

    fn validate(&self) -> Result<QoS, Response> {
        validate_topic_name(&self.topic)
            .map_err(|e| Response::error(CODE_PARAM_ERROR, e))?;
        QoS::from_u8(self.qos)
            .ok_or_else(|| Response::error(CODE_PARAM_ERROR, format!("invalid qos {}", self.qos)))
    }
}

#[derive(Debug, Serialize)]
struct ServerInfo<'a> {
    name: &'a str,
    ip: String,
    port: u16,
    connections: usize,
}

/// Admin operations bound to one broker
#[derive(Clone)]
pub struct AdminApi {
    broker: Broker,
}

impl AdminApi {
    pub fn new(broker: Broker) -> Self {
        Self { broker }
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    pub fn server_info(&self) -> Response {
        let config = self.broker.config();
        Response::ok(ServerInfo {
            name: &config.name,
            ip: config.bind_addr.ip().to_string(),
            port: config.bind_addr.port(),
            connections: self.broker.connection_count(),
        })
    }

    pub fn connection_list(&self) -> Response {
        Response::ok(self.broker.client_ids())
    }

    pub fn topic_list(&self) -> Response {
        Response::ok(self.broker.topic_list())
    }

    /// Publish to current subscribers. `retain` is not applied here; see
    /// [`set_retain_msg`](Self::set_retain_msg).
    pub async fn send_publish(&self, msg: PublishMsg) -> Response {
        let qos = match msg.validate() {
            Ok(qos) => qos,
            Err(resp) => return resp,
        };
        self.broker
            .publish(&msg.topic, Bytes::from(msg.payload), qos)
            .await;
        Response::ok(Value::Null)
    }

    /// Set the retained message of the topic; an empty payload clears it
    pub fn set_retain_msg(&self, msg: PublishMsg) -> Response {
        if let Err(resp) = msg.validate() {
            return resp;
        }
        self.broker
            .set_retained(&msg.topic, Bytes::from(msg.payload));
        Response::ok(Value::Null)
    }

    pub fn stop_connection(&self, client_id: &str) -> Response {
        if self.broker.stop_connection(client_id) {
            info!("admin stopped connection {}", client_id);
            Response::ok(json!({ "client_id": client_id }))
        } else {
            Response::error(CODE_NOT_FOUND, format!("client {} not connected", client_id))
        }
    }
}
