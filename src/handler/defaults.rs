//! Built-in packet handling

use async_trait::async_trait;
use tracing::{debug, trace};

use super::Handler;
use crate::broker::{ConnectionError, Request};
use crate::protocol::{
    Ack, Disconnect, Packet, ProtocolVersion, Publish, QoS, ReasonCode, SubAck, Subscribe,
    UnsubAck, Unsubscribe,
};
use crate::topic::TopicRegistry;

/// Broker behavior for every packet a client may send.
///
/// Client publishes are forwarded to subscribers at QoS 0 and SUBSCRIBE
/// grants QoS 0 for every filter; replace the PUBLISH or SUBSCRIBE handler
/// to negotiate more.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHandler;

#[async_trait]
impl Handler for DefaultHandler {
    async fn pre_handle(&self, req: &Request, _topics: &TopicRegistry) -> Result<(), ConnectionError> {
        trace!("{:?} from {}", req.packet_type(), req.client_id());
        Ok(())
    }

    async fn handle(&self, req: &Request, topics: &TopicRegistry) -> Result<(), ConnectionError> {
        match req.packet() {
            Packet::Publish(publish) => handle_publish(req, publish, topics).await,
            Packet::PubRel(ack) => handle_pubrel(req, ack, topics).await,
            Packet::PubRec(ack) => req.reply(Packet::PubRel(Ack::new(ack.packet_id))).await,
            Packet::PubAck(ack) | Packet::PubComp(ack) => {
                debug!(
                    "{:?} {} from {}",
                    req.packet_type(),
                    ack.packet_id,
                    req.client_id()
                );
                Ok(())
            }
            Packet::Subscribe(subscribe) => handle_subscribe(req, subscribe, topics).await,
            Packet::Unsubscribe(unsubscribe) => handle_unsubscribe(req, unsubscribe, topics).await,
            Packet::PingReq => req.reply(Packet::PingResp).await,
            Packet::Disconnect(disconnect) => {
                handle_disconnect(req, disconnect, topics);
                Ok(())
            }
            Packet::Connect(_) => Err(ConnectionError::Violation("second CONNECT")),
            Packet::ConnAck(_)
            | Packet::SubAck(_)
            | Packet::UnsubAck(_)
            | Packet::PingResp
            | Packet::Auth(_) => {
                debug!(
                    "ignoring {:?} from {}",
                    req.packet_type(),
                    req.client_id()
                );
                Ok(())
            }
        }
    }

    async fn post_handle(&self, _req: &Request, _topics: &TopicRegistry) -> Result<(), ConnectionError> {
        Ok(())
    }
}

async fn handle_publish(
    req: &Request,
    publish: &Publish,
    topics: &TopicRegistry,
) -> Result<(), ConnectionError> {
    let packet_id = publish.packet_id.unwrap_or(0);
    if publish.qos == QoS::ExactlyOnce && !topics.set_qos2_id(req.client_id(), packet_id) {
        return Err(ConnectionError::Violation(
            "QoS 2 packet identifier reused before PUBREL",
        ));
    }

    if publish.retain {
        topics.set_retained(&publish.topic, publish.payload.clone());
    }
    topics
        .publish_fanout(Publish::new(publish.topic.clone(), publish.payload.clone()))
        .await;

    match publish.qos {
        QoS::AtMostOnce => Ok(()),
        QoS::AtLeastOnce => req.reply(Packet::PubAck(Ack::new(packet_id))).await,
        QoS::ExactlyOnce => req.reply(Packet::PubRec(Ack::new(packet_id))).await,
    }
}

async fn handle_pubrel(req: &Request, ack: &Ack, topics: &TopicRegistry) -> Result<(), ConnectionError> {
    let mut pubcomp = Ack::new(ack.packet_id);
    if !topics.remove_qos2_id(req.client_id(), ack.packet_id) {
        debug!("PUBREL {} from {} matches no PUBREC", ack.packet_id, req.client_id());
        pubcomp.reason_code = ReasonCode::PacketIdNotFound;
    }
    req.reply(Packet::PubComp(pubcomp)).await
}

async fn handle_subscribe(
    req: &Request,
    subscribe: &Subscribe,
    topics: &TopicRegistry,
) -> Result<(), ConnectionError> {
    for sub in &subscribe.subscriptions {
        topics.subscribe(&sub.filter, req.client_id());
    }

    req.reply(Packet::SubAck(SubAck {
        packet_id: subscribe.packet_id,
        reason_codes: vec![ReasonCode::Success; subscribe.subscriptions.len()],
        properties: Default::default(),
    }))
    .await?;

    for sub in &subscribe.subscriptions {
        topics.push_retained(&sub.filter, req.client_id()).await;
    }
    Ok(())
}

async fn handle_unsubscribe(
    req: &Request,
    unsubscribe: &Unsubscribe,
    topics: &TopicRegistry,
) -> Result<(), ConnectionError> {
    let reason_codes: Vec<ReasonCode> = unsubscribe
        .filters
        .iter()
        .map(|filter| {
            if topics.unsubscribe(filter, req.client_id()) {
                ReasonCode::Success
            } else {
                ReasonCode::NoSubscriptionExisted
            }
        })
        .collect();

    req.reply(Packet::UnsubAck(UnsubAck {
        packet_id: unsubscribe.packet_id,
        reason_codes: match req.protocol_version() {
            ProtocolVersion::V5 => reason_codes,
            ProtocolVersion::V311 => Vec::new(),
        },
        properties: Default::default(),
    }))
    .await
}

/// Orderly close: the will is dropped unless a 5.0 client asked for it
fn handle_disconnect(req: &Request, disconnect: &Disconnect, topics: &TopicRegistry) {
    let keep_will = req.protocol_version() == ProtocolVersion::V5
        && disconnect.reason_code == ReasonCode::DisconnectWithWill;
    if !keep_will {
        topics.remove_will(req.client_id(), req.connection().id());
    }
    debug!("{} sent DISCONNECT ({})", req.client_id(), disconnect.reason_code);
    req.terminate();
}
