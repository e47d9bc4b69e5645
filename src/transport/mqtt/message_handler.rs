//! Pure routing of MQTT library events into broker callbacks

use crate::transport::BrokerEvent;
use rumqttc::{ConnectReturnCode, Event, Packet, SubscribeReasonCode};

/// Routing decision for one event loop event
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Deliver this callback to the coordinator
    Deliver(BrokerEvent),
    /// Broker refused the handshake
    Refused(String),
    /// Keep-alive, acks and outgoing traffic
    Ignore,
}

/// Map one event from the event loop to a routing decision
pub fn route_mqtt_event(event: &Event) -> EventRoute {
    match event {
        Event::Incoming(Packet::ConnAck(ack)) => {
            if ack.code == ConnectReturnCode::Success {
                EventRoute::Deliver(BrokerEvent::Connected)
            } else {
                EventRoute::Refused(format!("{:?}", ack.code))
            }
        }
        Event::Incoming(Packet::Publish(publish)) => EventRoute::Deliver(BrokerEvent::Message {
            topic: publish.topic.clone(),
            payload: publish.payload.clone(),
        }),
        Event::Incoming(Packet::SubAck(suback)) => {
            EventRoute::Deliver(BrokerEvent::SubscriptionAcked {
                ok: subscription_succeeded(&suback.return_codes),
            })
        }
        Event::Incoming(Packet::Disconnect) => EventRoute::Deliver(BrokerEvent::Disconnected),
        Event::Incoming(_) | Event::Outgoing(_) => EventRoute::Ignore,
    }
}

/// True when every filter in a SubAck was granted
pub fn subscription_succeeded(return_codes: &[SubscribeReasonCode]) -> bool {
    return_codes
        .iter()
        .all(|code| matches!(code, SubscribeReasonCode::Success(_)))
}
