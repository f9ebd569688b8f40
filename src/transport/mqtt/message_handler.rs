//! Pure routing of MQTT event-loop events
//!
//! The session's event loop feeds every event through [`MessageHandler::route_event`]
//! and acts on the returned [`EventRoute`]; nothing here does I/O.

use super::connection::{InboundTopic, TopicBuilder};
use bytes::Bytes;
use rumqttc::{ConnectReturnCode, ConnectionError, Event, Outgoing, Packet};
use std::sync::Arc;
use tracing::{debug, info};

/// Callback for inbound config and command messages: `(topic, payload)`
pub type MessageCallback = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventRoute {
    /// Broker accepted the connect
    ConnectionAccepted,
    /// Broker rejected the connect (bad credential, unknown device)
    ConnectionRefused(String),
    /// Message received on a subscribed topic
    MessageReceived { topic: String, payload: Bytes },
    /// Session ended by either side
    Disconnected,
    /// Any other traffic; proves the link is alive
    Activity,
}

pub struct MessageHandler;

impl MessageHandler {
    /// Route an event-loop event (pure function)
    pub fn route_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(Packet::ConnAck(ack)) => match ack.code {
                ConnectReturnCode::Success => EventRoute::ConnectionAccepted,
                code => EventRoute::ConnectionRefused(format!("{code:?}")),
            },
            Event::Incoming(Packet::Publish(publish)) => EventRoute::MessageReceived {
                topic: publish.topic.clone(),
                payload: publish.payload.clone(),
            },
            Event::Incoming(Packet::Disconnect) => EventRoute::Disconnected,
            Event::Outgoing(Outgoing::Disconnect) => EventRoute::Disconnected,
            _ => EventRoute::Activity,
        }
    }

    /// Describe an event-loop error; refusals carry the broker's return code
    pub fn classify_error(error: &ConnectionError) -> EventRoute {
        match error {
            ConnectionError::ConnectionRefused(code) => {
                EventRoute::ConnectionRefused(format!("{code:?}"))
            }
            _ => EventRoute::Disconnected,
        }
    }

    /// Log an inbound message and hand it to the callback, if any
    pub fn dispatch(
        topics: &TopicBuilder,
        callback: Option<&MessageCallback>,
        topic: &str,
        payload: &[u8],
    ) {
        match topics.classify(topic) {
            InboundTopic::Config => {
                info!(bytes = payload.len(), "Received device configuration");
            }
            InboundTopic::Command { subfolder } => {
                info!(?subfolder, bytes = payload.len(), "Received command");
            }
            InboundTopic::Other => {
                debug!("Ignoring message on unexpected topic {}", topic);
                return;
            }
        }

        if let Some(callback) = callback {
            callback(topic, payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::{ConnAck, Publish, QoS};
    use std::sync::Mutex;

    #[test]
    fn test_route_connack() {
        let accepted = Event::Incoming(Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::Success,
            false,
        )));
        assert_eq!(
            MessageHandler::route_event(&accepted),
            EventRoute::ConnectionAccepted
        );

        let refused = Event::Incoming(Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::BadUserNamePassword,
            false,
        )));
        assert!(matches!(
            MessageHandler::route_event(&refused),
            EventRoute::ConnectionRefused(reason) if reason.contains("BadUserNamePassword")
        ));
    }

    #[test]
    fn test_route_publish() {
        let publish = Publish::new("/devices/device-1/config", QoS::AtLeastOnce, vec![1u8, 2]);
        assert_eq!(
            MessageHandler::route_event(&Event::Incoming(Packet::Publish(publish))),
            EventRoute::MessageReceived {
                topic: "/devices/device-1/config".to_string(),
                payload: Bytes::from_static(&[1, 2]),
            }
        );
    }

    #[test]
    fn test_route_disconnect_and_activity() {
        assert_eq!(
            MessageHandler::route_event(&Event::Incoming(Packet::Disconnect)),
            EventRoute::Disconnected
        );
        assert_eq!(
            MessageHandler::route_event(&Event::Outgoing(Outgoing::Disconnect)),
            EventRoute::Disconnected
        );
        assert_eq!(
            MessageHandler::route_event(&Event::Incoming(Packet::PingResp)),
            EventRoute::Activity
        );
        assert_eq!(
            MessageHandler::route_event(&Event::Outgoing(Outgoing::PingReq)),
            EventRoute::Activity
        );
    }

    #[test]
    fn test_classify_refused_error() {
        let error = ConnectionError::ConnectionRefused(ConnectReturnCode::NotAuthorized);
        assert!(matches!(
            MessageHandler::classify_error(&error),
            EventRoute::ConnectionRefused(reason) if reason.contains("NotAuthorized")
        ));
        assert_eq!(
            MessageHandler::classify_error(&ConnectionError::RequestsDone),
            EventRoute::Disconnected
        );
    }

    #[test]
    fn test_dispatch_only_forwards_known_topics() {
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: MessageCallback = Arc::new(move |topic: &str, _payload: &[u8]| {
            sink.lock().unwrap().push(topic.to_string());
        });
        let topics = TopicBuilder::new("device-1");

        MessageHandler::dispatch(&topics, Some(&callback), "/devices/device-1/config", b"{}");
        MessageHandler::dispatch(&topics, Some(&callback), "/devices/device-1/commands/led", b"on");
        MessageHandler::dispatch(&topics, Some(&callback), "/devices/other/config", b"{}");

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                "/devices/device-1/config".to_string(),
                "/devices/device-1/commands/led".to_string()
            ]
        );
    }
}
