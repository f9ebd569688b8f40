//! Pure connection configuration and topic construction for MQTT
//!
//! Broker addressing follows the Cloud IoT MQTT bridge conventions: the
//! client id is the fully-qualified device path, the username is ignored by
//! the broker and the password carries the signed credential.

use crate::config::BrokerSettings;
use crate::credential::{Credential, DeviceIdentity};
use rumqttc::{MqttOptions, QoS, Transport};

/// Username sent with every connect; the bridge only checks the password
pub const BRIDGE_USERNAME: &str = "unused";

/// Pure function to build connect options for one session attempt
pub fn configure_mqtt_options(
    identity: &DeviceIdentity,
    credential: &Credential,
    settings: &BrokerSettings,
) -> MqttOptions {
    let mut mqtt_options = MqttOptions::new(identity.client_id(), &settings.host, settings.port);

    mqtt_options.set_credentials(BRIDGE_USERNAME, credential.token());
    mqtt_options.set_keep_alive(settings.keep_alive);
    mqtt_options.set_clean_session(true);
    mqtt_options.set_max_packet_size(settings.max_packet_size, settings.max_packet_size);

    if settings.tls {
        mqtt_options.set_transport(Transport::tls_with_default_config());
    }

    mqtt_options
}

/// Kind of an inbound message, decided from its topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundTopic {
    /// Device configuration pushed by the registry
    Config,
    /// Command, optionally under a subfolder
    Command { subfolder: Option<String> },
    /// Any topic this device did not subscribe to
    Other,
}

/// Topic names for one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicBuilder {
    device_id: String,
}

impl TopicBuilder {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
        }
    }

    /// Telemetry topic: `/devices/{device_id}/events[/{subfolder}]`
    ///
    /// Empty or slash-only subfolders publish to the default events topic.
    pub fn events(&self, subfolder: Option<&str>) -> String {
        let base = format!("/devices/{}/events", self.device_id);
        match subfolder.map(|s| s.trim_matches('/')).filter(|s| !s.is_empty()) {
            Some(subfolder) => format!("{base}/{subfolder}"),
            None => base,
        }
    }

    /// Configuration topic: `/devices/{device_id}/config`
    pub fn config(&self) -> String {
        format!("/devices/{}/config", self.device_id)
    }

    /// Command filter: `/devices/{device_id}/commands/#`
    pub fn commands(&self) -> String {
        format!("/devices/{}/commands/#", self.device_id)
    }

    /// Subscriptions made after every successful connect.
    ///
    /// Configuration uses QoS 1 so the latest config is always delivered;
    /// commands are best effort.
    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        vec![
            (self.config(), QoS::AtLeastOnce),
            (self.commands(), QoS::AtMostOnce),
        ]
    }

    pub fn classify(&self, topic: &str) -> InboundTopic {
        if topic == self.config() {
            return InboundTopic::Config;
        }

        let commands_prefix = format!("/devices/{}/commands", self.device_id);
        match topic.strip_prefix(&commands_prefix) {
            Some("") | Some("/") => InboundTopic::Command { subfolder: None },
            Some(rest) if rest.starts_with('/') => InboundTopic::Command {
                subfolder: Some(rest[1..].to_string()),
            },
            _ => InboundTopic::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_identity;
    use proptest::prelude::*;
    use std::time::Duration;

    fn settings() -> BrokerSettings {
        BrokerSettings {
            host: "localhost".to_string(),
            port: 1883,
            tls: false,
            ..BrokerSettings::default()
        }
    }

    #[test]
    fn test_configure_mqtt_options() {
        let identity = test_identity();
        let credential = Credential::new("header.claims.sig".to_string(), 1_700_000_000, 1_700_001_200);

        let options = configure_mqtt_options(&identity, &credential, &settings());

        assert_eq!(options.client_id(), identity.client_id());
        assert_eq!(
            options.broker_address(),
            ("localhost".to_string(), 1883)
        );
        assert_eq!(
            options.credentials(),
            Some((BRIDGE_USERNAME.to_string(), "header.claims.sig".to_string()))
        );
        assert_eq!(options.keep_alive(), Duration::from_secs(60));
        assert!(options.clean_session());
    }

    #[test]
    fn test_topic_construction() {
        let topics = TopicBuilder::new("device-1");
        assert_eq!(topics.events(None), "/devices/device-1/events");
        assert_eq!(topics.events(Some("weather")), "/devices/device-1/events/weather");
        assert_eq!(topics.events(Some("/weather/")), "/devices/device-1/events/weather");
        assert_eq!(topics.events(Some("")), "/devices/device-1/events");
        assert_eq!(topics.config(), "/devices/device-1/config");
        assert_eq!(topics.commands(), "/devices/device-1/commands/#");
    }

    #[test]
    fn test_subscriptions_qos() {
        let subscriptions = TopicBuilder::new("device-1").subscriptions();
        assert_eq!(
            subscriptions,
            vec![
                ("/devices/device-1/config".to_string(), QoS::AtLeastOnce),
                ("/devices/device-1/commands/#".to_string(), QoS::AtMostOnce),
            ]
        );
    }

    #[test]
    fn test_classify_inbound_topics() {
        let topics = TopicBuilder::new("device-1");
        assert_eq!(topics.classify("/devices/device-1/config"), InboundTopic::Config);
        assert_eq!(
            topics.classify("/devices/device-1/commands"),
            InboundTopic::Command { subfolder: None }
        );
        assert_eq!(
            topics.classify("/devices/device-1/commands/reboot"),
            InboundTopic::Command {
                subfolder: Some("reboot".to_string())
            }
        );
        assert_eq!(
            topics.classify("/devices/device-1/commandsX"),
            InboundTopic::Other
        );
        assert_eq!(
            topics.classify("/devices/device-2/config"),
            InboundTopic::Other
        );
    }

    proptest! {
        #[test]
        fn events_topic_stays_under_device(
            device in "[a-zA-Z][a-zA-Z0-9_-]{0,30}",
            subfolder in proptest::option::of("[a-z0-9/]{0,12}"),
        ) {
            let topics = TopicBuilder::new(device.clone());
            let topic = topics.events(subfolder.as_deref());
            let prefix = format!("/devices/{device}/events");
            prop_assert!(topic.starts_with(&prefix));
            prop_assert!(!topic.ends_with('/'));
            prop_assert!(!topic.contains("events//"));
        }
    }
}
