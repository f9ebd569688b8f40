//! MQTT transport for the device session
//!
//! # Architecture
//!
//! - [`connection`] - Pure connect options and topic construction
//! - [`message_handler`] - Pure routing of event-loop events
//! - [`session`] - Impure I/O: the rumqttc client and its event loop task

pub mod connection;
pub mod message_handler;
pub mod session;

// Re-export public types for convenience
pub use connection::{configure_mqtt_options, InboundTopic, TopicBuilder, BRIDGE_USERNAME};
pub use message_handler::{EventRoute, MessageCallback, MessageHandler};
pub use session::MqttSession;
