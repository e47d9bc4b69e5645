//! MQTT implementation of the broker client boundary
//!
//! - [`connection`] - pure session configuration
//! - [`message_handler`] - pure routing of event loop events
//! - [`client`] - the rumqttc session and its event loop task

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::MqttBrokerClient;
pub use connection::{build_connect_params, configure_mqtt_options, MqttError};
pub use message_handler::{route_mqtt_event, EventRoute};
