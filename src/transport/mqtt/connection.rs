//! Pure connection configuration for the MQTT session

use crate::config::{parse_broker_url, ConfigError, TrackerConfig};
use crate::protocol::{Topics, LAST_WILL_PAYLOAD};
use crate::transport::{ConnectParams, LastWillSpec};
use rumqttc::{LastWill, MqttOptions, QoS, Transport};
use thiserror::Error;

/// Largest packet accepted or sent, sized for the 700-byte payload buffer
/// plus topic and header overhead
pub const MAX_PACKET_SIZE: usize = 4 * 1024;

/// MQTT transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Connection failed")]
    ConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription failed")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Disconnect failed")]
    DisconnectFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Not connected")]
    NotConnected,
}

impl From<ConfigError> for MqttError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::InvalidBrokerUrl(url) => MqttError::InvalidBrokerUrl(url),
            other => MqttError::ConnectionFailed(Box::new(other)),
        }
    }
}

/// Build the parameters of one connect attempt
///
/// The device identity is the client id. The last will marks the device
/// offline on its login topic.
pub fn build_connect_params(
    config: &TrackerConfig,
    topics: &Topics,
) -> Result<ConnectParams, MqttError> {
    let endpoint = parse_broker_url(&config.mqtt.broker_url)?;
    let (username, password) = config.credentials();

    Ok(ConnectParams {
        host: endpoint.host,
        port: endpoint.port,
        tls: endpoint.tls,
        client_id: config.device.identity.clone(),
        username,
        password,
        keep_alive: config.keep_alive(),
        last_will: Some(LastWillSpec {
            topic: topics.login.clone(),
            payload: LAST_WILL_PAYLOAD.to_string(),
        }),
    })
}

/// Translate connect parameters into library options
pub fn configure_mqtt_options(params: &ConnectParams) -> MqttOptions {
    let mut options = MqttOptions::new(&params.client_id, &params.host, params.port);

    if params.tls {
        options.set_transport(Transport::tls_with_default_config());
    }

    options.set_credentials(&params.username, &params.password);
    options.set_keep_alive(params.keep_alive);
    options.set_clean_session(true);
    options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);

    if let Some(will) = &params.last_will {
        options.set_last_will(LastWill::new(
            &will.topic,
            will.payload.as_bytes().to_vec(),
            QoS::AtLeastOnce,
            false,
        ));
    }

    options
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config(broker_url: &str) -> TrackerConfig {
        TrackerConfig::from_toml_str(&format!(
            r#"
[device]
identity = "350457791234567"

[mqtt]
broker_url = "{broker_url}"
keep_alive_secs = 30
"#
        ))
        .unwrap()
    }

    #[test]
    fn test_connect_params_from_config() {
        let config = test_config("mqtt://broker.local:1884");
        let topics = config.topics().unwrap();
        let params = build_connect_params(&config, &topics).unwrap();

        assert_eq!(params.host, "broker.local");
        assert_eq!(params.port, 1884);
        assert!(!params.tls);
        assert_eq!(params.client_id, "350457791234567");
        assert_eq!(params.username, "350457791234567");
        assert_eq!(params.password, "350457791234567");
        assert_eq!(params.keep_alive, Duration::from_secs(30));
        assert_eq!(
            params.last_will,
            Some(LastWillSpec {
                topic: "ind/350457791234567/login".to_string(),
                payload: r#"{"networkStatus":"offline"}"#.to_string(),
            })
        );
    }

    #[test]
    fn test_tls_params() {
        let config = test_config("mqtts://broker.example.com");
        let topics = config.topics().unwrap();
        let params = build_connect_params(&config, &topics).unwrap();
        assert!(params.tls);
        assert_eq!(params.port, 8883);
    }

    #[test]
    fn test_configure_mqtt_options() {
        let config = test_config("mqtt://localhost:1883");
        let topics = config.topics().unwrap();
        let params = build_connect_params(&config, &topics).unwrap();
        let options = configure_mqtt_options(&params);

        assert_eq!(options.client_id(), "350457791234567");
        assert_eq!(options.keep_alive(), Duration::from_secs(30));
        assert_eq!(
            options.broker_address(),
            ("localhost".to_string(), 1883)
        );
        assert!(options.last_will().is_some());
    }

    #[test]
    fn test_invalid_url_maps_to_mqtt_error() {
        let err: MqttError = parse_broker_url("nonsense").unwrap_err().into();
        assert!(matches!(err, MqttError::InvalidBrokerUrl(_)));
    }

    #[test]
    fn test_mqtt_error_display() {
        let errors = vec![
            MqttError::ConnectionFailed("test".to_string().into()),
            MqttError::PublishFailed("test".to_string().into()),
            MqttError::SubscriptionFailed("test".to_string().into()),
            MqttError::DisconnectFailed("test".to_string().into()),
            MqttError::InvalidBrokerUrl("test".to_string()),
            MqttError::NotConnected,
        ];
        for error in errors {
            assert!(!error.to_string().is_empty());
        }
    }
}
