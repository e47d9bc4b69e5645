//! Impure MQTT session handling on top of rumqttc
//!
//! Each connect attempt builds a fresh client and event loop. The event loop
//! runs on its own task and reports the session's life through
//! [`BrokerEvent`]s; when the session ends the task reports `Disconnected`
//! and exits, and the next connect attempt starts over.

use super::connection::{configure_mqtt_options, MqttError};
use super::message_handler::{route_mqtt_event, EventRoute};
use crate::observability::metrics;
use crate::transport::{BrokerClient, BrokerEvent, ConnectParams};
use async_trait::async_trait;
use rumqttc::{AsyncClient, EventLoop, QoS, SubscribeFilter};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Request channel capacity between the client handle and its event loop
const REQUEST_CAPACITY: usize = 10;

struct Session {
    client: AsyncClient,
    event_loop_handle: JoinHandle<()>,
}

/// [`BrokerClient`] backed by a rumqttc session
pub struct MqttBrokerClient {
    events: mpsc::Sender<BrokerEvent>,
    session: Mutex<Option<Session>>,
}

impl MqttBrokerClient {
    /// Create a client that reports session events on `events`
    pub fn new(events: mpsc::Sender<BrokerEvent>) -> Self {
        Self {
            events,
            session: Mutex::new(None),
        }
    }

    async fn run_event_loop(mut event_loop: EventLoop, events: mpsc::Sender<BrokerEvent>) {
        loop {
            match event_loop.poll().await {
                Ok(event) => match route_mqtt_event(&event) {
                    EventRoute::Deliver(broker_event) => {
                        let session_over = broker_event == BrokerEvent::Disconnected;
                        if matches!(broker_event, BrokerEvent::Message { .. }) {
                            metrics().message_received();
                        }
                        if events.send(broker_event).await.is_err() || session_over {
                            break;
                        }
                    }
                    EventRoute::Refused(reason) => {
                        warn!(target: "transport", reason = %reason, "Broker refused connection");
                        let _ = events.send(BrokerEvent::Disconnected).await;
                        break;
                    }
                    EventRoute::Ignore => {}
                },
                Err(e) => {
                    debug!(target: "transport", error = %e, "MQTT event loop ended");
                    let _ = events.send(BrokerEvent::Disconnected).await;
                    break;
                }
            }
        }
    }

    async fn with_client<F, Fut>(&self, f: F) -> Result<(), MqttError>
    where
        F: FnOnce(AsyncClient) -> Fut,
        Fut: std::future::Future<Output = Result<(), MqttError>>,
    {
        let client = {
            let session = self.session.lock().await;
            session
                .as_ref()
                .map(|s| s.client.clone())
                .ok_or(MqttError::NotConnected)?
        };
        f(client).await
    }
}

#[async_trait]
impl BrokerClient for MqttBrokerClient {
    async fn connect(&self, params: &ConnectParams) -> Result<(), MqttError> {
        let options = configure_mqtt_options(params);
        let (client, event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);

        let mut session = self.session.lock().await;
        if let Some(previous) = session.take() {
            previous.event_loop_handle.abort();
        }

        info!(
            target: "transport",
            host = %params.host,
            port = params.port,
            tls = params.tls,
            client_id = %params.client_id,
            "Connecting to broker"
        );

        let handle = tokio::spawn(Self::run_event_loop(event_loop, self.events.clone()));
        *session = Some(Session {
            client,
            event_loop_handle: handle,
        });
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), MqttError> {
        let topic = topic.to_string();
        self.with_client(|client| async move {
            client
                .publish(topic, QoS::AtLeastOnce, false, payload)
                .await
                .map_err(|e| MqttError::PublishFailed(Box::new(e)))
        })
        .await
    }

    async fn subscribe(&self, topics: &[String]) -> Result<(), MqttError> {
        let filters: Vec<SubscribeFilter> = topics
            .iter()
            .map(|t| SubscribeFilter::new(t.clone(), QoS::AtLeastOnce))
            .collect();
        self.with_client(|client| async move {
            client
                .subscribe_many(filters)
                .await
                .map_err(|e| MqttError::SubscriptionFailed(Box::new(e)))
        })
        .await
    }

    async fn disconnect(&self) -> Result<(), MqttError> {
        match self
            .with_client(|client| async move {
                client
                    .disconnect()
                    .await
                    .map_err(|e| MqttError::DisconnectFailed(Box::new(e)))
            })
            .await
        {
            Err(MqttError::NotConnected) => Ok(()),
            other => other,
        }
    }
}

impl Drop for MqttBrokerClient {
    fn drop(&mut self) {
        if let Ok(mut session) = self.session.try_lock() {
            if let Some(session) = session.take() {
                session.event_loop_handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn unreachable_params() -> ConnectParams {
        ConnectParams {
            host: "127.0.0.1".to_string(),
            // Port 1 is reserved and refuses connections on loopback
            port: 1,
            tls: false,
            client_id: "test-device".to_string(),
            username: "test-device".to_string(),
            password: "test-device".to_string(),
            keep_alive: Duration::from_secs(30),
            last_will: None,
        }
    }

    #[tokio::test]
    async fn test_publish_without_session_fails() {
        let (tx, _rx) = mpsc::channel(4);
        let client = MqttBrokerClient::new(tx);
        let result = client.publish("ind/x/gps", b"{}".to_vec()).await;
        assert!(matches!(result, Err(MqttError::NotConnected)));
    }

    #[tokio::test]
    async fn test_subscribe_without_session_fails() {
        let (tx, _rx) = mpsc::channel(4);
        let client = MqttBrokerClient::new(tx);
        let result = client.subscribe(&["cmd/x/fota".to_string()]).await;
        assert!(matches!(result, Err(MqttError::NotConnected)));
    }

    #[tokio::test]
    async fn test_disconnect_without_session_is_ok() {
        let (tx, _rx) = mpsc::channel(4);
        let client = MqttBrokerClient::new(tx);
        assert!(client.disconnect().await.is_ok());
        assert!(client.disconnect().await.is_ok());
    }

    #[tokio::test]
    async fn test_refused_connection_reports_disconnected() {
        let (tx, mut rx) = mpsc::channel(4);
        let client = MqttBrokerClient::new(tx);
        client.connect(&unreachable_params()).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("event loop should report the failed session");
        assert_eq!(event, Some(BrokerEvent::Disconnected));
    }
}
