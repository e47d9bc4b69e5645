//! Transport coordinator and broker client boundary
//!
//! The coordinator turns bus traffic and broker callbacks into state machine
//! events, the work executor runs the connect and drain items, and the
//! broker client trait keeps the MQTT library at arm's length so the whole
//! path can be driven by a mock in tests.

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

pub mod coordinator;
pub mod mqtt;
pub mod queue;
pub mod scheduler;
pub mod state;
pub mod worker;

pub use coordinator::{ConnectionContext, Coordinator, TransportHandle};
pub use mqtt::{MqttBrokerClient, MqttError};
pub use queue::{BoundedQueue, OutboundQueues};
pub use scheduler::{Work, WorkHandler, WorkQueue};
pub use state::{Effect, LinkEvent, LinkMachine, LinkState};
pub use worker::TransportWorker;

/// Last will registered with the broker at connect time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWillSpec {
    pub topic: String,
    pub payload: String,
}

/// Everything needed to open one broker session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub keep_alive: Duration,
    pub last_will: Option<LastWillSpec>,
}

/// Callbacks from the broker session, delivered to the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    /// Handshake acknowledged
    Connected,
    /// Session closed or failed
    Disconnected,
    /// Message arrived on a subscribed topic
    Message { topic: String, payload: Bytes },
    /// Subscription acknowledged; `ok` is false when any filter was refused
    SubscriptionAcked { ok: bool },
}

/// Broker session primitives
///
/// All calls return once the request is handed to the session; outcomes such
/// as the handshake arrive later as [`BrokerEvent`]s.
#[async_trait]
pub trait BrokerClient: Send + Sync + 'static {
    async fn connect(&self, params: &ConnectParams) -> Result<(), MqttError>;

    /// Publish at QoS 1
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), MqttError>;

    async fn subscribe(&self, topics: &[String]) -> Result<(), MqttError>;

    async fn disconnect(&self) -> Result<(), MqttError>;
}
