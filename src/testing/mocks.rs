//! Mock implementations for testing
//!
//! Provides mock broker client, modem, reboot handler and firmware
//! downloader implementations so the transport and its collaborators can be
//! driven without a broker or modem.

use crate::config::{
    DeviceSection, LocationSection, MqttSection, TrackerConfig, TransportSection, UpdateSection,
};
use crate::fota::{FirmwareDownloader, UpdateError, UpdateRequest};
use crate::modem::ModemInfo;
use crate::protocol::CellularSnapshot;
use crate::supervisor::RebootHandler;
use crate::transport::{BrokerClient, BrokerEvent, ConnectParams, MqttError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};

pub type PublishedMessage = (String, String);

/// Mock broker client for testing
///
/// Records every call. Handshakes are never confirmed on their own: tests
/// call [`MockBrokerClient::emit`] to play the broker's side. A disconnect
/// request is answered with [`BrokerEvent::Disconnected`], as a real session
/// would close.
#[derive(Debug, Default)]
pub struct MockBrokerClient {
    pub connects: Arc<Mutex<Vec<ConnectParams>>>,
    pub published_messages: Arc<Mutex<Vec<PublishedMessage>>>,
    pub subscriptions: Arc<Mutex<Vec<Vec<String>>>>,
    pub disconnects: Arc<AtomicUsize>,
    pub should_fail: Arc<AtomicBool>,
    /// Publishes that succeed before the client starts failing them
    pub publish_budget: Arc<Mutex<Option<usize>>>,
    pub event_sender: Arc<Mutex<Option<mpsc::Sender<BrokerEvent>>>>,
}

impl MockBrokerClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mock that reports broker events on `events`
    pub fn with_events(events: mpsc::Sender<BrokerEvent>) -> Self {
        Self {
            event_sender: Arc::new(Mutex::new(Some(events))),
            ..Default::default()
        }
    }

    pub fn with_failure() -> Self {
        let mock = Self::default();
        mock.should_fail.store(true, Ordering::SeqCst);
        mock
    }

    /// Fail every publish, subscribe and connect while `fail` is set
    pub fn set_failure(&self, fail: bool) {
        self.should_fail.store(fail, Ordering::SeqCst);
    }

    /// Allow `count` more publishes, then fail the rest
    pub async fn set_publish_budget(&self, count: Option<usize>) {
        *self.publish_budget.lock().await = count;
    }

    /// Deliver a broker callback as the session would
    pub async fn emit(&self, event: BrokerEvent) {
        let sender = self.event_sender.lock().await.clone();
        if let Some(sender) = sender {
            let _ = sender.send(event).await;
        }
    }

    pub async fn get_connects(&self) -> Vec<ConnectParams> {
        self.connects.lock().await.clone()
    }

    pub async fn get_published_messages(&self) -> Vec<PublishedMessage> {
        self.published_messages.lock().await.clone()
    }

    /// Payloads published on `topic`, in order
    pub async fn get_published_on(&self, topic: &str) -> Vec<String> {
        self.published_messages
            .lock()
            .await
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    pub async fn get_subscriptions(&self) -> Vec<Vec<String>> {
        self.subscriptions.lock().await.clone()
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub async fn clear_history(&self) {
        self.connects.lock().await.clear();
        self.published_messages.lock().await.clear();
        self.subscriptions.lock().await.clear();
        self.disconnects.store(0, Ordering::SeqCst);
    }

    fn failing(&self) -> bool {
        self.should_fail.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerClient for MockBrokerClient {
    async fn connect(&self, params: &ConnectParams) -> Result<(), MqttError> {
        self.connects.lock().await.push(params.clone());
        if self.failing() {
            return Err(MqttError::ConnectionFailed("Mock connection failure".into()));
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), MqttError> {
        if self.failing() {
            return Err(MqttError::PublishFailed("Mock publish failure".into()));
        }
        {
            let mut budget = self.publish_budget.lock().await;
            match budget.as_mut() {
                Some(0) => {
                    return Err(MqttError::PublishFailed("Mock publish budget spent".into()))
                }
                Some(remaining) => *remaining -= 1,
                None => {}
            }
        }

        self.published_messages.lock().await.push((
            topic.to_string(),
            String::from_utf8_lossy(&payload).into_owned(),
        ));
        Ok(())
    }

    async fn subscribe(&self, topics: &[String]) -> Result<(), MqttError> {
        if self.failing() {
            return Err(MqttError::SubscriptionFailed("Mock subscribe failure".into()));
        }
        self.subscriptions.lock().await.push(topics.to_vec());
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), MqttError> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        let sender = self.event_sender.lock().await.clone();
        if let Some(sender) = sender {
            let _ = sender.try_send(BrokerEvent::Disconnected);
        }
        Ok(())
    }
}

/// Mock modem with a settable parameter snapshot
#[derive(Debug)]
pub struct MockModem {
    identity: String,
    snapshot: std::sync::Mutex<CellularSnapshot>,
    pub snapshot_reads: AtomicUsize,
}

impl MockModem {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            snapshot: std::sync::Mutex::new(CellularSnapshot::default()),
            snapshot_reads: AtomicUsize::new(0),
        }
    }

    pub fn set_snapshot(&self, snapshot: CellularSnapshot) {
        *self.snapshot.lock().unwrap_or_else(|p| p.into_inner()) = snapshot;
    }
}

impl ModemInfo for MockModem {
    fn identity(&self) -> String {
        self.identity.clone()
    }

    fn snapshot(&self) -> CellularSnapshot {
        self.snapshot_reads.fetch_add(1, Ordering::SeqCst);
        self.snapshot
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

/// Reboot handler that records codes instead of exiting
#[derive(Debug, Default)]
pub struct RecordingReboot {
    codes: std::sync::Mutex<Vec<i32>>,
    rebooted: Notify,
}

impl RecordingReboot {
    pub fn codes(&self) -> Vec<i32> {
        self.codes.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Wait until at least `count` reboots were requested or `timeout` passes
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.rebooted.notified();
            if self.codes().len() >= count {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.codes().len() >= count;
            }
        }
    }
}

impl RebootHandler for RecordingReboot {
    fn reboot(&self, code: i32) {
        self.codes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(code);
        self.rebooted.notify_waiters();
    }
}

/// Mock downloader recording every request
#[derive(Debug, Default)]
pub struct MockDownloader {
    pub requests: Arc<Mutex<Vec<UpdateRequest>>>,
    pub should_fail: bool,
    started: Notify,
}

impl MockDownloader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure() -> Self {
        Self {
            should_fail: true,
            ..Default::default()
        }
    }

    pub async fn get_requests(&self) -> Vec<UpdateRequest> {
        self.requests.lock().await.clone()
    }

    /// Wait until at least `count` requests arrived or `timeout` passes
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.started.notified();
            if self.requests.lock().await.len() >= count {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.requests.lock().await.len() >= count;
            }
        }
    }
}

#[async_trait]
impl FirmwareDownloader for MockDownloader {
    async fn start(&self, request: &UpdateRequest) -> Result<(), UpdateError> {
        self.requests.lock().await.push(request.clone());
        self.started.notify_waiters();
        if self.should_fail {
            return Err(UpdateError::DownloadFailed("Mock download failure".to_string()));
        }
        Ok(())
    }
}

/// Configuration for tests: identity `350457791234567`, local broker
pub fn test_config() -> TrackerConfig {
    TrackerConfig {
        device: DeviceSection {
            identity: "350457791234567".to_string(),
        },
        mqtt: MqttSection {
            broker_url: "mqtt://localhost:1883".to_string(),
            username_env: None,
            password_env: None,
            keep_alive_secs: 60,
        },
        transport: TransportSection::default(),
        modem: CellularSnapshot::default(),
        update: UpdateSection::default(),
        location: LocationSection::default(),
    }
}
