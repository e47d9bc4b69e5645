//! Transport coordinator
//!
//! The coordinator is the only owner of the [`ConnectionContext`]. It waits
//! on the transport's bus inbox and on broker callbacks, turns both into
//! [`LinkEvent`]s for the state machine and carries out the effects each
//! transition asks for. Delayed work (connect attempts, queue drains) is
//! handed to the private executor through the [`WorkQueue`].

use super::queue::OutboundQueues;
use super::scheduler::{Work, WorkQueue};
use super::state::{Effect, LinkEvent, LinkMachine, LinkState, Transition};
use super::worker::TransportWorker;
use super::{BrokerClient, BrokerEvent};
use crate::bus::{Bus, BusError, ChannelId, Subscriber};
use crate::bus_span;
use crate::config::{GenericDispatch, TrackerConfig};
use crate::modem::ModemInfo;
use crate::observability::metrics;
use crate::protocol::{FirmwareFilename, GenericPayload, LoginMessage, NetworkStatus, Topics};
use crate::supervisor::{FatalEscalator, GENERIC_FATAL_CODE};
use crate::version::FirmwareVersion;
use once_cell::sync::OnceCell;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Deadline for handing a firmware command to the update manager
pub const FOTA_REDIRECT_TIMEOUT: Duration = Duration::from_secs(1);

/// State owned by the coordinator task
#[derive(Debug)]
pub struct ConnectionContext {
    pub machine: LinkMachine,
    /// Channel of the most recent notification
    pub last_channel: Option<ChannelId>,
    /// Most recent network status read from the bus
    pub network: NetworkStatus,
    /// Payload waiting for a direct publish
    pub pending: Option<GenericPayload>,
    /// Login document for the next successful connect
    pub login: Option<LoginMessage>,
}

impl ConnectionContext {
    pub fn new(settle_delay: Duration, reconnect_period: Duration) -> Self {
        Self {
            machine: LinkMachine::new(settle_delay, reconnect_period),
            last_channel: None,
            network: NetworkStatus::Disconnected,
            pending: None,
            login: None,
        }
    }
}

/// Handles for a started transport
pub struct TransportHandle {
    pub coordinator: JoinHandle<()>,
    pub executor: JoinHandle<()>,
    pub link: watch::Receiver<LinkState>,
    pub queues: Arc<OutboundQueues>,
    pub work: WorkQueue,
}

/// Drives the broker link from bus traffic and broker callbacks
pub struct Coordinator<B> {
    config: Arc<TrackerConfig>,
    bus: Arc<Bus>,
    subscriber: Subscriber,
    broker: Arc<B>,
    broker_events: mpsc::Receiver<BrokerEvent>,
    modem: Arc<dyn ModemInfo>,
    escalator: FatalEscalator,
    queues: Arc<OutboundQueues>,
    work: WorkQueue,
    topics: Arc<OnceCell<Topics>>,
    link: watch::Sender<LinkState>,
    context: ConnectionContext,
}

impl<B: BrokerClient> Coordinator<B> {
    pub fn new(
        config: Arc<TrackerConfig>,
        bus: Arc<Bus>,
        subscriber: Subscriber,
        broker: Arc<B>,
        broker_events: mpsc::Receiver<BrokerEvent>,
        modem: Arc<dyn ModemInfo>,
        escalator: FatalEscalator,
    ) -> Self {
        let (link, _) = watch::channel(LinkState::Disconnected);
        Self {
            queues: Arc::new(OutboundQueues::new(config.transport.queue_depth)),
            context: ConnectionContext::new(config.settle_delay(), config.reconnect_timeout()),
            work: WorkQueue::new(),
            topics: Arc::new(OnceCell::new()),
            config,
            bus,
            subscriber,
            broker,
            broker_events,
            modem,
            escalator,
            link,
        }
    }

    pub fn link_state(&self) -> watch::Receiver<LinkState> {
        self.link.subscribe()
    }

    pub fn queues(&self) -> Arc<OutboundQueues> {
        Arc::clone(&self.queues)
    }

    pub fn work_queue(&self) -> WorkQueue {
        self.work.clone()
    }

    /// Work handler sharing this coordinator's queues, topics and link state
    pub fn worker(&self) -> TransportWorker<B> {
        TransportWorker::new(
            Arc::clone(&self.broker),
            Arc::clone(&self.queues),
            Arc::clone(&self.topics),
            Arc::clone(&self.config),
            self.link.subscribe(),
        )
    }

    /// Spawn the executor and the coordinator loop
    pub fn start(self, shutdown: watch::Receiver<bool>) -> TransportHandle {
        let executor = self.work.start(Arc::new(self.worker()), shutdown.clone());
        let link = self.link_state();
        let queues = self.queues();
        let work = self.work_queue();
        let coordinator = tokio::spawn(self.run(shutdown));
        TransportHandle {
            coordinator,
            executor,
            link,
            queues,
            work,
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(target: "transport", "Transport coordinator started");
        loop {
            let flow = tokio::select! {
                next = self.subscriber.wait(None) => match next {
                    Ok(channel) => {
                        self.on_channel(channel)
                            .instrument(bus_span!(channel = %channel))
                            .await
                    }
                    Err(e) => {
                        warn!(target: "transport", error = %e, "Transport inbox closed");
                        ControlFlow::Break(())
                    }
                },
                event = self.broker_events.recv() => match event {
                    Some(event) => self.on_broker_event(event).await,
                    None => {
                        warn!(target: "transport", "Broker event channel closed");
                        ControlFlow::Break(())
                    }
                },
                _ = shutdown.changed() => ControlFlow::Break(()),
            };
            if flow.is_break() {
                break;
            }
        }

        self.work.cancel(Work::Connect);
        self.work.cancel(Work::Drain);
        if self.context.machine.state() == LinkState::Connected {
            if let Err(e) = self.broker.disconnect().await {
                warn!(target: "transport", error = %e, "Disconnect on shutdown failed");
            }
        }
        info!(target: "transport", "Transport coordinator stopped");
    }

    async fn fatal(&self, what: &str, error: BusError) -> ControlFlow<()> {
        error!(target: "transport", error = %error, "{what}");
        self.escalator.escalate(GENERIC_FATAL_CODE).await;
        ControlFlow::Break(())
    }

    async fn on_channel(&mut self, channel: ChannelId) -> ControlFlow<()> {
        self.context.last_channel = Some(channel);
        let read_timeout = self.config.read_timeout();

        match channel {
            ChannelId::NetworkStatus => {
                let status = match self
                    .subscriber
                    .read(&self.bus.network_status, read_timeout)
                    .await
                {
                    Ok(status) => status,
                    Err(e) => return self.fatal("Failed to read network status", e).await,
                };
                info!(target: "transport", ?status, "Network status");
                self.context.network = status;
                self.refresh_login();

                if status == NetworkStatus::Connected && !self.ensure_topics() {
                    return ControlFlow::Continue(());
                }
                self.dispatch(LinkEvent::Network(status)).await;
            }
            ChannelId::LocationFix => {
                let fix = match self
                    .subscriber
                    .read(&self.bus.location_fix, read_timeout)
                    .await
                {
                    Ok(fix) => fix,
                    Err(e) => return self.fatal("Failed to read location fix", e).await,
                };
                self.queues.push_location(fix);
                self.dispatch(LinkEvent::Payload {
                    channel,
                    direct: false,
                })
                .await;
            }
            ChannelId::GenericPayload => {
                let payload = match self
                    .subscriber
                    .read(&self.bus.generic_payload, read_timeout)
                    .await
                {
                    Ok(payload) => payload,
                    Err(e) => return self.fatal("Failed to read generic payload", e).await,
                };
                let direct = self.config.transport.generic_dispatch == GenericDispatch::Direct
                    && self.context.machine.state() == LinkState::Connected;
                if direct {
                    self.context.pending = Some(payload);
                } else {
                    self.queues.push_generic(payload);
                }
                self.dispatch(LinkEvent::Payload { channel, direct }).await;
            }
            ChannelId::FirmwareUpdate | ChannelId::FatalError => {
                debug!(
                    target: "transport",
                    %channel,
                    "Notification outside transport channels ignored"
                );
            }
        }
        ControlFlow::Continue(())
    }

    async fn on_broker_event(&mut self, event: BrokerEvent) -> ControlFlow<()> {
        match event {
            BrokerEvent::Connected => self.dispatch(LinkEvent::BrokerConnected).await,
            BrokerEvent::Disconnected => self.dispatch(LinkEvent::BrokerDisconnected).await,
            BrokerEvent::SubscriptionAcked { ok: true } => {
                info!(target: "transport", "Command subscriptions acknowledged");
            }
            BrokerEvent::SubscriptionAcked { ok: false } => {
                error!(target: "transport", "Broker refused a command subscription");
            }
            BrokerEvent::Message { topic, payload } => {
                let Some(topics) = self.topics.get() else {
                    warn!(target: "transport", %topic, "Message before topics were derived");
                    return ControlFlow::Continue(());
                };
                if topic == topics.fota {
                    info!(
                        target: "transport",
                        len = payload.len(),
                        "Firmware update command received"
                    );
                    if let Err(e) = self
                        .bus
                        .firmware_update
                        .publish(FirmwareFilename(payload), FOTA_REDIRECT_TIMEOUT)
                        .await
                    {
                        error!(
                            target: "transport",
                            error = %e,
                            "Failed to forward firmware update command"
                        );
                        self.escalator.escalate(GENERIC_FATAL_CODE).await;
                        return ControlFlow::Break(());
                    }
                } else if topic == topics.psk {
                    info!(
                        target: "transport",
                        "Credential command received, provisioning is handled elsewhere"
                    );
                } else {
                    warn!(target: "transport", %topic, "Message on unexpected topic");
                }
            }
        }
        ControlFlow::Continue(())
    }

    /// Derive the topics once; false when they are unavailable
    fn ensure_topics(&self) -> bool {
        if self.topics.get().is_some() {
            return true;
        }
        match Topics::derive(
            &self.modem.identity(),
            &self.config.transport.generic_topic,
            self.config.transport.max_topic_len,
        ) {
            Ok(topics) => {
                info!(target: "transport", login = %topics.login, "Topics derived");
                let _ = self.topics.set(topics);
                true
            }
            Err(e) => {
                error!(
                    target: "transport",
                    error = %e,
                    "Topic derivation failed, broker link unavailable"
                );
                false
            }
        }
    }

    fn refresh_login(&mut self) {
        let firmware = FirmwareVersion::current();
        self.context.login = Some(LoginMessage::online(&self.modem.snapshot(), &firmware.full));
    }

    async fn dispatch(&mut self, event: LinkEvent) {
        let (transition, effects) = self.context.machine.handle(event, self.context.network);

        if let Transition::Entered(state) = transition {
            info!(target: "transport", %state, ?event, "Link state changed");
            match state {
                LinkState::Connected => metrics().connection_established(),
                LinkState::Disconnected => {
                    metrics().connection_lost();
                    self.context.pending = None;
                }
            }
            self.link.send_replace(state);
        }

        for effect in effects {
            self.apply(effect).await;
        }
    }

    async fn apply(&mut self, effect: Effect) {
        debug!(target: "transport", ?effect, "Applying effect");
        match effect {
            Effect::ScheduleConnect(delay) => {
                info!(target: "transport", ?delay, "Connect scheduled");
                self.work.schedule(Work::Connect, delay);
            }
            Effect::CancelConnect => {
                self.work.cancel(Work::Connect);
            }
            Effect::CancelDrain => {
                self.work.cancel(Work::Drain);
            }
            Effect::DisconnectBroker => {
                if let Err(e) = self.broker.disconnect().await {
                    warn!(target: "transport", error = %e, "Disconnect request failed");
                }
            }
            Effect::PublishLogin => self.publish_login().await,
            Effect::SubscribeCommands => {
                let Some(topics) = self.topics.get() else {
                    return;
                };
                if let Err(e) = self.broker.subscribe(&topics.command_topics()).await {
                    error!(target: "transport", error = %e, "Subscribing to command topics failed");
                }
            }
            Effect::KickDrain => self.work.submit(Work::Drain),
            Effect::PublishPending => self.publish_pending().await,
        }
    }

    async fn publish_login(&mut self) {
        if self.context.login.is_none() {
            self.refresh_login();
        }
        let Some(topics) = self.topics.get() else {
            return;
        };
        let Some(login) = self.context.login.as_ref() else {
            return;
        };

        let json = match login.to_json() {
            Ok(json) => json,
            Err(e) => {
                error!(target: "transport", error = %e, "Cannot encode login message");
                return;
            }
        };
        match self.broker.publish(&topics.login, json.into_bytes()).await {
            Ok(()) => {
                metrics().message_published();
                info!(target: "transport", topic = %topics.login, "Login published");
            }
            Err(e) => {
                metrics().publish_failed();
                warn!(target: "transport", error = %e, "Publishing login failed");
            }
        }
    }

    async fn publish_pending(&mut self) {
        let Some(payload) = self.context.pending.take() else {
            return;
        };
        let Some(topics) = self.topics.get() else {
            self.queues.push_generic(payload);
            return;
        };

        match self
            .broker
            .publish(&topics.generic, payload.as_str().as_bytes().to_vec())
            .await
        {
            Ok(()) => metrics().message_published(),
            Err(e) => {
                metrics().publish_failed();
                warn!(target: "transport", error = %e, "Direct publish failed, queueing payload");
                if self.queues.push_generic(payload) {
                    self.work.submit(Work::Drain);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Observer;
    use crate::protocol::LocationFix;
    use crate::testing::mocks::{test_config, MockBrokerClient, MockModem, RecordingReboot};

    struct Harness {
        bus: Arc<Bus>,
        broker: Arc<MockBrokerClient>,
        reboot: Arc<RecordingReboot>,
        handle: TransportHandle,
        _shutdown: watch::Sender<bool>,
        _location: Subscriber,
        update: Subscriber,
    }

    fn harness(config: TrackerConfig) -> Harness {
        let bus = Arc::new(Bus::standard().unwrap());
        let subscriber = bus.subscribe(Observer::Transport).unwrap();
        let location = bus.subscribe(Observer::LocationManager).unwrap();
        let update = bus.subscribe(Observer::UpdateManager).unwrap();
        let (events_tx, events_rx) = mpsc::channel(16);
        let broker = Arc::new(MockBrokerClient::with_events(events_tx));
        let reboot = Arc::new(RecordingReboot::default());
        let escalator = FatalEscalator::new(Arc::clone(&bus), reboot.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let coordinator = Coordinator::new(
            Arc::new(config),
            Arc::clone(&bus),
            subscriber,
            Arc::clone(&broker),
            events_rx,
            Arc::new(MockModem::new("350457791234567")),
            escalator,
        );
        let handle = coordinator.start(shutdown_rx);
        Harness {
            bus,
            broker,
            reboot,
            handle,
            _shutdown: shutdown_tx,
            _location: location,
            update,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    async fn attach_and_connect(h: &Harness) {
        h.bus
            .network_status
            .publish(NetworkStatus::Connected, Duration::from_secs(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;
        h.broker.emit(BrokerEvent::Connected).await;
        settle().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_is_scheduled_after_settle_delay() {
        let h = harness(test_config());
        h.bus
            .network_status
            .publish(NetworkStatus::Connected, Duration::from_secs(1))
            .await
            .unwrap();
        settle().await;
        assert!(h.handle.work.is_pending(Work::Connect));
        assert!(h.broker.get_connects().await.is_empty());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.broker.get_connects().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_publishes_login_and_subscribes() {
        let h = harness(test_config());
        attach_and_connect(&h).await;

        assert_eq!(*h.handle.link.borrow(), LinkState::Connected);
        assert!(!h.handle.work.is_pending(Work::Connect));
        let login = h.broker.get_published_on("ind/350457791234567/login").await;
        assert_eq!(login.len(), 1);
        assert!(login[0].contains("\"networkStatus\":\"online\""));
        assert_eq!(
            h.broker.get_subscriptions().await,
            vec![vec![
                "cmd/350457791234567/fota".to_string(),
                "cmd/350457791234567/psk".to_string()
            ]]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_fix_is_published_while_connected() {
        let h = harness(test_config());
        attach_and_connect(&h).await;

        h.bus
            .location_fix
            .publish(
                LocationFix {
                    meas_id: 5,
                    latitude: 59.91,
                    longitude: 10.75,
                    ..Default::default()
                },
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        settle().await;

        let gps = h.broker.get_published_on("ind/350457791234567/gps").await;
        assert_eq!(gps.len(), 1);
        assert!(gps[0].contains("\"measId\":5"));
        assert!(h.handle.queues.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_loss_disconnects_and_leaves_connect_unscheduled() {
        let h = harness(test_config());
        attach_and_connect(&h).await;

        h.bus
            .network_status
            .publish(NetworkStatus::Disconnected, Duration::from_secs(1))
            .await
            .unwrap();
        settle().await;

        assert_eq!(h.broker.disconnect_count(), 1);
        assert_eq!(*h.handle.link.borrow(), LinkState::Disconnected);
        assert!(!h.handle.work.is_pending(Work::Connect));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fota_command_is_forwarded() {
        let mut h = harness(test_config());
        attach_and_connect(&h).await;

        h.broker
            .emit(BrokerEvent::Message {
                topic: "cmd/350457791234567/fota".to_string(),
                payload: bytes::Bytes::from_static(b"app_v2.bin"),
            })
            .await;
        settle().await;

        assert_eq!(
            h.update.wait(Some(Duration::from_secs(1))).await,
            Ok(ChannelId::FirmwareUpdate)
        );
        let filename = h
            .update
            .read(&h.bus.firmware_update, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(filename.as_bytes(), b"app_v2.bin");
        assert!(h.reboot.codes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_direct_dispatch_publishes_without_queueing() {
        let mut config = test_config();
        config.transport.generic_dispatch = GenericDispatch::Direct;
        let h = harness(config);
        attach_and_connect(&h).await;

        h.bus
            .generic_payload
            .publish(GenericPayload::new("hello").unwrap(), Duration::from_secs(1))
            .await
            .unwrap();
        settle().await;

        assert_eq!(
            h.broker.get_published_on("ind/350457791234567/data").await,
            vec!["hello".to_string()]
        );
        assert!(h.handle.queues.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_payload_waits_in_queue_while_disconnected() {
        let h = harness(test_config());
        h.bus
            .generic_payload
            .publish(GenericPayload::new("later").unwrap(), Duration::from_secs(1))
            .await
            .unwrap();
        settle().await;
        assert_eq!(h.handle.queues.generic.len(), 1);
        assert!(h.broker.get_published_messages().await.is_empty());
    }
}
