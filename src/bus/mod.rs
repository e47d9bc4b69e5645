//! Typed event bus
//!
//! A fixed set of named channels, each carrying one message type. A publish
//! stores the message as the channel's latest value and drops the channel id
//! into the inbox of every observer. Observers wake on their inbox and read
//! the latest value of the signalled channel, so a slow reader sees the most
//! recent message rather than every message.
//!
//! The observer set of each channel is declared up front in a [`Topology`];
//! building a [`Bus`] from a topology that leaves a channel unobserved fails.
//!
//! # Usage
//!
//! ```rust
//! use std::time::Duration;
//! use trackerlink::bus::{Bus, ChannelId, Observer};
//! use trackerlink::protocol::NetworkStatus;
//!
//! # tokio_test::block_on(async {
//! let bus = Bus::standard()?;
//! let mut transport = bus.subscribe(Observer::Transport)?;
//!
//! bus.network_status
//!     .publish(NetworkStatus::Connected, Duration::from_secs(1))
//!     .await?;
//!
//! assert_eq!(transport.wait(None).await?, ChannelId::NetworkStatus);
//! let status = transport.read(&bus.network_status, Duration::from_secs(1)).await?;
//! assert_eq!(status, NetworkStatus::Connected);
//! # Ok::<(), trackerlink::bus::BusError>(())
//! # }).unwrap();
//! ```

use crate::protocol::{FatalError, FirmwareFilename, GenericPayload, LocationFix, NetworkStatus};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace};

/// Default number of pending notifications per observer inbox
pub const DEFAULT_INBOX_DEPTH: usize = 10;

/// Identity of a bus channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelId {
    FirmwareUpdate,
    GenericPayload,
    NetworkStatus,
    FatalError,
    LocationFix,
}

impl ChannelId {
    pub const ALL: [ChannelId; 5] = [
        ChannelId::FirmwareUpdate,
        ChannelId::GenericPayload,
        ChannelId::NetworkStatus,
        ChannelId::FatalError,
        ChannelId::LocationFix,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ChannelId::FirmwareUpdate => "firmware-update",
            ChannelId::GenericPayload => "generic-payload",
            ChannelId::NetworkStatus => "network-status",
            ChannelId::FatalError => "fatal-error",
            ChannelId::LocationFix => "location-fix",
        }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Components that observe bus channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Observer {
    Transport,
    UpdateManager,
    LocationManager,
    Supervisor,
}

/// Static declaration of which observer listens on which channel
#[derive(Debug, Clone, Default)]
pub struct Topology {
    routes: HashMap<ChannelId, Vec<Observer>>,
}

impl Topology {
    /// Empty topology; every channel is unobserved
    pub fn empty() -> Self {
        Self::default()
    }

    /// The device's wiring
    pub fn standard() -> Self {
        Self::empty()
            .route(ChannelId::FirmwareUpdate, Observer::UpdateManager)
            .route(ChannelId::GenericPayload, Observer::Transport)
            .route(ChannelId::NetworkStatus, Observer::Transport)
            .route(ChannelId::NetworkStatus, Observer::LocationManager)
            .route(ChannelId::FatalError, Observer::Supervisor)
            .route(ChannelId::LocationFix, Observer::Transport)
    }

    /// Add `observer` to the observer set of `channel`
    pub fn route(mut self, channel: ChannelId, observer: Observer) -> Self {
        let observers = self.routes.entry(channel).or_default();
        if !observers.contains(&observer) {
            observers.push(observer);
        }
        self
    }

    pub fn observers_of(&self, channel: ChannelId) -> &[Observer] {
        self.routes.get(&channel).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn channels_of(&self, observer: Observer) -> HashSet<ChannelId> {
        self.routes
            .iter()
            .filter(|(_, observers)| observers.contains(&observer))
            .map(|(channel, _)| *channel)
            .collect()
    }

    fn observers(&self) -> HashSet<Observer> {
        self.routes.values().flatten().copied().collect()
    }
}

/// Bus errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("Timed out on channel {0}")]
    Timeout(ChannelId),
    #[error("Observer inbox closed on channel {0}")]
    Closed(ChannelId),
    #[error("Channel {0} has no observers")]
    Unobserved(ChannelId),
    #[error("Observer {0:?} already holds its inbox")]
    AlreadySubscribed(Observer),
    #[error("Observer {0:?} is not part of the topology")]
    UnknownObserver(Observer),
    #[error("Channel {0} is not observed by this subscriber")]
    NotObserved(ChannelId),
    #[error("Observer {0:?} saw no notification in time")]
    WaitTimeout(Observer),
    #[error("Inbox of observer {0:?} has no remaining publishers")]
    InboxClosed(Observer),
}

impl BusError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, BusError::Timeout(_) | BusError::WaitTimeout(_))
    }
}

/// One named channel holding its latest message
pub struct Channel<T> {
    id: ChannelId,
    latest: RwLock<T>,
    observers: Vec<mpsc::Sender<ChannelId>>,
}

impl<T: Clone + Default> Channel<T> {
    fn new(id: ChannelId, observers: Vec<mpsc::Sender<ChannelId>>) -> Self {
        Self {
            id,
            latest: RwLock::new(T::default()),
            observers,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Store `message` and notify every observer
    ///
    /// The whole operation, value lock and every inbox send, shares one
    /// deadline.
    pub async fn publish(&self, message: T, timeout: Duration) -> Result<(), BusError> {
        let deadline = deadline_after(timeout);

        {
            let mut slot = timeout_at(deadline, self.latest.write())
                .await
                .map_err(|_| BusError::Timeout(self.id))?;
            *slot = message;
        }

        for inbox in &self.observers {
            match timeout_at(deadline, inbox.send(self.id)).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return Err(BusError::Closed(self.id)),
                Err(_) => return Err(BusError::Timeout(self.id)),
            }
        }

        trace!(channel = %self.id, observers = self.observers.len(), "Published");
        Ok(())
    }

    async fn read_latest(&self, timeout: Duration) -> Result<T, BusError> {
        let deadline = deadline_after(timeout);
        let slot = timeout_at(deadline, self.latest.read())
            .await
            .map_err(|_| BusError::Timeout(self.id))?;
        Ok(slot.clone())
    }
}

/// Deadline `timeout` from now, saturating far in the future on overflow
fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(86400 * 365 * 30))
}

/// The device's full set of channels
pub struct Bus {
    pub firmware_update: Channel<FirmwareFilename>,
    pub generic_payload: Channel<GenericPayload>,
    pub network_status: Channel<NetworkStatus>,
    pub fatal_error: Channel<FatalError>,
    pub location_fix: Channel<LocationFix>,
    topology: Topology,
    inboxes: Mutex<HashMap<Observer, mpsc::Receiver<ChannelId>>>,
}

impl Bus {
    /// Build every channel from `topology`
    ///
    /// Fails with [`BusError::Unobserved`] when any channel has no observer.
    pub fn new(topology: Topology, inbox_depth: usize) -> Result<Self, BusError> {
        for channel in ChannelId::ALL {
            if topology.observers_of(channel).is_empty() {
                return Err(BusError::Unobserved(channel));
            }
        }

        let mut senders = HashMap::new();
        let mut inboxes = HashMap::new();
        for observer in topology.observers() {
            let (tx, rx) = mpsc::channel(inbox_depth.max(1));
            senders.insert(observer, tx);
            inboxes.insert(observer, rx);
        }

        let senders_for = |channel: ChannelId| -> Vec<mpsc::Sender<ChannelId>> {
            topology
                .observers_of(channel)
                .iter()
                .filter_map(|observer| senders.get(observer).cloned())
                .collect()
        };

        let bus = Self {
            firmware_update: Channel::new(
                ChannelId::FirmwareUpdate,
                senders_for(ChannelId::FirmwareUpdate),
            ),
            generic_payload: Channel::new(
                ChannelId::GenericPayload,
                senders_for(ChannelId::GenericPayload),
            ),
            network_status: Channel::new(
                ChannelId::NetworkStatus,
                senders_for(ChannelId::NetworkStatus),
            ),
            fatal_error: Channel::new(ChannelId::FatalError, senders_for(ChannelId::FatalError)),
            location_fix: Channel::new(
                ChannelId::LocationFix,
                senders_for(ChannelId::LocationFix),
            ),
            inboxes: Mutex::new(inboxes),
            topology,
        };

        debug!(inbox_depth, "Event bus built");
        Ok(bus)
    }

    /// Standard wiring with the default inbox depth
    pub fn standard() -> Result<Self, BusError> {
        Self::new(Topology::standard(), DEFAULT_INBOX_DEPTH)
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Hand out `observer`'s inbox; each observer may subscribe once
    pub fn subscribe(&self, observer: Observer) -> Result<Subscriber, BusError> {
        let channels = self.topology.channels_of(observer);
        if channels.is_empty() {
            return Err(BusError::UnknownObserver(observer));
        }

        let mut inboxes = self.inboxes.lock().unwrap_or_else(|p| p.into_inner());
        let inbox = inboxes
            .remove(&observer)
            .ok_or(BusError::AlreadySubscribed(observer))?;

        Ok(Subscriber {
            observer,
            channels,
            inbox,
        })
    }
}

/// An observer's handle on its inbox
pub struct Subscriber {
    observer: Observer,
    channels: HashSet<ChannelId>,
    inbox: mpsc::Receiver<ChannelId>,
}

impl Subscriber {
    pub fn observer(&self) -> Observer {
        self.observer
    }

    pub fn observes(&self, channel: ChannelId) -> bool {
        self.channels.contains(&channel)
    }

    /// Wait for the next notification; `None` waits indefinitely
    pub async fn wait(&mut self, timeout: Option<Duration>) -> Result<ChannelId, BusError> {
        let next = match timeout {
            Some(limit) => tokio::time::timeout(limit, self.inbox.recv())
                .await
                .map_err(|_| BusError::WaitTimeout(self.observer))?,
            None => self.inbox.recv().await,
        };
        next.ok_or(BusError::InboxClosed(self.observer))
    }

    /// Read the latest value of a channel this subscriber observes
    pub async fn read<T: Clone + Default>(
        &self,
        channel: &Channel<T>,
        timeout: Duration,
    ) -> Result<T, BusError> {
        if !self.observes(channel.id()) {
            return Err(BusError::NotObserved(channel.id()));
        }
        channel.read_latest(timeout).await
    }
}
