//! Location fixes
//!
//! The location manager holds off until the network first attaches, then
//! publishes every fix from its [`FixSource`] on the location-fix channel,
//! stamping each with the next measurement id.

use crate::bus::{Bus, BusError, ChannelId, Subscriber};
use crate::observability::metrics;
use crate::protocol::{LocationFix, NetworkStatus};
use crate::supervisor::{FatalEscalator, GENERIC_FATAL_CODE};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::sync::watch;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Deadline for publishing one fix
pub const LOCATION_PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

/// Source of position fixes
#[async_trait]
pub trait FixSource: Send + 'static {
    /// Next fix, or `None` once the source is exhausted
    async fn next_fix(&mut self) -> Option<LocationFix>;
}

/// Replays fixes from JSON lines at a fixed rate
pub struct JsonLinesFixSource {
    lines: Lines<Box<dyn AsyncBufRead + Unpin + Send>>,
    ticker: Interval,
}

impl JsonLinesFixSource {
    pub fn from_reader<R>(reader: R, period: Duration) -> Self
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        let reader: Box<dyn AsyncBufRead + Unpin + Send> = Box::new(reader);
        let mut ticker = interval(period.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            lines: reader.lines(),
            ticker,
        }
    }

    pub async fn open(path: &Path, period: Duration) -> std::io::Result<Self> {
        let file = tokio::fs::File::open(path).await?;
        Ok(Self::from_reader(BufReader::new(file), period))
    }
}

#[async_trait]
impl FixSource for JsonLinesFixSource {
    async fn next_fix(&mut self) -> Option<LocationFix> {
        self.ticker.tick().await;
        loop {
            match self.lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<LocationFix>(line) {
                        Ok(fix) => return Some(fix),
                        Err(e) => warn!(error = %e, "Skipping malformed fix"),
                    }
                }
                Ok(None) => return None,
                Err(e) => {
                    warn!(error = %e, "Fix source read failed");
                    return None;
                }
            }
        }
    }
}

/// Network status carried by a notification, if it is one
///
/// Takes the subscriber and bus by reference; the manager itself is not
/// `Sync` when its fix source isn't.
async fn network_notification(
    subscriber: &Subscriber,
    bus: &Bus,
    channel: ChannelId,
    read_timeout: Duration,
) -> Result<Option<NetworkStatus>, BusError> {
    if channel != ChannelId::NetworkStatus {
        return Ok(None);
    }
    subscriber
        .read(&bus.network_status, read_timeout)
        .await
        .map(Some)
}

/// Publishes fixes once the network is up
pub struct LocationManager {
    bus: Arc<Bus>,
    subscriber: Subscriber,
    source: Box<dyn FixSource>,
    escalator: FatalEscalator,
    read_timeout: Duration,
    next_meas_id: u32,
}

impl LocationManager {
    pub fn new(
        bus: Arc<Bus>,
        subscriber: Subscriber,
        source: Box<dyn FixSource>,
        escalator: FatalEscalator,
        read_timeout: Duration,
    ) -> Self {
        Self {
            bus,
            subscriber,
            source,
            escalator,
            read_timeout,
            next_meas_id: 0,
        }
    }

    async fn publish(&mut self, mut fix: LocationFix) {
        fix.meas_id = self.next_meas_id;
        self.next_meas_id = self.next_meas_id.wrapping_add(1);

        match self
            .bus
            .location_fix
            .publish(fix, LOCATION_PUBLISH_TIMEOUT)
            .await
        {
            Ok(()) => debug!(meas_id = self.next_meas_id.wrapping_sub(1), "Fix published"),
            Err(e) => {
                metrics().bus_publish_timeout();
                warn!(error = %e, "Dropping location fix");
            }
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Location manager waiting for network");
        let mut attached = false;
        let mut exhausted = false;

        loop {
            tokio::select! {
                next = self.subscriber.wait(None) => {
                    let channel = match next {
                        Ok(channel) => channel,
                        Err(e) => {
                            warn!(error = %e, "Location manager inbox closed");
                            break;
                        }
                    };
                    let status = network_notification(
                        &self.subscriber,
                        &self.bus,
                        channel,
                        self.read_timeout,
                    )
                    .await;
                    match status {
                        Ok(Some(NetworkStatus::Connected)) if !attached => {
                            info!("Network attached, starting fixes");
                            attached = true;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!(error = %e, "Failed to read network status");
                            self.escalator.escalate(GENERIC_FATAL_CODE).await;
                            return;
                        }
                    }
                }
                fix = self.source.next_fix(), if attached && !exhausted => match fix {
                    Some(fix) => self.publish(fix).await,
                    None => {
                        info!(published = self.next_meas_id, "Fix source exhausted");
                        exhausted = true;
                    }
                },
                _ = shutdown.changed() => break,
            }
        }
        info!("Location manager stopped");
    }
}
