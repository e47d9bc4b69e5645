//! Packet-data attach events to network status

use crate::bus::Bus;
use crate::protocol::NetworkStatus;
use crate::supervisor::{FatalEscalator, GENERIC_FATAL_CODE};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Deadline for publishing a status change
pub const NETWORK_PUBLISH_TIMEOUT: Duration = Duration::from_secs(1);

/// Events on the default packet-data context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PdnEvent {
    /// Context activated, IPv4 up
    Activated,
    Deactivated,
    Ipv6Up,
    Ipv6Down,
    /// Session management notification with its cause code
    Esm(i32),
}

impl PdnEvent {
    /// Network status carried by this event, if any
    pub fn to_status(&self) -> Option<NetworkStatus> {
        match self {
            PdnEvent::Activated => Some(NetworkStatus::Connected),
            PdnEvent::Deactivated => Some(NetworkStatus::Disconnected),
            PdnEvent::Ipv6Up | PdnEvent::Ipv6Down | PdnEvent::Esm(_) => None,
        }
    }
}

/// Publishes attach state on the network-status channel
#[derive(Clone)]
pub struct NetworkReporter {
    bus: Arc<Bus>,
    escalator: FatalEscalator,
}

impl NetworkReporter {
    pub fn new(bus: Arc<Bus>, escalator: FatalEscalator) -> Self {
        Self { bus, escalator }
    }

    /// Handle one packet-data event
    ///
    /// Returns the status published, or `None` when the event carries none.
    /// A failed publish escalates.
    pub async fn report(&self, event: PdnEvent) -> Option<NetworkStatus> {
        let Some(status) = event.to_status() else {
            debug!(?event, "Packet-data event ignored");
            return None;
        };

        info!(?event, ?status, "Network status changed");
        if let Err(e) = self
            .bus
            .network_status
            .publish(status, NETWORK_PUBLISH_TIMEOUT)
            .await
        {
            error!(error = %e, "Failed to publish network status");
            self.escalator.escalate(GENERIC_FATAL_CODE).await;
        }
        Some(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{ChannelId, Observer};
    use crate::testing::mocks::RecordingReboot;

    #[test]
    fn test_event_mapping() {
        assert_eq!(PdnEvent::Activated.to_status(), Some(NetworkStatus::Connected));
        assert_eq!(
            PdnEvent::Deactivated.to_status(),
            Some(NetworkStatus::Disconnected)
        );
        assert_eq!(PdnEvent::Ipv6Up.to_status(), None);
        assert_eq!(PdnEvent::Ipv6Down.to_status(), None);
        assert_eq!(PdnEvent::Esm(33).to_status(), None);
    }

    #[tokio::test]
    async fn test_report_publishes_status() {
        let bus = Arc::new(Bus::standard().unwrap());
        let mut transport = bus.subscribe(Observer::Transport).unwrap();
        let _location = bus.subscribe(Observer::LocationManager).unwrap();
        let reboot = Arc::new(RecordingReboot::default());
        let reporter = NetworkReporter::new(
            Arc::clone(&bus),
            FatalEscalator::new(Arc::clone(&bus), reboot.clone()),
        );

        assert_eq!(
            reporter.report(PdnEvent::Activated).await,
            Some(NetworkStatus::Connected)
        );
        assert_eq!(reporter.report(PdnEvent::Ipv6Up).await, None);

        let channel = transport.wait(Some(Duration::from_millis(100))).await;
        assert_eq!(channel, Ok(ChannelId::NetworkStatus));
        let status = transport
            .read(&bus.network_status, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(status, NetworkStatus::Connected);
        assert!(reboot.codes().is_empty());
    }
}
