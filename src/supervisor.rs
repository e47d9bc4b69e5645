//! Fatal error escalation
//!
//! Any component that hits an unrecoverable fault publishes a code on the
//! fatal-error channel through [`FatalEscalator`]. The [`Supervisor`] task
//! observes that channel, flushes logs and restarts the process. When the
//! escalation itself cannot be published in time the escalator restarts
//! directly.

use crate::bus::{Bus, ChannelId, Subscriber};
use crate::observability::{logging, metrics};
use crate::protocol::FatalError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Deadline for publishing on the fatal-error channel
pub const FATAL_PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

/// Code used when the fault has no more specific code
pub const GENERIC_FATAL_CODE: i32 = -1;

/// Exit status used for a supervised restart
pub const RESTART_EXIT_CODE: i32 = 70;

/// Performs the restart once logs are flushed
pub trait RebootHandler: Send + Sync + 'static {
    fn reboot(&self, code: i32);
}

/// Restart by exiting; the service manager brings the process back
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRestart;

impl RebootHandler for ProcessRestart {
    fn reboot(&self, code: i32) {
        error!(code, "Restarting after fatal error");
        logging::flush();
        std::process::exit(RESTART_EXIT_CODE);
    }
}

/// Handle for raising fatal errors from any task
#[derive(Clone)]
pub struct FatalEscalator {
    bus: Arc<Bus>,
    reboot: Arc<dyn RebootHandler>,
}

impl FatalEscalator {
    pub fn new(bus: Arc<Bus>, reboot: Arc<dyn RebootHandler>) -> Self {
        Self { bus, reboot }
    }

    /// Report an unrecoverable fault
    pub async fn escalate(&self, code: i32) {
        metrics().fatal_escalated();
        match self
            .bus
            .fatal_error
            .publish(FatalError(code), FATAL_PUBLISH_TIMEOUT)
            .await
        {
            Ok(()) => warn!(code, "Fatal error escalated to supervisor"),
            Err(e) => {
                error!(code, error = %e, "Sending on the fatal error channel failed, rebooting");
                logging::flush();
                self.reboot.reboot(code);
            }
        }
    }
}

/// Observer of the fatal-error channel
pub struct Supervisor {
    bus: Arc<Bus>,
    subscriber: Subscriber,
    reboot: Arc<dyn RebootHandler>,
    read_timeout: Duration,
}

impl Supervisor {
    pub fn new(
        bus: Arc<Bus>,
        subscriber: Subscriber,
        reboot: Arc<dyn RebootHandler>,
        read_timeout: Duration,
    ) -> Self {
        Self {
            bus,
            subscriber,
            reboot,
            read_timeout,
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Supervisor started");
        loop {
            let channel = tokio::select! {
                next = self.subscriber.wait(None) => match next {
                    Ok(channel) => channel,
                    Err(e) => {
                        warn!(error = %e, "Supervisor inbox closed");
                        break;
                    }
                },
                _ = shutdown.changed() => break,
            };

            if channel != ChannelId::FatalError {
                continue;
            }

            let code = match self
                .subscriber
                .read(&self.bus.fatal_error, self.read_timeout)
                .await
            {
                Ok(FatalError(code)) => code,
                Err(e) => {
                    error!(error = %e, "Could not read fatal error code");
                    GENERIC_FATAL_CODE
                }
            };

            error!(code, "Fatal error reported, restarting");
            logging::flush();
            self.reboot.reboot(code);
        }
        info!("Supervisor stopped");
    }
}
