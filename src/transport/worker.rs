//! Connect and drain work items
//!
//! The worker runs on the executor task. It never touches the connection
//! context: the link state arrives through a watch channel and every outcome
//! of a connect attempt is reported back by the broker as a callback.

use super::mqtt::build_connect_params;
use super::queue::OutboundQueues;
use super::scheduler::{Work, WorkHandler};
use super::state::LinkState;
use super::BrokerClient;
use crate::config::TrackerConfig;
use crate::link_span;
use crate::observability::metrics;
use crate::protocol::{LocationReport, Topics};
use async_trait::async_trait;
use once_cell::sync::OnceCell;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn, Instrument};

/// Result of publishing the head of one queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeadOutcome {
    Empty,
    Published,
    /// Head could not be encoded and was discarded
    Discarded,
    Failed,
}

#[derive(Debug, Clone, Copy)]
enum Queue {
    Location,
    Generic,
}

/// Handler for [`Work::Connect`] and [`Work::Drain`]
pub struct TransportWorker<B> {
    broker: Arc<B>,
    queues: Arc<OutboundQueues>,
    topics: Arc<OnceCell<Topics>>,
    config: Arc<TrackerConfig>,
    link: watch::Receiver<LinkState>,
}

impl<B: BrokerClient> TransportWorker<B> {
    pub fn new(
        broker: Arc<B>,
        queues: Arc<OutboundQueues>,
        topics: Arc<OnceCell<Topics>>,
        config: Arc<TrackerConfig>,
        link: watch::Receiver<LinkState>,
    ) -> Self {
        Self {
            broker,
            queues,
            topics,
            config,
            link,
        }
    }

    fn connected(&self) -> bool {
        *self.link.borrow() == LinkState::Connected
    }

    async fn connect(&self) {
        let Some(topics) = self.topics.get() else {
            warn!(target: "transport", "Topics not derived yet, skipping connect attempt");
            return;
        };

        let params = match build_connect_params(&self.config, topics) {
            Ok(params) => params,
            Err(e) => {
                error!(target: "transport", error = %e, "Cannot build connect parameters");
                return;
            }
        };

        metrics().connection_attempt();
        let attempt = self
            .broker
            .connect(&params)
            .instrument(link_span!(step = "connect", client_id = %params.client_id));
        if let Err(e) = attempt.await {
            warn!(target: "transport", error = %e, "Connect attempt failed");
        }
    }

    async fn publish_location_head(&self, topics: &Topics) -> HeadOutcome {
        let Some(fix) = self.queues.location.peek() else {
            return HeadOutcome::Empty;
        };

        let json = match LocationReport::from(&fix).to_json() {
            Ok(json) => json,
            Err(e) => {
                error!(
                    target: "transport",
                    meas_id = fix.meas_id,
                    error = %e,
                    "Cannot encode fix, discarding"
                );
                self.queues.location.try_dequeue();
                return HeadOutcome::Discarded;
            }
        };

        match self.broker.publish(&topics.gps, json.into_bytes()).await {
            Ok(()) => {
                self.queues.location.try_dequeue();
                metrics().message_published();
                debug!(target: "transport", meas_id = fix.meas_id, "Fix published");
                HeadOutcome::Published
            }
            Err(e) => {
                metrics().publish_failed();
                warn!(
                    target: "transport",
                    meas_id = fix.meas_id,
                    error = %e,
                    "Publishing fix failed"
                );
                HeadOutcome::Failed
            }
        }
    }

    async fn publish_generic_head(&self, topics: &Topics) -> HeadOutcome {
        let Some(payload) = self.queues.generic.peek() else {
            return HeadOutcome::Empty;
        };

        match self
            .broker
            .publish(&topics.generic, payload.as_str().as_bytes().to_vec())
            .await
        {
            Ok(()) => {
                self.queues.generic.try_dequeue();
                metrics().message_published();
                debug!(target: "transport", len = payload.len(), "Payload published");
                HeadOutcome::Published
            }
            Err(e) => {
                metrics().publish_failed();
                warn!(
                    target: "transport",
                    len = payload.len(),
                    error = %e,
                    "Publishing payload failed"
                );
                HeadOutcome::Failed
            }
        }
    }

    /// Publish alternately from both queues until they are empty, the link
    /// drops or a publish fails
    async fn drain(&self) -> usize {
        let Some(topics) = self.topics.get() else {
            return 0;
        };

        let mut published = 0;
        'drain: loop {
            let mut progressed = false;
            for queue in [Queue::Location, Queue::Generic] {
                if !self.connected() {
                    debug!(target: "transport", "Link down, drain stopped");
                    break 'drain;
                }
                let outcome = match queue {
                    Queue::Location => self.publish_location_head(topics).await,
                    Queue::Generic => self.publish_generic_head(topics).await,
                };
                match outcome {
                    HeadOutcome::Empty => {}
                    HeadOutcome::Published => {
                        published += 1;
                        progressed = true;
                    }
                    HeadOutcome::Discarded => progressed = true,
                    HeadOutcome::Failed => break 'drain,
                }
            }
            if !progressed {
                break;
            }
        }

        if published > 0 {
            info!(target: "transport", published, "Drain finished");
        }
        published
    }
}

#[async_trait]
impl<B: BrokerClient> WorkHandler for TransportWorker<B> {
    fn rearm(&self, work: Work) -> Option<Duration> {
        match work {
            Work::Connect => Some(self.config.reconnect_timeout()),
            Work::Drain => None,
        }
    }

    async fn run(&self, work: Work) {
        match work {
            Work::Connect => self.connect().await,
            Work::Drain => {
                self.drain().await;
            }
        }
    }
}
