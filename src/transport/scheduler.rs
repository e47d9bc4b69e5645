//! Private executor for delayed, cancellable work items
//!
//! Each [`Work`] item has at most one pending deadline. Scheduling an item
//! that is already pending replaces its deadline; cancelling is idempotent
//! and never interrupts an item that is already running. Items run one at a
//! time on the executor task, in deadline order.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Work items owned by the transport executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Work {
    /// Attempt a broker connection
    Connect,
    /// Drain the outbound queues
    Drain,
}

/// Runs work items for a [`WorkQueue`]
#[async_trait]
pub trait WorkHandler: Send + Sync + 'static {
    /// Delay before `work` fires again, decided before it runs
    fn rearm(&self, work: Work) -> Option<Duration>;

    async fn run(&self, work: Work);
}

/// Fallback horizon for delays too large to add to an instant
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

fn deadline_after(now: Instant, delay: Duration) -> Instant {
    now.checked_add(delay).unwrap_or_else(|| now + FAR_FUTURE)
}

/// Handle to the executor's timers
#[derive(Debug, Clone, Default)]
pub struct WorkQueue {
    deadlines: Arc<Mutex<HashMap<Work, Instant>>>,
    wake: Arc<Notify>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> MutexGuard<'_, HashMap<Work, Instant>> {
        self.deadlines.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Fire `work` after `delay`, replacing any pending deadline
    pub fn schedule(&self, work: Work, delay: Duration) {
        self.guard().insert(work, deadline_after(Instant::now(), delay));
        trace!(?work, ?delay, "Work scheduled");
        self.wake.notify_one();
    }

    /// Fire `work` as soon as possible
    pub fn submit(&self, work: Work) {
        let now = Instant::now();
        self.guard()
            .entry(work)
            .and_modify(|deadline| *deadline = (*deadline).min(now))
            .or_insert(now);
        self.wake.notify_one();
    }

    /// Drop the pending deadline of `work`; returns whether one existed
    pub fn cancel(&self, work: Work) -> bool {
        let removed = self.guard().remove(&work).is_some();
        if removed {
            trace!(?work, "Work cancelled");
            self.wake.notify_one();
        }
        removed
    }

    pub fn is_pending(&self, work: Work) -> bool {
        self.guard().contains_key(&work)
    }

    /// Time left before `work` fires, if pending
    pub fn remaining(&self, work: Work) -> Option<Duration> {
        self.guard()
            .get(&work)
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Take the earliest due item, re-arming it per `handler`
    fn take_due<H: WorkHandler + ?Sized>(&self, handler: &H) -> Result<Work, Option<Instant>> {
        let now = Instant::now();
        let mut deadlines = self.guard();
        let earliest = deadlines
            .iter()
            .min_by_key(|(_, deadline)| **deadline)
            .map(|(work, deadline)| (*work, *deadline));

        match earliest {
            Some((work, deadline)) if deadline <= now => {
                match handler.rearm(work) {
                    Some(period) => {
                        deadlines.insert(work, deadline_after(now, period));
                    }
                    None => {
                        deadlines.remove(&work);
                    }
                }
                Ok(work)
            }
            Some((_, deadline)) => Err(Some(deadline)),
            None => Err(None),
        }
    }

    /// Spawn the executor task
    pub fn start<H: WorkHandler>(
        &self,
        handler: Arc<H>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            debug!("Work executor started");
            loop {
                if *shutdown.borrow() {
                    break;
                }

                let notified = queue.wake.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                match queue.take_due(handler.as_ref()) {
                    Ok(work) => {
                        trace!(?work, "Running work item");
                        handler.run(work).await;
                    }
                    Err(next) => {
                        let sleep = async {
                            match next {
                                Some(deadline) => tokio::time::sleep_until(deadline).await,
                                None => std::future::pending::<()>().await,
                            }
                        };
                        tokio::select! {
                            _ = &mut notified => {}
                            _ = sleep => {}
                            changed = shutdown.changed() => {
                                if changed.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                }
            }
            debug!("Work executor stopped");
        })
    }
}
