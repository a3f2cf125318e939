use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{PodlinkError, Result};
use crate::sync::bus::EventBus;
use crate::sync::scheduler::JobRunningEvent;
use crate::sync::watcher::WatcherRegistry;

/// Single-slot holder for the matched event. A later match overwrites an
/// earlier one; only the most recent is kept.
#[derive(Default)]
struct MatchSlot {
    event: Mutex<Option<JobRunningEvent>>,
    notify: Notify,
}

impl MatchSlot {
    fn set(&self, event: JobRunningEvent) {
        *self.event.lock().unwrap_or_else(PoisonError::into_inner) = Some(event);
        self.notify.notify_one();
    }

    fn take(&self) -> Option<JobRunningEvent> {
        self.event
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Waits for a job's running-event to arrive over the event bus.
#[derive(Clone)]
pub struct EventWaiter {
    bus: Arc<EventBus>,
    watchers: Arc<WatcherRegistry>,
    default_timeout: Duration,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl EventWaiter {
    pub fn new(
        bus: Arc<EventBus>,
        watchers: Arc<WatcherRegistry>,
        default_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            bus,
            watchers,
            default_timeout,
            poll_interval,
            cancel: CancellationToken::new(),
        }
    }

    /// Abort waits when `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Block until the running-event for `job_id` is published on
    /// `job_set_id`, or `timeout` elapses.
    ///
    /// The bus subscription is dropped on every exit path.
    pub async fn wait_for_running(
        &self,
        job_id: &str,
        job_set_id: &str,
        timeout: Duration,
    ) -> Result<JobRunningEvent> {
        let slot = Arc::new(MatchSlot::default());

        let wanted = job_id.to_string();
        let sink = Arc::clone(&slot);
        let _subscription = self.bus.subscribe(job_set_id, move |event: &JobRunningEvent| {
            if event.job_id == wanted {
                tracing::debug!(job_id = %wanted, "Received running event");
                sink.set(event.clone());
            }
        });

        self.watchers.ensure_watching(job_set_id);
        tracing::debug!(job_id, job_set_id, timeout_secs = timeout.as_secs(), "Waiting for running event");

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(event) = slot.take() {
                tracing::debug!(job_id, pod = %event.pod_name, "Job is running");
                return Ok(event);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(PodlinkError::WaitTimeout {
                    job_id: job_id.to_string(),
                    seconds: timeout.as_secs(),
                });
            }

            let tick = self.poll_interval.min(deadline - now);
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(PodlinkError::Cancelled {
                        operation: "waiting for job to reach running state",
                    });
                }
                _ = slot.notify.notified() => {}
                _ = tokio::time::sleep(tick) => {}
            }
        }
    }
}
