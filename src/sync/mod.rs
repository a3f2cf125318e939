//! Job state synchronization.
//!
//! Bridges the scheduler's asynchronous event stream with callers that need
//! to block until a job runs:
//!
//! - [`state`]: classification of scheduler job states
//! - [`bus`]: pub/sub of running-events keyed by job-set id
//! - [`watcher`]: one background watch stream per job set, feeding the bus
//! - [`waiter`]: bounded wait for a job's running-event (payload needed)
//! - [`poller`]: bounded status polling (state only)
//!
//! [`JobSync`] owns the bus and the watcher registry, so independent
//! instances never share subscribers or watchers.

pub mod bus;
pub mod poller;
pub mod scheduler;
pub mod state;
pub mod waiter;
pub mod watcher;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::SyncConfig;

pub use bus::{EventBus, Subscription};
pub use poller::StatusPoller;
pub use scheduler::{EventMessage, EventStreamMessage, JobRunningEvent, JobScheduler};
pub use state::{Classification, JobState};
pub use waiter::EventWaiter;
pub use watcher::WatcherRegistry;

pub struct JobSync {
    scheduler: Arc<dyn JobScheduler>,
    bus: Arc<EventBus>,
    watchers: Arc<WatcherRegistry>,
    config: SyncConfig,
    cancel: CancellationToken,
}

impl JobSync {
    pub fn new(scheduler: Arc<dyn JobScheduler>, config: SyncConfig) -> Self {
        let bus = Arc::new(EventBus::new());
        let watchers = Arc::new(WatcherRegistry::new(
            Arc::clone(&scheduler),
            Arc::clone(&bus),
        ));
        Self {
            scheduler,
            bus,
            watchers,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Abort every wait started from this instance when `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn scheduler(&self) -> &Arc<dyn JobScheduler> {
        &self.scheduler
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn watchers(&self) -> &Arc<WatcherRegistry> {
        &self.watchers
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn event_waiter(&self) -> EventWaiter {
        EventWaiter::new(
            Arc::clone(&self.bus),
            Arc::clone(&self.watchers),
            self.config.event_wait_timeout,
            self.config.event_poll_interval,
        )
        .with_cancel(self.cancel.clone())
    }

    pub fn status_poller(&self) -> StatusPoller {
        StatusPoller::new(
            Arc::clone(&self.scheduler),
            self.config.status_poll_timeout,
            self.config.status_poll_interval,
        )
        .with_cancel(self.cancel.clone())
    }
}
