use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::sync::bus::EventBus;
use crate::sync::scheduler::JobScheduler;

/// Background consumer of one job set's watch stream.
///
/// Every frame carrying a running-event is published on the bus under the
/// watched job-set id. Stream errors end the watcher; it does not reconnect
/// on its own. A dead watcher is replaced lazily: the registry drops its
/// entry, and the next [`WatcherRegistry::ensure_watching`] for that job set
/// (normally from the next waiter) opens a fresh stream.
pub struct EventWatcher {
    job_set_id: String,
    scheduler: Arc<dyn JobScheduler>,
    bus: Arc<EventBus>,
}

impl EventWatcher {
    pub fn new(job_set_id: String, scheduler: Arc<dyn JobScheduler>, bus: Arc<EventBus>) -> Self {
        Self {
            job_set_id,
            scheduler,
            bus,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let job_set_id = self.job_set_id.as_str();
        let mut stream = match self.scheduler.watch_job_set(job_set_id).await {
            Ok(stream) => stream,
            Err(status) => {
                tracing::error!(job_set_id, error = %status, "Failed to open job set watch");
                return;
            }
        };
        tracing::debug!(job_set_id, "Watching job set events");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!(job_set_id, "Job set watch stopped");
                    break;
                }
                next = stream.next() => match next {
                    Some(Ok(message)) => {
                        tracing::trace!(job_set_id, message_id = %message.id, "Event received");
                        if let Some(event) = message.running() {
                            let delivered = self.bus.publish(job_set_id, event);
                            tracing::debug!(
                                job_set_id,
                                job_id = %event.job_id,
                                delivered,
                                "Published running event"
                            );
                        }
                    }
                    Some(Err(status)) => {
                        tracing::error!(job_set_id, error = %status, "Job set watch failed");
                        break;
                    }
                    None => {
                        tracing::debug!(job_set_id, "Job set watch completed");
                        break;
                    }
                }
            }
        }
    }
}

struct WatcherHandle {
    generation: u64,
    task: JoinHandle<()>,
}

/// Registry guaranteeing at most one live watcher per job-set id.
///
/// A watcher removes its own entry when its stream ends, so a later
/// `ensure_watching` for the same job set opens a fresh stream.
pub struct WatcherRegistry {
    scheduler: Arc<dyn JobScheduler>,
    bus: Arc<EventBus>,
    watchers: Arc<DashMap<String, WatcherHandle>>,
    generation: AtomicU64,
    shutdown: CancellationToken,
}

impl WatcherRegistry {
    pub fn new(scheduler: Arc<dyn JobScheduler>, bus: Arc<EventBus>) -> Self {
        Self {
            scheduler,
            bus,
            watchers: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    /// Start a watcher for `job_set_id` unless one is already running.
    /// Returns true when this call started it.
    pub fn ensure_watching(&self, job_set_id: &str) -> bool {
        match self.watchers.entry(job_set_id.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                let watcher = EventWatcher::new(
                    job_set_id.to_string(),
                    Arc::clone(&self.scheduler),
                    Arc::clone(&self.bus),
                );
                let watchers = Arc::clone(&self.watchers);
                let key = job_set_id.to_string();
                let shutdown = self.shutdown.child_token();

                let task = tokio::spawn(async move {
                    watcher.run(shutdown).await;
                    watchers.remove_if(&key, |_, handle| handle.generation == generation);
                });
                entry.insert(WatcherHandle { generation, task });

                tracing::debug!(job_set_id, "Started job set watcher");
                true
            }
        }
    }

    pub fn is_watching(&self, job_set_id: &str) -> bool {
        self.watchers
            .get(job_set_id)
            .map(|handle| !handle.task.is_finished())
            .unwrap_or(false)
    }

    pub fn watcher_count(&self) -> usize {
        self.watchers.len()
    }

    /// Stop every watcher.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for WatcherRegistry {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
