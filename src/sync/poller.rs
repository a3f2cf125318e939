use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{PodlinkError, Result};
use crate::sync::scheduler::JobScheduler;
use crate::sync::state::{self, JobState};

/// Polls the scheduler's status API until a job is running.
///
/// Used where only the state matters and no event payload is needed.
#[derive(Clone)]
pub struct StatusPoller {
    scheduler: Arc<dyn JobScheduler>,
    default_timeout: Duration,
    interval: Duration,
    cancel: CancellationToken,
}

impl StatusPoller {
    pub fn new(scheduler: Arc<dyn JobScheduler>, default_timeout: Duration, interval: Duration) -> Self {
        Self {
            scheduler,
            default_timeout,
            interval,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Query the job's state once and reject states that can never lead to
    /// running. `None` means the scheduler has no state for the job yet.
    pub async fn observe(&self, job_id: &str) -> Result<Option<JobState>> {
        let current = self.scheduler.job_status(job_id).await?;
        tracing::debug!(job_id, state = ?current, "Observed job state");
        if let Some(current) = current {
            state::validate(current, job_id)?;
        }
        Ok(current)
    }

    /// Poll until the job is running. Fails as soon as a terminal or unknown
    /// state is observed, or once `timeout` is exhausted.
    pub async fn wait_until_running(&self, job_id: &str, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut polls = 0u32;

        loop {
            polls += 1;
            let current = self.observe(job_id).await?;
            if current.is_some_and(JobState::is_running) {
                tracing::info!(job_id, polls, "Job is running");
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(PodlinkError::WaitTimeout {
                    job_id: job_id.to_string(),
                    seconds: timeout.as_secs(),
                });
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(PodlinkError::Cancelled {
                        operation: "polling job status",
                    });
                }
                _ = tokio::time::sleep(self.interval.min(deadline - now)) => {}
            }
        }
    }
}
