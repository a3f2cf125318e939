//! Agent provisioning through the job scheduler.
//!
//! Launching an agent submits its pod spec as a scheduler job (or recovers
//! the job submitted by an interrupted earlier launch), waits for the job to
//! run, then waits for the agent process inside it to connect back.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{LaunchConfig, SyncConfig};
use crate::error::{PodlinkError, Result};
use crate::sync::poller::StatusPoller;
use crate::sync::scheduler::{JobScheduler, JobSubmission};
use crate::sync::state::JobState;

/// Scheduler job backing an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentJob {
    pub job_id: String,
    pub job_set_id: String,
}

/// A build agent to be provisioned as a scheduler job.
pub struct Agent {
    name: String,
    pod_spec: serde_json::Value,
    job: Mutex<Option<AgentJob>>,
    launched: AtomicBool,
    launching: tokio::sync::Mutex<()>,
}

impl Agent {
    pub fn new(name: impl Into<String>, pod_spec: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            pod_spec,
            job: Mutex::new(None),
            launched: AtomicBool::new(false),
            launching: tokio::sync::Mutex::new(()),
        }
    }

    /// Agent restored with the job of an earlier, interrupted launch.
    pub fn with_job(self, job: AgentJob) -> Self {
        self.set_job(job);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pod_spec(&self) -> &serde_json::Value {
        &self.pod_spec
    }

    pub fn job(&self) -> Option<AgentJob> {
        self.job.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set_job(&self, job: AgentJob) {
        *self.job.lock().unwrap_or_else(PoisonError::into_inner) = Some(job);
    }

    pub fn is_launched(&self) -> bool {
        self.launched.load(Ordering::SeqCst)
    }
}

/// Reports whether an agent has connected back.
#[async_trait]
pub trait AgentProbe: Send + Sync {
    async fn is_online(&self, agent: &str) -> bool;
}

pub struct Launcher {
    scheduler: Arc<dyn JobScheduler>,
    probe: Arc<dyn AgentProbe>,
    poller: StatusPoller,
    config: LaunchConfig,
    cancel: CancellationToken,
}

impl Launcher {
    pub fn new(
        scheduler: Arc<dyn JobScheduler>,
        probe: Arc<dyn AgentProbe>,
        config: LaunchConfig,
        sync: &SyncConfig,
    ) -> Self {
        let poller = StatusPoller::new(
            Arc::clone(&scheduler),
            sync.status_poll_timeout,
            sync.status_poll_interval,
        );
        Self {
            scheduler,
            probe,
            poller,
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.poller = self.poller.with_cancel(cancel.clone());
        self.cancel = cancel;
        self
    }

    /// Job-set id for jobs submitted on `date`: `<cloud>-ddMMyyyy`.
    pub fn job_set_id(&self, date: NaiveDate) -> String {
        format!("{}{}", self.config.cloud_name, date.format("-%d%m%Y"))
    }

    /// Link to the job in the scheduler UI, if one is configured.
    pub fn lookout_link(&self, job_id: &str) -> Option<String> {
        self.config
            .lookout_url
            .as_deref()
            .filter(|url| !url.is_empty())
            .map(|url| format!("{}/?sb={}", url.trim_end_matches('/'), job_id))
    }

    /// Provision `agent` and wait until it has connected.
    ///
    /// Launching an agent that already launched successfully is a no-op.
    pub async fn launch(&self, agent: &Agent) -> Result<AgentJob> {
        let _launching = agent.launching.lock().await;

        if agent.is_launched() {
            tracing::debug!(agent = %agent.name(), "Agent already launched");
            return agent
                .job()
                .ok_or_else(|| PodlinkError::Launch(format!("agent {} has no job", agent.name())));
        }

        let result = async {
            let job = self.submit_or_recover(agent).await?;
            self.wait_for_agent(agent, &job).await?;
            Ok::<_, PodlinkError>(job)
        }
        .await;

        match result {
            Ok(job) => {
                agent.launched.store(true, Ordering::SeqCst);
                tracing::info!(agent = %agent.name(), job_id = %job.job_id, "Agent launched");
                Ok(job)
            }
            Err(e) => {
                tracing::error!(agent = %agent.name(), error = %e, "Failed to launch agent");
                Err(e)
            }
        }
    }

    async fn submit_or_recover(&self, agent: &Agent) -> Result<AgentJob> {
        if let Some(existing) = agent.job() {
            match self.scheduler.job_status(&existing.job_id).await? {
                Some(state) if state != JobState::Unknown => {
                    tracing::info!(job_id = %existing.job_id, %state, "Job already exists");
                    self.poller
                        .wait_until_running(&existing.job_id, self.poller.default_timeout())
                        .await?;
                    return Ok(existing);
                }
                state => {
                    tracing::debug!(job_id = %existing.job_id, ?state, "Previous job unknown, submitting again");
                }
            }
        }

        let job_set_id = self.job_set_id(chrono::Local::now().date_naive());
        tracing::info!(
            queue = %self.config.queue,
            namespace = %self.config.namespace,
            job_set_id = %job_set_id,
            "Submitting job"
        );

        let job_id = self
            .scheduler
            .submit_job(JobSubmission {
                queue: self.config.queue.clone(),
                namespace: self.config.namespace.clone(),
                job_set_id: job_set_id.clone(),
                pod_spec: agent.pod_spec().clone(),
            })
            .await?;
        if job_id.is_empty() {
            return Err(PodlinkError::Launch("No job ID returned from scheduler".to_string()));
        }

        let job = AgentJob { job_id, job_set_id };
        agent.set_job(job.clone());
        tracing::info!(job_id = %job.job_id, "Job submitted");
        if let Some(link) = self.lookout_link(&job.job_id) {
            tracing::info!(url = %link, "Lookout URL");
        }

        self.poller
            .wait_until_running(&job.job_id, self.poller.default_timeout())
            .await?;
        Ok(job)
    }

    /// Poll until the agent is online, failing early if the job leaves the
    /// running state.
    async fn wait_for_agent(&self, agent: &Agent, job: &AgentJob) -> Result<()> {
        let timeout = self.config.agent_connect_timeout;
        let start = Instant::now();
        let mut last_report = start;

        loop {
            let waited = start.elapsed();
            if self.probe.is_online(agent.name()).await {
                tracing::info!(agent = %agent.name(), waited_secs = waited.as_secs(), "Agent connected");
                return Ok(());
            }
            if waited >= timeout {
                return Err(PodlinkError::AgentConnectTimeout {
                    job_id: job.job_id.clone(),
                    seconds: timeout.as_secs(),
                });
            }

            self.poller.observe(&job.job_id).await?;

            if last_report.elapsed() >= self.config.report_interval {
                tracing::info!(
                    "Waiting for agent to connect ({}/{}): {}",
                    waited.as_secs(),
                    timeout.as_secs(),
                    agent.name()
                );
                last_report = Instant::now();
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(PodlinkError::Cancelled { operation: "waiting for agent connection" });
                }
                _ = tokio::time::sleep(self.config.agent_poll_interval) => {}
            }
        }
    }

    /// Cancel the agent's job. Returns whether the scheduler cancelled
    /// anything; failures are logged.
    pub async fn terminate(&self, agent: &Agent) -> bool {
        let Some(job) = agent.job() else {
            tracing::warn!(agent = %agent.name(), "No job ID found, skipping cancellation");
            return false;
        };

        tracing::info!(agent = %agent.name(), job_id = %job.job_id, "Cancelling job");
        match self.scheduler.cancel_job(&job.job_id, &job.job_set_id).await {
            Ok(n) if n > 0 => {
                tracing::debug!(job_id = %job.job_id, "Job successfully cancelled");
                true
            }
            Ok(_) => {
                tracing::warn!(job_id = %job.job_id, "Job cancellation completed (may have already finished)");
                false
            }
            Err(status) => {
                tracing::error!(job_id = %job.job_id, error = %status, "Failed to cancel job");
                false
            }
        }
    }
}
