//! Interface to the external job scheduler.
//!
//! Only the parts the synchronization logic observes are modelled: a job id,
//! a job-set id, an enumerated state and the running-event payload. RPC
//! failures surface as [`tonic::Status`] because the scheduler is a gRPC
//! service.

use std::pin::Pin;

use serde::{Deserialize, Serialize};
use tonic::Status;

use crate::sync::state::JobState;

/// Location of a job that just transitioned to running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRunningEvent {
    pub job_id: String,
    pub job_set_id: String,
    pub pod_name: String,
    pub pod_namespace: String,
    pub cluster_id: String,
}

/// Decoded payload of a watch message. Only `Running` carries data we use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventMessage {
    Submitted { job_id: String },
    Queued { job_id: String },
    Pending { job_id: String },
    Running(JobRunningEvent),
    Succeeded { job_id: String },
    Failed { job_id: String, reason: String },
    Cancelled { job_id: String },
    Other,
}

/// One frame of the server-streamed watch call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventStreamMessage {
    pub id: String,
    pub message: Option<EventMessage>,
}

impl EventStreamMessage {
    /// The running-event payload, if this frame has one.
    pub fn running(&self) -> Option<&JobRunningEvent> {
        match &self.message {
            Some(EventMessage::Running(event)) => Some(event),
            _ => None,
        }
    }
}

pub type EventStream =
    Pin<Box<dyn tokio_stream::Stream<Item = Result<EventStreamMessage, Status>> + Send>>;

/// A job submission. The pod spec is passed through untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSubmission {
    pub queue: String,
    pub namespace: String,
    pub job_set_id: String,
    pub pod_spec: serde_json::Value,
}

#[async_trait::async_trait]
pub trait JobScheduler: Send + Sync {
    /// Submit a job and return its id.
    async fn submit_job(&self, submission: JobSubmission) -> Result<String, Status>;

    /// Current state of a job. `None` when the scheduler reports nothing for
    /// the id yet.
    async fn job_status(&self, job_id: &str) -> Result<Option<JobState>, Status>;

    /// Cancel a job, returning how many jobs were actually cancelled.
    async fn cancel_job(&self, job_id: &str, job_set_id: &str) -> Result<usize, Status>;

    /// Open the watch stream for a job set.
    async fn watch_job_set(&self, job_set_id: &str) -> Result<EventStream, Status>;
}
