use thiserror::Error;

use crate::exec::runtime::RuntimeError;
use crate::sync::state::JobState;

#[derive(Error, Debug)]
pub enum PodlinkError {
    #[error(
        "Failed to establish exec connection to container '{container}' in pod '{pod}' after {attempts} attempts"
    )]
    ConnectionExhausted {
        container: String,
        pod: String,
        attempts: u32,
    },

    #[error("Container '{container}' not found in pod '{pod}'")]
    ContainerNotFound { container: String, pod: String },

    #[error("Pod '{pod}' not found in namespace '{namespace}'")]
    PodNotFound { pod: String, namespace: String },

    #[error(
        "Process in container '{container}' of pod '{pod}' exited immediately after creation: {output}"
    )]
    ExitedImmediately {
        container: String,
        pod: String,
        output: String,
    },

    #[error("Exec protocol failure in container '{container}' of pod '{pod}': {source}")]
    Protocol {
        container: String,
        pod: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Job {job_id} in state {state}: {reason}")]
    UnexpectedJobState {
        job_id: String,
        state: JobState,
        reason: &'static str,
    },

    #[error("Timeout waiting for job {job_id} to reach running state after {seconds} seconds")]
    WaitTimeout { job_id: String, seconds: u64 },

    #[error("Agent for job {job_id} did not connect after {seconds} seconds")]
    AgentConnectTimeout { job_id: String, seconds: u64 },

    #[error("Interrupted while {operation}")]
    Cancelled { operation: &'static str },

    #[error("Invalid configuration for '{field}': no value available for node {node}")]
    MissingJobInfo { field: &'static str, node: String },

    #[error("No server URL configured for cluster: {cluster_id}")]
    UnknownCluster { cluster_id: String },

    #[error("Launch failed: {0}")]
    Launch(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] tonic::Status),

    #[error("Container runtime error: {0}")]
    Runtime(#[from] RuntimeError),
}

impl PodlinkError {
    /// True for errors caused by the job reaching a state it can never leave
    /// towards running.
    pub fn is_state_error(&self) -> bool {
        matches!(
            self,
            PodlinkError::UnexpectedJobState { .. } | PodlinkError::WaitTimeout { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, PodlinkError>;
