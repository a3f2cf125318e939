use serde::{Deserialize, Serialize};

use crate::error::{PodlinkError, Result};

/// Job state as reported by the scheduler's status and event APIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Submitted,
    Queued,
    Pending,
    Leased,
    Running,
    Succeeded,
    Failed,
    Rejected,
    Cancelled,
    Unknown,
}

/// Where a state sits in the `not started -> running -> terminal` machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    NotStarted,
    Running,
    Terminal,
}

impl JobState {
    pub const ALL: [JobState; 10] = [
        JobState::Submitted,
        JobState::Queued,
        JobState::Pending,
        JobState::Leased,
        JobState::Running,
        JobState::Succeeded,
        JobState::Failed,
        JobState::Rejected,
        JobState::Cancelled,
        JobState::Unknown,
    ];

    pub fn classify(self) -> Classification {
        if self.is_running() {
            Classification::Running
        } else if self.is_terminal() {
            Classification::Terminal
        } else {
            Classification::NotStarted
        }
    }

    pub fn is_running(self) -> bool {
        self == JobState::Running
    }

    /// No further transitions are expected from these states.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Rejected | JobState::Cancelled
        )
    }

    pub fn is_failed(self) -> bool {
        matches!(self, JobState::Failed | JobState::Rejected)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobState::Submitted => "SUBMITTED",
            JobState::Queued => "QUEUED",
            JobState::Pending => "PENDING",
            JobState::Leased => "LEASED",
            JobState::Running => "RUNNING",
            JobState::Succeeded => "SUCCEEDED",
            JobState::Failed => "FAILED",
            JobState::Rejected => "REJECTED",
            JobState::Cancelled => "CANCELLED",
            JobState::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// Check a state observed while waiting for a job to start running.
///
/// `Unknown` and every terminal state abort the wait. `Succeeded` counts too:
/// the caller is waiting for the job to run, so finishing is unexpected here.
pub fn validate(state: JobState, job_id: &str) -> Result<()> {
    let reason = match state {
        JobState::Unknown => "Job state is UNKNOWN",
        JobState::Failed | JobState::Rejected => "Job entered failed state",
        JobState::Cancelled => "Job was cancelled",
        JobState::Succeeded => "Job terminated unexpectedly",
        _ => return Ok(()),
    };

    Err(PodlinkError::UnexpectedJobState {
        job_id: job_id.to_string(),
        state,
        reason,
    })
}
