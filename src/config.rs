use std::time::Duration;

use crate::error::{PodlinkError, Result};

/// Tuning for remote exec sessions.
#[derive(Debug, Clone)]
pub struct ExecConfig {
    /// How long one connection attempt may wait for the channel to open
    pub connect_timeout: Duration,
    /// Connection attempts before giving up
    pub max_connect_retries: u32,
    /// Ceiling for the exponential backoff between attempts
    pub max_backoff: Duration,
    /// Window after opening in which a finished channel counts as an
    /// immediate exit
    pub immediate_exit_window: Duration,
    /// Interval between keepalive newlines
    pub keepalive_interval: Duration,
    /// Stdin buffer handed to the container runtime
    pub stdin_buffer_size: usize,
    /// Shell started in the container
    pub shell: String,
    /// Environment variable tagging processes started for one build
    pub cookie_var: String,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            max_connect_retries: 5,
            max_backoff: Duration::from_secs(30),
            immediate_exit_window: Duration::from_millis(200),
            keepalive_interval: Duration::from_secs(60),
            stdin_buffer_size: 16 * 1024,
            shell: "sh".to_string(),
            cookie_var: "JENKINS_SERVER_COOKIE".to_string(),
        }
    }
}

impl ExecConfig {
    /// Backoff before connection attempt `attempt` (0-based): `2^attempt`
    /// seconds, capped at `max_backoff`. The first attempt does not wait.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let secs = 2u64.checked_pow(attempt).unwrap_or(u64::MAX);
        Duration::from_secs(secs).min(self.max_backoff)
    }
}

/// Bounds for the job-state waits.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub event_wait_timeout: Duration,
    pub event_poll_interval: Duration,
    pub status_poll_timeout: Duration,
    pub status_poll_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            event_wait_timeout: Duration::from_secs(60),
            event_poll_interval: Duration::from_secs(1),
            status_poll_timeout: Duration::from_secs(600),
            status_poll_interval: Duration::from_secs(1),
        }
    }
}

/// Where and how agents are launched.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    pub cloud_name: String,
    pub queue: String,
    pub namespace: String,
    /// Base URL of the job UI, if any
    pub lookout_url: Option<String>,
    pub agent_connect_timeout: Duration,
    pub agent_poll_interval: Duration,
    /// How often progress is reported while the agent has not connected
    pub report_interval: Duration,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            cloud_name: "armada".to_string(),
            queue: "default".to_string(),
            namespace: "default".to_string(),
            lookout_url: None,
            agent_connect_timeout: Duration::from_secs(600),
            agent_poll_interval: Duration::from_secs(1),
            report_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PodlinkConfig {
    pub exec: ExecConfig,
    pub sync: SyncConfig,
    pub launch: LaunchConfig,
}

impl PodlinkConfig {
    pub fn with_exec(mut self, exec: ExecConfig) -> Self {
        self.exec = exec;
        self
    }

    pub fn with_sync(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }

    pub fn with_launch(mut self, launch: LaunchConfig) -> Self {
        self.launch = launch;
        self
    }

    /// Reject values that would make a wait or retry loop meaningless.
    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("exec.connect_timeout", self.exec.connect_timeout),
            ("exec.keepalive_interval", self.exec.keepalive_interval),
            ("sync.event_wait_timeout", self.sync.event_wait_timeout),
            ("sync.event_poll_interval", self.sync.event_poll_interval),
            ("sync.status_poll_timeout", self.sync.status_poll_timeout),
            ("sync.status_poll_interval", self.sync.status_poll_interval),
            ("launch.agent_connect_timeout", self.launch.agent_connect_timeout),
            ("launch.agent_poll_interval", self.launch.agent_poll_interval),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(PodlinkError::InvalidConfig(format!("{} must be non-zero", name)));
            }
        }

        if self.exec.max_connect_retries == 0 {
            return Err(PodlinkError::InvalidConfig(
                "exec.max_connect_retries must be at least 1".to_string(),
            ));
        }
        if self.exec.stdin_buffer_size == 0 {
            return Err(PodlinkError::InvalidConfig(
                "exec.stdin_buffer_size must be non-zero".to_string(),
            ));
        }
        if self.exec.shell.trim().is_empty() {
            return Err(PodlinkError::InvalidConfig("exec.shell cannot be empty".to_string()));
        }
        Ok(())
    }
}
