use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::exec::channel::{ChannelListener, RemoteChannel};
use crate::exec::output::OutputTee;

/// Failures reported by a container runtime.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("container {container} not found in pod {pod}")]
    ContainerNotFound { container: String, pod: String },

    #[error("runtime unavailable: {0}")]
    Unavailable(String),

    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    /// Connection failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, RuntimeError::ContainerNotFound { .. })
    }
}

/// A pod, and the API server hosting it when that is not the runtime's
/// default.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PodRef {
    pub name: String,
    pub namespace: String,
    pub server: Option<String>,
}

impl PodRef {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            server: None,
        }
    }

    pub fn with_server(mut self, server: impl Into<String>) -> Self {
        self.server = Some(server.into());
        self
    }
}

impl fmt::Display for PodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// One interactive exec into a container.
pub struct ExecRequest {
    pub pod: PodRef,
    pub container: String,
    /// Process started in the container, normally a bare shell
    pub command: Vec<String>,
    pub stdin_buffer_size: usize,
    /// Receives everything the process writes to stdout/stderr
    pub output: Arc<OutputTee>,
    /// Must be told when the channel opens, fails or closes
    pub listener: ChannelListener,
}

/// Interactive exec facility of a container orchestrator.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Whether the pod object still exists.
    async fn pod_exists(&self, pod: &PodRef) -> Result<bool, RuntimeError>;

    /// Start `request.command` in the container and return its channel.
    ///
    /// Returning `Ok` only means the attempt started; the channel is usable
    /// once the listener's `on_open` fires.
    async fn exec(&self, request: ExecRequest) -> Result<RemoteChannel, RuntimeError>;
}
