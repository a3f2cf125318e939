use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ExecConfig;
use crate::error::{PodlinkError, Result};
use crate::exec::channel::{ChannelListener, RemoteChannel};
use crate::exec::env::{EnvLayers, EnvMap};
use crate::exec::output::{OutputSink, OutputTee};
use crate::exec::process::ProcessHandle;
use crate::exec::protocol::{self, Script};
use crate::exec::runtime::{ContainerRuntime, ExecRequest, PodRef, RuntimeError};
use crate::exec::target::TargetResolver;

/// Runs commands inside one container by driving a remote shell.
///
/// A session is built for one command invocation: container, working
/// directory and environment are fixed up front, and every
/// [`ProcessHandle`] it produces is remembered so [`ExecSession::close`] can
/// release them together. Dropping the session closes them as well, so a
/// handle must not outlive the session that started it.
pub struct ExecSession {
    id: Uuid,
    runtime: Arc<dyn ContainerRuntime>,
    target: Arc<dyn TargetResolver>,
    config: ExecConfig,
    container: String,
    working_dir: Option<String>,
    env: EnvLayers,
    output: Option<Arc<dyn OutputSink>>,
    cancel: CancellationToken,
    closables: Mutex<Vec<Arc<ProcessHandle>>>,
}

impl ExecSession {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        target: Arc<dyn TargetResolver>,
        container: impl Into<String>,
        config: ExecConfig,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            runtime,
            target,
            config,
            container: container.into(),
            working_dir: None,
            env: EnvLayers::new(),
            output: None,
            cancel: CancellationToken::new(),
            closables: Mutex::new(Vec::new()),
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, env: EnvLayers) -> Self {
        self.env = env;
        self
    }

    /// Sink receiving the command's output. Protocol bookkeeping never
    /// reaches it.
    pub fn with_output(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.output = Some(sink);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    /// Start `command` in the container.
    ///
    /// `masks[i]` hides token `i` in logged output; the shell always
    /// receives the real token.
    pub async fn run(&self, command: &[String], masks: &[bool]) -> Result<Arc<ProcessHandle>> {
        let pod = tokio::select! {
            _ = self.cancel.cancelled() => return Err(PodlinkError::Cancelled { operation: "resolving target pod" }),
            pod = self.target.resolve() => pod?,
        };
        if !self.pod_exists(&pod).await? {
            return Err(PodlinkError::PodNotFound {
                pod: pod.name,
                namespace: pod.namespace,
            });
        }

        let output = Arc::new(OutputTee::new(self.output.clone()));
        output.note(&format!(
            "Executing {} script inside container {} of pod {}",
            self.config.shell, self.container, pod.name
        ));

        let (listener, channel) = self.connect(&pod, &output).await?;

        match self.probe_immediate_exit(&listener).await {
            Ok(false) => {}
            Ok(true) => {
                channel.close();
                tracing::warn!(session_id = %self.id, container = %self.container, pod = %pod, "Process exited immediately");
                return Err(PodlinkError::ExitedImmediately {
                    container: self.container.clone(),
                    pod: pod.name,
                    output: output.transcript(),
                });
            }
            Err(e) => {
                channel.close();
                return Err(e);
            }
        }

        let handle = Arc::new(ProcessHandle::start(
            pod.clone(),
            self.container.clone(),
            listener,
            channel,
            Arc::clone(&output),
            self.config.keepalive_interval,
        ));
        self.closables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&handle));

        let script = Script::build(self.working_dir.as_deref(), &self.env.merge(), command, masks);
        if let Err(source) = self.send_script(&handle, &output, &script).await {
            handle.close();
            return Err(PodlinkError::Protocol {
                container: self.container.clone(),
                pod: pod.name,
                source,
            });
        }

        Ok(handle)
    }

    async fn send_script(
        &self,
        handle: &ProcessHandle,
        output: &OutputTee,
        script: &Script,
    ) -> std::io::Result<()> {
        let stdin = handle.stdin();

        output.mute_caller();
        let preamble = script.preamble_bytes();
        let written = if preamble.is_empty() {
            Ok(())
        } else {
            tracing::trace!(session_id = %self.id, lines = script.preamble.len(), "Writing preamble");
            stdin.write_all(&preamble).await
        };
        output.unmute_caller();
        written?;

        let log_line = script.log_line();
        output.note(&log_line);
        tracing::info!(session_id = %self.id, process_id = %handle.id(), "{}", log_line.trim_end());

        stdin.write_all(&script.command_bytes()).await
    }

    /// Open a channel, retrying with exponential backoff.
    async fn connect(&self, pod: &PodRef, output: &Arc<OutputTee>) -> Result<(ChannelListener, RemoteChannel)> {
        let attempts = self.config.max_connect_retries;

        for attempt in 0..attempts {
            let delay = self.config.backoff(attempt);
            if !delay.is_zero() {
                output.note(&format!("Retrying in {}s ...", delay.as_secs()));
                tracing::warn!(
                    session_id = %self.id,
                    container = %self.container,
                    pod = %pod,
                    attempt,
                    delay_secs = delay.as_secs(),
                    "Retrying exec connection"
                );
                self.sleep_or_cancel(delay, "waiting to retry exec connection").await?;
            }

            let listener = ChannelListener::new();
            let request = ExecRequest {
                pod: pod.clone(),
                container: self.container.clone(),
                command: vec![self.config.shell.clone()],
                stdin_buffer_size: self.config.stdin_buffer_size,
                output: Arc::clone(output),
                listener: listener.clone(),
            };

            // One deadline covers both starting the exec and the channel opening.
            let deadline = Instant::now() + self.config.connect_timeout;

            let started = tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(PodlinkError::Cancelled { operation: "connecting to container" });
                }
                started = tokio::time::timeout_at(deadline, self.runtime.exec(request)) => started,
            };
            let channel = match started {
                Ok(Ok(channel)) => channel,
                Ok(Err(RuntimeError::ContainerNotFound { .. })) => return Err(self.container_not_found(pod)),
                Ok(Err(e)) => {
                    tracing::warn!(session_id = %self.id, attempt, error = %e, "Exec attempt failed");
                    continue;
                }
                Err(_) => {
                    self.warn_connect_timeout(attempt);
                    continue;
                }
            };

            let opened = tokio::select! {
                _ = self.cancel.cancelled() => {
                    channel.close();
                    return Err(PodlinkError::Cancelled { operation: "connecting to container" });
                }
                opened = tokio::time::timeout_at(deadline, listener.connected().wait()) => opened,
            };

            if opened.is_err() {
                self.warn_connect_timeout(attempt);
                channel.close();
                continue;
            }

            match listener.failure() {
                None => {
                    tracing::debug!(session_id = %self.id, container = %self.container, pod = %pod, attempt, "Exec channel open");
                    return Ok((listener, channel));
                }
                Some(reason) => {
                    channel.close();
                    if reason.starts_with(&format!("container {} not found in pod", self.container)) {
                        return Err(self.container_not_found(pod));
                    }
                    tracing::warn!(session_id = %self.id, attempt, reason = %reason, "Exec channel failed to open");
                }
            }
        }

        Err(PodlinkError::ConnectionExhausted {
            container: self.container.clone(),
            pod: pod.name.clone(),
            attempts,
        })
    }

    /// Ask the runtime whether the pod exists, bounded by the connect timeout.
    async fn pod_exists(&self, pod: &PodRef) -> Result<bool> {
        let timeout = self.config.connect_timeout;
        let exists = tokio::select! {
            _ = self.cancel.cancelled() => return Err(PodlinkError::Cancelled { operation: "looking up pod" }),
            exists = tokio::time::timeout(timeout, self.runtime.pod_exists(pod)) => exists,
        };
        let exists = exists.map_err(|_| {
            RuntimeError::Unavailable(format!("no answer looking up pod {} after {}s", pod, timeout.as_secs()))
        })??;
        Ok(exists)
    }

    fn warn_connect_timeout(&self, attempt: u32) {
        tracing::warn!(
            session_id = %self.id,
            attempt,
            timeout_secs = self.config.connect_timeout.as_secs(),
            "Timed out waiting for exec channel to open"
        );
    }

    /// True if the channel finished within the probe window.
    async fn probe_immediate_exit(&self, listener: &ChannelListener) -> Result<bool> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(PodlinkError::Cancelled { operation: "checking for immediate exit" }),
            finished = tokio::time::timeout(self.config.immediate_exit_window, listener.finished().wait()) => {
                Ok(finished.is_ok())
            }
        }
    }

    async fn sleep_or_cancel(&self, delay: Duration, operation: &'static str) -> Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(PodlinkError::Cancelled { operation }),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    fn container_not_found(&self, pod: &PodRef) -> PodlinkError {
        PodlinkError::ContainerNotFound {
            container: self.container.clone(),
            pod: pod.name.clone(),
        }
    }

    /// Kill every process in the container started with this build's
    /// cookie in its environment. Returns `None` when `env` has no cookie.
    ///
    /// Best-effort: runs a short second exec and reports its exit code.
    pub async fn kill_by_cookie(&self, env: &EnvMap) -> Result<Option<i32>> {
        let Some(cookie) = env.get(&self.config.cookie_var) else {
            tracing::debug!(session_id = %self.id, var = %self.config.cookie_var, "No cookie to kill by");
            return Ok(None);
        };

        let killer = ExecSession {
            id: Uuid::new_v4(),
            runtime: Arc::clone(&self.runtime),
            target: Arc::clone(&self.target),
            config: self.config.clone(),
            container: self.container.clone(),
            working_dir: None,
            env: EnvLayers::new(),
            output: None,
            cancel: self.cancel.clone(),
            closables: Mutex::new(Vec::new()),
        };

        let command = protocol::cookie_kill_command(&self.config.cookie_var, cookie);
        let handle = killer.run(&command, &[]).await?;
        let code = handle.join().await;
        killer.close();

        tracing::info!(session_id = %self.id, exit_code = code, "Killed processes by cookie");
        Ok(Some(code))
    }

    /// Close every process this session started.
    pub fn close(&self) {
        let handles = std::mem::take(&mut *self.closables.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in &handles {
            handle.close();
        }
        tracing::debug!(session_id = %self.id, closed = handles.len(), "Closed session");
    }

    /// Handles started and not yet released by [`ExecSession::close`].
    pub fn open_handles(&self) -> usize {
        self.closables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Drop for ExecSession {
    fn drop(&mut self) {
        self.close();
    }
}
