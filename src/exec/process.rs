use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::exec::channel::{ChannelListener, ExitOutcome, RemoteChannel, StdinHandle};
use crate::exec::output::OutputTee;
use crate::exec::protocol;
use crate::exec::runtime::PodRef;

/// Exit code reported when the real one cannot be determined.
pub const UNKNOWN_EXIT_CODE: i32 = -1;

/// How long `kill` waits to hand the interrupt to the channel before closing it.
const KILL_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// A process running in a container behind an open [`RemoteChannel`].
pub struct ProcessHandle {
    id: Uuid,
    pod: PodRef,
    container: String,
    listener: ChannelListener,
    stdin: StdinHandle,
    exit_code: Mutex<Option<oneshot::Receiver<ExitOutcome>>>,
    resolved: OnceLock<i32>,
    close: CancellationToken,
    closed: AtomicBool,
    output: Arc<OutputTee>,
    keepalive: JoinHandle<()>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("id", &self.id)
            .field("pod", &self.pod)
            .field("container", &self.container)
            .finish_non_exhaustive()
    }
}

impl ProcessHandle {
    /// Take ownership of an open channel and start the keepalive task.
    pub fn start(
        pod: PodRef,
        container: impl Into<String>,
        listener: ChannelListener,
        channel: RemoteChannel,
        output: Arc<OutputTee>,
        keepalive_interval: Duration,
    ) -> Self {
        let id = Uuid::new_v4();
        let container = container.into();
        let (stdin, exit_code, close) = channel.into_parts();

        let keepalive = tokio::spawn(keepalive(
            id,
            listener.clone(),
            stdin.clone(),
            close.clone(),
            keepalive_interval,
        ));

        tracing::info!(process_id = %id, pod = %pod, container = %container, "Created process");

        Self {
            id,
            pod,
            container,
            listener,
            stdin,
            exit_code: Mutex::new(Some(exit_code)),
            resolved: OnceLock::new(),
            close,
            closed: AtomicBool::new(false),
            output,
            keepalive,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn pod(&self) -> &PodRef {
        &self.pod
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    /// Last known liveness of the channel. Never blocks.
    pub fn is_alive(&self) -> bool {
        self.listener.is_alive()
    }

    /// Interrupt the remote command and close the channel. Write failures
    /// are logged, never returned, and the channel is closed even when the
    /// interrupt cannot be written.
    pub async fn kill(&self) {
        tracing::debug!(process_id = %self.id, "Killing process");
        let kill_sequence = protocol::kill_sequence();
        match tokio::time::timeout(KILL_WRITE_TIMEOUT, self.stdin.write_all(&kill_sequence)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(process_id = %self.id, error = %e, "Failed to send kill sequence");
            }
            Err(_) => {
                tracing::warn!(
                    process_id = %self.id,
                    timeout_secs = KILL_WRITE_TIMEOUT.as_secs(),
                    "Timed out sending kill sequence"
                );
            }
        }
        self.close();
    }

    /// Wait for the channel to finish and return the exit code.
    ///
    /// Returns [`UNKNOWN_EXIT_CODE`] when the runtime reports no code or
    /// fails to report one; that value means "outcome unknown".
    pub async fn join(&self) -> i32 {
        self.listener.finished().wait().await;

        let mut exit_code = self.exit_code.lock().await;
        if let Some(code) = self.resolved.get() {
            return *code;
        }

        let code = match exit_code.take() {
            None => {
                tracing::warn!(process_id = %self.id, "Exit code unavailable");
                UNKNOWN_EXIT_CODE
            }
            Some(rx) => match rx.await {
                Ok(Ok(Some(code))) => code,
                Ok(Ok(None)) => {
                    tracing::warn!(process_id = %self.id, "Channel closed without an exit code");
                    self.output.note("Process exited without reporting an exit code");
                    UNKNOWN_EXIT_CODE
                }
                Ok(Err(e)) => {
                    tracing::warn!(process_id = %self.id, error = %e, "Failed to retrieve exit code");
                    self.output.note(&format!("Failed to retrieve exit code: {}", e));
                    UNKNOWN_EXIT_CODE
                }
                Err(_) => {
                    tracing::warn!(process_id = %self.id, "Runtime dropped the exit code");
                    UNKNOWN_EXIT_CODE
                }
            },
        };

        tracing::debug!(process_id = %self.id, exit_code = code, "Process finished");
        let _ = self.resolved.set(code);
        code
    }

    /// Captured stdout, including output the caller sink did not see.
    pub fn stdout(&self) -> Vec<u8> {
        self.output.stdout()
    }

    pub fn stderr(&self) -> Vec<u8> {
        self.output.stderr()
    }

    pub fn stdin(&self) -> &StdinHandle {
        &self.stdin
    }

    pub fn output(&self) -> &Arc<OutputTee> {
        &self.output
    }

    /// Close the channel. Safe to call any number of times.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.close.cancel();
        tracing::debug!(process_id = %self.id, "Closed process channel");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Whether the keepalive task has stopped.
    pub fn keepalive_stopped(&self) -> bool {
        self.keepalive.is_finished()
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Write a newline every `interval` while the channel is alive.
async fn keepalive(
    process_id: Uuid,
    listener: ChannelListener,
    stdin: StdinHandle,
    close: CancellationToken,
    interval: Duration,
) {
    let start = tokio::time::Instant::now() + interval;
    let mut ticker = tokio::time::interval_at(start, interval);

    loop {
        tokio::select! {
            _ = close.cancelled() => break,
            _ = listener.finished().wait() => break,
            _ = ticker.tick() => {}
        }
        if !listener.is_alive() {
            break;
        }
        tokio::select! {
            _ = close.cancelled() => break,
            written = stdin.write_all(protocol::NEWLINE.as_bytes()) => {
                if let Err(e) = written {
                    tracing::debug!(process_id = %process_id, error = %e, "Keepalive write failed");
                }
            }
        }
    }
    tracing::trace!(process_id = %process_id, "Keepalive stopped");
}
