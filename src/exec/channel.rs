use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::exec::runtime::RuntimeError;

/// Single-fire completion signal.
#[derive(Clone)]
pub struct Signal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

impl Signal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fire the signal. Returns false if it had already fired.
    pub fn fire(&self) -> bool {
        self.tx.send_if_modified(|fired| {
            if *fired {
                false
            } else {
                *fired = true;
                true
            }
        })
    }

    pub fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this only returns once fired.
        let _ = rx.wait_for(|fired| *fired).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
}

/// Lifecycle callbacks for one remote channel.
///
/// The container runtime calls these from its own tasks. State lives only in
/// the liveness flag and the two signals; every callback fires `connected`
/// so a connect wait never outlives a failed channel.
#[derive(Clone, Default)]
pub struct ChannelListener {
    alive: Arc<AtomicBool>,
    connected: Signal,
    finished: Signal,
    failure: Arc<Mutex<Option<String>>>,
}

impl ChannelListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_open(&self) {
        self.alive.store(true, Ordering::SeqCst);
        self.connected.fire();
        tracing::trace!("Channel opened");
    }

    pub fn on_failure(&self, reason: &str) {
        self.alive.store(false, Ordering::SeqCst);
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(reason.to_string());
        self.connected.fire();
        if !self.finished.fire() {
            tracing::warn!(reason, "Channel failure reported after it had already finished");
        }
        tracing::trace!(reason, "Channel failed");
    }

    pub fn on_close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.connected.fire();
        if !self.finished.fire() {
            tracing::warn!("Channel close reported after it had already finished");
        }
        tracing::trace!("Channel closed");
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ChannelState {
        if self.finished.is_fired() {
            ChannelState::Closed
        } else if self.connected.is_fired() {
            ChannelState::Open
        } else {
            ChannelState::Connecting
        }
    }

    pub fn connected(&self) -> &Signal {
        &self.connected
    }

    pub fn finished(&self) -> &Signal {
        &self.finished
    }

    /// Reason given by the last `on_failure`, if any.
    pub fn failure(&self) -> Option<String> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Shared writer for the remote shell's stdin.
#[derive(Clone)]
pub struct StdinHandle {
    inner: Arc<tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>>,
}

impl StdinHandle {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            inner: Arc::new(tokio::sync::Mutex::new(Box::new(writer))),
        }
    }

    /// Write and flush `bytes`.
    pub async fn write_all(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut writer = self.inner.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await
    }
}

/// Outcome of the remote process: `Ok(None)` when the channel closed without
/// reporting an exit code.
pub type ExitOutcome = Result<Option<i32>, RuntimeError>;

/// An open bidirectional stream to a container process.
pub struct RemoteChannel {
    stdin: StdinHandle,
    exit_code: oneshot::Receiver<ExitOutcome>,
    close: CancellationToken,
}

impl RemoteChannel {
    /// `close` is cancelled when the owner closes the channel; the runtime
    /// tears the stream down in response.
    pub fn new(
        stdin: StdinHandle,
        exit_code: oneshot::Receiver<ExitOutcome>,
        close: CancellationToken,
    ) -> Self {
        Self {
            stdin,
            exit_code,
            close,
        }
    }

    pub fn stdin(&self) -> &StdinHandle {
        &self.stdin
    }

    /// Close the channel. Safe to call more than once.
    pub fn close(&self) {
        self.close.cancel();
    }

    pub(crate) fn into_parts(
        self,
    ) -> (
        StdinHandle,
        oneshot::Receiver<ExitOutcome>,
        CancellationToken,
    ) {
        (self.stdin, self.exit_code, self.close)
    }
}
