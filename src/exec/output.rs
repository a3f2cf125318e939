use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Destination for a remote process's output.
pub trait OutputSink: Send + Sync {
    fn write(&self, stream: StreamKind, data: &[u8]);
}

#[derive(Debug, Default, Clone)]
struct Captured {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    /// Both streams plus session notes, in arrival order
    transcript: Vec<u8>,
}

/// In-memory sink keeping each stream separately.
#[derive(Debug, Default, Clone)]
pub struct BufferSink {
    inner: Arc<Mutex<Captured>>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn captured(&self) -> MutexGuard<'_, Captured> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn stdout(&self) -> Vec<u8> {
        self.captured().stdout.clone()
    }

    pub fn stderr(&self) -> Vec<u8> {
        self.captured().stderr.clone()
    }

    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.captured().stdout).into_owned()
    }
}

impl OutputSink for BufferSink {
    fn write(&self, stream: StreamKind, data: &[u8]) {
        let mut captured = self.captured();
        match stream {
            StreamKind::Stdout => captured.stdout.extend_from_slice(data),
            StreamKind::Stderr => captured.stderr.extend_from_slice(data),
        }
        captured.transcript.extend_from_slice(data);
    }
}

/// Sink forwarding to this process's own stdout/stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdioSink;

impl OutputSink for StdioSink {
    fn write(&self, stream: StreamKind, data: &[u8]) {
        use std::io::Write;
        // Terminal write failures have nowhere better to go.
        let _ = match stream {
            StreamKind::Stdout => std::io::stdout().write_all(data),
            StreamKind::Stderr => std::io::stderr().write_all(data),
        };
    }
}

/// Splits remote output between an always-on diagnostic buffer and an
/// optional caller sink that can be muted.
///
/// The caller leg is muted while the protocol preamble runs so callers only
/// see output produced by their own command.
pub struct OutputTee {
    diagnostic: BufferSink,
    caller: Option<Arc<dyn OutputSink>>,
    caller_enabled: AtomicBool,
}

impl OutputTee {
    pub fn new(caller: Option<Arc<dyn OutputSink>>) -> Self {
        Self {
            diagnostic: BufferSink::new(),
            caller,
            caller_enabled: AtomicBool::new(true),
        }
    }

    pub fn mute_caller(&self) {
        self.caller_enabled.store(false, Ordering::SeqCst);
    }

    pub fn unmute_caller(&self) {
        self.caller_enabled.store(true, Ordering::SeqCst);
    }

    pub fn caller_muted(&self) -> bool {
        !self.caller_enabled.load(Ordering::SeqCst)
    }

    /// Record a session note. Notes go to the diagnostic buffer only.
    pub fn note(&self, line: &str) {
        let mut captured = self.diagnostic.captured();
        captured.transcript.extend_from_slice(line.as_bytes());
        if !line.ends_with('\n') {
            captured.transcript.push(b'\n');
        }
    }

    pub fn stdout(&self) -> Vec<u8> {
        self.diagnostic.stdout()
    }

    pub fn stderr(&self) -> Vec<u8> {
        self.diagnostic.stderr()
    }

    /// Everything captured so far, notes included.
    pub fn transcript(&self) -> String {
        String::from_utf8_lossy(&self.diagnostic.captured().transcript).into_owned()
    }
}

impl OutputSink for OutputTee {
    fn write(&self, stream: StreamKind, data: &[u8]) {
        self.diagnostic.write(stream, data);
        if let Some(caller) = &self.caller {
            if self.caller_enabled.load(Ordering::SeqCst) {
                caller.write(stream, data);
            }
        }
    }
}
