//! In-memory collaborators for integration tests.
//!
//! Provides a scripted job scheduler, a scripted container runtime whose
//! channels record stdin, and an agent probe.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::Status;

use podlink::exec::{
    ChannelListener, ContainerRuntime, ExecRequest, ExitOutcome, OutputSink, OutputTee, PodRef,
    RemoteChannel, RuntimeError, StdinHandle, StreamKind,
};
use podlink::launcher::AgentProbe;
use podlink::sync::scheduler::{
    EventMessage, EventStream, EventStreamMessage, JobRunningEvent, JobScheduler, JobSubmission,
};
use podlink::sync::JobState;

type WatchItem = Result<EventStreamMessage, Status>;

pub fn tokens(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

pub fn running_event(job_id: &str, job_set_id: &str, pod: &str, namespace: &str, cluster: &str) -> JobRunningEvent {
    JobRunningEvent {
        job_id: job_id.to_string(),
        job_set_id: job_set_id.to_string(),
        pod_name: pod.to_string(),
        pod_namespace: namespace.to_string(),
        cluster_id: cluster.to_string(),
    }
}

// =============================================================================
// Scheduler
// =============================================================================

/// Scheduler with scripted job states and hand-fed watch streams.
///
/// A scripted status sequence is consumed one entry per query; the last
/// entry repeats. Events pushed before a watch opens are delivered when it
/// does.
#[derive(Default)]
pub struct FakeScheduler {
    statuses: Mutex<HashMap<String, VecDeque<Option<JobState>>>>,
    status_calls: AtomicUsize,
    submissions: Mutex<Vec<JobSubmission>>,
    cancels: Mutex<Vec<(String, String)>>,
    cancel_count: AtomicUsize,
    streams: Mutex<HashMap<String, mpsc::UnboundedSender<WatchItem>>>,
    pending: Mutex<HashMap<String, Vec<WatchItem>>>,
    watch_calls: AtomicUsize,
    next_message: AtomicUsize,
}

impl FakeScheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script_status<I>(&self, job_id: &str, states: I)
    where
        I: IntoIterator<Item = Option<JobState>>,
    {
        self.statuses
            .lock()
            .unwrap()
            .insert(job_id.to_string(), states.into_iter().collect());
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn submissions(&self) -> Vec<JobSubmission> {
        self.submissions.lock().unwrap().clone()
    }

    pub fn cancels(&self) -> Vec<(String, String)> {
        self.cancels.lock().unwrap().clone()
    }

    pub fn set_cancel_count(&self, count: usize) {
        self.cancel_count.store(count, Ordering::SeqCst);
    }

    pub fn watch_calls(&self) -> usize {
        self.watch_calls.load(Ordering::SeqCst)
    }

    pub fn push(&self, job_set_id: &str, item: WatchItem) {
        let streams = self.streams.lock().unwrap();
        let item = match streams.get(job_set_id) {
            Some(tx) => match tx.send(item) {
                Ok(()) => return,
                Err(mpsc::error::SendError(item)) => item,
            },
            None => item,
        };
        self.pending
            .lock()
            .unwrap()
            .entry(job_set_id.to_string())
            .or_default()
            .push(item);
    }

    pub fn push_message(&self, job_set_id: &str, message: EventMessage) {
        let id = self.next_message.fetch_add(1, Ordering::SeqCst);
        self.push(
            job_set_id,
            Ok(EventStreamMessage {
                id: format!("msg-{}", id),
                message: Some(message),
            }),
        );
    }

    pub fn push_running(&self, job_set_id: &str, job_id: &str, pod: &str, namespace: &str, cluster: &str) {
        self.push_message(
            job_set_id,
            EventMessage::Running(running_event(job_id, job_set_id, pod, namespace, cluster)),
        );
    }

    /// Close the open watch stream for `job_set_id`.
    pub fn end_stream(&self, job_set_id: &str) {
        self.streams.lock().unwrap().remove(job_set_id);
    }
}

#[async_trait]
impl JobScheduler for FakeScheduler {
    async fn submit_job(&self, submission: JobSubmission) -> Result<String, Status> {
        let mut submissions = self.submissions.lock().unwrap();
        submissions.push(submission);
        Ok(format!("job-{}", submissions.len()))
    }

    async fn job_status(&self, job_id: &str) -> Result<Option<JobState>, Status> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let mut statuses = self.statuses.lock().unwrap();
        let state = match statuses.get_mut(job_id) {
            Some(script) if script.len() > 1 => script.pop_front().flatten(),
            Some(script) => script.front().copied().flatten(),
            None => None,
        };
        Ok(state)
    }

    async fn cancel_job(&self, job_id: &str, job_set_id: &str) -> Result<usize, Status> {
        self.cancels
            .lock()
            .unwrap()
            .push((job_id.to_string(), job_set_id.to_string()));
        Ok(self.cancel_count.load(Ordering::SeqCst))
    }

    async fn watch_job_set(&self, job_set_id: &str) -> Result<EventStream, Status> {
        self.watch_calls.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(items) = self.pending.lock().unwrap().remove(job_set_id) {
            for item in items {
                let _ = tx.send(item);
            }
        }
        self.streams
            .lock()
            .unwrap()
            .insert(job_set_id.to_string(), tx);
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}

// =============================================================================
// Container runtime
// =============================================================================

/// What the fake runtime does for one exec attempt.
#[derive(Debug, Clone)]
pub enum Connect {
    /// Channel opens immediately
    Open,
    /// `exec` itself fails with a retryable error
    Refuse,
    /// Channel never opens
    Hang,
    /// `exec` itself never returns
    Stall,
    /// Channel reports a failure instead of opening
    FailOnOpen(String),
    /// `exec` reports the container as missing
    ContainerMissing,
    /// Channel opens and the shell exits straight away
    ExitImmediately,
    /// Channel opens and the process exits with `code` after `after`
    OpenThenExit { after: Duration, code: i32 },
}

pub struct FakeRuntime {
    script: Mutex<VecDeque<Connect>>,
    pod_exists: AtomicBool,
    stall_pod_lookup: AtomicBool,
    fail_writes: Arc<AtomicBool>,
    stall_writes: Arc<AtomicBool>,
    requests: Mutex<Vec<(PodRef, String, Vec<String>)>>,
    channels: Mutex<Vec<Arc<FakeChannel>>>,
    attempts: Mutex<Vec<Instant>>,
}

impl FakeRuntime {
    /// Runtime where every exec opens unless scripted otherwise.
    pub fn new() -> Arc<Self> {
        Self::scripted(Vec::new())
    }

    pub fn scripted(script: Vec<Connect>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            pod_exists: AtomicBool::new(true),
            stall_pod_lookup: AtomicBool::new(false),
            fail_writes: Arc::new(AtomicBool::new(false)),
            stall_writes: Arc::new(AtomicBool::new(false)),
            requests: Mutex::new(Vec::new()),
            channels: Mutex::new(Vec::new()),
            attempts: Mutex::new(Vec::new()),
        })
    }

    pub fn set_pod_exists(&self, exists: bool) {
        self.pod_exists.store(exists, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make `pod_exists` block forever.
    pub fn stall_pod_lookup(&self, stall: bool) {
        self.stall_pod_lookup.store(stall, Ordering::SeqCst);
    }

    /// Make every channel's stdin stop accepting bytes.
    pub fn stall_writes(&self, stall: bool) {
        self.stall_writes.store(stall, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }

    pub fn attempt_times(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn requests(&self) -> Vec<(PodRef, String, Vec<String>)> {
        self.requests.lock().unwrap().clone()
    }

    pub fn channels(&self) -> Vec<Arc<FakeChannel>> {
        self.channels.lock().unwrap().clone()
    }

    pub fn last_channel(&self) -> Arc<FakeChannel> {
        self.channels
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no channel opened")
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn pod_exists(&self, _pod: &PodRef) -> Result<bool, RuntimeError> {
        if self.stall_pod_lookup.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(self.pod_exists.load(Ordering::SeqCst))
    }

    async fn exec(&self, request: ExecRequest) -> Result<RemoteChannel, RuntimeError> {
        self.attempts.lock().unwrap().push(Instant::now());
        self.requests.lock().unwrap().push((
            request.pod.clone(),
            request.container.clone(),
            request.command.clone(),
        ));

        let behaviour = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Connect::Open);

        match behaviour {
            Connect::Stall => std::future::pending::<()>().await,
            Connect::Refuse => return Err(RuntimeError::Unavailable("connection refused".to_string())),
            Connect::ContainerMissing => {
                return Err(RuntimeError::ContainerNotFound {
                    container: request.container,
                    pod: request.pod.name,
                })
            }
            _ => {}
        }

        let (exit_tx, exit_rx) = oneshot::channel();
        let close = CancellationToken::new();
        let stdin = Arc::new(Mutex::new(Vec::new()));
        let channel = Arc::new(FakeChannel {
            listener: request.listener,
            output: request.output,
            stdin: Arc::clone(&stdin),
            exit: Mutex::new(Some(exit_tx)),
            close: close.clone(),
        });
        self.channels.lock().unwrap().push(Arc::clone(&channel));

        let watched = Arc::clone(&channel);
        tokio::spawn(async move {
            tokio::select! {
                _ = watched.close.cancelled() => {
                    if !watched.listener.finished().is_fired() {
                        watched.finish(Ok(None));
                    }
                }
                _ = watched.listener.finished().wait() => {}
            }
        });

        match behaviour {
            Connect::Open => channel.listener.on_open(),
            Connect::Hang => {}
            Connect::FailOnOpen(reason) => channel.listener.on_failure(&reason),
            Connect::ExitImmediately => {
                channel.listener.on_open();
                channel.exit_with(1);
            }
            Connect::OpenThenExit { after, code } => {
                channel.listener.on_open();
                let exiting = Arc::clone(&channel);
                tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    exiting.exit_with(code);
                });
            }
            Connect::Refuse | Connect::ContainerMissing | Connect::Stall => unreachable!(),
        }

        let writer = RecordingWriter {
            buf: stdin,
            fail: Arc::clone(&self.fail_writes),
            stall: Arc::clone(&self.stall_writes),
        };
        Ok(RemoteChannel::new(StdinHandle::new(writer), exit_rx, close))
    }
}

/// Remote end of a fake channel.
pub struct FakeChannel {
    pub listener: ChannelListener,
    pub output: Arc<OutputTee>,
    stdin: Arc<Mutex<Vec<u8>>>,
    exit: Mutex<Option<oneshot::Sender<ExitOutcome>>>,
    close: CancellationToken,
}

impl FakeChannel {
    pub fn stdin_bytes(&self) -> Vec<u8> {
        self.stdin.lock().unwrap().clone()
    }

    pub fn stdin_text(&self) -> String {
        String::from_utf8_lossy(&self.stdin_bytes()).into_owned()
    }

    pub fn emit(&self, stream: StreamKind, data: &[u8]) {
        self.output.write(stream, data);
    }

    /// Resolve the exit code and close the channel.
    pub fn finish(&self, outcome: ExitOutcome) {
        if let Some(tx) = self.exit.lock().unwrap().take() {
            let _ = tx.send(outcome);
        }
        self.listener.on_close();
    }

    pub fn exit_with(&self, code: i32) {
        self.finish(Ok(Some(code)));
    }

    /// Whether the local side closed this channel.
    pub fn is_closed(&self) -> bool {
        self.close.is_cancelled()
    }
}

struct RecordingWriter {
    buf: Arc<Mutex<Vec<u8>>>,
    fail: Arc<AtomicBool>,
    stall: Arc<AtomicBool>,
}

impl AsyncWrite for RecordingWriter {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        if self.stall.load(Ordering::SeqCst) {
            return Poll::Pending;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "channel broken")));
        }
        self.buf.lock().unwrap().extend_from_slice(data);
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

// =============================================================================
// Agent probe
// =============================================================================

/// Agent that comes online on the `online_after`-th check.
pub struct FakeProbe {
    online_after: usize,
    checks: AtomicUsize,
}

impl FakeProbe {
    pub fn online_after(checks: usize) -> Arc<Self> {
        Arc::new(Self {
            online_after: checks,
            checks: AtomicUsize::new(0),
        })
    }

    pub fn never() -> Arc<Self> {
        Self::online_after(usize::MAX)
    }

    pub fn checks(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentProbe for FakeProbe {
    async fn is_online(&self, _agent: &str) -> bool {
        let checks = self.checks.fetch_add(1, Ordering::SeqCst) + 1;
        checks >= self.online_after
    }
}
