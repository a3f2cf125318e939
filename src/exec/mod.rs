//! Remote command execution inside containers.
//!
//! An [`ExecSession`] opens an interactive channel to a shell in the target
//! container (retrying with backoff), injects `cd`/`export` lines and the
//! command over stdin, and hands back a [`ProcessHandle`] for the running
//! command. The container runtime itself sits behind [`ContainerRuntime`].

pub mod channel;
pub mod env;
pub mod kubectl;
pub mod output;
pub mod process;
pub mod protocol;
pub mod runtime;
pub mod session;
pub mod target;

pub use channel::{ChannelListener, ChannelState, ExitOutcome, RemoteChannel, Signal, StdinHandle};
pub use env::{EnvLayers, EnvMap};
pub use kubectl::KubectlRuntime;
pub use output::{BufferSink, OutputSink, OutputTee, StdioSink, StreamKind};
pub use process::{ProcessHandle, UNKNOWN_EXIT_CODE};
pub use runtime::{ContainerRuntime, ExecRequest, PodRef, RuntimeError};
pub use session::ExecSession;
pub use target::{ClusterDirectory, ResolvedTarget, RunningJobTarget, StaticTarget, TargetResolver};
