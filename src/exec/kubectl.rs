use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, BufWriter};
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::exec::channel::{RemoteChannel, StdinHandle};
use crate::exec::output::{OutputSink, OutputTee, StreamKind};
use crate::exec::runtime::{ContainerRuntime, ExecRequest, PodRef, RuntimeError};

const READ_CHUNK: usize = 8 * 1024;

/// Container runtime backed by the `kubectl` binary.
///
/// Each exec is a `kubectl exec -i` child process whose stdin, stdout and
/// stderr form the remote channel. A pod carrying a server URL is reached
/// with `--server`.
///
/// The listener's open signal fires once the child is spawned, not when
/// kubectl has reached the API server. Connection problems surface as an
/// early exit of the child instead of a connect timeout.
#[derive(Debug, Clone)]
pub struct KubectlRuntime {
    binary: String,
    context: Option<String>,
    kubeconfig: Option<String>,
}

impl Default for KubectlRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl KubectlRuntime {
    pub fn new() -> Self {
        Self {
            binary: "kubectl".to_string(),
            context: None,
            kubeconfig: None,
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_kubeconfig(mut self, path: impl Into<String>) -> Self {
        self.kubeconfig = Some(path.into());
        self
    }

    fn global_args(&self, pod: &PodRef) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(ref kubeconfig) = self.kubeconfig {
            args.push(format!("--kubeconfig={}", kubeconfig));
        }
        if let Some(ref context) = self.context {
            args.push(format!("--context={}", context));
        }
        if let Some(ref server) = pod.server {
            args.push(format!("--server={}", server));
        }
        args
    }

    fn get_pod_args(&self, pod: &PodRef, output: &str) -> Vec<String> {
        let mut args = self.global_args(pod);
        args.push("get".to_string());
        args.push("pod".to_string());
        args.push(pod.name.clone());
        args.push(format!("--namespace={}", pod.namespace));
        args.push(format!("--output={}", output));
        args
    }

    fn exec_args(&self, request: &ExecRequest) -> Vec<String> {
        let mut args = self.global_args(&request.pod);
        args.push("exec".to_string());
        args.push("-i".to_string());
        args.push(format!("--namespace={}", request.pod.namespace));
        args.push(request.pod.name.clone());
        args.push(format!("--container={}", request.container));
        args.push("--".to_string());
        args.extend(request.command.iter().cloned());
        args
    }

    async fn run_get(&self, pod: &PodRef, output: &str) -> Result<std::process::Output, RuntimeError> {
        let output = Command::new(&self.binary)
            .args(self.get_pod_args(pod, output))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;
        Ok(output)
    }

    async fn container_names(&self, pod: &PodRef) -> Result<Vec<String>, RuntimeError> {
        let output = self
            .run_get(pod, "jsonpath={.spec.containers[*].name}")
            .await?;
        if !output.status.success() {
            return Err(RuntimeError::Unavailable(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .split_whitespace()
            .map(str::to_string)
            .collect())
    }
}

#[async_trait]
impl ContainerRuntime for KubectlRuntime {
    async fn pod_exists(&self, pod: &PodRef) -> Result<bool, RuntimeError> {
        let output = self.run_get(pod, "name").await?;
        if output.status.success() {
            return Ok(true);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("NotFound") || stderr.contains("not found") {
            tracing::debug!(pod = %pod, "Pod not found");
            return Ok(false);
        }
        Err(RuntimeError::Unavailable(stderr.trim().to_string()))
    }

    async fn exec(&self, request: ExecRequest) -> Result<RemoteChannel, RuntimeError> {
        let containers = self.container_names(&request.pod).await?;
        if !containers.iter().any(|c| c == &request.container) {
            return Err(RuntimeError::ContainerNotFound {
                container: request.container.clone(),
                pod: request.pod.name.clone(),
            });
        }

        let args = self.exec_args(&request);
        tracing::debug!(pod = %request.pod, container = %request.container, ?args, "Spawning kubectl exec");

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(RuntimeError::Unavailable(
                "kubectl exec did not expose its standard streams".to_string(),
            ));
        };

        let stdin = StdinHandle::new(BufWriter::with_capacity(request.stdin_buffer_size, stdin));
        let (exit_tx, exit_rx) = oneshot::channel();
        let close = CancellationToken::new();
        let listener = request.listener;
        let output = request.output;

        listener.on_open();

        let stdout_task = tokio::spawn(pump(stdout, StreamKind::Stdout, Arc::clone(&output)));
        let stderr_task = tokio::spawn(pump(stderr, StreamKind::Stderr, Arc::clone(&output)));
        let closed = close.clone();

        tokio::spawn(async move {
            let exited = tokio::select! {
                status = child.wait() => Some(status),
                _ = closed.cancelled() => None,
            };
            let status = match exited {
                Some(status) => status,
                None => {
                    if let Err(e) = child.start_kill() {
                        tracing::debug!(error = %e, "kubectl exec already exited");
                    }
                    child.wait().await
                }
            };

            let _ = stdout_task.await;
            let _ = stderr_task.await;

            let outcome = match status {
                Ok(status) => {
                    tracing::debug!(exit_code = ?status.code(), "kubectl exec finished");
                    Ok(status.code())
                }
                Err(e) => Err(RuntimeError::Io(e)),
            };
            let _ = exit_tx.send(outcome);
            listener.on_close();
        });

        Ok(RemoteChannel::new(stdin, exit_rx, close))
    }
}

/// Copy one output stream of the child into the session's tee.
async fn pump<R>(mut reader: R, stream: StreamKind, output: Arc<OutputTee>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => output.write(stream, &buf[..n]),
            Err(e) => {
                tracing::debug!(?stream, error = %e, "Stopped reading kubectl output");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::channel::ChannelListener;

    fn request() -> ExecRequest {
        ExecRequest {
            pod: PodRef::new("agent-0", "builds"),
            container: "jnlp".to_string(),
            command: vec!["sh".to_string()],
            stdin_buffer_size: 16 * 1024,
            output: Arc::new(OutputTee::new(None)),
            listener: ChannelListener::new(),
        }
    }

    #[test]
    fn exec_args_target_pod_and_container() {
        let runtime = KubectlRuntime::new();
        assert_eq!(
            runtime.exec_args(&request()),
            vec!["exec", "-i", "--namespace=builds", "agent-0", "--container=jnlp", "--", "sh"]
        );
    }

    #[test]
    fn global_flags_come_first() {
        let runtime = KubectlRuntime::new()
            .with_context("prod")
            .with_kubeconfig("/etc/kube/config");
        let args = runtime.get_pod_args(&PodRef::new("agent-0", "builds"), "name");
        assert_eq!(
            args,
            vec![
                "--kubeconfig=/etc/kube/config",
                "--context=prod",
                "get",
                "pod",
                "agent-0",
                "--namespace=builds",
                "--output=name"
            ]
        );
    }

    #[test]
    fn pod_server_is_passed_to_kubectl() {
        let runtime = KubectlRuntime::new().with_context("prod");
        let mut exec = request();
        exec.pod = PodRef::new("agent-0", "builds").with_server("https://c1.example:6443");

        let args = runtime.exec_args(&exec);
        assert_eq!(&args[..3], ["--context=prod", "--server=https://c1.example:6443", "exec"]);

        let args = runtime.get_pod_args(&exec.pod, "name");
        assert!(args.contains(&"--server=https://c1.example:6443".to_string()));
    }

    #[tokio::test]
    async fn missing_binary_is_an_io_error() {
        let runtime = KubectlRuntime::new().with_binary("/nonexistent/kubectl");
        let err = runtime
            .pod_exists(&PodRef::new("agent-0", "builds"))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Io(_)));
    }
}
