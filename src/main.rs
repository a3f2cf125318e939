use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use podlink::config::{ExecConfig, PodlinkConfig};
use podlink::exec::{
    EnvLayers, ExecSession, KubectlRuntime, PodRef, StaticTarget, StdioSink,
};
use podlink::shutdown::install_shutdown_handler;

/// Exit status reported when the command was interrupted.
const INTERRUPTED_EXIT_CODE: i32 = 130;

#[derive(Parser, Debug)]
#[command(name = "podlink")]
#[command(version)]
#[command(about = "Run commands inside Kubernetes containers over an interactive shell")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a command inside a container and exit with its exit code
    Exec(ExecArgs),
}

// =============================================================================
// Exec Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ExecArgs {
    /// Pod to exec into
    #[arg(long)]
    pod: String,

    /// Namespace of the pod
    #[arg(long, short = 'n', default_value = "default")]
    namespace: String,

    /// Container inside the pod
    #[arg(long, short = 'c')]
    container: String,

    /// Working directory for the command
    #[arg(long)]
    workdir: Option<String>,

    /// Environment variable for the command (NAME=value, repeatable)
    #[arg(long = "env", short = 'e')]
    env: Vec<String>,

    /// Index of a command token to hide in logs (repeatable)
    #[arg(long = "mask")]
    mask: Vec<usize>,

    /// Shell started in the container
    #[arg(long, default_value = "sh")]
    shell: String,

    /// Seconds to wait for each connection attempt
    #[arg(long, default_value = "30")]
    connect_timeout: u64,

    /// Connection attempts before giving up
    #[arg(long, default_value = "5")]
    max_retries: u32,

    /// Path to the kubectl binary
    #[arg(long, default_value = "kubectl")]
    kubectl: String,

    /// kubeconfig context to use
    #[arg(long)]
    context: Option<String>,

    /// Path to a kubeconfig file
    #[arg(long)]
    kubeconfig: Option<String>,

    /// Command and arguments to run
    #[arg(last = true, required = true)]
    command: Vec<String>,
}

impl ExecArgs {
    fn exec_config(&self) -> ExecConfig {
        ExecConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout),
            max_connect_retries: self.max_retries,
            shell: self.shell.clone(),
            ..ExecConfig::default()
        }
    }

    fn runtime(&self) -> KubectlRuntime {
        let mut runtime = KubectlRuntime::new().with_binary(&self.kubectl);
        if let Some(ref context) = self.context {
            runtime = runtime.with_context(context);
        }
        if let Some(ref kubeconfig) = self.kubeconfig {
            runtime = runtime.with_kubeconfig(kubeconfig);
        }
        runtime
    }

    fn masks(&self) -> Vec<bool> {
        let mut masks = vec![false; self.command.len()];
        for &index in &self.mask {
            match masks.get_mut(index) {
                Some(mask) => *mask = true,
                None => tracing::warn!(index, "Ignoring mask past the end of the command"),
            }
        }
        masks
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let code = match args.command {
        Commands::Exec(exec_args) => run_exec(exec_args).await?,
    };

    std::process::exit(code);
}

async fn run_exec(args: ExecArgs) -> Result<i32, Box<dyn std::error::Error>> {
    let config = PodlinkConfig::default().with_exec(args.exec_config());
    config.validate()?;

    let cancel = install_shutdown_handler()?;
    let target = StaticTarget::new(PodRef::new(&args.pod, &args.namespace));

    let mut session = ExecSession::new(
        Arc::new(args.runtime()),
        Arc::new(target),
        &args.container,
        config.exec,
    )
    .with_env(EnvLayers::new().with_invocation_lines(&args.env))
    .with_output(Arc::new(StdioSink))
    .with_cancel(cancel.clone());
    if let Some(ref workdir) = args.workdir {
        session = session.with_working_dir(workdir);
    }

    let masks = args.masks();
    let handle = session.run(&args.command, &masks).await?;

    let code = tokio::select! {
        code = handle.join() => code,
        _ = cancel.cancelled() => {
            handle.kill().await;
            INTERRUPTED_EXIT_CODE
        }
    };

    session.close();
    tracing::debug!(exit_code = code, "Command finished");
    Ok(code)
}
