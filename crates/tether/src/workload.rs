//! Workloads and how they are loaded.
//!
//! A [`Workload`] is the unit the sandbox runs. Two ways to get one:
//! - in-process: implement the trait (or wrap a closure with [`workload_fn`])
//!   and hand a loader to the supervisor
//! - out-of-process: [`ProcessLoader`] runs the target file as a child
//!   process and bridges its stdio onto the execution context

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout, Command};
use tokio_util::sync::CancellationToken;

use crate::sandbox::ExecutionContext;

/// Environment variable carrying the argument object as JSON.
pub const ARGS_ENV: &str = "TETHER_ARGS";
/// Environment variable carrying the workload's own path.
pub const SCRIPT_ENV: &str = "TETHER_SCRIPT";

const STDIN_POLL: Duration = Duration::from_millis(500);
const STDOUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// How a workload ends when it does not return normally.
#[derive(Debug, thiserror::Error)]
pub enum WorkloadError {
    /// Deliberate exit with a status code; not a fault.
    #[error("workload exited with code {0}")]
    Exit(i32),

    #[error(transparent)]
    Fault(#[from] anyhow::Error),
}

impl WorkloadError {
    pub fn exit(code: i32) -> Self {
        Self::Exit(code)
    }
}

#[async_trait]
pub trait Workload: Send + Sync + 'static {
    async fn run(&self, ctx: ExecutionContext) -> Result<(), WorkloadError>;
}

/// Resolves a validated target path to something runnable.
pub trait WorkloadLoader: Send + Sync {
    fn load(&self, target: &Path) -> anyhow::Result<Arc<dyn Workload>>;
}

impl<F> WorkloadLoader for F
where
    F: Fn(&Path) -> anyhow::Result<Arc<dyn Workload>> + Send + Sync,
{
    fn load(&self, target: &Path) -> anyhow::Result<Arc<dyn Workload>> {
        self(target)
    }
}

struct FnWorkload<F>(F);

#[async_trait]
impl<F, Fut> Workload for FnWorkload<F>
where
    F: Fn(ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), WorkloadError>> + Send + 'static,
{
    async fn run(&self, ctx: ExecutionContext) -> Result<(), WorkloadError> {
        (self.0)(ctx).await
    }
}

/// Wrap an async closure as a workload.
pub fn workload_fn<F, Fut>(f: F) -> Arc<dyn Workload>
where
    F: Fn(ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), WorkloadError>> + Send + 'static,
{
    Arc::new(FnWorkload(f))
}

/// Loads every target as an executable child process.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessLoader;

impl WorkloadLoader for ProcessLoader {
    fn load(&self, target: &Path) -> anyhow::Result<Arc<dyn Workload>> {
        Ok(Arc::new(ProcessWorkload::new(target)))
    }
}

/// Runs the target as a child process.
///
/// - arguments arrive as JSON in `TETHER_ARGS`
/// - each stdout line is emitted (parsed as JSON when it parses, else as a
///   string), or logged when there is no channel
/// - inbound data is written to stdin as one JSON document per line
/// - stderr is inherited
///
/// The child inherits this process's resource ceilings.
#[derive(Debug, Clone)]
pub struct ProcessWorkload {
    program: PathBuf,
}

impl ProcessWorkload {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl Workload for ProcessWorkload {
    async fn run(&self, ctx: ExecutionContext) -> Result<(), WorkloadError> {
        let args = serde_json::to_string(ctx.args()).context("failed to encode workload arguments")?;
        let bridged = ctx.can_communicate();

        let mut child = Command::new(&self.program)
            .env(ARGS_ENV, args)
            .env(SCRIPT_ENV, &self.program)
            .stdin(if bridged { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.program.display()))?;
        tracing::debug!(child_pid = child.id(), "Workload process spawned");

        let stdout = child
            .stdout
            .take()
            .context("workload stdout was not captured")?;
        let mut stdout_task = tokio::spawn(forward_stdout(stdout, ctx.clone()));

        let stop = CancellationToken::new();
        let stdin_task = child
            .stdin
            .take()
            .map(|stdin| tokio::spawn(forward_inbound(stdin, ctx.clone(), stop.clone())));

        let status = child
            .wait()
            .await
            .context("failed to wait for workload process")?;
        stop.cancel();
        if let Some(task) = stdin_task {
            let _ = task.await;
        }
        // Output written just before exit still goes out ahead of the final
        // status; a grandchild holding the pipe open does not stall us.
        if tokio::time::timeout(STDOUT_DRAIN_TIMEOUT, &mut stdout_task)
            .await
            .is_err()
        {
            tracing::warn!("Workload stdout still open after exit, abandoning");
            stdout_task.abort();
        }

        exit_status_result(status)
    }
}

fn exit_status_result(status: ExitStatus) -> Result<(), WorkloadError> {
    if status.success() {
        return Ok(());
    }
    if let Some(code) = status.code() {
        return Err(WorkloadError::Exit(code));
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return Err(anyhow!("workload process terminated by signal {signal}").into());
        }
    }
    Err(anyhow!("workload process ended abnormally: {status}").into())
}

async fn forward_stdout(stdout: ChildStdout, ctx: ExecutionContext) {
    let logger = ctx.logger("stdout");
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let data = serde_json::from_str(&line).unwrap_or(Value::String(line));
                if !(ctx.can_communicate() && ctx.emit(data.clone()).await) {
                    match data {
                        Value::String(text) => logger.info(text),
                        other => logger.info(other),
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read workload stdout");
                break;
            }
        }
    }
}

async fn forward_inbound(mut stdin: ChildStdin, ctx: ExecutionContext, stop: CancellationToken) {
    loop {
        let payload = tokio::select! {
            _ = stop.cancelled() => break,
            payload = ctx.await_inbound(STDIN_POLL) => payload,
        };
        let Some(payload) = payload else {
            continue;
        };

        let mut line = payload.to_string();
        line.push('\n');
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            tracing::debug!(error = %e, "Workload stdin closed");
            break;
        }
    }
}
