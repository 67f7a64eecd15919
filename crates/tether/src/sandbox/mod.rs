//! Workload execution.
//!
//! The sandbox reports `loading`, loads the target, reports `executing`,
//! runs it, and reports exactly one terminal status. Every way a workload
//! can end becomes an [`ExecutionOutcome`]; nothing escapes as a panic.

mod context;

pub use context::{
    DEFAULT_AWAIT_POLL, DEFAULT_AWAIT_TIMEOUT, DEFAULT_EMIT_TYPE, DEFAULT_LOGGER_NAME,
    ExecutionContext, WorkloadLogger,
};

use std::any::Any;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};

use crate::bridge::protocol::{MessageType, ScriptStatus};
use crate::channel::ChannelSender;
use crate::inbox::Inbox;
use crate::workload::{WorkloadError, WorkloadLoader};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorDetail {
    pub message: String,
    pub trace: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    exit_code: i32,
    error: Option<ErrorDetail>,
}

impl ExecutionOutcome {
    pub fn completed() -> Self {
        Self {
            exit_code: 0,
            error: None,
        }
    }

    pub fn exited(code: i32) -> Self {
        Self {
            exit_code: code,
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>, trace: Option<String>) -> Self {
        Self {
            exit_code: 1,
            error: Some(ErrorDetail {
                message: message.into(),
                trace,
            }),
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    pub fn error(&self) -> Option<&ErrorDetail> {
        self.error.as_ref()
    }
}

pub struct Sandbox {
    link: ChannelSender,
    inbox: Arc<Inbox>,
    await_poll: Duration,
}

impl Sandbox {
    pub fn new(link: ChannelSender, inbox: Arc<Inbox>) -> Self {
        Self {
            link,
            inbox,
            await_poll: DEFAULT_AWAIT_POLL,
        }
    }

    pub fn with_await_poll(mut self, poll: Duration) -> Self {
        self.await_poll = poll;
        self
    }

    /// Context for one run. Channel access is bound only if the channel is
    /// connected right now.
    pub fn build_context(&self, args: Map<String, Value>, script_path: &Path) -> ExecutionContext {
        if self.link.is_connected() {
            ExecutionContext::linked(
                args,
                script_path,
                self.link.clone(),
                Arc::clone(&self.inbox),
                self.await_poll,
            )
        } else {
            ExecutionContext::unlinked(args, script_path)
        }
    }

    pub async fn run(
        &self,
        target: &Path,
        loader: &dyn WorkloadLoader,
        ctx: ExecutionContext,
    ) -> ExecutionOutcome {
        tracing::info!(target_script = %target.display(), "Loading workload");
        self.report(ScriptStatus::loading(target, ctx.args())).await;

        let workload = match loader.load(target) {
            Ok(workload) => workload,
            Err(e) => return self.fault(target, e).await,
        };

        tracing::info!(target_script = %target.display(), "Executing workload");
        self.report(ScriptStatus::executing(target)).await;

        let result = match tokio::spawn(async move { workload.run(ctx).await }).await {
            Ok(result) => result,
            Err(join_err) if join_err.is_panic() => Err(WorkloadError::Fault(anyhow::anyhow!(
                "workload panicked: {}",
                panic_message(&*join_err.into_panic())
            ))),
            Err(join_err) => Err(WorkloadError::Fault(anyhow::anyhow!(
                "workload task did not finish: {join_err}"
            ))),
        };

        let script_path = target.display().to_string();
        match result {
            Ok(()) => {
                tracing::info!("Workload completed");
                self.report(ScriptStatus::Completed {
                    script_path,
                    exit_code: 0,
                })
                .await;
                ExecutionOutcome::completed()
            }
            Err(WorkloadError::Exit(code)) => {
                tracing::info!(exit_code = code, "Workload exited");
                self.report(ScriptStatus::Exited {
                    script_path,
                    exit_code: code,
                })
                .await;
                ExecutionOutcome::exited(code)
            }
            Err(WorkloadError::Fault(e)) => self.fault(target, e).await,
        }
    }

    async fn fault(&self, target: &Path, error: anyhow::Error) -> ExecutionOutcome {
        let message = error.to_string();
        let trace = format!("{error:?}");
        tracing::error!(error = %message, "Workload failed");
        tracing::debug!(trace = %trace, "Workload failure detail");

        self.report(ScriptStatus::Failed {
            script_path: target.display().to_string(),
            error: message.clone(),
            traceback: Some(trace.clone()),
        })
        .await;
        ExecutionOutcome::failed(message, Some(trace))
    }

    async fn report(&self, status: ScriptStatus) {
        if !self.link.is_connected() {
            return;
        }
        if !self.link.send_json(MessageType::ScriptStatus, &status).await {
            tracing::warn!(status = status.name(), "Failed to report workload status");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
