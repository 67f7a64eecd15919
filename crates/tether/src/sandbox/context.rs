//! What a running workload sees of its host.

use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::{Map, Value};

use crate::bridge::protocol::{EmitPayload, MessageType};
use crate::channel::ChannelSender;
use crate::inbox::Inbox;

pub const DEFAULT_EMIT_TYPE: &str = "workload_data";
pub const DEFAULT_AWAIT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_AWAIT_POLL: Duration = Duration::from_millis(100);
pub const DEFAULT_LOGGER_NAME: &str = "workload";

/// Channel access for one execution: the write path plus the inbound queue.
struct Link {
    sender: ChannelSender,
    inbox: Arc<Inbox>,
    /// Data drained from the inbox but not yet handed out.
    pending: Mutex<VecDeque<Value>>,
    poll: Duration,
}

impl Link {
    fn pending(&self) -> MutexGuard<'_, VecDeque<Value>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Pending data mutex poisoned - recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Next queued payload, refilling from the inbox first if needed.
    fn take_next(&self) -> Option<Value> {
        let mut pending = self.pending();
        if pending.is_empty() {
            pending.extend(self.inbox.drain().into_iter().map(|m| m.into_payload()));
        }
        pending.pop_front()
    }
}

/// Handed to the workload for the duration of one run. Cheap to clone.
#[derive(Clone)]
pub struct ExecutionContext {
    args: Arc<Map<String, Value>>,
    script_path: Arc<PathBuf>,
    link: Option<Arc<Link>>,
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("args", &self.args)
            .field("script_path", &self.script_path)
            .field("linked", &self.link.is_some())
            .finish()
    }
}

impl ExecutionContext {
    pub(crate) fn linked(
        args: Map<String, Value>,
        script_path: &Path,
        sender: ChannelSender,
        inbox: Arc<Inbox>,
        poll: Duration,
    ) -> Self {
        Self {
            args: Arc::new(args),
            script_path: Arc::new(script_path.to_path_buf()),
            link: Some(Arc::new(Link {
                sender,
                inbox,
                pending: Mutex::new(VecDeque::new()),
                poll,
            })),
        }
    }

    pub(crate) fn unlinked(args: Map<String, Value>, script_path: &Path) -> Self {
        Self {
            args: Arc::new(args),
            script_path: Arc::new(script_path.to_path_buf()),
            link: None,
        }
    }

    /// A context with no supervisor behind it.
    pub fn standalone(args: Map<String, Value>) -> Self {
        Self::unlinked(args, Path::new(""))
    }

    pub fn args(&self) -> &Map<String, Value> {
        &self.args
    }

    pub fn arg(&self, key: &str) -> Option<&Value> {
        self.args.get(key)
    }

    pub fn script_path(&self) -> &Path {
        &self.script_path
    }

    pub fn logger(&self, name: impl Into<String>) -> WorkloadLogger {
        WorkloadLogger::new(name)
    }

    /// True only while the supervisor channel is up.
    pub fn can_communicate(&self) -> bool {
        self.link
            .as_ref()
            .is_some_and(|link| link.sender.is_connected())
    }

    /// Send `data` to the supervisor as `workload_data`.
    pub async fn emit(&self, data: Value) -> bool {
        self.emit_as(data, DEFAULT_EMIT_TYPE).await
    }

    /// Send `data` under a caller-chosen message type. Returns false with a
    /// warning when there is no channel.
    pub async fn emit_as(&self, data: Value, message_type: &str) -> bool {
        let Some(link) = self.link.as_ref().filter(|l| l.sender.is_connected()) else {
            tracing::warn!(message_type, "Cannot emit data: supervisor channel unavailable");
            return false;
        };
        link.sender
            .send_json(MessageType::from(message_type), &EmitPayload::new(data))
            .await
    }

    /// [`await_inbound`](Self::await_inbound) with [`DEFAULT_AWAIT_TIMEOUT`].
    pub async fn next_inbound(&self) -> Option<Value> {
        self.await_inbound(DEFAULT_AWAIT_TIMEOUT).await
    }

    /// Next inbound `data` payload, waiting at most `timeout`.
    ///
    /// Payloads are delivered one per call in arrival order. A batch drained
    /// from the inbox is held here, so nothing drained is ever lost.
    pub async fn await_inbound(&self, timeout: Duration) -> Option<Value> {
        let Some(link) = self.link.as_ref() else {
            tracing::warn!("Cannot await data: supervisor channel unavailable");
            return None;
        };

        // No representable deadline means wait indefinitely.
        let deadline = tokio::time::Instant::now().checked_add(timeout);
        loop {
            if let Some(value) = link.take_next() {
                return Some(value);
            }
            let nap = match deadline {
                Some(deadline) => {
                    let now = tokio::time::Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    link.poll.min(deadline - now)
                }
                None => link.poll,
            };
            tokio::time::sleep(nap).await;
        }
    }
}

/// Named logger for workload code. Records go to the `tether::workload`
/// target with a `logger` field, through the host's subscriber.
#[derive(Debug, Clone)]
pub struct WorkloadLogger {
    name: Arc<str>,
}

impl Default for WorkloadLogger {
    fn default() -> Self {
        Self::new(DEFAULT_LOGGER_NAME)
    }
}

impl WorkloadLogger {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Arc::from(name.into()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn debug(&self, message: impl fmt::Display) {
        tracing::debug!(target: "tether::workload", logger = %self.name, "{message}");
    }

    pub fn info(&self, message: impl fmt::Display) {
        tracing::info!(target: "tether::workload", logger = %self.name, "{message}");
    }

    pub fn warn(&self, message: impl fmt::Display) {
        tracing::warn!(target: "tether::workload", logger = %self.name, "{message}");
    }

    pub fn error(&self, message: impl fmt::Display) {
        tracing::error!(target: "tether::workload", logger = %self.name, "{message}");
    }
}
