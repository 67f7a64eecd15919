//! Bootstrap orchestration.
//!
//! Startup order:
//! 1. Apply resource ceilings (never fatal)
//! 2. Validate the target and parse arguments
//! 3. Change working directory, if asked
//! 4. Connect the supervisor channel, if a port was given (never fatal)
//! 5. Print the `BOOTSTRAP_STATUS:` record on stdout
//! 6. Run the workload in the sandbox
//!
//! The channel is closed on every path out, and every path ends in an exit
//! code: the workload's own code, 1 for a fault, 1 for a bootstrap error.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::channel::{Channel, ChannelConfig};
use crate::inbox::Inbox;
use crate::limits::{ResourceLimiter, ResourceLimits};
use crate::router::Router;
use crate::sandbox::{DEFAULT_AWAIT_POLL, ExecutionOutcome, Sandbox};
use crate::telemetry::{LogConfig, LogFormat, LogLevel};
use crate::workload::{ProcessLoader, WorkloadLoader};

pub const STATUS_LINE_PREFIX: &str = "BOOTSTRAP_STATUS: ";
pub const ERROR_LINE_PREFIX: &str = "BOOTSTRAP_ERROR: ";

pub const DEFAULT_MEMORY_LIMIT_MB: u64 = 512;
pub const DEFAULT_CPU_LIMIT_PERCENT: f64 = 80.0;
pub const DEFAULT_COMMUNICATION_HOST: &str = "localhost";

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("target script not found: {}", .0.display())]
    TargetNotFound(PathBuf),

    #[error("target script is not a file: {}", .0.display())]
    TargetNotAFile(PathBuf),

    #[error("target script is not readable: {}: {source}", .path.display())]
    TargetUnreadable { path: PathBuf, source: io::Error },

    #[error("invalid JSON in arguments: {0}")]
    InvalidArgs(#[source] serde_json::Error),

    #[error("arguments must be a JSON object, got {0}")]
    ArgsNotAnObject(&'static str),

    #[error("cannot change working directory to {}: {source}", .path.display())]
    WorkingDir { path: PathBuf, source: io::Error },

    #[error("failed to write startup status: {0}")]
    StatusReport(#[source] io::Error),
}

/// Everything the supervisor needs to know before it starts.
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    pub target: PathBuf,
    /// Raw JSON text; must decode to an object.
    pub args: String,
    pub memory_limit_mb: u64,
    pub cpu_limit_percent: f64,
    pub log: LogConfig,
    pub working_dir: Option<PathBuf>,
    pub communication_host: String,
    pub communication_port: Option<u16>,
    pub channel: ChannelConfig,
    pub await_poll: Duration,
}

impl BootstrapConfig {
    pub fn new(target: impl Into<PathBuf>) -> Self {
        Self {
            target: target.into(),
            args: "{}".to_string(),
            memory_limit_mb: DEFAULT_MEMORY_LIMIT_MB,
            cpu_limit_percent: DEFAULT_CPU_LIMIT_PERCENT,
            log: LogConfig {
                level: LogLevel::default(),
                format: LogFormat::default(),
            },
            working_dir: None,
            communication_host: DEFAULT_COMMUNICATION_HOST.to_string(),
            communication_port: None,
            channel: ChannelConfig::default(),
            await_poll: DEFAULT_AWAIT_POLL,
        }
    }

    pub fn with_args(mut self, args: impl Into<String>) -> Self {
        self.args = args.into();
        self
    }

    pub fn with_memory_limit_mb(mut self, mb: u64) -> Self {
        self.memory_limit_mb = mb;
        self
    }

    pub fn with_cpu_limit_percent(mut self, percent: f64) -> Self {
        self.cpu_limit_percent = percent;
        self
    }

    pub fn with_log(mut self, level: LogLevel, format: LogFormat) -> Self {
        self.log = LogConfig { level, format };
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_communication(mut self, host: impl Into<String>, port: u16) -> Self {
        self.communication_host = host.into();
        self.communication_port = Some(port);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.channel.connect_timeout = timeout;
        self
    }

    pub fn with_channel_config(mut self, channel: ChannelConfig) -> Self {
        self.channel = channel;
        self
    }

    pub fn with_await_poll(mut self, poll: Duration) -> Self {
        self.await_poll = poll;
        self
    }
}

#[derive(Serialize)]
struct StartupRecord<'a> {
    status: &'static str,
    pid: u32,
    resource_limits: &'a ResourceLimits,
    log_config: LogConfig,
    target_script: String,
    working_directory: String,
}

pub struct Supervisor {
    config: BootstrapConfig,
    limiter: ResourceLimiter,
    loader: Arc<dyn WorkloadLoader>,
    status_out: Box<dyn Write + Send>,
}

impl Supervisor {
    pub fn new(config: BootstrapConfig) -> Self {
        Self {
            config,
            limiter: ResourceLimiter::host(),
            loader: Arc::new(ProcessLoader),
            status_out: Box::new(io::stdout()),
        }
    }

    pub fn with_limiter(mut self, limiter: ResourceLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_loader(mut self, loader: Arc<dyn WorkloadLoader>) -> Self {
        self.loader = loader;
        self
    }

    /// Where the `BOOTSTRAP_STATUS:` line goes (stdout by default).
    pub fn with_status_writer(mut self, out: Box<dyn Write + Send>) -> Self {
        self.status_out = out;
        self
    }

    /// Run to completion and return the process exit code.
    pub async fn run(mut self) -> i32 {
        let mut channel = Channel::with_config(self.config.channel.clone());
        let result = self.execute(&mut channel).await;
        channel.close().await;

        match result {
            Ok(outcome) => {
                let code = outcome.exit_code();
                if code == 0 {
                    tracing::info!("Workload finished successfully");
                } else {
                    tracing::error!(exit_code = code, "Workload finished with non-zero exit code");
                }
                code
            }
            Err(e) => {
                tracing::error!(error = %e, "Bootstrap failed");
                1
            }
        }
    }

    async fn execute(&mut self, channel: &mut Channel) -> Result<ExecutionOutcome, BootstrapError> {
        tracing::info!(pid = std::process::id(), "Bootstrap starting");

        let limits = Arc::new(
            self.limiter
                .apply(self.config.memory_limit_mb, self.config.cpu_limit_percent),
        );
        for warning in &limits.warnings {
            tracing::warn!(warning = %warning, "Resource limit not applied");
        }

        let target = validate_target(&self.config.target)?;
        let args = parse_args(&self.config.args)?;

        if let Some(dir) = &self.config.working_dir {
            std::env::set_current_dir(dir).map_err(|source| BootstrapError::WorkingDir {
                path: dir.clone(),
                source,
            })?;
            tracing::info!(working_dir = %dir.display(), "Changed working directory");
        }

        let inbox = Arc::new(Inbox::new());
        match self.config.communication_port {
            Some(port) => {
                let router = Router::new(channel.sender(), Arc::clone(&inbox), Arc::clone(&limits));
                if !channel
                    .connect(&self.config.communication_host, port, router)
                    .await
                {
                    tracing::warn!("Continuing without supervisor channel");
                }
            }
            None => tracing::info!("No communication port given, running without supervisor channel"),
        }

        self.report_startup(&limits, &target)?;

        let sandbox = Sandbox::new(channel.sender(), inbox).with_await_poll(self.config.await_poll);
        let ctx = sandbox.build_context(args, &target);
        Ok(sandbox.run(&target, self.loader.as_ref(), ctx).await)
    }

    fn report_startup(&mut self, limits: &ResourceLimits, target: &Path) -> Result<(), BootstrapError> {
        let working_directory = std::env::current_dir()
            .map(|d| d.display().to_string())
            .unwrap_or_default();
        let record = StartupRecord {
            status: "initialized",
            pid: std::process::id(),
            resource_limits: limits,
            log_config: self.config.log,
            target_script: target.display().to_string(),
            working_directory,
        };

        let json = serde_json::to_string(&record)
            .map_err(|e| BootstrapError::StatusReport(io::Error::other(e)))?;
        writeln!(self.status_out, "{STATUS_LINE_PREFIX}{json}")
            .and_then(|()| self.status_out.flush())
            .map_err(BootstrapError::StatusReport)
    }
}

/// Check the target exists, is a regular file and can be opened; return its
/// canonical path.
pub fn validate_target(path: &Path) -> Result<PathBuf, BootstrapError> {
    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(BootstrapError::TargetNotFound(path.to_path_buf()));
        }
        Err(source) => {
            return Err(BootstrapError::TargetUnreadable {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    if !metadata.is_file() {
        return Err(BootstrapError::TargetNotAFile(path.to_path_buf()));
    }
    std::fs::File::open(path).map_err(|source| BootstrapError::TargetUnreadable {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(path.canonicalize().unwrap_or_else(|_| path.to_path_buf()))
}

/// Decode the argument text; anything other than a JSON object is rejected.
pub fn parse_args(raw: &str) -> Result<Map<String, Value>, BootstrapError> {
    match serde_json::from_str(raw).map_err(BootstrapError::InvalidArgs)? {
        Value::Object(map) => Ok(map),
        Value::Array(_) => Err(BootstrapError::ArgsNotAnObject("an array")),
        Value::String(_) => Err(BootstrapError::ArgsNotAnObject("a string")),
        Value::Number(_) => Err(BootstrapError::ArgsNotAnObject("a number")),
        Value::Bool(_) => Err(BootstrapError::ArgsNotAnObject("a boolean")),
        Value::Null => Err(BootstrapError::ArgsNotAnObject("null")),
    }
}
