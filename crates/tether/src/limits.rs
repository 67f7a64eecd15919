//! Resource ceilings for the running process.
//!
//! Applies soft limits for address space, CPU time and open file
//! descriptors, never above the host's current hard ceiling. Every failure
//! degrades to a warning; [`ResourceLimiter::apply`] always returns the
//! best-effort [`ResourceLimits`] it managed to apply.

use std::fmt;
use std::io;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// CPU time ceiling in seconds. The percentage hint is advisory only.
pub const CPU_TIME_LIMIT_SECS: u64 = 3600;

/// Default open file descriptor cap, clamped to the hard ceiling.
pub const DEFAULT_FD_LIMIT: u64 = 1024;

const BYTES_PER_MB: u64 = 1024 * 1024;

/// The resources this runtime constrains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitKind {
    AddressSpace,
    CpuTime,
    OpenFiles,
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::AddressSpace => "address space",
            Self::CpuTime => "cpu time",
            Self::OpenFiles => "open files",
        })
    }
}

/// A soft/hard pair. `None` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawLimit {
    pub soft: Option<u64>,
    pub hard: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum LimitError {
    #[error("failed to read {kind} limit: {source}")]
    Read { kind: LimitKind, source: io::Error },

    #[error("failed to set {kind} limit to {value}: {source}")]
    Write {
        kind: LimitKind,
        value: u64,
        source: io::Error,
    },

    #[error("{kind} limit of {requested} exceeds hard ceiling {hard}")]
    AboveHardCeiling {
        kind: LimitKind,
        requested: u64,
        hard: u64,
    },
}

/// Seam over getrlimit/setrlimit so the policy can be exercised without
/// touching the real process limits.
pub trait RlimitBackend: Send + Sync {
    fn get(&self, kind: LimitKind) -> io::Result<RawLimit>;
    fn set(&self, kind: LimitKind, soft: u64, hard: Option<u64>) -> io::Result<()>;
}

/// Backend that talks to the host kernel.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostRlimits;

#[cfg(unix)]
impl HostRlimits {
    fn resource(kind: LimitKind) -> nix::sys::resource::Resource {
        use nix::sys::resource::Resource;
        match kind {
            LimitKind::AddressSpace => Resource::RLIMIT_AS,
            LimitKind::CpuTime => Resource::RLIMIT_CPU,
            LimitKind::OpenFiles => Resource::RLIMIT_NOFILE,
        }
    }

    fn from_rlim(value: nix::libc::rlim_t) -> Option<u64> {
        if value == nix::sys::resource::RLIM_INFINITY {
            None
        } else {
            Some(value as u64)
        }
    }
}

#[cfg(unix)]
impl RlimitBackend for HostRlimits {
    fn get(&self, kind: LimitKind) -> io::Result<RawLimit> {
        let (soft, hard) = nix::sys::resource::getrlimit(Self::resource(kind))
            .map_err(io::Error::from)?;
        Ok(RawLimit {
            soft: Self::from_rlim(soft),
            hard: Self::from_rlim(hard),
        })
    }

    fn set(&self, kind: LimitKind, soft: u64, hard: Option<u64>) -> io::Result<()> {
        let hard = hard
            .map(|h| h as nix::libc::rlim_t)
            .unwrap_or(nix::sys::resource::RLIM_INFINITY);
        nix::sys::resource::setrlimit(Self::resource(kind), soft as nix::libc::rlim_t, hard)
            .map_err(io::Error::from)
    }
}

#[cfg(not(unix))]
impl RlimitBackend for HostRlimits {
    fn get(&self, _kind: LimitKind) -> io::Result<RawLimit> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "resource limits are not supported on this platform",
        ))
    }

    fn set(&self, _kind: LimitKind, _soft: u64, _hard: Option<u64>) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "resource limits are not supported on this platform",
        ))
    }
}

/// Limits actually in force after [`ResourceLimiter::apply`]. `None` = not applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectiveLimits {
    pub memory_bytes: Option<u64>,
    pub cpu_seconds: Option<u64>,
    pub fd_limit: Option<u64>,
}

/// Requested ceilings plus what was really applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_mb: u64,
    pub memory_bytes: u64,
    /// Reported only; there is no per-process CPU share primitive behind it.
    pub cpu_percent: f64,
    pub cpu_time_limit: u64,
    pub fd_limit: u64,
    pub effective: EffectiveLimits,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl ResourceLimits {
    /// Requested values with nothing applied yet.
    pub fn requested(memory_mb: u64, cpu_percent: f64) -> Self {
        Self {
            memory_mb,
            memory_bytes: memory_mb.saturating_mul(BYTES_PER_MB),
            cpu_percent,
            cpu_time_limit: CPU_TIME_LIMIT_SECS,
            fd_limit: DEFAULT_FD_LIMIT,
            effective: EffectiveLimits::default(),
            warnings: Vec::new(),
        }
    }
}

pub struct ResourceLimiter {
    backend: Arc<dyn RlimitBackend>,
}

impl Default for ResourceLimiter {
    fn default() -> Self {
        Self::host()
    }
}

impl ResourceLimiter {
    pub fn new(backend: Arc<dyn RlimitBackend>) -> Self {
        Self { backend }
    }

    pub fn host() -> Self {
        Self::new(Arc::new(HostRlimits))
    }

    /// Apply memory, CPU time and fd ceilings. Never fails.
    pub fn apply(&self, memory_mb: u64, cpu_percent: f64) -> ResourceLimits {
        let mut limits = ResourceLimits::requested(memory_mb, cpu_percent);

        match self.set_soft_limit(LimitKind::AddressSpace, limits.memory_bytes) {
            Ok(applied) => {
                tracing::info!(memory_mb, "Memory limit set");
                limits.effective.memory_bytes = Some(applied);
            }
            Err(e) => Self::record(&mut limits, e),
        }

        match self.set_soft_limit(LimitKind::CpuTime, CPU_TIME_LIMIT_SECS) {
            Ok(applied) => {
                tracing::info!(cpu_time_limit = applied, cpu_percent, "CPU time limit set");
                limits.effective.cpu_seconds = Some(applied);
            }
            Err(e) => Self::record(&mut limits, e),
        }

        match self.clamp_fd_limit() {
            Ok(applied) => {
                tracing::info!(fd_limit = applied, "File descriptor limit set");
                limits.effective.fd_limit = Some(applied);
            }
            Err(e) => Self::record(&mut limits, e),
        }

        tracing::debug!(warnings = limits.warnings.len(), "Resource limits configured");
        limits
    }

    /// Set `requested` as the soft limit if the hard ceiling allows it.
    fn set_soft_limit(&self, kind: LimitKind, requested: u64) -> Result<u64, LimitError> {
        let current = self
            .backend
            .get(kind)
            .map_err(|source| LimitError::Read { kind, source })?;

        if let Some(hard) = current.hard
            && requested > hard
        {
            return Err(LimitError::AboveHardCeiling {
                kind,
                requested,
                hard,
            });
        }

        self.backend
            .set(kind, requested, current.hard)
            .map_err(|source| LimitError::Write {
                kind,
                value: requested,
                source,
            })?;
        Ok(requested)
    }

    fn clamp_fd_limit(&self) -> Result<u64, LimitError> {
        let kind = LimitKind::OpenFiles;
        let current = self
            .backend
            .get(kind)
            .map_err(|source| LimitError::Read { kind, source })?;

        let fd_limit = current
            .hard
            .map_or(DEFAULT_FD_LIMIT, |hard| DEFAULT_FD_LIMIT.min(hard));

        self.backend
            .set(kind, fd_limit, current.hard)
            .map_err(|source| LimitError::Write {
                kind,
                value: fd_limit,
                source,
            })?;
        Ok(fd_limit)
    }

    fn record(limits: &mut ResourceLimits, error: LimitError) {
        tracing::warn!(error = %error, "Skipping resource limit");
        limits.warnings.push(error.to_string());
    }
}
