//! tether: run a workload under resource ceilings while reporting to a
//! supervising process over a framed TCP channel.

pub mod bridge;
pub mod channel;
pub mod inbox;
pub mod limits;
mod receiver;
pub mod router;
pub mod sandbox;
pub mod supervisor;
pub mod telemetry;
pub mod workload;

pub use bridge::protocol::{Message, MessageType};
pub use channel::{Channel, ChannelConfig, ChannelSender, ChannelState};
pub use limits::{ResourceLimiter, ResourceLimits, RlimitBackend};
pub use sandbox::{ExecutionContext, ExecutionOutcome, WorkloadLogger};
pub use supervisor::{BootstrapConfig, BootstrapError, ERROR_LINE_PREFIX, STATUS_LINE_PREFIX, Supervisor};
pub use telemetry::{LogConfig, LogFormat, LogLevel, init_tracing};
pub use workload::{ProcessLoader, Workload, WorkloadError, WorkloadLoader, workload_fn};
