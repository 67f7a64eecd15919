use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tether::{BootstrapConfig, LogFormat, LogLevel};

#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(version)]
#[command(about = "Run a workload under resource ceilings, reporting to a supervisor")]
pub struct Cli {
    /// Path to the workload to execute
    #[arg(long, env = "TETHER_SCRIPT")]
    pub script: PathBuf,

    /// Arguments for the workload, as a JSON object
    #[arg(long, default_value = "{}")]
    pub args: String,

    /// Address-space ceiling in MiB
    #[arg(long, default_value_t = 512)]
    pub memory_limit_mb: u64,

    /// CPU share hint, reported but not enforced
    #[arg(long, default_value_t = 80.0)]
    pub cpu_limit_percent: f64,

    /// DEBUG, INFO, WARNING, ERROR or CRITICAL
    #[arg(long, env = "TETHER_LOG_LEVEL", default_value = "INFO")]
    pub log_level: LogLevel,

    /// text, compact or json
    #[arg(long, env = "LOG_FORMAT", default_value = "text")]
    pub log_format: LogFormat,

    /// Directory to change into before running the workload
    #[arg(long)]
    pub working_dir: Option<PathBuf>,

    /// Host of the supervising process
    #[arg(long, default_value = "localhost")]
    pub communication_host: String,

    /// Port of the supervising process; no channel when omitted
    #[arg(long)]
    pub communication_port: Option<u16>,

    /// Seconds to wait for the supervisor connection
    #[arg(long, default_value_t = 5)]
    pub connect_timeout_secs: u64,
}

impl Cli {
    pub fn into_config(self) -> BootstrapConfig {
        let mut config = BootstrapConfig::new(self.script)
            .with_args(self.args)
            .with_memory_limit_mb(self.memory_limit_mb)
            .with_cpu_limit_percent(self.cpu_limit_percent)
            .with_log(self.log_level, self.log_format)
            .with_connect_timeout(Duration::from_secs(self.connect_timeout_secs));
        if let Some(dir) = self.working_dir {
            config = config.with_working_dir(dir);
        }
        if let Some(port) = self.communication_port {
            config = config.with_communication(self.communication_host, port);
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn defaults_apply() {
        let cli = Cli::try_parse_from(["tether", "--script", "/jobs/a.sh"]).unwrap();
        let config = cli.into_config();
        assert_eq!(config.target, PathBuf::from("/jobs/a.sh"));
        assert_eq!(config.args, "{}");
        assert_eq!(config.memory_limit_mb, 512);
        assert_eq!(config.cpu_limit_percent, 80.0);
        assert_eq!(config.communication_port, None);
        assert_eq!(config.channel.connect_timeout, Duration::from_secs(5));
    }

    #[test]
    fn full_flag_set() {
        let cli = Cli::try_parse_from([
            "tether",
            "--script",
            "/jobs/a.sh",
            "--args",
            r#"{"n": 1}"#,
            "--memory-limit-mb",
            "256",
            "--log-level",
            "warning",
            "--log-format",
            "json",
            "--working-dir",
            "/srv",
            "--communication-host",
            "10.0.0.5",
            "--communication-port",
            "7070",
        ])
        .unwrap();
        let config = cli.into_config();
        assert_eq!(config.memory_limit_mb, 256);
        assert_eq!(config.log.level, LogLevel::Warning);
        assert_eq!(config.log.format, LogFormat::Json);
        assert_eq!(config.working_dir, Some(PathBuf::from("/srv")));
        assert_eq!(config.communication_host, "10.0.0.5");
        assert_eq!(config.communication_port, Some(7070));
    }

    #[test]
    fn bad_log_level_is_rejected() {
        let err = Cli::try_parse_from(["tether", "--script", "a", "--log-level", "LOUD"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }
}
