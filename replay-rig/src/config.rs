//! Command line configuration and scheduler policy.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::{Error, Result};

/// Hardware-in-the-loop replay job scheduler.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Address the control API listens on
    #[arg(short, long, env = "REPLAY_RIG_ADDRESS", default_value = "[::]:50051")]
    pub address: SocketAddr,

    /// File the job queue is persisted to. Jobs found RUNNING in it on
    /// startup are marked ERROR instead of being resumed. Without it nothing
    /// is persisted.
    #[arg(long, env = "REPLAY_RIG_DATABASE")]
    pub database: Option<PathBuf>,

    /// Log level of the scheduler
    #[arg(short, long, env = "REPLAY_RIG_LOG_LEVEL", default_value = "debug")]
    pub log_level: String,

    /// Log level of diagram engine reports. Can only reduce verbosity
    /// below the scheduler level.
    #[arg(long, env = "REPLAY_RIG_DIAGRAM_LOG_LEVEL", default_value = "warn")]
    pub diagram_log_level: String,

    /// Directory of the daily rolling log files
    #[arg(long, env = "REPLAY_RIG_LOG_DIR", default_value = "logs")]
    pub log_dir: PathBuf,

    /// Seconds between two progress polls of a plugin
    #[arg(short = 'd', long, env = "REPLAY_RIG_STATUS_REQUEST_DELAY", default_value_t = 1.0, value_parser = parse_delay)]
    pub status_request_delay: f64,

    /// Run downloads and uploads of different jobs simultaneously
    #[arg(short = 'P', long, env = "REPLAY_RIG_PARALLELIZE")]
    pub parallelize: bool,

    /// Number of parallel downloads, only used with --parallelize
    #[arg(short = 'D', long, env = "REPLAY_RIG_MAX_DOWNLOADS", default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    pub max_downloads: u32,

    /// Number of parallel uploads, only used with --parallelize
    #[arg(short = 'U', long, env = "REPLAY_RIG_MAX_UPLOADS", default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    pub max_uploads: u32,

    /// Directory backing named shared segments
    #[arg(long, env = "REPLAY_RIG_SHM_DIR")]
    pub shm_dir: Option<PathBuf>,

    /// Directory relative plugin references are resolved against
    #[arg(long, env = "REPLAY_RIG_PLUGIN_DIR")]
    pub plugin_dir: Option<PathBuf>,
}

fn parse_delay(raw: &str) -> std::result::Result<f64, String> {
    let value: f64 = raw.parse().map_err(|e| format!("{e}"))?;
    if !value.is_finite() || value < MIN_POLL_INTERVAL.as_secs_f64() {
        return Err("the delay must be greater or equal than 0.1".to_string());
    }
    Ok(value)
}

/// Shortest allowed progress poll interval.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Concurrency policy of the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub parallelize: bool,
    pub max_downloads: usize,
    pub max_uploads: usize,
    /// Time between two progress polls.
    pub poll_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            parallelize: false,
            max_downloads: 1,
            max_uploads: 1,
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl SchedulerConfig {
    pub fn from_args(args: &Args) -> Self {
        Self {
            parallelize: args.parallelize,
            max_downloads: args.max_downloads as usize,
            max_uploads: args.max_uploads as usize,
            poll_interval: Duration::from_secs_f64(args.status_request_delay),
        }
    }

    pub fn parallel(max_downloads: usize, max_uploads: usize) -> Self {
        Self {
            parallelize: true,
            max_downloads,
            max_uploads,
            ..Default::default()
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_downloads == 0 {
            return Err(Error::config("max_downloads must be at least 1"));
        }
        if self.max_uploads == 0 {
            return Err(Error::config("max_uploads must be at least 1"));
        }
        if self.poll_interval < MIN_POLL_INTERVAL {
            return Err(Error::config(format!(
                "poll interval must be at least {:?}",
                MIN_POLL_INTERVAL
            )));
        }
        Ok(())
    }

    /// Gate widths implied by the policy.
    pub fn gate_widths(&self) -> GateWidths {
        if self.parallelize {
            GateWidths {
                overall: self.max_downloads + self.max_uploads + 1,
                download: self.max_downloads,
                upload: self.max_uploads,
            }
        } else {
            GateWidths {
                overall: 1,
                download: 1,
                upload: 1,
            }
        }
    }
}

/// Widths of the counting gates. The replay gate is always exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateWidths {
    pub overall: usize,
    pub download: usize,
    pub upload: usize,
}

impl GateWidths {
    /// Whether only one job runs at a time.
    pub fn is_serial(&self) -> bool {
        self.overall == 1
    }
}
