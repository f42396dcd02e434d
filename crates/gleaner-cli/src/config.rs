use clap::{Parser, Subcommand, ValueEnum};
use std::sync::LazyLock;

use gleaner_core::{JobStatus, Phase};

static VERSION_INFO: LazyLock<String> = LazyLock::new(|| {
    let version = env!("CARGO_PKG_VERSION");

    let commit = option_env!("VERGEN_GIT_SHA")
        .map(|s| s.chars().take(7).collect::<String>())
        .unwrap_or_else(|| "unknown".to_string());

    let built = option_env!("VERGEN_BUILD_DATE").unwrap_or("unknown");
    let target = option_env!("VERGEN_CARGO_TARGET_TRIPLE").unwrap_or("unknown");
    let rustc = option_env!("VERGEN_RUSTC_SEMVER").unwrap_or("unknown");

    format!("{version}\ncommit: {commit}\nbuilt: {built}\ntarget: {target}\nrustc: {rustc}")
});

pub fn version_info() -> &'static str {
    &VERSION_INFO
}

/// CLI configuration parsed from command line arguments and environment variables.
///
/// Pipeline tuning (intervals, retry, source URLs, pool sizes) is read from
/// the environment by the core config types.
#[derive(Parser, Debug)]
#[command(name = "gleaner")]
#[command(
    author,
    version = version_info(),
    about = "Scheduled enrichment of users with addresses and credit cards"
)]
#[command(after_help = "Examples:
  gleaner init-db
  gleaner run-once
  gleaner run-once --phase addresses
  gleaner serve --workers 3
  gleaner user 1

Queue backends:
  BROKER_URL unset        - jobs live in the DATABASE_URL database
  BROKER_URL=postgres://… - jobs live in a separate database
  BROKER_URL=memory       - in-process queue (serve only)")]
pub struct Config {
    /// PostgreSQL database connection URL
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Job queue location: a PostgreSQL URL or `memory`
    #[arg(long, env = "BROKER_URL")]
    pub broker_url: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create the database schema
    InitDb,
    /// Run phases inline, without the queue, then print statistics
    #[command(after_help = "Examples:
  gleaner run-once                 # users, then addresses, then credit cards
  gleaner run-once --phase users   # a single phase")]
    RunOnce {
        /// Run only this phase
        #[arg(short, long)]
        phase: Option<PhaseArg>,
    },
    /// Show database statistics and coverage
    Stats,
    /// Show a user with its addresses and credit cards
    User {
        /// External id of the user
        external_id: i64,
    },
    /// List users with related record counts
    Users {
        #[arg(short, long, default_value = "100")]
        limit: i64,
        #[arg(short, long, default_value = "0")]
        offset: i64,
    },
    /// Run the scheduler and a worker pool until interrupted
    Serve {
        /// Number of workers
        #[arg(short, long, env = "WORKERS", default_value = "3")]
        workers: usize,
        /// Seconds to wait for in-flight jobs on shutdown
        #[arg(long, env = "SHUTDOWN_TIMEOUT_SECS", default_value = "30")]
        shutdown_timeout: u64,
    },
    /// Run a worker pool only, processing jobs enqueued elsewhere
    Worker {
        /// Number of workers
        #[arg(short, long, env = "WORKERS", default_value = "3")]
        workers: usize,
        /// Seconds to wait for in-flight jobs on shutdown
        #[arg(long, env = "SHUTDOWN_TIMEOUT_SECS", default_value = "30")]
        shutdown_timeout: u64,
    },
    /// Enqueue a run of one phase
    Enqueue {
        phase: PhaseArg,
    },
    /// List recent jobs
    Jobs {
        /// Only jobs with this status
        #[arg(short, long)]
        status: Option<StatusArg>,
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

/// Phase selector
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum PhaseArg {
    Users,
    Addresses,
    CreditCards,
}

impl From<PhaseArg> for Phase {
    fn from(arg: PhaseArg) -> Self {
        match arg {
            PhaseArg::Users => Phase::Users,
            PhaseArg::Addresses => Phase::Addresses,
            PhaseArg::CreditCards => Phase::CreditCards,
        }
    }
}

/// Job status filter
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StatusArg {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl From<StatusArg> for JobStatus {
    fn from(arg: StatusArg) -> Self {
        match arg {
            StatusArg::Pending => JobStatus::Pending,
            StatusArg::Running => JobStatus::Running,
            StatusArg::Completed => JobStatus::Completed,
            StatusArg::Failed => JobStatus::Failed,
            StatusArg::Cancelled => JobStatus::Cancelled,
        }
    }
}
