use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "tollgatectl", version)]
#[command(about = "Inspect and operate Tollgate task queues and rate limiters")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Path to tollgate.toml (defaults to ./tollgate.toml or ./config/tollgate.toml)
    #[arg(long, global = true, env = "TOLLGATE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Path to a .env file to load before resolving configuration
    #[arg(long, global = true)]
    pub env_file: Option<PathBuf>,

    /// Queue to operate on (overrides config)
    #[arg(short, long, global = true)]
    pub queue: Option<String>,

    /// Emit JSON instead of text
    #[arg(long, global = true, default_value_t = false)]
    pub json: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Show pending, processing and failed counts for the queue
    Stats,
    /// List tasks waiting to be claimed, highest priority first
    Pending {
        /// Maximum number of tasks to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// List permanently failed tasks, most recent first
    Failed {
        /// Maximum number of tasks to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Add a task to the queue
    Enqueue(EnqueueArgs),
    /// Reclaim tasks whose lease has expired
    Reap {
        /// Keep reaping on an interval until interrupted
        #[arg(long, default_value_t = false)]
        watch: bool,

        /// Interval between passes with --watch (overrides config), e.g. 30s
        #[arg(long, value_parser = humantime::parse_duration)]
        interval: Option<Duration>,
    },
    /// List workers with a live heartbeat on the queue
    Workers,
    /// Inspect or reset rate limiters
    #[command(subcommand)]
    Limit(LimitCommand),
    /// Inspect resolved configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Args, Debug, Clone)]
pub struct EnqueueArgs {
    /// Task type, e.g. send_email
    pub task_type: String,

    /// Priority; higher runs first
    #[arg(short, long, default_value_t = 0, allow_negative_numbers = true)]
    pub priority: i64,

    /// Attempts before the task is failed permanently (defaults to the queue's)
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// JSON object merged into the payload
    #[arg(long)]
    pub data: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum LimitCommand {
    /// List configured limiters
    List,
    /// Show remaining requests and reset time without recording a request
    Status {
        /// Limiter name, e.g. api_auth
        limiter: String,
        /// Caller identifier, e.g. a user id or IP
        identifier: String,
    },
    /// Clear one identifier's window
    Reset { limiter: String, identifier: String },
    /// Clear every window of a limiter
    ResetAll { limiter: String },
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the resolved configuration as TOML
    Show,
    /// Validate configuration and report warnings
    Check,
}
