use clap::Parser;

/// Drive a mixed workload through one admission-control manager.
///
/// Background jobs are queued first, then user requests arrive while they
/// are running. The final report shows what each tier got back plus the
/// manager's own statistics.
#[derive(Parser, Debug)]
#[command(name = "throttle-sim", about = "Simulate user and background load on a shared backend")]
pub struct SimArgs {
    /// Path to a TOML config file (env vars `THROTTLE_*` still override it)
    #[arg(long)]
    pub config: Option<String>,

    /// Number of protected user requests
    #[arg(long, default_value = "3")]
    pub users: usize,

    /// Number of throttleable background jobs
    #[arg(long, default_value = "20")]
    pub background: usize,

    /// Simulated backend latency per work item, in milliseconds
    #[arg(long, default_value = "50")]
    pub work_ms: u64,

    /// Timeout budget per request, in milliseconds
    #[arg(long, default_value = "2000")]
    pub timeout_ms: u64,

    /// Pause background work by hand for this many seconds before submitting
    #[arg(long, default_value = "0")]
    pub pause_secs: u64,

    /// Distinct cache keys shared by background jobs (0 disables caching)
    #[arg(long, default_value = "5")]
    pub cache_keys: usize,
}
