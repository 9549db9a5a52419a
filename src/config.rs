//! Environment-variable driven startup configuration.

use clap::Parser;

fn default_workspaces_file() -> String {
    "./data/workspaces.json".to_string()
}

#[derive(Parser, Debug, Clone)]
#[command(name = "compute-orchestrator")]
#[command(about = "Central orchestrator for a fleet of compute nodes", long_about = None)]
pub struct Config {
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    #[arg(long, env = "WS_PATH", default_value = "/ws/node")]
    pub ws_path: String,

    #[arg(long, env = "ADMIN_KEY", default_value = "")]
    pub admin_key: String,

    #[arg(long, env = "JWT_SECRET", default_value = "dev-secret-change-me")]
    pub jwt_secret: String,

    #[arg(long, env = "TOKEN_TTL_SECONDS", default_value_t = 86_400)]
    pub token_ttl_seconds: u64,

    #[arg(long, env = "PLATFORM_FEE_BPS", default_value_t = 500)]
    pub platform_fee_bps: u32,

    #[arg(long, env = "WORKSPACES_FILE", default_value_t = default_workspaces_file())]
    pub workspaces_file: String,

    #[arg(long, env = "NODE_HEARTBEAT_TIMEOUT_SECONDS", default_value_t = 30)]
    pub node_heartbeat_timeout_seconds: u64,

    #[arg(long, env = "DISPATCH_TICK_MS", default_value_t = 1_000)]
    pub dispatch_tick_ms: u64,

    #[arg(long, env = "EVICTION_TICK_SECONDS", default_value_t = 30)]
    pub eviction_tick_seconds: u64,

    #[arg(long, env = "GC_TICK_SECONDS", default_value_t = 3_600)]
    pub gc_tick_seconds: u64,

    #[arg(long, env = "JOB_RETENTION_HOURS", default_value_t = 24)]
    pub job_retention_hours: u64,

    #[arg(long, env = "MAX_PENDING_JOBS")]
    pub max_pending_jobs: Option<usize>,
}

impl Config {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        Config::parse()
    }
}
