use crate::provider::DEFAULT_BASE_URL;
use clap::Parser;
use std::{path::PathBuf, time::Duration};

#[derive(Parser, Debug)]
#[command(name = "agora-hub", about = "Group chat hub with scheduled AI personas")]
pub struct Args {
    #[arg(long, env = "AGORA_ADDR", default_value = "0.0.0.0:8000")]
    pub addr: String,
    #[arg(long, env = "AGORA_DB_PATH", default_value = "chat.db")]
    pub db_path: PathBuf,
    #[arg(long, env = "AGORA_UPLOAD_DIR", default_value = "uploads")]
    pub upload_dir: PathBuf,
    /// TOML roster with `[[agents]]` tables; the built-in personas otherwise.
    #[arg(long)]
    pub agents: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    pub no_agents: bool,
    #[arg(long, env = "OPENROUTER_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,
    #[arg(long, default_value = DEFAULT_BASE_URL)]
    pub base_url: String,
    #[arg(long, default_value_t = 60)]
    pub provider_timeout: u64,
    #[arg(long, default_value_t = 60)]
    pub error_cooldown: u64,
    #[arg(long, default_value_t = 10)]
    pub shutdown_grace: u64,
    #[arg(long, default_value_t = 2)]
    pub write_timeout: u64,
    #[arg(long, default_value_t = 256)]
    pub queue_capacity: usize,
    /// Replay this many recent messages to each newly connected participant.
    #[arg(long, default_value_t = 0)]
    pub history_on_join: usize,
    #[arg(long, default_value_t = false)]
    pub announce_joins: bool,
    #[arg(long)]
    pub seed: Option<u64>,
    #[arg(long, default_value_t = false)]
    pub debug: bool,
    #[arg(long, env = "AGORA_LOG_DIR")]
    pub log_dir: Option<PathBuf>,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub addr: String,
    pub db_path: PathBuf,
    pub upload_dir: PathBuf,
    pub agents_path: Option<PathBuf>,
    pub agents_enabled: bool,
    pub api_key: Option<String>,
    pub base_url: String,
    pub provider_timeout: Duration,
    pub error_cooldown: Duration,
    pub shutdown_grace: Duration,
    pub write_timeout: Duration,
    pub queue_capacity: usize,
    pub history_on_join: usize,
    pub announce_joins: bool,
    pub seed: Option<u64>,
    pub debug: bool,
    pub log_dir: Option<PathBuf>,
}

impl Config {
    pub fn from_args(args: Args) -> Self {
        let api_key = args
            .api_key
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty());
        Self {
            addr: args.addr,
            db_path: args.db_path,
            upload_dir: args.upload_dir,
            agents_path: args.agents,
            agents_enabled: !args.no_agents,
            api_key,
            base_url: args.base_url,
            provider_timeout: Duration::from_secs(args.provider_timeout),
            error_cooldown: Duration::from_secs(args.error_cooldown),
            shutdown_grace: Duration::from_secs(args.shutdown_grace),
            write_timeout: Duration::from_secs(args.write_timeout),
            queue_capacity: args.queue_capacity.max(1),
            history_on_join: args.history_on_join,
            announce_joins: args.announce_joins,
            seed: args.seed,
            debug: args.debug || env_true("AGORA_DEBUG"),
            log_dir: args.log_dir,
        }
    }
}

pub fn load_config() -> Config {
    Config::from_args(Args::parse())
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}
