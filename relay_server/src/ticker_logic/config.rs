use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ticker_logic::upstream::{ReconnectPolicy, DEFAULT_RECONNECT_DELAY};

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_UPSTREAM_URL: &str = "wss://stream.binance.com:9443/ws/ethusdt@ticker";
pub const DEFAULT_CONFIG_FILE: &str = "server_ticker.conf";

/// One configuration layer. Every field is optional so that defaults, the
/// config file and the command line/environment can be merged in order.
#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Ticker WebSocket relay server", version)]
#[serde(rename_all = "camelCase")]
pub struct ConfigArgs {
    #[clap(long, env = "PORT", help = "Port to listen on for HTTP and WebSocket clients.")]
    pub port: Option<u16>,

    #[clap(long, env = "RELAY_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "RELAY_UPSTREAM_URL", help = "Upstream ticker WebSocket URL.")]
    pub upstream_url: Option<String>,

    #[clap(long, env = "RELAY_RECONNECT_DELAY_MS", help = "Fixed delay in milliseconds before each upstream reconnect.")]
    pub reconnect_delay_ms: Option<u64>,

    #[clap(long, env = "RELAY_RECONNECT_MAX_ATTEMPTS", help = "Stop after this many upstream connection attempts (unbounded if unset).")]
    pub reconnect_max_attempts: Option<u32>,

    #[clap(long, env = "RELAY_STATIC_DIR", help = "Directory served at the root path.")]
    pub static_dir: Option<PathBuf>,

    #[clap(long, env = "RELAY_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "RELAY_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,
}

impl ConfigArgs {
    fn defaults() -> Self {
        ConfigArgs {
            port: Some(DEFAULT_PORT),
            upstream_url: Some(DEFAULT_UPSTREAM_URL.to_string()),
            reconnect_delay_ms: Some(DEFAULT_RECONNECT_DELAY.as_millis() as u64),
            static_dir: Some(PathBuf::from("public")),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            ..Default::default()
        }
    }

    // 'other' overrides 'self' wherever it has a value
    fn merge(self, other: ConfigArgs) -> ConfigArgs {
        ConfigArgs {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            upstream_url: other.upstream_url.or(self.upstream_url),
            reconnect_delay_ms: other.reconnect_delay_ms.or(self.reconnect_delay_ms),
            reconnect_max_attempts: other.reconnect_max_attempts.or(self.reconnect_max_attempts),
            static_dir: other.static_dir.or(self.static_dir),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
        }
    }
}

/// Fully resolved settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub port: u16,
    pub upstream_url: String,
    pub reconnect: ReconnectPolicy,
    pub static_dir: PathBuf,
    pub log_dir: PathBuf,
    pub log_level: String,
}

impl From<ConfigArgs> for Config {
    fn from(args: ConfigArgs) -> Self {
        let reconnect_delay = args
            .reconnect_delay_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_RECONNECT_DELAY);

        Config {
            port: args.port.unwrap_or(DEFAULT_PORT),
            upstream_url: args
                .upstream_url
                .unwrap_or_else(|| DEFAULT_UPSTREAM_URL.to_string()),
            reconnect: ReconnectPolicy {
                delay: reconnect_delay,
                max_attempts: args.reconnect_max_attempts,
            },
            static_dir: args.static_dir.unwrap_or_else(|| PathBuf::from("public")),
            log_dir: args.log_dir.unwrap_or_else(|| PathBuf::from("./logs")),
            log_level: args.log_level.unwrap_or_else(|| "info".to_string()),
        }
    }
}

/// What became of the config file. Resolved before the logger exists, so it
/// is handed back to be logged once logging is set up.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigFileNote {
    Loaded(PathBuf),
    Missing(PathBuf),
    Ignored { path: PathBuf, reason: String },
}

impl ConfigFileNote {
    pub fn log(&self) {
        match self {
            ConfigFileNote::Loaded(path) => {
                log::info!("Loaded config file {}", path.display());
            }
            ConfigFileNote::Missing(path) => log::info!(
                "Config file not found at {}. Using defaults and environment/CLI variables.",
                path.display()
            ),
            ConfigFileNote::Ignored { path, reason } => {
                log::warn!("Bad config file {}: {}. Ignoring it.", path.display(), reason);
            }
        }
    }
}

fn read_config_file(path: &Path) -> (Option<ConfigArgs>, ConfigFileNote) {
    if !path.exists() {
        return (None, ConfigFileNote::Missing(path.to_path_buf()));
    }

    let ignored = |reason: String| ConfigFileNote::Ignored {
        path: path.to_path_buf(),
        reason,
    };

    let config_str = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => return (None, ignored(format!("read failed: {}", e))),
    };

    match serde_json::from_str::<ConfigArgs>(&config_str) {
        Ok(file_config) => (Some(file_config), ConfigFileNote::Loaded(path.to_path_buf())),
        Err(e) => (None, ignored(format!("parse failed: {}", e))),
    }
}

/// Layers defaults, then the config file, then `cli` (which already holds any
/// environment variables).
pub fn resolve(cli: ConfigArgs) -> (Config, ConfigFileNote) {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut current = ConfigArgs::defaults();
    let (file_config, note) = read_config_file(&config_file_path);
    if let Some(file_config) = file_config {
        current = current.merge(file_config);
    }
    (current.merge(cli).into(), note)
}

pub fn load_config() -> (Config, ConfigFileNote) {
    resolve(ConfigArgs::parse())
}
