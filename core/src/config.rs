/// Configuration management
use crate::error::{Result, SyncError};
use crate::session::Session;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

const DEFAULT_API_BASE: &str = "http://127.0.0.1:7401/api";

/// Client configuration
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Realtime gateway address
    pub gateway_addr: SocketAddr,

    /// REST base URL, without trailing slash
    pub api_base_url: String,

    /// Local user id
    pub user_id: String,

    /// Bearer token for REST and channel authentication
    pub token: String,

    /// Messages per history page
    pub page_size: u32,

    /// Wait for a send acknowledgment before marking the message failed
    pub ack_timeout: Duration,

    /// Quiet period after the last keystroke before `typing-stop`
    pub typing_quiet_period: Duration,

    /// Remote typing flag lifetime without a refresh
    pub typing_decay: Duration,

    /// Timestamp tolerance for matching an echo to a pending send by content
    pub reconcile_window: Duration,

    /// Gateway connect timeout
    pub connect_timeout: Duration,

    /// Inbound event buffer per subscriber
    pub event_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gateway_addr: SocketAddr::from(([127, 0, 0, 1], 7400)),
            api_base_url: DEFAULT_API_BASE.to_string(),
            user_id: String::new(),
            token: String::new(),
            page_size: 50,
            ack_timeout: Duration::from_secs(10),
            typing_quiet_period: Duration::from_millis(1200),
            typing_decay: Duration::from_millis(2500),
            reconcile_window: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            event_capacity: 256,
        }
    }
}

/// On-disk form; every field optional, durations in milliseconds
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
struct ConfigFile {
    gateway: Option<String>,
    api_url: Option<String>,
    user_id: Option<String>,
    token: Option<String>,
    page_size: Option<u32>,
    ack_timeout_ms: Option<u64>,
    typing_quiet_ms: Option<u64>,
    typing_decay_ms: Option<u64>,
    reconcile_window_ms: Option<u64>,
    connect_timeout_ms: Option<u64>,
    event_capacity: Option<usize>,
}

impl Config {
    /// Create config from command line arguments
    pub fn from_args(args: &[String]) -> Result<Self> {
        if args.len() < 2 {
            return Err(SyncError::Config(format!(
                "Usage: {} <user-id> [--token <token>] [--gateway <addr>] [--api-url <url>] [--config <file>] [--page-size <n>] [--ack-timeout-ms <ms>]",
                args.first().map(String::as_str).unwrap_or("chatsync")
            )));
        }

        // The file is the base layer wherever --config appears; flags override it
        let file_flag = (2..args.len()).step_by(2).find(|&i| args[i] == "--config");
        let mut config = match file_flag {
            Some(i) => {
                let path = args.get(i + 1).ok_or_else(|| {
                    SyncError::Config("--config requires an argument".to_string())
                })?;
                Self::from_file(Path::new(path))?
            }
            None => Self::default(),
        };

        let mut i = 2;
        while i < args.len() {
            let flag = args[i].as_str();
            let value = || {
                args.get(i + 1)
                    .ok_or_else(|| SyncError::Config(format!("{} requires an argument", flag)))
            };
            match flag {
                // Applied above
                "--config" => {}
                "--token" => config.token = value()?.clone(),
                "--gateway" => config.gateway_addr = parse_addr(value()?)?,
                "--api-url" => config.api_base_url = value()?.trim_end_matches('/').to_string(),
                "--page-size" => config.page_size = parse_num(flag, value()?)?,
                "--ack-timeout-ms" => {
                    config.ack_timeout = Duration::from_millis(parse_num(flag, value()?)?)
                }
                other => {
                    return Err(SyncError::Config(format!("Unknown argument: {}", other)));
                }
            }
            i += 2;
        }
        config.user_id = args[1].clone();

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file; missing fields keep their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(SyncError::Io)?;
        let file: ConfigFile = serde_json::from_str(&raw).map_err(SyncError::Serialization)?;
        let mut config = Self::default();

        if let Some(addr) = file.gateway {
            config.gateway_addr = parse_addr(&addr)?;
        }
        if let Some(url) = file.api_url {
            config.api_base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(user) = file.user_id {
            config.user_id = user;
        }
        if let Some(token) = file.token {
            config.token = token;
        }
        if let Some(n) = file.page_size {
            config.page_size = n;
        }
        let ms = Duration::from_millis;
        config.ack_timeout = file.ack_timeout_ms.map(ms).unwrap_or(config.ack_timeout);
        config.typing_quiet_period = file.typing_quiet_ms.map(ms).unwrap_or(config.typing_quiet_period);
        config.typing_decay = file.typing_decay_ms.map(ms).unwrap_or(config.typing_decay);
        config.reconcile_window = file
            .reconcile_window_ms
            .map(ms)
            .unwrap_or(config.reconcile_window);
        config.connect_timeout = file.connect_timeout_ms.map(ms).unwrap_or(config.connect_timeout);
        if let Some(n) = file.event_capacity {
            config.event_capacity = n;
        }
        Ok(config)
    }

    // Env overrides (nice for scripts)
    fn apply_env(&mut self) {
        if let Ok(token) = std::env::var("CHATSYNC_TOKEN") {
            self.token = token;
        }
        if let Some(addr) = std::env::var("CHATSYNC_GATEWAY")
            .ok()
            .and_then(|s| s.parse::<SocketAddr>().ok())
        {
            self.gateway_addr = addr;
        }
        if let Ok(url) = std::env::var("CHATSYNC_API_URL") {
            self.api_base_url = url.trim_end_matches('/').to_string();
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.user_id.trim().is_empty() {
            return Err(SyncError::Config("user id must not be empty".to_string()));
        }
        if self.page_size == 0 {
            return Err(SyncError::Config("page size must be positive".to_string()));
        }
        if self.ack_timeout.is_zero() || self.typing_decay.is_zero() {
            return Err(SyncError::Config("timeouts must be positive".to_string()));
        }
        if !self.api_base_url.starts_with("http://") {
            return Err(SyncError::Config(format!(
                "API URL must be plain http: {}",
                self.api_base_url
            )));
        }
        Ok(())
    }

    pub fn session(&self) -> Session {
        Session::new(self.user_id.clone(), self.token.clone())
    }
}

fn parse_addr(s: &str) -> Result<SocketAddr> {
    s.parse()
        .map_err(|_| SyncError::Config(format!("Invalid gateway address: {}", s)))
}

fn parse_num<T: std::str::FromStr>(flag: &str, s: &str) -> Result<T> {
    s.parse()
        .map_err(|_| SyncError::Config(format!("{} must be a number, got {}", flag, s)))
}
