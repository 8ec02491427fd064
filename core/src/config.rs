/// Configuration management
use crate::error::{ChatError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_DOMAIN: &str = "tradepost.local";
const DEFAULT_RESOURCE: &str = "web";
const DEFAULT_API_PORT: u16 = 17082;

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Realtime hub address
    pub hub_addr: SocketAddr,

    /// Local account name (left side of the jid)
    pub username: String,

    /// Account secret
    pub password: String,

    /// Jid domain
    pub domain: String,

    /// Jid resource (one per device)
    pub resource: String,

    /// Messenger API address for UI clients
    pub api_addr: SocketAddr,

    /// TCP connect timeout
    pub connection_timeout: Duration,

    /// Time allowed for the hub to answer the auth request
    pub auth_timeout: Duration,

    /// Idle interval after which a keepalive ping is written
    pub keepalive_interval: Duration,

    /// Automatic reconnect attempts before giving up
    pub max_reconnect_attempts: u32,

    /// First reconnect delay; doubles with every attempt
    pub backoff_base: Duration,

    /// Upper bound for any single durable-store call
    pub store_timeout: Duration,

    /// History page size
    pub page_size: usize,

    /// Coalescing window for outbound typing signals
    pub typing_debounce: Duration,

    /// Lifetime of an inbound typing signal without a follow-up
    pub typing_expiry: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hub_addr: SocketAddr::from(([127, 0, 0, 1], 5222)),
            username: String::new(),
            password: String::new(),
            domain: DEFAULT_DOMAIN.to_string(),
            resource: DEFAULT_RESOURCE.to_string(),
            api_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_API_PORT)),
            connection_timeout: Duration::from_secs(10),
            auth_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(30),
            max_reconnect_attempts: 5,
            backoff_base: Duration::from_millis(1000),
            store_timeout: Duration::from_secs(10),
            page_size: 30,
            typing_debounce: Duration::from_millis(500),
            typing_expiry: Duration::from_secs(3),
        }
    }
}

impl Config {
    /// Create config from command line arguments
    pub fn from_args(args: &[String]) -> Result<Self> {
        if args.len() < 3 {
            return Err(ChatError::Config(format!(
                "Usage: {} <hub_addr> <username> [--password <secret>] [--domain <domain>] [--resource <resource>] [--api-port <port>]",
                args.first().map(String::as_str).unwrap_or("tradepost")
            )));
        }

        let hub_addr = args[1]
            .parse::<SocketAddr>()
            .map_err(|_| ChatError::Config(format!("Invalid hub address: {}", args[1])))?;
        let username = args[2].clone();

        let mut config = Self {
            hub_addr,
            username,
            ..Default::default()
        };
        let mut api_port: Option<u16> = None;

        let mut i = 3;
        while i < args.len() {
            let flag = args[i].as_str();
            let value = || {
                args.get(i + 1)
                    .cloned()
                    .ok_or_else(|| ChatError::Config(format!("{} requires an argument", flag)))
            };
            match flag {
                "--password" => config.password = value()?,
                "--domain" => config.domain = value()?,
                "--resource" => config.resource = value()?,
                "--api-port" => {
                    api_port = Some(value()?.parse::<u16>().map_err(|_| {
                        ChatError::Config("--api-port must be a valid number (0-65535)".to_string())
                    })?);
                }
                other => {
                    return Err(ChatError::Config(format!("Unknown argument: {}", other)));
                }
            }
            i += 2;
        }

        // Env overrides keep secrets out of the process list
        if let Ok(password) = std::env::var("TRADEPOST_PASSWORD") {
            config.password = password;
        }
        if let Some(p) = std::env::var("TRADEPOST_API_PORT")
            .ok()
            .and_then(|s| s.parse::<u16>().ok())
        {
            api_port = Some(p);
        }
        if let Some(port) = api_port {
            config.api_addr = SocketAddr::from(([127, 0, 0, 1], port));
        }

        Ok(config)
    }
}

/// Hub configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Listening address
    pub listen_addr: SocketAddr,

    /// Known accounts (username -> password). `None` accepts any well-formed login.
    pub accounts: Option<HashMap<String, String>>,

    /// Time allowed for a new connection to authenticate
    pub auth_timeout: Duration,

    /// Directory of the shared message database
    pub data_dir: PathBuf,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 5222)),
            accounts: None,
            auth_timeout: Duration::from_secs(5),
            data_dir: PathBuf::from(".tradepost/hub"),
        }
    }
}

impl HubConfig {
    /// Create hub config from command line arguments
    pub fn from_args(args: &[String]) -> Result<Self> {
        if args.len() < 2 {
            return Err(ChatError::Config(format!(
                "Usage: {} <port> [--accounts <path>] [--data-dir <path>]",
                args.first().map(String::as_str).unwrap_or("hub")
            )));
        }

        let port = args[1]
            .parse::<u16>()
            .map_err(|_| ChatError::Config("Port must be a valid number (0-65535)".to_string()))?;

        let mut config = Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], port)),
            ..Default::default()
        };
        let mut accounts_path: Option<PathBuf> = None;
        let mut i = 2;
        while i < args.len() {
            let flag = args[i].as_str();
            let path = args
                .get(i + 1)
                .map(PathBuf::from)
                .ok_or_else(|| ChatError::Config(format!("{} requires a path argument", flag)))?;
            match flag {
                "--accounts" => accounts_path = Some(path),
                "--data-dir" => config.data_dir = path,
                other => {
                    return Err(ChatError::Config(format!("Unknown argument: {}", other)));
                }
            }
            i += 2;
        }

        if let Ok(path) = std::env::var("TRADEPOST_HUB_ACCOUNTS") {
            accounts_path = Some(PathBuf::from(path));
        }
        if let Ok(dir) = std::env::var("TRADEPOST_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }

        config.accounts = accounts_path.as_deref().map(load_accounts).transpose()?;
        Ok(config)
    }
}

/// Load a `{"username": "password"}` accounts file
pub fn load_accounts(path: &Path) -> Result<HashMap<String, String>> {
    let raw = std::fs::read_to_string(path).map_err(ChatError::Io)?;
    let accounts: HashMap<String, String> =
        serde_json::from_str(&raw).map_err(ChatError::Serialization)?;
    Ok(accounts)
}
