use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Address of the metrics/health HTTP API
    #[serde(default = "default_api_listen_addr")]
    pub api_listen_addr: String,

    /// JSON file the bandwidth ledger is persisted to
    #[serde(default = "default_metrics_file")]
    pub metrics_file: PathBuf,

    #[serde(default = "default_username")]
    pub username: String,

    #[serde(default = "default_password")]
    pub password: String,

    /// Realm advertised in the Proxy-Authenticate challenge
    #[serde(default = "default_realm")]
    pub realm: String,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// How long shutdown waits for in-flight sessions before exiting
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,

    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log directory for file-based logging; stdout when unset
    #[serde(default)]
    pub log_dir: Option<String>,

    #[serde(default = "default_log_file")]
    pub log_file: String,

    /// Number of Tokio runtime worker threads (defaults to CPU cores)
    #[serde(default)]
    pub runtime_threads: Option<usize>,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_api_listen_addr() -> String {
    "127.0.0.1:8001".to_string()
}

fn default_metrics_file() -> PathBuf {
    PathBuf::from("bandwidth.json")
}

fn default_username() -> String {
    "abc".to_string()
}

fn default_password() -> String {
    "abc".to_string()
}

fn default_realm() -> String {
    "Proxy Server".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_drain_timeout_secs() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> String {
    "proxy.log".to_string()
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            api_listen_addr: default_api_listen_addr(),
            metrics_file: default_metrics_file(),
            username: default_username(),
            password: default_password(),
            realm: default_realm(),
            connect_timeout_secs: default_connect_timeout_secs(),
            drain_timeout_secs: default_drain_timeout_secs(),
            log_level: default_log_level(),
            log_dir: None,
            log_file: default_log_file(),
            runtime_threads: None,
        }
    }
}

// Hand-written so the password never reaches a log line.
impl std::fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("listen_addr", &self.listen_addr)
            .field("api_listen_addr", &self.api_listen_addr)
            .field("metrics_file", &self.metrics_file)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("realm", &self.realm)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("drain_timeout_secs", &self.drain_timeout_secs)
            .field("log_level", &self.log_level)
            .field("log_dir", &self.log_dir)
            .field("log_file", &self.log_file)
            .field("runtime_threads", &self.runtime_threads)
            .finish()
    }
}

impl ProxyConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: ProxyConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}
