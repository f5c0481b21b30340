use crate::config::ProxyConfig;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "proxy")]
#[command(about = "Metering HTTP/CONNECT forward proxy", long_about = None)]
pub struct CliArgs {
    /// Path to configuration file (built-in defaults when omitted)
    #[arg(short, long, env = "PROXY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Override proxy listen address
    #[arg(short, long, env = "PROXY_LISTEN_ADDR")]
    pub listen_addr: Option<String>,

    /// Override metrics API listen address
    #[arg(long, env = "PROXY_API_ADDR")]
    pub api_addr: Option<String>,

    /// Override bandwidth ledger file
    #[arg(short, long, env = "PROXY_METRICS_FILE")]
    pub metrics_file: Option<PathBuf>,

    /// Override proxy username
    #[arg(short, long, env = "PROXY_USERNAME")]
    pub username: Option<String>,

    /// Override proxy password
    #[arg(short, long, env = "PROXY_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Override log directory
    #[arg(long)]
    pub log_dir: Option<String>,

    /// Override number of runtime worker threads
    #[arg(long)]
    pub runtime_threads: Option<usize>,
}

impl CliArgs {
    pub fn apply(self, config: &mut ProxyConfig) {
        if let Some(listen_addr) = self.listen_addr {
            config.listen_addr = listen_addr;
        }
        if let Some(api_addr) = self.api_addr {
            config.api_listen_addr = api_addr;
        }
        if let Some(metrics_file) = self.metrics_file {
            config.metrics_file = metrics_file;
        }
        if let Some(username) = self.username {
            config.username = username;
        }
        if let Some(password) = self.password {
            config.password = password;
        }
        if let Some(log_level) = self.log_level {
            config.log_level = log_level;
        }
        if let Some(log_dir) = self.log_dir {
            config.log_dir = Some(log_dir);
        }
        if let Some(threads) = self.runtime_threads {
            config.runtime_threads = Some(threads);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_replace_file_values() {
        let args = CliArgs::try_parse_from([
            "proxy",
            "--listen-addr",
            "127.0.0.1:9000",
            "--username",
            "carol",
            "--metrics-file",
            "/tmp/ledger.json",
        ])
        .unwrap();

        let mut config = ProxyConfig::default();
        args.apply(&mut config);

        assert_eq!(config.listen_addr, "127.0.0.1:9000");
        assert_eq!(config.username, "carol");
        assert_eq!(config.metrics_file, PathBuf::from("/tmp/ledger.json"));
        assert_eq!(config.password, "abc");
    }

    #[test]
    fn absent_flags_keep_config() {
        let args = CliArgs::try_parse_from(["proxy"]).unwrap();
        let mut config = ProxyConfig::default();
        args.apply(&mut config);
        assert_eq!(config.listen_addr, ProxyConfig::default().listen_addr);
    }
}
