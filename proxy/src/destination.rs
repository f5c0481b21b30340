use crate::error::{ProxyError, Result};
use hyper::http::uri::Authority;
use std::fmt;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Host and port a session talks to.
///
/// Traffic is attributed to the bare host name: `example.com:443` and
/// `example.com:8443` share one ledger entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    host: String,
    port: u16,
}

impl Destination {
    pub fn new<H: Into<String>>(host: H, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn from_authority(authority: &Authority, default_port: u16) -> Result<Self> {
        let host = authority
            .host()
            .trim_start_matches('[')
            .trim_end_matches(']');
        if host.is_empty() {
            return Err(ProxyError::InvalidRequest(format!(
                "authority without host: {}",
                authority
            )));
        }
        // Host names compare case-insensitively; one destination, one ledger key.
        Ok(Self::new(
            host.to_ascii_lowercase(),
            authority.port_u16().unwrap_or(default_port),
        ))
    }

    pub fn parse_authority(target: &str, default_port: u16) -> Result<Self> {
        let authority: Authority = target
            .parse()
            .map_err(|e| ProxyError::InvalidRequest(format!("bad authority {:?}: {}", target, e)))?;
        Self::from_authority(&authority, default_port)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn ledger_key(&self) -> &str {
        &self.host
    }

    /// Value for an upstream `Host` header; the port is omitted when it is
    /// the scheme default.
    pub fn host_header(&self, default_port: u16) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port == default_port {
            host
        } else {
            format!("{}:{}", host, self.port)
        }
    }

    pub async fn connect(&self, timeout: Duration) -> Result<TcpStream> {
        debug!("Connecting to {}", self);
        match tokio::time::timeout(timeout, TcpStream::connect((self.host.as_str(), self.port)))
            .await
        {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                Ok(stream)
            }
            Ok(Err(e)) => Err(ProxyError::UpstreamUnreachable(format!("{}: {}", self, e))),
            Err(_) => Err(ProxyError::ConnectTimeout(self.to_string())),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}
