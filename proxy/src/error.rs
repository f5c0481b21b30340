use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unsupported target scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    #[error("Timed out connecting to {0}")]
    ConnectTimeout(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

pub type Result<T> = std::result::Result<T, ProxyError>;
