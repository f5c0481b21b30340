pub mod api;
pub mod auth;
pub mod cli;
pub mod config;
pub mod destination;
pub mod error;
pub mod forwarder;
pub mod io;
pub mod lifecycle;
pub mod metering;
pub mod server;
pub mod session;
pub mod tunnel;

pub use config::ProxyConfig;
pub use error::{ProxyError, Result};
pub use lifecycle::RunningProxy;
