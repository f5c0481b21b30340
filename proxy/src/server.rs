use crate::error::Result;
use crate::forwarder;
use crate::io::PrefixedIo;
use crate::session::SessionContext;
use crate::tunnel::TunnelSession;
use bytes::BytesMut;
use std::net::SocketAddr;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

const CONNECT_PREFIX: &[u8] = b"CONNECT ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Tunnel,
    Forward,
}

/// Decides whether `buffered` starts a CONNECT request. `None` means more
/// bytes are needed.
pub fn classify(buffered: &[u8]) -> Option<ConnectionKind> {
    let checked = buffered.len().min(CONNECT_PREFIX.len());
    if buffered[..checked] != CONNECT_PREFIX[..checked] {
        return Some(ConnectionKind::Forward);
    }
    if checked == CONNECT_PREFIX.len() {
        Some(ConnectionKind::Tunnel)
    } else {
        None
    }
}

pub struct ProxyServer {
    listener: TcpListener,
    context: SessionContext,
}

impl ProxyServer {
    pub async fn bind(addr: &str, context: SessionContext) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, context })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until `cancel` fires. Every session is spawned on
    /// `sessions` so shutdown can wait for them.
    pub async fn run(self, cancel: CancellationToken, sessions: TaskTracker) {
        if let Ok(addr) = self.listener.local_addr() {
            info!("Proxy server listening on {}", addr);
        }

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            debug!("Accepted connection from {}", addr);
                            let context = self.context.clone();
                            sessions.spawn(async move {
                                if let Err(e) = handle_connection(stream, context).await {
                                    warn!("Session from {} ended with error: {}", addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    info!("Proxy listener stopped accepting connections");
                    break;
                }
            }
        }
    }
}

async fn handle_connection(mut stream: TcpStream, context: SessionContext) -> Result<()> {
    let _ = stream.set_nodelay(true);

    let mut buffered = BytesMut::with_capacity(4096);
    let kind = loop {
        if stream.read_buf(&mut buffered).await? == 0 {
            if buffered.is_empty() {
                debug!("Connection closed before sending anything");
                return Ok(());
            }
            // Let the HTTP parser report whatever partial request arrived.
            break ConnectionKind::Forward;
        }
        if let Some(kind) = classify(&buffered) {
            break kind;
        }
    };

    match kind {
        ConnectionKind::Tunnel => TunnelSession::new(context).run(stream, buffered).await,
        ConnectionKind::Forward => {
            forwarder::serve(PrefixedIo::new(buffered.freeze(), stream), context).await
        }
    }
}
