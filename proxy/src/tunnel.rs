use crate::destination::Destination;
use crate::error::{ProxyError, Result};
use crate::metering::{Direction, Meter, MeteredChunks};
use crate::session::SessionContext;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, instrument, warn};

const HTTPS_DEFAULT_PORT: u16 = 443;
const MAX_HEAD_BYTES: usize = 32 * 1024;
const MAX_HEADERS: usize = 64;

pub const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
pub const INTERNAL_SERVER_ERROR: &[u8] = b"HTTP/1.1 500 Internal Server Error\r\n\r\n";
pub const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    AwaitingAuth,
    Connecting,
    Tunneling,
    Closed,
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AwaitingAuth => write!(f, "awaiting_auth"),
            Self::Connecting => write!(f, "connecting"),
            Self::Tunneling => write!(f, "tunneling"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// The parts of a CONNECT request head the relay needs, plus whatever the
/// client pipelined after it.
#[derive(Debug)]
pub struct ConnectHead {
    pub target: String,
    pub proxy_authorization: Option<Vec<u8>>,
    pub early_data: Bytes,
}

/// Reads until a full request head is buffered. `buffered` may already hold
/// a prefix of it.
pub async fn read_connect_head<S>(stream: &mut S, mut buffered: BytesMut) -> Result<ConnectHead>
where
    S: AsyncRead + Unpin,
{
    loop {
        let parsed = {
            let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut request = httparse::Request::new(&mut headers);
            match request.parse(&buffered) {
                Ok(httparse::Status::Complete(head_len)) => {
                    if request.method != Some("CONNECT") {
                        return Err(ProxyError::InvalidRequest(format!(
                            "expected CONNECT, got {:?}",
                            request.method
                        )));
                    }
                    let target = request
                        .path
                        .ok_or_else(|| ProxyError::InvalidRequest("CONNECT without target".to_string()))?
                        .to_string();
                    let proxy_authorization = request
                        .headers
                        .iter()
                        .find(|h| h.name.eq_ignore_ascii_case("proxy-authorization"))
                        .map(|h| h.value.to_vec());
                    Some((head_len, target, proxy_authorization))
                }
                Ok(httparse::Status::Partial) => None,
                Err(e) => {
                    return Err(ProxyError::InvalidRequest(format!("malformed CONNECT head: {}", e)));
                }
            }
        };

        if let Some((head_len, target, proxy_authorization)) = parsed {
            let early_data = buffered.split_off(head_len).freeze();
            return Ok(ConnectHead {
                target,
                proxy_authorization,
                early_data,
            });
        }

        if buffered.len() >= MAX_HEAD_BYTES {
            return Err(ProxyError::InvalidRequest(format!(
                "CONNECT head exceeds {} bytes",
                MAX_HEAD_BYTES
            )));
        }
        if stream.read_buf(&mut buffered).await? == 0 {
            return Err(ProxyError::InvalidRequest(
                "connection closed before CONNECT head completed".to_string(),
            ));
        }
    }
}

/// One CONNECT tunnel from handshake to teardown.
pub struct TunnelSession {
    context: SessionContext,
    state: TunnelState,
}

impl TunnelSession {
    pub fn new(context: SessionContext) -> Self {
        Self {
            context,
            state: TunnelState::AwaitingAuth,
        }
    }

    /// Runs the session to completion. The ledger is persisted exactly once
    /// when the session reaches `Closed`, whichever state it left from.
    #[instrument(skip_all)]
    pub async fn run<S>(mut self, mut caller: S, buffered: BytesMut) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let outcome = self.drive(&mut caller, buffered).await;
        self.transition(TunnelState::Closed);
        self.context.ledger.flush().await;
        outcome
    }

    async fn drive<S>(&mut self, caller: &mut S, buffered: BytesMut) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let head = match read_connect_head(caller, buffered).await {
            Ok(head) => head,
            Err(e) => {
                reply(caller, BAD_REQUEST).await;
                return Err(e);
            }
        };

        if !self
            .context
            .gate
            .authorize(head.proxy_authorization.as_deref())
        {
            debug!("CONNECT to {} rejected: bad or missing credentials", head.target);
            reply(caller, &self.proxy_auth_required()).await;
            return Ok(());
        }

        self.transition(TunnelState::Connecting);
        let destination = match Destination::parse_authority(&head.target, HTTPS_DEFAULT_PORT) {
            Ok(destination) => destination,
            Err(e) => {
                reply(caller, BAD_REQUEST).await;
                return Err(e);
            }
        };
        info!("Establishing HTTPS tunnel to: {}", destination);

        // Attempts count even when the connect below fails.
        self.context.ledger.record_request(destination.ledger_key());

        let upstream = match destination.connect(self.context.connect_timeout).await {
            Ok(upstream) => upstream,
            Err(e) => {
                warn!("Error in HTTPS tunnel to {}: {}", destination, e);
                reply(caller, INTERNAL_SERVER_ERROR).await;
                return Err(e);
            }
        };

        caller.write_all(CONNECTION_ESTABLISHED).await?;
        self.transition(TunnelState::Tunneling);
        info!("HTTPS tunnel established: {}", destination);

        self.relay(caller, upstream, head.early_data, &destination)
            .await
    }

    async fn relay<S>(
        &self,
        caller: &mut S,
        upstream: TcpStream,
        early_data: Bytes,
        destination: &Destination,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let ledger = &self.context.ledger;
        let sent = Meter::new(ledger.clone(), destination.ledger_key(), Direction::Sent);
        let received = Meter::new(ledger.clone(), destination.ledger_key(), Direction::Received);

        let (upstream_read, mut upstream_write) = upstream.into_split();
        if !early_data.is_empty() {
            sent.record(early_data.len());
            upstream_write.write_all(&early_data).await?;
        }

        let (caller_read, caller_write) = tokio::io::split(caller);
        let upload = pump(MeteredChunks::new(caller_read, sent), upstream_write);
        let download = pump(MeteredChunks::new(upstream_read, received), caller_write);

        // Either side finishing ends the session; the other half is dropped
        // with it, closing both sockets.
        let (side, result) = tokio::select! {
            result = upload => ("caller", result),
            result = download => ("destination", result),
        };
        match result {
            Ok(()) => debug!("Tunnel to {} closed by {}", destination, side),
            Err(e) => debug!("Tunnel to {} aborted on {} side: {}", destination, side, e),
        }
        Ok(())
    }

    fn proxy_auth_required(&self) -> Vec<u8> {
        let mut response = b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: ".to_vec();
        response.extend_from_slice(self.context.gate.challenge().as_bytes());
        response.extend_from_slice(b"\r\n\r\n");
        response
    }

    fn transition(&mut self, next: TunnelState) {
        debug!("Tunnel state {} -> {}", self.state, next);
        self.state = next;
    }
}

async fn pump<R, W>(mut chunks: MeteredChunks<R>, mut writer: W) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    while let Some(chunk) = chunks.next().await {
        writer.write_all(&chunk?).await?;
    }
    Ok(())
}

/// Writes a final status line and closes the write side. The caller may
/// already be gone, so failures only get logged.
async fn reply<S>(caller: &mut S, status: &[u8])
where
    S: AsyncWrite + Unpin,
{
    if let Err(e) = caller.write_all(status).await {
        debug!("Failed to write tunnel status line: {}", e);
        return;
    }
    let _ = caller.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{BasicCredential, CredentialGate};
    use common::{BandwidthLedger, LedgerStore};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn context(dir: &tempfile::TempDir) -> SessionContext {
        let ledger = Arc::new(BandwidthLedger::new(LedgerStore::new(
            dir.path().join("bandwidth.json"),
        )));
        let gate =
            CredentialGate::new(Arc::new(BasicCredential::new("abc", "abc")), "Proxy Server").unwrap();
        SessionContext::new(ledger, gate, Duration::from_secs(5))
    }

    async fn read_head_from(bytes: &'static [u8]) -> Result<ConnectHead> {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(bytes).await.unwrap();
        drop(client);
        read_connect_head(&mut server, BytesMut::new()).await
    }

    #[tokio::test]
    async fn parses_target_and_credentials() {
        let head = read_head_from(
            b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\nProxy-Authorization: Basic YWJjOmFiYw==\r\n\r\n",
        )
        .await
        .unwrap();
        assert_eq!(head.target, "example.com:443");
        assert_eq!(head.proxy_authorization.as_deref(), Some(&b"Basic YWJjOmFiYw=="[..]));
        assert!(head.early_data.is_empty());
    }

    #[tokio::test]
    async fn keeps_pipelined_bytes() {
        let head = read_head_from(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n\x16\x03\x01hello")
            .await
            .unwrap();
        assert!(head.proxy_authorization.is_none());
        assert_eq!(&head.early_data[..], b"\x16\x03\x01hello");
    }

    #[tokio::test]
    async fn head_split_across_reads_is_reassembled() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let reader = tokio::spawn(async move { read_connect_head(&mut server, BytesMut::from(&b"CONN"[..])).await });

        client.write_all(b"ECT a.example:8443 HTTP/1.1\r\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.write_all(b"\r\n").await.unwrap();

        let head = reader.await.unwrap().unwrap();
        assert_eq!(head.target, "a.example:8443");
    }

    #[tokio::test]
    async fn truncated_head_is_invalid() {
        let err = read_head_from(b"CONNECT example.com:443 HTTP/1.1\r\nHost: exa")
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn non_connect_method_is_invalid() {
        let err = read_head_from(b"GET / HTTP/1.1\r\n\r\n").await.unwrap_err();
        assert!(matches!(err, ProxyError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn missing_credentials_get_raw_407_and_no_count() {
        let dir = tempfile::tempdir().unwrap();
        let context = context(&dir);
        let ledger = context.ledger.clone();

        let (mut client, server) = tokio::io::duplex(1024);
        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
            .await
            .unwrap();

        TunnelSession::new(context)
            .run(server, BytesMut::new())
            .await
            .unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert_eq!(
            response,
            b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"Proxy Server\"\r\n\r\n"
        );
        assert!(ledger.snapshot().is_empty());
        assert!(dir.path().join("bandwidth.json").exists());
    }

    #[tokio::test]
    async fn failed_connect_replies_500_and_counts_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let context = context(&dir);
        let ledger = context.ledger.clone();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (mut client, server) = tokio::io::duplex(1024);
        let request = format!(
            "CONNECT 127.0.0.1:{} HTTP/1.1\r\nProxy-Authorization: Basic YWJjOmFiYw==\r\n\r\n",
            port
        );
        client.write_all(request.as_bytes()).await.unwrap();

        let result = TunnelSession::new(context).run(server, BytesMut::new()).await;
        assert!(matches!(result, Err(ProxyError::UpstreamUnreachable(_))));

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, INTERNAL_SERVER_ERROR);
        assert_eq!(ledger.stats("127.0.0.1").unwrap().request_count, 1);
    }

    #[tokio::test]
    async fn relays_and_meters_both_directions() {
        let dir = tempfile::tempdir().unwrap();
        let context = context(&dir);
        let ledger = context.ledger.clone();

        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = origin.local_addr().unwrap().port();
        let origin_task = tokio::spawn(async move {
            let (mut socket, _) = origin.accept().await.unwrap();
            let mut request = [0u8; 1000];
            socket.read_exact(&mut request).await.unwrap();
            socket.write_all(&[2u8; 2000]).await.unwrap();
            let mut rest = Vec::new();
            let _ = socket.read_to_end(&mut rest).await;
        });

        let (mut client, server) = tokio::io::duplex(8192);
        let session = tokio::spawn(async move {
            TunnelSession::new(context).run(server, BytesMut::new()).await
        });

        let request = format!(
            "CONNECT 127.0.0.1:{} HTTP/1.1\r\nProxy-Authorization: Basic YWJjOmFiYw==\r\n\r\n",
            port
        );
        client.write_all(request.as_bytes()).await.unwrap();

        let mut established = vec![0u8; CONNECTION_ESTABLISHED.len()];
        client.read_exact(&mut established).await.unwrap();
        assert_eq!(established, CONNECTION_ESTABLISHED);

        client.write_all(&[1u8; 1000]).await.unwrap();
        let mut response = vec![0u8; 2000];
        client.read_exact(&mut response).await.unwrap();
        drop(client);

        session.await.unwrap().unwrap();
        origin_task.await.unwrap();

        let stats = ledger.stats("127.0.0.1").unwrap();
        assert_eq!(stats.request_count, 1);
        assert_eq!(stats.total_bytes_sent, 1000);
        assert_eq!(stats.total_bytes_received, 2000);
    }
}
