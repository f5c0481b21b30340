use crate::api::ApiServer;
use crate::auth::{BasicCredential, CredentialGate};
use crate::config::ProxyConfig;
use crate::server::ProxyServer;
use crate::session::SessionContext;
use anyhow::{Context, Result};
use common::{BandwidthLedger, LedgerSnapshot, LedgerStore};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

pub const SUMMARY_HEADER: &str = "=== Proxy Final Metrics Summary ===";
pub const SHUTDOWN_COMPLETE: &str = "Metrics saved. Proxy shutting down.";

/// SIGINT and SIGTERM, registered up front so a signal arriving during
/// startup is not lost.
pub struct SignalListener {
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl SignalListener {
    #[cfg(unix)]
    pub fn register() -> std::io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    #[cfg(not(unix))]
    pub fn register() -> std::io::Result<Self> {
        Ok(Self {})
    }

    /// Waits for the next signal and returns its name.
    #[cfg(unix)]
    pub async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
        }
    }

    #[cfg(not(unix))]
    pub async fn recv(&mut self) -> &'static str {
        match tokio::signal::ctrl_c().await {
            Ok(()) => "Ctrl-C",
            Err(e) => {
                warn!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending().await
            }
        }
    }
}

/// Owns the shutdown sequence: stop accepting, drain, summarize, persist.
pub struct LifecycleController {
    ledger: Arc<BandwidthLedger>,
    cancel: CancellationToken,
    sessions: TaskTracker,
    drain_timeout: Duration,
    finalized: AtomicBool,
}

impl LifecycleController {
    pub fn new(ledger: Arc<BandwidthLedger>, drain_timeout: Duration) -> Self {
        Self {
            ledger,
            cancel: CancellationToken::new(),
            sessions: TaskTracker::new(),
            drain_timeout,
            finalized: AtomicBool::new(false),
        }
    }

    pub fn ledger(&self) -> &Arc<BandwidthLedger> {
        &self.ledger
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn sessions(&self) -> TaskTracker {
        self.sessions.clone()
    }

    /// Runs the shutdown sequence once; later calls return `false` without
    /// doing anything. `interrupt` resolving cuts the drain short.
    pub async fn shutdown<F>(&self, interrupt: F) -> bool
    where
        F: Future<Output = ()>,
    {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return false;
        }

        self.cancel.cancel();
        self.sessions.close();

        let in_flight = self.sessions.len();
        if in_flight > 0 {
            info!("Waiting up to {:?} for {} in-flight sessions", self.drain_timeout, in_flight);
            tokio::select! {
                _ = self.sessions.wait() => {}
                _ = tokio::time::sleep(self.drain_timeout) => {
                    warn!("Drain timed out with {} sessions still open", self.sessions.len());
                }
                _ = interrupt => {
                    info!("Second signal received, skipping drain");
                }
            }
        }

        for line in summary_lines(&self.ledger.snapshot()) {
            warn!("{}", line);
        }
        self.ledger.flush().await;
        warn!("{}", SHUTDOWN_COMPLETE);
        true
    }
}

pub fn summary_lines(snapshot: &LedgerSnapshot) -> Vec<String> {
    std::iter::once(SUMMARY_HEADER.to_string())
        .chain(snapshot.iter().map(|(host, stats)| {
            format!(
                "{}: {} requests, Sent: {} bytes, Received: {} bytes",
                host, stats.request_count, stats.total_bytes_sent, stats.total_bytes_received
            )
        }))
        .collect()
}

/// A started proxy: both listeners bound and their accept loops spawned.
pub struct RunningProxy {
    proxy_addr: SocketAddr,
    api_addr: SocketAddr,
    controller: LifecycleController,
    servers: Vec<JoinHandle<()>>,
}

impl RunningProxy {
    /// Loads the ledger and binds both listeners. Either bind failing aborts
    /// startup.
    pub async fn start(config: &ProxyConfig) -> Result<Self> {
        let ledger = Arc::new(BandwidthLedger::load(LedgerStore::new(&config.metrics_file)).await);
        let verifier = Arc::new(BasicCredential::new(&config.username, &config.password));
        let gate = CredentialGate::new(verifier, &config.realm)?;
        let context = SessionContext::new(ledger.clone(), gate, config.connect_timeout());
        let controller = LifecycleController::new(ledger.clone(), config.drain_timeout());

        let proxy_server = ProxyServer::bind(&config.listen_addr, context)
            .await
            .with_context(|| format!("Failed to bind proxy listener on {}", config.listen_addr))?;
        let api_server = ApiServer::bind(&config.api_listen_addr, ledger)
            .await
            .with_context(|| format!("Failed to bind API listener on {}", config.api_listen_addr))?;
        let proxy_addr = proxy_server.local_addr()?;
        let api_addr = api_server.local_addr()?;

        let servers = vec![
            tokio::spawn(proxy_server.run(controller.cancel_token(), controller.sessions())),
            tokio::spawn(api_server.run(controller.cancel_token())),
        ];

        info!("Proxy started: proxy on {}, API on {}", proxy_addr, api_addr);
        Ok(Self {
            proxy_addr,
            api_addr,
            controller,
            servers,
        })
    }

    pub fn proxy_addr(&self) -> SocketAddr {
        self.proxy_addr
    }

    pub fn api_addr(&self) -> SocketAddr {
        self.api_addr
    }

    pub fn ledger(&self) -> &Arc<BandwidthLedger> {
        self.controller.ledger()
    }

    pub async fn shutdown<F>(self, interrupt: F)
    where
        F: Future<Output = ()>,
    {
        self.controller.shutdown(interrupt).await;
        for server in self.servers {
            let _ = server.await;
        }
    }
}

/// Runs the proxy until SIGINT or SIGTERM, then shuts down gracefully.
pub async fn run(config: ProxyConfig) -> Result<()> {
    let mut signals = SignalListener::register().context("Failed to register signal handlers")?;
    let running = RunningProxy::start(&config).await?;

    let signal = signals.recv().await;
    info!("Received {}, shutting down", signal);

    running
        .shutdown(async {
            let signal = signals.recv().await;
            info!("Received {} during shutdown", signal);
        })
        .await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(dir: &tempfile::TempDir, drain: Duration) -> LifecycleController {
        let ledger = Arc::new(BandwidthLedger::new(LedgerStore::new(
            dir.path().join("bandwidth.json"),
        )));
        LifecycleController::new(ledger, drain)
    }

    #[test]
    fn summary_lists_every_destination() {
        let mut snapshot = LedgerSnapshot::new();
        snapshot.insert(
            "example.com".to_string(),
            common::DestinationStats {
                total_bytes_sent: 1000,
                total_bytes_received: 2000,
                request_count: 3,
            },
        );
        snapshot.insert("a.test".to_string(), common::DestinationStats::default());

        assert_eq!(
            summary_lines(&snapshot),
            vec![
                SUMMARY_HEADER.to_string(),
                "a.test: 0 requests, Sent: 0 bytes, Received: 0 bytes".to_string(),
                "example.com: 3 requests, Sent: 1000 bytes, Received: 2000 bytes".to_string(),
            ]
        );
    }

    #[test]
    fn summary_of_empty_ledger_is_header_only() {
        assert_eq!(summary_lines(&LedgerSnapshot::new()), vec![SUMMARY_HEADER.to_string()]);
    }

    #[tokio::test]
    async fn shutdown_persists_once() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller(&dir, Duration::from_secs(1));
        controller.ledger().record_request("example.com");

        assert!(controller.shutdown(std::future::pending()).await);
        assert!(controller.cancel_token().is_cancelled());
        let saved = LedgerStore::new(dir.path().join("bandwidth.json")).load().await.unwrap();
        assert_eq!(saved["example.com"].request_count, 1);

        assert!(!controller.shutdown(std::future::pending()).await);
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn summary_is_logged_under_warn_level() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let _default = tracing::subscriber::set_default(subscriber);

        let dir = tempfile::tempdir().unwrap();
        let controller = controller(&dir, Duration::from_secs(1));
        controller.ledger().record_request("example.com");
        controller.shutdown(std::future::pending()).await;

        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains(SUMMARY_HEADER));
        assert!(output.contains("example.com: 1 requests, Sent: 0 bytes, Received: 0 bytes"));
        assert!(output.contains(SHUTDOWN_COMPLETE));
    }

    #[tokio::test]
    async fn drain_waits_for_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller(&dir, Duration::from_secs(5));
        let ledger = controller.ledger().clone();
        controller.sessions().spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            ledger.record_bytes("late.example", 5, 0);
        });

        controller.shutdown(std::future::pending()).await;

        let saved = LedgerStore::new(dir.path().join("bandwidth.json")).load().await.unwrap();
        assert_eq!(saved["late.example"].total_bytes_sent, 5);
    }

    #[tokio::test]
    async fn second_signal_skips_drain() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller(&dir, Duration::from_secs(60));
        controller.sessions().spawn(std::future::pending::<()>());

        let started = std::time::Instant::now();
        controller.shutdown(async {}).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(dir.path().join("bandwidth.json").exists());
    }

    #[tokio::test]
    async fn bind_failure_aborts_startup() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let dir = tempfile::tempdir().unwrap();
        let config = ProxyConfig {
            listen_addr: occupied.local_addr().unwrap().to_string(),
            api_listen_addr: "127.0.0.1:0".to_string(),
            metrics_file: dir.path().join("bandwidth.json"),
            ..ProxyConfig::default()
        };

        let err = RunningProxy::start(&config).await.err().unwrap();
        assert!(err.to_string().contains("Failed to bind proxy listener"));
    }
}
