use crate::error::Result;
use axum::{Json, Router, extract::State, response::IntoResponse, routing::get};
use common::{BandwidthLedger, LedgerSnapshot};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: i64,
}

/// Read-only view of the ledger: `/metrics` returns the same JSON object
/// that is persisted to disk.
pub fn router(ledger: Arc<BandwidthLedger>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(get_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(ledger)
}

pub struct ApiServer {
    listener: TcpListener,
    ledger: Arc<BandwidthLedger>,
}

impl ApiServer {
    pub async fn bind(addr: &str, ledger: Arc<BandwidthLedger>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, ledger })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    #[instrument(skip_all)]
    pub async fn run(self, cancel: CancellationToken) {
        if let Ok(addr) = self.listener.local_addr() {
            info!("Starting API server on {}", addr);
        }
        let app = router(self.ledger);
        if let Err(e) = axum::serve(self.listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
        {
            error!("API server error: {}", e);
        }
    }
}

async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: common::current_timestamp(),
    })
}

async fn get_metrics(State(ledger): State<Arc<BandwidthLedger>>) -> Json<LedgerSnapshot> {
    Json(ledger.snapshot())
}
