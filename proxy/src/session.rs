use crate::auth::CredentialGate;
use common::BandwidthLedger;
use std::sync::Arc;
use std::time::Duration;

/// Everything a single client connection needs, shared by all of them.
#[derive(Clone)]
pub struct SessionContext {
    pub ledger: Arc<BandwidthLedger>,
    pub gate: CredentialGate,
    pub connect_timeout: Duration,
}

impl SessionContext {
    pub fn new(ledger: Arc<BandwidthLedger>, gate: CredentialGate, connect_timeout: Duration) -> Self {
        Self {
            ledger,
            gate,
            connect_timeout,
        }
    }
}
