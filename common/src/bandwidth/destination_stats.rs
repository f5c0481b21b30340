use serde::{Deserialize, Serialize};

/// Traffic counters for one destination host.
///
/// `total_bytes_sent` counts caller → destination bytes and
/// `total_bytes_received` destination → caller bytes. All counters only grow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationStats {
    #[serde(default)]
    pub total_bytes_sent: u64,
    #[serde(default)]
    pub total_bytes_received: u64,
    #[serde(default)]
    pub request_count: u64,
}

impl DestinationStats {
    pub(crate) fn add_request(&mut self) {
        self.request_count = self.request_count.saturating_add(1);
    }

    pub(crate) fn add_bytes(&mut self, sent: u64, received: u64) {
        self.total_bytes_sent = self.total_bytes_sent.saturating_add(sent);
        self.total_bytes_received = self.total_bytes_received.saturating_add(received);
    }
}
