use super::LedgerSnapshot;
use crate::error::Result;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// JSON file holding the whole ledger as one object keyed by destination.
///
/// Saves go to a sibling `.tmp` file which is synced and renamed over the
/// target, so a reader never observes a half-written table. Concurrent
/// saves share the `.tmp` path; callers must serialize them, as
/// `BandwidthLedger::flush` does.
pub struct LedgerStore {
    path: PathBuf,
}

impl LedgerStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<LedgerSnapshot> {
        let content = fs::read(&self.path).await?;
        let snapshot: LedgerSnapshot = serde_json::from_slice(&content)?;
        Ok(snapshot)
    }

    pub async fn save(&self, snapshot: &LedgerSnapshot) -> Result<()> {
        let content = serde_json::to_vec_pretty(snapshot)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let tmp_path = self.tmp_path();
        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(&content).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp_path, &self.path).await?;

        debug!(
            "Ledger saved to {} ({} destinations, {} bytes)",
            self.path.display(),
            snapshot.len(),
            content.len()
        );
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut tmp: OsString = self.path.as_os_str().to_owned();
        tmp.push(".tmp");
        PathBuf::from(tmp)
    }
}
