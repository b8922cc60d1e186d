//! JSON snapshots of the whole auction house.
//!
//! A snapshot holds every auction (with its bid history), the flat bid
//! table and every pending claim. Files are named
//! `auctions-backup-YYYYMMDD-HHMMSS.json` so they sort by creation time.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::BACKUP_FORMAT_VERSION;
use crate::storage::{queries, AuctionFilter, Database, RestoreCounts};
use crate::store::AuctionStore;
use crate::types::{Auction, Bid, Claim};

const FILE_PREFIX: &str = "auctions-backup-";
const FILE_SUFFIX: &str = ".json";

/// On-disk snapshot format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupSnapshot {
    pub timestamp: DateTime<Utc>,
    pub version: u32,
    pub auctions: Vec<Auction>,
    pub bids: Vec<Bid>,
    pub claims: Vec<Claim>,
}

pub struct BackupService {
    db: Database,
    store: Arc<AuctionStore>,
    dir: PathBuf,
    keep: usize,
}

impl BackupService {
    pub fn new(store: Arc<AuctionStore>, dir: impl Into<PathBuf>, keep: usize) -> Self {
        Self {
            db: store.database().clone(),
            store,
            dir: dir.into(),
            keep: keep.max(1),
        }
    }

    /// Read a consistent snapshot of all tables.
    pub async fn snapshot(&self) -> Result<BackupSnapshot> {
        let (auctions, bids, claims) = self
            .db
            .call(|conn| {
                let tx = conn.transaction()?;
                let auctions = queries::select_auctions(&tx, &AuctionFilter::default())?;
                let bids = queries::select_all_bids(&tx)?;
                let claims = queries::select_all_claims(&tx)?;
                tx.commit()?;
                Ok((auctions, bids, claims))
            })
            .await
            .context("Failed to read snapshot")?;

        Ok(BackupSnapshot {
            timestamp: Utc::now(),
            version: BACKUP_FORMAT_VERSION,
            auctions,
            bids,
            claims,
        })
    }

    /// Write a new snapshot file and return its path.
    pub async fn create_backup(&self) -> Result<PathBuf> {
        let snapshot = self.snapshot().await?;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create backup dir {}", self.dir.display()))?;

        let path = self.next_path(snapshot.timestamp).await;
        let data = serde_json::to_string_pretty(&snapshot).context("Failed to serialize snapshot")?;

        // Write then rename so a crash never leaves a truncated snapshot behind
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to move snapshot into {}", path.display()))?;

        info!(
            "[BACKUP] Wrote {} ({} auctions, {} bids, {} claims)",
            path.display(),
            snapshot.auctions.len(),
            snapshot.bids.len(),
            snapshot.claims.len()
        );
        Ok(path)
    }

    /// Snapshot files, newest first.
    pub async fn list_backups(&self) -> Result<Vec<PathBuf>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("Failed to list {}", self.dir.display())),
        };

        let mut found = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(FILE_PREFIX) || !name.ends_with(FILE_SUFFIX) {
                continue;
            }
            let modified = entry
                .metadata()
                .await
                .and_then(|m| m.modified())
                .with_context(|| format!("Failed to stat {}", name))?;
            found.push((modified, entry.path()));
        }

        found.sort_by(|a, b| b.cmp(a));
        Ok(found.into_iter().map(|(_, path)| path).collect())
    }

    /// Delete all but the newest `keep` snapshots. Returns how many were removed.
    pub async fn rotate(&self) -> Result<usize> {
        let backups = self.list_backups().await?;
        let mut removed = 0;
        for path in backups.iter().skip(self.keep) {
            match tokio::fs::remove_file(path).await {
                Ok(()) => removed += 1,
                Err(e) => warn!("[BACKUP] Failed to delete old backup {}: {}", path.display(), e),
            }
        }
        if removed > 0 {
            info!("[BACKUP] Rotated out {} old backups (keeping {})", removed, self.keep);
        }
        Ok(removed)
    }

    /// Snapshot then rotate.
    pub async fn run_once(&self) -> Result<PathBuf> {
        let path = self.create_backup().await?;
        self.rotate().await?;
        Ok(path)
    }

    /// Upsert every auction (bids come from each auction's history) and every
    /// claim from a snapshot file, then rebuild the cache.
    pub async fn restore(&self, path: impl AsRef<Path>) -> Result<RestoreCounts> {
        let path = path.as_ref();
        let data = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let snapshot: BackupSnapshot = serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        if snapshot.version > BACKUP_FORMAT_VERSION {
            bail!(
                "Backup {} has format version {}, newest supported is {}",
                path.display(),
                snapshot.version,
                BACKUP_FORMAT_VERSION
            );
        }

        let counts = self
            .db
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut counts = RestoreCounts::default();
                for auction in &snapshot.auctions {
                    counts.bids += queries::upsert_auction(&tx, auction)?;
                    counts.auctions += 1;
                }
                for claim in &snapshot.claims {
                    queries::upsert_claim(&tx, claim)?;
                    counts.claims += 1;
                }
                tx.commit()?;
                Ok(counts)
            })
            .await
            .with_context(|| format!("Failed to restore {}", path.display()))?;

        self.store.reload_cache().await.context("Failed to reload cache after restore")?;
        info!(
            "[BACKUP] Restored {} auctions, {} new bids, {} claims from {}",
            counts.auctions,
            counts.bids,
            counts.claims,
            path.display()
        );
        Ok(counts)
    }

    /// File name for a snapshot taken at `at`, suffixed if that second is taken.
    async fn next_path(&self, at: DateTime<Utc>) -> PathBuf {
        let stem = format!("{}{}", FILE_PREFIX, at.format("%Y%m%d-%H%M%S"));
        let mut path = self.dir.join(format!("{}{}", stem, FILE_SUFFIX));
        let mut n = 1;
        while tokio::fs::try_exists(&path).await.unwrap_or(false) {
            path = self.dir.join(format!("{}-{}{}", stem, n, FILE_SUFFIX));
            n += 1;
        }
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ClaimReason, ItemPayload, Listing, Participant};
    use std::time::Duration;
    use uuid::Uuid;

    fn listing(seller: &Participant) -> Listing {
        Listing {
            seller: seller.clone(),
            item: ItemPayload::new("trident"),
            category: "weapons".to_string(),
            start_price: 10,
            buy_now_price: Some(90),
            duration: Duration::from_secs(600),
        }
    }

    #[tokio::test]
    async fn test_backup_file_naming_and_contents() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(AuctionStore::new(Database::open_in_memory().unwrap()));
        let seller = Participant::new(Uuid::new_v4(), "s");
        store.create(Auction::open(listing(&seller), Utc::now())).await.unwrap();

        let backups = BackupService::new(store, dir.path(), 3);
        let path = backups.create_backup().await.unwrap();

        let name = path.file_name().unwrap().to_str().unwrap().to_string();
        assert!(name.starts_with("auctions-backup-"), "Unexpected name {}", name);
        assert!(name.ends_with(".json"));

        let snapshot: BackupSnapshot =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(snapshot.version, BACKUP_FORMAT_VERSION);
        assert_eq!(snapshot.auctions.len(), 1);
        assert!(snapshot.claims.is_empty());
    }

    #[tokio::test]
    async fn test_rotate_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(AuctionStore::new(Database::open_in_memory().unwrap()));
        let backups = BackupService::new(store, dir.path(), 2);

        let mut written = Vec::new();
        for _ in 0..4 {
            written.push(backups.create_backup().await.unwrap());
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        assert_eq!(backups.rotate().await.unwrap(), 2);
        let left = backups.list_backups().await.unwrap();
        assert_eq!(left, vec![written[3].clone(), written[2].clone()]);
        assert!(dir.path().join("notes.txt").exists(), "Foreign files are never touched");
    }

    #[tokio::test]
    async fn test_restore_rejects_future_version() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(AuctionStore::new(Database::open_in_memory().unwrap()));
        let backups = BackupService::new(store, dir.path(), 2);

        let snapshot = BackupSnapshot {
            timestamp: Utc::now(),
            version: BACKUP_FORMAT_VERSION + 1,
            auctions: Vec::new(),
            bids: Vec::new(),
            claims: vec![Claim::money(
                Participant::new(Uuid::new_v4(), "p"),
                5,
                ClaimReason::OutbidRefund,
                None,
                Utc::now(),
            )],
        };
        let path = dir.path().join("future.json");
        std::fs::write(&path, serde_json::to_string(&snapshot).unwrap()).unwrap();

        assert!(backups.restore(&path).await.is_err());
    }

    #[tokio::test]
    async fn test_list_backups_without_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(AuctionStore::new(Database::open_in_memory().unwrap()));
        let backups = BackupService::new(store, dir.path().join("missing"), 2);
        assert!(backups.list_backups().await.unwrap().is_empty());
    }
}
