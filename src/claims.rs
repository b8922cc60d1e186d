//! Claims ledger: durable, per-player queue of pending settlements.
//!
//! A claim is written whenever a transfer is owed and removed only after the
//! recipient has actually received it. Dropping a claim loses a player's
//! money or items, so writes are retried before an error is surfaced.

use std::future::Future;
use std::time::Duration;

use tracing::{error, warn};

use crate::error::StorageError;
use crate::storage::{queries, Database};
use crate::types::{AuctionId, Claim, ClaimId, PlayerId};

/// Base delay between claim write attempts (multiplied by the attempt number)
const RETRY_BACKOFF_MS: u64 = 50;

pub struct ClaimsLedger {
    db: Database,
    retries: u32,
}

impl ClaimsLedger {
    pub fn new(db: Database, retries: u32) -> Self {
        Self {
            db,
            retries: retries.max(1),
        }
    }

    /// Append a claim, retrying transient storage failures.
    pub async fn add_claim(&self, claim: Claim) -> Result<Claim, StorageError> {
        self.with_retries(&claim, "write", || {
            let record = claim.clone();
            self.db.call(move |conn| queries::insert_claim(conn, &record))
        })
        .await?;
        Ok(claim)
    }

    /// All pending claims for a player, oldest first.
    pub async fn get_claims(&self, player: PlayerId) -> Result<Vec<Claim>, StorageError> {
        self.db
            .call(move |conn| queries::select_claims_for(conn, player))
            .await
    }

    pub async fn get_claim(&self, id: ClaimId) -> Result<Option<Claim>, StorageError> {
        self.db.call(move |conn| queries::select_claim(conn, id)).await
    }

    /// Remove a delivered claim. Returns false if it was already gone.
    pub async fn delete_claim(&self, id: ClaimId) -> Result<bool, StorageError> {
        self.db.call(move |conn| queries::delete_claim(conn, id)).await
    }

    /// Record partial delivery by rewriting what the claim still owes.
    /// Retried like `add_claim`: a lost rewrite means items handed over twice.
    pub async fn update_contents(&self, claim: &Claim) -> Result<bool, StorageError> {
        self.with_retries(claim, "rewrite", || {
            let record = claim.clone();
            self.db
                .call(move |conn| queries::update_claim_contents(conn, &record))
        })
        .await
    }

    /// Claims still outstanding for an auction's settlement.
    pub async fn pending_for_auction(&self, auction_id: AuctionId) -> Result<usize, StorageError> {
        self.db
            .call(move |conn| queries::count_claims_for_auction(conn, auction_id))
            .await
    }

    pub async fn count(&self, player: PlayerId) -> Result<usize, StorageError> {
        self.db
            .call(move |conn| queries::count_claims_for(conn, player))
            .await
    }

    /// Every pending claim, for snapshots.
    pub async fn all(&self) -> Result<Vec<Claim>, StorageError> {
        self.db.call(|conn| queries::select_all_claims(conn)).await
    }

    /// Run `op` up to `retries` times with a linear backoff.
    async fn with_retries<T, F, Fut>(&self, claim: &Claim, action: &str, mut op: F) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.retries => {
                    warn!(
                        "[CLAIMS] Failed to {} claim {} for {} (attempt {}/{}): {}",
                        action, claim.id, claim.recipient.name, attempt, self.retries, e
                    );
                    tokio::time::sleep(Duration::from_millis(RETRY_BACKOFF_MS * attempt as u64)).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        "[CLAIMS] Giving up on claim {} for {} ({} {} / {} items): {}",
                        claim.id,
                        claim.recipient.name,
                        claim.reason,
                        claim.money,
                        claim.items.len(),
                        e
                    );
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ClaimReason, ItemPayload, Participant};
    use chrono::Utc;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_add_get_delete() {
        let ledger = ClaimsLedger::new(Database::open_in_memory().unwrap(), 3);
        let player = Participant::new(Uuid::new_v4(), "p");
        let auction_id = Uuid::new_v4();

        let claim = ledger
            .add_claim(Claim::item(
                player.clone(),
                ItemPayload::new("gold"),
                ClaimReason::AuctionUnsold,
                Some(auction_id),
                Utc::now(),
            ))
            .await
            .unwrap();

        assert_eq!(ledger.get_claims(player.id).await.unwrap().len(), 1);
        assert_eq!(ledger.pending_for_auction(auction_id).await.unwrap(), 1);

        assert!(ledger.delete_claim(claim.id).await.unwrap());
        assert!(!ledger.delete_claim(claim.id).await.unwrap(), "Second delete is a no-op");
        assert_eq!(ledger.count(player.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_add_claim_surfaces_error_after_retries() {
        let db = Database::open_in_memory().unwrap();
        let ledger = ClaimsLedger::new(db.clone(), 2);
        db.shutdown();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let player = Participant::new(Uuid::new_v4(), "p");
        let result = ledger
            .add_claim(Claim::money(player, 5, ClaimReason::OutbidRefund, None, Utc::now()))
            .await;
        assert!(matches!(result, Err(StorageError::Closed)));
    }

    #[tokio::test]
    async fn test_update_contents_retries_until_storage_recovers() {
        let db = Database::open_in_memory().unwrap();
        let ledger = ClaimsLedger::new(db.clone(), 3);
        let player = Participant::new(Uuid::new_v4(), "p");
        let mut claim = Claim::money(player, 30, ClaimReason::AuctionSold, None, Utc::now());
        claim.items.push(ItemPayload::new("shield"));
        let mut claim = ledger.add_claim(claim).await.unwrap();

        db.call(|conn| {
            conn.execute_batch(
                "CREATE TRIGGER hold_claims BEFORE UPDATE ON claims \
                 BEGIN SELECT RAISE(ABORT, 'claims are locked'); END;",
            )?;
            Ok(())
        })
        .await
        .unwrap();
        let release = db.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            release
                .call(|conn| Ok(conn.execute_batch("DROP TRIGGER hold_claims")?))
                .await
                .unwrap();
        });

        claim.items.clear();
        assert!(ledger.update_contents(&claim).await.unwrap(), "Rewrite lands once storage recovers");
        let stored = ledger.get_claim(claim.id).await.unwrap().unwrap();
        assert!(stored.items.is_empty());
        assert_eq!(stored.money, 30);
    }
}
