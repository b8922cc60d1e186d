//! Auction store: canonical auction records plus a cache of ACTIVE auctions.
//!
//! Every mutation commits to SQLite first and then updates or evicts the
//! cache entry. The cache only accelerates reads; turning it off changes no
//! outcome. Mutations of a single auction are serialized by the service's
//! per-auction lock, never here.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::StorageError;
use crate::storage::{queries, AuctionFilter, Database, Settlement};
use crate::types::{Auction, AuctionId, AuctionStatus, PlayerId};

/// Attempts a cache reload makes before accepting a snapshot raced by writers.
const RELOAD_ATTEMPTS: usize = 3;

pub struct AuctionStore {
    db: Database,
    cache: RwLock<FxHashMap<AuctionId, Auction>>,
    cache_enabled: bool,
    /// Bumped under the cache write lock on every cache mutation
    epoch: AtomicU64,
}

impl AuctionStore {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            cache: RwLock::new(FxHashMap::default()),
            cache_enabled: true,
            epoch: AtomicU64::new(0),
        }
    }

    /// Store that always reads through to SQLite.
    pub fn without_cache(db: Database) -> Self {
        Self {
            cache_enabled: false,
            ..Self::new(db)
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Persist a new auction. All-or-nothing: the record and its bids land together.
    pub async fn create(&self, auction: Auction) -> Result<Auction, StorageError> {
        let record = auction.clone();
        self.db
            .call(move |conn| queries::insert_auction(conn, &record))
            .await?;
        self.refresh_cache(&auction).await;
        debug!("[STORE] Created auction {}", auction.id());
        Ok(auction)
    }

    /// Cache first; a miss reads SQLite without populating the cache.
    pub async fn get(&self, id: AuctionId) -> Result<Option<Auction>, StorageError> {
        if let Some(hit) = self.cached(id).await {
            return Ok(Some(hit));
        }
        self.fetch(id).await
    }

    /// Read straight from SQLite. Used for read-modify-write under the auction lock.
    pub async fn fetch(&self, id: AuctionId) -> Result<Option<Auction>, StorageError> {
        self.db.call(move |conn| queries::select_auction(conn, id)).await
    }

    /// Cache lookup only.
    pub async fn cached(&self, id: AuctionId) -> Option<Auction> {
        if !self.cache_enabled {
            return None;
        }
        self.cache.read().await.get(&id).cloned()
    }

    pub async fn cache_len(&self) -> usize {
        self.cache.read().await.len()
    }

    /// Filtered query. Always reads SQLite.
    pub async fn query(&self, filter: AuctionFilter) -> Result<Vec<Auction>, StorageError> {
        self.db
            .call(move |conn| queries::select_auctions(conn, &filter))
            .await
    }

    /// Every auction, for snapshots.
    pub async fn all(&self) -> Result<Vec<Auction>, StorageError> {
        self.query(AuctionFilter::default()).await
    }

    /// Full-record replace. Returns false if no such auction exists.
    pub async fn update(&self, auction: &Auction) -> Result<bool, StorageError> {
        let record = auction.clone();
        let found = self
            .db
            .call(move |conn| queries::update_auction(conn, &record))
            .await?;
        if found {
            self.refresh_cache(auction).await;
        }
        Ok(found)
    }

    /// Commit a settlement (auction + claims) in one transaction.
    pub async fn commit(&self, settlement: Settlement) -> Result<Auction, StorageError> {
        let settlement = self
            .db
            .call(move |conn| {
                queries::commit_settlement(conn, &settlement)?;
                Ok(settlement)
            })
            .await?;
        self.refresh_cache(&settlement.auction).await;
        Ok(settlement.auction)
    }

    /// Delete an auction and its bids together.
    pub async fn delete(&self, id: AuctionId) -> Result<bool, StorageError> {
        let removed = self
            .db
            .call(move |conn| queries::delete_auction(conn, id))
            .await?;
        self.evict(id).await;
        Ok(removed)
    }

    /// Replace the cache with every ACTIVE auction in SQLite.
    pub async fn reload_cache(&self) -> Result<usize, StorageError> {
        if !self.cache_enabled {
            return Ok(0);
        }

        for attempt in 1..=RELOAD_ATTEMPTS {
            let before = self.epoch.load(Ordering::Acquire);
            let active = self.query(AuctionFilter::active()).await?;

            let mut cache = self.cache.write().await;
            if self.epoch.load(Ordering::Acquire) != before {
                if attempt < RELOAD_ATTEMPTS {
                    debug!("[STORE] Cache reload raced a write, retrying ({}/{})", attempt, RELOAD_ATTEMPTS);
                    continue;
                }
                warn!("[STORE] Cache reload raced writers {} times, using latest snapshot", attempt);
            }

            cache.clear();
            for auction in active {
                cache.insert(auction.id(), auction);
            }
            self.epoch.fetch_add(1, Ordering::AcqRel);
            info!("[STORE] Cache reloaded: {} active auctions", cache.len());
            return Ok(cache.len());
        }

        Ok(self.cache_len().await)
    }

    pub async fn active_count_by_seller(&self, seller: PlayerId) -> Result<usize, StorageError> {
        self.db
            .call(move |conn| queries::count_active_by_seller(conn, seller))
            .await
    }

    /// ACTIVE auctions whose clock ran out at or before `now`.
    pub async fn expired_active(&self, now: DateTime<Utc>) -> Result<Vec<AuctionId>, StorageError> {
        self.db
            .call(move |conn| queries::select_expired_active(conn, now))
            .await
    }

    /// EXPIRED or CLAIMED auctions that expired before `cutoff`.
    pub async fn settled_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<AuctionId>, StorageError> {
        self.db
            .call(move |conn| queries::select_settled_before(conn, cutoff))
            .await
    }

    async fn refresh_cache(&self, auction: &Auction) {
        if !self.cache_enabled {
            return;
        }
        let mut cache = self.cache.write().await;
        if auction.status() == AuctionStatus::Active {
            cache.insert(auction.id(), auction.clone());
        } else {
            cache.remove(&auction.id());
        }
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    async fn evict(&self, id: AuctionId) {
        if !self.cache_enabled {
            return;
        }
        let mut cache = self.cache.write().await;
        cache.remove(&id);
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Bid, ItemPayload, Listing, Participant};
    use std::time::Duration;
    use uuid::Uuid;

    fn listing(seller: &Participant) -> Listing {
        Listing {
            seller: seller.clone(),
            item: ItemPayload::new("emerald"),
            category: "gems".to_string(),
            start_price: 10,
            buy_now_price: None,
            duration: Duration::from_secs(600),
        }
    }

    #[tokio::test]
    async fn test_create_populates_cache() {
        let store = AuctionStore::new(Database::open_in_memory().unwrap());
        let seller = Participant::new(Uuid::new_v4(), "s");
        let auction = store.create(Auction::open(listing(&seller), Utc::now())).await.unwrap();

        assert_eq!(store.cached(auction.id()).await.map(|a| a.id()), Some(auction.id()));
        assert_eq!(store.active_count_by_seller(seller.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cached_record_matches_stored_record() {
        let store = AuctionStore::new(Database::open_in_memory().unwrap());
        let seller = Participant::new(Uuid::new_v4(), "s");
        let mut auction = store.create(Auction::open(listing(&seller), Utc::now())).await.unwrap();

        let stored = store.fetch(auction.id()).await.unwrap();
        assert_eq!(store.cached(auction.id()).await, stored, "Cache and storage disagree after create");

        let bid = Bid::new(auction.id(), Participant::new(Uuid::new_v4(), "b"), 20, Utc::now());
        auction.apply_bid(bid).unwrap();
        store
            .commit(Settlement {
                auction: auction.clone(),
                claims: Vec::new(),
            })
            .await
            .unwrap();

        let stored = store.fetch(auction.id()).await.unwrap();
        assert_eq!(store.cached(auction.id()).await, stored, "Cache and storage disagree after a bid");
    }

    #[tokio::test]
    async fn test_update_to_terminal_evicts() {
        let store = AuctionStore::new(Database::open_in_memory().unwrap());
        let seller = Participant::new(Uuid::new_v4(), "s");
        let mut auction = store.create(Auction::open(listing(&seller), Utc::now())).await.unwrap();

        auction.transition(AuctionStatus::Expired).unwrap();
        assert!(store.update(&auction).await.unwrap());

        assert!(store.cached(auction.id()).await.is_none(), "Terminal auctions leave the cache");
        let stored = store.get(auction.id()).await.unwrap().expect("still in storage");
        assert_eq!(stored.status(), AuctionStatus::Expired);
    }

    #[tokio::test]
    async fn test_get_miss_does_not_populate_cache() {
        let db = Database::open_in_memory().unwrap();
        let writer = AuctionStore::new(db.clone());
        let reader = AuctionStore::new(db);
        let seller = Participant::new(Uuid::new_v4(), "s");
        let auction = writer.create(Auction::open(listing(&seller), Utc::now())).await.unwrap();

        assert!(reader.get(auction.id()).await.unwrap().is_some());
        assert_eq!(reader.cache_len().await, 0, "A miss must not fill the cache");

        assert_eq!(reader.reload_cache().await.unwrap(), 1);
        assert!(reader.cached(auction.id()).await.is_some());
    }

    #[tokio::test]
    async fn test_reload_repairs_drift() {
        let db = Database::open_in_memory().unwrap();
        let store = AuctionStore::new(db.clone());
        let seller = Participant::new(Uuid::new_v4(), "s");
        let auction = store.create(Auction::open(listing(&seller), Utc::now())).await.unwrap();

        // Another writer settles it behind the store's back
        let mut settled = auction.clone();
        settled.transition(AuctionStatus::Cancelled).unwrap();
        db.call(move |conn| queries::update_auction(conn, &settled)).await.unwrap();
        assert!(store.cached(auction.id()).await.is_some(), "Cache is stale before reload");

        assert_eq!(store.reload_cache().await.unwrap(), 0);
        assert!(store.cached(auction.id()).await.is_none());
    }

    #[tokio::test]
    async fn test_delete_removes_bids_and_cache() {
        let store = AuctionStore::new(Database::open_in_memory().unwrap());
        let seller = Participant::new(Uuid::new_v4(), "s");
        let mut auction = Auction::open(listing(&seller), Utc::now());
        let bid = Bid::new(auction.id(), Participant::new(Uuid::new_v4(), "b"), 20, Utc::now());
        auction.apply_bid(bid).unwrap();
        let auction = store.create(auction).await.unwrap();

        assert!(store.delete(auction.id()).await.unwrap());
        assert!(store.get(auction.id()).await.unwrap().is_none());
        let id = auction.id();
        let bids = store.database().call(move |conn| queries::select_bids(conn, id)).await.unwrap();
        assert!(bids.is_empty());
    }

    #[tokio::test]
    async fn test_disabled_cache_still_serves_reads() {
        let store = AuctionStore::without_cache(Database::open_in_memory().unwrap());
        let seller = Participant::new(Uuid::new_v4(), "s");
        let auction = store.create(Auction::open(listing(&seller), Utc::now())).await.unwrap();

        assert_eq!(store.cache_len().await, 0);
        assert!(store.get(auction.id()).await.unwrap().is_some());
    }
}
