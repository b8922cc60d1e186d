//! Auction service: turns player intents into settlements.
//!
//! Every mutating entry point runs validate, move money, build claims and
//! commit as one unit under the per-auction lock. The commit is a single
//! storage transaction, so a failed attempt leaves the auction exactly as it
//! was and any escrow taken for it is handed back.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rustc_hash::FxHashSet;
use tracing::{debug, error, info, warn};

use crate::claims::ClaimsLedger;
use crate::config::AuctionConfig;
use crate::error::{ServiceError, ServiceResult, StorageError, TransitionError, ValidationFailure};
use crate::lock::KeyedLock;
use crate::ports::{Economy, Inventory};
use crate::storage::{AuctionFilter, Settlement};
use crate::store::AuctionStore;
use crate::types::{
    Auction, AuctionId, AuctionStatus, Bid, Cents, Claim, ClaimId, ClaimReason, Listing,
    ItemPayload, Participant, PlayerId,
};
use crate::validation;

/// Base delay between settlement commit attempts (multiplied by the attempt number)
const COMMIT_BACKOFF_MS: u64 = 50;

// =============================================================================
// OUTCOMES
// =============================================================================

/// Accepted bid.
#[derive(Debug, Clone)]
pub struct BidOutcome {
    pub auction: Auction,
    /// Refund issued to the bidder this bid displaced
    pub refund: Option<Claim>,
}

impl BidOutcome {
    pub fn message(&self) -> String {
        format!("Bid of {} placed.", self.auction.current_bid())
    }
}

/// Auction moved out of ACTIVE (buy-now, expiry or cancellation).
#[derive(Debug, Clone)]
pub struct SettlementOutcome {
    pub auction: Auction,
    pub claims: Vec<Claim>,
    /// Cancellation fee debited from the canceller
    pub fee_charged: Cents,
}

impl SettlementOutcome {
    pub fn message(&self) -> String {
        match self.auction.status() {
            AuctionStatus::Sold => match self.auction.current_bidder() {
                Some(winner) => format!("Sold to {} for {}.", winner.name, self.auction.current_bid()),
                None => "Sold.".to_string(),
            },
            AuctionStatus::Expired => "Auction ended without bids. The item is waiting in your claims.".to_string(),
            AuctionStatus::Cancelled if self.fee_charged > 0 => {
                format!("Auction cancelled. A fee of {} was charged.", self.fee_charged)
            }
            AuctionStatus::Cancelled => "Auction cancelled.".to_string(),
            other => format!("Auction is {}.", other),
        }
    }
}

/// Result of trying to deliver one claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Everything handed over; the claim is gone.
    Delivered { items: usize, money: Cents },
    /// Items handed over but the money could not be deposited. The claim now owes only money.
    ItemsOnly { items: usize, money_owed: Cents },
    /// Nothing handed over; the claim is kept as it was.
    Deferred { reason: String },
}

/// Totals for one `drain_claims` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    pub partial: usize,
    pub deferred: usize,
    pub items: usize,
    pub money: Cents,
}

// =============================================================================
// SERVICE
// =============================================================================

pub struct AuctionService {
    store: Arc<AuctionStore>,
    claims: Arc<ClaimsLedger>,
    economy: Arc<dyn Economy>,
    inventory: Arc<dyn Inventory>,
    config: AuctionConfig,
    auction_locks: KeyedLock<AuctionId>,
    seller_locks: KeyedLock<PlayerId>,
    claim_locks: KeyedLock<ClaimId>,
    /// Claims whose items are out but whose rewrite could not be stored yet
    items_handed: Mutex<FxHashSet<ClaimId>>,
}

impl AuctionService {
    pub fn new(
        store: Arc<AuctionStore>,
        claims: Arc<ClaimsLedger>,
        economy: Arc<dyn Economy>,
        inventory: Arc<dyn Inventory>,
        config: AuctionConfig,
    ) -> Self {
        Self {
            store,
            claims,
            economy,
            inventory,
            config,
            auction_locks: KeyedLock::new(),
            seller_locks: KeyedLock::new(),
            claim_locks: KeyedLock::new(),
            items_handed: Mutex::new(FxHashSet::default()),
        }
    }

    pub fn store(&self) -> &Arc<AuctionStore> {
        &self.store
    }

    pub fn claims(&self) -> &Arc<ClaimsLedger> {
        &self.claims
    }

    pub fn config(&self) -> &AuctionConfig {
        &self.config
    }

    // === Reads ===

    pub async fn get_auction(&self, id: AuctionId) -> ServiceResult<Auction> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Auction".to_string()))
    }

    pub async fn search(&self, filter: AuctionFilter) -> ServiceResult<Vec<Auction>> {
        Ok(self.store.query(filter).await?)
    }

    pub async fn claims_for(&self, player: PlayerId) -> ServiceResult<Vec<Claim>> {
        Ok(self.claims.get_claims(player).await?)
    }

    // === Mutations ===

    /// List a new item. The caller has already taken the item from the seller.
    pub async fn create_auction(&self, listing: Listing) -> ServiceResult<Auction> {
        // Serializes the active-count check with concurrent listings by the same seller
        let _seller = self.seller_locks.lock(listing.seller.id).await;

        let active = self.store.active_count_by_seller(listing.seller.id).await?;
        if let Err(rejection) = validation::validate_listing(&self.config, &listing, active) {
            debug!("[SERVICE] Listing by {} rejected: {}", listing.seller.name, rejection.code());
            return Err(rejection.into());
        }

        let auction = self.store.create(Auction::open(listing, Utc::now())).await?;
        info!(
            "[SERVICE] {} listed auction {} ({}) starting at {}",
            auction.seller().name,
            auction.id(),
            auction.category(),
            auction.start_price()
        );
        Ok(auction)
    }

    /// Place a bid. The amount is escrowed from the bidder and the displaced
    /// leader gets an OUTBID_REFUND claim for what they had bid.
    pub async fn place_bid(
        &self,
        auction_id: AuctionId,
        bidder: Participant,
        amount: Cents,
    ) -> ServiceResult<BidOutcome> {
        let _guard = self.auction_locks.lock(auction_id).await;
        let now = Utc::now();
        let mut auction = self.load(auction_id).await?;

        if let Err(rejection) = validation::validate_bid(&self.config, &auction, bidder.id, amount, now) {
            debug!(
                "[SERVICE] Bid {} by {} on {} rejected: {}",
                amount, bidder.name, auction_id, rejection.code()
            );
            return Err(rejection.into());
        }

        let displaced = auction
            .apply_bid(Bid::new(auction_id, bidder.clone(), amount, now))
            .map_err(rejection_for)?;

        self.economy.withdraw(bidder.id, amount).await?;

        let refund = displaced.map(|(previous, previous_amount)| {
            Claim::money(previous, previous_amount, ClaimReason::OutbidRefund, Some(auction_id), now)
        });
        let settlement = Settlement {
            auction,
            claims: refund.iter().cloned().collect(),
        };

        match self.commit(settlement).await {
            Ok(auction) => {
                info!(
                    "[SERVICE] {} bid {} on {}{}",
                    bidder.name,
                    amount,
                    auction_id,
                    refund
                        .as_ref()
                        .map(|r| format!(" (refund {} to {})", r.money, r.recipient.name))
                        .unwrap_or_default()
                );
                Ok(BidOutcome { auction, refund })
            }
            Err(e) => {
                self.return_escrow(&bidder, amount, auction_id, ClaimReason::OutbidRefund, now)
                    .await;
                Err(e.into())
            }
        }
    }

    /// Buy outright at the buy-now price.
    pub async fn buy_now(&self, auction_id: AuctionId, buyer: Participant) -> ServiceResult<SettlementOutcome> {
        let _guard = self.auction_locks.lock(auction_id).await;
        let now = Utc::now();
        let mut auction = self.load(auction_id).await?;

        let price = match validation::validate_buy_now(&auction, buyer.id, now) {
            Ok(price) => price,
            Err(rejection) => {
                debug!("[SERVICE] Buy-now by {} on {} rejected: {}", buyer.name, auction_id, rejection.code());
                return Err(rejection.into());
            }
        };

        let mut claims = Vec::with_capacity(3);
        if let Some(leader) = auction.current_bidder() {
            claims.push(Claim::money(
                leader.clone(),
                auction.current_bid(),
                ClaimReason::OutbidRefund,
                Some(auction_id),
                now,
            ));
        }
        claims.push(Claim::item(
            buyer.clone(),
            auction.item().clone(),
            ClaimReason::AuctionWon,
            Some(auction_id),
            now,
        ));
        claims.push(Claim::money(
            auction.seller().clone(),
            price,
            ClaimReason::AuctionSold,
            Some(auction_id),
            now,
        ));
        auction.record_sale(buyer.clone(), price).map_err(rejection_for)?;

        self.economy.withdraw(buyer.id, price).await?;

        let settlement = Settlement { auction, claims };
        match self.commit(settlement.clone()).await {
            Ok(auction) => {
                info!("[SERVICE] {} bought {} outright for {}", buyer.name, auction_id, price);
                Ok(SettlementOutcome {
                    auction,
                    claims: settlement.claims,
                    fee_charged: 0,
                })
            }
            Err(e) => {
                self.return_escrow(&buyer, price, auction_id, ClaimReason::OutbidRefund, now)
                    .await;
                Err(e.into())
            }
        }
    }

    /// Settle an auction whose clock has run out: SOLD to the leader, or
    /// EXPIRED with the item going back to the seller.
    pub async fn expire(&self, auction_id: AuctionId) -> ServiceResult<SettlementOutcome> {
        let _guard = self.auction_locks.lock(auction_id).await;
        let now = Utc::now();
        let mut auction = self.load(auction_id).await?;

        if auction.status() != AuctionStatus::Active {
            return Err(ValidationFailure::NotActive.into());
        }
        if !auction.is_expired(now) {
            return Err(ValidationFailure::NotExpired.into());
        }

        let claims = match auction.current_bidder().cloned() {
            Some(winner) => {
                let claims = vec![
                    Claim::item(winner, auction.item().clone(), ClaimReason::AuctionWon, Some(auction_id), now),
                    Claim::money(
                        auction.seller().clone(),
                        auction.current_bid(),
                        ClaimReason::AuctionSold,
                        Some(auction_id),
                        now,
                    ),
                ];
                auction.transition(AuctionStatus::Sold).map_err(rejection_for)?;
                claims
            }
            None => {
                let claims = vec![Claim::item(
                    auction.seller().clone(),
                    auction.item().clone(),
                    ClaimReason::AuctionUnsold,
                    Some(auction_id),
                    now,
                )];
                auction.transition(AuctionStatus::Expired).map_err(rejection_for)?;
                claims
            }
        };

        let settlement = Settlement { auction, claims };
        let auction = self.commit(settlement.clone()).await?;
        info!(
            "[SERVICE] Auction {} ended {} ({} claims)",
            auction_id,
            auction.status(),
            settlement.claims.len()
        );
        Ok(SettlementOutcome {
            auction,
            claims: settlement.claims,
            fee_charged: 0,
        })
    }

    /// Cancel an ACTIVE auction. The leader is refunded and the item returned
    /// through claims; the fee, if any, is debited from the canceller directly.
    pub async fn cancel(
        &self,
        auction_id: AuctionId,
        canceller: Participant,
        is_admin: bool,
    ) -> ServiceResult<SettlementOutcome> {
        let _guard = self.auction_locks.lock(auction_id).await;
        let now = Utc::now();
        let mut auction = self.load(auction_id).await?;

        if let Err(rejection) = validation::validate_cancel(&self.config, &auction, canceller.id, is_admin) {
            debug!("[SERVICE] Cancel by {} on {} rejected: {}", canceller.name, auction_id, rejection.code());
            return Err(rejection.into());
        }

        let mut claims = Vec::with_capacity(2);
        if let Some(leader) = auction.current_bidder() {
            claims.push(Claim::money(
                leader.clone(),
                auction.current_bid(),
                ClaimReason::AuctionCancelled,
                Some(auction_id),
                now,
            ));
        }
        claims.push(Claim::item(
            auction.seller().clone(),
            auction.item().clone(),
            ClaimReason::AuctionCancelled,
            Some(auction_id),
            now,
        ));
        auction.transition(AuctionStatus::Cancelled).map_err(rejection_for)?;

        let fee = if is_admin { 0 } else { self.config.cancellation_fee };
        if fee > 0 {
            self.economy.withdraw(canceller.id, fee).await?;
        }

        let settlement = Settlement { auction, claims };
        match self.commit(settlement.clone()).await {
            Ok(auction) => {
                info!(
                    "[SERVICE] Auction {} cancelled by {}{}",
                    auction_id,
                    canceller.name,
                    if is_admin { " (admin)" } else { "" }
                );
                Ok(SettlementOutcome {
                    auction,
                    claims: settlement.claims,
                    fee_charged: fee,
                })
            }
            Err(e) => {
                if fee > 0 {
                    self.return_escrow(&canceller, fee, auction_id, ClaimReason::AuctionCancelled, now)
                        .await;
                }
                Err(e.into())
            }
        }
    }

    /// Delete EXPIRED or CLAIMED auctions that ended before `cutoff`.
    /// Returns how many were removed.
    pub async fn purge_settled(&self, cutoff: DateTime<Utc>) -> ServiceResult<usize> {
        let candidates = self.store.settled_before(cutoff).await?;
        let mut removed = 0;
        for id in candidates {
            let _guard = self.auction_locks.lock(id).await;
            // Re-check under the lock; the record may have changed since the scan
            let eligible = matches!(
                self.store.fetch(id).await?,
                Some(a) if matches!(a.status(), AuctionStatus::Expired | AuctionStatus::Claimed)
                    && a.expires_at() < cutoff
            );
            if eligible && self.store.delete(id).await? {
                removed += 1;
            }
        }
        if removed > 0 {
            info!("[SERVICE] Purged {} settled auctions", removed);
        }
        Ok(removed)
    }

    // === Claim delivery ===

    /// Deliver one claim: items first, then money, then delete the claim.
    ///
    /// A claim that no longer exists is `NotFound`, never a second transfer.
    pub async fn process_claim(&self, claim_id: ClaimId) -> ServiceResult<DeliveryOutcome> {
        let _guard = self.claim_locks.lock(claim_id).await;
        let mut claim = self
            .claims
            .get_claim(claim_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Claim".to_string()))?;
        let player = claim.recipient.id;

        let handed = self.items_handed().contains(&claim_id);
        if handed {
            claim.items.clear();
        }
        let items = claim.items.len();
        if items > 0 {
            let free = match self.inventory.free_slots(player).await {
                Ok(free) => free,
                Err(e) => return Ok(self.defer(&claim, e.to_string())),
            };
            if free < items {
                return Ok(self.defer(&claim, format!("needs {} free slots, has {}", items, free)));
            }
            if let Err(e) = self.inventory.give_items(player, &claim.items).await {
                return Ok(self.defer(&claim, e.to_string()));
            }
        }

        if claim.money > 0 {
            if let Err(e) = self.economy.deposit(player, claim.money).await {
                if items == 0 {
                    if handed {
                        self.drop_delivered_items(&claim, &[]).await;
                    }
                    return Ok(self.defer(&claim, e.to_string()));
                }
                // Items are already out; keep only the money owed
                let delivered = std::mem::take(&mut claim.items);
                self.drop_delivered_items(&claim, &delivered).await;
                warn!(
                    "[CLAIMS] Delivered {} items to {}, {} still owed: {}",
                    items, claim.recipient.name, claim.money, e
                );
                return Ok(DeliveryOutcome::ItemsOnly {
                    items,
                    money_owed: claim.money,
                });
            }
        }

        if let Err(e) = self.claims.delete_claim(claim_id).await {
            error!(
                "[CLAIMS] Claim {} delivered to {} but could not be removed: {}",
                claim_id, claim.recipient.name, e
            );
            return Err(e.into());
        }
        self.items_handed().remove(&claim_id);
        info!(
            "[CLAIMS] Delivered claim {} to {}: {} items, {} money ({})",
            claim_id, claim.recipient.name, items, claim.money, claim.reason
        );

        if let Some(auction_id) = claim.auction_id {
            if let Err(e) = self.mark_claimed_if_drained(auction_id).await {
                warn!("[CLAIMS] Could not mark auction {} claimed: {}", auction_id, e);
            }
        }

        Ok(DeliveryOutcome::Delivered {
            items,
            money: claim.money,
        })
    }

    /// Deliver every pending claim for a player, oldest first. Claims that
    /// cannot be delivered now stay queued.
    pub async fn drain_claims(&self, player: PlayerId) -> ServiceResult<DrainReport> {
        let pending = self.claims.get_claims(player).await?;
        let mut report = DrainReport::default();

        for claim in pending {
            match self.process_claim(claim.id).await {
                Ok(DeliveryOutcome::Delivered { items, money }) => {
                    report.delivered += 1;
                    report.items += items;
                    report.money += money;
                }
                Ok(DeliveryOutcome::ItemsOnly { items, .. }) => {
                    report.partial += 1;
                    report.items += items;
                }
                Ok(DeliveryOutcome::Deferred { .. }) => report.deferred += 1,
                // Delivered by a concurrent drain
                Err(ServiceError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        if report.delivered + report.partial > 0 || report.deferred > 0 {
            info!(
                "[CLAIMS] Drained claims for {}: {} delivered, {} partial, {} deferred",
                player, report.delivered, report.partial, report.deferred
            );
        }
        Ok(report)
    }

    // === Internals ===

    async fn load(&self, id: AuctionId) -> ServiceResult<Auction> {
        self.store
            .fetch(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Auction".to_string()))
    }

    /// Commit with retries. Claims in a settlement must not be dropped.
    async fn commit(&self, settlement: Settlement) -> Result<Auction, StorageError> {
        let attempts = self.config.add_claim_retries.max(1);
        let mut attempt = 1;
        loop {
            match self.store.commit(settlement.clone()).await {
                Ok(auction) => return Ok(auction),
                Err(e) if attempt < attempts && !matches!(e, StorageError::Corrupt(_)) => {
                    warn!(
                        "[SERVICE] Settlement of {} failed (attempt {}/{}): {}",
                        settlement.auction.id(),
                        attempt,
                        attempts,
                        e
                    );
                    tokio::time::sleep(Duration::from_millis(COMMIT_BACKOFF_MS * attempt as u64)).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        "[SERVICE] Settlement of {} abandoned after {} attempts: {}",
                        settlement.auction.id(),
                        attempt,
                        e
                    );
                    return Err(e);
                }
            }
        }
    }

    /// Give back money taken for an attempt that did not commit. Falls back
    /// to a claim when the economy is unreachable.
    async fn return_escrow(
        &self,
        payer: &Participant,
        amount: Cents,
        auction_id: AuctionId,
        reason: ClaimReason,
        now: DateTime<Utc>,
    ) {
        match self.economy.deposit(payer.id, amount).await {
            Ok(()) => debug!("[SERVICE] Returned {} to {}", amount, payer.name),
            Err(e) => {
                warn!("[SERVICE] Could not return {} to {} ({}), issuing claim", amount, payer.name, e);
                let claim = Claim::money(payer.clone(), amount, reason, Some(auction_id), now);
                if let Err(e) = self.claims.add_claim(claim).await {
                    error!(
                        "[SERVICE] LOST {} owed to {} ({}) for auction {}: {}",
                        amount, payer.name, payer.id, auction_id, e
                    );
                }
            }
        }
    }

    /// Rewrite a claim whose items are out so it owes only money. Until the
    /// rewrite is stored, the claim id is remembered and later attempts skip
    /// the items.
    async fn drop_delivered_items(&self, claim: &Claim, delivered: &[ItemPayload]) {
        match self.claims.update_contents(claim).await {
            Ok(found) => {
                self.items_handed().remove(&claim.id);
                if !found {
                    warn!("[CLAIMS] Claim {} vanished during partial delivery", claim.id);
                }
            }
            Err(e) => {
                self.items_handed().insert(claim.id);
                error!(
                    "[CLAIMS] Claim {} for {} still lists delivered items {:?}: {}",
                    claim.id, claim.recipient.name, delivered, e
                );
            }
        }
    }

    fn items_handed(&self) -> MutexGuard<'_, FxHashSet<ClaimId>> {
        self.items_handed.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn defer(&self, claim: &Claim, reason: String) -> DeliveryOutcome {
        debug!("[CLAIMS] Claim {} for {} deferred: {}", claim.id, claim.recipient.name, reason);
        DeliveryOutcome::Deferred { reason }
    }

    /// Move a settled auction to CLAIMED once none of its claims remain.
    async fn mark_claimed_if_drained(&self, auction_id: AuctionId) -> ServiceResult<()> {
        let _guard = self.auction_locks.lock(auction_id).await;
        if self.claims.pending_for_auction(auction_id).await? > 0 {
            return Ok(());
        }
        let Some(mut auction) = self.store.fetch(auction_id).await? else {
            return Ok(());
        };
        if !auction.status().is_settled() {
            return Ok(());
        }
        auction.transition(AuctionStatus::Claimed).map_err(rejection_for)?;
        self.store.update(&auction).await?;
        info!("[SERVICE] Auction {} fully claimed", auction_id);
        Ok(())
    }
}

/// A record-level rejection surfaces the same way a validation failure does.
fn rejection_for(e: TransitionError) -> ServiceError {
    match e {
        TransitionError::NotHigher { current, .. } => ValidationFailure::BidTooLow {
            minimum: current.saturating_add(1),
        }
        .into(),
        TransitionError::NotActive { .. } | TransitionError::Illegal { .. } => {
            ValidationFailure::NotActive.into()
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{MemoryEconomy, MemoryInventory};
    use crate::storage::Database;
    use crate::types::ItemPayload;
    use std::time::Duration;
    use uuid::Uuid;

    struct Harness {
        service: AuctionService,
        economy: Arc<MemoryEconomy>,
        inventory: Arc<MemoryInventory>,
        db: Database,
    }

    fn harness(config: AuctionConfig) -> Harness {
        let db = Database::open_in_memory().unwrap();
        let economy = Arc::new(MemoryEconomy::new());
        let inventory = Arc::new(MemoryInventory::default());
        let service = AuctionService::new(
            Arc::new(AuctionStore::new(db.clone())),
            Arc::new(ClaimsLedger::new(db.clone(), 3)),
            economy.clone(),
            inventory.clone(),
            config,
        );
        Harness {
            service,
            economy,
            inventory,
            db,
        }
    }

    fn player(name: &str) -> Participant {
        Participant::new(Uuid::new_v4(), name)
    }

    fn listing(seller: &Participant, buy_now: Option<Cents>) -> Listing {
        Listing {
            seller: seller.clone(),
            item: ItemPayload::new("{\"type\":\"ELYTRA\"}"),
            category: "gear".to_string(),
            start_price: 10,
            buy_now_price: buy_now,
            duration: Duration::from_secs(3600),
        }
    }

    /// Force an auction's clock to have run out.
    async fn backdate(h: &Harness, id: AuctionId) {
        let mut auction = h.service.store().fetch(id).await.unwrap().unwrap();
        auction.expires_at = Utc::now() - chrono::Duration::seconds(1);
        h.service.store().update(&auction).await.unwrap();
    }

    #[tokio::test]
    async fn test_bid_escrows_and_refunds_previous_amount() {
        let h = harness(AuctionConfig::default());
        let seller = player("seller");
        let (alice, bob) = (player("alice"), player("bob"));
        h.economy.set_balance(alice.id, 100);
        h.economy.set_balance(bob.id, 100);

        let auction = h.service.create_auction(listing(&seller, None)).await.unwrap();
        let first = h.service.place_bid(auction.id(), alice.clone(), 15).await.unwrap();
        assert!(first.refund.is_none());
        assert_eq!(h.economy.balance_of(alice.id), 85);

        let second = h.service.place_bid(auction.id(), bob.clone(), 20).await.unwrap();
        let refund = second.refund.expect("alice was displaced");
        assert_eq!(refund.recipient, alice);
        assert_eq!(refund.money, 15, "Refund covers the previous amount, not the new one");
        assert_eq!(refund.reason, ClaimReason::OutbidRefund);
        assert_eq!(second.auction.current_bid(), 20);
        assert_eq!(h.economy.balance_of(bob.id), 80);
    }

    #[tokio::test]
    async fn test_insufficient_funds_leaves_auction_untouched() {
        let h = harness(AuctionConfig::default());
        let seller = player("seller");
        let poor = player("poor");
        h.economy.set_balance(poor.id, 5);

        let auction = h.service.create_auction(listing(&seller, None)).await.unwrap();
        let err = h.service.place_bid(auction.id(), poor, 15).await.unwrap_err();
        assert!(matches!(err, ServiceError::InsufficientFunds { balance: 5, needed: 15 }));

        let stored = h.service.get_auction(auction.id()).await.unwrap();
        assert_eq!(stored.current_bid(), 10);
        assert!(stored.bid_history().is_empty());
    }

    #[tokio::test]
    async fn test_economy_outage_rejects_bid_generically() {
        let h = harness(AuctionConfig::default());
        let seller = player("seller");
        let bidder = player("bidder");
        let auction = h.service.create_auction(listing(&seller, None)).await.unwrap();

        h.economy.set_offline(true);
        let err = h.service.place_bid(auction.id(), bidder, 15).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.user_message(), "Something went wrong, please try again.");
    }

    #[tokio::test]
    async fn test_too_many_active_listings() {
        let config = AuctionConfig {
            max_active_per_player: 1,
            ..AuctionConfig::default()
        };
        let h = harness(config);
        let seller = player("seller");

        h.service.create_auction(listing(&seller, None)).await.unwrap();
        let err = h.service.create_auction(listing(&seller, None)).await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Validation(ValidationFailure::TooManyActive { limit: 1 })
        ));
    }

    #[tokio::test]
    async fn test_expire_before_end_is_rejected() {
        let h = harness(AuctionConfig::default());
        let seller = player("seller");
        let auction = h.service.create_auction(listing(&seller, None)).await.unwrap();

        let err = h.service.expire(auction.id()).await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation(ValidationFailure::NotExpired)));
    }

    #[tokio::test]
    async fn test_expire_with_bidder_sells() {
        let h = harness(AuctionConfig::default());
        let seller = player("seller");
        let alice = player("alice");
        h.economy.set_balance(alice.id, 100);

        let auction = h.service.create_auction(listing(&seller, None)).await.unwrap();
        h.service.place_bid(auction.id(), alice.clone(), 40).await.unwrap();
        backdate(&h, auction.id()).await;

        let outcome = h.service.expire(auction.id()).await.unwrap();
        assert_eq!(outcome.auction.status(), AuctionStatus::Sold);
        let reasons: Vec<_> = outcome.claims.iter().map(|c| (c.reason, c.recipient.id)).collect();
        assert!(reasons.contains(&(ClaimReason::AuctionWon, alice.id)));
        assert!(reasons.contains(&(ClaimReason::AuctionSold, seller.id)));
        let paid = outcome.claims.iter().find(|c| c.reason == ClaimReason::AuctionSold).unwrap();
        assert_eq!(paid.money, 40);

        let again = h.service.expire(auction.id()).await.unwrap_err();
        assert!(matches!(again, ServiceError::Validation(ValidationFailure::NotActive)));
    }

    #[tokio::test]
    async fn test_cancel_charges_fee_and_refunds_leader() {
        let config = AuctionConfig {
            cancellation_fee: 3,
            ..AuctionConfig::default()
        };
        let h = harness(config);
        let seller = player("seller");
        let alice = player("alice");
        h.economy.set_balance(seller.id, 10);
        h.economy.set_balance(alice.id, 100);

        let auction = h.service.create_auction(listing(&seller, None)).await.unwrap();
        h.service.place_bid(auction.id(), alice.clone(), 25).await.unwrap();

        let outcome = h.service.cancel(auction.id(), seller.clone(), false).await.unwrap();
        assert_eq!(outcome.auction.status(), AuctionStatus::Cancelled);
        assert_eq!(outcome.fee_charged, 3);
        assert_eq!(h.economy.balance_of(seller.id), 7);

        let refund = outcome.claims.iter().find(|c| c.recipient == alice).unwrap();
        assert_eq!(refund.money, 25);
        assert_eq!(refund.reason, ClaimReason::AuctionCancelled);
        let item = outcome.claims.iter().find(|c| c.recipient == seller).unwrap();
        assert_eq!(item.items.len(), 1);
    }

    #[tokio::test]
    async fn test_admin_cancel_is_free() {
        let config = AuctionConfig {
            cancellation_fee: 3,
            cancellation_enabled: false,
            ..AuctionConfig::default()
        };
        let h = harness(config);
        let seller = player("seller");
        let admin = player("admin");

        let auction = h.service.create_auction(listing(&seller, None)).await.unwrap();
        let outcome = h.service.cancel(auction.id(), admin, true).await.unwrap();
        assert_eq!(outcome.fee_charged, 0);
        assert_eq!(outcome.message(), "Auction cancelled.");
    }

    #[tokio::test]
    async fn test_process_claim_defers_when_inventory_full() {
        let h = harness(AuctionConfig::default());
        let seller = player("seller");
        let auction = h.service.create_auction(listing(&seller, None)).await.unwrap();
        backdate(&h, auction.id()).await;
        let outcome = h.service.expire(auction.id()).await.unwrap();
        let claim_id = outcome.claims[0].id;

        h.inventory.set_free_slots(seller.id, 0);
        let result = h.service.process_claim(claim_id).await.unwrap();
        assert!(matches!(result, DeliveryOutcome::Deferred { .. }));
        assert!(h.service.claims().get_claim(claim_id).await.unwrap().is_some(), "Claim must stay queued");

        h.inventory.set_free_slots(seller.id, 1);
        let result = h.service.process_claim(claim_id).await.unwrap();
        assert_eq!(result, DeliveryOutcome::Delivered { items: 1, money: 0 });

        let stored = h.service.get_auction(auction.id()).await.unwrap();
        assert_eq!(stored.status(), AuctionStatus::Claimed);
        assert!(stored.is_claimed());
    }

    #[tokio::test]
    async fn test_partial_delivery_keeps_only_money() {
        let h = harness(AuctionConfig::default());
        let player = player("mixed");
        let mut claim = Claim::money(player.clone(), 30, ClaimReason::AuctionSold, None, Utc::now());
        claim.items.push(ItemPayload::new("shield"));
        let claim = h.service.claims().add_claim(claim).await.unwrap();

        h.economy.set_offline(true);
        let result = h.service.process_claim(claim.id).await.unwrap();
        assert_eq!(result, DeliveryOutcome::ItemsOnly { items: 1, money_owed: 30 });

        let remaining = h.service.claims().get_claim(claim.id).await.unwrap().unwrap();
        assert!(remaining.items.is_empty());
        assert_eq!(remaining.money, 30);

        h.economy.set_offline(false);
        let result = h.service.process_claim(claim.id).await.unwrap();
        assert_eq!(result, DeliveryOutcome::Delivered { items: 0, money: 30 });
        assert_eq!(h.inventory.received(player.id).len(), 1, "Item delivered exactly once");
        assert_eq!(h.economy.balance_of(player.id), 30);
    }

    #[tokio::test]
    async fn test_failed_rewrite_never_hands_items_twice() {
        let h = harness(AuctionConfig::default());
        let player = player("mixed");
        let mut claim = Claim::money(player.clone(), 30, ClaimReason::AuctionSold, None, Utc::now());
        claim.items.push(ItemPayload::new("shield"));
        let claim = h.service.claims().add_claim(claim).await.unwrap();

        // Claim rows cannot be rewritten while this trigger exists
        h.db.call(|conn| {
            conn.execute_batch(
                "CREATE TRIGGER hold_claims BEFORE UPDATE ON claims \
                 BEGIN SELECT RAISE(ABORT, 'claims are locked'); END;",
            )?;
            Ok(())
        })
        .await
        .unwrap();

        h.economy.set_offline(true);
        let result = h.service.process_claim(claim.id).await.unwrap();
        assert_eq!(result, DeliveryOutcome::ItemsOnly { items: 1, money_owed: 30 });
        let stored = h.service.claims().get_claim(claim.id).await.unwrap().unwrap();
        assert_eq!(stored.items.len(), 1, "Rewrite was blocked");

        // Still offline: nothing is handed over, but the pending rewrite lands
        h.db.call(|conn| Ok(conn.execute_batch("DROP TRIGGER hold_claims")?))
            .await
            .unwrap();
        let result = h.service.process_claim(claim.id).await.unwrap();
        assert!(matches!(result, DeliveryOutcome::Deferred { .. }));
        assert_eq!(h.inventory.received(player.id).len(), 1, "Items are not handed over again");
        let stored = h.service.claims().get_claim(claim.id).await.unwrap().unwrap();
        assert!(stored.items.is_empty(), "Claim now owes only money");

        h.economy.set_offline(false);
        let result = h.service.process_claim(claim.id).await.unwrap();
        assert_eq!(result, DeliveryOutcome::Delivered { items: 0, money: 30 });
        assert_eq!(h.inventory.received(player.id).len(), 1);
        assert_eq!(h.economy.balance_of(player.id), 30);
    }

    #[tokio::test]
    async fn test_commit_waits_out_a_locked_database() {
        let h = harness(AuctionConfig::default());
        let seller = player("seller");
        let bidder = player("bidder");
        h.economy.set_balance(bidder.id, 100);
        let auction = h.service.create_auction(listing(&seller, None)).await.unwrap();

        h.db.call(|conn| {
            conn.execute_batch(
                "CREATE TRIGGER hold_auctions BEFORE UPDATE ON auctions \
                 BEGIN SELECT RAISE(ABORT, 'auctions are locked'); END;",
            )?;
            Ok(())
        })
        .await
        .unwrap();
        let release = h.db.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            release
                .call(|conn| Ok(conn.execute_batch("DROP TRIGGER hold_auctions")?))
                .await
                .unwrap();
        });

        let outcome = h.service.place_bid(auction.id(), bidder.clone(), 15).await.unwrap();
        assert_eq!(outcome.auction.current_bid(), 15, "A later attempt commits the bid");
        assert_eq!(h.economy.balance_of(bidder.id), 85);
    }
}
