//! Core type definitions for the auction engine.
//!
//! This module provides the auction record and its status machine, the
//! immutable bid history entries, and the claims that carry items and money
//! between players.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TransitionError;

/// Records carry timestamps at the millisecond precision SQLite stores.
#[inline]
fn stamp(now: DateTime<Utc>) -> DateTime<Utc> {
    now.trunc_subsecs(3)
}

// === Identifiers & Money ===

/// Money in integer cents of the external economy's currency.
pub type Cents = u64;

/// Opaque player identity as handed to us by the host.
pub type PlayerId = Uuid;

/// Unique, immutable auction identifier generated at creation.
pub type AuctionId = Uuid;

/// Unique claim identifier.
pub type ClaimId = Uuid;

/// Serialized item. The engine never looks inside it except for free-text search.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemPayload(pub String);

impl ItemPayload {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A player as seen by the engine: identity plus display name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Participant {
    pub id: PlayerId,
    pub name: String,
}

impl Participant {
    pub fn new(id: PlayerId, name: impl Into<String>) -> Self {
        Self { id, name: name.into() }
    }
}

// === Auction Status ===

/// Lifecycle state of an auction.
///
/// ```text
/// ACTIVE ──bid──> ACTIVE
/// ACTIVE ──buy-now / expire with bidder──> SOLD
/// ACTIVE ──expire without bidder──> EXPIRED
/// ACTIVE ──cancel──> CANCELLED
/// SOLD | EXPIRED | CANCELLED ──claims drained──> CLAIMED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuctionStatus {
    Active,
    Sold,
    Expired,
    Cancelled,
    Claimed,
}

impl AuctionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuctionStatus::Active => "ACTIVE",
            AuctionStatus::Sold => "SOLD",
            AuctionStatus::Expired => "EXPIRED",
            AuctionStatus::Cancelled => "CANCELLED",
            AuctionStatus::Claimed => "CLAIMED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(AuctionStatus::Active),
            "SOLD" => Some(AuctionStatus::Sold),
            "EXPIRED" => Some(AuctionStatus::Expired),
            "CANCELLED" => Some(AuctionStatus::Cancelled),
            "CLAIMED" => Some(AuctionStatus::Claimed),
            _ => None,
        }
    }

    /// Settled but not yet fully paid out.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            AuctionStatus::Sold | AuctionStatus::Expired | AuctionStatus::Cancelled
        )
    }

    /// The transition table. Everything not listed here is illegal.
    pub fn can_transition_to(self, next: AuctionStatus) -> bool {
        match (self, next) {
            (AuctionStatus::Active, AuctionStatus::Sold)
            | (AuctionStatus::Active, AuctionStatus::Expired)
            | (AuctionStatus::Active, AuctionStatus::Cancelled) => true,
            (from, AuctionStatus::Claimed) => from.is_settled(),
            _ => false,
        }
    }
}

impl std::fmt::Display for AuctionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// === Bids ===

/// An accepted bid. Never updated or removed on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bid {
    pub id: Uuid,
    pub auction_id: AuctionId,
    pub bidder: Participant,
    pub amount: Cents,
    pub placed_at: DateTime<Utc>,
}

impl Bid {
    pub fn new(auction_id: AuctionId, bidder: Participant, amount: Cents, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            auction_id,
            bidder,
            amount,
            placed_at: stamp(now),
        }
    }
}

// === Claims ===

/// Why a claim was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClaimReason {
    AuctionWon,
    OutbidRefund,
    AuctionSold,
    AuctionUnsold,
    AuctionCancelled,
}

impl ClaimReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClaimReason::AuctionWon => "AUCTION_WON",
            ClaimReason::OutbidRefund => "OUTBID_REFUND",
            ClaimReason::AuctionSold => "AUCTION_SOLD",
            ClaimReason::AuctionUnsold => "AUCTION_UNSOLD",
            ClaimReason::AuctionCancelled => "AUCTION_CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "AUCTION_WON" => Some(ClaimReason::AuctionWon),
            "OUTBID_REFUND" => Some(ClaimReason::OutbidRefund),
            "AUCTION_SOLD" => Some(ClaimReason::AuctionSold),
            "AUCTION_UNSOLD" => Some(ClaimReason::AuctionUnsold),
            "AUCTION_CANCELLED" => Some(ClaimReason::AuctionCancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for ClaimReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something owed to a player: items, money, or both.
///
/// A claim is the only way value moves between players. It is deleted once
/// its contents have been handed over, and never recreated for the same event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub id: ClaimId,
    pub recipient: Participant,
    pub items: Vec<ItemPayload>,
    pub money: Cents,
    pub reason: ClaimReason,
    /// Auction whose settlement produced this claim, if any.
    pub auction_id: Option<AuctionId>,
    pub created_at: DateTime<Utc>,
}

impl Claim {
    /// Claim for money only.
    pub fn money(
        recipient: Participant,
        amount: Cents,
        reason: ClaimReason,
        auction_id: Option<AuctionId>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            recipient,
            items: Vec::new(),
            money: amount,
            reason,
            auction_id,
            created_at: stamp(now),
        }
    }

    /// Claim for a single item.
    pub fn item(
        recipient: Participant,
        item: ItemPayload,
        reason: ClaimReason,
        auction_id: Option<AuctionId>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            recipient,
            items: vec![item],
            money: 0,
            reason,
            auction_id,
            created_at: stamp(now),
        }
    }
}

// === Auctions ===

/// A seller's intent to list an item.
#[derive(Debug, Clone)]
pub struct Listing {
    pub seller: Participant,
    pub item: ItemPayload,
    pub category: String,
    pub start_price: Cents,
    pub buy_now_price: Option<Cents>,
    pub duration: std::time::Duration,
}

/// The unit of sale.
///
/// State-bearing fields are only changed through [`Auction::apply_bid`] and
/// [`Auction::transition`], which keep the bid and status invariants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Auction {
    pub(crate) id: AuctionId,
    pub(crate) seller: Participant,
    pub(crate) item: ItemPayload,
    pub(crate) category: String,
    pub(crate) start_price: Cents,
    pub(crate) current_bid: Cents,
    pub(crate) buy_now_price: Option<Cents>,
    pub(crate) current_bidder: Option<Participant>,
    pub(crate) bid_history: Vec<Bid>,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) expires_at: DateTime<Utc>,
    pub(crate) duration_secs: u64,
    pub(crate) status: AuctionStatus,
    pub(crate) claimed: bool,
}

impl Auction {
    /// Open a new ACTIVE auction from a listing.
    pub fn open(listing: Listing, now: DateTime<Utc>) -> Self {
        let now = stamp(now);
        let duration_secs = listing.duration.as_secs();
        Self {
            id: Uuid::new_v4(),
            seller: listing.seller,
            item: listing.item,
            category: listing.category,
            start_price: listing.start_price,
            current_bid: listing.start_price,
            buy_now_price: listing.buy_now_price,
            current_bidder: None,
            bid_history: Vec::new(),
            created_at: now,
            expires_at: now + chrono::Duration::seconds(duration_secs as i64),
            duration_secs,
            status: AuctionStatus::Active,
            claimed: false,
        }
    }

    pub fn id(&self) -> AuctionId {
        self.id
    }

    pub fn seller(&self) -> &Participant {
        &self.seller
    }

    pub fn item(&self) -> &ItemPayload {
        &self.item
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn start_price(&self) -> Cents {
        self.start_price
    }

    pub fn current_bid(&self) -> Cents {
        self.current_bid
    }

    pub fn buy_now_price(&self) -> Option<Cents> {
        self.buy_now_price
    }

    pub fn current_bidder(&self) -> Option<&Participant> {
        self.current_bidder.as_ref()
    }

    pub fn bid_history(&self) -> &[Bid] {
        &self.bid_history
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.duration_secs)
    }

    pub fn status(&self) -> AuctionStatus {
        self.status
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed
    }

    /// The clock has run out. Independent of status.
    #[inline]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Accepts bids: ACTIVE and not yet expired.
    #[inline]
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.status == AuctionStatus::Active && !self.is_expired(now)
    }

    /// Lowest amount the next bid must reach.
    pub fn minimum_next_bid(&self, increment: Cents) -> Cents {
        self.current_bid.saturating_add(increment)
    }

    /// Make `bid` the leading bid and append it to the history.
    ///
    /// Returns the displaced leader together with the amount they had bid.
    pub fn apply_bid(&mut self, bid: Bid) -> Result<Option<(Participant, Cents)>, TransitionError> {
        if self.status != AuctionStatus::Active {
            return Err(TransitionError::NotActive { status: self.status });
        }
        if bid.amount <= self.current_bid {
            return Err(TransitionError::NotHigher {
                amount: bid.amount,
                current: self.current_bid,
            });
        }

        let previous_amount = self.current_bid;
        let displaced = self
            .current_bidder
            .replace(bid.bidder.clone())
            .map(|p| (p, previous_amount));
        self.current_bid = bid.amount;
        self.bid_history.push(bid);
        Ok(displaced)
    }

    /// Close the auction as bought outright at `price`.
    ///
    /// The buyer becomes the recorded winner. Buy-now is not a bid, so the
    /// history is untouched and `current_bid` never goes down.
    pub fn record_sale(&mut self, buyer: Participant, price: Cents) -> Result<(), TransitionError> {
        self.transition(AuctionStatus::Sold)?;
        self.current_bidder = Some(buyer);
        self.current_bid = self.current_bid.max(price);
        Ok(())
    }

    /// Move to `next`, rejecting anything outside the transition table.
    pub fn transition(&mut self, next: AuctionStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError::Illegal { from: self.status, to: next });
        }
        self.status = next;
        if next == AuctionStatus::Claimed {
            self.claimed = true;
        }
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
