//! Query and write-unit types for the persistence layer.

use crate::types::{Auction, AuctionStatus, Cents, Claim, PlayerId};

/// Result ordering for auction queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Newest,
    Oldest,
    PriceAsc,
    PriceDesc,
    EndingSoon,
}

impl SortOrder {
    pub(crate) fn sql(&self) -> &'static str {
        match self {
            SortOrder::Newest => "created_at DESC, id",
            SortOrder::Oldest => "created_at ASC, id",
            SortOrder::PriceAsc => "current_bid ASC, created_at DESC",
            SortOrder::PriceDesc => "current_bid DESC, created_at DESC",
            SortOrder::EndingSoon => "expires_at ASC, id",
        }
    }
}

/// Filter for [`crate::store::AuctionStore::query`]. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct AuctionFilter {
    pub category: Option<String>,
    pub status: Option<AuctionStatus>,
    pub seller: Option<PlayerId>,
    /// Auctions this player has bid on at any point
    pub bidder: Option<PlayerId>,
    /// Inclusive bounds on `current_bid`
    pub min_price: Option<Cents>,
    pub max_price: Option<Cents>,
    /// Case-insensitive substring of the item payload
    pub search: Option<String>,
    pub sort: SortOrder,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl AuctionFilter {
    pub fn active() -> Self {
        Self {
            status: Some(AuctionStatus::Active),
            ..Self::default()
        }
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn seller(mut self, seller: PlayerId) -> Self {
        self.seller = Some(seller);
        self
    }

    pub fn bidder(mut self, bidder: PlayerId) -> Self {
        self.bidder = Some(bidder);
        self
    }

    pub fn price_range(mut self, min: Option<Cents>, max: Option<Cents>) -> Self {
        self.min_price = min;
        self.max_price = max;
        self
    }

    pub fn search(mut self, text: impl Into<String>) -> Self {
        self.search = Some(text.into());
        self
    }

    pub fn sort(mut self, sort: SortOrder) -> Self {
        self.sort = sort;
        self
    }

    pub fn page(mut self, limit: usize, offset: usize) -> Self {
        self.limit = Some(limit);
        self.offset = offset;
        self
    }
}

/// Everything one settlement writes, committed in a single transaction:
/// the auction (with any newly appended bids) and the claims it produced.
#[derive(Debug, Clone)]
pub struct Settlement {
    pub auction: Auction,
    pub claims: Vec<Claim>,
}

/// Counts returned by a backup restore.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreCounts {
    pub auctions: usize,
    pub bids: usize,
    pub claims: usize,
}
