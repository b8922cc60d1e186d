//! Business-rule checks. Pure functions of current state plus intent.

use chrono::{DateTime, Utc};

use crate::config::AuctionConfig;
use crate::error::ValidationFailure;
use crate::types::{Auction, AuctionStatus, Cents, Listing, PlayerId};

/// Check a new listing. `active_count` is the seller's current ACTIVE auctions.
pub fn validate_listing(
    config: &AuctionConfig,
    listing: &Listing,
    active_count: usize,
) -> Result<(), ValidationFailure> {
    if config.is_blacklisted(&listing.category) {
        return Err(ValidationFailure::CategoryBlacklisted(listing.category.clone()));
    }
    if active_count >= config.max_active_per_player {
        return Err(ValidationFailure::TooManyActive {
            limit: config.max_active_per_player,
        });
    }
    if listing.start_price < config.min_start_price || listing.start_price > config.max_start_price {
        return Err(ValidationFailure::StartPriceOutOfRange {
            min: config.min_start_price,
            max: config.max_start_price,
        });
    }
    if let Some(buy_now) = listing.buy_now_price {
        if buy_now <= listing.start_price {
            return Err(ValidationFailure::BuyNowNotAboveStart);
        }
    }
    if listing.duration < config.min_duration || listing.duration > config.max_duration {
        return Err(ValidationFailure::DurationOutOfRange {
            min_secs: config.min_duration.as_secs(),
            max_secs: config.max_duration.as_secs(),
        });
    }
    Ok(())
}

pub fn validate_bid(
    config: &AuctionConfig,
    auction: &Auction,
    bidder: PlayerId,
    amount: Cents,
    now: DateTime<Utc>,
) -> Result<(), ValidationFailure> {
    if bidder == auction.seller().id {
        return Err(ValidationFailure::SelfBid);
    }
    if !auction.is_active(now) {
        return Err(ValidationFailure::NotActive);
    }
    let minimum = auction.minimum_next_bid(config.min_bid_increment);
    if amount < minimum {
        return Err(ValidationFailure::BidTooLow { minimum });
    }
    Ok(())
}

/// Returns the price the buyer pays.
pub fn validate_buy_now(
    auction: &Auction,
    buyer: PlayerId,
    now: DateTime<Utc>,
) -> Result<Cents, ValidationFailure> {
    let price = auction.buy_now_price().ok_or(ValidationFailure::NoBuyNow)?;
    if buyer == auction.seller().id {
        return Err(ValidationFailure::SelfBid);
    }
    if !auction.is_active(now) {
        return Err(ValidationFailure::NotActive);
    }
    Ok(price)
}

/// Admins may cancel any ACTIVE auction regardless of the feature flag.
pub fn validate_cancel(
    config: &AuctionConfig,
    auction: &Auction,
    canceller: PlayerId,
    is_admin: bool,
) -> Result<(), ValidationFailure> {
    if auction.status() != AuctionStatus::Active {
        return Err(ValidationFailure::NotActive);
    }
    if is_admin {
        return Ok(());
    }
    if !config.cancellation_enabled {
        return Err(ValidationFailure::CancellationDisabled);
    }
    if canceller != auction.seller().id {
        return Err(ValidationFailure::NotSeller);
    }
    Ok(())
}
