//! Error taxonomy for the engine.
//!
//! Persistence and collaborator failures are infrastructure errors the caller
//! may retry. Validation failures are business-rule rejections with a
//! specific message and no state change.

use thiserror::Error;

use crate::types::{AuctionStatus, Cents};

/// Persistence Port failure. The operation that hit it did not happen.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("storage thread is not running")]
    Closed,

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Failure reported by the Economy or Inventory collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortError {
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),

    #[error("insufficient funds: balance {balance}, needed {needed}")]
    InsufficientFunds { balance: Cents, needed: Cents },

    #[error("inventory full: {free} free slots, {needed} needed")]
    InventoryFull { free: usize, needed: usize },
}

/// Illegal change requested on an auction record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("illegal status transition {from} -> {to}")]
    Illegal { from: AuctionStatus, to: AuctionStatus },

    #[error("auction is {status}, not accepting bids")]
    NotActive { status: AuctionStatus },

    #[error("bid {amount} does not beat current bid {current}")]
    NotHigher { amount: Cents, current: Cents },
}

/// Business-rule rejection. Carries enough detail for a specific message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationFailure {
    #[error("bid too low: minimum is {minimum}")]
    BidTooLow { minimum: Cents },

    #[error("you cannot bid on your own auction")]
    SelfBid,

    #[error("this auction is no longer active")]
    NotActive,

    #[error("items in category '{0}' cannot be auctioned")]
    CategoryBlacklisted(String),

    #[error("you already have {limit} active auctions")]
    TooManyActive { limit: usize },

    #[error("start price must be between {min} and {max}")]
    StartPriceOutOfRange { min: Cents, max: Cents },

    #[error("buy-now price must be above the start price")]
    BuyNowNotAboveStart,

    #[error("duration must be between {min_secs}s and {max_secs}s")]
    DurationOutOfRange { min_secs: u64, max_secs: u64 },

    #[error("this auction has no buy-now price")]
    NoBuyNow,

    #[error("cancelling auctions is disabled")]
    CancellationDisabled,

    #[error("only the seller can do that")]
    NotSeller,

    #[error("this auction has not ended yet")]
    NotExpired,
}

impl ValidationFailure {
    /// Stable tag for logs and callers that switch on the reason.
    pub fn code(&self) -> &'static str {
        match self {
            ValidationFailure::BidTooLow { .. } => "BID_TOO_LOW",
            ValidationFailure::SelfBid => "SELF_BID",
            ValidationFailure::NotActive => "NOT_ACTIVE",
            ValidationFailure::CategoryBlacklisted(_) => "CATEGORY_BLACKLISTED",
            ValidationFailure::TooManyActive { .. } => "TOO_MANY_ACTIVE",
            ValidationFailure::StartPriceOutOfRange { .. } => "START_PRICE_OUT_OF_RANGE",
            ValidationFailure::BuyNowNotAboveStart => "BUY_NOW_NOT_ABOVE_START",
            ValidationFailure::DurationOutOfRange { .. } => "DURATION_OUT_OF_RANGE",
            ValidationFailure::NoBuyNow => "NO_BUY_NOW",
            ValidationFailure::CancellationDisabled => "CANCELLATION_DISABLED",
            ValidationFailure::NotSeller => "NOT_SELLER",
            ValidationFailure::NotExpired => "NOT_EXPIRED",
        }
    }
}

/// Failure of an Auction Service entry point.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("rejected: {0}")]
    Validation(#[from] ValidationFailure),

    #[error("persistence failure: {0}")]
    Persistence(#[from] StorageError),

    #[error("economy unavailable: {0}")]
    EconomyUnavailable(String),

    #[error("insufficient funds: balance {balance}, needed {needed}")]
    InsufficientFunds { balance: Cents, needed: Cents },

    #[error("not found: {0}")]
    NotFound(String),
}

impl ServiceError {
    /// Text to show the player. Infrastructure failures stay generic.
    pub fn user_message(&self) -> String {
        match self {
            ServiceError::Validation(v) => v.to_string(),
            ServiceError::InsufficientFunds { needed, .. } => {
                format!("You need {} to do that.", needed)
            }
            ServiceError::NotFound(what) => format!("{} no longer exists.", what),
            ServiceError::Persistence(_) | ServiceError::EconomyUnavailable(_) => {
                "Something went wrong, please try again.".to_string()
            }
        }
    }

    /// True for failures where retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ServiceError::Persistence(_) | ServiceError::EconomyUnavailable(_)
        )
    }
}

impl From<PortError> for ServiceError {
    fn from(e: PortError) -> Self {
        match e {
            PortError::InsufficientFunds { balance, needed } => {
                ServiceError::InsufficientFunds { balance, needed }
            }
            other => ServiceError::EconomyUnavailable(other.to_string()),
        }
    }
}

/// Result type alias for service entry points.
pub type ServiceResult<T> = Result<T, ServiceError>;
