//! Auction House Settlement Engine
//!
//! An embeddable engine for timed, bid-based item auctions. Sellers list
//! items, bidders compete, and every transfer of money or items between
//! players goes through a durable claims ledger so that offline players are
//! paid out when they return.
//!
//! ## Architecture
//!
//! - **Auction store** over SQLite with a cache of ACTIVE auctions
//! - **Auction service** serializing every mutation per auction id
//! - **Claims ledger** delivered through the economy and inventory ports
//! - **Scheduler** for expiration, cache reload, backups and cleanup

pub mod backup;
pub mod claims;
pub mod config;
pub mod error;
pub mod lock;
pub mod ports;
pub mod scheduler;
pub mod service;
pub mod storage;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod validation;

pub use error::{PortError, ServiceError, ServiceResult, StorageError, ValidationFailure};
pub use service::{AuctionService, BidOutcome, DeliveryOutcome, DrainReport, SettlementOutcome};
pub use types::{
    Auction, AuctionId, AuctionStatus, Bid, Cents, Claim, ClaimId, ClaimReason, ItemPayload,
    Listing, Participant, PlayerId,
};
