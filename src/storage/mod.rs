//! SQLite persistence for auctions, bids and claims.
//!
//! A single connection lives on a dedicated thread; async callers reach it
//! through [`Database::call`] and never block on disk I/O.

pub mod database;
pub mod queries;
pub mod schema;
pub mod types;

pub use database::Database;
pub use types::{AuctionFilter, RestoreCounts, Settlement, SortOrder};
