//! Engine configuration.
//!
//! This module contains the business-rule limits and scheduler intervals,
//! their defaults, and environment variable parsing.

use std::path::PathBuf;
use std::time::Duration;

use crate::types::Cents;

/// Default cap on simultaneously ACTIVE auctions per seller
pub const DEFAULT_MAX_ACTIVE_PER_PLAYER: usize = 5;

/// Default minimum start price in cents
pub const DEFAULT_MIN_START_PRICE: Cents = 1;

/// Default maximum start price in cents
pub const DEFAULT_MAX_START_PRICE: Cents = 1_000_000_000;

/// Default minimum auction duration (5 minutes)
pub const DEFAULT_MIN_DURATION_SECS: u64 = 5 * 60;

/// Default maximum auction duration (7 days)
pub const DEFAULT_MAX_DURATION_SECS: u64 = 7 * 24 * 60 * 60;

/// Default minimum amount a bid must beat the current bid by
pub const DEFAULT_MIN_BID_INCREMENT: Cents = 1;

/// Attempts made to persist a claim before giving up
pub const DEFAULT_ADD_CLAIM_RETRIES: u32 = 3;

/// Expiration sweep interval
pub const DEFAULT_EXPIRATION_INTERVAL_SECS: u64 = 30;

/// Cache reload interval (5 minutes)
pub const DEFAULT_CACHE_RELOAD_INTERVAL_SECS: u64 = 5 * 60;

/// Backup interval (1 hour)
pub const DEFAULT_BACKUP_INTERVAL_SECS: u64 = 60 * 60;

/// Cleanup interval (daily)
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 24 * 60 * 60;

/// Number of backup snapshots kept on disk
pub const DEFAULT_BACKUP_KEEP: usize = 24;

/// How long settled auctions are kept before cleanup (7 days)
pub const DEFAULT_RETENTION_SECS: u64 = 7 * 24 * 60 * 60;

/// Backup snapshot format version
pub const BACKUP_FORMAT_VERSION: u32 = 1;

/// Business rules applied by the auction service.
#[derive(Debug, Clone)]
pub struct AuctionConfig {
    /// Maximum number of ACTIVE auctions a single seller may hold
    pub max_active_per_player: usize,

    pub min_start_price: Cents,
    pub max_start_price: Cents,

    pub min_duration: Duration,
    pub max_duration: Duration,

    /// A bid must reach `current_bid + min_bid_increment`
    pub min_bid_increment: Cents,

    /// Categories that cannot be listed (compared case-insensitively)
    pub category_blacklist: Vec<String>,

    /// Whether sellers may cancel their own auctions
    pub cancellation_enabled: bool,

    /// Fee debited from a seller who cancels (0 = free). Admins never pay.
    pub cancellation_fee: Cents,

    /// Attempts to persist a settlement or claim before surfacing the error
    pub add_claim_retries: u32,
}

impl Default for AuctionConfig {
    fn default() -> Self {
        Self {
            max_active_per_player: DEFAULT_MAX_ACTIVE_PER_PLAYER,
            min_start_price: DEFAULT_MIN_START_PRICE,
            max_start_price: DEFAULT_MAX_START_PRICE,
            min_duration: Duration::from_secs(DEFAULT_MIN_DURATION_SECS),
            max_duration: Duration::from_secs(DEFAULT_MAX_DURATION_SECS),
            min_bid_increment: DEFAULT_MIN_BID_INCREMENT,
            category_blacklist: Vec::new(),
            cancellation_enabled: true,
            cancellation_fee: 0,
            add_claim_retries: DEFAULT_ADD_CLAIM_RETRIES,
        }
    }
}

impl AuctionConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_active_per_player: env_parse("AUCTION_MAX_ACTIVE_PER_PLAYER", d.max_active_per_player),
            min_start_price: env_parse("AUCTION_MIN_START_PRICE", d.min_start_price),
            max_start_price: env_parse("AUCTION_MAX_START_PRICE", d.max_start_price),
            min_duration: env_secs("AUCTION_MIN_DURATION_SECS", d.min_duration),
            max_duration: env_secs("AUCTION_MAX_DURATION_SECS", d.max_duration),
            min_bid_increment: env_parse("AUCTION_MIN_BID_INCREMENT", d.min_bid_increment),
            category_blacklist: std::env::var("AUCTION_CATEGORY_BLACKLIST")
                .map(|v| parse_list(&v))
                .unwrap_or(d.category_blacklist),
            cancellation_enabled: env_flag("AUCTION_CANCELLATION_ENABLED", d.cancellation_enabled),
            cancellation_fee: env_parse("AUCTION_CANCELLATION_FEE", d.cancellation_fee),
            add_claim_retries: env_parse("AUCTION_ADD_CLAIM_RETRIES", d.add_claim_retries).max(1),
        }
    }

    pub fn is_blacklisted(&self, category: &str) -> bool {
        self.category_blacklist
            .iter()
            .any(|c| c.eq_ignore_ascii_case(category))
    }
}

/// Intervals and retention for the periodic tasks.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub expiration_interval: Duration,
    pub cache_reload_interval: Duration,
    pub backup_interval: Duration,
    pub cleanup_interval: Duration,

    pub backup_enabled: bool,
    pub backup_dir: PathBuf,
    /// Snapshots kept after rotation
    pub backup_keep: usize,

    /// Age past expiry after which EXPIRED/CLAIMED auctions are deleted
    pub retention: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            expiration_interval: Duration::from_secs(DEFAULT_EXPIRATION_INTERVAL_SECS),
            cache_reload_interval: Duration::from_secs(DEFAULT_CACHE_RELOAD_INTERVAL_SECS),
            backup_interval: Duration::from_secs(DEFAULT_BACKUP_INTERVAL_SECS),
            cleanup_interval: Duration::from_secs(DEFAULT_CLEANUP_INTERVAL_SECS),
            backup_enabled: true,
            backup_dir: PathBuf::from("backups"),
            backup_keep: DEFAULT_BACKUP_KEEP,
            retention: Duration::from_secs(DEFAULT_RETENTION_SECS),
        }
    }
}

impl SchedulerConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            expiration_interval: env_secs("SCHEDULER_EXPIRATION_INTERVAL_SECS", d.expiration_interval),
            cache_reload_interval: env_secs("SCHEDULER_CACHE_RELOAD_INTERVAL_SECS", d.cache_reload_interval),
            backup_interval: env_secs("SCHEDULER_BACKUP_INTERVAL_SECS", d.backup_interval),
            cleanup_interval: env_secs("SCHEDULER_CLEANUP_INTERVAL_SECS", d.cleanup_interval),
            backup_enabled: env_flag("SCHEDULER_BACKUP_ENABLED", d.backup_enabled),
            backup_dir: std::env::var("SCHEDULER_BACKUP_DIR")
                .map(PathBuf::from)
                .unwrap_or(d.backup_dir),
            backup_keep: env_parse("SCHEDULER_BACKUP_KEEP", d.backup_keep).max(1),
            retention: env_secs("SCHEDULER_RETENTION_SECS", d.retention),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(default)
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list_skips_blanks() {
        assert_eq!(parse_list("tnt, bedrock,, "), vec!["tnt", "bedrock"]);
        assert!(parse_list("").is_empty());
    }

    #[test]
    fn test_blacklist_is_case_insensitive() {
        let config = AuctionConfig {
            category_blacklist: vec!["Bedrock".to_string()],
            ..AuctionConfig::default()
        };
        assert!(config.is_blacklisted("bedrock"));
        assert!(config.is_blacklisted("BEDROCK"));
        assert!(!config.is_blacklisted("dirt"));
    }

    #[test]
    fn test_defaults_are_consistent() {
        let config = AuctionConfig::default();
        assert!(config.min_start_price <= config.max_start_price);
        assert!(config.min_duration <= config.max_duration);

        let sched = SchedulerConfig::default();
        assert!(sched.expiration_interval < sched.cache_reload_interval);
        assert!(sched.backup_keep > 0);
    }
}
