//! Auction house maintenance daemon.
//!
//! Runs the background tasks (expiration, cache reload, backups, cleanup)
//! against an auction database. Players are served by the host that embeds
//! the library; this process has no economy or inventory attached, so claim
//! delivery is left to that host.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use auction_house::backup::BackupService;
use auction_house::claims::ClaimsLedger;
use auction_house::config::{AuctionConfig, SchedulerConfig};
use auction_house::ports::Detached;
use auction_house::scheduler::Scheduler;
use auction_house::service::AuctionService;
use auction_house::storage::Database;
use auction_house::store::AuctionStore;
use auction_house::telemetry;

/// Default SQLite file when AUCTION_DB_PATH is not set
const DEFAULT_DB_PATH: &str = "auctions.db";

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let log_dir = std::env::var("AUCTION_LOG_DIR").unwrap_or_else(|_| ".".to_string());
    let _guard = telemetry::init_tracing(&log_dir)?;

    let db_path = std::env::var("AUCTION_DB_PATH").unwrap_or_else(|_| DEFAULT_DB_PATH.to_string());
    let auction_config = AuctionConfig::from_env();
    let scheduler_config = SchedulerConfig::from_env();

    info!("🏛️ Auction house daemon starting");
    info!("   Database: {}", db_path);
    info!(
        "   Expiration sweep: every {}s | Cache reload: every {}s",
        scheduler_config.expiration_interval.as_secs(),
        scheduler_config.cache_reload_interval.as_secs()
    );
    if scheduler_config.backup_enabled {
        info!(
            "   Backups: every {}s into {} (keeping {})",
            scheduler_config.backup_interval.as_secs(),
            scheduler_config.backup_dir.display(),
            scheduler_config.backup_keep
        );
    } else {
        info!("   Backups: disabled");
    }

    let db = Database::open(&db_path).with_context(|| format!("Failed to open {}", db_path))?;
    let store = Arc::new(AuctionStore::new(db.clone()));
    let claims = Arc::new(ClaimsLedger::new(db.clone(), auction_config.add_claim_retries));
    let service = Arc::new(AuctionService::new(
        store.clone(),
        claims,
        Arc::new(Detached),
        Arc::new(Detached),
        auction_config,
    ));

    if let Ok(backup_path) = std::env::var("RESTORE_BACKUP") {
        let backups = BackupService::new(
            store.clone(),
            scheduler_config.backup_dir.clone(),
            scheduler_config.backup_keep,
        );
        let counts = backups.restore(&backup_path).await?;
        info!(
            "[BACKUP] Restored {} auctions and {} claims from {}",
            counts.auctions, counts.claims, backup_path
        );
    }

    let cached = store.reload_cache().await.context("Initial cache load failed")?;
    info!("[STORE] {} active auctions loaded", cached);

    let handle = Scheduler::new(service, scheduler_config).start();
    info!("✅ Scheduler running - press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("🛑 Shutting down...");
    handle.shutdown().await;
    db.shutdown();
    info!("👋 Auction house daemon stopped");

    Ok(())
}
