//! Database schema creation.

use rusqlite::{Connection, Result};

/// Create all database tables and indexes.
pub fn create_tables(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "foreign_keys", "ON")?;

    // Auctions: one row per listing, status drives everything
    conn.execute(
        "CREATE TABLE IF NOT EXISTS auctions (
            id TEXT PRIMARY KEY NOT NULL,
            seller_id TEXT NOT NULL,
            seller_name TEXT NOT NULL,
            item TEXT NOT NULL,
            category TEXT NOT NULL,
            start_price INTEGER NOT NULL,
            current_bid INTEGER NOT NULL,
            buy_now_price INTEGER,
            bidder_id TEXT,
            bidder_name TEXT,
            created_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL,
            duration_secs INTEGER NOT NULL,
            status TEXT NOT NULL,
            claimed INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;

    // Bids: append-only history, `seq` preserves insertion order
    conn.execute(
        "CREATE TABLE IF NOT EXISTS bids (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT UNIQUE NOT NULL,
            auction_id TEXT NOT NULL,
            bidder_id TEXT NOT NULL,
            bidder_name TEXT NOT NULL,
            amount INTEGER NOT NULL,
            placed_at INTEGER NOT NULL,
            FOREIGN KEY (auction_id) REFERENCES auctions(id)
        )",
        [],
    )?;

    // Claims: pending settlements per recipient; items as a JSON array
    conn.execute(
        "CREATE TABLE IF NOT EXISTS claims (
            id TEXT PRIMARY KEY NOT NULL,
            player_id TEXT NOT NULL,
            player_name TEXT NOT NULL,
            items TEXT NOT NULL,
            money INTEGER NOT NULL,
            reason TEXT NOT NULL,
            auction_id TEXT,
            created_at INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_auctions_status_expires ON auctions(status, expires_at)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_auctions_seller ON auctions(seller_id, status)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_auctions_category ON auctions(category)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_bids_auction ON bids(auction_id, seq)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_bids_bidder ON bids(bidder_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_claims_player ON claims(player_id, created_at)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_claims_auction ON claims(auction_id)",
        [],
    )?;

    Ok(())
}
