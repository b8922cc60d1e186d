//! Row mapping and SQL for auctions, bids and claims.
//!
//! Every function here runs on the storage thread against a borrowed
//! connection or transaction. Multi-row writes that must be atomic take
//! `&mut Connection` and open their own transaction.

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::types::{AuctionFilter, Settlement};
use crate::error::StorageError;
use crate::types::{
    Auction, AuctionId, AuctionStatus, Bid, Cents, Claim, ClaimId, ClaimReason, ItemPayload,
    Participant, PlayerId,
};

const AUCTION_COLUMNS: &str = "id, seller_id, seller_name, item, category, start_price, current_bid, \
     buy_now_price, bidder_id, bidder_name, created_at, expires_at, duration_secs, status, claimed";

const BID_COLUMNS: &str = "id, auction_id, bidder_id, bidder_name, amount, placed_at";

const CLAIM_COLUMNS: &str = "id, player_id, player_name, items, money, reason, auction_id, created_at";

// =============================================================================
// CONVERSIONS
// =============================================================================

fn millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, StorageError> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| StorageError::Corrupt(format!("timestamp out of range: {}", ms)))
}

fn uuid(s: &str) -> Result<Uuid, StorageError> {
    Uuid::parse_str(s).map_err(|e| StorageError::Corrupt(format!("bad uuid '{}': {}", s, e)))
}

fn to_sql_cents(c: Cents) -> i64 {
    i64::try_from(c).unwrap_or(i64::MAX)
}

fn from_sql_cents(v: i64) -> Cents {
    v.max(0) as Cents
}

/// Escape `%`, `_` and `\` for a LIKE pattern using `ESCAPE '\'`.
fn escape_like(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

struct AuctionRow {
    id: String,
    seller_id: String,
    seller_name: String,
    item: String,
    category: String,
    start_price: i64,
    current_bid: i64,
    buy_now_price: Option<i64>,
    bidder_id: Option<String>,
    bidder_name: Option<String>,
    created_at: i64,
    expires_at: i64,
    duration_secs: i64,
    status: String,
    claimed: bool,
}

fn read_auction_row(row: &Row) -> rusqlite::Result<AuctionRow> {
    Ok(AuctionRow {
        id: row.get(0)?,
        seller_id: row.get(1)?,
        seller_name: row.get(2)?,
        item: row.get(3)?,
        category: row.get(4)?,
        start_price: row.get(5)?,
        current_bid: row.get(6)?,
        buy_now_price: row.get(7)?,
        bidder_id: row.get(8)?,
        bidder_name: row.get(9)?,
        created_at: row.get(10)?,
        expires_at: row.get(11)?,
        duration_secs: row.get(12)?,
        status: row.get(13)?,
        claimed: row.get(14)?,
    })
}

impl AuctionRow {
    fn into_auction(self, bid_history: Vec<Bid>) -> Result<Auction, StorageError> {
        let status = AuctionStatus::parse(&self.status)
            .ok_or_else(|| StorageError::Corrupt(format!("unknown status '{}'", self.status)))?;
        let current_bidder = match (self.bidder_id, self.bidder_name) {
            (Some(id), Some(name)) => Some(Participant::new(uuid(&id)?, name)),
            _ => None,
        };
        Ok(Auction {
            id: uuid(&self.id)?,
            seller: Participant::new(uuid(&self.seller_id)?, self.seller_name),
            item: ItemPayload(self.item),
            category: self.category,
            start_price: from_sql_cents(self.start_price),
            current_bid: from_sql_cents(self.current_bid),
            buy_now_price: self.buy_now_price.map(from_sql_cents),
            current_bidder,
            bid_history,
            created_at: from_millis(self.created_at)?,
            expires_at: from_millis(self.expires_at)?,
            duration_secs: self.duration_secs.max(0) as u64,
            status,
            claimed: self.claimed,
        })
    }
}

struct BidRow {
    id: String,
    auction_id: String,
    bidder_id: String,
    bidder_name: String,
    amount: i64,
    placed_at: i64,
}

fn read_bid_row(row: &Row) -> rusqlite::Result<BidRow> {
    Ok(BidRow {
        id: row.get(0)?,
        auction_id: row.get(1)?,
        bidder_id: row.get(2)?,
        bidder_name: row.get(3)?,
        amount: row.get(4)?,
        placed_at: row.get(5)?,
    })
}

impl BidRow {
    fn into_bid(self) -> Result<Bid, StorageError> {
        Ok(Bid {
            id: uuid(&self.id)?,
            auction_id: uuid(&self.auction_id)?,
            bidder: Participant::new(uuid(&self.bidder_id)?, self.bidder_name),
            amount: from_sql_cents(self.amount),
            placed_at: from_millis(self.placed_at)?,
        })
    }
}

struct ClaimRow {
    id: String,
    player_id: String,
    player_name: String,
    items: String,
    money: i64,
    reason: String,
    auction_id: Option<String>,
    created_at: i64,
}

fn read_claim_row(row: &Row) -> rusqlite::Result<ClaimRow> {
    Ok(ClaimRow {
        id: row.get(0)?,
        player_id: row.get(1)?,
        player_name: row.get(2)?,
        items: row.get(3)?,
        money: row.get(4)?,
        reason: row.get(5)?,
        auction_id: row.get(6)?,
        created_at: row.get(7)?,
    })
}

impl ClaimRow {
    fn into_claim(self) -> Result<Claim, StorageError> {
        let items: Vec<ItemPayload> = serde_json::from_str(&self.items)
            .map_err(|e| StorageError::Corrupt(format!("claim {} items: {}", self.id, e)))?;
        let reason = ClaimReason::parse(&self.reason)
            .ok_or_else(|| StorageError::Corrupt(format!("unknown claim reason '{}'", self.reason)))?;
        Ok(Claim {
            id: uuid(&self.id)?,
            recipient: Participant::new(uuid(&self.player_id)?, self.player_name),
            items,
            money: from_sql_cents(self.money),
            reason,
            auction_id: self.auction_id.as_deref().map(uuid).transpose()?,
            created_at: from_millis(self.created_at)?,
        })
    }
}

// =============================================================================
// AUCTIONS
// =============================================================================

fn insert_auction_row(conn: &Connection, auction: &Auction) -> Result<(), StorageError> {
    conn.execute(
        &format!(
            "INSERT INTO auctions ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            AUCTION_COLUMNS
        ),
        params![
            auction.id.to_string(),
            auction.seller.id.to_string(),
            auction.seller.name,
            auction.item.0,
            auction.category,
            to_sql_cents(auction.start_price),
            to_sql_cents(auction.current_bid),
            auction.buy_now_price.map(to_sql_cents),
            auction.current_bidder.as_ref().map(|b| b.id.to_string()),
            auction.current_bidder.as_ref().map(|b| b.name.clone()),
            millis(auction.created_at),
            millis(auction.expires_at),
            auction.duration_secs as i64,
            auction.status.as_str(),
            auction.claimed,
        ],
    )?;
    insert_bids(conn, &auction.bid_history)?;
    Ok(())
}

/// Insert a new auction together with its bid history.
pub fn insert_auction(conn: &mut Connection, auction: &Auction) -> Result<(), StorageError> {
    let tx = conn.transaction()?;
    insert_auction_row(&tx, auction)?;
    tx.commit()?;
    Ok(())
}

/// Replace the mutable columns of an existing auction and append any bids
/// not yet stored. Returns false if the auction does not exist.
fn update_auction_row(conn: &Connection, auction: &Auction) -> Result<bool, StorageError> {
    let changed = conn.execute(
        "UPDATE auctions SET seller_id = ?2, seller_name = ?3, item = ?4, category = ?5,
            start_price = ?6, current_bid = ?7, buy_now_price = ?8, bidder_id = ?9, bidder_name = ?10,
            created_at = ?11, expires_at = ?12, duration_secs = ?13, status = ?14, claimed = ?15
         WHERE id = ?1",
        params![
            auction.id.to_string(),
            auction.seller.id.to_string(),
            auction.seller.name,
            auction.item.0,
            auction.category,
            to_sql_cents(auction.start_price),
            to_sql_cents(auction.current_bid),
            auction.buy_now_price.map(to_sql_cents),
            auction.current_bidder.as_ref().map(|b| b.id.to_string()),
            auction.current_bidder.as_ref().map(|b| b.name.clone()),
            millis(auction.created_at),
            millis(auction.expires_at),
            auction.duration_secs as i64,
            auction.status.as_str(),
            auction.claimed,
        ],
    )?;
    if changed == 0 {
        return Ok(false);
    }
    insert_bids(conn, &auction.bid_history)?;
    Ok(true)
}

/// Full-record replace. Returns false if the auction does not exist.
pub fn update_auction(conn: &mut Connection, auction: &Auction) -> Result<bool, StorageError> {
    let tx = conn.transaction()?;
    let found = update_auction_row(&tx, auction)?;
    tx.commit()?;
    Ok(found)
}

/// Insert or replace an auction (used by restore). Returns bids written.
pub fn upsert_auction(conn: &Connection, auction: &Auction) -> Result<usize, StorageError> {
    let before: i64 = conn.query_row(
        "SELECT COUNT(*) FROM bids WHERE auction_id = ?1",
        [auction.id.to_string()],
        |row| row.get(0),
    )?;
    if !update_auction_row(conn, auction)? {
        insert_auction_row(conn, auction)?;
    }
    let after: i64 = conn.query_row(
        "SELECT COUNT(*) FROM bids WHERE auction_id = ?1",
        [auction.id.to_string()],
        |row| row.get(0),
    )?;
    Ok((after - before).max(0) as usize)
}

/// Append bids, skipping ids already present. Returns rows inserted.
fn insert_bids(conn: &Connection, bids: &[Bid]) -> Result<usize, StorageError> {
    let mut stmt = conn.prepare_cached(&format!(
        "INSERT OR IGNORE INTO bids ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        BID_COLUMNS
    ))?;
    let mut inserted = 0;
    for bid in bids {
        inserted += stmt.execute(params![
            bid.id.to_string(),
            bid.auction_id.to_string(),
            bid.bidder.id.to_string(),
            bid.bidder.name,
            to_sql_cents(bid.amount),
            millis(bid.placed_at),
        ])?;
    }
    Ok(inserted)
}

/// Bid history of one auction in insertion order.
pub fn select_bids(conn: &Connection, auction_id: AuctionId) -> Result<Vec<Bid>, StorageError> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM bids WHERE auction_id = ?1 ORDER BY seq",
        BID_COLUMNS
    ))?;
    let rows = stmt.query_map([auction_id.to_string()], read_bid_row)?;
    let bids = rows
        .map(|r| r.map_err(StorageError::from).and_then(BidRow::into_bid))
        .collect();
    bids
}

/// Every bid in the database, in insertion order.
pub fn select_all_bids(conn: &Connection) -> Result<Vec<Bid>, StorageError> {
    let mut stmt = conn.prepare(&format!("SELECT {} FROM bids ORDER BY seq", BID_COLUMNS))?;
    let rows = stmt.query_map([], read_bid_row)?;
    let bids = rows
        .map(|r| r.map_err(StorageError::from).and_then(BidRow::into_bid))
        .collect();
    bids
}

fn hydrate(conn: &Connection, rows: Vec<AuctionRow>) -> Result<Vec<Auction>, StorageError> {
    rows.into_iter()
        .map(|row| {
            let id = uuid(&row.id)?;
            row.into_auction(select_bids(conn, id)?)
        })
        .collect()
}

pub fn select_auction(conn: &Connection, id: AuctionId) -> Result<Option<Auction>, StorageError> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM auctions WHERE id = ?1", AUCTION_COLUMNS),
            [id.to_string()],
            read_auction_row,
        )
        .optional()?;
    match row {
        Some(row) => Ok(Some(row.into_auction(select_bids(conn, id)?)?)),
        None => Ok(None),
    }
}

/// Filtered, sorted, paginated auction query.
pub fn select_auctions(conn: &Connection, filter: &AuctionFilter) -> Result<Vec<Auction>, StorageError> {
    let mut sql = format!("SELECT {} FROM auctions WHERE 1 = 1", AUCTION_COLUMNS);
    let mut args: Vec<Value> = Vec::new();

    if let Some(category) = &filter.category {
        sql.push_str(" AND category = ?");
        args.push(Value::Text(category.clone()));
    }
    if let Some(status) = filter.status {
        sql.push_str(" AND status = ?");
        args.push(Value::Text(status.as_str().to_string()));
    }
    if let Some(seller) = filter.seller {
        sql.push_str(" AND seller_id = ?");
        args.push(Value::Text(seller.to_string()));
    }
    if let Some(bidder) = filter.bidder {
        sql.push_str(
            " AND EXISTS (SELECT 1 FROM bids WHERE bids.auction_id = auctions.id AND bids.bidder_id = ?)",
        );
        args.push(Value::Text(bidder.to_string()));
    }
    if let Some(min) = filter.min_price {
        sql.push_str(" AND current_bid >= ?");
        args.push(Value::Integer(to_sql_cents(min)));
    }
    if let Some(max) = filter.max_price {
        sql.push_str(" AND current_bid <= ?");
        args.push(Value::Integer(to_sql_cents(max)));
    }
    if let Some(text) = filter.search.as_deref().filter(|t| !t.is_empty()) {
        sql.push_str(" AND item LIKE ? ESCAPE '\\'");
        args.push(Value::Text(format!("%{}%", escape_like(text))));
    }

    sql.push_str(" ORDER BY ");
    sql.push_str(filter.sort.sql());

    match filter.limit {
        Some(limit) => {
            sql.push_str(" LIMIT ? OFFSET ?");
            args.push(Value::Integer(limit as i64));
            args.push(Value::Integer(filter.offset as i64));
        }
        None if filter.offset > 0 => {
            sql.push_str(" LIMIT -1 OFFSET ?");
            args.push(Value::Integer(filter.offset as i64));
        }
        None => {}
    }

    let rows = {
        let mut stmt = conn.prepare(&sql)?;
        let mapped = stmt.query_map(params_from_iter(args.iter()), read_auction_row)?;
        mapped.collect::<rusqlite::Result<Vec<_>>>()?
    };
    hydrate(conn, rows)
}

/// Number of ACTIVE auctions a seller currently holds.
pub fn count_active_by_seller(conn: &Connection, seller: PlayerId) -> Result<usize, StorageError> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM auctions WHERE seller_id = ?1 AND status = 'ACTIVE'",
        [seller.to_string()],
        |row| row.get(0),
    )?;
    Ok(n.max(0) as usize)
}

/// Ids of ACTIVE auctions whose clock has run out, oldest expiry first.
pub fn select_expired_active(conn: &Connection, now: DateTime<Utc>) -> Result<Vec<AuctionId>, StorageError> {
    select_ids(
        conn,
        "SELECT id FROM auctions WHERE status = 'ACTIVE' AND expires_at <= ?1 ORDER BY expires_at",
        millis(now),
    )
}

/// Ids of EXPIRED or CLAIMED auctions that expired before `cutoff`.
pub fn select_settled_before(conn: &Connection, cutoff: DateTime<Utc>) -> Result<Vec<AuctionId>, StorageError> {
    select_ids(
        conn,
        "SELECT id FROM auctions WHERE status IN ('EXPIRED', 'CLAIMED') AND expires_at < ?1 ORDER BY expires_at",
        millis(cutoff),
    )
}

fn select_ids(conn: &Connection, sql: &str, arg: i64) -> Result<Vec<AuctionId>, StorageError> {
    let mut stmt = conn.prepare_cached(sql)?;
    let ids = stmt
        .query_map([arg], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    ids.iter().map(|s| uuid(s)).collect()
}

/// Delete an auction and its bids in one transaction.
pub fn delete_auction(conn: &mut Connection, id: AuctionId) -> Result<bool, StorageError> {
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM bids WHERE auction_id = ?1", [id.to_string()])?;
    let removed = tx.execute("DELETE FROM auctions WHERE id = ?1", [id.to_string()])?;
    tx.commit()?;
    Ok(removed > 0)
}

/// Write a settlement atomically: the auction update, its new bids and all claims.
pub fn commit_settlement(conn: &mut Connection, settlement: &Settlement) -> Result<(), StorageError> {
    let tx = conn.transaction()?;
    if !update_auction_row(&tx, &settlement.auction)? {
        return Err(StorageError::Corrupt(format!(
            "auction {} vanished during settlement",
            settlement.auction.id
        )));
    }
    for claim in &settlement.claims {
        insert_claim(&tx, claim)?;
    }
    tx.commit()?;
    Ok(())
}

// =============================================================================
// CLAIMS
// =============================================================================

pub fn insert_claim(conn: &Connection, claim: &Claim) -> Result<(), StorageError> {
    let items = serde_json::to_string(&claim.items)
        .map_err(|e| StorageError::Corrupt(format!("claim {} items: {}", claim.id, e)))?;
    conn.execute(
        &format!(
            "INSERT INTO claims ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            CLAIM_COLUMNS
        ),
        params![
            claim.id.to_string(),
            claim.recipient.id.to_string(),
            claim.recipient.name,
            items,
            to_sql_cents(claim.money),
            claim.reason.as_str(),
            claim.auction_id.map(|id| id.to_string()),
            millis(claim.created_at),
        ],
    )?;
    Ok(())
}

/// Insert or replace a claim (used by restore).
pub fn upsert_claim(conn: &Connection, claim: &Claim) -> Result<(), StorageError> {
    conn.execute("DELETE FROM claims WHERE id = ?1", [claim.id.to_string()])?;
    insert_claim(conn, claim)
}

/// Rewrite what a claim still owes. Returns false if it no longer exists.
pub fn update_claim_contents(conn: &Connection, claim: &Claim) -> Result<bool, StorageError> {
    let items = serde_json::to_string(&claim.items)
        .map_err(|e| StorageError::Corrupt(format!("claim {} items: {}", claim.id, e)))?;
    let changed = conn.execute(
        "UPDATE claims SET items = ?2, money = ?3 WHERE id = ?1",
        params![claim.id.to_string(), items, to_sql_cents(claim.money)],
    )?;
    Ok(changed > 0)
}

pub fn select_claim(conn: &Connection, id: ClaimId) -> Result<Option<Claim>, StorageError> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM claims WHERE id = ?1", CLAIM_COLUMNS),
            [id.to_string()],
            read_claim_row,
        )
        .optional()?;
    row.map(ClaimRow::into_claim).transpose()
}

/// Pending claims for one player, oldest first.
pub fn select_claims_for(conn: &Connection, player: PlayerId) -> Result<Vec<Claim>, StorageError> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM claims WHERE player_id = ?1 ORDER BY created_at, id",
        CLAIM_COLUMNS
    ))?;
    let rows = stmt.query_map([player.to_string()], read_claim_row)?;
    let claims = rows
        .map(|r| r.map_err(StorageError::from).and_then(ClaimRow::into_claim))
        .collect();
    claims
}

pub fn select_all_claims(conn: &Connection) -> Result<Vec<Claim>, StorageError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM claims ORDER BY created_at, id",
        CLAIM_COLUMNS
    ))?;
    let rows = stmt.query_map([], read_claim_row)?;
    let claims = rows
        .map(|r| r.map_err(StorageError::from).and_then(ClaimRow::into_claim))
        .collect();
    claims
}

pub fn count_claims_for_auction(conn: &Connection, auction_id: AuctionId) -> Result<usize, StorageError> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM claims WHERE auction_id = ?1",
        [auction_id.to_string()],
        |row| row.get(0),
    )?;
    Ok(n.max(0) as usize)
}

pub fn count_claims_for(conn: &Connection, player: PlayerId) -> Result<usize, StorageError> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM claims WHERE player_id = ?1",
        [player.to_string()],
        |row| row.get(0),
    )?;
    Ok(n.max(0) as usize)
}

/// Returns true if a claim was removed.
pub fn delete_claim(conn: &Connection, id: ClaimId) -> Result<bool, StorageError> {
    let removed = conn.execute("DELETE FROM claims WHERE id = ?1", [id.to_string()])?;
    Ok(removed > 0)
}
