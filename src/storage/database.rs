//! SQLite access through a dedicated thread and mpsc channel.
//!
//! The connection never touches the async runtime: callers ship a closure to
//! the storage thread and await its answer on a oneshot channel, so no
//! foreground task blocks on disk I/O.

use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;

use rusqlite::Connection;
use tokio::sync::oneshot;
use tracing::{error, info};

use super::schema::create_tables;
use crate::error::StorageError;

type Job = Box<dyn FnOnce(&mut Connection) + Send>;

/// Messages sent to the storage thread.
enum StorageMessage {
    /// Run a closure against the connection
    Call(Job),
    /// Graceful shutdown
    Shutdown,
}

/// Cloneable handle to the storage thread.
#[derive(Clone)]
pub struct Database {
    tx: Sender<StorageMessage>,
}

impl Database {
    /// Open (or create) the database file and spawn the storage thread.
    pub fn open(db_path: &str) -> Result<Self, StorageError> {
        let conn = Connection::open(db_path)?;
        Self::start(conn, db_path)
    }

    /// Private in-memory database, mostly for tests.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Self::start(conn, ":memory:")
    }

    fn start(conn: Connection, db_path: &str) -> Result<Self, StorageError> {
        create_tables(&conn)?;
        info!("[STORAGE] Database initialized at {}", db_path);

        let (tx, rx) = mpsc::channel();
        let thread_path = db_path.to_string();

        thread::Builder::new()
            .name("auction-storage".to_string())
            .spawn(move || storage_loop(rx, conn, &thread_path))
            .map_err(|e| StorageError::Corrupt(format!("cannot spawn storage thread: {}", e)))?;

        Ok(Self { tx })
    }

    /// Run `f` on the storage thread and wait for its result.
    pub async fn call<F, T>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: Job = Box::new(move |conn| {
            let _ = reply_tx.send(f(conn));
        });
        self.tx
            .send(StorageMessage::Call(job))
            .map_err(|_| StorageError::Closed)?;
        reply_rx.await.map_err(|_| StorageError::Closed)?
    }

    /// Request graceful shutdown. Jobs already queued still run.
    pub fn shutdown(&self) {
        let _ = self.tx.send(StorageMessage::Shutdown);
    }
}

/// Main loop running in the storage thread.
fn storage_loop(rx: Receiver<StorageMessage>, mut conn: Connection, db_path: &str) {
    loop {
        match rx.recv() {
            Ok(StorageMessage::Call(job)) => job(&mut conn),
            Ok(StorageMessage::Shutdown) => {
                info!("[STORAGE] Storage thread shutdown complete ({})", db_path);
                break;
            }
            Err(_) => {
                info!("[STORAGE] Channel disconnected, storage thread exiting");
                break;
            }
        }
    }

    if let Err((_, e)) = conn.close() {
        error!("[STORAGE] Failed to close database {}: {}", db_path, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_call_runs_on_storage_thread() {
        let db = Database::open_in_memory().unwrap();
        let n: i64 = db
            .call(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM auctions", [], |r| r.get(0))?))
            .await
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_calls_after_shutdown_fail_closed() {
        let db = Database::open_in_memory().unwrap();
        db.shutdown();

        // Give the thread a moment to exit
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let result = db.call(|_| Ok(())).await;
        assert!(matches!(result, Err(StorageError::Closed)));
    }
}
