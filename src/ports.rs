//! Collaborator interfaces: the economy and player inventories.
//!
//! The engine only moves value through these two traits. Both may fail or be
//! unavailable at any time; callers treat every failure as recoverable.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use rustc_hash::FxHashMap;

use crate::error::PortError;
use crate::types::{Cents, ItemPayload, PlayerId};

/// Economy provider. Must serve both online and offline players.
#[async_trait]
pub trait Economy: Send + Sync {
    async fn balance(&self, player: PlayerId) -> Result<Cents, PortError>;

    async fn withdraw(&self, player: PlayerId, amount: Cents) -> Result<(), PortError>;

    async fn deposit(&self, player: PlayerId, amount: Cents) -> Result<(), PortError>;
}

/// Item delivery into a player's inventory.
#[async_trait]
pub trait Inventory: Send + Sync {
    /// Free slots the player currently has. Fails if the player is unreachable.
    async fn free_slots(&self, player: PlayerId) -> Result<usize, PortError>;

    /// Hand over all `items` or none of them.
    async fn give_items(&self, player: PlayerId, items: &[ItemPayload]) -> Result<(), PortError>;
}

// =============================================================================
// IN-MEMORY IMPLEMENTATIONS
// =============================================================================

/// Balance table held in memory. Can be switched offline to simulate outages.
#[derive(Default)]
pub struct MemoryEconomy {
    balances: Mutex<FxHashMap<PlayerId, Cents>>,
    offline: AtomicBool,
}

impl MemoryEconomy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_balance(&self, player: PlayerId, amount: Cents) {
        if let Ok(mut balances) = self.balances.lock() {
            balances.insert(player, amount);
        }
    }

    /// Current balance without going through the async port (0 if unknown).
    pub fn balance_of(&self, player: PlayerId) -> Cents {
        self.balances
            .lock()
            .map(|b| b.get(&player).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<(), PortError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(PortError::Unavailable("economy offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Economy for MemoryEconomy {
    async fn balance(&self, player: PlayerId) -> Result<Cents, PortError> {
        self.check_online()?;
        Ok(self.balance_of(player))
    }

    async fn withdraw(&self, player: PlayerId, amount: Cents) -> Result<(), PortError> {
        self.check_online()?;
        let mut balances = self
            .balances
            .lock()
            .map_err(|_| PortError::Unavailable("balance table poisoned".to_string()))?;
        let balance = balances.entry(player).or_insert(0);
        if *balance < amount {
            return Err(PortError::InsufficientFunds {
                balance: *balance,
                needed: amount,
            });
        }
        *balance -= amount;
        Ok(())
    }

    async fn deposit(&self, player: PlayerId, amount: Cents) -> Result<(), PortError> {
        self.check_online()?;
        let mut balances = self
            .balances
            .lock()
            .map_err(|_| PortError::Unavailable("balance table poisoned".to_string()))?;
        *balances.entry(player).or_insert(0) += amount;
        Ok(())
    }
}

/// Slot-counted inventories held in memory.
pub struct MemoryInventory {
    default_slots: usize,
    slots: Mutex<FxHashMap<PlayerId, usize>>,
    received: Mutex<FxHashMap<PlayerId, Vec<ItemPayload>>>,
    offline: AtomicBool,
}

impl MemoryInventory {
    pub fn new(default_slots: usize) -> Self {
        Self {
            default_slots,
            slots: Mutex::new(FxHashMap::default()),
            received: Mutex::new(FxHashMap::default()),
            offline: AtomicBool::new(false),
        }
    }

    pub fn set_free_slots(&self, player: PlayerId, free: usize) {
        if let Ok(mut slots) = self.slots.lock() {
            slots.insert(player, free);
        }
    }

    /// Everything delivered to `player` so far.
    pub fn received(&self, player: PlayerId) -> Vec<ItemPayload> {
        self.received
            .lock()
            .map(|r| r.get(&player).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

impl Default for MemoryInventory {
    fn default() -> Self {
        Self::new(36)
    }
}

#[async_trait]
impl Inventory for MemoryInventory {
    async fn free_slots(&self, player: PlayerId) -> Result<usize, PortError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(PortError::Unavailable("player offline".to_string()));
        }
        let slots = self
            .slots
            .lock()
            .map_err(|_| PortError::Unavailable("inventory poisoned".to_string()))?;
        Ok(slots.get(&player).copied().unwrap_or(self.default_slots))
    }

    async fn give_items(&self, player: PlayerId, items: &[ItemPayload]) -> Result<(), PortError> {
        let free = self.free_slots(player).await?;
        if free < items.len() {
            return Err(PortError::InventoryFull {
                free,
                needed: items.len(),
            });
        }
        if let Ok(mut slots) = self.slots.lock() {
            slots.insert(player, free - items.len());
        }
        let mut received = self
            .received
            .lock()
            .map_err(|_| PortError::Unavailable("inventory poisoned".to_string()))?;
        received.entry(player).or_default().extend_from_slice(items);
        Ok(())
    }
}

/// Port for hosts that run only the background tasks (no players attached).
/// Every call reports the collaborator as unavailable.
pub struct Detached;

#[async_trait]
impl Economy for Detached {
    async fn balance(&self, _player: PlayerId) -> Result<Cents, PortError> {
        Err(PortError::Unavailable("no economy attached".to_string()))
    }

    async fn withdraw(&self, _player: PlayerId, _amount: Cents) -> Result<(), PortError> {
        Err(PortError::Unavailable("no economy attached".to_string()))
    }

    async fn deposit(&self, _player: PlayerId, _amount: Cents) -> Result<(), PortError> {
        Err(PortError::Unavailable("no economy attached".to_string()))
    }
}

#[async_trait]
impl Inventory for Detached {
    async fn free_slots(&self, _player: PlayerId) -> Result<usize, PortError> {
        Err(PortError::Unavailable("no inventory attached".to_string()))
    }

    async fn give_items(&self, _player: PlayerId, _items: &[ItemPayload]) -> Result<(), PortError> {
        Err(PortError::Unavailable("no inventory attached".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_withdraw_rejects_overdraft() {
        let economy = MemoryEconomy::new();
        let player = Uuid::new_v4();
        economy.set_balance(player, 10);

        let err = economy.withdraw(player, 11).await.unwrap_err();
        assert_eq!(err, PortError::InsufficientFunds { balance: 10, needed: 11 });
        assert_eq!(economy.balance_of(player), 10, "Failed withdraw must not change balance");

        economy.withdraw(player, 10).await.unwrap();
        assert_eq!(economy.balance_of(player), 0);
    }

    #[tokio::test]
    async fn test_offline_economy_rejects_everything() {
        let economy = MemoryEconomy::new();
        let player = Uuid::new_v4();
        economy.set_offline(true);

        assert!(matches!(economy.deposit(player, 5).await, Err(PortError::Unavailable(_))));
        economy.set_offline(false);
        economy.deposit(player, 5).await.unwrap();
        assert_eq!(economy.balance(player).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_give_items_is_all_or_nothing() {
        let inventory = MemoryInventory::new(36);
        let player = Uuid::new_v4();
        inventory.set_free_slots(player, 1);

        let items = vec![ItemPayload::new("a"), ItemPayload::new("b")];
        let err = inventory.give_items(player, &items).await.unwrap_err();
        assert_eq!(err, PortError::InventoryFull { free: 1, needed: 2 });
        assert!(inventory.received(player).is_empty());

        inventory.give_items(player, &items[..1]).await.unwrap();
        assert_eq!(inventory.received(player), vec![ItemPayload::new("a")]);
        assert_eq!(inventory.free_slots(player).await.unwrap(), 0);
    }
}
