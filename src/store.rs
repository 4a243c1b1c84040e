//! Write-through balance store.
//!
//! Funds and holdings live in fast in-memory maps; every accepted write is
//! mirrored to a durable backing store before the operation reports success.
//! The durable store is authoritative only for recovery; steady-state reads
//! never touch it. A missing cache key therefore *means* the user (or
//! holding) does not exist.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;

use crate::error::EngineError;
use crate::money::Cents;

pub type Shares = i64;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("insufficient funds")]
    InsufficientFunds,
    #[error("insufficient stock")]
    InsufficientStock,
    #[error("unknown user")]
    UnknownUser,
    #[error("no holding for this user and symbol")]
    UnknownHolding,
    #[error("durable store unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InsufficientFunds => EngineError::InsufficientFunds,
            StoreError::InsufficientStock => EngineError::InsufficientStock,
            StoreError::UnknownUser => EngineError::UnknownUser,
            StoreError::UnknownHolding => EngineError::UnknownHolding,
            StoreError::Unavailable(msg) => EngineError::Unavailable(msg),
        }
    }
}

/// Durable backing store for user funds and stock holdings.
///
/// Writes are idempotent replacements of the full value, never increments,
/// so the cache and the durable store always converge on the same number.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn put_funds(&self, user: &str, cents: Cents) -> Result<(), StoreError>;
    async fn put_holding(&self, user: &str, symbol: &str, shares: Shares)
        -> Result<(), StoreError>;
    async fn load_funds(&self) -> Result<HashMap<String, Cents>, StoreError>;
    async fn load_holdings(&self) -> Result<HashMap<(String, String), Shares>, StoreError>;
}

pub struct BalanceStore {
    durable: Arc<dyn DurableStore>,
    funds: RwLock<HashMap<String, Cents>>,
    holdings: RwLock<HashMap<(String, String), Shares>>,
    // One async lock per balance key; the only lock in the system that is
    // allowed to span the durable write.
    key_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl BalanceStore {
    pub fn new(durable: Arc<dyn DurableStore>) -> Self {
        Self {
            durable,
            funds: RwLock::new(HashMap::new()),
            holdings: RwLock::new(HashMap::new()),
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    fn key_lock(&self, key: String) -> Arc<AsyncMutex<()>> {
        Arc::clone(
            self.key_locks
                .lock()
                .entry(key)
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }

    /// Hydrate the caches from the durable store. Called once at startup.
    pub async fn recover(&self) -> Result<(), StoreError> {
        let funds = self.durable.load_funds().await?;
        let holdings = self.durable.load_holdings().await?;
        *self.funds.write() = funds;
        *self.holdings.write() = holdings;
        Ok(())
    }

    /// Apply a signed delta to a user's funds and return the new balance.
    ///
    /// A non-negative delta to an unknown user creates the account; a
    /// negative one fails with `UnknownUser`. Writes that would drive the
    /// balance below zero are rejected without touching anything.
    pub async fn apply_funds(&self, user: &str, delta: Cents) -> Result<Cents, StoreError> {
        let lock = self.key_lock(format!("funds:{user}"));
        let _guard = lock.lock().await;

        let current = self.funds.read().get(user).copied();
        let new_value = match current {
            None if delta < 0 => return Err(StoreError::UnknownUser),
            None => delta,
            Some(balance) => {
                let next = balance + delta;
                if next < 0 {
                    return Err(StoreError::InsufficientFunds);
                }
                next
            }
        };

        self.funds.write().insert(user.to_string(), new_value);
        if let Err(err) = self.durable.put_funds(user, new_value).await {
            // Undo the cache write so cache and durable store never diverge.
            let mut funds = self.funds.write();
            match current {
                Some(previous) => funds.insert(user.to_string(), previous),
                None => funds.remove(user),
            };
            return Err(err);
        }
        Ok(new_value)
    }

    /// Apply a signed delta to a user's holding of one symbol.
    ///
    /// Same contract as [`apply_funds`], with `UnknownHolding` /
    /// `InsufficientStock` in place of the funds errors.
    pub async fn apply_holding(
        &self,
        user: &str,
        symbol: &str,
        delta: Shares,
    ) -> Result<Shares, StoreError> {
        let lock = self.key_lock(format!("holding:{user}:{symbol}"));
        let _guard = lock.lock().await;

        let key = (user.to_string(), symbol.to_string());
        let current = self.holdings.read().get(&key).copied();
        let new_value = match current {
            None if delta < 0 => return Err(StoreError::UnknownHolding),
            None => delta,
            Some(held) => {
                let next = held + delta;
                if next < 0 {
                    return Err(StoreError::InsufficientStock);
                }
                next
            }
        };

        self.holdings.write().insert(key.clone(), new_value);
        if let Err(err) = self.durable.put_holding(user, symbol, new_value).await {
            let mut holdings = self.holdings.write();
            match current {
                Some(previous) => holdings.insert(key, previous),
                None => holdings.remove(&key),
            };
            return Err(err);
        }
        Ok(new_value)
    }

    pub fn get_funds(&self, user: &str) -> Result<Cents, StoreError> {
        self.funds
            .read()
            .get(user)
            .copied()
            .ok_or(StoreError::UnknownUser)
    }

    /// Current holding, zero if the user never held the symbol.
    pub fn holding(&self, user: &str, symbol: &str) -> Shares {
        self.holdings
            .read()
            .get(&(user.to_string(), symbol.to_string()))
            .copied()
            .unwrap_or(0)
    }

    #[cfg(test)]
    pub(crate) fn funds_snapshot(&self) -> HashMap<String, Cents> {
        self.funds.read().clone()
    }

    #[cfg(test)]
    pub(crate) fn holdings_snapshot(&self) -> HashMap<(String, String), Shares> {
        self.holdings.read().clone()
    }
}

/// In-memory durable store used by tests (and handy for local runs).
#[derive(Default)]
pub struct MemoryStore {
    funds: Mutex<HashMap<String, Cents>>,
    holdings: Mutex<HashMap<(String, String), Shares>>,
    fail_writes: std::sync::atomic::AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail, simulating an outage.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn funds_snapshot(&self) -> HashMap<String, Cents> {
        self.funds.lock().clone()
    }

    pub fn holdings_snapshot(&self) -> HashMap<(String, String), Shares> {
        self.holdings.lock().clone()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
            Err(StoreError::Unavailable("simulated outage".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn put_funds(&self, user: &str, cents: Cents) -> Result<(), StoreError> {
        self.check_available()?;
        self.funds.lock().insert(user.to_string(), cents);
        Ok(())
    }

    async fn put_holding(
        &self,
        user: &str,
        symbol: &str,
        shares: Shares,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        self.holdings
            .lock()
            .insert((user.to_string(), symbol.to_string()), shares);
        Ok(())
    }

    async fn load_funds(&self) -> Result<HashMap<String, Cents>, StoreError> {
        Ok(self.funds.lock().clone())
    }

    async fn load_holdings(&self) -> Result<HashMap<(String, String), Shares>, StoreError> {
        Ok(self.holdings.lock().clone())
    }
}
