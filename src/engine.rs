//! Core engine: account operations and the two-phase pending buy/sell
//! lifecycle.
//!
//! A market BUY or SELL reserves the resource (funds or shares) up front and
//! parks a pending entry on the user's stack; COMMIT completes the exchange
//! at the quoted price, CANCEL reverses the reservation, and the background
//! sweeper reverses anything left unclaimed past the expiry window.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::audit::AuditLog;
use crate::clock::Clock;
use crate::error::EngineError;
use crate::money::{self, Cents};
use crate::quote::{Quote, QuoteClient, QuoteOracle};
use crate::stack::UserStacks;
use crate::store::BalanceStore;
use crate::trigger::TriggerSet;

/// Age past which an uncommitted pending op is swept and reversed.
pub const PENDING_TTL_MS: i64 = 60_000;

#[derive(Debug, Clone)]
pub struct PendingBuy {
    pub created_ms: i64,
    pub quote_ts: i64,
    pub nonce: String,
    pub symbol: String,
    pub price_cents: Cents,
    pub reserved_cents: Cents,
}

#[derive(Debug, Clone)]
pub struct PendingSell {
    pub created_ms: i64,
    pub quote_ts: i64,
    pub nonce: String,
    pub symbol: String,
    pub price_cents: Cents,
    pub target_cents: Cents,
    pub shares: i64,
}

/// The transaction core. One value owns every sub-component; handlers and
/// background tasks share it behind an `Arc`.
pub struct Engine {
    pub(crate) store: BalanceStore,
    pub(crate) quotes: QuoteClient,
    pub(crate) buys: UserStacks<PendingBuy>,
    pub(crate) sells: UserStacks<PendingSell>,
    pub(crate) triggers: TriggerSet,
    pub(crate) audit: Arc<AuditLog>,
    pub(crate) clock: Arc<dyn Clock>,
    user_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl Engine {
    pub fn new(
        store: BalanceStore,
        oracle: Arc<dyn QuoteOracle>,
        audit: Arc<AuditLog>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let quotes = QuoteClient::new(oracle, Arc::clone(&clock), Arc::clone(&audit));
        Arc::new(Self {
            store,
            quotes,
            buys: UserStacks::new(),
            sells: UserStacks::new(),
            triggers: TriggerSet::new(),
            audit,
            clock,
            user_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// One async lock per user: a user's commands run in arrival order, and
    /// trigger fires take the same lock so they cannot interleave with a
    /// concurrent cancel.
    pub(crate) fn user_lock(&self, user: &str) -> Arc<AsyncMutex<()>> {
        Arc::clone(
            self.user_locks
                .lock()
                .entry(user.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }

    // ------------------------------------------------------------------
    // Account operations
    // ------------------------------------------------------------------

    pub async fn add_funds(
        &self,
        user: &str,
        amount: Cents,
        transaction_num: i64,
    ) -> Result<Cents, EngineError> {
        validate_user(user)?;
        validate_tx(transaction_num)?;
        if amount < 0 {
            return Err(EngineError::Validation(
                "amount must not be negative".to_string(),
            ));
        }

        let lock = self.user_lock(user);
        let _guard = lock.lock().await;

        let balance = self.store.apply_funds(user, amount).await?;
        self.audit
            .account_transaction("add", user, amount, transaction_num);
        Ok(balance)
    }

    pub async fn quote(
        &self,
        user: &str,
        symbol: &str,
        transaction_num: i64,
    ) -> Result<Quote, EngineError> {
        validate_user(user)?;
        validate_symbol(symbol)?;
        validate_tx(transaction_num)?;
        self.quotes.fetch_quote(user, symbol, transaction_num).await
    }

    pub async fn display_summary(
        &self,
        user: &str,
        transaction_num: i64,
    ) -> Result<Cents, EngineError> {
        validate_user(user)?;
        validate_tx(transaction_num)?;
        Ok(self.store.get_funds(user)?)
    }

    // ------------------------------------------------------------------
    // Market buys
    // ------------------------------------------------------------------

    pub async fn buy(
        &self,
        user: &str,
        symbol: &str,
        amount: Cents,
        transaction_num: i64,
    ) -> Result<(), EngineError> {
        validate_user(user)?;
        validate_symbol(symbol)?;
        validate_amount(amount)?;
        validate_tx(transaction_num)?;

        let lock = self.user_lock(user);
        let _guard = lock.lock().await;

        self.store.apply_funds(user, -amount).await?;
        self.audit
            .account_transaction("remove", user, amount, transaction_num);

        let quote = match self.quotes.fetch_quote(user, symbol, transaction_num).await {
            Ok(quote) => quote,
            Err(err) => {
                // The reservation must not outlive a failed quote.
                match self.store.apply_funds(user, amount).await {
                    Ok(_) => self
                        .audit
                        .account_transaction("add", user, amount, transaction_num),
                    Err(refund_err) => {
                        error!(user, %refund_err, "refund after failed quote did not land")
                    }
                }
                return Err(err);
            }
        };

        self.buys.push(
            user,
            PendingBuy {
                created_ms: self.clock.now_ms(),
                quote_ts: quote.server_ts_ms,
                nonce: quote.nonce,
                symbol: quote.symbol,
                price_cents: quote.price_cents,
                reserved_cents: amount,
            },
        );
        Ok(())
    }

    pub async fn commit_buy(&self, user: &str, transaction_num: i64) -> Result<(), EngineError> {
        validate_user(user)?;
        validate_tx(transaction_num)?;

        let lock = self.user_lock(user);
        let _guard = lock.lock().await;

        let pending = self.buys.pop(user).ok_or(EngineError::NoPendingBuy)?;
        let shares = money::shares_buyable(pending.reserved_cents, pending.price_cents);
        let refund = money::buy_refund(pending.reserved_cents, pending.price_cents);

        // A price above the whole reservation commits zero shares and
        // refunds everything; that still counts as a successful commit.
        if refund > 0 {
            self.store.apply_funds(user, refund).await?;
            self.audit
                .account_transaction("add", user, refund, transaction_num);
        }
        if shares > 0 {
            self.store
                .apply_holding(user, &pending.symbol, shares)
                .await?;
        }
        Ok(())
    }

    pub async fn cancel_buy(&self, user: &str, transaction_num: i64) -> Result<(), EngineError> {
        validate_user(user)?;
        validate_tx(transaction_num)?;

        let lock = self.user_lock(user);
        let _guard = lock.lock().await;

        let pending = self.buys.pop(user).ok_or(EngineError::NoPendingBuy)?;
        self.store
            .apply_funds(user, pending.reserved_cents)
            .await?;
        self.audit
            .account_transaction("add", user, pending.reserved_cents, transaction_num);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Market sells
    // ------------------------------------------------------------------

    pub async fn sell(
        &self,
        user: &str,
        symbol: &str,
        amount: Cents,
        transaction_num: i64,
    ) -> Result<(), EngineError> {
        validate_user(user)?;
        validate_symbol(symbol)?;
        validate_amount(amount)?;
        validate_tx(transaction_num)?;

        let lock = self.user_lock(user);
        let _guard = lock.lock().await;

        let quote = self.quotes.fetch_quote(user, symbol, transaction_num).await?;
        let shares = money::shares_to_sell(amount, quote.price_cents)
            .map_err(|err| EngineError::Validation(err.to_string()))?;

        self.store.apply_holding(user, symbol, -shares).await?;

        self.sells.push(
            user,
            PendingSell {
                created_ms: self.clock.now_ms(),
                quote_ts: quote.server_ts_ms,
                nonce: quote.nonce,
                symbol: quote.symbol,
                price_cents: quote.price_cents,
                target_cents: amount,
                shares,
            },
        );
        Ok(())
    }

    pub async fn commit_sell(&self, user: &str, transaction_num: i64) -> Result<(), EngineError> {
        validate_user(user)?;
        validate_tx(transaction_num)?;

        let lock = self.user_lock(user);
        let _guard = lock.lock().await;

        let pending = self.sells.pop(user).ok_or(EngineError::NoPendingSell)?;
        let proceeds = pending.shares * pending.price_cents;
        self.store.apply_funds(user, proceeds).await?;
        self.audit
            .account_transaction("add", user, proceeds, transaction_num);
        Ok(())
    }

    pub async fn cancel_sell(&self, user: &str, transaction_num: i64) -> Result<(), EngineError> {
        validate_user(user)?;
        validate_tx(transaction_num)?;

        let lock = self.user_lock(user);
        let _guard = lock.lock().await;

        let pending = self.sells.pop(user).ok_or(EngineError::NoPendingSell)?;
        self.store
            .apply_holding(user, &pending.symbol, pending.shares)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sweeper
    // ------------------------------------------------------------------

    /// Reverse every pending op older than the expiry window.
    ///
    /// The stacks are drained under their own locks first; the store calls
    /// happen afterwards so no stack lock spans an await.
    pub async fn sweep_once(&self) {
        let cutoff = self.clock.now_ms() - PENDING_TTL_MS;

        for (user, entries) in self.buys.drain_stale(cutoff, |buy| buy.created_ms) {
            for buy in entries {
                match self.store.apply_funds(&user, buy.reserved_cents).await {
                    Ok(_) => {
                        self.audit
                            .account_transaction("add", &user, buy.reserved_cents, 0);
                        self.audit
                            .system_event("EXPIRE_PENDING_BUY", &user, &buy.symbol, buy.reserved_cents, 0);
                        info!(user = %user, symbol = %buy.symbol, refund = buy.reserved_cents, "expired pending buy");
                    }
                    Err(err) => warn!(user = %user, %err, "could not refund expired buy"),
                }
            }
        }

        for (user, entries) in self.sells.drain_stale(cutoff, |sell| sell.created_ms) {
            for sell in entries {
                match self
                    .store
                    .apply_holding(&user, &sell.symbol, sell.shares)
                    .await
                {
                    Ok(_) => {
                        self.audit
                            .system_event("EXPIRE_PENDING_SELL", &user, &sell.symbol, sell.target_cents, 0);
                        info!(user = %user, symbol = %sell.symbol, shares = sell.shares, "expired pending sell");
                    }
                    Err(err) => warn!(user = %user, %err, "could not restore expired sell"),
                }
            }
        }
    }

    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                engine.sweep_once().await;
            }
        })
    }
}

pub(crate) fn validate_user(user: &str) -> Result<(), EngineError> {
    if user.is_empty() {
        return Err(EngineError::Validation("user must not be empty".to_string()));
    }
    Ok(())
}

pub(crate) fn validate_symbol(symbol: &str) -> Result<(), EngineError> {
    if symbol.is_empty() || symbol.len() > 3 {
        return Err(EngineError::Validation(format!(
            "symbol must be 1-3 characters, got {symbol:?}"
        )));
    }
    Ok(())
}

pub(crate) fn validate_amount(amount: Cents) -> Result<(), EngineError> {
    if amount <= 0 {
        return Err(EngineError::Validation(
            "amount must be positive".to_string(),
        ));
    }
    Ok(())
}

pub(crate) fn validate_tx(transaction_num: i64) -> Result<(), EngineError> {
    if transaction_num < 1 {
        return Err(EngineError::Validation(
            "transaction number must be at least 1".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_bounds_are_one_to_three() {
        assert!(validate_symbol("A").is_ok());
        assert!(validate_symbol("ABC").is_ok());
        assert!(validate_symbol("").is_err());
        assert!(validate_symbol("ABCD").is_err());
    }

    #[test]
    fn amounts_and_tx_numbers_must_be_positive() {
        assert!(validate_amount(1).is_ok());
        assert!(validate_amount(0).is_err());
        assert!(validate_amount(-5).is_err());
        assert!(validate_tx(1).is_ok());
        assert!(validate_tx(0).is_err());
    }
}
