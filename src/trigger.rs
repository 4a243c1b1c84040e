//! Price-triggered conditional orders.
//!
//! A trigger is created unarmed by SET_*_AMOUNT (reserving the resource for
//! buys) and armed by SET_*_TRIGGER, which enrolls it for its symbol. Each
//! enrolled symbol has one ticker that posts the symbol onto a per-direction
//! channel every poll interval; a long-lived evaluator per direction drains
//! the channel, fetches one quote per tick, and fires every qualifying
//! trigger in enrollment order.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::engine::{validate_amount, validate_symbol, validate_tx, validate_user, Engine};
use crate::error::EngineError;
use crate::money::{self, Cents};

/// Cadence of the per-symbol polling tickers.
pub const TRIGGER_POLL_INTERVAL: Duration = Duration::from_secs(60);

const SYMBOL_CHANNEL_CAPACITY: usize = 64;

/// Conditional buy: funds reserved at creation, armed once a threshold is
/// set. Fires when the quoted price drops to the threshold or below.
#[derive(Debug, Clone)]
pub struct BuyTrigger {
    pub set_ms: i64,
    pub symbol: String,
    pub reserved_cents: Cents,
    pub threshold_cents: Option<Cents>,
}

/// Conditional sell: no shares reserved until armed; arming computes the
/// share count from the target and threshold. Fires when the quoted price
/// reaches the threshold or above.
#[derive(Debug, Clone)]
pub struct SellTrigger {
    pub set_ms: i64,
    pub symbol: String,
    pub target_cents: Cents,
    pub threshold_cents: Option<Cents>,
    pub shares: i64,
}

type TriggerKey = (String, String);

fn key(user: &str, symbol: &str) -> TriggerKey {
    (user.to_string(), symbol.to_string())
}

struct ScheduleState {
    enrolled: HashMap<String, Vec<String>>,
    tickers: HashMap<String, JoinHandle<()>>,
}

/// Enrollment list and ticker handles for one trigger direction.
///
/// Invariant: a ticker handle exists for a symbol exactly while its enrolled
/// list is non-empty. Both live under one lock so the invariant cannot be
/// observed broken.
pub(crate) struct SymbolSchedule {
    state: Mutex<ScheduleState>,
    tx: mpsc::Sender<String>,
    rx: Mutex<Option<mpsc::Receiver<String>>>,
}

impl SymbolSchedule {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel(SYMBOL_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(ScheduleState {
                enrolled: HashMap::new(),
                tickers: HashMap::new(),
            }),
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Add a user to a symbol's enrolled list, starting the symbol's ticker
    /// if it was previously empty. Re-enrolling is a no-op.
    fn enroll(&self, symbol: &str, user: &str) {
        let mut state = self.state.lock();
        let list = state.enrolled.entry(symbol.to_string()).or_default();
        if !list.iter().any(|enrolled| enrolled == user) {
            list.push(user.to_string());
        }
        if !state.tickers.contains_key(symbol) {
            let handle = spawn_ticker(symbol.to_string(), self.tx.clone());
            state.tickers.insert(symbol.to_string(), handle);
        }
    }

    /// Remove a user from a symbol's enrolled list, stopping the ticker when
    /// the last user leaves. Withdrawing an unenrolled user is a no-op.
    fn withdraw(&self, symbol: &str, user: &str) {
        let mut state = self.state.lock();
        if let Some(list) = state.enrolled.get_mut(symbol) {
            list.retain(|enrolled| enrolled != user);
            if list.is_empty() {
                state.enrolled.remove(symbol);
                if let Some(handle) = state.tickers.remove(symbol) {
                    handle.abort();
                }
            }
        }
    }

    /// Enrolled users in enrollment order.
    fn snapshot(&self, symbol: &str) -> Vec<String> {
        self.state
            .lock()
            .enrolled
            .get(symbol)
            .cloned()
            .unwrap_or_default()
    }

    fn take_rx(&self) -> Option<mpsc::Receiver<String>> {
        self.rx.lock().take()
    }

    #[cfg(test)]
    fn ticker_active(&self, symbol: &str) -> bool {
        self.state.lock().tickers.contains_key(symbol)
    }
}

fn spawn_ticker(symbol: String, tx: mpsc::Sender<String>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(TRIGGER_POLL_INTERVAL).await;
            if tx.send(symbol.clone()).await.is_err() {
                break;
            }
        }
    })
}

/// Registry and scheduler state for both trigger directions.
pub struct TriggerSet {
    pub(crate) buy_triggers: Mutex<HashMap<TriggerKey, BuyTrigger>>,
    pub(crate) sell_triggers: Mutex<HashMap<TriggerKey, SellTrigger>>,
    buy_schedule: SymbolSchedule,
    sell_schedule: SymbolSchedule,
}

impl TriggerSet {
    pub fn new() -> Self {
        Self {
            buy_triggers: Mutex::new(HashMap::new()),
            sell_triggers: Mutex::new(HashMap::new()),
            buy_schedule: SymbolSchedule::new(),
            sell_schedule: SymbolSchedule::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn buy_trigger(&self, user: &str, symbol: &str) -> Option<BuyTrigger> {
        self.buy_triggers.lock().get(&key(user, symbol)).cloned()
    }

    #[cfg(test)]
    pub(crate) fn sell_trigger(&self, user: &str, symbol: &str) -> Option<SellTrigger> {
        self.sell_triggers.lock().get(&key(user, symbol)).cloned()
    }

    #[cfg(test)]
    pub(crate) fn buy_ticker_active(&self, symbol: &str) -> bool {
        self.buy_schedule.ticker_active(symbol)
    }

    #[cfg(test)]
    pub(crate) fn sell_ticker_active(&self, symbol: &str) -> bool {
        self.sell_schedule.ticker_active(symbol)
    }
}

impl Default for TriggerSet {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    // ------------------------------------------------------------------
    // Buy triggers
    // ------------------------------------------------------------------

    pub async fn set_buy_amount(
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

        let existing = self.triggers.buy_triggers.lock().get(&key(user, symbol)).cloned();
        if let Some(old) = existing {
            // The replaced reservation is returned unconditionally, whether
            // or not the old trigger was ever armed.
            self.store.apply_funds(user, old.reserved_cents).await?;
            self.audit
                .account_transaction("add", user, old.reserved_cents, transaction_num);
            self.triggers.buy_triggers.lock().remove(&key(user, symbol));
            self.triggers.buy_schedule.withdraw(symbol, user);
        }

        self.store.apply_funds(user, -amount).await?;
        self.audit
            .account_transaction("remove", user, amount, transaction_num);
        self.triggers.buy_triggers.lock().insert(
            key(user, symbol),
            BuyTrigger {
                set_ms: self.clock.now_ms(),
                symbol: symbol.to_string(),
                reserved_cents: amount,
                threshold_cents: None,
            },
        );
        Ok(())
    }

    pub async fn set_buy_trigger(
        &self,
        user: &str,
        symbol: &str,
        threshold: Cents,
        transaction_num: i64,
    ) -> Result<(), EngineError> {
        validate_user(user)?;
        validate_symbol(symbol)?;
        validate_amount(threshold)?;
        validate_tx(transaction_num)?;

        let lock = self.user_lock(user);
        let _guard = lock.lock().await;

        {
            let mut triggers = self.triggers.buy_triggers.lock();
            let trigger = triggers
                .get_mut(&key(user, symbol))
                .ok_or(EngineError::NoTrigger)?;
            trigger.threshold_cents = Some(threshold);
        }
        self.triggers.buy_schedule.enroll(symbol, user);
        Ok(())
    }

    pub async fn cancel_set_buy(
        &self,
        user: &str,
        symbol: &str,
        transaction_num: i64,
    ) -> Result<(), EngineError> {
        validate_user(user)?;
        validate_symbol(symbol)?;
        validate_tx(transaction_num)?;

        let lock = self.user_lock(user);
        let _guard = lock.lock().await;

        let existing = self
            .triggers
            .buy_triggers
            .lock()
            .get(&key(user, symbol))
            .cloned()
            .ok_or(EngineError::NoTrigger)?;

        self.store.apply_funds(user, existing.reserved_cents).await?;
        self.audit
            .account_transaction("add", user, existing.reserved_cents, transaction_num);
        self.triggers.buy_triggers.lock().remove(&key(user, symbol));
        self.triggers.buy_schedule.withdraw(symbol, user);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sell triggers
    // ------------------------------------------------------------------

    pub async fn set_sell_amount(
        &self,
        user: &str,
        symbol: &str,
        target: Cents,
        transaction_num: i64,
    ) -> Result<(), EngineError> {
        validate_user(user)?;
        validate_symbol(symbol)?;
        validate_amount(target)?;
        validate_tx(transaction_num)?;

        let lock = self.user_lock(user);
        let _guard = lock.lock().await;

        let existing = self.triggers.sell_triggers.lock().get(&key(user, symbol)).cloned();
        if let Some(old) = existing {
            if old.shares > 0 {
                self.store.apply_holding(user, symbol, old.shares).await?;
            }
            self.triggers.sell_triggers.lock().remove(&key(user, symbol));
            self.triggers.sell_schedule.withdraw(symbol, user);
        }

        // No shares are reserved until the trigger is armed.
        self.triggers.sell_triggers.lock().insert(
            key(user, symbol),
            SellTrigger {
                set_ms: self.clock.now_ms(),
                symbol: symbol.to_string(),
                target_cents: target,
                threshold_cents: None,
                shares: 0,
            },
        );
        Ok(())
    }

    pub async fn set_sell_trigger(
        &self,
        user: &str,
        symbol: &str,
        threshold: Cents,
        transaction_num: i64,
    ) -> Result<(), EngineError> {
        validate_user(user)?;
        validate_symbol(symbol)?;
        validate_amount(threshold)?;
        validate_tx(transaction_num)?;

        let lock = self.user_lock(user);
        let _guard = lock.lock().await;

        let existing = self
            .triggers
            .sell_triggers
            .lock()
            .get(&key(user, symbol))
            .cloned()
            .ok_or(EngineError::NoTrigger)?;

        let shares = money::shares_to_sell(existing.target_cents, threshold)
            .map_err(|err| EngineError::Validation(err.to_string()))?;

        if existing.shares > 0 {
            // Re-arming: hand back the previous reservation before taking
            // the new one.
            self.store.apply_holding(user, symbol, existing.shares).await?;
            if let Some(trigger) = self.triggers.sell_triggers.lock().get_mut(&key(user, symbol)) {
                trigger.shares = 0;
                trigger.threshold_cents = None;
            }
            self.triggers.sell_schedule.withdraw(symbol, user);
        }

        self.store.apply_holding(user, symbol, -shares).await?;

        if let Some(trigger) = self.triggers.sell_triggers.lock().get_mut(&key(user, symbol)) {
            trigger.threshold_cents = Some(threshold);
            trigger.shares = shares;
        }
        self.triggers.sell_schedule.enroll(symbol, user);
        Ok(())
    }

    pub async fn cancel_set_sell(
        &self,
        user: &str,
        symbol: &str,
        transaction_num: i64,
    ) -> Result<(), EngineError> {
        validate_user(user)?;
        validate_symbol(symbol)?;
        validate_tx(transaction_num)?;

        let lock = self.user_lock(user);
        let _guard = lock.lock().await;

        let existing = self
            .triggers
            .sell_triggers
            .lock()
            .get(&key(user, symbol))
            .cloned()
            .ok_or(EngineError::NoTrigger)?;

        if existing.shares > 0 {
            self.store.apply_holding(user, symbol, existing.shares).await?;
        }
        self.triggers.sell_triggers.lock().remove(&key(user, symbol));
        self.triggers.sell_schedule.withdraw(symbol, user);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Evaluation
    // ------------------------------------------------------------------

    /// One buy-side evaluation pass for a symbol, as driven by its ticker.
    ///
    /// Fetches a single quote (on behalf of the first enrollee) and fires
    /// every armed trigger at or below the quoted price, in enrollment
    /// order. A failed quote aborts the tick without clearing anything.
    pub async fn evaluate_buy_symbol(&self, symbol: &str) {
        let snapshot = self.triggers.buy_schedule.snapshot(symbol);
        let Some(first) = snapshot.first() else {
            return;
        };
        let quote = match self.quotes.fetch_quote(first, symbol, 0).await {
            Ok(quote) => quote,
            Err(err) => {
                warn!(symbol, %err, "buy trigger poll quote failed; triggers stay armed");
                return;
            }
        };

        for user in &snapshot {
            let lock = self.user_lock(user);
            let _guard = lock.lock().await;

            let armed = self
                .triggers
                .buy_triggers
                .lock()
                .get(&key(user, symbol))
                .and_then(|t| t.threshold_cents.map(|threshold| (t.reserved_cents, threshold)));
            let Some((reserved, threshold)) = armed else {
                continue;
            };
            if quote.price_cents > threshold {
                continue;
            }

            // Synthetic commit at the quoted price. A store failure here is a
            // consistency bug worth flagging, but the fire is not rolled
            // back: the trigger is removed and the operator reconciles.
            let shares = money::shares_buyable(reserved, quote.price_cents);
            let refund = money::buy_refund(reserved, quote.price_cents);
            if refund > 0 {
                match self.store.apply_funds(user, refund).await {
                    Ok(_) => self.audit.account_transaction("add", user, refund, 0),
                    Err(err) => warn!(user = %user, symbol, %err, "buy trigger refund failed"),
                }
            }
            if shares > 0 {
                if let Err(err) = self.store.apply_holding(user, symbol, shares).await {
                    warn!(user = %user, symbol, %err, "buy trigger holding update failed");
                }
            }

            self.triggers.buy_triggers.lock().remove(&key(user, symbol));
            self.triggers.buy_schedule.withdraw(symbol, user);
            self.audit.system_event("SET_BUY_TRIGGER", user, symbol, reserved, 0);
            info!(user = %user, symbol, shares, price = quote.price_cents, "buy trigger fired");
        }
    }

    /// Sell-side counterpart of [`evaluate_buy_symbol`]: fires armed sell
    /// triggers at or above the quoted price.
    pub async fn evaluate_sell_symbol(&self, symbol: &str) {
        let snapshot = self.triggers.sell_schedule.snapshot(symbol);
        let Some(first) = snapshot.first() else {
            return;
        };
        let quote = match self.quotes.fetch_quote(first, symbol, 0).await {
            Ok(quote) => quote,
            Err(err) => {
                warn!(symbol, %err, "sell trigger poll quote failed; triggers stay armed");
                return;
            }
        };

        for user in &snapshot {
            let lock = self.user_lock(user);
            let _guard = lock.lock().await;

            let armed = self
                .triggers
                .sell_triggers
                .lock()
                .get(&key(user, symbol))
                .and_then(|t| t.threshold_cents.map(|threshold| (t.shares, threshold)));
            let Some((shares, threshold)) = armed else {
                continue;
            };
            if quote.price_cents < threshold {
                continue;
            }

            let proceeds = shares * quote.price_cents;
            match self.store.apply_funds(user, proceeds).await {
                Ok(_) => self.audit.account_transaction("add", user, proceeds, 0),
                Err(err) => warn!(user = %user, symbol, %err, "sell trigger payout failed"),
            }

            self.triggers.sell_triggers.lock().remove(&key(user, symbol));
            self.triggers.sell_schedule.withdraw(symbol, user);
            self.audit.system_event("SET_SELL_TRIGGER", user, symbol, proceeds, 0);
            info!(user = %user, symbol, shares, price = quote.price_cents, "sell trigger fired");
        }
    }

    /// Spawn the two long-lived evaluator tasks. Call once at startup.
    pub fn spawn_trigger_evaluators(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        match self.triggers.buy_schedule.take_rx() {
            Some(rx) => handles.push(tokio::spawn(run_buy_evaluator(Arc::clone(self), rx))),
            None => warn!("buy evaluator already running"),
        }
        match self.triggers.sell_schedule.take_rx() {
            Some(rx) => handles.push(tokio::spawn(run_sell_evaluator(Arc::clone(self), rx))),
            None => warn!("sell evaluator already running"),
        }
        handles
    }
}

async fn run_buy_evaluator(engine: Arc<Engine>, mut rx: mpsc::Receiver<String>) {
    while let Some(symbol) = rx.recv().await {
        engine.evaluate_buy_symbol(&symbol).await;
    }
}

async fn run_sell_evaluator(engine: Arc<Engine>, mut rx: mpsc::Receiver<String>) {
    while let Some(symbol) = rx.recv().await {
        engine.evaluate_sell_symbol(&symbol).await;
    }
}
