//! End-to-end scenario tests for the engine with in-memory collaborators.
//!
//! These drive complete command sequences (buy/commit, trigger arm/fire,
//! expiry sweeps) against a scripted quote oracle, an in-memory durable
//! store, and a recording audit log, asserting literal balances.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::audit::{AuditLog, NullTransport};
use crate::clock::{Clock, ManualClock};
use crate::engine::{Engine, PENDING_TTL_MS};
use crate::error::EngineError;
use crate::http;
use crate::quote::{OracleResponse, QuoteOracle, QUOTE_TTL_MS};
use crate::store::{BalanceStore, DurableStore, MemoryStore};

/// Oracle fake that serves a scripted sequence of prices, repeating the last
/// one once the script runs out.
struct ScriptedOracle {
    prices: Mutex<VecDeque<String>>,
    clock: Arc<ManualClock>,
    fail: AtomicBool,
    calls: AtomicUsize,
}

impl ScriptedOracle {
    fn new(prices: &[&str], clock: Arc<ManualClock>) -> Self {
        Self {
            prices: Mutex::new(prices.iter().map(|p| p.to_string()).collect()),
            clock,
            fail: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QuoteOracle for ScriptedOracle {
    async fn request_quote(
        &self,
        user: &str,
        symbol: &str,
    ) -> Result<OracleResponse, EngineError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(EngineError::Unavailable("scripted outage".to_string()));
        }
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let price = {
            let mut prices = self.prices.lock();
            if prices.len() > 1 {
                prices.pop_front().unwrap()
            } else {
                prices
                    .front()
                    .cloned()
                    .ok_or_else(|| EngineError::Unavailable("no scripted price".to_string()))?
            }
        };
        Ok(OracleResponse {
            price,
            symbol: symbol.to_string(),
            user: user.to_string(),
            timestamp: self.clock.now_ms(),
            cryptokey: format!("nonce-{n}"),
            cached: false,
        })
    }
}

struct Harness {
    engine: Arc<Engine>,
    clock: Arc<ManualClock>,
    durable: Arc<MemoryStore>,
    oracle: Arc<ScriptedOracle>,
}

fn harness(prices: &[&str]) -> Harness {
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let oracle = Arc::new(ScriptedOracle::new(prices, Arc::clone(&clock)));
    let durable = Arc::new(MemoryStore::new());
    let audit = Arc::new(AuditLog::new("test-server", Arc::new(NullTransport)));
    let store = BalanceStore::new(Arc::clone(&durable) as Arc<dyn DurableStore>);
    let engine = Engine::new(
        store,
        Arc::clone(&oracle) as Arc<dyn QuoteOracle>,
        audit,
        Arc::clone(&clock) as Arc<dyn Clock>,
    );
    Harness {
        engine,
        clock,
        durable,
        oracle,
    }
}

/// Expire the quote cache so the next fetch goes back to the oracle.
fn next_tick(harness: &Harness) {
    harness.clock.advance_ms(QUOTE_TTL_MS + 1_000);
}

#[tokio::test]
async fn simple_buy_commit() {
    let h = harness(&["10.00"]);
    h.engine.add_funds("alice", 100_00, 1).await.unwrap();
    h.engine.buy("alice", "ABC", 50_00, 2).await.unwrap();
    h.engine.commit_buy("alice", 3).await.unwrap();

    assert_eq!(h.engine.store.get_funds("alice").unwrap(), 50_00);
    assert_eq!(h.engine.store.holding("alice", "ABC"), 5);
}

#[tokio::test]
async fn buy_commits_with_refund_of_the_remainder() {
    let h = harness(&["30.00"]);
    h.engine.add_funds("bob", 100_00, 1).await.unwrap();
    h.engine.buy("bob", "XYZ", 99_00, 2).await.unwrap();
    h.engine.commit_buy("bob", 3).await.unwrap();

    // 3 shares at 30.00 cost 90.00; the 9.00 remainder of the 99.00
    // reservation comes back.
    assert_eq!(h.engine.store.get_funds("bob").unwrap(), 10_00);
    assert_eq!(h.engine.store.holding("bob", "XYZ"), 3);
}

#[tokio::test]
async fn stale_buy_is_swept_and_refunded() {
    let h = harness(&["10.00"]);
    h.engine.add_funds("carol", 50_00, 1).await.unwrap();
    h.engine.buy("carol", "ABC", 20_00, 2).await.unwrap();
    assert_eq!(h.engine.store.get_funds("carol").unwrap(), 30_00);

    h.clock.advance_ms(65_000);
    h.engine.sweep_once().await;

    assert_eq!(h.engine.store.get_funds("carol").unwrap(), 50_00);
    assert_eq!(h.engine.buys.len("carol"), 0);
    assert!(matches!(
        h.engine.commit_buy("carol", 3).await,
        Err(EngineError::NoPendingBuy)
    ));
}

#[tokio::test]
async fn fresh_pending_ops_survive_the_sweep() {
    let h = harness(&["10.00"]);
    h.engine.add_funds("dave", 50_00, 1).await.unwrap();
    h.engine.buy("dave", "ABC", 20_00, 2).await.unwrap();

    h.clock.advance_ms(PENDING_TTL_MS - 5_000);
    h.engine.sweep_once().await;

    assert_eq!(h.engine.buys.len("dave"), 1);
    h.engine.commit_buy("dave", 3).await.unwrap();
    assert_eq!(h.engine.store.holding("dave", "ABC"), 2);
}

#[tokio::test]
async fn buy_trigger_fires_once_price_reaches_threshold() {
    let h = harness(&["25.00", "20.00"]);
    h.engine.add_funds("dana", 100_00, 1).await.unwrap();
    h.engine.set_buy_amount("dana", "ABC", 60_00, 2).await.unwrap();
    assert_eq!(h.engine.store.get_funds("dana").unwrap(), 40_00);

    h.engine.set_buy_trigger("dana", "ABC", 20_00, 3).await.unwrap();
    assert!(h.engine.triggers.buy_ticker_active("ABC"));

    // First poll: 25.00 is above the threshold, nothing moves.
    h.engine.evaluate_buy_symbol("ABC").await;
    assert_eq!(h.engine.store.get_funds("dana").unwrap(), 40_00);
    assert!(h.engine.triggers.buy_trigger("dana", "ABC").is_some());

    // Second poll: 20.00 crosses; 3 shares at 20.00 consume the whole
    // reservation.
    next_tick(&h);
    h.engine.evaluate_buy_symbol("ABC").await;

    assert_eq!(h.engine.store.get_funds("dana").unwrap(), 40_00);
    assert_eq!(h.engine.store.holding("dana", "ABC"), 3);
    assert!(h.engine.triggers.buy_trigger("dana", "ABC").is_none());
    assert!(!h.engine.triggers.buy_ticker_active("ABC"));
}

#[tokio::test]
async fn sell_trigger_reserves_shares_and_fires() {
    let h = harness(&["30.00"]);
    h.engine.add_funds("erin", 0, 1).await.unwrap();
    h.engine.store.apply_holding("erin", "ABC", 10).await.unwrap();

    h.engine.set_sell_amount("erin", "ABC", 50_00, 2).await.unwrap();
    // Creation reserves nothing.
    assert_eq!(h.engine.store.holding("erin", "ABC"), 10);

    h.engine.set_sell_trigger("erin", "ABC", 25_00, 3).await.unwrap();
    // ceil(50.00 / 25.00) = 2 shares reserved on arming.
    assert_eq!(h.engine.store.holding("erin", "ABC"), 8);
    assert!(h.engine.triggers.sell_ticker_active("ABC"));

    // 30.00 >= 25.00 fires: proceeds are 2 * 30.00.
    h.engine.evaluate_sell_symbol("ABC").await;

    assert_eq!(h.engine.store.get_funds("erin").unwrap(), 60_00);
    assert_eq!(h.engine.store.holding("erin", "ABC"), 8);
    assert!(h.engine.triggers.sell_trigger("erin", "ABC").is_none());
    assert!(!h.engine.triggers.sell_ticker_active("ABC"));
}

#[tokio::test]
async fn cancelling_an_armed_buy_trigger_restores_funds() {
    let h = harness(&["10.00"]);
    h.engine.add_funds("fred", 100_00, 1).await.unwrap();
    h.engine.set_buy_amount("fred", "ABC", 50_00, 2).await.unwrap();
    h.engine.set_buy_trigger("fred", "ABC", 10_00, 3).await.unwrap();

    h.engine.cancel_set_buy("fred", "ABC", 4).await.unwrap();

    assert_eq!(h.engine.store.get_funds("fred").unwrap(), 100_00);
    assert!(h.engine.triggers.buy_trigger("fred", "ABC").is_none());
    assert!(!h.engine.triggers.buy_ticker_active("ABC"));
}

#[tokio::test]
async fn buy_then_cancel_is_a_round_trip() {
    let h = harness(&["12.34"]);
    h.engine.add_funds("gail", 77_77, 1).await.unwrap();
    h.engine.buy("gail", "AAA", 30_00, 2).await.unwrap();
    h.engine.cancel_buy("gail", 3).await.unwrap();

    assert_eq!(h.engine.store.get_funds("gail").unwrap(), 77_77);
    assert_eq!(h.engine.buys.len("gail"), 0);
}

#[tokio::test]
async fn sell_then_cancel_is_a_round_trip() {
    let h = harness(&["12.00"]);
    h.engine.add_funds("hank", 0, 1).await.unwrap();
    h.engine.store.apply_holding("hank", "BBB", 6).await.unwrap();

    h.engine.sell("hank", "BBB", 48_00, 2).await.unwrap();
    // ceil(48.00 / 12.00) = 4 shares reserved.
    assert_eq!(h.engine.store.holding("hank", "BBB"), 2);

    h.engine.cancel_sell("hank", 3).await.unwrap();
    assert_eq!(h.engine.store.holding("hank", "BBB"), 6);
    assert_eq!(h.engine.store.get_funds("hank").unwrap(), 0);
}

#[tokio::test]
async fn commit_sell_pays_shares_times_price() {
    let h = harness(&["12.00"]);
    h.engine.add_funds("iris", 0, 1).await.unwrap();
    h.engine.store.apply_holding("iris", "BBB", 6).await.unwrap();

    h.engine.sell("iris", "BBB", 45_00, 2).await.unwrap();
    h.engine.commit_sell("iris", 3).await.unwrap();

    // ceil(45.00 / 12.00) = 4 shares, paid out at the quoted price.
    assert_eq!(h.engine.store.get_funds("iris").unwrap(), 48_00);
    assert_eq!(h.engine.store.holding("iris", "BBB"), 2);
}

#[tokio::test]
async fn unarmed_trigger_reserves_exactly_the_amount() {
    let h = harness(&["10.00"]);
    h.engine.add_funds("jack", 90_00, 1).await.unwrap();

    h.engine.set_buy_amount("jack", "CCC", 25_00, 2).await.unwrap();
    assert_eq!(h.engine.store.get_funds("jack").unwrap(), 65_00);

    // Replacing the trigger refunds the old reservation before taking the
    // new one.
    h.engine.set_buy_amount("jack", "CCC", 40_00, 3).await.unwrap();
    assert_eq!(h.engine.store.get_funds("jack").unwrap(), 50_00);

    let trigger = h.engine.triggers.buy_trigger("jack", "CCC").unwrap();
    assert_eq!(trigger.reserved_cents, 40_00);
    assert_eq!(trigger.threshold_cents, None);
}

#[tokio::test]
async fn commit_at_price_above_reservation_buys_zero_shares() {
    let h = harness(&["99.00"]);
    h.engine.add_funds("kim", 50_00, 1).await.unwrap();
    h.engine.buy("kim", "DDD", 40_00, 2).await.unwrap();

    // The quoted price exceeds the reservation: the commit succeeds, buys
    // nothing, and refunds everything.
    h.engine.commit_buy("kim", 3).await.unwrap();
    assert_eq!(h.engine.store.get_funds("kim").unwrap(), 50_00);
    assert_eq!(h.engine.store.holding("kim", "DDD"), 0);
}

#[tokio::test]
async fn failed_quote_refunds_the_buy_reservation() {
    let h = harness(&["10.00"]);
    h.engine.add_funds("lena", 30_00, 1).await.unwrap();

    h.oracle.set_fail(true);
    let err = h.engine.buy("lena", "EEE", 20_00, 2).await.unwrap_err();
    assert!(matches!(err, EngineError::Unavailable(_)));

    assert_eq!(h.engine.store.get_funds("lena").unwrap(), 30_00);
    assert_eq!(h.engine.buys.len("lena"), 0);
}

#[tokio::test]
async fn failed_poll_quote_leaves_triggers_armed() {
    let h = harness(&["10.00"]);
    h.engine.add_funds("mona", 50_00, 1).await.unwrap();
    h.engine.set_buy_amount("mona", "FFF", 30_00, 2).await.unwrap();
    h.engine.set_buy_trigger("mona", "FFF", 15_00, 3).await.unwrap();

    h.oracle.set_fail(true);
    h.engine.evaluate_buy_symbol("FFF").await;

    assert!(h.engine.triggers.buy_trigger("mona", "FFF").is_some());
    assert!(h.engine.triggers.buy_ticker_active("FFF"));
    assert_eq!(h.engine.store.get_funds("mona").unwrap(), 20_00);
}

#[tokio::test]
async fn insufficient_stock_rejects_the_sell() {
    let h = harness(&["10.00"]);
    h.engine.add_funds("nate", 10_00, 1).await.unwrap();

    let err = h.engine.sell("nate", "GGG", 20_00, 2).await.unwrap_err();
    assert!(matches!(err, EngineError::UnknownHolding));
    assert_eq!(h.engine.sells.len("nate"), 0);
}

#[tokio::test]
async fn insufficient_funds_rejects_the_buy() {
    let h = harness(&["10.00"]);
    h.engine.add_funds("omar", 10_00, 1).await.unwrap();

    let err = h.engine.buy("omar", "HHH", 20_00, 2).await.unwrap_err();
    assert!(matches!(err, EngineError::InsufficientFunds));
    // Nothing was reserved and no quote was fetched.
    assert_eq!(h.engine.store.get_funds("omar").unwrap(), 10_00);
    assert_eq!(h.oracle.calls(), 0);
}

#[tokio::test]
async fn stale_pending_sell_restores_the_holding() {
    let h = harness(&["10.00"]);
    h.engine.add_funds("pam", 0, 1).await.unwrap();
    h.engine.store.apply_holding("pam", "III", 5).await.unwrap();

    h.engine.sell("pam", "III", 30_00, 2).await.unwrap();
    assert_eq!(h.engine.store.holding("pam", "III"), 2);

    h.clock.advance_ms(PENDING_TTL_MS + 5_000);
    h.engine.sweep_once().await;

    assert_eq!(h.engine.store.holding("pam", "III"), 5);
    assert_eq!(h.engine.store.get_funds("pam").unwrap(), 0);
}

#[tokio::test]
async fn cache_and_durable_agree_after_a_workload() {
    let h = harness(&["15.00", "22.00", "18.00"]);
    h.engine.add_funds("quin", 500_00, 1).await.unwrap();
    h.engine.buy("quin", "JJJ", 100_00, 2).await.unwrap();
    h.engine.commit_buy("quin", 3).await.unwrap();

    next_tick(&h);
    h.engine.sell("quin", "JJJ", 44_00, 4).await.unwrap();
    h.engine.commit_sell("quin", 5).await.unwrap();

    h.engine.set_buy_amount("quin", "KKK", 50_00, 6).await.unwrap();
    h.engine.set_buy_trigger("quin", "KKK", 18_00, 7).await.unwrap();
    next_tick(&h);
    h.engine.evaluate_buy_symbol("KKK").await;

    assert_eq!(h.engine.store.funds_snapshot(), h.durable.funds_snapshot());
    assert_eq!(
        h.engine.store.holdings_snapshot(),
        h.durable.holdings_snapshot()
    );
}

#[tokio::test]
async fn trigger_fire_failure_still_removes_the_trigger() {
    let h = harness(&["30.00"]);
    h.engine.add_funds("rosa", 0, 1).await.unwrap();
    h.engine.store.apply_holding("rosa", "LLL", 4).await.unwrap();
    h.engine.set_sell_amount("rosa", "LLL", 60_00, 2).await.unwrap();
    h.engine.set_sell_trigger("rosa", "LLL", 30_00, 3).await.unwrap();

    // The payout write fails mid-fire; the trigger is removed anyway and the
    // discrepancy is the operator's to reconcile.
    h.durable.set_fail_writes(true);
    h.engine.evaluate_sell_symbol("LLL").await;
    h.durable.set_fail_writes(false);

    assert!(h.engine.triggers.sell_trigger("rosa", "LLL").is_none());
    assert!(!h.engine.triggers.sell_ticker_active("LLL"));
    assert_eq!(h.engine.store.get_funds("rosa").unwrap(), 0);
}

mod http_surface {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use tower::ServiceExt;

    async fn post(router: &axum::Router, uri: &str, body: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn commands_round_trip_over_json() {
        let h = harness(&["10.00"]);
        let router = http::router(Arc::clone(&h.engine));

        let (status, _) = post(
            &router,
            "/add",
            r#"{"userId":"web","amount":10000,"transactionNum":1}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = post(
            &router,
            "/quote",
            r#"{"userId":"web","stockSymbol":"ABC","transactionNum":2}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["priceCents"], 1000);
        assert_eq!(body["symbol"], "ABC");

        let (status, body) = post(
            &router,
            "/displaySummary",
            r#"{"userId":"web","transactionNum":3}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["funds"], 10000);
    }

    #[tokio::test]
    async fn state_errors_surface_as_bad_request() {
        let h = harness(&["10.00"]);
        let router = http::router(Arc::clone(&h.engine));

        let (status, body) = post(
            &router,
            "/commitBuy",
            r#"{"userId":"web","transactionNum":1}"#,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("no pending buy"));

        let (status, _) = post(
            &router,
            "/buy",
            r#"{"userId":"web","stockSymbol":"TOOLONG","amount":100,"transactionNum":2}"#,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
