//! Quote fetching with a short-TTL per-symbol cache.
//!
//! The cache key is the symbol alone: user and nonce are per-request fields,
//! but the price is shared across users for the lifetime of the entry. An
//! entry is fresh while the oracle timestamp is under 60 s old, judged at
//! read time; there is no eviction task.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::audit::AuditLog;
use crate::clock::Clock;
use crate::error::EngineError;
use crate::money::{self, Cents};

pub const QUOTE_TTL_MS: i64 = 60_000;
const ORACLE_DEADLINE: Duration = Duration::from_secs(5);

/// A market quote. Immutable once returned.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    pub price_cents: Cents,
    pub symbol: String,
    pub user: String,
    pub server_ts_ms: i64,
    pub nonce: String,
    pub cached: bool,
}

/// Raw response from the upstream oracle.
#[derive(Debug, Clone, Deserialize)]
pub struct OracleResponse {
    pub price: String,
    pub symbol: String,
    pub user: String,
    pub timestamp: i64,
    pub cryptokey: String,
    #[serde(default)]
    pub cached: bool,
}

#[async_trait]
pub trait QuoteOracle: Send + Sync {
    async fn request_quote(&self, user: &str, symbol: &str)
        -> Result<OracleResponse, EngineError>;
}

/// HTTP client for the upstream quote oracle.
pub struct HttpQuoteOracle {
    client: reqwest::Client,
    url: String,
}

impl HttpQuoteOracle {
    pub fn new(url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl QuoteOracle for HttpQuoteOracle {
    async fn request_quote(
        &self,
        user: &str,
        symbol: &str,
    ) -> Result<OracleResponse, EngineError> {
        let response = self
            .client
            .post(&self.url)
            .timeout(ORACLE_DEADLINE)
            .json(&serde_json::json!({ "user": user, "symbol": symbol }))
            .send()
            .await
            .map_err(|err| EngineError::Unavailable(format!("quote oracle: {err}")))?
            .error_for_status()
            .map_err(|err| EngineError::Unavailable(format!("quote oracle: {err}")))?;

        response
            .json()
            .await
            .map_err(|err| EngineError::Unavailable(format!("quote oracle response: {err}")))
    }
}

/// Cached front for the oracle.
pub struct QuoteClient {
    oracle: Arc<dyn QuoteOracle>,
    cache: RwLock<HashMap<String, Quote>>,
    clock: Arc<dyn Clock>,
    audit: Arc<AuditLog>,
}

impl QuoteClient {
    pub fn new(oracle: Arc<dyn QuoteOracle>, clock: Arc<dyn Clock>, audit: Arc<AuditLog>) -> Self {
        Self {
            oracle,
            cache: RwLock::new(HashMap::new()),
            clock,
            audit,
        }
    }

    /// Fetch a quote for `symbol` on behalf of `user`.
    ///
    /// Serves from the cache while the entry is fresh (flagged `cached`, no
    /// audit event); otherwise asks the oracle, caches the result, and emits
    /// a QuoteServer audit event for the round trip.
    pub async fn fetch_quote(
        &self,
        user: &str,
        symbol: &str,
        transaction_num: i64,
    ) -> Result<Quote, EngineError> {
        let now = self.clock.now_ms();
        if let Some(hit) = self.cache.read().get(symbol) {
            if now < hit.server_ts_ms + QUOTE_TTL_MS {
                let mut quote = hit.clone();
                quote.cached = true;
                quote.user = user.to_string();
                return Ok(quote);
            }
        }

        let raw = self.oracle.request_quote(user, symbol).await?;
        let price_cents = money::parse_price_cents(&raw.price).map_err(|err| {
            EngineError::Unavailable(format!("oracle price {:?}: {err}", raw.price))
        })?;

        let quote = Quote {
            price_cents,
            symbol: raw.symbol,
            user: raw.user,
            server_ts_ms: raw.timestamp,
            nonce: raw.cryptokey,
            cached: false,
        };
        self.cache
            .write()
            .insert(symbol.to_string(), quote.clone());

        // An oracle-side cache hit is flagged in the response and is not
        // re-audited.
        if !raw.cached {
            self.audit.quote_server(
                quote.price_cents,
                &quote.symbol,
                user,
                quote.server_ts_ms,
                &quote.nonce,
                transaction_num,
            );
        }
        Ok(quote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{NullTransport, QueueKind};
    use crate::clock::ManualClock;
    use parking_lot::Mutex;

    struct FixedOracle {
        price: Mutex<String>,
        calls: std::sync::atomic::AtomicUsize,
        clock: Arc<ManualClock>,
    }

    impl FixedOracle {
        fn set_price(&self, price: &str) {
            *self.price.lock() = price.to_string();
        }

        fn calls(&self) -> usize {
            self.calls.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl QuoteOracle for FixedOracle {
        async fn request_quote(
            &self,
            user: &str,
            symbol: &str,
        ) -> Result<OracleResponse, EngineError> {
            let n = self
                .calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(OracleResponse {
                price: self.price.lock().clone(),
                symbol: symbol.to_string(),
                user: user.to_string(),
                timestamp: self.clock.now_ms(),
                cryptokey: format!("key-{n}"),
                cached: false,
            })
        }
    }

    fn client(price: &str) -> (QuoteClient, Arc<FixedOracle>, Arc<ManualClock>, Arc<AuditLog>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let oracle = Arc::new(FixedOracle {
            price: Mutex::new(price.to_string()),
            calls: std::sync::atomic::AtomicUsize::new(0),
            clock: Arc::clone(&clock),
        });
        let audit = Arc::new(AuditLog::new("test-server", Arc::new(NullTransport)));
        let client = QuoteClient::new(
            Arc::clone(&oracle) as Arc<dyn QuoteOracle>,
            Arc::clone(&clock) as Arc<dyn Clock>,
            Arc::clone(&audit),
        );
        (client, oracle, clock, audit)
    }

    #[tokio::test]
    async fn fresh_entries_are_served_from_cache() {
        let (client, oracle, clock, audit) = client("10.00");

        let first = client.fetch_quote("alice", "ABC", 1).await.unwrap();
        assert_eq!(first.price_cents, 1_000);
        assert!(!first.cached);

        clock.advance_ms(30_000);
        let second = client.fetch_quote("bob", "ABC", 2).await.unwrap();
        assert!(second.cached);
        assert_eq!(second.price_cents, 1_000);
        // The price is shared across users; the user field is per-request.
        assert_eq!(second.user, "bob");

        assert_eq!(oracle.calls(), 1);
        // Only the miss was audited.
        assert_eq!(audit.pending(QueueKind::Quote), 1);
    }

    #[tokio::test]
    async fn stale_entries_go_back_to_the_oracle() {
        let (client, oracle, clock, audit) = client("10.00");

        client.fetch_quote("alice", "ABC", 1).await.unwrap();
        oracle.set_price("12.50");
        clock.advance_ms(QUOTE_TTL_MS + 1);

        let refreshed = client.fetch_quote("alice", "ABC", 2).await.unwrap();
        assert_eq!(refreshed.price_cents, 1_250);
        assert!(!refreshed.cached);
        assert_eq!(oracle.calls(), 2);
        assert_eq!(audit.pending(QueueKind::Quote), 2);
    }

    #[tokio::test]
    async fn symbols_cache_independently() {
        let (client, oracle, _clock, _audit) = client("10.00");

        client.fetch_quote("alice", "ABC", 1).await.unwrap();
        client.fetch_quote("alice", "XYZ", 2).await.unwrap();
        client.fetch_quote("alice", "ABC", 3).await.unwrap();

        assert_eq!(oracle.calls(), 2);
    }

    #[tokio::test]
    async fn malformed_oracle_price_is_unavailable() {
        let (client, oracle, _clock, _audit) = client("1.5");
        oracle.set_price("1.5");

        let err = client.fetch_quote("alice", "ABC", 1).await.unwrap_err();
        assert!(matches!(err, EngineError::Unavailable(_)));
    }
}
