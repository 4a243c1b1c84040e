//! PostgreSQL pool and the durable side of the balance store.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use tracing::info;

use crate::money::Cents;
use crate::store::{DurableStore, Shares, StoreError};

/// Create a connection pool to PostgreSQL.
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(std::time::Duration::from_secs(5))
        .connect(database_url)
        .await?;

    info!("connected to database");
    Ok(pool)
}

/// Create the funds and holdings tables if this is a fresh database.
pub async fn init_schema(pool: &PgPool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS users (
            user_name TEXT PRIMARY KEY,
            funds BIGINT NOT NULL CHECK (funds >= 0)
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS stocks (
            user_name TEXT NOT NULL,
            stock_symbol TEXT NOT NULL,
            amount BIGINT NOT NULL CHECK (amount >= 0),
            PRIMARY KEY (user_name, stock_symbol)
        )",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Durable store backed by PostgreSQL. Every write replaces the stored value
/// outright, so replaying a write is harmless.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn unavailable(err: sqlx::Error) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

#[async_trait]
impl DurableStore for PostgresStore {
    async fn put_funds(&self, user: &str, cents: Cents) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO users (user_name, funds) VALUES ($1, $2)
             ON CONFLICT (user_name) DO UPDATE SET funds = EXCLUDED.funds",
        )
        .bind(user)
        .bind(cents)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(())
    }

    async fn put_holding(
        &self,
        user: &str,
        symbol: &str,
        shares: Shares,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO stocks (user_name, stock_symbol, amount) VALUES ($1, $2, $3)
             ON CONFLICT (user_name, stock_symbol) DO UPDATE SET amount = EXCLUDED.amount",
        )
        .bind(user)
        .bind(symbol)
        .bind(shares)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(())
    }

    async fn load_funds(&self) -> Result<HashMap<String, Cents>, StoreError> {
        let rows = sqlx::query("SELECT user_name, funds FROM users")
            .fetch_all(&self.pool)
            .await
            .map_err(unavailable)?;

        Ok(rows
            .into_iter()
            .map(|row| (row.get("user_name"), row.get("funds")))
            .collect())
    }

    async fn load_holdings(&self) -> Result<HashMap<(String, String), Shares>, StoreError> {
        let rows = sqlx::query("SELECT user_name, stock_symbol, amount FROM stocks")
            .fetch_all(&self.pool)
            .await
            .map_err(unavailable)?;

        Ok(rows
            .into_iter()
            .map(|row| {
                (
                    (row.get("user_name"), row.get("stock_symbol")),
                    row.get("amount"),
                )
            })
            .collect())
    }
}
