mod events;
mod liquidity;
mod policies;
mod prices;
mod transactions;
pub mod types;

use std::time::Duration;

use anyhow::Context;
use sqlx::{postgres::PgPoolOptions, PgPool};

use crate::{cache::RedisCache, metrics::Metrics};

pub use liquidity::BalanceDelta;
pub use policies::PolicyPackage;

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    pub(crate) cache: RedisCache,
    pub(crate) metrics: Metrics,
}

impl Database {
    pub async fn new(
        database_url: &str,
        cache: RedisCache,
        metrics: Metrics,
    ) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(25)
            .min_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .context("failed to connect to postgres")?;

        let db = Self {
            pool,
            cache,
            metrics,
        };
        db.init_schema().await?;
        Ok(db)
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn init_schema(&self) -> anyhow::Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .with_context(|| format!("schema statement failed: {statement}"))?;
        }
        Ok(())
    }
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS price_ticks (
        id BIGSERIAL PRIMARY KEY,
        source TEXT NOT NULL,
        price_usd DOUBLE PRECISION NOT NULL,
        weight DOUBLE PRECISION NOT NULL,
        ts TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
    "CREATE INDEX IF NOT EXISTS price_ticks_ts_idx ON price_ticks (ts DESC)",
    "CREATE TABLE IF NOT EXISTS aggregated_prices (
        id BIGSERIAL PRIMARY KEY,
        price DOUBLE PRECISION NOT NULL,
        ts TIMESTAMPTZ NOT NULL,
        source_count INT NOT NULL,
        volatility DOUBLE PRECISION NOT NULL,
        range_24h_low DOUBLE PRECISION,
        range_24h_high DOUBLE PRECISION
    )",
    "CREATE INDEX IF NOT EXISTS aggregated_prices_ts_idx ON aggregated_prices (ts DESC)",
    "CREATE TABLE IF NOT EXISTS historical_daily_prices (
        day DATE PRIMARY KEY,
        open DOUBLE PRECISION,
        high DOUBLE PRECISION,
        low DOUBLE PRECISION,
        close DOUBLE PRECISION NOT NULL,
        volume DOUBLE PRECISION
    )",
    "CREATE TABLE IF NOT EXISTS historical_volatility (
        id BIGSERIAL PRIMARY KEY,
        period_days INT NOT NULL,
        ts TIMESTAMPTZ NOT NULL,
        volatility DOUBLE PRECISION NOT NULL,
        data_points INT NOT NULL,
        method TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS historical_volatility_window_idx
        ON historical_volatility (period_days, ts DESC)",
    "CREATE TABLE IF NOT EXISTS oracle_submissions (
        tx_id TEXT PRIMARY KEY,
        submitted_price_sats BIGINT NOT NULL,
        reason TEXT NOT NULL,
        source_count INT NOT NULL,
        percent_change DOUBLE PRECISION,
        status TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
    "CREATE TABLE IF NOT EXISTS provider_tier_balances (
        provider TEXT NOT NULL,
        tier TEXT NOT NULL,
        token TEXT NOT NULL,
        deposited BIGINT NOT NULL DEFAULT 0 CHECK (deposited >= 0),
        locked BIGINT NOT NULL DEFAULT 0 CHECK (locked >= 0 AND locked <= deposited),
        premium_earned BIGINT NOT NULL DEFAULT 0,
        last_deposit_block BIGINT,
        deposit_count INT NOT NULL DEFAULT 0,
        PRIMARY KEY (provider, tier, token)
    )",
    "CREATE TABLE IF NOT EXISTS tier_capital (
        tier TEXT NOT NULL,
        token TEXT NOT NULL,
        total_deposited BIGINT NOT NULL DEFAULT 0,
        total_locked BIGINT NOT NULL DEFAULT 0,
        capacity_limit BIGINT NOT NULL,
        PRIMARY KEY (tier, token),
        CHECK (total_locked <= total_deposited AND total_deposited <= capacity_limit)
    )",
    "CREATE TABLE IF NOT EXISTS policies (
        id UUID PRIMARY KEY,
        on_chain_id BIGINT,
        owner TEXT NOT NULL,
        policy_type TEXT NOT NULL,
        risk_tier TEXT NOT NULL,
        strike_cents BIGINT NOT NULL,
        amount_sats BIGINT NOT NULL,
        premium_micro BIGINT NOT NULL,
        creation_height BIGINT NOT NULL,
        expiration_height BIGINT NOT NULL,
        status TEXT NOT NULL,
        collateral_token TEXT NOT NULL,
        settlement_token TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
    "CREATE INDEX IF NOT EXISTS policies_status_exp_idx
        ON policies (status, expiration_height)",
    "CREATE TABLE IF NOT EXISTS allocations (
        id UUID PRIMARY KEY,
        policy_id UUID NOT NULL REFERENCES policies (id),
        provider TEXT NOT NULL,
        tier TEXT NOT NULL,
        token TEXT NOT NULL,
        amount_locked BIGINT NOT NULL,
        percentage_bps BIGINT NOT NULL,
        status TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS allocations_policy_idx ON allocations (policy_id)",
    "CREATE TABLE IF NOT EXISTS premium_distributions (
        id UUID PRIMARY KEY,
        policy_id UUID NOT NULL REFERENCES policies (id),
        allocation_id UUID NOT NULL REFERENCES allocations (id),
        provider TEXT NOT NULL,
        premium_share BIGINT NOT NULL,
        status TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS premium_distributions_policy_idx
        ON premium_distributions (policy_id)",
    "CREATE TABLE IF NOT EXISTS transactions (
        convex_id UUID PRIMARY KEY,
        chain_tx_id TEXT,
        kind TEXT NOT NULL,
        payload JSONB NOT NULL,
        status TEXT NOT NULL,
        error_details TEXT,
        nonce BIGINT,
        retry_count INT NOT NULL DEFAULT 0,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
    "CREATE INDEX IF NOT EXISTS transactions_status_idx ON transactions (status)",
    "CREATE TABLE IF NOT EXISTS processed_events (
        tx_id TEXT NOT NULL,
        event_index INT NOT NULL,
        topic TEXT NOT NULL,
        processed_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (tx_id, event_index)
    )",
    "CREATE TABLE IF NOT EXISTS event_cursors (
        contract_id TEXT PRIMARY KEY,
        next_offset BIGINT NOT NULL DEFAULT 0,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
    "CREATE TABLE IF NOT EXISTS reconciliation_errors (
        id BIGSERIAL PRIMARY KEY,
        scope TEXT NOT NULL,
        detail TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
];
