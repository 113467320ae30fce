use std::{future::Future, time::Duration};

use anyhow::Context;
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use serde::{de::DeserializeOwned, Serialize};

/// Best-effort Redis front for hot oracle and chain reads.
///
/// Price aggregation, quoting, and settlement must keep working through a
/// cache outage, so reads degrade to a miss and writes are fire-and-forget;
/// only the initial connection is allowed to fail the process.
#[derive(Clone)]
pub struct RedisCache {
    manager: ConnectionManager,
}

impl RedisCache {
    pub async fn new(redis_url: &str) -> anyhow::Result<Self> {
        let client = Client::open(redis_url).context("invalid REDIS_URL")?;
        let manager = client
            .get_connection_manager()
            .await
            .context("failed to connect to redis")?;
        Ok(Self { manager })
    }

    /// Cached value for `key`. A transport error or a value written by an
    /// older schema both count as a miss.
    pub async fn get_json<T>(&self, key: &str) -> Option<T>
    where
        T: DeserializeOwned,
    {
        let mut conn = self.manager.clone();
        let raw: Option<String> = match conn.get(key).await {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(key, "cache read skipped: {err}");
                return None;
            }
        };
        let raw = raw?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::warn!(key, "cached value no longer decodes, treating as miss: {err}");
                None
            }
        }
    }

    /// Fire-and-forget write; by the time we cache, the caller's work is
    /// already done.
    pub async fn set_json<T>(&self, key: &str, value: &T, ttl: Duration)
    where
        T: Serialize,
    {
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(key, "cache encode failed: {err}");
                return;
            }
        };
        let mut conn = self.manager.clone();
        let written: redis::RedisResult<()> = conn.set_ex(key, raw, ttl.as_secs()).await;
        if let Err(err) = written {
            tracing::warn!(key, "cache write skipped: {err}");
        }
    }

    /// Serve from the cache when possible, otherwise run the fetch and
    /// remember its result. The bool reports whether the cache answered;
    /// the only error surfaced is the fetch's own.
    pub async fn read_through<T, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        fetch: F,
    ) -> anyhow::Result<(T, bool)>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        if let Some(cached) = self.get_json(key).await {
            return Ok((cached, true));
        }

        let value = fetch().await?;
        self.set_json(key, &value, ttl).await;
        Ok((value, false))
    }
}

pub mod keys {
    pub const ORACLE_PREFIX: &str = "oracle:v1";
    pub const CHAIN_PREFIX: &str = "chain:v1";

    pub fn latest_aggregated_price() -> String {
        format!("{ORACLE_PREFIX}:aggregated:latest")
    }

    pub fn tip_height() -> String {
        format!("{CHAIN_PREFIX}:tip_height")
    }

    pub fn price_at_height(height: u64) -> String {
        format!("{CHAIN_PREFIX}:oracle:height:{height}")
    }
}
