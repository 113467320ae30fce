use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::Row;

use super::{
    types::{AggregatedPrice, HistoricalDailyPrice, HistoricalVolatility, OracleSubmission, PriceTick, TxStatus},
    Database,
};
use crate::cache::keys;

impl Database {
    pub async fn insert_price_tick(
        &self,
        source: &str,
        price_usd: f64,
        weight: f64,
    ) -> anyhow::Result<()> {
        sqlx::query("INSERT INTO price_ticks (source, price_usd, weight) VALUES ($1, $2, $3)")
            .bind(source)
            .bind(price_usd)
            .bind(weight)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn price_ticks_since(&self, cutoff: DateTime<Utc>) -> anyhow::Result<Vec<PriceTick>> {
        let rows = sqlx::query(
            "SELECT source, price_usd, weight, ts FROM price_ticks
             WHERE ts > $1 ORDER BY ts ASC",
        )
        .bind(cutoff)
        .fetch_all(self.pool())
        .await?;

        let mut ticks = Vec::with_capacity(rows.len());
        for row in rows {
            ticks.push(PriceTick {
                source: row.try_get("source")?,
                price_usd: row.try_get("price_usd")?,
                weight: row.try_get("weight")?,
                timestamp: row.try_get("ts")?,
            });
        }
        Ok(ticks)
    }

    pub async fn insert_aggregated_price(&self, agg: &AggregatedPrice) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO aggregated_prices
                (price, ts, source_count, volatility, range_24h_low, range_24h_high)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(agg.price)
        .bind(agg.timestamp)
        .bind(agg.source_count)
        .bind(agg.volatility)
        .bind(agg.range_24h_low)
        .bind(agg.range_24h_high)
        .execute(self.pool())
        .await?;

        self.cache
            .set_json(&keys::latest_aggregated_price(), agg, Duration::from_secs(120))
            .await;
        Ok(())
    }

    pub async fn latest_aggregated_price(&self) -> anyhow::Result<Option<AggregatedPrice>> {
        let key = keys::latest_aggregated_price();
        if let Some(cached) = self.cache.get_json::<AggregatedPrice>(&key).await {
            self.metrics.observe_hit("db", "latest_aggregated_price");
            return Ok(Some(cached));
        }
        self.metrics.observe_miss("db", "latest_aggregated_price");

        let row = sqlx::query(
            "SELECT price, ts, source_count, volatility, range_24h_low, range_24h_high
             FROM aggregated_prices ORDER BY ts DESC LIMIT 1",
        )
        .fetch_optional(self.pool())
        .await?;

        let Some(row) = row else { return Ok(None) };
        let agg = AggregatedPrice {
            price: row.try_get("price")?,
            timestamp: row.try_get("ts")?,
            source_count: row.try_get("source_count")?,
            volatility: row.try_get("volatility")?,
            range_24h_low: row.try_get("range_24h_low")?,
            range_24h_high: row.try_get("range_24h_high")?,
        };
        self.cache
            .set_json(&key, &agg, Duration::from_secs(30))
            .await;
        Ok(Some(agg))
    }

    /// Latest-wins upsert; only "today" is expected to change.
    pub async fn upsert_daily_price(&self, daily: &HistoricalDailyPrice) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO historical_daily_prices (day, open, high, low, close, volume)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (day) DO UPDATE SET
                open = COALESCE(historical_daily_prices.open, EXCLUDED.open),
                high = GREATEST(historical_daily_prices.high, EXCLUDED.high),
                low = LEAST(historical_daily_prices.low, EXCLUDED.low),
                close = EXCLUDED.close,
                volume = EXCLUDED.volume",
        )
        .bind(daily.day)
        .bind(daily.open)
        .bind(daily.high)
        .bind(daily.low)
        .bind(daily.close)
        .bind(daily.volume)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn daily_closes_between(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> anyhow::Result<Vec<HistoricalDailyPrice>> {
        let rows = sqlx::query(
            "SELECT day, open, high, low, close, volume FROM historical_daily_prices
             WHERE day >= $1 AND day <= $2 ORDER BY day ASC",
        )
        .bind(from)
        .bind(to)
        .fetch_all(self.pool())
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(HistoricalDailyPrice {
                day: row.try_get("day")?,
                open: row.try_get("open")?,
                high: row.try_get("high")?,
                low: row.try_get("low")?,
                close: row.try_get("close")?,
                volume: row.try_get("volume")?,
            });
        }
        Ok(out)
    }

    /// Low/high of daily rows over the trailing 24 hours (today and
    /// yesterday at most).
    pub async fn daily_range_since(
        &self,
        from: NaiveDate,
    ) -> anyhow::Result<Option<(f64, f64)>> {
        let row = sqlx::query(
            "SELECT MIN(LEAST(COALESCE(low, close), close)) AS lo,
                    MAX(GREATEST(COALESCE(high, close), close)) AS hi
             FROM historical_daily_prices WHERE day >= $1",
        )
        .bind(from)
        .fetch_one(self.pool())
        .await?;

        let lo: Option<f64> = row.try_get("lo")?;
        let hi: Option<f64> = row.try_get("hi")?;
        Ok(lo.zip(hi))
    }

    pub async fn insert_volatility(&self, vol: &HistoricalVolatility) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO historical_volatility (period_days, ts, volatility, data_points, method)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(vol.period_days)
        .bind(vol.timestamp)
        .bind(vol.volatility)
        .bind(vol.data_points)
        .bind(&vol.method)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn latest_volatility(
        &self,
        period_days: i32,
    ) -> anyhow::Result<Option<HistoricalVolatility>> {
        let row = sqlx::query(
            "SELECT period_days, ts, volatility, data_points, method
             FROM historical_volatility
             WHERE period_days = $1 ORDER BY ts DESC LIMIT 1",
        )
        .bind(period_days)
        .fetch_optional(self.pool())
        .await?;

        let Some(row) = row else { return Ok(None) };
        Ok(Some(HistoricalVolatility {
            period_days: row.try_get("period_days")?,
            timestamp: row.try_get("ts")?,
            volatility: row.try_get("volatility")?,
            data_points: row.try_get("data_points")?,
            method: row.try_get("method")?,
        }))
    }

    pub async fn insert_oracle_submission(&self, sub: &OracleSubmission) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO oracle_submissions
                (tx_id, submitted_price_sats, reason, source_count, percent_change, status)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&sub.tx_id)
        .bind(sub.submitted_price_sats)
        .bind(&sub.reason)
        .bind(sub.source_count)
        .bind(sub.percent_change)
        .bind(sub.status.as_str())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn update_oracle_submission_status(
        &self,
        tx_id: &str,
        status: TxStatus,
    ) -> anyhow::Result<()> {
        sqlx::query("UPDATE oracle_submissions SET status = $2 WHERE tx_id = $1")
            .bind(tx_id)
            .bind(status.as_str())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn latest_oracle_submission(&self) -> anyhow::Result<Option<OracleSubmission>> {
        let row = sqlx::query(
            "SELECT tx_id, submitted_price_sats, reason, source_count, percent_change, status, created_at
             FROM oracle_submissions ORDER BY created_at DESC LIMIT 1",
        )
        .fetch_optional(self.pool())
        .await?;

        let Some(row) = row else { return Ok(None) };
        let status: String = row.try_get("status")?;
        Ok(Some(OracleSubmission {
            tx_id: row.try_get("tx_id")?,
            submitted_price_sats: row.try_get("submitted_price_sats")?,
            reason: row.try_get("reason")?,
            source_count: row.try_get("source_count")?,
            percent_change: row.try_get("percent_change")?,
            status: status.parse().map_err(anyhow::Error::msg)?,
            created_at: row.try_get("created_at")?,
        }))
    }
}
