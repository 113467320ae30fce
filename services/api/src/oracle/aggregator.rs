use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;

use crate::{
    db::{
        types::{AggregatedPrice, HistoricalDailyPrice, PriceTick},
        Database,
    },
    metrics::Metrics,
};

const TICK_WINDOW_MINUTES: i64 = 15;
const VOLATILITY_SNAPSHOT_DAYS: i32 = 30;

/// Keep only each source's most recent tick.
pub fn latest_per_source(ticks: &[PriceTick]) -> Vec<PriceTick> {
    let mut latest: HashMap<&str, &PriceTick> = HashMap::new();
    for tick in ticks {
        match latest.get(tick.source.as_str()) {
            Some(existing) if existing.timestamp >= tick.timestamp => {}
            _ => {
                latest.insert(tick.source.as_str(), tick);
            }
        }
    }
    let mut out: Vec<PriceTick> = latest.into_values().cloned().collect();
    out.sort_by(|a, b| a.source.cmp(&b.source));
    out
}

/// Tukey fence on index quartiles. Below four sources there is not enough
/// signal to call anything an outlier.
pub fn filter_outliers_iqr(ticks: Vec<PriceTick>) -> Vec<PriceTick> {
    if ticks.len() < 4 {
        return ticks;
    }
    let mut prices: Vec<f64> = ticks.iter().map(|t| t.price_usd).collect();
    prices.sort_by(|a, b| a.partial_cmp(b).expect("finite prices"));

    let n = prices.len();
    let q1 = prices[n / 4];
    let q3 = prices[3 * n / 4];
    let iqr = q3 - q1;
    let low = q1 - 1.5 * iqr;
    let high = q3 + 1.5 * iqr;

    ticks
        .into_iter()
        .filter(|t| t.price_usd >= low && t.price_usd <= high)
        .collect()
}

/// `Σ(pᵢ·wᵢ)/Σwᵢ`; `None` when the survivor set or total weight is empty.
pub fn weighted_mean(ticks: &[PriceTick]) -> Option<f64> {
    if ticks.is_empty() {
        return None;
    }
    let total_weight: f64 = ticks.iter().map(|t| t.weight).sum();
    if total_weight <= 0.0 {
        return None;
    }
    let weighted_sum: f64 = ticks.iter().map(|t| t.price_usd * t.weight).sum();
    Some(weighted_sum / total_weight)
}

/// Serializes aggregation runs; concurrent readers take the latest row.
pub struct Aggregator {
    db: Database,
    metrics: Metrics,
    deadline: Duration,
}

impl Aggregator {
    pub fn new(db: Database, metrics: Metrics, deadline: Duration) -> Self {
        Self {
            db,
            metrics,
            deadline,
        }
    }

    pub async fn run(self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match tokio::time::timeout(self.deadline, self.aggregate_current_prices()).await {
                Ok(Ok(Some(agg))) => {
                    tracing::debug!(price = agg.price, sources = agg.source_count, "aggregated");
                }
                Ok(Ok(None)) => {}
                Ok(Err(err)) => {
                    self.metrics.observe_aggregation("error");
                    tracing::error!("aggregation failed: {err:#}");
                }
                Err(_) => {
                    self.metrics.observe_aggregation("deadline");
                    tracing::warn!("aggregation cycle exceeded deadline; partial results dropped");
                }
            }
        }
    }

    /// One aggregation pass over the recent tick window.
    pub async fn aggregate_current_prices(&self) -> anyhow::Result<Option<AggregatedPrice>> {
        let now = Utc::now();
        let cutoff = now - chrono::Duration::minutes(TICK_WINDOW_MINUTES);
        let ticks = self.db.price_ticks_since(cutoff).await?;

        let survivors = filter_outliers_iqr(latest_per_source(&ticks));
        let Some(price) = weighted_mean(&survivors) else {
            self.metrics.observe_aggregation("no_data");
            tracing::warn!("no usable ticks in window; skipping aggregation");
            return Ok(None);
        };

        let volatility = match self.db.latest_volatility(VOLATILITY_SNAPSHOT_DAYS).await? {
            Some(vol) => vol.volatility,
            None => {
                tracing::warn!("no 30d volatility yet; snapshotting 0");
                0.0
            }
        };

        let yesterday = now.date_naive() - chrono::Duration::days(1);
        let range = self.db.daily_range_since(yesterday).await?;

        let agg = AggregatedPrice {
            price,
            timestamp: now,
            source_count: survivors.len() as i32,
            volatility,
            range_24h_low: range.map(|(low, _)| low),
            range_24h_high: range.map(|(_, high)| high),
        };
        self.db.insert_aggregated_price(&agg).await?;

        // Fold this run into today's daily bar.
        self.db
            .upsert_daily_price(&HistoricalDailyPrice {
                day: now.date_naive(),
                open: Some(price),
                high: Some(price),
                low: Some(price),
                close: price,
                volume: None,
            })
            .await?;

        self.metrics.observe_aggregation("ok");
        Ok(Some(agg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn tick(source: &str, price: f64, weight: f64, at_secs: i64) -> PriceTick {
        PriceTick {
            source: source.to_string(),
            price_usd: price,
            weight,
            timestamp: Utc.timestamp_opt(1_700_000_000 + at_secs, 0).unwrap(),
        }
    }

    #[test]
    fn keeps_only_latest_tick_per_source() {
        let ticks = vec![
            tick("binance", 49_000.0, 1.5, 0),
            tick("binance", 50_000.0, 1.5, 60),
            tick("kraken", 49_900.0, 1.3, 30),
        ];
        let latest = latest_per_source(&ticks);
        assert_eq!(latest.len(), 2);
        let binance = latest.iter().find(|t| t.source == "binance").unwrap();
        assert_eq!(binance.price_usd, 50_000.0);
    }

    #[test]
    fn weighted_mean_matches_hand_computation() {
        // (50000·1.5 + 50100·1.5 + 49900·1.3) / (1.5 + 1.5 + 1.3)
        let ticks = vec![
            tick("binance", 50_000.0, 1.5, 0),
            tick("coinbase", 50_100.0, 1.5, 0),
            tick("kraken", 49_900.0, 1.3, 0),
        ];
        let mean = weighted_mean(&ticks).unwrap();
        assert!((mean - 50_004.651_162_790_697).abs() < 1e-6);
    }

    #[test]
    fn weighted_mean_rejects_empty_and_zero_weight() {
        assert!(weighted_mean(&[]).is_none());
        let weightless = vec![tick("a", 100.0, 0.0, 0), tick("b", 101.0, 0.0, 0)];
        assert!(weighted_mean(&weightless).is_none());
    }

    #[test]
    fn extreme_outlier_removed_at_four_sources() {
        let ticks = vec![
            tick("binance", 50_000.0, 1.5, 0),
            tick("coinbase", 50_100.0, 1.5, 0),
            tick("kraken", 49_900.0, 1.3, 0),
            tick("badfeed", 80_000.0, 1.0, 0),
        ];
        let survivors = filter_outliers_iqr(ticks);
        assert_eq!(survivors.len(), 3);
        assert!(survivors.iter().all(|t| t.source != "badfeed"));
    }

    #[test]
    fn no_outlier_filter_below_four_sources() {
        let ticks = vec![
            tick("binance", 50_000.0, 1.5, 0),
            tick("coinbase", 50_100.0, 1.5, 0),
            tick("badfeed", 80_000.0, 1.0, 0),
        ];
        assert_eq!(filter_outliers_iqr(ticks).len(), 3);
    }
}
