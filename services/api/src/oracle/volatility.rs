use std::time::Duration;

use chrono::Utc;
use statrs::statistics::Statistics;

use crate::{
    db::{types::HistoricalVolatility, Database},
    metrics::Metrics,
};

/// Lookback windows the scheduled job maintains, in days.
pub const STANDARD_WINDOWS: [i32; 5] = [30, 60, 90, 180, 360];

const TRADING_BASIS_DAYS: f64 = 365.0;
const METHOD_TAG: &str = "log-returns-stddev";

/// Annualized σ from a series of daily closes, oldest first. Returns the
/// volatility and the number of log-returns used, or `None` below two
/// returns.
pub fn annualized_volatility(closes: &[f64]) -> Option<(f64, usize)> {
    if closes.len() < 3 {
        return None;
    }
    let log_returns: Vec<f64> = closes
        .windows(2)
        .filter(|w| w[0] > 0.0 && w[1] > 0.0)
        .map(|w| (w[1] / w[0]).ln())
        .collect();
    if log_returns.len() < 2 {
        return None;
    }
    let daily = (&log_returns).std_dev();
    if !daily.is_finite() {
        return None;
    }
    Some((daily * TRADING_BASIS_DAYS.sqrt(), log_returns.len()))
}

/// Pick the standard window closest to a requested duration.
pub fn closest_windows(days: u32) -> Vec<i32> {
    let mut ordered = STANDARD_WINDOWS.to_vec();
    ordered.sort_by_key(|w| ((*w - days as i32).abs(), *w));
    ordered
}

pub struct VolatilityEngine {
    db: Database,
    metrics: Metrics,
}

pub struct VolatilityResult {
    pub volatility: f64,
    pub data_points: i32,
    pub period_days: i32,
}

impl VolatilityEngine {
    pub fn new(db: Database, metrics: Metrics) -> Self {
        Self { db, metrics }
    }

    /// Compute σ for one timeframe from stored daily closes.
    pub async fn calculate_for_timeframe(
        &self,
        days: u32,
    ) -> anyhow::Result<Option<VolatilityResult>> {
        let today = Utc::now().date_naive();
        let from = today - chrono::Duration::days(i64::from(days));
        let closes: Vec<f64> = self
            .db
            .daily_closes_between(from, today)
            .await?
            .iter()
            .map(|d| d.close)
            .collect();

        let Some((volatility, data_points)) = annualized_volatility(&closes) else {
            return Ok(None);
        };
        let preferred = (f64::from(days) * 0.8).ceil() as usize;
        if data_points < preferred {
            tracing::warn!(
                days,
                data_points,
                preferred,
                "volatility computed from a sparse window"
            );
        }
        Ok(Some(VolatilityResult {
            volatility,
            data_points: data_points as i32,
            period_days: days as i32,
        }))
    }

    /// Latest stored σ for the window closest to the requested duration,
    /// walking outward until a window has data.
    pub async fn volatility_for_duration(
        &self,
        days: u32,
    ) -> anyhow::Result<Option<HistoricalVolatility>> {
        for window in closest_windows(days) {
            if let Some(vol) = self.db.latest_volatility(window).await? {
                return Ok(Some(vol));
            }
        }
        Ok(None)
    }

    /// Scheduled job: recompute every standard window under one shared
    /// timestamp.
    pub async fn refresh_standard_windows(&self) -> anyhow::Result<usize> {
        let shared_timestamp = Utc::now();
        let mut written = 0;
        for window in STANDARD_WINDOWS {
            match self.calculate_for_timeframe(window as u32).await? {
                Some(result) => {
                    self.db
                        .insert_volatility(&HistoricalVolatility {
                            period_days: result.period_days,
                            timestamp: shared_timestamp,
                            volatility: result.volatility,
                            data_points: result.data_points,
                            method: METHOD_TAG.to_string(),
                        })
                        .await?;
                    written += 1;
                }
                None => {
                    tracing::warn!(window, "not enough daily closes for volatility window");
                }
            }
        }
        self.metrics.observe_aggregation(if written > 0 {
            "volatility_ok"
        } else {
            "volatility_empty"
        });
        Ok(written)
    }

    pub async fn run(self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.refresh_standard_windows().await {
                Ok(written) => tracing::debug!(written, "volatility windows refreshed"),
                Err(err) => tracing::error!("volatility refresh failed: {err:#}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn needs_at_least_two_returns() {
        assert!(annualized_volatility(&[]).is_none());
        assert!(annualized_volatility(&[50_000.0]).is_none());
        assert!(annualized_volatility(&[50_000.0, 50_500.0]).is_none());
        assert!(annualized_volatility(&[50_000.0, 50_500.0, 50_250.0]).is_some());
    }

    #[test]
    fn constant_series_has_zero_volatility() {
        let closes = [50_000.0; 10];
        let (sigma, points) = annualized_volatility(&closes).unwrap();
        assert_eq!(sigma, 0.0);
        assert_eq!(points, 9);
    }

    #[test]
    fn annualization_scales_by_sqrt_365() {
        // Alternating ±1% daily moves: stddev of ln-returns is known.
        let mut closes = vec![100.0];
        for i in 0..20 {
            let last = *closes.last().unwrap();
            let factor = if i % 2 == 0 { 1.01 } else { 1.0 / 1.01 };
            closes.push(last * factor);
        }
        let (sigma, points) = annualized_volatility(&closes).unwrap();
        assert_eq!(points, 20);
        let daily = sigma / 365f64.sqrt();
        // ln(1.01) ≈ 0.00995; sample stddev of an alternating ± series.
        assert!(daily > 0.009 && daily < 0.0105, "daily sigma {daily}");
    }

    #[test]
    fn closest_window_ordering() {
        assert_eq!(closest_windows(30)[0], 30);
        assert_eq!(closest_windows(40)[0], 30);
        assert_eq!(closest_windows(50)[0], 60);
        assert_eq!(closest_windows(500)[0], 360);
        // ties break toward the smaller window
        assert_eq!(closest_windows(45)[0], 30);
    }
}
