use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use crate::{
    chain::{
        contracts::{ClarityValue, ContractCall},
        tx::{TransactionEngine, TxRequest},
        OnChainPrice,
    },
    config::OracleThresholds,
    db::{
        types::{AggregatedPrice, OracleSubmission, TxKind, TxStatus},
        Database,
    },
    error::CoreError,
    metrics::Metrics,
};

const SATS_PER_USD: f64 = 100_000_000.0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Submit { reason: &'static str },
    Skip { reason: &'static str },
}

/// The submission decision tree, pure over its inputs. `now_secs` is the
/// wall clock in unix seconds; `read` is the current on-chain state.
pub fn decide(
    thresholds: &OracleThresholds,
    aggregate: &AggregatedPrice,
    read: &Result<OnChainPrice, CoreError>,
    now_secs: i64,
) -> Decision {
    if (aggregate.source_count as usize) < thresholds.min_source_count {
        return Decision::Skip {
            reason: "insufficient sources",
        };
    }

    let on_chain = match read {
        Ok(on_chain) => on_chain,
        Err(CoreError::NoPriceData) => {
            return Decision::Submit { reason: "initial" };
        }
        Err(_) => {
            return Decision::Skip {
                reason: "on-chain read failed",
            };
        }
    };

    let elapsed = now_secs.saturating_sub(on_chain.timestamp);
    if elapsed < thresholds.min_interval.as_secs() as i64 {
        return Decision::Skip {
            reason: "min interval",
        };
    }

    let on_chain_usd = on_chain.price_sats as f64 / SATS_PER_USD;
    if on_chain_usd > 0.0 {
        let pct_change = ((aggregate.price - on_chain_usd) / on_chain_usd).abs() * 100.0;
        if pct_change >= thresholds.min_pct_change {
            return Decision::Submit {
                reason: "price-change",
            };
        }
    }

    if elapsed >= thresholds.max_interval.as_secs() as i64 {
        return Decision::Submit { reason: "heartbeat" };
    }

    Decision::Skip {
        reason: "below threshold",
    }
}

pub fn usd_to_sats(price_usd: f64) -> i64 {
    (price_usd * SATS_PER_USD).round() as i64
}

/// Threshold-gated push of the latest aggregate onto the chain oracle.
pub struct OracleSubmitter {
    db: Database,
    engine: TransactionEngine,
    metrics: Metrics,
    thresholds: OracleThresholds,
    oracle_contract: String,
    chain: crate::chain::ChainClient,
}

impl OracleSubmitter {
    pub fn new(
        db: Database,
        chain: crate::chain::ChainClient,
        engine: TransactionEngine,
        metrics: Metrics,
        thresholds: OracleThresholds,
        oracle_contract: String,
    ) -> Self {
        Self {
            db,
            engine,
            metrics,
            thresholds,
            oracle_contract,
            chain,
        }
    }

    pub async fn run(self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = self.check_and_submit().await {
                tracing::error!("oracle submission check failed: {err:#}");
            }
        }
    }

    pub async fn check_and_submit(&self) -> anyhow::Result<()> {
        let Some(aggregate) = self.db.latest_aggregated_price().await? else {
            self.metrics.observe_oracle_decision("skip", "no aggregate");
            return Ok(());
        };

        let read = self
            .chain
            .read_latest_oracle_price(self.engine.sender_address())
            .await;

        let now_secs = Utc::now().timestamp();
        match decide(&self.thresholds, &aggregate, &read, now_secs) {
            Decision::Skip { reason } => {
                self.metrics.observe_oracle_decision("skip", reason);
                tracing::debug!(reason, price = aggregate.price, "oracle submission skipped");
                Ok(())
            }
            Decision::Submit { reason } => {
                let percent_change = match &read {
                    Ok(on_chain) if on_chain.price_sats > 0 => {
                        let on_chain_usd = on_chain.price_sats as f64 / SATS_PER_USD;
                        Some(((aggregate.price - on_chain_usd) / on_chain_usd).abs() * 100.0)
                    }
                    _ => None,
                };
                self.submit(&aggregate, reason, percent_change).await
            }
        }
    }

    async fn submit(
        &self,
        aggregate: &AggregatedPrice,
        reason: &'static str,
        percent_change: Option<f64>,
    ) -> anyhow::Result<()> {
        let price_sats = usd_to_sats(aggregate.price);
        let call = ContractCall::new(
            &self.oracle_contract,
            "set-aggregated-price",
            vec![ClarityValue::uint(price_sats as u128)],
        )?;
        let request = TxRequest::new(TxKind::SetAggregatedPrice, call).with_context(json!({
            "reason": reason,
            "price_sats": price_sats,
            "source_count": aggregate.source_count,
        }));

        let outcome = match self.engine.submit_new(request).await {
            Ok(outcome) => outcome,
            Err(err) => {
                self.metrics.observe_oracle_decision("submit", "broadcast_failed");
                return Err(err.into());
            }
        };

        self.db
            .insert_oracle_submission(&OracleSubmission {
                tx_id: outcome.tx_id.clone(),
                submitted_price_sats: price_sats,
                reason: reason.to_string(),
                source_count: aggregate.source_count,
                percent_change,
                status: TxStatus::Submitted,
                created_at: Utc::now(),
            })
            .await?;

        self.metrics.observe_oracle_decision("submit", reason);
        tracing::info!(
            reason,
            price_sats,
            tx_id = %outcome.tx_id,
            "aggregated price submitted on-chain"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn thresholds() -> OracleThresholds {
        OracleThresholds {
            min_source_count: 3,
            min_pct_change: 1.0,
            min_interval: Duration::from_secs(15 * 60),
            max_interval: Duration::from_secs(24 * 60 * 60),
        }
    }

    fn aggregate(price: f64, sources: i32) -> AggregatedPrice {
        AggregatedPrice {
            price,
            timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            source_count: sources,
            volatility: 0.5,
            range_24h_low: None,
            range_24h_high: None,
        }
    }

    const NOW: i64 = 1_700_000_000;

    fn on_chain(price_usd: f64, age_secs: i64) -> Result<OnChainPrice, CoreError> {
        Ok(OnChainPrice {
            price_sats: usd_to_sats(price_usd),
            timestamp: NOW - age_secs,
        })
    }

    #[test]
    fn too_few_sources_always_skips() {
        let decision = decide(&thresholds(), &aggregate(50_000.0, 2), &on_chain(40_000.0, 99_999), NOW);
        assert_eq!(decision, Decision::Skip { reason: "insufficient sources" });
    }

    #[test]
    fn initial_write_when_chain_has_no_price() {
        let decision = decide(
            &thresholds(),
            &aggregate(50_004.65, 3),
            &Err(CoreError::NoPriceData),
            NOW,
        );
        assert_eq!(decision, Decision::Submit { reason: "initial" });
    }

    #[test]
    fn other_read_failures_skip() {
        let decision = decide(
            &thresholds(),
            &aggregate(50_000.0, 4),
            &Err(CoreError::StalePrice),
            NOW,
        );
        assert_eq!(decision, Decision::Skip { reason: "on-chain read failed" });
    }

    #[test]
    fn min_interval_gates_even_large_moves() {
        let decision = decide(&thresholds(), &aggregate(60_000.0, 4), &on_chain(50_000.0, 60), NOW);
        assert_eq!(decision, Decision::Skip { reason: "min interval" });
    }

    #[test]
    fn below_threshold_move_skips() {
        // 0.40% < 1.0%, 20 minutes elapsed
        let decision = decide(
            &thresholds(),
            &aggregate(50_200.0, 4),
            &on_chain(50_000.0, 20 * 60),
            NOW,
        );
        assert_eq!(decision, Decision::Skip { reason: "below threshold" });
    }

    #[test]
    fn threshold_move_submits() {
        let decision = decide(
            &thresholds(),
            &aggregate(50_600.0, 4),
            &on_chain(50_000.0, 20 * 60),
            NOW,
        );
        assert_eq!(decision, Decision::Submit { reason: "price-change" });
    }

    #[test]
    fn heartbeat_after_max_interval() {
        let decision = decide(
            &thresholds(),
            &aggregate(50_100.0, 4),
            &on_chain(50_000.0, 25 * 60 * 60),
            NOW,
        );
        assert_eq!(decision, Decision::Submit { reason: "heartbeat" });
    }

    #[test]
    fn sats_conversion_rounds() {
        assert_eq!(usd_to_sats(50_004.651_162_790_697), 5_000_465_116_279);
        assert_eq!(usd_to_sats(0.000_000_015), 2);
    }
}
