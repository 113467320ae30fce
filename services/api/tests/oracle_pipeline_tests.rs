//! Oracle pipeline scenarios: aggregation math, outlier handling, and the
//! submission decision tree, end to end over the pure pipeline stages.

use std::time::Duration;

use chrono::{TimeZone, Utc};

use bithedge_api::config::OracleThresholds;
use bithedge_api::db::types::{AggregatedPrice, PriceTick};
use bithedge_api::error::CoreError;
use bithedge_api::chain::OnChainPrice;
use bithedge_api::oracle::aggregator::{filter_outliers_iqr, latest_per_source, weighted_mean};
use bithedge_api::oracle::submitter::{decide, usd_to_sats, Decision};
use bithedge_api::oracle::volatility::annualized_volatility;

const NOW_SECS: i64 = 1_700_000_000;

fn tick(source: &str, price: f64, weight: f64, age_secs: i64) -> PriceTick {
    PriceTick {
        source: source.to_string(),
        price_usd: price,
        weight,
        timestamp: Utc.timestamp_opt(NOW_SECS - age_secs, 0).unwrap(),
    }
}

fn thresholds() -> OracleThresholds {
    OracleThresholds {
        min_source_count: 3,
        min_pct_change: 1.0,
        min_interval: Duration::from_secs(15 * 60),
        max_interval: Duration::from_secs(24 * 60 * 60),
    }
}

fn aggregate_of(ticks: &[PriceTick]) -> AggregatedPrice {
    let survivors = filter_outliers_iqr(latest_per_source(ticks));
    AggregatedPrice {
        price: weighted_mean(&survivors).expect("usable ticks"),
        timestamp: Utc.timestamp_opt(NOW_SECS, 0).unwrap(),
        source_count: survivors.len() as i32,
        volatility: 0.5,
        range_24h_low: None,
        range_24h_high: None,
    }
}

#[test]
fn initial_oracle_write_scenario() {
    // Three venues, no price on-chain yet: the pipeline aggregates the
    // weighted mean and decides to write.
    let ticks = vec![
        tick("binance", 50_000.0, 1.5, 10),
        tick("coinbase", 50_100.0, 1.5, 20),
        tick("kraken", 49_900.0, 1.3, 30),
    ];
    let aggregate = aggregate_of(&ticks);

    let expected = (50_000.0 * 1.5 + 50_100.0 * 1.5 + 49_900.0 * 1.3) / (1.5 + 1.5 + 1.3);
    assert!((aggregate.price - expected).abs() < 1e-9);
    assert_eq!(aggregate.source_count, 3);

    let decision = decide(
        &thresholds(),
        &aggregate,
        &Err(CoreError::NoPriceData),
        NOW_SECS,
    );
    assert_eq!(decision, Decision::Submit { reason: "initial" });

    let sats = usd_to_sats(aggregate.price);
    assert_eq!(sats, (expected * 1e8).round() as i64);
}

#[test]
fn below_threshold_move_is_skipped() {
    // On-chain 50,000; aggregate 50,200 (0.40% < 1.0%); 20 minutes elapsed;
    // four sources. Expect a skip and no submission.
    let ticks = vec![
        tick("binance", 50_200.0, 1.5, 5),
        tick("coinbase", 50_200.0, 1.5, 10),
        tick("kraken", 50_200.0, 1.3, 20),
        tick("gemini", 50_200.0, 1.0, 25),
    ];
    let aggregate = aggregate_of(&ticks);
    assert_eq!(aggregate.source_count, 4);

    let on_chain = Ok(OnChainPrice {
        price_sats: usd_to_sats(50_000.0),
        timestamp: NOW_SECS - 20 * 60,
    });
    let decision = decide(&thresholds(), &aggregate, &on_chain, NOW_SECS);
    assert_eq!(decision, Decision::Skip { reason: "below threshold" });
}

#[test]
fn three_or_fewer_sources_never_submit() {
    let ticks = vec![
        tick("binance", 52_000.0, 1.5, 5),
        tick("coinbase", 52_000.0, 1.5, 10),
    ];
    let aggregate = aggregate_of(&ticks);

    // Even with a huge move and a stale heartbeat the submitter skips.
    let on_chain = Ok(OnChainPrice {
        price_sats: usd_to_sats(40_000.0),
        timestamp: NOW_SECS - 48 * 60 * 60,
    });
    let decision = decide(&thresholds(), &aggregate, &on_chain, NOW_SECS);
    assert_eq!(decision, Decision::Skip { reason: "insufficient sources" });
}

#[test]
fn four_sources_with_one_extreme_outlier() {
    let ticks = vec![
        tick("binance", 50_000.0, 1.5, 5),
        tick("coinbase", 50_100.0, 1.5, 10),
        tick("kraken", 49_900.0, 1.3, 15),
        tick("badfeed", 80_000.0, 1.0, 20),
    ];
    let survivors = filter_outliers_iqr(latest_per_source(&ticks));
    assert_eq!(survivors.len(), 3);

    // The average is computed without the outlier.
    let mean = weighted_mean(&survivors).unwrap();
    let expected = (50_000.0 * 1.5 + 50_100.0 * 1.5 + 49_900.0 * 1.3) / 4.3;
    assert!((mean - expected).abs() < 1e-9);
}

#[test]
fn stale_ticks_are_superseded_by_fresh_ones() {
    let ticks = vec![
        tick("binance", 48_000.0, 1.5, 600),
        tick("binance", 50_000.0, 1.5, 5),
    ];
    let latest = latest_per_source(&ticks);
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].price_usd, 50_000.0);
}

#[test]
fn min_interval_law_holds_for_every_submit_path() {
    // Inside the minimum interval nothing submits, whatever the move.
    let cases = [40_000.0, 49_999.0, 50_001.0, 70_000.0];
    for aggregate_price in cases {
        let ticks = vec![
            tick("binance", aggregate_price, 1.5, 5),
            tick("coinbase", aggregate_price, 1.5, 10),
            tick("kraken", aggregate_price, 1.3, 15),
        ];
        let aggregate = aggregate_of(&ticks);
        let on_chain = Ok(OnChainPrice {
            price_sats: usd_to_sats(50_000.0),
            timestamp: NOW_SECS - 5 * 60,
        });
        let decision = decide(&thresholds(), &aggregate, &on_chain, NOW_SECS);
        assert!(
            matches!(decision, Decision::Skip { .. }),
            "submitted inside min interval at {aggregate_price}"
        );
    }
}

#[test]
fn volatility_from_daily_closes_annualizes() {
    // A 1%-a-day drift produces a small but nonzero annualized sigma.
    let closes: Vec<f64> = (0..31).map(|i| 50_000.0 * 1.01f64.powi(i)).collect();
    let (sigma, points) = annualized_volatility(&closes).unwrap();
    assert_eq!(points, 30);
    // Constant log-returns: the sample deviation collapses to ~0.
    assert!(sigma < 1e-9);

    let mut choppy = vec![50_000.0];
    for i in 0..30 {
        let last = *choppy.last().unwrap();
        choppy.push(if i % 2 == 0 { last * 1.02 } else { last * 0.985 });
    }
    let (choppy_sigma, _) = annualized_volatility(&choppy).unwrap();
    assert!(choppy_sigma > 0.1);
}
