//! Premium and yield quoting against the reference inputs, including the
//! degenerate-volatility and at-the-money boundaries.

use bithedge_api::config::RiskParams;
use bithedge_api::db::types::Tier;
use bithedge_api::quotes::{
    black_scholes_put, price_provider_yield, price_put_quote, PutQuoteParams,
};

fn flat_params() -> RiskParams {
    RiskParams {
        base_rate: 0.0,
        volatility_multiplier: 1.0,
        duration_factor: 0.0,
        coverage_factor: 1.0,
        ..RiskParams::default()
    }
}

fn reference_quote(include_scenarios: bool) -> bithedge_api::quotes::BuyerPremiumQuote {
    // S=50000, strike 90% => K=45000, 0.5 BTC, 30 days, sigma=0.6, r=0.02.
    price_put_quote(PutQuoteParams {
        spot: 50_000.0,
        strike_pct: 90.0,
        amount: 0.5,
        days: 30,
        sigma: 0.6,
        risk_free_rate: 0.02,
        risk_params: flat_params(),
        include_scenarios,
    })
}

#[test]
fn reference_put_quote_bounds_and_decomposition() {
    let quote = reference_quote(false);

    assert_eq!(quote.strike, 45_000.0);
    assert!(quote.premium > 0.0);
    assert!(quote.premium < 45_000.0 * 0.5);
    assert_eq!(quote.intrinsic_value, 0.0);

    // Out of the money: the whole premium is extrinsic, split 30/70.
    let extrinsic = quote.time_value + quote.volatility_impact;
    assert!((extrinsic - quote.premium).abs() < 1e-9);
    assert!((quote.time_value / extrinsic - 0.3).abs() < 1e-9);

    // Break-even sits below the strike by premium per unit.
    assert!((quote.break_even_price - (45_000.0 - quote.premium / 0.5)).abs() < 1e-9);
    assert!(quote.break_even_price < 45_000.0);

    // Premium percentage is against protected value, annualized upward.
    assert!((quote.premium_pct - quote.premium / (45_000.0 * 0.5)).abs() < 1e-12);
    assert!(
        (quote.annualized_premium_pct - quote.premium_pct * 365.0 / 30.0).abs() < 1e-12
    );
}

#[test]
fn zero_sigma_times_t_returns_discounted_intrinsic() {
    let t: f64 = 30.0 / 365.0;
    let discount = (-0.02 * t).exp();

    // ITM: intrinsic 5000 discounted.
    let itm = black_scholes_put(50_000.0, 55_000.0, 0.0, t, 0.02);
    assert!((itm - discount * 5_000.0).abs() < 1e-9);

    // OTM: worthless without volatility.
    assert_eq!(black_scholes_put(50_000.0, 45_000.0, 0.0, t, 0.02), 0.0);
}

#[test]
fn strike_equal_to_spot_keeps_time_value() {
    let quote = price_put_quote(PutQuoteParams {
        spot: 50_000.0,
        strike_pct: 100.0,
        amount: 1.0,
        days: 30,
        sigma: 0.6,
        risk_free_rate: 0.02,
        risk_params: flat_params(),
        include_scenarios: false,
    });
    assert_eq!(quote.intrinsic_value, 0.0);
    assert!(quote.premium > 0.0);
}

#[test]
fn scenario_grid_spans_minus_to_plus_fifty_percent() {
    let quote = reference_quote(true);
    let scenarios = quote.scenarios.expect("requested scenarios");
    assert_eq!(scenarios.len(), 21);

    for (i, point) in scenarios.iter().enumerate() {
        let expected_price = 50_000.0 * (1.0 + (i as f64 - 10.0) / 20.0);
        assert!((point.price - expected_price).abs() < 1e-6);
        let expected_protection = (45_000.0 - point.price).max(0.0) * 0.5;
        assert!((point.protection_value - expected_protection).abs() < 1e-6);
        assert!((point.net_value - (point.protection_value - quote.premium)).abs() < 1e-6);
    }
}

#[test]
fn deep_itm_premium_dominated_by_intrinsic() {
    let quote = price_put_quote(PutQuoteParams {
        spot: 30_000.0,
        strike_pct: 150.0,
        amount: 1.0,
        days: 7,
        sigma: 0.2,
        risk_free_rate: 0.02,
        risk_params: flat_params(),
        include_scenarios: false,
    });
    assert_eq!(quote.strike, 45_000.0);
    assert!(quote.intrinsic_value > 14_000.0);
    assert!(quote.premium >= quote.intrinsic_value * 0.99);
}

#[test]
fn provider_yield_reference_inputs() {
    let params = RiskParams::default();
    let quote = price_provider_yield(10_000.0, Tier::Balanced, 30, 50_000.0, 0.6, &params);

    // baseRate = 0.48, durationFactor = 1 - e^{-1/3}, marketFactor = 1.2
    let expected_rate = 0.6 * 0.8 * (1.0 - (-30.0f64 / 90.0).exp()) * (1.0 + (0.6 - 0.2) * 0.5);
    assert!((quote.annualized_yield_rate - expected_rate).abs() < 1e-12);

    let expected_yield = expected_rate * 30.0 / 365.0 * 10_000.0;
    assert!((quote.estimated_yield - expected_yield).abs() < 1e-9);

    // Break-even is below spot and never negative.
    assert!(quote.break_even_price < 50_000.0);
    assert!(quote.break_even_price >= 0.0);
}

#[test]
fn provider_risk_levels_order_by_tier() {
    let params = RiskParams::default();
    let c = price_provider_yield(1_000.0, Tier::Conservative, 14, 50_000.0, 0.25, &params);
    let b = price_provider_yield(1_000.0, Tier::Balanced, 14, 50_000.0, 0.25, &params);
    let a = price_provider_yield(1_000.0, Tier::Aggressive, 14, 50_000.0, 0.25, &params);
    assert!(c.risk_level < b.risk_level);
    assert!(b.risk_level < a.risk_level);
    assert!(a.risk_level <= 10);
}
