use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};
use validator::Validate;

use crate::{
    config::RiskParams,
    db::{types::Tier, Database},
    error::CoreError,
    oracle::volatility::VolatilityEngine,
};

const DAYS_PER_YEAR: f64 = 365.0;
const TIME_VALUE_SHARE: f64 = 0.3;
const SCENARIO_STEPS: i32 = 10;

fn norm_cdf(x: f64) -> f64 {
    let normal = Normal::new(0.0, 1.0).expect("unit normal");
    normal.cdf(x)
}

/// Black-Scholes European PUT premium per unit of underlying. Degenerate
/// `σ·√T = 0` collapses to the discounted intrinsic value.
pub fn black_scholes_put(spot: f64, strike: f64, sigma: f64, t_years: f64, rate: f64) -> f64 {
    let discount = (-rate * t_years).exp();
    let vol_sqrt_t = sigma * t_years.sqrt();
    if vol_sqrt_t == 0.0 {
        return discount * (strike - spot).max(0.0);
    }

    let d1 = ((spot / strike).ln() + (rate + sigma * sigma / 2.0) * t_years) / vol_sqrt_t;
    let d2 = d1 - vol_sqrt_t;
    let premium = strike * discount * norm_cdf(-d2) - spot * norm_cdf(-d1);
    if premium.is_finite() {
        premium.max(0.0)
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct BuyerQuoteRequest {
    /// Strike as a percentage of spot.
    #[validate(range(min = 50.0, max = 150.0))]
    pub protected_value_pct: f64,
    #[validate(range(min = 0.000_001))]
    pub protection_amount_btc: f64,
    #[validate(range(min = 1, max = 365))]
    pub expiration_days: u32,
    #[serde(default = "default_policy_type")]
    pub policy_type: String,
    pub current_price_override: Option<f64>,
    #[serde(default)]
    pub include_scenarios: bool,
}

fn default_policy_type() -> String {
    "PUT".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioPoint {
    pub price: f64,
    pub protection_value: f64,
    pub net_value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuyerPremiumQuote {
    pub spot: f64,
    pub strike: f64,
    pub sigma: f64,
    pub premium: f64,
    pub premium_per_unit: f64,
    pub intrinsic_value: f64,
    pub time_value: f64,
    pub volatility_impact: f64,
    pub break_even_price: f64,
    pub premium_pct: f64,
    pub annualized_premium_pct: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scenarios: Option<Vec<ScenarioPoint>>,
}

impl BuyerPremiumQuote {
    fn zero(spot: f64, strike: f64, sigma: f64) -> Self {
        Self {
            spot,
            strike,
            sigma,
            premium: 0.0,
            premium_per_unit: 0.0,
            intrinsic_value: 0.0,
            time_value: 0.0,
            volatility_impact: 0.0,
            break_even_price: strike,
            premium_pct: 0.0,
            annualized_premium_pct: 0.0,
            scenarios: None,
        }
    }
}

/// Fully determined pricing inputs, after spot and σ resolution.
#[derive(Debug, Clone, Copy)]
pub struct PutQuoteParams {
    pub spot: f64,
    pub strike_pct: f64,
    pub amount: f64,
    pub days: u32,
    pub sigma: f64,
    pub risk_free_rate: f64,
    pub risk_params: RiskParams,
    pub include_scenarios: bool,
}

/// Pure PUT premium quote; every RPC and orchestrator path funnels here.
pub fn price_put_quote(params: PutQuoteParams) -> BuyerPremiumQuote {
    let PutQuoteParams {
        spot,
        strike_pct,
        amount,
        days,
        sigma,
        risk_free_rate,
        risk_params,
        include_scenarios,
    } = params;

    let strike = spot * strike_pct / 100.0;
    let t_years = f64::from(days) / DAYS_PER_YEAR;

    if spot <= 0.0 || strike <= 0.0 || amount <= 0.0 || t_years <= 0.0 || sigma < 0.0 {
        return BuyerPremiumQuote::zero(spot, strike, sigma);
    }

    let per_unit = black_scholes_put(spot, strike, sigma, t_years, risk_free_rate);
    let adjusted = per_unit
        * (1.0 + risk_params.base_rate)
        * risk_params.volatility_multiplier
        * (1.0 + t_years * risk_params.duration_factor)
        * risk_params.coverage_factor;

    if !adjusted.is_finite() {
        return BuyerPremiumQuote::zero(spot, strike, sigma);
    }

    let premium = adjusted * amount;
    let intrinsic = (strike - spot).max(0.0) * amount;
    let extrinsic = (premium - intrinsic).max(0.0);
    let time_value = extrinsic * TIME_VALUE_SHARE;
    let volatility_impact = extrinsic * (1.0 - TIME_VALUE_SHARE);

    let break_even_price = strike - premium / amount;
    let premium_pct = premium / (strike * amount);
    let annualized_premium_pct = premium_pct * DAYS_PER_YEAR / f64::from(days);

    let scenarios = include_scenarios.then(|| {
        (-SCENARIO_STEPS..=SCENARIO_STEPS)
            .map(|i| {
                let price = spot * (1.0 + f64::from(i) / 20.0);
                let protection_value = (strike - price).max(0.0) * amount;
                ScenarioPoint {
                    price,
                    protection_value,
                    net_value: protection_value - premium,
                }
            })
            .collect()
    });

    BuyerPremiumQuote {
        spot,
        strike,
        sigma,
        premium,
        premium_per_unit: adjusted,
        intrinsic_value: intrinsic,
        time_value,
        volatility_impact,
        break_even_price,
        premium_pct,
        annualized_premium_pct,
        scenarios,
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ProviderQuoteRequest {
    #[validate(range(min = 1.0))]
    pub commitment_usd: f64,
    pub tier: Tier,
    #[validate(range(min = 1, max = 365))]
    pub period_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderYieldQuote {
    pub annualized_yield_rate: f64,
    pub estimated_yield: f64,
    pub break_even_price: f64,
    pub risk_level: u8,
    pub sigma: f64,
    pub spot: f64,
}

/// Provider yield quote, pure over spot and σ.
pub fn price_provider_yield(
    commitment_usd: f64,
    tier: Tier,
    period_days: u32,
    spot: f64,
    sigma: f64,
    risk_params: &RiskParams,
) -> ProviderYieldQuote {
    let tier_multiplier = match tier {
        Tier::Conservative => risk_params.tier_multiplier_conservative,
        Tier::Balanced => risk_params.tier_multiplier_balanced,
        Tier::Aggressive => risk_params.tier_multiplier_aggressive,
    };

    let base_annual_rate = sigma * 0.8;
    let duration_factor = 1.0 - (-f64::from(period_days) / 90.0).exp();
    let market_factor = 1.0 + (sigma - 0.2) * 0.5;
    let annualized_yield_rate = base_annual_rate * tier_multiplier * duration_factor * market_factor;

    let estimated_yield =
        annualized_yield_rate * f64::from(period_days) / DAYS_PER_YEAR * commitment_usd;

    let break_even_price = if commitment_usd > 0.0 {
        (spot * (1.0 - estimated_yield / commitment_usd)).max(0.0)
    } else {
        0.0
    };

    let tier_base: u8 = match tier {
        Tier::Conservative => 1,
        Tier::Balanced => 3,
        Tier::Aggressive => 5,
    };
    let duration_bucket: u8 = match period_days {
        0..=29 => 0,
        30..=89 => 1,
        _ => 2,
    };
    let sigma_bucket: u8 = if sigma < 0.3 {
        0
    } else if sigma < 0.6 {
        1
    } else {
        2
    };
    let risk_level = (tier_base + duration_bucket + sigma_bucket).clamp(1, 10);

    ProviderYieldQuote {
        annualized_yield_rate,
        estimated_yield,
        break_even_price,
        risk_level,
        sigma,
        spot,
    }
}

/// Read-side quoting over the latest aggregate and stored volatility.
#[derive(Clone)]
pub struct QuoteEngine {
    db: Database,
    risk_params: RiskParams,
    risk_free_rate: f64,
}

impl QuoteEngine {
    pub fn new(db: Database, risk_params: RiskParams, risk_free_rate: f64) -> Self {
        Self {
            db,
            risk_params,
            risk_free_rate,
        }
    }

    async fn resolve_spot_and_sigma(
        &self,
        override_price: Option<f64>,
        days: u32,
    ) -> Result<(f64, f64), CoreError> {
        let spot = match override_price {
            Some(price) if price > 0.0 => price,
            Some(price) => {
                return Err(CoreError::Validation(format!(
                    "currentPriceOverride must be positive, got {price}"
                )))
            }
            None => {
                self.db
                    .latest_aggregated_price()
                    .await
                    .map_err(CoreError::Internal)?
                    .ok_or(CoreError::NoPriceData)?
                    .price
            }
        };

        let volatility_engine = VolatilityEngine::new(self.db.clone(), self.db.metrics.clone());
        let sigma = volatility_engine
            .volatility_for_duration(days)
            .await
            .map_err(CoreError::Internal)?
            .map(|v| v.volatility)
            .unwrap_or_else(|| {
                tracing::warn!(days, "no stored volatility; quoting with zero sigma");
                0.0
            });

        Ok((spot, sigma))
    }

    pub async fn buyer_premium_quote(
        &self,
        request: &BuyerQuoteRequest,
    ) -> Result<BuyerPremiumQuote, CoreError> {
        if request.policy_type != "PUT" {
            return Err(CoreError::Validation(format!(
                "unsupported policy type: {}",
                request.policy_type
            )));
        }

        let (spot, sigma) = self
            .resolve_spot_and_sigma(request.current_price_override, request.expiration_days)
            .await?;

        Ok(price_put_quote(PutQuoteParams {
            spot,
            strike_pct: request.protected_value_pct,
            amount: request.protection_amount_btc,
            days: request.expiration_days,
            sigma,
            risk_free_rate: self.risk_free_rate,
            risk_params: self.risk_params,
            include_scenarios: request.include_scenarios,
        }))
    }

    pub async fn provider_yield_quote(
        &self,
        request: &ProviderQuoteRequest,
    ) -> Result<ProviderYieldQuote, CoreError> {
        let (spot, sigma) = self.resolve_spot_and_sigma(None, request.period_days).await?;
        Ok(price_provider_yield(
            request.commitment_usd,
            request.tier,
            request.period_days,
            spot,
            sigma,
            &self.risk_params,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_risk_params() -> RiskParams {
        RiskParams {
            base_rate: 0.0,
            volatility_multiplier: 1.0,
            duration_factor: 0.0,
            coverage_factor: 1.0,
            ..RiskParams::default()
        }
    }

    #[test]
    fn put_premium_matches_reference_inputs() {
        // S=50000, K=45000 (90%), 30 days, sigma=0.6, r=0.02
        let quote = price_put_quote(PutQuoteParams {
            spot: 50_000.0,
            strike_pct: 90.0,
            amount: 0.5,
            days: 30,
            sigma: 0.6,
            risk_free_rate: 0.02,
            risk_params: flat_risk_params(),
            include_scenarios: false,
        });

        assert_eq!(quote.strike, 45_000.0);
        assert!(quote.premium > 0.0);
        assert!(quote.premium < quote.strike * 0.5);
        assert_eq!(quote.intrinsic_value, 0.0);

        // Cross-check the closed form directly.
        let t: f64 = 30.0 / 365.0;
        let d1 = ((50_000.0f64 / 45_000.0).ln() + (0.02 + 0.18) * t) / (0.6 * t.sqrt());
        let d2 = d1 - 0.6 * t.sqrt();
        let expected =
            45_000.0 * (-0.02 * t).exp() * norm_cdf(-d2) - 50_000.0 * norm_cdf(-d1);
        assert!((quote.premium_per_unit - expected).abs() < 1e-9);
        assert!((quote.premium - expected * 0.5).abs() < 1e-9);
        assert!((quote.break_even_price - (45_000.0 - quote.premium / 0.5)).abs() < 1e-9);
    }

    #[test]
    fn zero_vol_collapses_to_discounted_intrinsic() {
        let t: f64 = 30.0 / 365.0;
        // In the money: K=55000 > S=50000
        let per_unit = black_scholes_put(50_000.0, 55_000.0, 0.0, t, 0.02);
        let expected = (-0.02 * t).exp() * 5_000.0;
        assert!((per_unit - expected).abs() < 1e-9);

        // Out of the money collapses to zero
        assert_eq!(black_scholes_put(50_000.0, 45_000.0, 0.0, t, 0.02), 0.0);
    }

    #[test]
    fn at_the_money_has_no_intrinsic_but_positive_premium() {
        let quote = price_put_quote(PutQuoteParams {
            spot: 50_000.0,
            strike_pct: 100.0,
            amount: 1.0,
            days: 30,
            sigma: 0.6,
            risk_free_rate: 0.02,
            risk_params: flat_risk_params(),
            include_scenarios: false,
        });
        assert_eq!(quote.intrinsic_value, 0.0);
        assert!(quote.premium > 0.0);
        assert!(quote.time_value > 0.0);
        assert!(quote.volatility_impact > quote.time_value);
    }

    #[test]
    fn guardrails_return_zero_premium() {
        let bad_amount = price_put_quote(PutQuoteParams {
            spot: 50_000.0,
            strike_pct: 90.0,
            amount: 0.0,
            days: 30,
            sigma: 0.6,
            risk_free_rate: 0.02,
            risk_params: flat_risk_params(),
            include_scenarios: false,
        });
        assert_eq!(bad_amount.premium, 0.0);

        let bad_spot = price_put_quote(PutQuoteParams {
            spot: -1.0,
            strike_pct: 90.0,
            amount: 1.0,
            days: 30,
            sigma: 0.6,
            risk_free_rate: 0.02,
            risk_params: flat_risk_params(),
            include_scenarios: false,
        });
        assert_eq!(bad_spot.premium, 0.0);
    }

    #[test]
    fn scenario_grid_has_21_points() {
        let quote = price_put_quote(PutQuoteParams {
            spot: 50_000.0,
            strike_pct: 90.0,
            amount: 0.5,
            days: 30,
            sigma: 0.6,
            risk_free_rate: 0.02,
            risk_params: flat_risk_params(),
            include_scenarios: true,
        });
        let scenarios = quote.scenarios.unwrap();
        assert_eq!(scenarios.len(), 21);
        assert!((scenarios[0].price - 25_000.0).abs() < 1e-9);
        assert!((scenarios[20].price - 75_000.0).abs() < 1e-9);
        // Downside scenarios carry protection value
        assert!(scenarios[0].protection_value > 0.0);
        assert_eq!(scenarios[20].protection_value, 0.0);
        assert!((scenarios[0].net_value
            - (scenarios[0].protection_value - quote.premium))
            .abs()
            < 1e-9);
    }

    #[test]
    fn risk_adjustment_scales_premium() {
        let base = price_put_quote(PutQuoteParams {
            spot: 50_000.0,
            strike_pct: 90.0,
            amount: 1.0,
            days: 30,
            sigma: 0.6,
            risk_free_rate: 0.02,
            risk_params: flat_risk_params(),
            include_scenarios: false,
        });
        let adjusted = price_put_quote(PutQuoteParams {
            spot: 50_000.0,
            strike_pct: 90.0,
            amount: 1.0,
            days: 30,
            sigma: 0.6,
            risk_free_rate: 0.02,
            risk_params: RiskParams::default(),
            include_scenarios: false,
        });
        let factor = (1.0 + 0.06) * 1.1 * (1.0 + (30.0 / 365.0) * 0.15);
        assert!((adjusted.premium - base.premium * factor).abs() < 1e-6);
    }

    #[test]
    fn provider_yield_follows_tier_multipliers() {
        let params = RiskParams::default();
        let conservative =
            price_provider_yield(10_000.0, Tier::Conservative, 90, 50_000.0, 0.5, &params);
        let balanced = price_provider_yield(10_000.0, Tier::Balanced, 90, 50_000.0, 0.5, &params);
        let aggressive =
            price_provider_yield(10_000.0, Tier::Aggressive, 90, 50_000.0, 0.5, &params);

        assert!(conservative.annualized_yield_rate < balanced.annualized_yield_rate);
        assert!(balanced.annualized_yield_rate < aggressive.annualized_yield_rate);
        let ratio = aggressive.annualized_yield_rate / balanced.annualized_yield_rate;
        assert!((ratio - 1.3).abs() < 1e-9);

        // sigma=0.5: baseRate 0.4, 90d duration factor 1-e^-1, market 1.15
        let expected_balanced = 0.5 * 0.8 * (1.0 - (-1.0f64).exp()) * 1.15;
        assert!((balanced.annualized_yield_rate - expected_balanced).abs() < 1e-9);

        // base 1/3/5, +2 for the 90-day bucket, +1 for sigma 0.5
        assert_eq!(conservative.risk_level, 4);
        assert_eq!(balanced.risk_level, 6);
        assert_eq!(aggressive.risk_level, 8);
        assert!(balanced.break_even_price < 50_000.0);
    }
}
