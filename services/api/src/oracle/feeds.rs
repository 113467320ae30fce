//! Per-venue response parsing for the external BTC/USD feeds.
//!
//! Every venue gets its own parser over the exact JSON shape it serves;
//! nothing downstream ever touches raw feed JSON.

use anyhow::{anyhow, Context};
use serde_json::Value;

fn parse_price_str(raw: &str, source: &str) -> anyhow::Result<f64> {
    let price: f64 = raw
        .trim()
        .parse()
        .with_context(|| format!("{source}: unparsable price '{raw}'"))?;
    if !price.is_finite() || price <= 0.0 {
        anyhow::bail!("{source}: non-positive price {price}");
    }
    Ok(price)
}

fn binance(body: &Value) -> anyhow::Result<f64> {
    let raw = body
        .get("price")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("binance: missing price field"))?;
    parse_price_str(raw, "binance")
}

fn coinbase(body: &Value) -> anyhow::Result<f64> {
    let raw = body
        .pointer("/data/amount")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("coinbase: missing data.amount"))?;
    parse_price_str(raw, "coinbase")
}

fn kraken(body: &Value) -> anyhow::Result<f64> {
    if let Some(errors) = body.get("error").and_then(Value::as_array) {
        if !errors.is_empty() {
            anyhow::bail!("kraken: api error {errors:?}");
        }
    }
    let result = body
        .get("result")
        .and_then(Value::as_object)
        .ok_or_else(|| anyhow!("kraken: missing result"))?;
    let pair = result
        .values()
        .next()
        .ok_or_else(|| anyhow!("kraken: empty result"))?;
    let raw = pair
        .pointer("/c/0")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("kraken: missing last-trade close"))?;
    parse_price_str(raw, "kraken")
}

fn gemini(body: &Value) -> anyhow::Result<f64> {
    let raw = body
        .get("last")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("gemini: missing last"))?;
    parse_price_str(raw, "gemini")
}

fn bitstamp(body: &Value) -> anyhow::Result<f64> {
    let raw = body
        .get("last")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("bitstamp: missing last"))?;
    parse_price_str(raw, "bitstamp")
}

/// Dispatch on the configured source tag.
pub fn parse_feed_price(source: &str, body: &Value) -> anyhow::Result<f64> {
    match source {
        "binance" => binance(body),
        "coinbase" => coinbase(body),
        "kraken" => kraken(body),
        "gemini" => gemini(body),
        "bitstamp" => bitstamp(body),
        other => anyhow::bail!("no parser for source '{other}'"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_binance_shape() {
        let body = json!({"symbol": "BTCUSDT", "price": "50000.00"});
        assert_eq!(parse_feed_price("binance", &body).unwrap(), 50_000.0);
    }

    #[test]
    fn parses_coinbase_shape() {
        let body = json!({"data": {"base": "BTC", "currency": "USD", "amount": "50100.25"}});
        assert_eq!(parse_feed_price("coinbase", &body).unwrap(), 50_100.25);
    }

    #[test]
    fn parses_kraken_shape() {
        let body = json!({
            "error": [],
            "result": {"XXBTZUSD": {"c": ["49900.10", "0.05"], "v": ["10", "20"]}}
        });
        assert_eq!(parse_feed_price("kraken", &body).unwrap(), 49_900.10);
    }

    #[test]
    fn kraken_api_errors_are_surfaced() {
        let body = json!({"error": ["EService:Unavailable"], "result": {}});
        assert!(parse_feed_price("kraken", &body).is_err());
    }

    #[test]
    fn rejects_non_positive_prices() {
        let body = json!({"symbol": "BTCUSDT", "price": "-1"});
        assert!(parse_feed_price("binance", &body).is_err());
        let zero = json!({"last": "0"});
        assert!(parse_feed_price("gemini", &zero).is_err());
    }
}
