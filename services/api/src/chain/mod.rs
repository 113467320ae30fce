pub mod contracts;
pub mod events;
pub mod signer;
pub mod tx;

use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    cache::{keys, RedisCache},
    config::Config,
    db::types::TxStatus,
    error::CoreError,
    metrics::Metrics,
};
use contracts::{ClarityValue, ERR_NO_PRICE_DATA, ERR_PRICE_STALE};

/// Thin client over the chain node's RPC and extended API.
#[derive(Clone)]
pub struct ChainClient {
    http: reqwest::Client,
    base_url: String,
    oracle_contract: String,
    cache: RedisCache,
    metrics: Metrics,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OnChainPrice {
    pub price_sats: i64,
    pub timestamp: i64,
}

/// Node verdict on a broadcast attempt.
#[derive(Debug, Clone)]
pub enum BroadcastOutcome {
    Accepted {
        tx_id: String,
    },
    BadNonce {
        expected: u64,
        actual: u64,
    },
    Rejected {
        reason: String,
        message: String,
    },
}

#[derive(Debug, Clone)]
pub struct TxStatusView {
    pub status: TxStatus,
    pub block_height: Option<i64>,
    pub error: Option<String>,
}

/// One raw contract event from the extended API, payload still encoded.
#[derive(Debug, Clone)]
pub struct RawContractEvent {
    pub tx_id: String,
    pub event_index: i32,
    pub value: ClarityValue,
}

impl ChainClient {
    pub fn new(config: &Config, cache: RedisCache, metrics: Metrics) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()
            .context("building chain http client")?;
        Ok(Self {
            http,
            base_url: config.chain_api_url.trim_end_matches('/').to_string(),
            oracle_contract: config.oracle_contract.clone(),
            cache,
            metrics,
        })
    }

    pub async fn tip_height(&self) -> anyhow::Result<u64> {
        let key = keys::tip_height();
        let (height, hit) = self
            .cache
            .read_through(&key, Duration::from_secs(10), || async move {
                let url = format!("{}/v2/info", self.base_url);
                let body: Value = self
                    .http
                    .get(url)
                    .send()
                    .await?
                    .error_for_status()?
                    .json()
                    .await?;
                body.get("stacks_tip_height")
                    .and_then(Value::as_u64)
                    .context("missing stacks_tip_height")
            })
            .await?;

        if hit {
            self.metrics.observe_hit("chain", "tip_height");
        } else {
            self.metrics.observe_miss("chain", "tip_height");
        }
        Ok(height)
    }

    /// Next nonce for an account, straight from the node (never cached).
    pub async fn account_nonce(&self, address: &str) -> anyhow::Result<u64> {
        let url = format!("{}/v2/accounts/{}?proof=0", self.base_url, address);
        let body: Value = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        body.get("nonce")
            .and_then(Value::as_u64)
            .context("missing nonce in account response")
    }

    pub async fn broadcast(&self, serialized_tx: &[u8]) -> anyhow::Result<BroadcastOutcome> {
        let url = format!("{}/v2/transactions", self.base_url);
        let response = self
            .http
            .post(url)
            .header("content-type", "application/octet-stream")
            .body(serialized_tx.to_vec())
            .send()
            .await
            .context("broadcast request failed")?;

        let status = response.status();
        let body: Value = response.json().await.context("broadcast response body")?;

        if status.is_success() {
            let tx_id = match &body {
                Value::String(txid) => txid.clone(),
                other => other
                    .get("txid")
                    .and_then(Value::as_str)
                    .context("missing txid in broadcast response")?
                    .to_string(),
            };
            return Ok(BroadcastOutcome::Accepted {
                tx_id: normalize_tx_id(&tx_id),
            });
        }

        Ok(parse_broadcast_rejection(&body))
    }

    pub async fn transaction_status(&self, tx_id: &str) -> anyhow::Result<TxStatusView> {
        let url = format!("{}/extended/v1/tx/{}", self.base_url, tx_id);
        let response = self.http.get(url).send().await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            // Not yet in the mempool view; still pending from our side.
            return Ok(TxStatusView {
                status: TxStatus::Pending,
                block_height: None,
                error: None,
            });
        }

        let body: Value = response.error_for_status()?.json().await?;
        let raw_status = body
            .get("tx_status")
            .and_then(Value::as_str)
            .context("missing tx_status")?;
        let block_height = body.get("block_height").and_then(Value::as_i64);

        let (status, error) = map_tx_status(raw_status);
        Ok(TxStatusView {
            status,
            block_height,
            error,
        })
    }

    /// One page of contract events plus the node's total event count for
    /// the contract (used to watch ingestion lag).
    pub async fn contract_events(
        &self,
        contract_id: &str,
        offset: i64,
        limit: u32,
    ) -> anyhow::Result<(Vec<RawContractEvent>, Option<i64>)> {
        let url = format!(
            "{}/extended/v1/address/{}/events?limit={}&offset={}",
            self.base_url, contract_id, limit, offset
        );
        let body: Value = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let results = body
            .get("results")
            .and_then(Value::as_array)
            .context("missing results in events response")?;
        let total = body.get("total").and_then(Value::as_i64);

        let mut events = Vec::with_capacity(results.len());
        for entry in results {
            events.push(parse_raw_event(entry)?);
        }
        Ok((events, total))
    }

    async fn call_read_only(
        &self,
        contract_id: &str,
        function: &str,
        args: &[ClarityValue],
        sender: &str,
    ) -> anyhow::Result<ClarityValue> {
        let (address, name) = contract_id
            .split_once('.')
            .context("malformed contract id")?;
        let url = format!(
            "{}/v2/contracts/call-read/{}/{}/{}",
            self.base_url, address, name, function
        );
        let arguments: Vec<String> = args
            .iter()
            .map(|a| format!("0x{}", hex::encode(a.serialize())))
            .collect();
        let body: Value = self
            .http
            .post(url)
            .json(&serde_json::json!({ "sender": sender, "arguments": arguments }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let okay = body.get("okay").and_then(Value::as_bool).unwrap_or(false);
        if !okay {
            let cause = body
                .get("cause")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            anyhow::bail!("read-only call {function} failed: {cause}");
        }
        let result_hex = body
            .get("result")
            .and_then(Value::as_str)
            .context("missing result")?;
        let bytes = hex::decode(result_hex.trim_start_matches("0x"))
            .context("result is not hex")?;
        ClarityValue::deserialize(&bytes)
    }

    /// Current oracle price, distinguishing "no data" (104) and "stale"
    /// (102) from transport failures.
    pub async fn read_latest_oracle_price(&self, sender: &str) -> Result<OnChainPrice, CoreError> {
        let value = self
            .call_read_only(&self.oracle_contract, "get-latest-price", &[], sender)
            .await
            .map_err(CoreError::Internal)?;
        parse_price_response(&value)
    }

    pub async fn price_at_height(
        &self,
        height: u64,
        sender: &str,
    ) -> Result<OnChainPrice, CoreError> {
        let key = keys::price_at_height(height);
        if let Some(cached) = self.cache.get_json::<OnChainPrice>(&key).await {
            self.metrics.observe_hit("chain", "price_at_height");
            return Ok(cached);
        }
        self.metrics.observe_miss("chain", "price_at_height");

        let value = self
            .call_read_only(
                &self.oracle_contract,
                "get-bitcoin-price-at-height",
                &[ClarityValue::uint(u128::from(height))],
                sender,
            )
            .await
            .map_err(CoreError::Internal)?;
        let price = parse_price_response(&value)?;

        // Historical prices never change once written.
        self.cache
            .set_json(&key, &price, Duration::from_secs(24 * 60 * 60))
            .await;
        Ok(price)
    }
}

/// Node status strings mapped into the off-chain lattice.
pub fn map_tx_status(raw: &str) -> (TxStatus, Option<String>) {
    match raw {
        "success" => (TxStatus::Confirmed, None),
        "pending" => (TxStatus::Pending, None),
        "failed" | "abort_by_response" | "abort_by_post_condition" => (
            TxStatus::Failed,
            Some(format!("transaction aborted: {raw}")),
        ),
        "dropped_replace_by_fee" => (TxStatus::Replaced, None),
        other => (TxStatus::Pending, Some(format!("unrecognized status: {other}"))),
    }
}

fn normalize_tx_id(tx_id: &str) -> String {
    let trimmed = tx_id.trim_start_matches("0x");
    format!("0x{trimmed}")
}

fn parse_raw_event(entry: &Value) -> anyhow::Result<RawContractEvent> {
    let tx_id = entry
        .get("tx_id")
        .and_then(Value::as_str)
        .context("event missing tx_id")?
        .to_string();
    let event_index = entry
        .get("event_index")
        .and_then(Value::as_i64)
        .context("event missing event_index")? as i32;
    let value_hex = entry
        .pointer("/contract_log/value/hex")
        .and_then(Value::as_str)
        .context("event missing contract_log.value.hex")?;
    let bytes = hex::decode(value_hex.trim_start_matches("0x")).context("event hex")?;
    Ok(RawContractEvent {
        tx_id,
        event_index,
        value: ClarityValue::deserialize(&bytes)?,
    })
}

fn parse_broadcast_rejection(body: &Value) -> BroadcastOutcome {
    let reason = body
        .get("reason")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let message = body
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or("broadcast rejected")
        .to_string();

    if reason == "BadNonce" {
        let expected = body
            .pointer("/reason_data/expected")
            .and_then(Value::as_u64);
        let actual = body
            .pointer("/reason_data/actual")
            .and_then(Value::as_u64)
            .unwrap_or_default();
        if let Some(expected) = expected {
            return BroadcastOutcome::BadNonce { expected, actual };
        }
    }

    BroadcastOutcome::Rejected { reason, message }
}

fn parse_price_response(value: &ClarityValue) -> Result<OnChainPrice, CoreError> {
    match value {
        ClarityValue::ResponseOk(inner) => {
            let price = inner
                .tuple_get("price")
                .and_then(|v| v.expect_uint())
                .map_err(CoreError::Internal)?;
            let timestamp = inner
                .tuple_get("timestamp")
                .and_then(|v| v.expect_uint())
                .map_err(CoreError::Internal)?;
            Ok(OnChainPrice {
                price_sats: i64::try_from(price)
                    .map_err(|_| CoreError::Reconciliation("oracle price overflows i64".into()))?,
                timestamp: i64::try_from(timestamp)
                    .map_err(|_| CoreError::Reconciliation("oracle timestamp overflows i64".into()))?,
            })
        }
        ClarityValue::ResponseErr(inner) => match inner.expect_uint() {
            Ok(ERR_NO_PRICE_DATA) => Err(CoreError::NoPriceData),
            Ok(ERR_PRICE_STALE) => Err(CoreError::StalePrice),
            Ok(code) => Err(CoreError::ChainFailed(format!("oracle read error {code}"))),
            Err(err) => Err(CoreError::Internal(err)),
        },
        other => Err(CoreError::Internal(anyhow::anyhow!(
            "unexpected oracle response shape: {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_parsing_extracts_bad_nonce() {
        let body = serde_json::json!({
            "error": "transaction rejected",
            "reason": "BadNonce",
            "reason_data": { "expected": 42, "actual": 41 }
        });
        match parse_broadcast_rejection(&body) {
            BroadcastOutcome::BadNonce { expected, actual } => {
                assert_eq!(expected, 42);
                assert_eq!(actual, 41);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn rejection_parsing_keeps_other_reasons() {
        let body = serde_json::json!({
            "error": "transaction rejected",
            "reason": "NotEnoughFunds",
        });
        match parse_broadcast_rejection(&body) {
            BroadcastOutcome::Rejected { reason, .. } => assert_eq!(reason, "NotEnoughFunds"),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn price_response_maps_error_codes() {
        let no_data = ClarityValue::ResponseErr(Box::new(ClarityValue::Uint(ERR_NO_PRICE_DATA)));
        assert!(matches!(
            parse_price_response(&no_data),
            Err(CoreError::NoPriceData)
        ));

        let stale = ClarityValue::ResponseErr(Box::new(ClarityValue::Uint(ERR_PRICE_STALE)));
        assert!(matches!(
            parse_price_response(&stale),
            Err(CoreError::StalePrice)
        ));

        let ok = ClarityValue::ResponseOk(Box::new(ClarityValue::Tuple(vec![
            ("price".to_string(), ClarityValue::Uint(5_000_000_000_000)),
            ("timestamp".to_string(), ClarityValue::Uint(1_700_000_000)),
        ])));
        let parsed = parse_price_response(&ok).unwrap();
        assert_eq!(parsed.price_sats, 5_000_000_000_000);
        assert_eq!(parsed.timestamp, 1_700_000_000);
    }
}
