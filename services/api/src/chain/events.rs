use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;

use super::{
    contracts::{encode_stacks_address, ClarityValue},
    ChainClient, RawContractEvent,
};
use crate::{
    db::{
        types::{PolicyStatus, TokenKind, Tier},
        Database,
    },
    error::CoreError,
    metrics::Metrics,
};

/// Registry status codes used by `update-policy-status` and echoed in
/// `policy-status-updated` events.
pub const STATUS_CODE_EXERCISED: u128 = 1;
pub const STATUS_CODE_EXPIRED: u128 = 2;
pub const STATUS_CODE_SETTLED: u128 = 3;

pub fn status_from_code(code: u128) -> Option<PolicyStatus> {
    match code {
        STATUS_CODE_EXERCISED => Some(PolicyStatus::Exercised),
        STATUS_CODE_EXPIRED => Some(PolicyStatus::Expired),
        STATUS_CODE_SETTLED => Some(PolicyStatus::Settled),
        _ => None,
    }
}

/// A decoded contract event, keyed for idempotent processing.
#[derive(Debug, Clone)]
pub struct ChainEvent {
    pub tx_id: String,
    pub event_index: i32,
    pub body: ChainEventBody,
}

#[derive(Debug, Clone)]
pub enum ChainEventBody {
    PolicyCreated {
        on_chain_id: i64,
        owner: String,
        policy_type: String,
        strike_cents: i64,
        amount_sats: i64,
        premium_micro: i64,
        expiration_height: i64,
        collateral_token: TokenKind,
        settlement_token: TokenKind,
    },
    PolicyStatusUpdated {
        on_chain_id: i64,
        previous_code: u128,
        new_code: u128,
        settlement: Option<i64>,
    },
    PremiumDistributed {
        on_chain_id: i64,
        amount: i64,
        recipient: String,
        token: TokenKind,
    },
    FundsDeposited {
        depositor: String,
        amount: i64,
        token: TokenKind,
        tier: Tier,
        block_height: Option<i64>,
    },
    CollateralLocked {
        on_chain_id: i64,
        token: TokenKind,
        amount: i64,
        tier: Tier,
    },
}

impl ChainEventBody {
    pub fn topic(&self) -> &'static str {
        match self {
            ChainEventBody::PolicyCreated { .. } => "policy-created",
            ChainEventBody::PolicyStatusUpdated { .. } => "policy-status-updated",
            ChainEventBody::PremiumDistributed { .. } => "premium-distributed",
            ChainEventBody::FundsDeposited { .. } => "funds-deposited",
            ChainEventBody::CollateralLocked { .. } => "collateral-locked",
        }
    }
}

fn tuple_uint_i64(tuple: &ClarityValue, key: &str) -> anyhow::Result<i64> {
    let value = tuple.tuple_get(key)?.expect_uint()?;
    i64::try_from(value).with_context(|| format!("field '{key}' overflows i64"))
}

fn tuple_ascii(tuple: &ClarityValue, key: &str) -> anyhow::Result<String> {
    match tuple.tuple_get(key)? {
        ClarityValue::StringAscii(s) => Ok(s.trim_end().to_string()),
        other => anyhow::bail!("field '{key}' is not a string: {other:?}"),
    }
}

fn tuple_principal(tuple: &ClarityValue, key: &str) -> anyhow::Result<String> {
    match tuple.tuple_get(key)? {
        ClarityValue::Principal { version, hash160 } => {
            Ok(encode_stacks_address(*version, hash160))
        }
        other => anyhow::bail!("field '{key}' is not a principal: {other:?}"),
    }
}

fn tuple_token(tuple: &ClarityValue, key: &str) -> anyhow::Result<TokenKind> {
    let raw = tuple_ascii(tuple, key)?;
    match raw.as_str() {
        "stx" => Ok(TokenKind::Native),
        "sbtc" => Ok(TokenKind::WrappedBtc),
        other => other.parse().map_err(anyhow::Error::msg),
    }
}

/// Decode one raw event. Unknown topics return `None` and are skipped.
pub fn decode_event(raw: &RawContractEvent) -> anyhow::Result<Option<ChainEvent>> {
    let tuple = &raw.value;
    let topic = match tuple_ascii(tuple, "event") {
        Ok(topic) => topic,
        // Not a print event in our shape; other contracts share the address space.
        Err(_) => return Ok(None),
    };

    let body = match topic.as_str() {
        "policy-created" => ChainEventBody::PolicyCreated {
            on_chain_id: tuple_uint_i64(tuple, "policy-id")?,
            owner: tuple_principal(tuple, "owner")?,
            policy_type: tuple_ascii(tuple, "policy-type")?,
            strike_cents: tuple_uint_i64(tuple, "strike")?,
            amount_sats: tuple_uint_i64(tuple, "amount")?,
            premium_micro: tuple_uint_i64(tuple, "premium")?,
            expiration_height: tuple_uint_i64(tuple, "expiration-height")?,
            collateral_token: tuple_token(tuple, "collateral-token")?,
            settlement_token: tuple_token(tuple, "settlement-token")?,
        },
        "policy-status-updated" => {
            let settlement = match tuple.tuple_get("settlement") {
                Ok(ClarityValue::Some(inner)) => Some(
                    i64::try_from(inner.expect_uint()?).context("settlement overflows i64")?,
                ),
                Ok(_) | Err(_) => None,
            };
            ChainEventBody::PolicyStatusUpdated {
                on_chain_id: tuple_uint_i64(tuple, "policy-id")?,
                previous_code: tuple.tuple_get("previous")?.expect_uint()?,
                new_code: tuple.tuple_get("new")?.expect_uint()?,
                settlement,
            }
        }
        "premium-distributed" => ChainEventBody::PremiumDistributed {
            on_chain_id: tuple_uint_i64(tuple, "policy-id")?,
            amount: tuple_uint_i64(tuple, "amount")?,
            recipient: tuple_principal(tuple, "recipient")?,
            token: tuple_token(tuple, "token")?,
        },
        "funds-deposited" => ChainEventBody::FundsDeposited {
            depositor: tuple_principal(tuple, "depositor")?,
            amount: tuple_uint_i64(tuple, "amount")?,
            token: tuple_token(tuple, "token")?,
            tier: tuple_ascii(tuple, "tier")?
                .parse()
                .map_err(anyhow::Error::msg)?,
            block_height: tuple_uint_i64(tuple, "block-height").ok(),
        },
        "collateral-locked" => ChainEventBody::CollateralLocked {
            on_chain_id: tuple_uint_i64(tuple, "policy-id")?,
            token: tuple_token(tuple, "token")?,
            amount: tuple_uint_i64(tuple, "amount")?,
            tier: tuple_ascii(tuple, "tier")?
                .parse()
                .map_err(anyhow::Error::msg)?,
        },
        _ => return Ok(None),
    };

    Ok(Some(ChainEvent {
        tx_id: raw.tx_id.clone(),
        event_index: raw.event_index,
        body,
    }))
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &ChainEvent) -> anyhow::Result<()>;
}

/// Polls each tracked contract's event stream, dispatching decoded events
/// to the handler registered for their topic. The cursor advances only
/// after every event in a page handled successfully.
pub struct EventProcessor {
    db: Database,
    chain: ChainClient,
    metrics: Metrics,
    contracts: Vec<String>,
    page_limit: u32,
    lag_slo: i64,
    handlers: HashMap<String, Arc<dyn EventHandler>>,
}

impl EventProcessor {
    pub fn new(
        db: Database,
        chain: ChainClient,
        metrics: Metrics,
        contracts: Vec<String>,
        page_limit: u32,
        lag_slo: i64,
    ) -> Self {
        Self {
            db,
            chain,
            metrics,
            contracts,
            page_limit,
            lag_slo,
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, topic: &str, handler: Arc<dyn EventHandler>) {
        self.handlers.insert(topic.to_string(), handler);
    }

    pub async fn run(self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            for contract in &self.contracts {
                if let Err(err) = self.poll_contract(contract).await {
                    tracing::error!(contract = %contract, "event poll failed: {err:#}");
                }
            }
        }
    }

    pub async fn poll_contract(&self, contract: &str) -> anyhow::Result<()> {
        let mut cursor = self.db.event_cursor(contract).await?;

        loop {
            let (page, total) = self
                .chain
                .contract_events(contract, cursor, self.page_limit)
                .await?;

            if let Some(total) = total {
                let lag = total - cursor;
                if lag > self.lag_slo {
                    // Ingestion falling behind the chain is worth an alarm
                    // even while this loop keeps chewing through pages.
                    tracing::error!(
                        contract = %contract,
                        lag,
                        slo = self.lag_slo,
                        "{}",
                        CoreError::Stale
                    );
                    self.metrics.observe_event("all", "lagging");
                }
            }

            if page.is_empty() {
                return Ok(());
            }
            let page_len = page.len();

            for raw in &page {
                self.process_one(raw).await?;
            }

            cursor += page_len as i64;
            self.db.advance_event_cursor(contract, cursor).await?;

            if page_len < self.page_limit as usize {
                return Ok(());
            }
        }
    }

    async fn process_one(&self, raw: &RawContractEvent) -> anyhow::Result<()> {
        let Some(event) = decode_event(raw)? else {
            return Ok(());
        };
        let topic = event.body.topic();

        if self
            .db
            .is_event_processed(&event.tx_id, event.event_index)
            .await?
        {
            self.metrics.observe_event(topic, "replayed");
            return Ok(());
        }

        let Some(handler) = self.handlers.get(topic) else {
            tracing::debug!(topic, "no handler registered");
            return Ok(());
        };

        handler
            .handle(&event)
            .await
            .with_context(|| format!("handler for {topic} ({}#{})", event.tx_id, event.event_index))?;

        self.db
            .try_mark_event_processed(&event.tx_id, event.event_index, topic)
            .await?;
        self.metrics.observe_event(topic, "processed");
        Ok(())
    }
}
