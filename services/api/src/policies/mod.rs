pub mod expiration;
pub mod premium;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;
use validator::Validate;

use crate::{
    chain::{
        contracts::{ClarityValue, ContractCall},
        events::{status_from_code, ChainEvent, ChainEventBody, EventHandler},
        tx::{TransactionEngine, TxRequest},
        ChainClient,
    },
    config::Config,
    db::{
        types::{
            Allocation, AllocationStatus, DistributionStatus, Policy, PolicyStatus, PolicyType,
            PremiumDistribution, Tier, TokenKind, TransactionRecord, TxKind, TxStatus,
        },
        BalanceDelta, Database, PolicyPackage,
    },
    error::CoreError,
    metrics::Metrics,
    pool::{split_by_bps, Allocator},
    quotes::{BuyerQuoteRequest, QuoteEngine},
};

use premium::PremiumDistributor;

/// Burn-anchored chain: one Bitcoin block ≈ 10 minutes.
const BLOCKS_PER_DAY: i64 = 144;

const SATS_PER_BTC: f64 = 100_000_000.0;
const MICRO_PER_TOKEN: f64 = 1_000_000.0;

/// Strike bands (as % of spot) a tier will underwrite.
fn tier_strike_band(tier: Tier) -> (f64, f64) {
    match tier {
        Tier::Conservative => (50.0, 85.0),
        Tier::Balanced => (80.0, 100.0),
        Tier::Aggressive => (95.0, 120.0),
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreatePolicyRequest {
    pub owner: String,
    #[validate(range(min = 50.0, max = 150.0))]
    pub protected_value_pct: f64,
    #[validate(range(min = 0.000_001))]
    pub protection_amount_btc: f64,
    pub period_days: u32,
    pub tier: Tier,
    #[serde(default = "default_collateral_token")]
    pub collateral_token: TokenKind,
}

fn default_collateral_token() -> TokenKind {
    TokenKind::WrappedBtc
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePolicyResponse {
    pub policy_id: Uuid,
    pub convex_id: Uuid,
    pub tx_id: String,
}

/// Drives policy creation and applies chain events to the lifecycle state
/// machine.
pub struct PolicyOrchestrator {
    db: Database,
    chain: ChainClient,
    engine: TransactionEngine,
    allocator: Allocator,
    quotes: QuoteEngine,
    distributor: PremiumDistributor,
    metrics: Metrics,
    policy_registry_contract: String,
    supported_period_days: Vec<u32>,
    native_token_usd: f64,
}

impl PolicyOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Database,
        chain: ChainClient,
        engine: TransactionEngine,
        allocator: Allocator,
        quotes: QuoteEngine,
        distributor: PremiumDistributor,
        metrics: Metrics,
        config: &Config,
    ) -> Self {
        Self {
            db,
            chain,
            engine,
            allocator,
            quotes,
            distributor,
            metrics,
            policy_registry_contract: config.policy_registry_contract.clone(),
            supported_period_days: config.supported_period_days.clone(),
            native_token_usd: config.native_token_usd,
        }
    }

    fn validate(&self, request: &CreatePolicyRequest) -> Result<(), CoreError> {
        request
            .validate()
            .map_err(|err| CoreError::Validation(err.to_string()))?;

        if !self.supported_period_days.contains(&request.period_days) {
            return Err(CoreError::Validation(format!(
                "unsupported protection period: {} days",
                request.period_days
            )));
        }

        let (band_low, band_high) = tier_strike_band(request.tier);
        if request.protected_value_pct < band_low || request.protected_value_pct > band_high {
            return Err(CoreError::Validation(format!(
                "protected value {}% is outside the {} band ({band_low}%-{band_high}%)",
                request.protected_value_pct,
                request.tier.as_str()
            )));
        }

        crate::chain::contracts::decode_stacks_address(&request.owner)
            .map_err(|_| CoreError::Validation(format!("invalid owner principal: {}", request.owner)))?;

        Ok(())
    }

    /// The create-policy flow: validate, plan, quote, persist, broadcast.
    pub async fn create_policy(
        &self,
        request: CreatePolicyRequest,
    ) -> Result<CreatePolicyResponse, CoreError> {
        self.validate(&request)?;

        let amount_sats = (request.protection_amount_btc * SATS_PER_BTC).round() as i64;
        let collateral_required = amount_sats;

        let quote = self
            .quotes
            .buyer_premium_quote(&BuyerQuoteRequest {
                protected_value_pct: request.protected_value_pct,
                protection_amount_btc: request.protection_amount_btc,
                expiration_days: request.period_days,
                policy_type: "PUT".to_string(),
                current_price_override: None,
                include_scenarios: false,
            })
            .await?;
        if quote.premium <= 0.0 {
            return Err(CoreError::Validation(
                "quoted premium is zero; inputs are outside pricing bounds".to_string(),
            ));
        }

        let strike_cents = (quote.strike * 100.0).round() as i64;
        let premium_micro = (quote.premium / self.native_token_usd * MICRO_PER_TOKEN).round() as i64;

        let tip = self
            .chain
            .tip_height()
            .await
            .map_err(CoreError::Internal)? as i64;
        let expiration_height = tip + i64::from(request.period_days) * BLOCKS_PER_DAY;

        // Plan and commit with one retry: commit re-checks balances under
        // row locks and a concurrent lock can invalidate the snapshot.
        let mut last_err: Option<anyhow::Error> = None;
        for _ in 0..2 {
            let plan = self
                .allocator
                .plan(collateral_required, request.tier, request.collateral_token)
                .await?;

            let package = self.build_package(
                &request,
                amount_sats,
                strike_cents,
                premium_micro,
                tip,
                expiration_height,
                &plan.entries,
            );

            match self.db.create_policy_package(&package).await {
                Ok(()) => {
                    return self.broadcast_creation(&package).await;
                }
                Err(err) => {
                    tracing::warn!("policy package commit failed, replanning: {err:#}");
                    last_err = Some(err);
                }
            }
        }
        Err(CoreError::Internal(
            last_err.unwrap_or_else(|| anyhow::anyhow!("allocation commit failed")),
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn build_package(
        &self,
        request: &CreatePolicyRequest,
        amount_sats: i64,
        strike_cents: i64,
        premium_micro: i64,
        creation_height: i64,
        expiration_height: i64,
        entries: &[crate::pool::PlanEntry],
    ) -> PolicyPackage {
        let policy_id = Uuid::new_v4();
        let convex_id = Uuid::new_v4();

        let allocations: Vec<Allocation> = entries
            .iter()
            .map(|entry| Allocation {
                id: Uuid::new_v4(),
                policy_id,
                provider: entry.provider.clone(),
                tier: request.tier,
                token: request.collateral_token,
                amount_locked: entry.amount,
                percentage_bps: entry.percentage_bps,
                status: AllocationStatus::Pending,
            })
            .collect();

        let weights: Vec<(Uuid, i64)> = allocations
            .iter()
            .map(|a| (a.id, a.percentage_bps))
            .collect();
        let premium_shares = split_by_bps(premium_micro, &weights);

        let distributions: Vec<PremiumDistribution> = allocations
            .iter()
            .zip(premium_shares.iter())
            .map(|(alloc, (_, share))| PremiumDistribution {
                id: Uuid::new_v4(),
                policy_id,
                allocation_id: alloc.id,
                provider: alloc.provider.clone(),
                premium_share: *share,
                status: DistributionStatus::Planned,
            })
            .collect();

        let policy = Policy {
            id: policy_id,
            on_chain_id: None,
            owner: request.owner.clone(),
            policy_type: PolicyType::Put,
            risk_tier: request.tier,
            strike_cents,
            amount_sats,
            premium_micro,
            creation_height,
            expiration_height,
            status: PolicyStatus::PendingTx,
            collateral_token: request.collateral_token,
            settlement_token: request.collateral_token,
            created_at: Utc::now(),
        };

        let transaction = TransactionRecord {
            convex_id,
            chain_tx_id: None,
            kind: TxKind::CreatePolicy,
            payload: json!({
                "contract": self.policy_registry_contract,
                "function": "create-protection-policy",
                "context": { "policy_id": policy_id },
            }),
            status: TxStatus::Pending,
            error_details: None,
            nonce: None,
            retry_count: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        PolicyPackage {
            policy,
            allocations,
            distributions,
            transaction,
        }
    }

    async fn broadcast_creation(
        &self,
        package: &PolicyPackage,
    ) -> Result<CreatePolicyResponse, CoreError> {
        let policy = &package.policy;
        let call = ContractCall::new(
            &self.policy_registry_contract,
            "create-protection-policy",
            vec![
                ClarityValue::principal(&policy.owner).map_err(CoreError::Internal)?,
                ClarityValue::padded_ascii(policy.policy_type.as_str(), 8)
                    .map_err(CoreError::Internal)?,
                ClarityValue::padded_ascii(policy.risk_tier.as_str(), 32)
                    .map_err(CoreError::Internal)?,
                ClarityValue::padded_ascii("BTC", 10).map_err(CoreError::Internal)?,
                ClarityValue::padded_ascii(policy.collateral_token.contract_suffix(), 32)
                    .map_err(CoreError::Internal)?,
                ClarityValue::uint(policy.strike_cents as u128),
                ClarityValue::uint(policy.amount_sats as u128),
                ClarityValue::uint(policy.expiration_height as u128),
                ClarityValue::uint(policy.premium_micro as u128),
            ],
        )
        .map_err(CoreError::Internal)?;

        let request = TxRequest::new(TxKind::CreatePolicy, call)
            .with_context(json!({ "policy_id": policy.id }));

        match self
            .engine
            .submit_prepared(package.transaction.convex_id, request)
            .await
        {
            Ok(outcome) => {
                self.metrics
                    .observe_policy_transition("none", PolicyStatus::PendingTx.as_str());
                Ok(CreatePolicyResponse {
                    policy_id: policy.id,
                    convex_id: outcome.convex_id,
                    tx_id: outcome.tx_id,
                })
            }
            Err(err) => {
                // Broadcast never reached the chain; unwind the locks.
                let flipped = self
                    .db
                    .transition_policy(policy.id, PolicyStatus::PendingTx, PolicyStatus::Failed)
                    .await
                    .map_err(CoreError::Internal)?;
                if flipped {
                    self.db
                        .release_policy_collateral(policy.id)
                        .await
                        .map_err(CoreError::Internal)?;
                }
                Err(err)
            }
        }
    }

    /// `policy-created` observed on-chain: correlate and activate.
    async fn on_policy_created(
        &self,
        on_chain_id: i64,
        owner: &str,
        strike_cents: i64,
        amount_sats: i64,
        expiration_height: i64,
    ) -> anyhow::Result<()> {
        let Some(policy) = self
            .db
            .find_policy_by_correlation(owner, expiration_height, strike_cents, amount_sats)
            .await?
        else {
            tracing::warn!(
                on_chain_id,
                owner,
                "policy-created event with no matching pending policy"
            );
            self.db
                .record_reconciliation_error(
                    "policy-created",
                    &format!("no pending policy for on-chain id {on_chain_id} owner {owner}"),
                )
                .await?;
            return Ok(());
        };

        let activated = self.db.confirm_policy_created(policy.id, on_chain_id).await?;
        if !activated {
            return Ok(());
        }
        tracing::info!(policy_id = %policy.id, on_chain_id, "policy active");

        let Some(active) = self.db.get_policy(policy.id).await? else {
            return Ok(());
        };
        self.distributor.distribute(&active).await?;
        Ok(())
    }

    /// `policy-status-updated` observed on-chain.
    async fn on_policy_status_updated(
        &self,
        on_chain_id: i64,
        new_code: u128,
        settlement: Option<i64>,
    ) -> anyhow::Result<()> {
        let Some(policy) = self.db.find_policy_by_on_chain_id(on_chain_id).await? else {
            tracing::warn!(on_chain_id, "status update for unknown policy");
            return Ok(());
        };

        let Some(new_status) = status_from_code(new_code) else {
            tracing::warn!(on_chain_id, code = %new_code, "unrecognized policy status code");
            return Ok(());
        };

        match new_status {
            PolicyStatus::Expired => {
                // Confirmation gate: the expiration sweep only submits, and
                // this event is what retires the policy and frees its
                // collateral. Release only touches live allocations, so a
                // replayed event no-ops.
                self.db
                    .transition_policy(policy.id, PolicyStatus::Active, PolicyStatus::Expired)
                    .await?;
                let released = self.allocator.release(policy.id).await?;
                if released > 0 {
                    tracing::info!(policy_id = %policy.id, released, "policy expired worthless");
                }
            }
            PolicyStatus::Exercised => {
                let flipped = self
                    .db
                    .transition_policy(policy.id, PolicyStatus::Active, PolicyStatus::Exercised)
                    .await?;
                if flipped {
                    tracing::info!(
                        policy_id = %policy.id,
                        settlement,
                        "policy exercised; awaiting settlement payment"
                    );
                }
            }
            PolicyStatus::Settled => {
                // Terminal bookkeeping is driven by pay-settlement
                // confirmation; nothing further to apply here.
            }
            other => {
                tracing::warn!(on_chain_id, status = other.as_str(), "unexpected status code");
            }
        }
        Ok(())
    }

    async fn on_premium_distributed(&self, on_chain_id: i64) -> anyhow::Result<()> {
        let Some(policy) = self.db.find_policy_by_on_chain_id(on_chain_id).await? else {
            return Ok(());
        };
        let paid = self.db.settle_premium_distributions(policy.id).await?;
        if paid > 0 {
            tracing::info!(policy_id = %policy.id, paid, "premium distributions paid");
        }
        Ok(())
    }

    async fn on_funds_deposited(
        &self,
        depositor: &str,
        amount: i64,
        token: TokenKind,
        tier: Tier,
        block_height: Option<i64>,
    ) -> anyhow::Result<()> {
        self.db
            .apply_deposit(&BalanceDelta {
                provider: depositor.to_string(),
                tier,
                token,
                amount,
                block_height,
            })
            .await?;
        tracing::info!(depositor, amount, tier = tier.as_str(), "deposit folded into pool");
        Ok(())
    }

    async fn on_collateral_locked(
        &self,
        on_chain_id: i64,
        amount: i64,
    ) -> anyhow::Result<()> {
        // Our lock was taken at commit time; the event is a cross-check.
        if let Some(policy) = self.db.find_policy_by_on_chain_id(on_chain_id).await? {
            let allocations = self.db.allocations_for_policy(policy.id).await?;
            let local: i64 = allocations.iter().map(|a| a.amount_locked).sum();
            if local != amount {
                let detail = format!(
                    "collateral-locked mismatch on policy {}: chain {amount}, local {local}",
                    policy.id
                );
                self.db
                    .record_reconciliation_error("collateral-locked", &detail)
                    .await?;
                tracing::error!("{detail}");
            }
        }
        Ok(())
    }
}

/// Adapter wiring the orchestrator into the event processor's per-topic
/// registry.
pub struct OrchestratorEventHandler(pub Arc<PolicyOrchestrator>);

#[async_trait]
impl EventHandler for OrchestratorEventHandler {
    async fn handle(&self, event: &ChainEvent) -> anyhow::Result<()> {
        match &event.body {
            ChainEventBody::PolicyCreated {
                on_chain_id,
                owner,
                strike_cents,
                amount_sats,
                expiration_height,
                ..
            } => {
                self.0
                    .on_policy_created(
                        *on_chain_id,
                        owner,
                        *strike_cents,
                        *amount_sats,
                        *expiration_height,
                    )
                    .await
            }
            ChainEventBody::PolicyStatusUpdated {
                on_chain_id,
                new_code,
                settlement,
                ..
            } => {
                self.0
                    .on_policy_status_updated(*on_chain_id, *new_code, *settlement)
                    .await
            }
            ChainEventBody::PremiumDistributed { on_chain_id, .. } => {
                self.0.on_premium_distributed(*on_chain_id).await
            }
            ChainEventBody::FundsDeposited {
                depositor,
                amount,
                token,
                tier,
                block_height,
            } => {
                self.0
                    .on_funds_deposited(depositor, *amount, *token, *tier, *block_height)
                    .await
            }
            ChainEventBody::CollateralLocked {
                on_chain_id,
                amount,
                ..
            } => self.0.on_collateral_locked(*on_chain_id, *amount).await,
        }
    }
}
