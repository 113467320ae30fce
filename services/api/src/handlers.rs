use std::{sync::Arc, time::Instant};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;
use validator::Validate;

use crate::{
    chain::{
        contracts::{decode_stacks_address, ClarityValue, ContractCall},
        tx::TxRequest,
    },
    db::types::{Allocation, Policy, Tier, TokenKind, TxKind},
    error::CoreError,
    policies::CreatePolicyRequest,
    quotes::{BuyerQuoteRequest, ProviderQuoteRequest},
    AppState,
};

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

pub async fn metrics(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, CoreError> {
    let body = state.metrics.render().map_err(CoreError::Internal)?;
    Ok((StatusCode::OK, body))
}

pub async fn buyer_premium_quote(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BuyerQuoteRequest>,
) -> Result<impl IntoResponse, CoreError> {
    let start = Instant::now();
    request
        .validate()
        .map_err(|err| CoreError::Validation(err.to_string()))?;

    let quote = state.quotes.buyer_premium_quote(&request).await?;
    state
        .metrics
        .observe_request("buyer_premium_quote", start.elapsed());
    Ok((StatusCode::OK, Json(quote)))
}

pub async fn provider_yield_quote(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ProviderQuoteRequest>,
) -> Result<impl IntoResponse, CoreError> {
    let start = Instant::now();
    request
        .validate()
        .map_err(|err| CoreError::Validation(err.to_string()))?;

    let quote = state.quotes.provider_yield_quote(&request).await?;
    state
        .metrics
        .observe_request("provider_yield_quote", start.elapsed());
    Ok((StatusCode::OK, Json(quote)))
}

pub async fn create_policy(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreatePolicyRequest>,
) -> Result<impl IntoResponse, CoreError> {
    let start = Instant::now();
    let response = state.orchestrator.create_policy(request).await?;
    state
        .metrics
        .observe_request("create_policy", start.elapsed());
    Ok((StatusCode::ACCEPTED, Json(response)))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationView {
    pub provider: String,
    pub amount_locked: i64,
    pub percentage_bps: i64,
    pub status: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyView {
    pub id: Uuid,
    pub on_chain_id: Option<i64>,
    pub owner: String,
    pub policy_type: String,
    pub risk_tier: String,
    pub strike_cents: i64,
    pub amount_sats: i64,
    pub premium_micro: i64,
    pub creation_height: i64,
    pub expiration_height: i64,
    pub status: String,
    pub allocations: Vec<AllocationView>,
}

fn policy_view(policy: Policy, allocations: Vec<Allocation>) -> PolicyView {
    PolicyView {
        id: policy.id,
        on_chain_id: policy.on_chain_id,
        owner: policy.owner,
        policy_type: policy.policy_type.as_str().to_string(),
        risk_tier: policy.risk_tier.as_str().to_string(),
        strike_cents: policy.strike_cents,
        amount_sats: policy.amount_sats,
        premium_micro: policy.premium_micro,
        creation_height: policy.creation_height,
        expiration_height: policy.expiration_height,
        status: policy.status.as_str().to_string(),
        allocations: allocations
            .into_iter()
            .map(|a| AllocationView {
                provider: a.provider,
                amount_locked: a.amount_locked,
                percentage_bps: a.percentage_bps,
                status: a.status.as_str().to_string(),
            })
            .collect(),
    }
}

pub async fn get_policy(
    State(state): State<Arc<AppState>>,
    Path(policy_id): Path<Uuid>,
) -> Result<impl IntoResponse, CoreError> {
    let policy = state
        .db
        .get_policy(policy_id)
        .await
        .map_err(CoreError::Internal)?
        .ok_or_else(|| CoreError::Validation(format!("unknown policy: {policy_id}")))?;
    let allocations = state
        .db
        .allocations_for_policy(policy_id)
        .await
        .map_err(CoreError::Internal)?;
    Ok((StatusCode::OK, Json(policy_view(policy, allocations))))
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CapitalRequest {
    pub provider: String,
    pub tier: Tier,
    pub token: TokenKind,
    #[validate(range(min = 1))]
    pub amount: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapitalResponse {
    pub convex_id: Uuid,
    pub tx_id: String,
}

fn validate_capital(request: &CapitalRequest) -> Result<(), CoreError> {
    request
        .validate()
        .map_err(|err| CoreError::Validation(err.to_string()))?;
    decode_stacks_address(&request.provider)
        .map_err(|_| CoreError::Validation(format!("invalid provider principal: {}", request.provider)))?;
    Ok(())
}

/// Prepare the vault deposit; provider balances update when the
/// `funds-deposited` event lands.
pub async fn commit_capital(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CapitalRequest>,
) -> Result<impl IntoResponse, CoreError> {
    let start = Instant::now();
    validate_capital(&request)?;

    let function = format!("deposit-{}", request.token.contract_suffix());
    let call = ContractCall::new(
        &state.config.liquidity_pool_contract,
        &function,
        vec![
            ClarityValue::uint(request.amount as u128),
            ClarityValue::padded_ascii(request.tier.as_str(), 20).map_err(CoreError::Internal)?,
        ],
    )
    .map_err(CoreError::Internal)?;

    let outcome = state
        .engine
        .submit_new(TxRequest::new(TxKind::Deposit, call).with_context(json!({
            "provider": request.provider,
            "tier": request.tier.as_str(),
            "token": request.token.as_str(),
            "amount": request.amount,
        })))
        .await?;

    state
        .metrics
        .observe_request("commit_capital", start.elapsed());
    Ok((
        StatusCode::ACCEPTED,
        Json(CapitalResponse {
            convex_id: outcome.convex_id,
            tx_id: outcome.tx_id,
        }),
    ))
}

/// Prepare the vault withdrawal; rejected when it would dip into locked
/// collateral. Balances update when the withdraw transaction confirms.
pub async fn withdraw_capital(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CapitalRequest>,
) -> Result<impl IntoResponse, CoreError> {
    let start = Instant::now();
    validate_capital(&request)?;

    let available = state
        .db
        .available_for_withdrawal(&request.provider, request.tier, request.token)
        .await
        .map_err(CoreError::Internal)?;
    if available < request.amount {
        return Err(CoreError::Validation(format!(
            "withdrawal of {} exceeds available balance {available}",
            request.amount
        )));
    }

    let function = format!("withdraw-{}", request.token.contract_suffix());
    let call = ContractCall::new(
        &state.config.liquidity_pool_contract,
        &function,
        vec![
            ClarityValue::uint(request.amount as u128),
            ClarityValue::padded_ascii(request.tier.as_str(), 20).map_err(CoreError::Internal)?,
        ],
    )
    .map_err(CoreError::Internal)?;

    let outcome = state
        .engine
        .submit_new(TxRequest::new(TxKind::Withdraw, call).with_context(json!({
            "provider": request.provider,
            "tier": request.tier.as_str(),
            "token": request.token.as_str(),
            "amount": request.amount,
        })))
        .await?;

    state
        .metrics
        .observe_request("withdraw_capital", start.elapsed());
    Ok((
        StatusCode::ACCEPTED,
        Json(CapitalResponse {
            convex_id: outcome.convex_id,
            tx_id: outcome.tx_id,
        }),
    ))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderBalanceView {
    pub tier: String,
    pub token: String,
    pub deposited: i64,
    pub locked: i64,
    pub available: i64,
    pub premium_earned: i64,
    pub deposit_count: i32,
}

pub async fn list_provider_balances(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
) -> Result<impl IntoResponse, CoreError> {
    decode_stacks_address(&address)
        .map_err(|_| CoreError::Validation(format!("invalid principal: {address}")))?;

    let balances = state
        .db
        .provider_balances(&address)
        .await
        .map_err(CoreError::Internal)?;

    let view: Vec<ProviderBalanceView> = balances
        .into_iter()
        .map(|b| ProviderBalanceView {
            tier: b.tier.as_str().to_string(),
            token: b.token.as_str().to_string(),
            deposited: b.deposited,
            locked: b.locked,
            available: b.available(),
            premium_earned: b.premium_earned,
            deposit_count: b.deposit_count,
        })
        .collect();
    Ok((StatusCode::OK, Json(view)))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionStatusView {
    pub convex_id: Uuid,
    pub status: String,
    pub chain_tx_id: Option<String>,
    pub error: Option<String>,
    pub retry_count: i32,
}

pub async fn transaction_status(
    State(state): State<Arc<AppState>>,
    Path(convex_id): Path<Uuid>,
) -> Result<impl IntoResponse, CoreError> {
    let record = state
        .db
        .get_transaction(convex_id)
        .await
        .map_err(CoreError::Internal)?
        .ok_or_else(|| CoreError::Validation(format!("unknown transaction: {convex_id}")))?;

    Ok((
        StatusCode::OK,
        Json(TransactionStatusView {
            convex_id: record.convex_id,
            status: record.status.as_str().to_string(),
            chain_tx_id: record.chain_tx_id,
            error: record.error_details,
            retry_count: record.retry_count,
        }),
    ))
}

/// Prime the read path so the first quote does not wait on cold caches.
pub async fn warm_critical_caches(state: Arc<AppState>) -> anyhow::Result<()> {
    let _ = state.db.latest_aggregated_price().await?;
    Ok(())
}
