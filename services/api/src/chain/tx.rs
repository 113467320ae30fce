use std::sync::Arc;

use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    contracts::{decode_stacks_address, ContractCall},
    signer::Signer,
    BroadcastOutcome, ChainClient,
};
use crate::{
    config::Network,
    db::{
        types::{TransactionRecord, TxKind, TxStatus},
        Database,
    },
    error::CoreError,
    metrics::Metrics,
    pool::split_by_bps,
};

const DEFAULT_FEE_MICRO: u64 = 3_000;
const MAX_NONCE_RETRIES: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostConditionMode {
    Allow,
    Deny,
}

impl PostConditionMode {
    fn byte(self) -> u8 {
        match self {
            PostConditionMode::Allow => 0x01,
            PostConditionMode::Deny => 0x02,
        }
    }
}

/// Fungible-token movement bound the node enforces at apply time.
#[derive(Debug, Clone)]
pub struct PostCondition {
    pub principal: String,
    pub condition_code: u8,
    pub amount_micro: u64,
}

impl PostCondition {
    fn serialize(&self) -> anyhow::Result<Vec<u8>> {
        let (version, hash160) = decode_stacks_address(&self.principal)?;
        let mut out = Vec::with_capacity(30);
        out.push(version);
        out.extend_from_slice(&hash160);
        out.push(self.condition_code);
        out.extend_from_slice(&self.amount_micro.to_be_bytes());
        Ok(out)
    }
}

/// One outbound contract call, ready for the engine.
#[derive(Debug, Clone)]
pub struct TxRequest {
    pub kind: TxKind,
    pub call: ContractCall,
    pub post_condition_mode: PostConditionMode,
    pub post_conditions: Vec<PostCondition>,
    pub nonce_override: Option<u64>,
    pub fee_micro: u64,
    /// Caller context folded into the persisted payload for audit.
    pub context: serde_json::Value,
}

impl TxRequest {
    pub fn new(kind: TxKind, call: ContractCall) -> Self {
        Self {
            kind,
            call,
            post_condition_mode: PostConditionMode::Allow,
            post_conditions: Vec::new(),
            nonce_override: None,
            fee_micro: DEFAULT_FEE_MICRO,
            context: json!({}),
        }
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }

    pub fn deny_other_transfers(mut self) -> Self {
        self.post_condition_mode = PostConditionMode::Deny;
        self
    }

    fn payload_json(&self) -> serde_json::Value {
        json!({
            "contract": format!("{}.{}", self.call.contract_address, self.call.contract_name),
            "function": self.call.function_name,
            "arg_count": self.call.args.len(),
            "context": self.context,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub convex_id: Uuid,
    pub tx_id: String,
    pub nonce: u64,
    pub retry_count: u32,
}

/// Builds, signs, and broadcasts contract calls. Nonce acquisition and
/// broadcast are serialized so parallel submissions cannot reuse a nonce.
#[derive(Clone)]
pub struct TransactionEngine {
    chain: ChainClient,
    db: Database,
    signer: Arc<Signer>,
    metrics: Metrics,
    network: Network,
    nonce_lock: Arc<Mutex<()>>,
}

impl TransactionEngine {
    pub fn new(
        chain: ChainClient,
        db: Database,
        signer: Arc<Signer>,
        metrics: Metrics,
        network: Network,
    ) -> Self {
        Self {
            chain,
            db,
            signer,
            metrics,
            network,
            nonce_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn sender_address(&self) -> &str {
        self.signer.address()
    }

    /// Create the transaction record and broadcast in one step. Exactly one
    /// row exists per outbound action.
    pub async fn submit_new(&self, request: TxRequest) -> Result<SubmitOutcome, CoreError> {
        let convex_id = Uuid::new_v4();
        let record = TransactionRecord {
            convex_id,
            chain_tx_id: None,
            kind: request.kind,
            payload: request.payload_json(),
            status: TxStatus::Pending,
            error_details: None,
            nonce: None,
            retry_count: 0,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        self.db
            .insert_transaction(&record)
            .await
            .map_err(CoreError::Internal)?;
        self.broadcast_with_retry(convex_id, request).await
    }

    /// Broadcast against a transaction row persisted earlier (policy
    /// creation persists its row inside the policy package).
    pub async fn submit_prepared(
        &self,
        convex_id: Uuid,
        request: TxRequest,
    ) -> Result<SubmitOutcome, CoreError> {
        self.broadcast_with_retry(convex_id, request).await
    }

    async fn broadcast_with_retry(
        &self,
        convex_id: Uuid,
        request: TxRequest,
    ) -> Result<SubmitOutcome, CoreError> {
        let _guard = self.nonce_lock.lock().await;

        let mut nonce = match request.nonce_override {
            Some(nonce) => nonce,
            None => self
                .chain
                .account_nonce(self.signer.address())
                .await
                .map_err(CoreError::Internal)?,
        };

        let kind = request.kind;
        let mut attempt: u32 = 0;
        loop {
            let tx_bytes = self
                .build_and_sign(&request, nonce)
                .map_err(CoreError::Internal)?;

            match self
                .chain
                .broadcast(&tx_bytes)
                .await
                .map_err(CoreError::Internal)?
            {
                BroadcastOutcome::Accepted { tx_id } => {
                    self.db
                        .mark_transaction_submitted(convex_id, &tx_id, nonce as i64, attempt as i32)
                        .await
                        .map_err(CoreError::Internal)?;
                    self.metrics.observe_broadcast(kind.as_str(), "accepted");
                    tracing::info!(
                        kind = kind.as_str(),
                        %convex_id,
                        tx_id = %tx_id,
                        nonce,
                        retry_count = attempt,
                        "transaction broadcast"
                    );
                    return Ok(SubmitOutcome {
                        convex_id,
                        tx_id,
                        nonce,
                        retry_count: attempt,
                    });
                }
                BroadcastOutcome::BadNonce { expected, actual } => {
                    if attempt < MAX_NONCE_RETRIES {
                        tracing::warn!(
                            kind = kind.as_str(),
                            %convex_id,
                            expected,
                            actual,
                            "bad nonce, retrying with node's expected value"
                        );
                        nonce = expected;
                        attempt += 1;
                        continue;
                    }
                    self.metrics.observe_broadcast(kind.as_str(), "bad_nonce");
                    self.db
                        .advance_transaction_status(
                            convex_id,
                            TxStatus::Failed,
                            Some("nonce mismatch persisted after retry"),
                        )
                        .await
                        .map_err(CoreError::Internal)?;
                    return Err(CoreError::BadNoncePersistence);
                }
                BroadcastOutcome::Rejected { reason, message } => {
                    self.metrics.observe_broadcast(kind.as_str(), "rejected");
                    let detail = format!("{reason}: {message}");
                    self.db
                        .advance_transaction_status(convex_id, TxStatus::Failed, Some(&detail))
                        .await
                        .map_err(CoreError::Internal)?;
                    return Err(CoreError::ChainRejected(detail));
                }
            }
        }
    }

    fn version_byte(&self) -> u8 {
        match self.network {
            Network::Mainnet => 0x00,
            Network::Testnet | Network::Devnet => 0x80,
        }
    }

    fn chain_id(&self) -> u32 {
        match self.network {
            Network::Mainnet => 0x0000_0001,
            Network::Testnet | Network::Devnet => 0x8000_0000,
        }
    }

    fn build_and_sign(&self, request: &TxRequest, nonce: u64) -> anyhow::Result<Vec<u8>> {
        let (_, sender_hash160) = decode_stacks_address(self.signer.address())?;

        let mut tx = Vec::with_capacity(256);
        tx.push(self.version_byte());
        tx.extend_from_slice(&self.chain_id().to_be_bytes());
        // standard single-signature spending condition
        tx.push(0x04);
        tx.push(0x00);
        tx.extend_from_slice(&sender_hash160);
        tx.extend_from_slice(&nonce.to_be_bytes());
        tx.extend_from_slice(&request.fee_micro.to_be_bytes());
        // anchor mode: any
        tx.push(0x03);
        tx.push(request.post_condition_mode.byte());
        tx.extend_from_slice(&(request.post_conditions.len() as u32).to_be_bytes());
        for condition in &request.post_conditions {
            tx.extend_from_slice(&condition.serialize()?);
        }
        // payload: contract call
        tx.push(0x02);
        tx.extend_from_slice(&request.call.serialize_payload()?);

        let sighash: [u8; 32] = Sha256::digest(&tx).into();
        let signature = self.signer.sign(&sighash);
        tx.extend_from_slice(&signature);
        Ok(tx)
    }

    /// Reconciliation loop: polls submitted transactions and applies
    /// confirmation side effects. In-flight transactions survive restarts
    /// because this reads from the table, not memory.
    pub async fn run_status_poller(self, interval: std::time::Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = self.poll_once().await {
                tracing::error!("transaction status poll failed: {err:#}");
            }
        }
    }

    pub async fn poll_once(&self) -> anyhow::Result<()> {
        let unresolved = self.db.unresolved_transactions().await?;
        for record in unresolved {
            let Some(tx_id) = record.chain_tx_id.as_deref() else {
                continue;
            };
            let view = match self.chain.transaction_status(tx_id).await {
                Ok(view) => view,
                Err(err) => {
                    tracing::warn!(tx_id, "status check failed: {err:#}");
                    continue;
                }
            };
            if !view.status.is_terminal() {
                continue;
            }

            let advanced = self
                .db
                .advance_transaction_status(record.convex_id, view.status, view.error.as_deref())
                .await?;
            if !advanced {
                continue;
            }
            self.metrics
                .observe_broadcast(record.kind.as_str(), view.status.as_str());

            if let Err(err) = self.apply_confirmation(&record, view.status).await {
                tracing::error!(
                    convex_id = %record.convex_id,
                    kind = record.kind.as_str(),
                    "confirmation side effect failed: {err:#}"
                );
            }
        }
        Ok(())
    }

    /// Side effects that become safe once the chain settles a transaction.
    async fn apply_confirmation(
        &self,
        record: &TransactionRecord,
        status: TxStatus,
    ) -> anyhow::Result<()> {
        use crate::db::types::PolicyStatus;

        let policy_id = record
            .payload
            .pointer("/context/policy_id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok());

        match (record.kind, status) {
            (TxKind::SetAggregatedPrice, _) => {
                if let Some(tx_id) = record.chain_tx_id.as_deref() {
                    self.db.update_oracle_submission_status(tx_id, status).await?;
                }
            }
            (TxKind::CreatePolicy, TxStatus::Failed | TxStatus::Replaced | TxStatus::Expired) => {
                if let Some(policy_id) = policy_id {
                    let flipped = self
                        .db
                        .transition_policy(policy_id, PolicyStatus::PendingTx, PolicyStatus::Failed)
                        .await?;
                    if flipped {
                        let released = self.db.release_policy_collateral(policy_id).await?;
                        tracing::warn!(
                            %policy_id,
                            released,
                            "policy creation failed on-chain; collateral released"
                        );
                    }
                }
            }
            (TxKind::UpdatePolicyStatus, TxStatus::Confirmed) => {
                // The registry emits policy-status-updated; the event
                // processor owns the follow-up state changes.
            }
            (TxKind::PaySettlement, TxStatus::Confirmed) => {
                let settlement_amount = record
                    .payload
                    .pointer("/context/settlement_amount")
                    .and_then(|v| v.as_i64());
                if let (Some(policy_id), Some(settlement_amount)) = (policy_id, settlement_amount) {
                    self.settle_policy(policy_id, settlement_amount).await?;
                }
            }
            (TxKind::RecordPremium, TxStatus::Confirmed) => {
                if let Some(policy_id) = policy_id {
                    use crate::db::types::DistributionStatus;
                    self.db
                        .set_distributions_status(
                            policy_id,
                            DistributionStatus::Planned,
                            DistributionStatus::Recorded,
                        )
                        .await?;
                }
            }
            (TxKind::Withdraw, TxStatus::Confirmed) => {
                self.apply_withdrawal_from_context(record).await?;
            }
            (
                TxKind::UpdatePolicyStatus | TxKind::PaySettlement,
                TxStatus::Failed | TxStatus::Replaced | TxStatus::Expired,
            ) => {
                // The policy was never flipped off Active, so its collateral
                // is still accounted for and the next expiration sweep
                // resubmits once this row is terminal.
                tracing::warn!(
                    kind = record.kind.as_str(),
                    convex_id = %record.convex_id,
                    status = status.as_str(),
                    "expiry-path transaction did not land; sweep will retry"
                );
            }
            (kind, TxStatus::Failed) => {
                tracing::error!(
                    kind = kind.as_str(),
                    convex_id = %record.convex_id,
                    "transaction failed on-chain"
                );
            }
            _ => {}
        }
        Ok(())
    }

    /// Withdrawals have no dedicated event topic; fold the confirmed
    /// amount out of the provider's balance here.
    async fn apply_withdrawal_from_context(&self, record: &TransactionRecord) -> anyhow::Result<()> {
        use crate::db::types::{Tier, TokenKind};
        use crate::db::BalanceDelta;

        let context = record
            .payload
            .get("context")
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        let provider = context
            .get("provider")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let tier = context
            .get("tier")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<Tier>().ok());
        let token = context
            .get("token")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<TokenKind>().ok());
        let amount = context.get("amount").and_then(|v| v.as_i64());

        let (Some(provider), Some(tier), Some(token), Some(amount)) =
            (provider, tier, token, amount)
        else {
            anyhow::bail!(
                "withdraw transaction {} missing balance context",
                record.convex_id
            );
        };

        self.db
            .apply_withdrawal(&BalanceDelta {
                provider,
                tier,
                token,
                amount,
                block_height: None,
            })
            .await
    }

    /// Distribute the paid settlement as a loss across the policy's
    /// allocations and move the policy to its terminal state.
    async fn settle_policy(&self, policy_id: Uuid, settlement_amount: i64) -> anyhow::Result<()> {
        use crate::db::types::{AllocationStatus, PolicyStatus};

        // This confirmation can beat the policy-status-updated event, in
        // which case the policy is still Active; walk it forward.
        self.db
            .transition_policy(policy_id, PolicyStatus::Active, PolicyStatus::Exercised)
            .await?;

        let allocations = self.db.allocations_for_policy(policy_id).await?;
        let live: Vec<_> = allocations
            .iter()
            .filter(|a| {
                matches!(
                    a.status,
                    AllocationStatus::Pending | AllocationStatus::Confirmed
                )
            })
            .collect();
        if live.is_empty() {
            return Ok(());
        }

        let weights: Vec<(Uuid, i64)> = live.iter().map(|a| (a.id, a.percentage_bps)).collect();
        let mut losses = split_by_bps(settlement_amount, &weights);
        for (allocation_id, loss) in &mut losses {
            let locked = live
                .iter()
                .find(|a| a.id == *allocation_id)
                .map(|a| a.amount_locked)
                .unwrap_or(0);
            *loss = (*loss).min(locked);
        }

        let covered: i64 = losses.iter().map(|(_, loss)| *loss).sum();
        if covered < settlement_amount {
            let detail = format!(
                "settlement shortfall on policy {policy_id}: covered {covered} of {settlement_amount}"
            );
            self.db
                .record_reconciliation_error("settlement", &detail)
                .await?;
            tracing::error!("{detail}");
        }

        self.db.apply_policy_settlement(policy_id, &losses).await?;
        self.db
            .transition_policy(policy_id, PolicyStatus::Exercised, PolicyStatus::Settled)
            .await?;
        Ok(())
    }
}
