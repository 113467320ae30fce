use serde_json::json;

use crate::{
    chain::{
        contracts::{ClarityValue, ContractCall},
        tx::{TransactionEngine, TxRequest},
    },
    db::{
        types::{Policy, TxKind},
        Database,
    },
};

/// Issues the on-chain premium recording for an activated policy. The
/// per-provider split was fixed at creation time with the same basis-point
/// rule the allocator uses; rows move Planned → Recorded → Paid as the
/// chain confirms.
#[derive(Clone)]
pub struct PremiumDistributor {
    db: Database,
    engine: TransactionEngine,
    liquidity_pool_contract: String,
}

impl PremiumDistributor {
    pub fn new(db: Database, engine: TransactionEngine, liquidity_pool_contract: String) -> Self {
        Self {
            db,
            engine,
            liquidity_pool_contract,
        }
    }

    /// One aggregate `record-premium` call per policy; the vault fans the
    /// amount out to providers on its side.
    pub async fn distribute(&self, policy: &Policy) -> anyhow::Result<()> {
        let distributions = self.db.distributions_for_policy(policy.id).await?;
        if distributions.is_empty() {
            tracing::warn!(policy_id = %policy.id, "no premium distributions to record");
            return Ok(());
        }
        let total: i64 = distributions.iter().map(|d| d.premium_share).sum();

        let Some(on_chain_id) = policy.on_chain_id else {
            anyhow::bail!("policy {} has no on-chain id yet", policy.id);
        };

        let call = ContractCall::new(
            &self.liquidity_pool_contract,
            "record-premium",
            vec![
                ClarityValue::uint(on_chain_id as u128),
                ClarityValue::uint(total as u128),
                ClarityValue::padded_ascii(policy.settlement_token.contract_suffix(), 32)?,
            ],
        )?;

        let request = TxRequest::new(TxKind::RecordPremium, call).with_context(json!({
            "policy_id": policy.id,
            "premium_micro": total,
        }));

        let outcome = self.engine.submit_new(request).await?;
        tracing::info!(
            policy_id = %policy.id,
            tx_id = %outcome.tx_id,
            total,
            providers = distributions.len(),
            "premium recording submitted"
        );
        Ok(())
    }
}
