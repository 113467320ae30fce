use std::{collections::BTreeMap, time::Duration};

use serde_json::json;

use crate::{
    chain::{
        contracts::{ClarityValue, ContractCall},
        events::STATUS_CODE_EXERCISED,
        tx::{TransactionEngine, TxRequest},
        ChainClient,
    },
    db::{
        types::{Policy, TxKind},
        Database,
    },
};

const SATS_PER_BTC: i128 = 100_000_000;

/// In the money iff the expiry price fell below the strike.
pub fn put_is_itm(strike_cents: i64, spot_cents: i64) -> bool {
    spot_cents < strike_cents
}

/// Total protected value paid out, in USD cents:
/// `(strike − spot) · amount`.
pub fn settlement_value_cents(strike_cents: i64, spot_cents: i64, amount_sats: i64) -> i64 {
    if !put_is_itm(strike_cents, spot_cents) {
        return 0;
    }
    let per_unit = (strike_cents - spot_cents) as i128;
    (per_unit * amount_sats as i128 / SATS_PER_BTC) as i64
}

/// The same payout converted into the settlement token's smallest unit at
/// the expiry price: `(strike − spot)/spot · amount_sats`.
pub fn settlement_token_sats(strike_cents: i64, spot_cents: i64, amount_sats: i64) -> i64 {
    if !put_is_itm(strike_cents, spot_cents) || spot_cents <= 0 {
        return 0;
    }
    let numerator = (strike_cents - spot_cents) as i128 * amount_sats as i128;
    (numerator / spot_cents as i128) as i64
}

/// Batch-processes policies whose expiration height has passed: one price
/// lookup per height, then status updates and settlement payments.
pub struct ExpirationScheduler {
    db: Database,
    chain: ChainClient,
    engine: TransactionEngine,
    policy_registry_contract: String,
    liquidity_pool_contract: String,
    batch_size: i64,
}

impl ExpirationScheduler {
    pub fn new(
        db: Database,
        chain: ChainClient,
        engine: TransactionEngine,
        policy_registry_contract: String,
        liquidity_pool_contract: String,
        batch_size: i64,
    ) -> Self {
        Self {
            db,
            chain,
            engine,
            policy_registry_contract,
            liquidity_pool_contract,
            batch_size,
        }
    }

    pub async fn run(self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.process_batch().await {
                Ok(0) => {}
                Ok(processed) => tracing::info!(processed, "expiration batch handled"),
                Err(err) => tracing::error!("expiration batch failed: {err:#}"),
            }
        }
    }

    pub async fn process_batch(&self) -> anyhow::Result<usize> {
        let tip = self.chain.tip_height().await? as i64;
        let due = self.db.expirable_policies(tip, self.batch_size).await?;
        if due.is_empty() {
            return Ok(0);
        }

        // One oracle lookup per expiration height, shared by its group.
        let mut groups: BTreeMap<i64, Vec<Policy>> = BTreeMap::new();
        for policy in due {
            groups.entry(policy.expiration_height).or_default().push(policy);
        }

        let mut processed = 0;
        let mut otm: Vec<Policy> = Vec::new();
        for (height, group) in groups {
            let price = match self
                .chain
                .price_at_height(height as u64, self.engine.sender_address())
                .await
            {
                Ok(price) => price,
                Err(err) => {
                    tracing::warn!(height, "no expiry price yet, deferring group: {err:#}");
                    continue;
                }
            };
            // Oracle stores satoshi-scaled USD; settle in cents.
            let spot_cents = price.price_sats / 1_000_000;

            for policy in group {
                if put_is_itm(policy.strike_cents, spot_cents) {
                    match self.exercise_policy(&policy, spot_cents).await {
                        Ok(()) => processed += 1,
                        Err(err) => {
                            tracing::error!(policy_id = %policy.id, "exercise failed: {err:#}");
                        }
                    }
                } else {
                    otm.push(policy);
                }
            }
        }

        // Exercised policies whose settlement payment never landed keep
        // their allocations live; pay them again from the recorded expiry
        // price.
        let unsettled = self
            .db
            .exercised_unsettled_policies(self.batch_size)
            .await?;
        for policy in unsettled {
            if self
                .db
                .has_open_transaction_for_policy(policy.id, &[TxKind::PaySettlement])
                .await?
            {
                continue;
            }
            let price = match self
                .chain
                .price_at_height(policy.expiration_height as u64, self.engine.sender_address())
                .await
            {
                Ok(price) => price,
                Err(err) => {
                    tracing::warn!(policy_id = %policy.id, "expiry price unavailable: {err:#}");
                    continue;
                }
            };
            match self
                .submit_settlement_payment(&policy, price.price_sats / 1_000_000)
                .await
            {
                Ok(()) => processed += 1,
                Err(err) => {
                    tracing::error!(policy_id = %policy.id, "settlement retry failed: {err:#}");
                }
            }
        }

        // All out-of-the-money policies expire through one registry call.
        // They stay Active locally until the per-policy status events
        // confirm; one open batch at a time keeps the sweep from
        // resubmitting while the verdict is pending. A failed batch leaves
        // the policies Active, so the next sweep simply tries again.
        if !otm.is_empty() && !self.db.has_open_expiration_batch().await? {
            let call = ContractCall::new(
                &self.policy_registry_contract,
                "expire-policies-batch",
                vec![ClarityValue::uint(tip as u128)],
            )?;
            let request = TxRequest::new(TxKind::UpdatePolicyStatus, call).with_context(json!({
                "outcome": "expire-batch",
                "current_height": tip,
                "policies": otm.len(),
            }));
            let outcome = self.engine.submit_new(request).await?;
            processed += otm.len();
            tracing::info!(
                tx_id = %outcome.tx_id,
                otm_count = otm.len(),
                "expiration batch submitted"
            );
        }
        Ok(processed)
    }

    async fn exercise_policy(&self, policy: &Policy, spot_cents: i64) -> anyhow::Result<()> {
        let on_chain_id = policy.on_chain_id.unwrap_or_default();

        // The policy stays Active until the chain confirms; skip while the
        // previous sweep's calls are still pending a verdict.
        if self
            .db
            .has_open_transaction_for_policy(
                policy.id,
                &[TxKind::UpdatePolicyStatus, TxKind::PaySettlement],
            )
            .await?
        {
            return Ok(());
        }

        let value_cents =
            settlement_value_cents(policy.strike_cents, spot_cents, policy.amount_sats);

        let status_call = ContractCall::new(
            &self.policy_registry_contract,
            "update-policy-status",
            vec![
                ClarityValue::uint(on_chain_id as u128),
                ClarityValue::uint(STATUS_CODE_EXERCISED),
                ClarityValue::uint(value_cents as u128),
                ClarityValue::uint(spot_cents as u128),
            ],
        )?;
        let status_request = TxRequest::new(TxKind::UpdatePolicyStatus, status_call)
            .with_context(json!({ "policy_id": policy.id, "outcome": "exercised" }));
        let status_outcome = self.engine.submit_new(status_request).await?;
        tracing::info!(
            policy_id = %policy.id,
            status_tx = %status_outcome.tx_id,
            value_cents,
            "in the money; exercise submitted"
        );

        self.submit_settlement_payment(policy, spot_cents).await
    }

    /// The vault payment leg. Also re-run by the sweep for exercised
    /// policies whose earlier payment never landed.
    async fn submit_settlement_payment(
        &self,
        policy: &Policy,
        spot_cents: i64,
    ) -> anyhow::Result<()> {
        let on_chain_id = policy.on_chain_id.unwrap_or_default();
        let value_cents =
            settlement_value_cents(policy.strike_cents, spot_cents, policy.amount_sats);
        let payout_sats =
            settlement_token_sats(policy.strike_cents, spot_cents, policy.amount_sats);

        // Settlement goes straight to the vault; a denied post-condition
        // mode caps what the call may move.
        let pay_call = ContractCall::new(
            &self.liquidity_pool_contract,
            "pay-settlement",
            vec![
                ClarityValue::uint(on_chain_id as u128),
                ClarityValue::padded_ascii(policy.settlement_token.contract_suffix(), 32)?,
                ClarityValue::uint(payout_sats as u128),
                ClarityValue::principal(&policy.owner)?,
            ],
        )?;
        let pay_request = TxRequest::new(TxKind::PaySettlement, pay_call)
            .deny_other_transfers()
            .with_context(json!({
                "policy_id": policy.id,
                "settlement_amount": payout_sats,
                "settlement_value_cents": value_cents,
            }));
        let pay_outcome = self.engine.submit_new(pay_request).await?;

        tracing::info!(
            policy_id = %policy.id,
            pay_tx = %pay_outcome.tx_id,
            value_cents,
            payout_sats,
            "settlement payment submitted"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BTC: i64 = 100_000_000;

    #[test]
    fn itm_boundary_is_strict() {
        assert!(put_is_itm(5_000_000, 4_999_999));
        assert!(!put_is_itm(5_000_000, 5_000_000));
        assert!(!put_is_itm(5_000_000, 5_000_001));
    }

    #[test]
    fn settlement_values_for_reference_batch() {
        // (K=50000, S=48000, amt=1 BTC) -> 2000 USD
        assert_eq!(settlement_value_cents(5_000_000, 4_800_000, BTC), 200_000);
        // (K=45000, S=46000, amt=2 BTC) -> OTM
        assert_eq!(settlement_value_cents(4_500_000, 4_600_000, 2 * BTC), 0);
        // (K=52000, S=40000, amt=0.5 BTC) -> 6000 USD
        assert_eq!(settlement_value_cents(5_200_000, 4_000_000, BTC / 2), 600_000);
    }

    #[test]
    fn token_settlement_converts_at_expiry_price() {
        // (50000-48000)/48000 of 1 BTC
        let sats = settlement_token_sats(5_000_000, 4_800_000, BTC);
        assert_eq!(sats, (200_000i128 * BTC as i128 / 4_800_000) as i64);
        assert_eq!(settlement_token_sats(4_500_000, 4_600_000, BTC), 0);
        assert_eq!(settlement_token_sats(5_000_000, 0, BTC), 0);
    }
}
