use anyhow::bail;
use sqlx::Row;
use uuid::Uuid;

use super::{
    types::{
        Allocation, AllocationStatus, DistributionStatus, Policy, PolicyStatus,
        PremiumDistribution, TransactionRecord,
    },
    Database,
};

/// Everything persisted atomically when a policy is created: the policy in
/// `PendingTx`, its allocations in `Pending`, premium distributions in
/// `Planned`, and the outbound transaction record in `Pending`. Collateral
/// locks are taken in the same transaction.
#[derive(Debug, Clone)]
pub struct PolicyPackage {
    pub policy: Policy,
    pub allocations: Vec<Allocation>,
    pub distributions: Vec<PremiumDistribution>,
    pub transaction: TransactionRecord,
}

fn policy_from_row(row: &sqlx::postgres::PgRow) -> anyhow::Result<Policy> {
    let policy_type: String = row.try_get("policy_type")?;
    let risk_tier: String = row.try_get("risk_tier")?;
    let status: String = row.try_get("status")?;
    let collateral_token: String = row.try_get("collateral_token")?;
    let settlement_token: String = row.try_get("settlement_token")?;
    Ok(Policy {
        id: row.try_get("id")?,
        on_chain_id: row.try_get("on_chain_id")?,
        owner: row.try_get("owner")?,
        policy_type: policy_type.parse().map_err(anyhow::Error::msg)?,
        risk_tier: risk_tier.parse().map_err(anyhow::Error::msg)?,
        strike_cents: row.try_get("strike_cents")?,
        amount_sats: row.try_get("amount_sats")?,
        premium_micro: row.try_get("premium_micro")?,
        creation_height: row.try_get("creation_height")?,
        expiration_height: row.try_get("expiration_height")?,
        status: status.parse().map_err(anyhow::Error::msg)?,
        collateral_token: collateral_token.parse().map_err(anyhow::Error::msg)?,
        settlement_token: settlement_token.parse().map_err(anyhow::Error::msg)?,
        created_at: row.try_get("created_at")?,
    })
}

const POLICY_COLUMNS: &str = "id, on_chain_id, owner, policy_type, risk_tier, strike_cents, \
     amount_sats, premium_micro, creation_height, expiration_height, status, \
     collateral_token, settlement_token, created_at";

impl Database {
    /// Persist a new policy package and take the collateral locks, all in
    /// one transaction. Fails (and rolls everything back) if any provider's
    /// available balance changed since planning.
    pub async fn create_policy_package(&self, package: &PolicyPackage) -> anyhow::Result<()> {
        let mut txn = self.pool().begin().await?;

        let mut total_locked = 0i64;
        for alloc in &package.allocations {
            let updated = sqlx::query(
                "UPDATE provider_tier_balances SET locked = locked + $4
                 WHERE provider = $1 AND tier = $2 AND token = $3
                   AND deposited - locked >= $4",
            )
            .bind(&alloc.provider)
            .bind(alloc.tier.as_str())
            .bind(alloc.token.as_str())
            .bind(alloc.amount_locked)
            .execute(&mut *txn)
            .await?;

            if updated.rows_affected() == 0 {
                bail!(
                    "provider {} no longer has {} available in {}",
                    alloc.provider,
                    alloc.amount_locked,
                    alloc.tier.as_str()
                );
            }
            total_locked += alloc.amount_locked;
        }

        if total_locked > 0 {
            let tier = package.policy.risk_tier;
            let token = package.policy.collateral_token;
            let updated = sqlx::query(
                "UPDATE tier_capital SET total_locked = total_locked + $3
                 WHERE tier = $1 AND token = $2",
            )
            .bind(tier.as_str())
            .bind(token.as_str())
            .bind(total_locked)
            .execute(&mut *txn)
            .await?;
            if updated.rows_affected() == 0 {
                bail!("no tier capital row for {}/{}", tier.as_str(), token.as_str());
            }
        }

        let p = &package.policy;
        sqlx::query(
            "INSERT INTO policies
                (id, on_chain_id, owner, policy_type, risk_tier, strike_cents, amount_sats,
                 premium_micro, creation_height, expiration_height, status,
                 collateral_token, settlement_token)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(p.id)
        .bind(p.on_chain_id)
        .bind(&p.owner)
        .bind(p.policy_type.as_str())
        .bind(p.risk_tier.as_str())
        .bind(p.strike_cents)
        .bind(p.amount_sats)
        .bind(p.premium_micro)
        .bind(p.creation_height)
        .bind(p.expiration_height)
        .bind(p.status.as_str())
        .bind(p.collateral_token.as_str())
        .bind(p.settlement_token.as_str())
        .execute(&mut *txn)
        .await?;

        for alloc in &package.allocations {
            sqlx::query(
                "INSERT INTO allocations
                    (id, policy_id, provider, tier, token, amount_locked, percentage_bps, status)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            )
            .bind(alloc.id)
            .bind(alloc.policy_id)
            .bind(&alloc.provider)
            .bind(alloc.tier.as_str())
            .bind(alloc.token.as_str())
            .bind(alloc.amount_locked)
            .bind(alloc.percentage_bps)
            .bind(alloc.status.as_str())
            .execute(&mut *txn)
            .await?;
        }

        for dist in &package.distributions {
            sqlx::query(
                "INSERT INTO premium_distributions
                    (id, policy_id, allocation_id, provider, premium_share, status)
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(dist.id)
            .bind(dist.policy_id)
            .bind(dist.allocation_id)
            .bind(&dist.provider)
            .bind(dist.premium_share)
            .bind(dist.status.as_str())
            .execute(&mut *txn)
            .await?;
        }

        let t = &package.transaction;
        sqlx::query(
            "INSERT INTO transactions
                (convex_id, chain_tx_id, kind, payload, status, nonce, retry_count)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(t.convex_id)
        .bind(&t.chain_tx_id)
        .bind(t.kind.as_str())
        .bind(&t.payload)
        .bind(t.status.as_str())
        .bind(t.nonce)
        .bind(t.retry_count)
        .execute(&mut *txn)
        .await?;

        txn.commit().await?;
        Ok(())
    }

    pub async fn get_policy(&self, id: Uuid) -> anyhow::Result<Option<Policy>> {
        let row = sqlx::query(&format!(
            "SELECT {POLICY_COLUMNS} FROM policies WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await?;

        row.as_ref().map(policy_from_row).transpose()
    }

    /// The chain assigns policy IDs on-chain; incoming `policy-created`
    /// events are matched back by this correlation key.
    pub async fn find_policy_by_correlation(
        &self,
        owner: &str,
        expiration_height: i64,
        strike_cents: i64,
        amount_sats: i64,
    ) -> anyhow::Result<Option<Policy>> {
        let row = sqlx::query(&format!(
            "SELECT {POLICY_COLUMNS} FROM policies
             WHERE owner = $1 AND expiration_height = $2 AND strike_cents = $3
               AND amount_sats = $4 AND status = 'pending_tx'
             ORDER BY created_at ASC LIMIT 1"
        ))
        .bind(owner)
        .bind(expiration_height)
        .bind(strike_cents)
        .bind(amount_sats)
        .fetch_optional(self.pool())
        .await?;

        row.as_ref().map(policy_from_row).transpose()
    }

    pub async fn find_policy_by_on_chain_id(
        &self,
        on_chain_id: i64,
    ) -> anyhow::Result<Option<Policy>> {
        let row = sqlx::query(&format!(
            "SELECT {POLICY_COLUMNS} FROM policies WHERE on_chain_id = $1"
        ))
        .bind(on_chain_id)
        .fetch_optional(self.pool())
        .await?;

        row.as_ref().map(policy_from_row).transpose()
    }

    /// Flip `PendingTx -> Active`, stamp the on-chain ID, and confirm the
    /// allocations. Returns false when the policy was already activated
    /// (duplicate event).
    pub async fn confirm_policy_created(
        &self,
        policy_id: Uuid,
        on_chain_id: i64,
    ) -> anyhow::Result<bool> {
        let mut txn = self.pool().begin().await?;

        let updated = sqlx::query(
            "UPDATE policies SET status = 'active', on_chain_id = $2
             WHERE id = $1 AND status = 'pending_tx'",
        )
        .bind(policy_id)
        .bind(on_chain_id)
        .execute(&mut *txn)
        .await?;

        if updated.rows_affected() == 0 {
            txn.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            "UPDATE allocations SET status = 'confirmed'
             WHERE policy_id = $1 AND status = 'pending'",
        )
        .bind(policy_id)
        .execute(&mut *txn)
        .await?;

        txn.commit().await?;
        Ok(true)
    }

    /// Guarded status transition; returns false when the row was not in the
    /// expected source state (duplicate or out-of-order signal).
    pub async fn transition_policy(
        &self,
        policy_id: Uuid,
        from: PolicyStatus,
        to: PolicyStatus,
    ) -> anyhow::Result<bool> {
        if !from.can_transition(to) {
            bail!(
                "illegal policy transition {} -> {}",
                from.as_str(),
                to.as_str()
            );
        }
        let updated = sqlx::query("UPDATE policies SET status = $3 WHERE id = $1 AND status = $2")
            .bind(policy_id)
            .bind(from.as_str())
            .bind(to.as_str())
            .execute(self.pool())
            .await?;
        let applied = updated.rows_affected() > 0;
        if applied {
            self.metrics
                .observe_policy_transition(from.as_str(), to.as_str());
        }
        Ok(applied)
    }

    /// Active policies whose expiration height has passed, oldest first.
    pub async fn expirable_policies(
        &self,
        current_height: i64,
        limit: i64,
    ) -> anyhow::Result<Vec<Policy>> {
        let rows = sqlx::query(&format!(
            "SELECT {POLICY_COLUMNS} FROM policies
             WHERE status = 'active' AND expiration_height <= $1
             ORDER BY expiration_height ASC, created_at ASC
             LIMIT $2"
        ))
        .bind(current_height)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(policy_from_row).collect()
    }

    /// Exercised policies whose collateral is still live, meaning the
    /// settlement payment has not confirmed yet.
    pub async fn exercised_unsettled_policies(&self, limit: i64) -> anyhow::Result<Vec<Policy>> {
        let rows = sqlx::query(&format!(
            "SELECT {POLICY_COLUMNS} FROM policies p
             WHERE p.status = 'exercised'
               AND EXISTS (
                   SELECT 1 FROM allocations a
                   WHERE a.policy_id = p.id AND a.status IN ('pending', 'confirmed')
               )
             ORDER BY p.expiration_height ASC, p.created_at ASC
             LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(policy_from_row).collect()
    }

    pub async fn allocations_for_policy(&self, policy_id: Uuid) -> anyhow::Result<Vec<Allocation>> {
        let rows = sqlx::query(
            "SELECT id, policy_id, provider, tier, token, amount_locked, percentage_bps, status
             FROM allocations WHERE policy_id = $1
             ORDER BY amount_locked DESC, provider ASC",
        )
        .bind(policy_id)
        .fetch_all(self.pool())
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let tier: String = row.try_get("tier")?;
            let token: String = row.try_get("token")?;
            let status: String = row.try_get("status")?;
            out.push(Allocation {
                id: row.try_get("id")?,
                policy_id: row.try_get("policy_id")?,
                provider: row.try_get("provider")?,
                tier: tier.parse().map_err(anyhow::Error::msg)?,
                token: token.parse().map_err(anyhow::Error::msg)?,
                amount_locked: row.try_get("amount_locked")?,
                percentage_bps: row.try_get("percentage_bps")?,
                status: status.parse().map_err(anyhow::Error::msg)?,
            });
        }
        Ok(out)
    }

    pub async fn distributions_for_policy(
        &self,
        policy_id: Uuid,
    ) -> anyhow::Result<Vec<PremiumDistribution>> {
        let rows = sqlx::query(
            "SELECT id, policy_id, allocation_id, provider, premium_share, status
             FROM premium_distributions WHERE policy_id = $1
             ORDER BY premium_share DESC, provider ASC",
        )
        .bind(policy_id)
        .fetch_all(self.pool())
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.try_get("status")?;
            out.push(PremiumDistribution {
                id: row.try_get("id")?,
                policy_id: row.try_get("policy_id")?,
                allocation_id: row.try_get("allocation_id")?,
                provider: row.try_get("provider")?,
                premium_share: row.try_get("premium_share")?,
                status: status.parse().map_err(anyhow::Error::msg)?,
            });
        }
        Ok(out)
    }

    pub async fn set_distributions_status(
        &self,
        policy_id: Uuid,
        from: DistributionStatus,
        to: DistributionStatus,
    ) -> anyhow::Result<u64> {
        let updated = sqlx::query(
            "UPDATE premium_distributions SET status = $3
             WHERE policy_id = $1 AND status = $2",
        )
        .bind(policy_id)
        .bind(from.as_str())
        .bind(to.as_str())
        .execute(self.pool())
        .await?;
        Ok(updated.rows_affected())
    }

    /// Mark every recorded distribution of a policy as paid and credit each
    /// provider's earned premium, in one transaction.
    pub async fn settle_premium_distributions(&self, policy_id: Uuid) -> anyhow::Result<usize> {
        let mut txn = self.pool().begin().await?;

        let rows = sqlx::query(
            "SELECT d.id, d.provider, d.premium_share, a.tier, a.token
             FROM premium_distributions d
             JOIN allocations a ON a.id = d.allocation_id
             WHERE d.policy_id = $1 AND d.status IN ('planned', 'recorded')
             FOR UPDATE OF d",
        )
        .bind(policy_id)
        .fetch_all(&mut *txn)
        .await?;

        for row in &rows {
            let id: Uuid = row.try_get("id")?;
            let provider: String = row.try_get("provider")?;
            let share: i64 = row.try_get("premium_share")?;
            let tier: String = row.try_get("tier")?;
            let token: String = row.try_get("token")?;

            sqlx::query("UPDATE premium_distributions SET status = 'paid' WHERE id = $1")
                .bind(id)
                .execute(&mut *txn)
                .await?;

            sqlx::query(
                "UPDATE provider_tier_balances SET premium_earned = premium_earned + $4
                 WHERE provider = $1 AND tier = $2 AND token = $3",
            )
            .bind(&provider)
            .bind(&tier)
            .bind(&token)
            .bind(share)
            .execute(&mut *txn)
            .await?;
        }

        txn.commit().await?;
        Ok(rows.len())
    }

    /// Allocation statuses by status name, for reconciliation sweeps.
    pub async fn update_allocation_status(
        &self,
        allocation_id: Uuid,
        from: AllocationStatus,
        to: AllocationStatus,
    ) -> anyhow::Result<bool> {
        let updated = sqlx::query(
            "UPDATE allocations SET status = $3 WHERE id = $1 AND status = $2",
        )
        .bind(allocation_id)
        .bind(from.as_str())
        .bind(to.as_str())
        .execute(self.pool())
        .await?;
        Ok(updated.rows_affected() > 0)
    }
}
