use anyhow::{bail, Context};
use sqlx::Row;
use uuid::Uuid;

use super::{
    types::{ProviderTierBalance, Tier, TierCapital, TokenKind},
    Database,
};

/// Default per-(tier, token) capacity seeded on first deposit. Raised by
/// governance out of band.
const DEFAULT_CAPACITY_LIMIT: i64 = 1_000_000_000_000_000;

/// A confirmed on-chain balance movement to fold into provider state.
#[derive(Debug, Clone)]
pub struct BalanceDelta {
    pub provider: String,
    pub tier: Tier,
    pub token: TokenKind,
    pub amount: i64,
    pub block_height: Option<i64>,
}

fn balance_from_row(row: &sqlx::postgres::PgRow) -> anyhow::Result<ProviderTierBalance> {
    let tier: String = row.try_get("tier")?;
    let token: String = row.try_get("token")?;
    Ok(ProviderTierBalance {
        provider: row.try_get("provider")?,
        tier: tier.parse().map_err(anyhow::Error::msg)?,
        token: token.parse().map_err(anyhow::Error::msg)?,
        deposited: row.try_get("deposited")?,
        locked: row.try_get("locked")?,
        premium_earned: row.try_get("premium_earned")?,
        last_deposit_block: row.try_get("last_deposit_block")?,
        deposit_count: row.try_get("deposit_count")?,
    })
}

impl Database {
    /// Balances with at least one unit free, largest available first. Read
    /// snapshot only; `commit` re-checks under row locks.
    pub async fn eligible_balances(
        &self,
        tier: Tier,
        token: TokenKind,
    ) -> anyhow::Result<Vec<ProviderTierBalance>> {
        let rows = sqlx::query(
            "SELECT provider, tier, token, deposited, locked, premium_earned,
                    last_deposit_block, deposit_count
             FROM provider_tier_balances
             WHERE tier = $1 AND token = $2 AND deposited - locked >= 1
             ORDER BY deposited - locked DESC, provider ASC",
        )
        .bind(tier.as_str())
        .bind(token.as_str())
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(balance_from_row).collect()
    }

    pub async fn provider_balances(
        &self,
        provider: &str,
    ) -> anyhow::Result<Vec<ProviderTierBalance>> {
        let rows = sqlx::query(
            "SELECT provider, tier, token, deposited, locked, premium_earned,
                    last_deposit_block, deposit_count
             FROM provider_tier_balances
             WHERE provider = $1
             ORDER BY tier ASC, token ASC",
        )
        .bind(provider)
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(balance_from_row).collect()
    }

    pub async fn tier_capital(&self, tier: Tier, token: TokenKind) -> anyhow::Result<Option<TierCapital>> {
        let row = sqlx::query(
            "SELECT tier, token, total_deposited, total_locked, capacity_limit
             FROM tier_capital WHERE tier = $1 AND token = $2",
        )
        .bind(tier.as_str())
        .bind(token.as_str())
        .fetch_optional(self.pool())
        .await?;

        let Some(row) = row else { return Ok(None) };
        let tier_s: String = row.try_get("tier")?;
        let token_s: String = row.try_get("token")?;
        Ok(Some(TierCapital {
            tier: tier_s.parse().map_err(anyhow::Error::msg)?,
            token: token_s.parse().map_err(anyhow::Error::msg)?,
            total_deposited: row.try_get("total_deposited")?,
            total_locked: row.try_get("total_locked")?,
            capacity_limit: row.try_get("capacity_limit")?,
        }))
    }

    /// Fold a confirmed deposit into provider and tier totals.
    pub async fn apply_deposit(&self, delta: &BalanceDelta) -> anyhow::Result<()> {
        let mut txn = self.pool().begin().await?;

        sqlx::query(
            "INSERT INTO provider_tier_balances
                (provider, tier, token, deposited, locked, premium_earned,
                 last_deposit_block, deposit_count)
             VALUES ($1, $2, $3, $4, 0, 0, $5, 1)
             ON CONFLICT (provider, tier, token) DO UPDATE SET
                deposited = provider_tier_balances.deposited + EXCLUDED.deposited,
                last_deposit_block = EXCLUDED.last_deposit_block,
                deposit_count = provider_tier_balances.deposit_count + 1",
        )
        .bind(&delta.provider)
        .bind(delta.tier.as_str())
        .bind(delta.token.as_str())
        .bind(delta.amount)
        .bind(delta.block_height)
        .execute(&mut *txn)
        .await?;

        sqlx::query(
            "INSERT INTO tier_capital (tier, token, total_deposited, total_locked, capacity_limit)
             VALUES ($1, $2, $3, 0, $4)
             ON CONFLICT (tier, token) DO UPDATE SET
                total_deposited = tier_capital.total_deposited + EXCLUDED.total_deposited",
        )
        .bind(delta.tier.as_str())
        .bind(delta.token.as_str())
        .bind(delta.amount)
        .bind(DEFAULT_CAPACITY_LIMIT)
        .execute(&mut *txn)
        .await?;

        txn.commit().await?;
        Ok(())
    }

    /// Fold a confirmed withdrawal; fails if it would dip into locked
    /// collateral (the vault enforces the same on-chain).
    pub async fn apply_withdrawal(&self, delta: &BalanceDelta) -> anyhow::Result<()> {
        let mut txn = self.pool().begin().await?;

        let updated = sqlx::query(
            "UPDATE provider_tier_balances
             SET deposited = deposited - $4
             WHERE provider = $1 AND tier = $2 AND token = $3
               AND deposited - locked >= $4",
        )
        .bind(&delta.provider)
        .bind(delta.tier.as_str())
        .bind(delta.token.as_str())
        .bind(delta.amount)
        .execute(&mut *txn)
        .await?;

        if updated.rows_affected() == 0 {
            bail!(
                "withdrawal of {} exceeds available balance for {}",
                delta.amount,
                delta.provider
            );
        }

        sqlx::query(
            "UPDATE tier_capital SET total_deposited = total_deposited - $3
             WHERE tier = $1 AND token = $2",
        )
        .bind(delta.tier.as_str())
        .bind(delta.token.as_str())
        .bind(delta.amount)
        .execute(&mut *txn)
        .await?;

        txn.commit().await?;
        Ok(())
    }

    pub async fn available_for_withdrawal(
        &self,
        provider: &str,
        tier: Tier,
        token: TokenKind,
    ) -> anyhow::Result<i64> {
        let row = sqlx::query(
            "SELECT deposited - locked AS available FROM provider_tier_balances
             WHERE provider = $1 AND tier = $2 AND token = $3",
        )
        .bind(provider)
        .bind(tier.as_str())
        .bind(token.as_str())
        .fetch_optional(self.pool())
        .await?;

        Ok(match row {
            Some(row) => row.try_get("available")?,
            None => 0,
        })
    }

    /// Release collateral for every live allocation of a policy.
    pub async fn release_policy_collateral(&self, policy_id: Uuid) -> anyhow::Result<usize> {
        let mut txn = self.pool().begin().await?;

        let rows = sqlx::query(
            "SELECT id, provider, tier, token, amount_locked FROM allocations
             WHERE policy_id = $1 AND status IN ('pending', 'confirmed')
             FOR UPDATE",
        )
        .bind(policy_id)
        .fetch_all(&mut *txn)
        .await?;

        for row in &rows {
            let id: Uuid = row.try_get("id")?;
            let provider: String = row.try_get("provider")?;
            let tier: String = row.try_get("tier")?;
            let token: String = row.try_get("token")?;
            let amount: i64 = row.try_get("amount_locked")?;

            sqlx::query(
                "UPDATE provider_tier_balances SET locked = locked - $4
                 WHERE provider = $1 AND tier = $2 AND token = $3",
            )
            .bind(&provider)
            .bind(&tier)
            .bind(&token)
            .bind(amount)
            .execute(&mut *txn)
            .await
            .with_context(|| format!("releasing {amount} for {provider}"))?;

            sqlx::query(
                "UPDATE tier_capital SET total_locked = total_locked - $3
                 WHERE tier = $1 AND token = $2",
            )
            .bind(&tier)
            .bind(&token)
            .bind(amount)
            .execute(&mut *txn)
            .await?;

            sqlx::query("UPDATE allocations SET status = 'released' WHERE id = $1")
                .bind(id)
                .execute(&mut *txn)
                .await?;
        }

        txn.commit().await?;
        Ok(rows.len())
    }

    /// Apply a settlement loss per allocation. Each allocation's full locked
    /// amount is unwound: the loss share leaves `deposited`, the residual
    /// returns to the provider's free balance.
    pub async fn apply_policy_settlement(
        &self,
        policy_id: Uuid,
        losses: &[(Uuid, i64)],
    ) -> anyhow::Result<()> {
        let mut txn = self.pool().begin().await?;

        for (allocation_id, loss) in losses {
            let row = sqlx::query(
                "SELECT provider, tier, token, amount_locked FROM allocations
                 WHERE id = $1 AND policy_id = $2 AND status IN ('pending', 'confirmed')
                 FOR UPDATE",
            )
            .bind(allocation_id)
            .bind(policy_id)
            .fetch_optional(&mut *txn)
            .await?;

            let Some(row) = row else { continue };
            let provider: String = row.try_get("provider")?;
            let tier: String = row.try_get("tier")?;
            let token: String = row.try_get("token")?;
            let amount_locked: i64 = row.try_get("amount_locked")?;

            if *loss > amount_locked {
                bail!(
                    "settlement loss {loss} exceeds locked {amount_locked} on allocation {allocation_id}"
                );
            }

            sqlx::query(
                "UPDATE provider_tier_balances
                 SET deposited = deposited - $4, locked = locked - $5
                 WHERE provider = $1 AND tier = $2 AND token = $3",
            )
            .bind(&provider)
            .bind(&tier)
            .bind(&token)
            .bind(loss)
            .bind(amount_locked)
            .execute(&mut *txn)
            .await?;

            sqlx::query(
                "UPDATE tier_capital
                 SET total_deposited = total_deposited - $3, total_locked = total_locked - $4
                 WHERE tier = $1 AND token = $2",
            )
            .bind(&tier)
            .bind(&token)
            .bind(loss)
            .bind(amount_locked)
            .execute(&mut *txn)
            .await?;

            sqlx::query("UPDATE allocations SET status = 'settlement_impacted' WHERE id = $1")
                .bind(allocation_id)
                .execute(&mut *txn)
                .await?;
        }

        txn.commit().await?;
        Ok(())
    }

    pub async fn add_premium_earned(
        &self,
        provider: &str,
        tier: Tier,
        token: TokenKind,
        amount: i64,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE provider_tier_balances SET premium_earned = premium_earned + $4
             WHERE provider = $1 AND tier = $2 AND token = $3",
        )
        .bind(provider)
        .bind(tier.as_str())
        .bind(token.as_str())
        .bind(amount)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn record_reconciliation_error(
        &self,
        scope: &str,
        detail: &str,
    ) -> anyhow::Result<()> {
        sqlx::query("INSERT INTO reconciliation_errors (scope, detail) VALUES ($1, $2)")
            .bind(scope)
            .bind(detail)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}
