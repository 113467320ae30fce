use uuid::Uuid;

use crate::{
    db::{
        types::{ProviderTierBalance, Tier, TokenKind},
        Database,
    },
    error::CoreError,
};

pub const BPS_SCALE: i64 = 10_000;

/// One provider's slice of a planned allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanEntry {
    pub provider: String,
    pub amount: i64,
    pub percentage_bps: i64,
}

#[derive(Debug, Clone)]
pub struct AllocationPlan {
    pub required: i64,
    pub tier: Tier,
    pub token: TokenKind,
    pub entries: Vec<PlanEntry>,
}

/// Proportional split of `required` across providers by available balance.
///
/// Two passes: a floored proportional pass, then a remainder walk in the
/// same descending-available order. Basis points are floored against the
/// requirement, with the leftover bps pinned on the largest entry.
/// Errs with the total available when the pool cannot cover the ask.
pub fn plan_allocation(
    required: i64,
    balances: &[ProviderTierBalance],
) -> Result<Vec<PlanEntry>, i64> {
    let mut ordered: Vec<&ProviderTierBalance> =
        balances.iter().filter(|b| b.available() >= 1).collect();
    ordered.sort_by(|a, b| {
        b.available()
            .cmp(&a.available())
            .then_with(|| a.provider.cmp(&b.provider))
    });

    let total_available: i64 = ordered.iter().map(|b| b.available()).sum();
    if required <= 0 {
        return Err(total_available);
    }
    if total_available < required {
        return Err(total_available);
    }

    let mut planned: Vec<i64> = vec![0; ordered.len()];
    let mut remaining = required;

    for (i, balance) in ordered.iter().enumerate() {
        if remaining == 0 {
            break;
        }
        let proportional =
            (required as i128 * balance.available() as i128 / total_available as i128) as i64;
        let share = proportional.min(balance.available()).min(remaining);
        planned[i] = share;
        remaining -= share;
    }

    // Flooring can leave a residue; hand it out in the same order.
    for (i, balance) in ordered.iter().enumerate() {
        if remaining == 0 {
            break;
        }
        let extra = (balance.available() - planned[i]).min(remaining);
        planned[i] += extra;
        remaining -= extra;
    }

    if remaining > 0 {
        return Err(total_available);
    }

    let mut entries: Vec<PlanEntry> = ordered
        .iter()
        .zip(&planned)
        .filter(|(_, share)| **share > 0)
        .map(|(balance, share)| PlanEntry {
            provider: balance.provider.clone(),
            amount: *share,
            percentage_bps: (*share as i128 * BPS_SCALE as i128 / required as i128) as i64,
        })
        .collect();

    let assigned_bps: i64 = entries.iter().map(|e| e.percentage_bps).sum();
    let remainder_bps = BPS_SCALE - assigned_bps;
    if remainder_bps > 0 {
        if let Some(largest) = entries.iter_mut().max_by(|a, b| {
            a.amount
                .cmp(&b.amount)
                .then_with(|| b.provider.cmp(&a.provider))
        }) {
            largest.percentage_bps += remainder_bps;
        }
    }

    Ok(entries)
}

/// Split an integer total by basis-point weights, flooring each share and
/// assigning the rounding remainder to the largest weight. The same rule
/// covers premium distribution and settlement losses.
pub fn split_by_bps(total: i64, weights: &[(Uuid, i64)]) -> Vec<(Uuid, i64)> {
    if total <= 0 || weights.is_empty() {
        return weights.iter().map(|(id, _)| (*id, 0)).collect();
    }

    let mut shares: Vec<(Uuid, i64)> = weights
        .iter()
        .map(|(id, bps)| (*id, (total as i128 * *bps as i128 / BPS_SCALE as i128) as i64))
        .collect();

    let assigned: i64 = shares.iter().map(|(_, s)| *s).sum();
    let remainder = total - assigned;
    if remainder > 0 {
        if let Some(largest_index) = weights
            .iter()
            .enumerate()
            .max_by_key(|(_, (_, bps))| *bps)
            .map(|(i, _)| i)
        {
            shares[largest_index].1 += remainder;
        }
    }
    shares
}

/// Plans provider capital against tier liquidity. Commits happen inside the
/// policy-creation transaction; release and settlement are driven by the
/// lifecycle flows.
#[derive(Clone)]
pub struct Allocator {
    db: Database,
}

impl Allocator {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Read-only planning pass; no balances change until commit.
    pub async fn plan(
        &self,
        required: i64,
        tier: Tier,
        token: TokenKind,
    ) -> Result<AllocationPlan, CoreError> {
        let balances = self
            .db
            .eligible_balances(tier, token)
            .await
            .map_err(CoreError::Internal)?;

        match plan_allocation(required, &balances) {
            Ok(entries) => Ok(AllocationPlan {
                required,
                tier,
                token,
                entries,
            }),
            Err(available) => Err(CoreError::InsufficientLiquidity {
                tier: tier.as_str().to_string(),
                required,
                available,
            }),
        }
    }

    pub async fn release(&self, policy_id: Uuid) -> anyhow::Result<usize> {
        self.db.release_policy_collateral(policy_id).await
    }

    pub async fn apply_settlement(
        &self,
        policy_id: Uuid,
        losses: &[(Uuid, i64)],
    ) -> anyhow::Result<()> {
        self.db.apply_policy_settlement(policy_id, losses).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn balance(provider: &str, deposited: i64, locked: i64) -> ProviderTierBalance {
        ProviderTierBalance {
            provider: provider.to_string(),
            tier: Tier::Balanced,
            token: TokenKind::WrappedBtc,
            deposited,
            locked,
            premium_earned: 0,
            last_deposit_block: None,
            deposit_count: 1,
        }
    }

    #[test]
    fn proportional_split_with_exact_fit() {
        // Required 10, providers A=6, B=3, C=1 available.
        let balances = vec![balance("A", 6, 0), balance("B", 3, 0), balance("C", 1, 0)];
        let entries = plan_allocation(10, &balances).unwrap();

        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0], PlanEntry { provider: "A".into(), amount: 6, percentage_bps: 6_000 });
        assert_eq!(entries[1], PlanEntry { provider: "B".into(), amount: 3, percentage_bps: 3_000 });
        assert_eq!(entries[2], PlanEntry { provider: "C".into(), amount: 1, percentage_bps: 1_000 });
        assert_eq!(entries.iter().map(|e| e.amount).sum::<i64>(), 10);
        assert_eq!(entries.iter().map(|e| e.percentage_bps).sum::<i64>(), BPS_SCALE);
    }

    #[test]
    fn flooring_remainder_goes_to_front_of_order() {
        // Required 10 against 7+7: floor gives 5+5, remainder 0. Use
        // amounts that force a flooring residue instead.
        let balances = vec![balance("A", 7, 0), balance("B", 7, 0), balance("C", 7, 0)];
        let entries = plan_allocation(10, &balances).unwrap();
        assert_eq!(entries.iter().map(|e| e.amount).sum::<i64>(), 10);
        // floor(10·7/21) = 3 each, remainder 1 assigned to the first provider
        assert_eq!(entries[0].amount, 4);
        assert_eq!(entries[1].amount, 3);
        assert_eq!(entries[2].amount, 3);
        assert_eq!(entries.iter().map(|e| e.percentage_bps).sum::<i64>(), BPS_SCALE);
        // bps remainder lands on the largest entry
        assert_eq!(entries[0].percentage_bps, 4_000);
    }

    #[test]
    fn locked_capital_is_not_allocatable() {
        let balances = vec![balance("A", 10, 8), balance("B", 5, 0)];
        let entries = plan_allocation(6, &balances).unwrap();
        let a = entries.iter().find(|e| e.provider == "A").unwrap();
        assert!(a.amount <= 2);
        assert_eq!(entries.iter().map(|e| e.amount).sum::<i64>(), 6);
    }

    #[test]
    fn insufficient_liquidity_reports_available() {
        let balances = vec![balance("A", 3, 0), balance("B", 2, 0)];
        assert_eq!(plan_allocation(10, &balances), Err(5));
    }

    #[test]
    fn bps_sum_is_exact_under_flooring() {
        let balances = vec![balance("A", 5, 0), balance("B", 4, 0), balance("C", 3, 0)];
        let entries = plan_allocation(7, &balances).unwrap();
        assert_eq!(entries.iter().map(|e| e.amount).sum::<i64>(), 7);
        assert_eq!(entries.iter().map(|e| e.percentage_bps).sum::<i64>(), BPS_SCALE);
    }

    #[test]
    fn split_by_bps_assigns_remainder_to_largest() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        let shares = split_by_bps(1_001, &[(a, 6_000), (b, 3_000), (c, 1_000)]);
        let total: i64 = shares.iter().map(|(_, s)| s).sum();
        assert_eq!(total, 1_001);
        // floor: 600, 300, 100; remainder 1 to the 6000-bps entry
        assert_eq!(shares[0], (a, 601));
        assert_eq!(shares[1], (b, 300));
        assert_eq!(shares[2], (c, 100));
    }
}
