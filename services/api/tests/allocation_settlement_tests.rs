//! Capital allocation and settlement scenarios: the proportional split,
//! basis-point bookkeeping, premium fan-out, and expiry-batch math.

use uuid::Uuid;

use bithedge_api::db::types::{ProviderTierBalance, Tier, TokenKind};
use bithedge_api::policies::expiration::{
    put_is_itm, settlement_token_sats, settlement_value_cents,
};
use bithedge_api::pool::{plan_allocation, split_by_bps, BPS_SCALE};

const BTC: i64 = 100_000_000;

fn balance(provider: &str, available_btc: i64) -> ProviderTierBalance {
    ProviderTierBalance {
        provider: provider.to_string(),
        tier: Tier::Balanced,
        token: TokenKind::WrappedBtc,
        deposited: available_btc * BTC,
        locked: 0,
        premium_earned: 0,
        last_deposit_block: Some(1_000),
        deposit_count: 1,
    }
}

#[test]
fn ten_btc_across_three_providers() {
    // Required 10 BTC in `balanced`; A=6, B=3, C=1 available.
    let balances = vec![balance("A", 6), balance("B", 3), balance("C", 1)];
    let entries = plan_allocation(10 * BTC, &balances).unwrap();

    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0].provider, "A");
    assert_eq!(entries[0].amount, 6 * BTC);
    assert_eq!(entries[0].percentage_bps, 6_000);
    assert_eq!(entries[1].provider, "B");
    assert_eq!(entries[1].amount, 3 * BTC);
    assert_eq!(entries[1].percentage_bps, 3_000);
    assert_eq!(entries[2].provider, "C");
    assert_eq!(entries[2].amount, BTC);
    assert_eq!(entries[2].percentage_bps, 1_000);

    let total: i64 = entries.iter().map(|e| e.amount).sum();
    assert_eq!(total, 10 * BTC);
    let bps: i64 = entries.iter().map(|e| e.percentage_bps).sum();
    assert_eq!(bps, BPS_SCALE);
}

#[test]
fn allocation_never_exceeds_any_provider_available() {
    let balances = vec![balance("A", 5), balance("B", 2), balance("C", 2)];
    let entries = plan_allocation(8 * BTC, &balances).unwrap();
    for entry in &entries {
        let available = balances
            .iter()
            .find(|b| b.provider == entry.provider)
            .unwrap()
            .available();
        assert!(entry.amount <= available);
    }
    assert_eq!(entries.iter().map(|e| e.amount).sum::<i64>(), 8 * BTC);
}

#[test]
fn insufficient_pool_is_an_explicit_error() {
    let balances = vec![balance("A", 2), balance("B", 1)];
    let err = plan_allocation(10 * BTC, &balances).unwrap_err();
    assert_eq!(err, 3 * BTC);
}

#[test]
fn bps_always_sum_to_exactly_ten_thousand() {
    // Awkward requirements that floor badly still account to 100%.
    for required in [7, 11, 13, 17, 23] {
        let balances = vec![balance("A", 9), balance("B", 8), balance("C", 7)];
        let entries = plan_allocation(required * BTC + 1, &balances).unwrap();
        let bps: i64 = entries.iter().map(|e| e.percentage_bps).sum();
        assert_eq!(bps, BPS_SCALE, "required={required}");
    }
}

#[test]
fn premium_split_mirrors_allocation_percentages() {
    // Premium 1,000,001 micro over 60/30/10: remainder lands on the
    // largest share and the sum is exact.
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    let c = Uuid::new_v4();
    let shares = split_by_bps(1_000_001, &[(a, 6_000), (b, 3_000), (c, 1_000)]);

    assert_eq!(shares.iter().map(|(_, s)| s).sum::<i64>(), 1_000_001);
    assert_eq!(shares[0].1, 600_001);
    assert_eq!(shares[1].1, 300_000);
    assert_eq!(shares[2].1, 100_000);
}

#[test]
fn settlement_loss_split_covers_the_full_loss() {
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    let losses = split_by_bps(123_457, &[(a, 7_500), (b, 2_500)]);
    assert_eq!(losses.iter().map(|(_, s)| s).sum::<i64>(), 123_457);
}

#[test]
fn expiration_batch_scenario() {
    // Three active PUTs expiring at the same height; the oracle price is
    // fetched once and reused.
    let policies = [
        (5_000_000i64, BTC, 4_800_000i64),  // K=50000, 1 BTC, S=48000
        (4_500_000, 2 * BTC, 4_600_000),    // K=45000, 2 BTC, S=46000
        (5_200_000, BTC / 2, 4_000_000),    // K=52000, 0.5 BTC, S=40000
    ];

    let outcomes: Vec<(bool, i64)> = policies
        .iter()
        .map(|(strike, amount, spot)| {
            (
                put_is_itm(*strike, *spot),
                settlement_value_cents(*strike, *spot, *amount),
            )
        })
        .collect();

    // Policy 1: ITM, (50000 - 48000) * 1 = 2000 USD.
    assert_eq!(outcomes[0], (true, 200_000));
    // Policy 2: OTM, expires worthless.
    assert_eq!(outcomes[1], (false, 0));
    // Policy 3: ITM, (52000 - 40000) * 0.5 = 6000 USD.
    assert_eq!(outcomes[2], (true, 600_000));

    let exercised = outcomes.iter().filter(|(itm, _)| *itm).count();
    let expired = outcomes.len() - exercised;
    assert_eq!(exercised, 2);
    assert_eq!(expired, 1);
}

#[test]
fn token_settlement_is_payable_from_locked_collateral() {
    // The sats payout at expiry never exceeds the protected amount for
    // any ITM spot above zero.
    for spot_cents in (1..5_000_000).step_by(97_531) {
        let payout = settlement_token_sats(5_000_000, spot_cents, BTC);
        let value = settlement_value_cents(5_000_000, spot_cents, BTC);
        assert!(payout >= 0);
        assert!(value >= 0);
        if spot_cents >= 2_500_000 {
            // Above half the strike the payout fits inside 1 BTC.
            assert!(payout <= BTC, "spot={spot_cents} payout={payout}");
        }
    }
}
