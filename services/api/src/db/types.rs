use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Risk segment a provider commits capital to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Conservative,
    Balanced,
    Aggressive,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Conservative => "conservative",
            Tier::Balanced => "balanced",
            Tier::Aggressive => "aggressive",
        }
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "conservative" => Ok(Tier::Conservative),
            "balanced" => Ok(Tier::Balanced),
            "aggressive" => Ok(Tier::Aggressive),
            other => Err(format!("unknown tier: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TokenKind {
    Native,
    WrappedBtc,
}

impl TokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::Native => "native",
            TokenKind::WrappedBtc => "wrapped-btc",
        }
    }

    /// Suffix used by the vault's deposit/withdraw entry points.
    pub fn contract_suffix(&self) -> &'static str {
        match self {
            TokenKind::Native => "stx",
            TokenKind::WrappedBtc => "sbtc",
        }
    }
}

impl FromStr for TokenKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "native" => Ok(TokenKind::Native),
            "wrapped-btc" => Ok(TokenKind::WrappedBtc),
            other => Err(format!("unknown token: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyType {
    #[serde(rename = "PUT")]
    Put,
    #[serde(rename = "CALL")]
    Call,
}

impl PolicyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyType::Put => "PUT",
            PolicyType::Call => "CALL",
        }
    }
}

impl FromStr for PolicyType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "PUT" => Ok(PolicyType::Put),
            "CALL" => Ok(PolicyType::Call),
            other => Err(format!("unknown policy type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyStatus {
    PendingTx,
    Active,
    Exercised,
    Expired,
    Settled,
    Failed,
}

impl PolicyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyStatus::PendingTx => "pending_tx",
            PolicyStatus::Active => "active",
            PolicyStatus::Exercised => "exercised",
            PolicyStatus::Expired => "expired",
            PolicyStatus::Settled => "settled",
            PolicyStatus::Failed => "failed",
        }
    }

    /// Legal transitions only; everything else is rejected.
    pub fn can_transition(self, next: PolicyStatus) -> bool {
        use PolicyStatus::*;
        matches!(
            (self, next),
            (PendingTx, Active)
                | (PendingTx, Failed)
                | (Active, Expired)
                | (Active, Exercised)
                | (Exercised, Settled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PolicyStatus::Expired | PolicyStatus::Settled | PolicyStatus::Failed
        )
    }
}

impl FromStr for PolicyStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending_tx" => Ok(PolicyStatus::PendingTx),
            "active" => Ok(PolicyStatus::Active),
            "exercised" => Ok(PolicyStatus::Exercised),
            "expired" => Ok(PolicyStatus::Expired),
            "settled" => Ok(PolicyStatus::Settled),
            "failed" => Ok(PolicyStatus::Failed),
            other => Err(format!("unknown policy status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStatus {
    Pending,
    Confirmed,
    Released,
    SettlementImpacted,
}

impl AllocationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationStatus::Pending => "pending",
            AllocationStatus::Confirmed => "confirmed",
            AllocationStatus::Released => "released",
            AllocationStatus::SettlementImpacted => "settlement_impacted",
        }
    }
}

impl FromStr for AllocationStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(AllocationStatus::Pending),
            "confirmed" => Ok(AllocationStatus::Confirmed),
            "released" => Ok(AllocationStatus::Released),
            "settlement_impacted" => Ok(AllocationStatus::SettlementImpacted),
            other => Err(format!("unknown allocation status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributionStatus {
    Planned,
    Recorded,
    Paid,
}

impl DistributionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DistributionStatus::Planned => "planned",
            DistributionStatus::Recorded => "recorded",
            DistributionStatus::Paid => "paid",
        }
    }
}

impl FromStr for DistributionStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "planned" => Ok(DistributionStatus::Planned),
            "recorded" => Ok(DistributionStatus::Recorded),
            "paid" => Ok(DistributionStatus::Paid),
            other => Err(format!("unknown distribution status: {other}")),
        }
    }
}

/// Off-chain transaction record status. Ordered: updates may only move to a
/// strictly higher rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Pending,
    Submitted,
    Confirmed,
    Failed,
    Replaced,
    Expired,
}

impl TxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Pending => "pending",
            TxStatus::Submitted => "submitted",
            TxStatus::Confirmed => "confirmed",
            TxStatus::Failed => "failed",
            TxStatus::Replaced => "replaced",
            TxStatus::Expired => "expired",
        }
    }

    pub fn rank(self) -> u8 {
        match self {
            TxStatus::Pending => 0,
            TxStatus::Submitted => 1,
            TxStatus::Confirmed | TxStatus::Failed | TxStatus::Replaced | TxStatus::Expired => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 2
    }
}

impl FromStr for TxStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(TxStatus::Pending),
            "submitted" => Ok(TxStatus::Submitted),
            "confirmed" => Ok(TxStatus::Confirmed),
            "failed" => Ok(TxStatus::Failed),
            "replaced" => Ok(TxStatus::Replaced),
            "expired" => Ok(TxStatus::Expired),
            other => Err(format!("unknown transaction status: {other}")),
        }
    }
}

/// What an outbound transaction does; drives the confirmation callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TxKind {
    SetAggregatedPrice,
    CreatePolicy,
    UpdatePolicyStatus,
    PaySettlement,
    RecordPremium,
    Deposit,
    Withdraw,
}

impl TxKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxKind::SetAggregatedPrice => "set-aggregated-price",
            TxKind::CreatePolicy => "create-policy",
            TxKind::UpdatePolicyStatus => "update-policy-status",
            TxKind::PaySettlement => "pay-settlement",
            TxKind::RecordPremium => "record-premium",
            TxKind::Deposit => "deposit",
            TxKind::Withdraw => "withdraw",
        }
    }
}

impl FromStr for TxKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "set-aggregated-price" => Ok(TxKind::SetAggregatedPrice),
            "create-policy" => Ok(TxKind::CreatePolicy),
            "update-policy-status" => Ok(TxKind::UpdatePolicyStatus),
            "pay-settlement" => Ok(TxKind::PaySettlement),
            "record-premium" => Ok(TxKind::RecordPremium),
            "deposit" => Ok(TxKind::Deposit),
            "withdraw" => Ok(TxKind::Withdraw),
            other => Err(format!("unknown transaction kind: {other}")),
        }
    }
}

/// One sample from one price source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceTick {
    pub source: String,
    pub price_usd: f64,
    pub weight: f64,
    pub timestamp: DateTime<Utc>,
}

/// Result of one aggregation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedPrice {
    pub price: f64,
    pub timestamp: DateTime<Utc>,
    pub source_count: i32,
    pub volatility: f64,
    pub range_24h_low: Option<f64>,
    pub range_24h_high: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoricalDailyPrice {
    pub day: chrono::NaiveDate,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: f64,
    pub volume: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoricalVolatility {
    pub period_days: i32,
    pub timestamp: DateTime<Utc>,
    pub volatility: f64,
    pub data_points: i32,
    pub method: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleSubmission {
    pub tx_id: String,
    pub submitted_price_sats: i64,
    pub reason: String,
    pub source_count: i32,
    pub percent_change: Option<f64>,
    pub status: TxStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderTierBalance {
    pub provider: String,
    pub tier: Tier,
    pub token: TokenKind,
    pub deposited: i64,
    pub locked: i64,
    pub premium_earned: i64,
    pub last_deposit_block: Option<i64>,
    pub deposit_count: i32,
}

impl ProviderTierBalance {
    pub fn available(&self) -> i64 {
        self.deposited - self.locked
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierCapital {
    pub tier: Tier,
    pub token: TokenKind,
    pub total_deposited: i64,
    pub total_locked: i64,
    pub capacity_limit: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub id: Uuid,
    pub on_chain_id: Option<i64>,
    pub owner: String,
    pub policy_type: PolicyType,
    pub risk_tier: Tier,
    pub strike_cents: i64,
    pub amount_sats: i64,
    pub premium_micro: i64,
    pub creation_height: i64,
    pub expiration_height: i64,
    pub status: PolicyStatus,
    pub collateral_token: TokenKind,
    pub settlement_token: TokenKind,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Allocation {
    pub id: Uuid,
    pub policy_id: Uuid,
    pub provider: String,
    pub tier: Tier,
    pub token: TokenKind,
    pub amount_locked: i64,
    pub percentage_bps: i64,
    pub status: AllocationStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PremiumDistribution {
    pub id: Uuid,
    pub policy_id: Uuid,
    pub allocation_id: Uuid,
    pub provider: String,
    pub premium_share: i64,
    pub status: DistributionStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub convex_id: Uuid,
    pub chain_tx_id: Option<String>,
    pub kind: TxKind,
    pub payload: serde_json::Value,
    pub status: TxStatus,
    pub error_details: Option<String>,
    pub nonce: Option<i64>,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_transitions_are_monotone() {
        use PolicyStatus::*;
        assert!(PendingTx.can_transition(Active));
        assert!(PendingTx.can_transition(Failed));
        assert!(Active.can_transition(Expired));
        assert!(Active.can_transition(Exercised));
        assert!(Exercised.can_transition(Settled));

        assert!(!Active.can_transition(PendingTx));
        assert!(!Expired.can_transition(Active));
        assert!(!Settled.can_transition(Exercised));
        assert!(!Failed.can_transition(Active));
        assert!(!PendingTx.can_transition(Settled));
    }

    #[test]
    fn tx_status_lattice_ranks() {
        assert!(TxStatus::Pending.rank() < TxStatus::Submitted.rank());
        assert!(TxStatus::Submitted.rank() < TxStatus::Confirmed.rank());
        assert_eq!(TxStatus::Confirmed.rank(), TxStatus::Failed.rank());
        assert!(TxStatus::Confirmed.is_terminal());
        assert!(!TxStatus::Submitted.is_terminal());
    }

    #[test]
    fn status_strings_round_trip() {
        for s in [
            PolicyStatus::PendingTx,
            PolicyStatus::Active,
            PolicyStatus::Exercised,
            PolicyStatus::Expired,
            PolicyStatus::Settled,
            PolicyStatus::Failed,
        ] {
            assert_eq!(s.as_str().parse::<PolicyStatus>().unwrap(), s);
        }
        for t in [Tier::Conservative, Tier::Balanced, Tier::Aggressive] {
            assert_eq!(t.as_str().parse::<Tier>().unwrap(), t);
        }
    }
}
