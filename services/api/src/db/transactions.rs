use sqlx::Row;
use uuid::Uuid;

use super::{
    types::{TransactionRecord, TxKind, TxStatus},
    Database,
};

fn record_from_row(row: &sqlx::postgres::PgRow) -> anyhow::Result<TransactionRecord> {
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    Ok(TransactionRecord {
        convex_id: row.try_get("convex_id")?,
        chain_tx_id: row.try_get("chain_tx_id")?,
        kind: kind.parse().map_err(anyhow::Error::msg)?,
        payload: row.try_get("payload")?,
        status: status.parse().map_err(anyhow::Error::msg)?,
        error_details: row.try_get("error_details")?,
        nonce: row.try_get("nonce")?,
        retry_count: row.try_get("retry_count")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

const TX_COLUMNS: &str = "convex_id, chain_tx_id, kind, payload, status, error_details, \
     nonce, retry_count, created_at, updated_at";

impl Database {
    pub async fn insert_transaction(&self, record: &TransactionRecord) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO transactions
                (convex_id, chain_tx_id, kind, payload, status, error_details, nonce, retry_count)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(record.convex_id)
        .bind(&record.chain_tx_id)
        .bind(record.kind.as_str())
        .bind(&record.payload)
        .bind(record.status.as_str())
        .bind(&record.error_details)
        .bind(record.nonce)
        .bind(record.retry_count)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn get_transaction(
        &self,
        convex_id: Uuid,
    ) -> anyhow::Result<Option<TransactionRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {TX_COLUMNS} FROM transactions WHERE convex_id = $1"
        ))
        .bind(convex_id)
        .fetch_optional(self.pool())
        .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    pub async fn find_transaction_by_chain_id(
        &self,
        chain_tx_id: &str,
    ) -> anyhow::Result<Option<TransactionRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {TX_COLUMNS} FROM transactions WHERE chain_tx_id = $1"
        ))
        .bind(chain_tx_id)
        .fetch_optional(self.pool())
        .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    /// Stamp broadcast results onto a pending record.
    pub async fn mark_transaction_submitted(
        &self,
        convex_id: Uuid,
        chain_tx_id: &str,
        nonce: i64,
        retry_count: i32,
    ) -> anyhow::Result<bool> {
        let updated = sqlx::query(
            "UPDATE transactions
             SET status = 'submitted', chain_tx_id = $2, nonce = $3, retry_count = $4,
                 updated_at = NOW()
             WHERE convex_id = $1 AND status = 'pending'",
        )
        .bind(convex_id)
        .bind(chain_tx_id)
        .bind(nonce)
        .bind(retry_count)
        .execute(self.pool())
        .await?;
        Ok(updated.rows_affected() > 0)
    }

    /// Monotone terminal/status update: only moves the row forward in the
    /// `Pending < Submitted < terminal` lattice.
    pub async fn advance_transaction_status(
        &self,
        convex_id: Uuid,
        status: TxStatus,
        error_details: Option<&str>,
    ) -> anyhow::Result<bool> {
        let allowed_from: &[&str] = match status.rank() {
            0 => return Ok(false),
            1 => &["pending"],
            _ => &["pending", "submitted"],
        };

        let updated = sqlx::query(
            "UPDATE transactions
             SET status = $2, error_details = COALESCE($3, error_details), updated_at = NOW()
             WHERE convex_id = $1 AND status = ANY($4)",
        )
        .bind(convex_id)
        .bind(status.as_str())
        .bind(error_details)
        .bind(allowed_from)
        .execute(self.pool())
        .await?;
        Ok(updated.rows_affected() > 0)
    }

    /// Whether a policy already has one of these calls in flight. The
    /// expiration sweep uses this instead of flipping policy status early,
    /// so a policy is never double-submitted while a verdict is pending.
    pub async fn has_open_transaction_for_policy(
        &self,
        policy_id: Uuid,
        kinds: &[TxKind],
    ) -> anyhow::Result<bool> {
        let kind_names: Vec<&str> = kinds.iter().map(|k| k.as_str()).collect();
        let row = sqlx::query(
            "SELECT 1 AS present FROM transactions
             WHERE status IN ('pending', 'submitted')
               AND kind = ANY($1)
               AND payload #>> '{context,policy_id}' = $2
             LIMIT 1",
        )
        .bind(&kind_names)
        .bind(policy_id.to_string())
        .fetch_optional(self.pool())
        .await?;
        Ok(row.is_some())
    }

    /// Whether an `expire-policies-batch` call is still pending a verdict.
    pub async fn has_open_expiration_batch(&self) -> anyhow::Result<bool> {
        let row = sqlx::query(
            "SELECT 1 AS present FROM transactions
             WHERE status IN ('pending', 'submitted')
               AND kind = 'update-policy-status'
               AND payload #>> '{context,outcome}' = 'expire-batch'
             LIMIT 1",
        )
        .fetch_optional(self.pool())
        .await?;
        Ok(row.is_some())
    }

    /// Rows the status poller still needs to reconcile.
    pub async fn unresolved_transactions(&self) -> anyhow::Result<Vec<TransactionRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {TX_COLUMNS} FROM transactions
             WHERE status = 'submitted' AND chain_tx_id IS NOT NULL
             ORDER BY created_at ASC"
        ))
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(record_from_row).collect()
    }
}
