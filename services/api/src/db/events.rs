use super::Database;
use sqlx::Row;

impl Database {
    /// Next unprocessed event offset for a contract; zero when the contract
    /// has never been polled.
    pub async fn event_cursor(&self, contract_id: &str) -> anyhow::Result<i64> {
        let row = sqlx::query("SELECT next_offset FROM event_cursors WHERE contract_id = $1")
            .bind(contract_id)
            .fetch_optional(self.pool())
            .await?;

        Ok(match row {
            Some(row) => row.try_get("next_offset")?,
            None => 0,
        })
    }

    pub async fn advance_event_cursor(
        &self,
        contract_id: &str,
        next_offset: i64,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO event_cursors (contract_id, next_offset, updated_at)
             VALUES ($1, $2, NOW())
             ON CONFLICT (contract_id) DO UPDATE SET
                next_offset = GREATEST(event_cursors.next_offset, EXCLUDED.next_offset),
                updated_at = NOW()",
        )
        .bind(contract_id)
        .bind(next_offset)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn is_event_processed(&self, tx_id: &str, event_index: i32) -> anyhow::Result<bool> {
        let row = sqlx::query(
            "SELECT 1 AS present FROM processed_events WHERE tx_id = $1 AND event_index = $2",
        )
        .bind(tx_id)
        .bind(event_index)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.is_some())
    }

    /// Idempotence guard: returns false when `(tx_id, event_index)` was
    /// already processed.
    pub async fn try_mark_event_processed(
        &self,
        tx_id: &str,
        event_index: i32,
        topic: &str,
    ) -> anyhow::Result<bool> {
        let inserted = sqlx::query(
            "INSERT INTO processed_events (tx_id, event_index, topic)
             VALUES ($1, $2, $3)
             ON CONFLICT (tx_id, event_index) DO NOTHING",
        )
        .bind(tx_id)
        .bind(event_index)
        .bind(topic)
        .execute(self.pool())
        .await?;
        Ok(inserted.rows_affected() > 0)
    }
}
