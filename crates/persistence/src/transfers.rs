//! Transfer store

use sqlx::{PgPool, Row};

use outdial_core::TransferRecord;

use crate::error::PersistenceError;

#[derive(Clone)]
pub struct TransferStore {
    pool: PgPool,
}

impl TransferStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn upsert(&self, record: &TransferRecord) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
            INSERT INTO transferred_calls
                (call_id, lead_id, lead_name, lead_phone, from_did, to_agent_number, transferred_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (call_id) DO NOTHING
            "#,
        )
        .bind(&record.call_id)
        .bind(record.lead_id)
        .bind(&record.lead_name)
        .bind(&record.lead_phone)
        .bind(&record.from_did)
        .bind(&record.to_agent_number)
        .bind(record.transferred_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<TransferRecord>, PersistenceError> {
        let rows = sqlx::query(
            "SELECT call_id, lead_id, lead_name, lead_phone, from_did, to_agent_number, \
             transferred_at FROM transferred_calls ORDER BY transferred_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(TransferRecord {
                    call_id: row.try_get("call_id").map_err(decode)?,
                    lead_id: row.try_get("lead_id").map_err(decode)?,
                    lead_name: row.try_get("lead_name").map_err(decode)?,
                    lead_phone: row.try_get("lead_phone").map_err(decode)?,
                    from_did: row.try_get("from_did").map_err(decode)?,
                    to_agent_number: row.try_get("to_agent_number").map_err(decode)?,
                    transferred_at: row.try_get("transferred_at").map_err(decode)?,
                })
            })
            .collect()
    }

    pub async fn delete_all(&self) -> Result<u64, PersistenceError> {
        let result = sqlx::query("DELETE FROM transferred_calls")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn count(&self) -> Result<i64, PersistenceError> {
        let row = sqlx::query("SELECT count(*) AS total FROM transferred_calls")
            .fetch_one(&self.pool)
            .await?;
        row.try_get("total").map_err(decode)
    }
}

fn decode(e: sqlx::Error) -> PersistenceError {
    PersistenceError::Decode(e.to_string())
}
