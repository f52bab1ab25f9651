//! Carrier call store
//!
//! One row per confirmed origination. This table is the source of truth
//! for "the carrier accepted this call": a lead is only marked `called`
//! after its row lands here.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::PersistenceError;

/// One originated call
#[derive(Debug, Clone)]
pub struct CarrierCallRow {
    pub call_id: String,
    pub lead_id: Uuid,
    pub from_number: String,
    pub to_number: String,
    pub initiated_at: DateTime<Utc>,
    pub webhook_received: bool,
    pub status: String,
}

#[derive(Clone)]
pub struct CarrierCallStore {
    pool: PgPool,
}

impl CarrierCallStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Record a confirmed origination (upsert on call_id)
    pub async fn record(
        &self,
        call_id: &str,
        lead_id: Uuid,
        from_number: &str,
        to_number: &str,
    ) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
            INSERT INTO carrier_calls (call_id, lead_id, from_number, to_number, initiated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (call_id) DO NOTHING
            "#,
        )
        .bind(call_id)
        .bind(lead_id)
        .bind(from_number)
        .bind(to_number)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Flag that at least one webhook arrived, with the latest status
    pub async fn mark_webhook(&self, call_id: &str, status: &str) -> Result<(), PersistenceError> {
        sqlx::query(
            "UPDATE carrier_calls SET webhook_received = TRUE, status = $2 WHERE call_id = $1",
        )
        .bind(call_id)
        .bind(status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, call_id: &str) -> Result<Option<CarrierCallRow>, PersistenceError> {
        let row = sqlx::query(
            "SELECT call_id, lead_id, from_number, to_number, initiated_at, \
             webhook_received, status FROM carrier_calls WHERE call_id = $1",
        )
        .bind(call_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(CarrierCallRow {
                call_id: row.try_get("call_id").map_err(decode)?,
                lead_id: row.try_get("lead_id").map_err(decode)?,
                from_number: row.try_get("from_number").map_err(decode)?,
                to_number: row.try_get("to_number").map_err(decode)?,
                initiated_at: row.try_get("initiated_at").map_err(decode)?,
                webhook_received: row.try_get("webhook_received").map_err(decode)?,
                status: row.try_get("status").map_err(decode)?,
            })
        })
        .transpose()
    }

    pub async fn total(&self) -> Result<i64, PersistenceError> {
        let row = sqlx::query("SELECT count(*) AS total FROM carrier_calls")
            .fetch_one(&self.pool)
            .await?;
        row.try_get("total").map_err(decode)
    }
}

fn decode(e: sqlx::Error) -> PersistenceError {
    PersistenceError::Decode(e.to_string())
}
