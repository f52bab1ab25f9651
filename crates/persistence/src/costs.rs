//! Cost store
//!
//! One row per call, upserted at finalize. Aggregates skip "failed" calls
//! (zero LLM API calls) when computing averages but sum everything for
//! totals.

use sqlx::{PgPool, Row};

use crate::error::PersistenceError;

/// One call's persisted cost summary
#[derive(Debug, Clone)]
pub struct CostRow {
    pub call_id: String,
    pub total: f64,
    pub breakdown: serde_json::Value,
    pub llm_calls: i64,
    pub transferred: bool,
}

/// Aggregate view over all calls
#[derive(Debug, Clone, Default)]
pub struct CostAggregates {
    pub total_cost: f64,
    pub call_count: i64,
    /// Calls with at least one LLM round trip
    pub engaged_count: i64,
    pub average_engaged_cost: f64,
}

#[derive(Clone)]
pub struct CostStore {
    pool: PgPool,
}

impl CostStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn upsert(&self, row: &CostRow) -> Result<(), PersistenceError> {
        let breakdown_json = serde_json::to_string(&row.breakdown)?;
        sqlx::query(
            r#"
            INSERT INTO call_costs (call_id, total, breakdown_json, llm_calls, transferred, updated_at)
            VALUES ($1, $2, $3, $4, $5, now())
            ON CONFLICT (call_id) DO UPDATE SET
                total = EXCLUDED.total,
                breakdown_json = EXCLUDED.breakdown_json,
                llm_calls = EXCLUDED.llm_calls,
                transferred = EXCLUDED.transferred,
                updated_at = now()
            "#,
        )
        .bind(&row.call_id)
        .bind(row.total)
        .bind(breakdown_json)
        .bind(row.llm_calls)
        .bind(row.transferred)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, call_id: &str) -> Result<Option<CostRow>, PersistenceError> {
        let row = sqlx::query(
            "SELECT call_id, total, breakdown_json, llm_calls, transferred \
             FROM call_costs WHERE call_id = $1",
        )
        .bind(call_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            let breakdown_json: String = row.try_get("breakdown_json").map_err(decode)?;
            Ok(CostRow {
                call_id: row.try_get("call_id").map_err(decode)?,
                total: row.try_get("total").map_err(decode)?,
                breakdown: serde_json::from_str(&breakdown_json)?,
                llm_calls: row.try_get("llm_calls").map_err(decode)?,
                transferred: row.try_get("transferred").map_err(decode)?,
            })
        })
        .transpose()
    }

    pub async fn aggregates(&self) -> Result<CostAggregates, PersistenceError> {
        let row = sqlx::query(
            "SELECT coalesce(sum(total), 0) AS total_cost, \
                    count(*) AS call_count, \
                    count(*) FILTER (WHERE llm_calls > 0) AS engaged_count, \
                    coalesce(avg(total) FILTER (WHERE llm_calls > 0), 0) AS average_engaged \
             FROM call_costs",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(CostAggregates {
            total_cost: row.try_get("total_cost").map_err(decode)?,
            call_count: row.try_get("call_count").map_err(decode)?,
            engaged_count: row.try_get("engaged_count").map_err(decode)?,
            average_engaged_cost: row.try_get("average_engaged").map_err(decode)?,
        })
    }
}

fn decode(e: sqlx::Error) -> PersistenceError {
    PersistenceError::Decode(e.to_string())
}
