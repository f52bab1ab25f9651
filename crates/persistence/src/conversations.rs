//! Conversation store
//!
//! Finalized conversations are upserted on call_id, so re-finalizing a
//! call is a database no-op.

use sqlx::{PgPool, Row};

use outdial_core::{ConversationRecord, ConversationStatus, TranscriptMessage};

use crate::error::PersistenceError;

/// Dashboard list filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConversationFilter {
    #[default]
    All,
    /// Conversations where the lead actually said something
    WithResponses,
    Completed,
}

impl ConversationFilter {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "with_responses" => ConversationFilter::WithResponses,
            "completed" => ConversationFilter::Completed,
            _ => ConversationFilter::All,
        }
    }
}

/// Duration bucket filter, in seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurationFilter {
    UpTo15,
    From16To30,
    From30To60,
    Over60,
}

impl DurationFilter {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "0-15" => Some(DurationFilter::UpTo15),
            "16-30" => Some(DurationFilter::From16To30),
            "30-60" => Some(DurationFilter::From30To60),
            "60+" => Some(DurationFilter::Over60),
            _ => None,
        }
    }

    fn bounds(&self) -> (i64, i64) {
        match self {
            DurationFilter::UpTo15 => (0, 15),
            DurationFilter::From16To30 => (16, 30),
            DurationFilter::From30To60 => (30, 60),
            DurationFilter::Over60 => (61, i64::MAX),
        }
    }
}

#[derive(Clone)]
pub struct ConversationStore {
    pool: PgPool,
}

impl ConversationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Upsert a finalized (or in-progress) conversation
    pub async fn upsert(&self, record: &ConversationRecord) -> Result<(), PersistenceError> {
        let messages_json = serde_json::to_string(&record.messages)?;
        let breakdown_json = serde_json::to_string(&record.cost_breakdown)?;
        sqlx::query(
            r#"
            INSERT INTO conversations
                (call_id, from_did, to_phone, started_at_ms, ended_at_ms, duration_secs,
                 cost_total, cost_breakdown_json, messages_json, status, hangup_cause)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (call_id) DO UPDATE SET
                ended_at_ms = EXCLUDED.ended_at_ms,
                duration_secs = EXCLUDED.duration_secs,
                cost_total = EXCLUDED.cost_total,
                cost_breakdown_json = EXCLUDED.cost_breakdown_json,
                messages_json = EXCLUDED.messages_json,
                status = EXCLUDED.status,
                hangup_cause = EXCLUDED.hangup_cause
            "#,
        )
        .bind(&record.call_id)
        .bind(&record.from_did)
        .bind(&record.to_phone)
        .bind(record.started_at_ms)
        .bind(record.ended_at_ms)
        .bind(record.duration_secs)
        .bind(record.cost_total)
        .bind(breakdown_json)
        .bind(messages_json)
        .bind(record.status.as_str())
        .bind(&record.hangup_cause)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, call_id: &str) -> Result<Option<ConversationRecord>, PersistenceError> {
        let row = sqlx::query(
            "SELECT call_id, from_did, to_phone, started_at_ms, ended_at_ms, duration_secs, \
             cost_total, cost_breakdown_json, messages_json, status, hangup_cause \
             FROM conversations WHERE call_id = $1",
        )
        .bind(call_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_record).transpose()
    }

    /// Paginated listing with dashboard filters; returns (rows, total).
    pub async fn list(
        &self,
        page: i64,
        limit: i64,
        filter: ConversationFilter,
        duration: Option<DurationFilter>,
    ) -> Result<(Vec<ConversationRecord>, i64), PersistenceError> {
        let mut conditions: Vec<String> = Vec::new();
        match filter {
            ConversationFilter::All => {}
            ConversationFilter::WithResponses => {
                conditions.push("messages_json LIKE '%\"Lead\"%'".to_string());
            }
            ConversationFilter::Completed => {
                conditions.push("status IN ('completed', 'transferred')".to_string());
            }
        }
        if let Some(duration) = duration {
            let (low, high) = duration.bounds();
            if high == i64::MAX {
                conditions.push(format!("duration_secs >= {}", low));
            } else {
                conditions.push(format!("duration_secs BETWEEN {} AND {}", low, high));
            }
        }
        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let total: i64 = sqlx::query(&format!(
            "SELECT count(*) AS total FROM conversations {}",
            where_clause
        ))
        .fetch_one(&self.pool)
        .await?
        .try_get("total")
        .map_err(decode)?;

        let offset = (page.max(1) - 1) * limit;
        let rows = sqlx::query(&format!(
            "SELECT call_id, from_did, to_phone, started_at_ms, ended_at_ms, duration_secs, \
             cost_total, cost_breakdown_json, messages_json, status, hangup_cause \
             FROM conversations {} ORDER BY started_at_ms DESC LIMIT $1 OFFSET $2",
            where_clause
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok((
            rows.iter()
                .map(row_to_record)
                .collect::<Result<Vec<_>, _>>()?,
            total,
        ))
    }

    pub async fn delete_all(&self) -> Result<u64, PersistenceError> {
        let result = sqlx::query("DELETE FROM conversations")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn row_to_record(row: &sqlx::postgres::PgRow) -> Result<ConversationRecord, PersistenceError> {
    let messages_json: String = row.try_get("messages_json").map_err(decode)?;
    let breakdown_json: Option<String> = row.try_get("cost_breakdown_json").map_err(decode)?;
    let status: String = row.try_get("status").map_err(decode)?;
    let messages: Vec<TranscriptMessage> = serde_json::from_str(&messages_json)?;
    let cost_breakdown = breakdown_json
        .map(|j| serde_json::from_str(&j))
        .transpose()?
        .unwrap_or(serde_json::Value::Null);

    Ok(ConversationRecord {
        call_id: row.try_get("call_id").map_err(decode)?,
        from_did: row.try_get("from_did").map_err(decode)?,
        to_phone: row.try_get("to_phone").map_err(decode)?,
        started_at_ms: row.try_get("started_at_ms").map_err(decode)?,
        ended_at_ms: row.try_get("ended_at_ms").map_err(decode)?,
        duration_secs: row.try_get("duration_secs").map_err(decode)?,
        cost_total: row.try_get("cost_total").map_err(decode)?,
        cost_breakdown,
        messages,
        status: status
            .parse::<ConversationStatus>()
            .map_err(PersistenceError::Decode)?,
        hangup_cause: row.try_get("hangup_cause").map_err(decode)?,
    })
}

fn decode(e: sqlx::Error) -> PersistenceError {
    PersistenceError::Decode(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_parse() {
        assert_eq!(
            ConversationFilter::parse("with_responses"),
            ConversationFilter::WithResponses
        );
        assert_eq!(
            ConversationFilter::parse("completed"),
            ConversationFilter::Completed
        );
        assert_eq!(ConversationFilter::parse("anything"), ConversationFilter::All);
    }

    #[test]
    fn test_duration_parse() {
        assert_eq!(DurationFilter::parse("0-15"), Some(DurationFilter::UpTo15));
        assert_eq!(DurationFilter::parse("60+"), Some(DurationFilter::Over60));
        assert_eq!(DurationFilter::parse("bogus"), None);
    }

    #[test]
    fn test_duration_bounds() {
        assert_eq!(DurationFilter::From16To30.bounds(), (16, 30));
        let (low, high) = DurationFilter::Over60.bounds();
        assert_eq!(low, 61);
        assert_eq!(high, i64::MAX);
    }
}
