//! Lead store
//!
//! Leads are created by the CSV ingest (out of scope) and mutated here on
//! dial attempts and terminal call events. Lead status updates are
//! best-effort: a database fault never takes down an in-flight call.

use chrono::Utc;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use outdial_core::{AnswerType, Lead, LeadStatus};

use crate::error::PersistenceError;

/// SQL projection shared by every lead query
const LEAD_COLUMNS: &str = "id, first_name, last_name, phone, email, address, status, \
                            answer_type, call_attempts, last_call_at, from_number";

#[derive(Clone)]
pub struct LeadStore {
    pool: PgPool,
}

impl LeadStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_lead(row: &sqlx::postgres::PgRow) -> Result<Lead, PersistenceError> {
        let status: String = row.try_get("status").map_err(decode)?;
        let answer_type: Option<String> = row.try_get("answer_type").map_err(decode)?;
        Ok(Lead {
            id: row.try_get("id").map_err(decode)?,
            first_name: row.try_get("first_name").map_err(decode)?,
            last_name: row.try_get("last_name").map_err(decode)?,
            phone: row.try_get("phone").map_err(decode)?,
            email: row.try_get("email").map_err(decode)?,
            address: row.try_get("address").map_err(decode)?,
            status: status
                .parse::<LeadStatus>()
                .map_err(PersistenceError::Decode)?,
            answer_type: answer_type
                .map(|a| a.parse::<AnswerType>())
                .transpose()
                .map_err(PersistenceError::Decode)?,
            call_attempts: row.try_get("call_attempts").map_err(decode)?,
            last_call_at: row.try_get("last_call_at").map_err(decode)?,
            from_number: row.try_get("from_number").map_err(decode)?,
        })
    }

    /// Insert or update a lead, keyed on phone when present.
    pub async fn upsert(&self, lead: &Lead) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
            INSERT INTO leads (id, first_name, last_name, phone, email, address,
                               status, answer_type, call_attempts, last_call_at, from_number)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO UPDATE SET
                first_name = EXCLUDED.first_name,
                last_name = EXCLUDED.last_name,
                phone = EXCLUDED.phone,
                email = EXCLUDED.email,
                address = EXCLUDED.address,
                status = EXCLUDED.status,
                answer_type = EXCLUDED.answer_type,
                call_attempts = EXCLUDED.call_attempts,
                last_call_at = EXCLUDED.last_call_at,
                from_number = EXCLUDED.from_number
            "#,
        )
        .bind(lead.id)
        .bind(&lead.first_name)
        .bind(&lead.last_name)
        .bind(&lead.phone)
        .bind(&lead.email)
        .bind(&lead.address)
        .bind(lead.status.as_str())
        .bind(lead.answer_type.map(|a| a.as_str()))
        .bind(lead.call_attempts)
        .bind(lead.last_call_at)
        .bind(&lead.from_number)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Lead>, PersistenceError> {
        let row = sqlx::query(&format!("SELECT {} FROM leads WHERE id = $1", LEAD_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_lead).transpose()
    }

    /// Match a lead by phone using digits-only comparison
    pub async fn find_by_phone(&self, phone: &str) -> Result<Option<Lead>, PersistenceError> {
        let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();
        let row = sqlx::query(&format!(
            "SELECT {} FROM leads WHERE regexp_replace(coalesce(phone, ''), '[^0-9]', '', 'g') = $1",
            LEAD_COLUMNS
        ))
        .bind(digits)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_lead).transpose()
    }

    /// Leads eligible for dialling; pass ids to restrict the batch.
    pub async fn dialable(&self, ids: Option<&[Uuid]>) -> Result<Vec<Lead>, PersistenceError> {
        let rows = match ids {
            Some(ids) => {
                sqlx::query(&format!(
                    "SELECT {} FROM leads WHERE id = ANY($1) AND phone IS NOT NULL",
                    LEAD_COLUMNS
                ))
                .bind(ids)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {} FROM leads WHERE status = 'pending' AND phone IS NOT NULL \
                     ORDER BY created_at",
                    LEAD_COLUMNS
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(Self::row_to_lead).collect()
    }

    /// Case-insensitive search over name, phone and email, paginated.
    pub async fn search(
        &self,
        query: &str,
        page: i64,
        limit: i64,
    ) -> Result<(Vec<Lead>, i64), PersistenceError> {
        let pattern = format!("%{}%", query);
        let offset = (page.max(1) - 1) * limit;

        let total: i64 = sqlx::query(
            "SELECT count(*) AS total FROM leads WHERE first_name ILIKE $1 \
             OR last_name ILIKE $1 OR coalesce(phone,'') ILIKE $1 OR coalesce(email,'') ILIKE $1",
        )
        .bind(&pattern)
        .fetch_one(&self.pool)
        .await?
        .try_get("total")
        .map_err(decode)?;

        let rows = sqlx::query(&format!(
            "SELECT {} FROM leads WHERE first_name ILIKE $1 OR last_name ILIKE $1 \
             OR coalesce(phone,'') ILIKE $1 OR coalesce(email,'') ILIKE $1 \
             ORDER BY created_at DESC LIMIT $2 OFFSET $3",
            LEAD_COLUMNS
        ))
        .bind(&pattern)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok((
            rows.iter()
                .map(Self::row_to_lead)
                .collect::<Result<Vec<_>, _>>()?,
            total,
        ))
    }

    /// Mark a lead as called after the carrier confirmed origination.
    ///
    /// Increments `call_attempts` and stamps `last_call_at`; never called
    /// when origination was refused.
    pub async fn mark_called(&self, id: Uuid, from_number: &str) -> Result<(), PersistenceError> {
        sqlx::query(
            "UPDATE leads SET status = 'called', call_attempts = call_attempts + 1, \
             last_call_at = $2, from_number = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(Utc::now())
        .bind(from_number)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record the terminal outcome for a lead
    pub async fn set_outcome(
        &self,
        id: Uuid,
        status: LeadStatus,
        answer_type: Option<AnswerType>,
    ) -> Result<(), PersistenceError> {
        sqlx::query("UPDATE leads SET status = $2, answer_type = coalesce($3, answer_type) WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .bind(answer_type.map(|a| a.as_str()))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn decode(e: sqlx::Error) -> PersistenceError {
    PersistenceError::Decode(e.to_string())
}
