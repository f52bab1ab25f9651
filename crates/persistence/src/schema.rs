//! Schema bootstrap

use sqlx::PgPool;

use crate::error::PersistenceError;

/// Create all required tables
pub async fn create_tables(pool: &PgPool) -> Result<(), PersistenceError> {
    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS leads (
            id UUID PRIMARY KEY,
            first_name TEXT NOT NULL DEFAULT '',
            last_name TEXT NOT NULL DEFAULT '',
            phone TEXT UNIQUE,
            email TEXT,
            address TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            answer_type TEXT,
            call_attempts INT NOT NULL DEFAULT 0,
            last_call_at TIMESTAMPTZ,
            from_number TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS carrier_calls (
            call_id TEXT PRIMARY KEY,
            lead_id UUID NOT NULL,
            from_number TEXT NOT NULL,
            to_number TEXT NOT NULL,
            initiated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            webhook_received BOOLEAN NOT NULL DEFAULT FALSE,
            status TEXT NOT NULL DEFAULT 'initiated'
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS conversations (
            call_id TEXT PRIMARY KEY,
            from_did TEXT NOT NULL,
            to_phone TEXT NOT NULL,
            started_at_ms BIGINT NOT NULL,
            ended_at_ms BIGINT,
            duration_secs BIGINT NOT NULL DEFAULT 0,
            cost_total DOUBLE PRECISION NOT NULL DEFAULT 0,
            cost_breakdown_json TEXT,
            messages_json TEXT NOT NULL DEFAULT '[]',
            status TEXT NOT NULL DEFAULT 'active',
            hangup_cause TEXT
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS call_costs (
            call_id TEXT PRIMARY KEY,
            total DOUBLE PRECISION NOT NULL DEFAULT 0,
            breakdown_json TEXT NOT NULL DEFAULT '{}',
            llm_calls BIGINT NOT NULL DEFAULT 0,
            transferred BOOLEAN NOT NULL DEFAULT FALSE,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS transferred_calls (
            call_id TEXT PRIMARY KEY,
            lead_id UUID NOT NULL,
            lead_name TEXT NOT NULL DEFAULT '',
            lead_phone TEXT NOT NULL DEFAULT '',
            from_did TEXT NOT NULL DEFAULT '',
            to_agent_number TEXT NOT NULL DEFAULT '',
            transferred_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
        r#"
        CREATE INDEX IF NOT EXISTS idx_leads_status ON leads (status)
        "#,
        r#"
        CREATE INDEX IF NOT EXISTS idx_conversations_status ON conversations (status)
        "#,
    ];

    for statement in statements {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| PersistenceError::Schema(e.to_string()))?;
    }

    Ok(())
}
