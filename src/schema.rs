//! Idempotent bootstrap for the Postgres tables the durable backends need.
//!
//! Spec.md §1 scopes "SQL schema and archival jobs" out of the core as an
//! external collaborator's concern; this is the ambient bootstrap a real
//! deployment would otherwise run via a migration tool before starting the
//! service. Kept as one `CREATE ... IF NOT EXISTS` batch, gathered from the
//! schema documented in each store's own `postgres.rs` module doc comment,
//! so a fresh database is usable without a separate migration step.

use sqlx::PgPool;

use crate::error::PstppError;

const STATEMENTS: &[&str] = &[
    "CREATE SEQUENCE IF NOT EXISTS cache_lock_fencing_seq",
    r#"CREATE TABLE IF NOT EXISTS cache_lock (
        key           TEXT PRIMARY KEY,
        value         TEXT NOT NULL,
        fencing_value BIGINT NOT NULL,
        expires_at    TIMESTAMPTZ NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS idempotency_record (
        idempotency_key TEXT PRIMARY KEY,
        trade_id        TEXT NOT NULL,
        partition_key   TEXT NOT NULL,
        status          TEXT NOT NULL,
        blotter_ref     TEXT,
        created_at      TIMESTAMPTZ NOT NULL,
        completed_at    TIMESTAMPTZ,
        expires_at      TIMESTAMPTZ NOT NULL,
        archive_flag    BOOLEAN NOT NULL DEFAULT FALSE
    )"#,
    r#"CREATE UNIQUE INDEX IF NOT EXISTS idempotency_record_live_key
        ON idempotency_record (idempotency_key) WHERE NOT archive_flag"#,
    r#"CREATE TABLE IF NOT EXISTS job (
        job_id        TEXT PRIMARY KEY,
        trade_id      TEXT,
        source        TEXT,
        status        TEXT NOT NULL,
        progress      SMALLINT NOT NULL DEFAULT 0,
        message       TEXT,
        result        JSONB,
        error_code    TEXT,
        error_message TEXT,
        callback_url  TEXT,
        created_at    TIMESTAMPTZ NOT NULL,
        updated_at    TIMESTAMPTZ NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS partition_state (
        partition_key        TEXT PRIMARY KEY,
        state_id             SMALLINT NOT NULL,
        last_sequence_number BIGINT,
        version              BIGINT NOT NULL DEFAULT 0,
        created_at           TIMESTAMPTZ NOT NULL,
        updated_at           TIMESTAMPTZ NOT NULL,
        archive_flag         BOOLEAN NOT NULL DEFAULT FALSE
    )"#,
    r#"CREATE TABLE IF NOT EXISTS swap_blotter (
        trade_id          TEXT PRIMARY KEY,
        partition_key     TEXT NOT NULL,
        idempotency_key   TEXT NOT NULL,
        source            TEXT NOT NULL,
        payload           JSONB NOT NULL,
        enrichment_status TEXT NOT NULL,
        metadata          JSONB NOT NULL,
        version           BIGINT NOT NULL DEFAULT 0,
        archive_flag      BOOLEAN NOT NULL DEFAULT FALSE,
        created_at        TIMESTAMPTZ NOT NULL,
        updated_at        TIMESTAMPTZ NOT NULL
    )"#,
];

pub async fn ensure_schema(pool: &PgPool) -> Result<(), PstppError> {
    for statement in STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
