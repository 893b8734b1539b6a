//! The effect ledger: a durable, keyed deduplication store backed by
//! PostgreSQL. `claim` is the sole synchronization primitive the rest of the
//! system relies on for exactly-once side effects (see `sidefx-worker`).

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;
use sqlx::Row;
use sqlx::{postgres::PgPoolOptions, PgPool};

pub const ENV_DATABASE_URL: &str = "SIDEFX_DATABASE_URL";

/// Connect to Postgres using `SIDEFX_DATABASE_URL` and run embedded migrations.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DATABASE_URL)
        .with_context(|| format!("missing env var {ENV_DATABASE_URL}"))?;
    connect(&url).await
}

pub async fn connect(url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(url)
        .await
        .context("failed to connect to Postgres")?;
    Ok(pool)
}

/// Run the embedded `sqlx` migrations against `pool`. Idempotent: safe to
/// call on every process start.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("ledger migrate failed")?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectStatus {
    InProgress,
    Done,
    Failed,
}

impl EffectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EffectStatus::InProgress => "in_progress",
            EffectStatus::Done => "done",
            EffectStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "in_progress" => Ok(EffectStatus::InProgress),
            "done" => Ok(EffectStatus::Done),
            "failed" => Ok(EffectStatus::Failed),
            other => anyhow::bail!("invalid effect status: {other}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EffectRecord {
    pub effect_id: String,
    pub run_id: String,
    pub step_id: String,
    pub business_key: String,
    pub status: EffectStatus,
    pub artifact_ref: Option<String>,
    pub created_ms: i64,
    pub updated_ms: i64,
    pub payload_snapshot: Value,
}

fn row_to_record(row: sqlx::postgres::PgRow) -> Result<EffectRecord> {
    Ok(EffectRecord {
        effect_id: row.try_get("effect_id")?,
        run_id: row.try_get("run_id")?,
        step_id: row.try_get("step_id")?,
        business_key: row.try_get("business_key")?,
        status: EffectStatus::parse(&row.try_get::<String, _>("status")?)?,
        artifact_ref: row.try_get("artifact_ref")?,
        created_ms: row.try_get("created_ms")?,
        updated_ms: row.try_get("updated_ms")?,
        payload_snapshot: row.try_get("payload_snapshot")?,
    })
}

/// Look up the current status of an effect. Returns `None` if no attempt has
/// ever claimed this `effect_id`.
pub async fn get_status(pool: &PgPool, effect_id: &str) -> Result<Option<EffectRecord>> {
    let row = sqlx::query(
        r#"
        select effect_id, run_id, step_id, business_key, status, artifact_ref,
               created_ms, updated_ms, payload_snapshot
        from effect_records
        where effect_id = $1
        "#,
    )
    .bind(effect_id)
    .fetch_optional(pool)
    .await
    .context("get_status failed")?;

    match row {
        Some(r) => Ok(Some(row_to_record(r)?)),
        None => Ok(None),
    }
}

/// Atomically claim the right to perform the side effect for `effect_id`.
///
/// Returns `true` if this call inserted the row (the caller is the winner and
/// must perform the effect); `false` if a row already existed (the caller
/// must not act — see the heal/skip paths in `sidefx-worker`).
///
/// Implemented as `INSERT ... ON CONFLICT DO NOTHING RETURNING`, the same
/// idiom as an outbox/inbox dedup insert: the "did I win?" test is atomic
/// with the state mutation, so no separate lock is required.
pub async fn claim(
    pool: &PgPool,
    effect_id: &str,
    run_id: &str,
    step_id: &str,
    business_key: &str,
    payload_snapshot: &Value,
) -> Result<bool> {
    let now_ms = Utc::now().timestamp_millis();

    let row: Option<(String,)> = sqlx::query_as(
        r#"
        insert into effect_records
            (effect_id, run_id, step_id, business_key, status, artifact_ref, created_ms, updated_ms, payload_snapshot)
        values
            ($1, $2, $3, $4, 'in_progress', null, $5, $5, $6)
        on conflict (effect_id) do nothing
        returning effect_id
        "#,
    )
    .bind(effect_id)
    .bind(run_id)
    .bind(step_id)
    .bind(business_key)
    .bind(now_ms)
    .bind(payload_snapshot)
    .fetch_optional(pool)
    .await
    .context("claim failed")?;

    Ok(row.is_some())
}

/// Unconditionally mark an effect `done`, recording the artifact reference
/// that proves the side effect occurred.
pub async fn mark_done(pool: &PgPool, effect_id: &str, artifact_ref: &str) -> Result<()> {
    let now_ms = Utc::now().timestamp_millis();
    sqlx::query(
        r#"
        update effect_records
        set status = 'done', artifact_ref = $2, updated_ms = $3
        where effect_id = $1
        "#,
    )
    .bind(effect_id)
    .bind(artifact_ref)
    .bind(now_ms)
    .execute(pool)
    .await
    .context("mark_done failed")?;
    Ok(())
}

/// Unconditionally mark an effect `failed`. `reason` is not persisted as a
/// column today; it exists for caller-side logging symmetry with `mark_done`.
pub async fn mark_failed(pool: &PgPool, effect_id: &str, _reason: &str) -> Result<()> {
    let now_ms = Utc::now().timestamp_millis();
    sqlx::query(
        r#"
        update effect_records
        set status = 'failed', updated_ms = $2
        where effect_id = $1
        "#,
    )
    .bind(effect_id)
    .bind(now_ms)
    .execute(pool)
    .await
    .context("mark_failed failed")?;
    Ok(())
}

#[derive(Debug, Clone, Copy)]
pub struct LedgerStatus {
    pub ok: bool,
    pub has_effect_records_table: bool,
}

/// Connectivity + schema-presence check used by `sidefx-cli db status`.
pub async fn status(pool: &PgPool) -> Result<LedgerStatus> {
    let (one,): (i32,) = sqlx::query_as::<_, (i32,)>("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;

    let (exists,): (bool,) = sqlx::query_as::<_, (bool,)>(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema = 'public' and table_name = 'effect_records'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(LedgerStatus {
        ok: one == 1,
        has_effect_records_table: exists,
    })
}

/// Debug readout: most recently updated effect records, newest first.
pub async fn list_effects(pool: &PgPool, limit: i64) -> Result<Vec<EffectRecord>> {
    let rows = sqlx::query(
        r#"
        select effect_id, run_id, step_id, business_key, status, artifact_ref,
               created_ms, updated_ms, payload_snapshot
        from effect_records
        order by updated_ms desc
        limit $1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("list_effects failed")?;

    rows.into_iter().map(row_to_record).collect()
}
