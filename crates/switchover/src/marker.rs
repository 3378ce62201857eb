//! Queries of the shared cutover marker, which lives in the `switchover_state`
//! table of the old database:
//!
//! ```sql
//! create type enum_switchover_state as enum ('idle', 'in_progress', 'use_next_db');
//! create table switchover_state (
//!     ok            boolean primary key default true check (ok),
//!     current_state enum_switchover_state not null default 'idle',
//!     db_id         uuid not null default gen_random_uuid()
//! );
//! ```
//!
//! Connections take a shared advisory lock on [`GLOBAL_SWITCHOVER_LOCK`]
//! before reading the marker, and the final flip takes it exclusively, so no
//! connection can be established concurrently with the flip.
use super::GLOBAL_SWITCHOVER_LOCK;
use anyhow::Context;
use sqlx::PgConnection;
use std::time::Duration;

/// Which database the fleet should be using.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, strum::Display)]
#[sqlx(type_name = "enum_switchover_state", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CutoverMarker {
    /// No switchover is underway.
    Idle,
    /// A switchover is underway. Connections to the old database hold the
    /// shared lock for their lifetime.
    InProgress,
    /// The next database is authoritative.
    UseNextDb,
}

/// Read the cutover marker and the database's identity.
pub async fn read(conn: &mut PgConnection) -> anyhow::Result<(CutoverMarker, String)> {
    sqlx::query_as("select current_state, db_id::text from switchover_state")
        .fetch_one(conn)
        .await
        .context("reading switchover_state")
}

/// Read the identity of a database.
pub async fn db_id(conn: &mut PgConnection) -> anyhow::Result<String> {
    Ok(read(conn).await?.1)
}

/// Take the shared advisory lock, then read the marker.
pub async fn lock_shared(conn: &mut PgConnection) -> anyhow::Result<CutoverMarker> {
    sqlx::query("select pg_advisory_lock_shared($1)")
        .bind(GLOBAL_SWITCHOVER_LOCK)
        .execute(&mut *conn)
        .await
        .context("acquiring shared switchover lock")?;

    Ok(read(conn).await?.0)
}

pub async fn unlock_shared(conn: &mut PgConnection) -> anyhow::Result<()> {
    sqlx::query("select pg_advisory_unlock_shared($1)")
        .bind(GLOBAL_SWITCHOVER_LOCK)
        .execute(conn)
        .await
        .context("releasing shared switchover lock")?;
    Ok(())
}

/// Refuse to serve from a database which the fleet has already moved away from.
pub async fn ensure_not_stale(conn: &mut PgConnection) -> anyhow::Result<()> {
    let stale: Option<bool> = sqlx::query_scalar(
        "select true from switchover_state where current_state = 'use_next_db'",
    )
    .fetch_optional(conn)
    .await
    .context("checking for stale database")?;

    if stale.is_some() {
        anyhow::bail!(
            "refusing to connect to stale database (switchover_state table has use_next_db set)"
        );
    }
    Ok(())
}

/// Mark a switchover as in progress. Fails unless the marker is `idle`.
pub async fn enable(conn: &mut PgConnection) -> anyhow::Result<()> {
    transition(conn, CutoverMarker::Idle, CutoverMarker::InProgress).await
}

/// Cancel an in-progress switchover. Fails unless the marker is `in_progress`.
pub async fn disable(conn: &mut PgConnection) -> anyhow::Result<()> {
    transition(conn, CutoverMarker::InProgress, CutoverMarker::Idle).await
}

async fn transition(
    conn: &mut PgConnection,
    from: CutoverMarker,
    to: CutoverMarker,
) -> anyhow::Result<()> {
    let updated =
        sqlx::query("update switchover_state set current_state = $2 where current_state = $1")
            .bind(from)
            .bind(to)
            .execute(conn)
            .await
            .with_context(|| format!("updating switchover_state to {to}"))?
            .rows_affected();

    if updated != 1 {
        anyhow::bail!("switchover_state is not {from}");
    }
    Ok(())
}

/// Flip the marker to `use_next_db`, directing every new connection of the
/// fleet to the next database.
///
/// The exclusive lock waits for every connection holding the shared lock to
/// close, but for no longer than `lock_timeout`.
#[tracing::instrument(skip(conn))]
pub async fn flip_to_next(conn: &mut PgConnection, lock_timeout: Duration) -> anyhow::Result<()> {
    let lock_ms = lock_timeout.as_millis();
    if lock_ms == 0 {
        anyhow::bail!("not enough time remaining for lock");
    }

    sqlx::query(&format!("set lock_timeout = {lock_ms}"))
        .execute(&mut *conn)
        .await
        .context("setting lock_timeout")?;

    let result = flip_locked(conn).await;

    // Best-effort: the session is typically closed by the caller.
    if let Err(err) = sqlx::query("select pg_advisory_unlock_all()")
        .execute(&mut *conn)
        .await
    {
        tracing::warn!(?err, "failed to release switchover lock");
    }
    if let Err(err) = sqlx::query("set lock_timeout to default")
        .execute(&mut *conn)
        .await
    {
        tracing::warn!(?err, "failed to reset lock_timeout");
    }

    result
}

async fn flip_locked(conn: &mut PgConnection) -> anyhow::Result<()> {
    sqlx::query("select pg_advisory_lock($1)")
        .bind(GLOBAL_SWITCHOVER_LOCK)
        .execute(&mut *conn)
        .await
        .context("acquiring exclusive switchover lock")?;

    match read(&mut *conn).await?.0 {
        CutoverMarker::InProgress => (),
        CutoverMarker::Idle => anyhow::bail!("switchover is not enabled"),
        CutoverMarker::UseNextDb => anyhow::bail!("switchover already completed"),
    }
    transition(conn, CutoverMarker::InProgress, CutoverMarker::UseNextDb).await?;

    tracing::info!("cutover marker flipped: next database is now active");
    Ok(())
}
