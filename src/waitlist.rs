use chrono::{DateTime, Utc};
use rocket::serde::{Deserialize, Serialize};
use sqlx::{query, query_as, query_scalar, FromRow};
use std::collections::HashMap;
use crate::auth::{GymId, UserId};
use crate::db::is_unique_violation;
use crate::error::BookingError;
use crate::session::SessionId;

/// One waiting user. FIFO order is the AUTOINCREMENT `id`, a monotonic
/// sequence with a total order; `joined_at` is kept for display only since
/// wall clocks can collide within a millisecond.
#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
pub struct WaitlistRecord {
    pub id: i64,
    pub session_id: SessionId,
    pub user_id: UserId,
    pub gym_id: GymId,
    pub joined_at: DateTime<Utc>,
}

pub async fn enqueue<'e, E>(executor: E, session_id: SessionId, user_id: UserId, gym_id: GymId) -> Result<WaitlistRecord, BookingError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let entry: WaitlistRecord = query_as(
        "INSERT INTO waitlist(session_id, user_id, gym_id, joined_at) VALUES (?, ?, ?, ?) RETURNING *",
    )
    .bind(session_id)
    .bind(user_id)
    .bind(gym_id)
    .bind(Utc::now())
    .fetch_one(executor)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            BookingError::AlreadyWaitlisted
        } else {
            BookingError::Storage(e)
        }
    })?;
    Ok(entry)
}

pub async fn find_entry<'e, E>(executor: E, session_id: SessionId, user_id: UserId) -> Result<Option<WaitlistRecord>, BookingError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let entry: Option<WaitlistRecord> = query_as("SELECT * FROM waitlist WHERE session_id=? AND user_id=?")
        .bind(session_id)
        .bind(user_id)
        .fetch_optional(executor)
        .await?;
    Ok(entry)
}

/// Removes and returns the longest-waiting entry for the session.
/// Must run inside the caller's transaction so select and delete are one unit.
pub async fn dequeue_next(tx: &mut sqlx::SqliteConnection, session_id: SessionId) -> Result<Option<WaitlistRecord>, BookingError> {
    let next: Option<WaitlistRecord> = query_as("SELECT * FROM waitlist WHERE session_id=? ORDER BY id LIMIT 1")
        .bind(session_id)
        .fetch_optional(&mut *tx)
        .await?;
    let Some(entry) = next else {
        return Ok(None);
    };
    query("DELETE FROM waitlist WHERE id=?")
        .bind(entry.id)
        .execute(&mut *tx)
        .await?;
    Ok(Some(entry))
}

pub async fn remove_entry<'e, E>(executor: E, session_id: SessionId, user_id: UserId) -> Result<Option<WaitlistRecord>, BookingError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let removed: Option<WaitlistRecord> =
        query_as("DELETE FROM waitlist WHERE session_id=? AND user_id=? RETURNING *")
            .bind(session_id)
            .bind(user_id)
            .fetch_optional(executor)
            .await?;
    Ok(removed)
}

pub async fn count_for<'e, E>(executor: E, session_id: SessionId) -> Result<i64, BookingError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let count: i64 = query_scalar("SELECT COUNT(*) FROM waitlist WHERE session_id=?")
        .bind(session_id)
        .fetch_one(executor)
        .await?;
    Ok(count)
}

/// 1-based queue position of a user, by the monotonic FIFO key.
pub async fn position_of<'e, E>(executor: E, entry: &WaitlistRecord) -> Result<i64, BookingError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let ahead: i64 = query_scalar("SELECT COUNT(*) FROM waitlist WHERE session_id=? AND id < ?")
        .bind(entry.session_id)
        .bind(entry.id)
        .fetch_one(executor)
        .await?;
    Ok(ahead + 1)
}

pub async fn clear_for<'e, E>(executor: E, session_id: SessionId) -> Result<i64, BookingError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let result = query("DELETE FROM waitlist WHERE session_id=?")
        .bind(session_id)
        .execute(executor)
        .await?;
    Ok(result.rows_affected() as i64)
}

pub async fn user_ids_for<'e, E>(executor: E, session_id: SessionId) -> Result<Vec<UserId>, BookingError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let ids: Vec<UserId> = query_scalar("SELECT user_id FROM waitlist WHERE session_id=? ORDER BY id")
        .bind(session_id)
        .fetch_all(executor)
        .await?;
    Ok(ids)
}

pub async fn counts_for_gym(pool: &sqlx::SqlitePool, gym_id: GymId) -> Result<HashMap<SessionId, i64>, BookingError> {
    let rows: Vec<(SessionId, i64)> =
        query_as("SELECT session_id, COUNT(*) FROM waitlist WHERE gym_id=? GROUP BY session_id")
            .bind(gym_id)
            .fetch_all(pool)
            .await?;
    Ok(rows.into_iter().collect())
}
