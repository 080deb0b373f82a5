use chrono::{DateTime, Utc};
use rocket::serde::{Deserialize, Serialize};
use sqlx::{query, query_as, query_scalar, FromRow};
use crate::auth::{GymId, UserId};
use crate::db::is_unique_violation;
use crate::error::BookingError;
use crate::session::SessionId;

#[derive(Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq, Debug)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Booked,
    CheckedIn,
    Canceled,
    NoShow,
}

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
pub struct BookingRecord {
    pub id: i64,
    pub session_id: SessionId,
    pub user_id: UserId,
    pub gym_id: GymId,
    pub status: BookingStatus,
    pub booked_at: DateTime<Utc>,
    pub check_in_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
}

/// Inserts one `booked` row for the pair. The unique `(session_id, user_id)`
/// index makes a concurrent duplicate insert fail here instead of slipping
/// through a check-then-insert window.
pub async fn create_booking<'e, E>(executor: E, session_id: SessionId, user_id: UserId, gym_id: GymId) -> Result<BookingRecord, BookingError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let booking: BookingRecord = query_as(
        "INSERT INTO bookings(session_id, user_id, gym_id, status, booked_at) \
         VALUES (?, ?, ?, 'booked', ?) RETURNING *",
    )
    .bind(session_id)
    .bind(user_id)
    .bind(gym_id)
    .bind(Utc::now())
    .fetch_one(executor)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            BookingError::AlreadyBooked
        } else {
            BookingError::Storage(e)
        }
    })?;
    Ok(booking)
}

pub async fn find_booking<'e, E>(executor: E, session_id: SessionId, user_id: UserId) -> Result<Option<BookingRecord>, BookingError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let booking: Option<BookingRecord> =
        query_as("SELECT * FROM bookings WHERE session_id=? AND user_id=? AND status != 'canceled'")
            .bind(session_id)
            .bind(user_id)
            .fetch_optional(executor)
            .await?;
    Ok(booking)
}

pub async fn count_active<'e, E>(executor: E, session_id: SessionId) -> Result<i64, BookingError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let count: i64 = query_scalar("SELECT COUNT(*) FROM bookings WHERE session_id=? AND status != 'canceled'")
        .bind(session_id)
        .fetch_one(executor)
        .await?;
    Ok(count)
}

pub async fn remove_booking<'e, E>(executor: E, session_id: SessionId, user_id: UserId) -> Result<Option<BookingRecord>, BookingError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let removed: Option<BookingRecord> =
        query_as("DELETE FROM bookings WHERE session_id=? AND user_id=? RETURNING *")
            .bind(session_id)
            .bind(user_id)
            .fetch_optional(executor)
            .await?;
    Ok(removed)
}

pub async fn user_ids_for_session<'e, E>(executor: E, session_id: SessionId) -> Result<Vec<UserId>, BookingError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let ids: Vec<UserId> = query_scalar("SELECT user_id FROM bookings WHERE session_id=? AND status != 'canceled'")
        .bind(session_id)
        .fetch_all(executor)
        .await?;
    Ok(ids)
}

/// Flips a `booked` row to `checked_in`. Returns false when no such row was
/// in the `booked` state (already checked in, or absent).
pub async fn mark_checked_in<'e, E>(executor: E, session_id: SessionId, user_id: UserId) -> Result<bool, BookingError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let result = query("UPDATE bookings SET status='checked_in', check_in_at=? WHERE session_id=? AND user_id=? AND status='booked'")
        .bind(Utc::now())
        .bind(session_id)
        .bind(user_id)
        .execute(executor)
        .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn delete_for_session<'e, E>(executor: E, session_id: SessionId) -> Result<(), BookingError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    query("DELETE FROM bookings WHERE session_id=?")
        .bind(session_id)
        .execute(executor)
        .await?;
    Ok(())
}
