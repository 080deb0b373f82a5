use chrono::{DateTime, Utc};
use log::info;
use rocket::response::status::Custom;
use rocket::serde::json::Json;
use rocket::serde::{Deserialize, Serialize};
use rocket::{Build, Rocket, State};
use sqlx::{query, query_as, FromRow};
use std::collections::HashMap;
use crate::auth::{load_identity, BearerToken, GymId, IdentityClaim, UserId};
use crate::db::DbPool;
use crate::error::{status_booking_error, BookingError};
use crate::waitlist;

pub type SessionId = i64;

#[derive(Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq, Debug)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Scheduled,
    Canceled,
    Completed,
}

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
pub struct SessionRecord {
    pub id: SessionId,
    pub gym_id: GymId,
    pub trainer_id: UserId,
    pub title: String,
    pub description: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub capacity: i64,
    pub status: SessionStatus,
    pub booked_count: i64,
    pub checked_in_count: i64,
    pub cancel_reason: Option<String>,
    pub canceled_at: Option<DateTime<Utc>>,
}

/// `booked_count` / `checked_in_count` are cached values. They must only ever
/// move through this relative update, never through a read-modify-write of a
/// separately fetched record.
#[derive(Clone, Copy, Debug)]
pub enum CounterField {
    Booked,
    CheckedIn,
}
impl CounterField {
    fn column(self) -> &'static str {
        match self {
            CounterField::Booked => "booked_count",
            CounterField::CheckedIn => "checked_in_count",
        }
    }
}

pub fn validate_time_window(start_time: DateTime<Utc>, end_time: DateTime<Utc>) -> Result<(), BookingError> {
    if end_time <= start_time {
        return Err(BookingError::InvalidInput("end_time must be after start_time".to_string()));
    }
    Ok(())
}

fn validate_capacity(capacity: i64) -> Result<(), BookingError> {
    if capacity < 1 {
        return Err(BookingError::InvalidInput("capacity must be at least 1".to_string()));
    }
    Ok(())
}

/// Trainers can manage only their own sessions, admins any session in their
/// gym. Sessions of a foreign tenant are reported as absent, not forbidden.
pub fn authorize_manage(session: &SessionRecord, who: &IdentityClaim) -> Result<(), BookingError> {
    if who.is_admin() {
        if session.gym_id != who.gym_id {
            return Err(BookingError::NotFound);
        }
        return Ok(());
    }
    if who.is_trainer() {
        if session.trainer_id == who.user_id {
            return Ok(());
        }
        return Err(BookingError::Forbidden("not your class".to_string()));
    }
    Err(BookingError::Forbidden("trainer or admin role required".to_string()))
}

pub async fn load_session<'e, E>(executor: E, session_id: SessionId) -> Result<SessionRecord, BookingError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let session: Option<SessionRecord> = query_as("SELECT * FROM sessions WHERE id=?")
        .bind(session_id)
        .fetch_optional(executor)
        .await?;
    session.ok_or(BookingError::NotFound)
}

pub async fn create_session(pool: &sqlx::SqlitePool, session: &SessionRecord) -> Result<SessionRecord, BookingError> {
    validate_time_window(session.start_time, session.end_time)?;
    validate_capacity(session.capacity)?;
    let created: SessionRecord = query_as(
        "INSERT INTO sessions(gym_id, trainer_id, title, description, start_time, end_time, capacity, status) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING *",
    )
    .bind(session.gym_id)
    .bind(session.trainer_id)
    .bind(&session.title)
    .bind(&session.description)
    .bind(session.start_time)
    .bind(session.end_time)
    .bind(session.capacity)
    .bind(session.status)
    .fetch_one(pool)
    .await?;
    info!("Class session created, id: {}", created.id);
    Ok(created)
}

#[derive(Deserialize, Default, Clone, Debug)]
pub struct SessionPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub capacity: Option<i64>,
    pub trainer_id: Option<UserId>, // admin only
}

/// Applies a partial edit. The effective time window after the patch must
/// still be ordered, a partial time update cannot sneak past validation.
pub async fn update_session(
    pool: &sqlx::SqlitePool,
    session_id: SessionId,
    patch: &SessionPatch,
    who: &IdentityClaim,
) -> Result<SessionRecord, BookingError> {
    let session = load_session(pool, session_id).await?;
    authorize_manage(&session, who)?;

    let start_time = patch.start_time.unwrap_or(session.start_time);
    let end_time = patch.end_time.unwrap_or(session.end_time);
    validate_time_window(start_time, end_time)?;
    let capacity = patch.capacity.unwrap_or(session.capacity);
    validate_capacity(capacity)?;

    let title = patch.title.clone().unwrap_or(session.title);
    if title.trim().is_empty() {
        return Err(BookingError::InvalidInput("title is required".to_string()));
    }
    let description = patch.description.clone().unwrap_or(session.description);
    let trainer_id = if who.is_admin() {
        patch.trainer_id.unwrap_or(session.trainer_id)
    } else {
        // trainers cannot reassign ownership
        session.trainer_id
    };

    let updated: SessionRecord = query_as(
        "UPDATE sessions SET title=?, description=?, start_time=?, end_time=?, capacity=?, trainer_id=? \
         WHERE id=? RETURNING *",
    )
    .bind(&title)
    .bind(&description)
    .bind(start_time)
    .bind(end_time)
    .bind(capacity)
    .bind(trainer_id)
    .bind(session_id)
    .fetch_one(pool)
    .await?;
    Ok(updated)
}

pub async fn increment_counter<'e, E>(executor: E, session_id: SessionId, field: CounterField, delta: i64) -> Result<(), BookingError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let col = field.column();
    query(&format!("UPDATE sessions SET {col} = {col} + ? WHERE id=?"))
        .bind(delta)
        .bind(session_id)
        .execute(executor)
        .await?;
    Ok(())
}

/// Conditional seat claim: increments `booked_count` only while a seat is
/// free, in one atomic statement. Returns false when the session is full.
pub async fn try_claim_seat<'e, E>(executor: E, session_id: SessionId) -> Result<bool, BookingError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let result = query("UPDATE sessions SET booked_count = booked_count + 1 WHERE id=? AND booked_count < capacity")
        .bind(session_id)
        .execute(executor)
        .await?;
    Ok(result.rows_affected() == 1)
}

/* -------------------- routes -------------------- */

#[derive(Deserialize, Clone, Debug)]
pub struct PostedSession {
    pub title: String,
    pub description: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub capacity: i64,
    pub trainer_id: Option<UserId>, // only respected for admin
}

#[post("/api/classes/session", data = "<posted>")]
async fn post_create_session(token: BearerToken, posted: Json<PostedSession>, db: &State<DbPool>) -> Result<Json<SessionRecord>, Custom<String>> {
    let who = load_identity(&token, db).await?;
    if !(who.is_admin() || who.is_trainer()) {
        return Err(status_booking_error(BookingError::Forbidden("trainer or admin role required".to_string())));
    }
    if posted.title.trim().is_empty() {
        return Err(status_booking_error(BookingError::InvalidInput("title is required".to_string())));
    }
    let trainer_id = if who.is_admin() {
        posted.trainer_id.unwrap_or(who.user_id)
    } else {
        who.user_id
    };
    let session = SessionRecord {
        id: 0,
        gym_id: who.gym_id,
        trainer_id,
        title: posted.title.clone(),
        description: posted.description.clone().unwrap_or_default(),
        start_time: posted.start_time,
        end_time: posted.end_time,
        capacity: posted.capacity,
        status: SessionStatus::Scheduled,
        booked_count: 0,
        checked_in_count: 0,
        cancel_reason: None,
        canceled_at: None,
    };
    let created = create_session(&db.0, &session).await.map_err(status_booking_error)?;
    Ok(Json(created))
}

#[put("/api/classes/<session_id>", data = "<patch>")]
async fn put_update_session(session_id: SessionId, token: BearerToken, patch: Json<SessionPatch>, db: &State<DbPool>) -> Result<Json<SessionRecord>, Custom<String>> {
    let who = load_identity(&token, db).await?;
    let updated = update_session(&db.0, session_id, &patch, &who).await.map_err(status_booking_error)?;
    Ok(Json(updated))
}

#[derive(Serialize, Deserialize, Debug)]
pub struct SessionWithWaitlist {
    #[serde(flatten)]
    pub session: SessionRecord,
    pub waitlist_count: i64,
}

#[get("/api/classes")]
async fn get_classes(token: BearerToken, db: &State<DbPool>) -> Result<Json<Vec<SessionWithWaitlist>>, Custom<String>> {
    let who = load_identity(&token, db).await?;
    // always scoped to the caller's own gym
    let gym_id = who.gym_id;
    let sessions: Vec<SessionRecord> = query_as("SELECT * FROM sessions WHERE gym_id=? ORDER BY start_time")
        .bind(gym_id)
        .fetch_all(&db.0)
        .await
        .map_err(crate::util::status_sqlx_error)?;
    let counts: HashMap<SessionId, i64> = waitlist::counts_for_gym(&db.0, gym_id)
        .await
        .map_err(status_booking_error)?;
    let listed = sessions
        .into_iter()
        .map(|session| {
            let waitlist_count = counts.get(&session.id).copied().unwrap_or(0);
            SessionWithWaitlist { session, waitlist_count }
        })
        .collect::<Vec<_>>();
    Ok(Json(listed))
}

#[get("/api/classes/<session_id>", rank = 2)]
async fn get_class(session_id: SessionId, token: BearerToken, db: &State<DbPool>) -> Result<Json<SessionWithWaitlist>, Custom<String>> {
    let who = load_identity(&token, db).await?;
    let session = load_session(&db.0, session_id).await.map_err(status_booking_error)?;
    if session.gym_id != who.gym_id {
        return Err(status_booking_error(BookingError::NotFound));
    }
    let waitlist_count = waitlist::count_for(&db.0, session_id).await.map_err(status_booking_error)?;
    Ok(Json(SessionWithWaitlist { session, waitlist_count }))
}

#[get("/api/classes/mine")]
async fn get_my_classes(token: BearerToken, db: &State<DbPool>) -> Result<Json<Vec<SessionRecord>>, Custom<String>> {
    let who = load_identity(&token, db).await?;
    let sessions: Vec<SessionRecord> = query_as(
        "SELECT s.* FROM sessions s JOIN bookings b ON b.session_id = s.id \
         WHERE b.user_id=? AND b.status != 'canceled' ORDER BY s.start_time",
    )
    .bind(who.user_id)
    .fetch_all(&db.0)
    .await
    .map_err(crate::util::status_sqlx_error)?;
    Ok(Json(sessions))
}

#[get("/api/classes/trainer/mine?<trainer_id>")]
async fn get_trainer_classes(trainer_id: Option<UserId>, token: BearerToken, db: &State<DbPool>) -> Result<Json<Vec<SessionRecord>>, Custom<String>> {
    let who = load_identity(&token, db).await?;
    let trainer_id = if who.is_admin() {
        trainer_id.unwrap_or(who.user_id)
    } else if who.is_trainer() {
        who.user_id
    } else {
        return Err(status_booking_error(BookingError::Forbidden("trainer or admin role required".to_string())));
    };
    let sessions: Vec<SessionRecord> = query_as("SELECT * FROM sessions WHERE trainer_id=? ORDER BY start_time")
        .bind(trainer_id)
        .fetch_all(&db.0)
        .await
        .map_err(crate::util::status_sqlx_error)?;
    Ok(Json(sessions))
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            post_create_session,
            put_update_session,
            get_classes,
            get_class,
            get_my_classes,
            get_trainer_classes,
        ])
}
