use chrono::Utc;
use itertools::Itertools;
use log::info;
use rocket::response::status::Custom;
use rocket::serde::json::Json;
use rocket::serde::{Deserialize, Serialize};
use rocket::{Build, Rocket, State};
use sqlx::{query_as, SqlitePool};
use crate::auth::{load_identity, BearerToken, IdentityClaim, UserId};
use crate::booking;
use crate::db::DbPool;
use crate::error::{status_booking_error, BookingError};
use crate::notify::{queue_notification, NotifyEvent};
use crate::session::{self, authorize_manage, load_session, CounterField, SessionId, SessionRecord, SessionStatus};
use crate::waitlist;

/// State machine per (session, user): NONE->BOOKED, NONE->WAITLISTED,
/// BOOKED->NONE, WAITLISTED->NONE and WAITLISTED->BOOKED (promotion) are the
/// only legal transitions. Re-entering a state is reported as
/// AlreadyBooked / AlreadyWaitlisted and changes nothing.

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum JoinOutcome {
    Booked,
    Waitlisted { position: i64 },
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LeaveOutcome {
    BookingRemoved { promoted_user: Option<UserId> },
    RemovedFromWaitlist,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct CancelOutcome {
    pub already_canceled: bool,
    pub notified_users: i64,
}

pub async fn join_class(pool: &SqlitePool, session_id: SessionId, who: &IdentityClaim) -> Result<JoinOutcome, BookingError> {
    let mut tx = pool.begin().await?;
    let session = load_session(&mut *tx, session_id).await?;
    if session.gym_id != who.gym_id {
        // tenants never see each other's sessions
        return Err(BookingError::NotFound);
    }
    if session.status == SessionStatus::Canceled {
        return Err(BookingError::SessionCanceled);
    }
    if Utc::now() > session.end_time {
        return Err(BookingError::SessionEnded);
    }
    if booking::find_booking(&mut *tx, session_id, who.user_id).await?.is_some() {
        return Err(BookingError::AlreadyBooked);
    }
    if waitlist::find_entry(&mut *tx, session_id, who.user_id).await?.is_some() {
        return Err(BookingError::AlreadyWaitlisted);
    }

    // The seat claim and the booking insert commit as one unit. Two joins
    // racing for the last seat cannot both pass: the claim is a single
    // conditional write, and the unique (session_id, user_id) indexes
    // backstop duplicate-pair races.
    if session::try_claim_seat(&mut *tx, session_id).await? {
        booking::create_booking(&mut *tx, session_id, who.user_id, session.gym_id).await?;
        tx.commit().await?;
        info!("User {} booked class {}", who.user_id, session_id);
        Ok(JoinOutcome::Booked)
    } else {
        let entry = waitlist::enqueue(&mut *tx, session_id, who.user_id, session.gym_id).await?;
        let position = waitlist::position_of(&mut *tx, &entry).await?;
        tx.commit().await?;
        info!("User {} waitlisted for class {} at position {}", who.user_id, session_id, position);
        Ok(JoinOutcome::Waitlisted { position })
    }
}

pub async fn leave_class(pool: &SqlitePool, session_id: SessionId, who: &IdentityClaim) -> Result<LeaveOutcome, BookingError> {
    let mut tx = pool.begin().await?;

    if let Some(removed) = booking::remove_booking(&mut *tx, session_id, who.user_id).await? {
        session::increment_counter(&mut *tx, session_id, CounterField::Booked, -1).await?;
        if removed.status == crate::booking::BookingStatus::CheckedIn {
            session::increment_counter(&mut *tx, session_id, CounterField::CheckedIn, -1).await?;
        }

        // strict FIFO backfill: one slot freed, at most one promotion
        let mut promoted_user = None;
        let session = load_session(&mut *tx, session_id).await?;
        if booking::count_active(&mut *tx, session_id).await? < session.capacity {
            if let Some(entry) = waitlist::dequeue_next(&mut tx, session_id).await? {
                booking::create_booking(&mut *tx, session_id, entry.user_id, entry.gym_id).await?;
                session::increment_counter(&mut *tx, session_id, CounterField::Booked, 1).await?;
                queue_notification(&mut *tx, entry.user_id, &session, NotifyEvent::Promoted, None).await?;
                promoted_user = Some(entry.user_id);
            }
        }
        tx.commit().await?;
        if let Some(user_id) = promoted_user {
            info!("User {user_id} promoted from waitlist of class {session_id}");
        }
        return Ok(LeaveOutcome::BookingRemoved { promoted_user });
    }

    if waitlist::remove_entry(&mut *tx, session_id, who.user_id).await?.is_some() {
        tx.commit().await?;
        return Ok(LeaveOutcome::RemovedFromWaitlist);
    }

    Err(BookingError::NotBookedOrWaitlisted)
}

pub async fn cancel_class(pool: &SqlitePool, session_id: SessionId, reason: Option<&str>, who: &IdentityClaim) -> Result<CancelOutcome, BookingError> {
    let mut tx = pool.begin().await?;
    let session = load_session(&mut *tx, session_id).await?;
    authorize_manage(&session, who)?;
    if session.status == SessionStatus::Canceled {
        // idempotent, and crucially no second round of notifications
        return Ok(CancelOutcome { already_canceled: true, notified_users: 0 });
    }

    // absent reason stays NULL
    let canceled: SessionRecord = query_as("UPDATE sessions SET status='canceled', cancel_reason=?, canceled_at=? WHERE id=? RETURNING *")
        .bind(reason)
        .bind(Utc::now())
        .bind(session_id)
        .fetch_one(&mut *tx)
        .await?;

    // everyone affected, booked and waiting, each exactly once
    let booked = booking::user_ids_for_session(&mut *tx, session_id).await?;
    let waiting = waitlist::user_ids_for(&mut *tx, session_id).await?;
    let affected: Vec<UserId> = booked.into_iter().chain(waiting).unique().collect();

    waitlist::clear_for(&mut *tx, session_id).await?;
    for user_id in &affected {
        queue_notification(&mut *tx, *user_id, &canceled, NotifyEvent::Canceled, reason).await?;
    }
    // Bookings stay as historical records; the session status governs display.
    tx.commit().await?;
    info!("Class {} canceled, {} users notified", session_id, affected.len());
    Ok(CancelOutcome { already_canceled: false, notified_users: affected.len() as i64 })
}

/// Restores a canceled session. The cleared waitlist is not resurrected,
/// waitlisted users have to rejoin.
pub async fn uncancel_class(pool: &SqlitePool, session_id: SessionId, who: &IdentityClaim) -> Result<SessionRecord, BookingError> {
    let session = load_session(pool, session_id).await?;
    authorize_manage(&session, who)?;
    let restored: SessionRecord = query_as("UPDATE sessions SET status='scheduled', cancel_reason=NULL, canceled_at=NULL WHERE id=? RETURNING *")
        .bind(session_id)
        .fetch_one(pool)
        .await?;
    Ok(restored)
}

pub async fn delete_class(pool: &SqlitePool, session_id: SessionId, who: &IdentityClaim) -> Result<(), BookingError> {
    let mut tx = pool.begin().await?;
    let session = load_session(&mut *tx, session_id).await?;
    authorize_manage(&session, who)?;
    booking::delete_for_session(&mut *tx, session_id).await?;
    waitlist::clear_for(&mut *tx, session_id).await?;
    sqlx::query("DELETE FROM sessions WHERE id=?")
        .bind(session_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    info!("Class {} deleted with its bookings and waitlist", session_id);
    Ok(())
}

pub async fn check_in(pool: &SqlitePool, session_id: SessionId, who: &IdentityClaim) -> Result<bool, BookingError> {
    let mut tx = pool.begin().await?;
    let session = load_session(&mut *tx, session_id).await?;
    if session.gym_id != who.gym_id {
        return Err(BookingError::NotFound);
    }
    if session.status == SessionStatus::Canceled {
        return Err(BookingError::SessionCanceled);
    }
    let Some(existing) = booking::find_booking(&mut *tx, session_id, who.user_id).await? else {
        return Err(BookingError::NotBookedOrWaitlisted);
    };
    if existing.status == crate::booking::BookingStatus::CheckedIn {
        return Ok(false);
    }
    if booking::mark_checked_in(&mut *tx, session_id, who.user_id).await? {
        session::increment_counter(&mut *tx, session_id, CounterField::CheckedIn, 1).await?;
        tx.commit().await?;
        return Ok(true);
    }
    Err(BookingError::InvalidInput("booking is not in a check-in state".to_string()))
}

/// Reconciliation safety net: rewrites both cached counters from ground
/// truth. Not a primary mechanism, the atomic increments are.
pub async fn recount_session(pool: &SqlitePool, session_id: SessionId) -> Result<SessionRecord, BookingError> {
    let recounted: Option<SessionRecord> = query_as(
        "UPDATE sessions SET \
           booked_count = (SELECT COUNT(*) FROM bookings WHERE session_id=sessions.id AND status != 'canceled'), \
           checked_in_count = (SELECT COUNT(*) FROM bookings WHERE session_id=sessions.id AND status = 'checked_in') \
         WHERE id=? RETURNING *",
    )
    .bind(session_id)
    .fetch_optional(pool)
    .await?;
    recounted.ok_or(BookingError::NotFound)
}

/* -------------------- routes -------------------- */

#[derive(Serialize, Debug)]
struct JoinResponse {
    waitlisted: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    position: Option<i64>,
}

#[post("/api/classes/<session_id>/join")]
async fn post_join(session_id: SessionId, token: BearerToken, db: &State<DbPool>) -> Result<Json<JoinResponse>, Custom<String>> {
    let who = load_identity(&token, db).await?;
    let outcome = join_class(&db.0, session_id, &who).await.map_err(status_booking_error)?;
    let response = match outcome {
        JoinOutcome::Booked => JoinResponse {
            waitlisted: false,
            message: "Successfully booked class.".to_string(),
            position: None,
        },
        JoinOutcome::Waitlisted { position } => JoinResponse {
            waitlisted: true,
            message: "Class is full. You have been waitlisted.".to_string(),
            position: Some(position),
        },
    };
    Ok(Json(response))
}

#[derive(Serialize, Debug)]
struct LeaveResponse {
    message: String,
    removed_from: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    promoted_user: Option<UserId>,
}

#[post("/api/classes/<session_id>/leave")]
async fn post_leave(session_id: SessionId, token: BearerToken, db: &State<DbPool>) -> Result<Json<LeaveResponse>, Custom<String>> {
    let who = load_identity(&token, db).await?;
    let outcome = leave_class(&db.0, session_id, &who).await.map_err(status_booking_error)?;
    let response = match outcome {
        LeaveOutcome::BookingRemoved { promoted_user } => LeaveResponse {
            message: "Booking canceled.".to_string(),
            removed_from: "booking",
            promoted_user,
        },
        LeaveOutcome::RemovedFromWaitlist => LeaveResponse {
            message: "Removed from waitlist.".to_string(),
            removed_from: "waitlist",
            promoted_user: None,
        },
    };
    Ok(Json(response))
}

#[derive(Serialize, Debug)]
struct CheckInResponse {
    message: String,
    already_checked_in: bool,
}

#[post("/api/classes/<session_id>/checkin")]
async fn post_checkin(session_id: SessionId, token: BearerToken, db: &State<DbPool>) -> Result<Json<CheckInResponse>, Custom<String>> {
    let who = load_identity(&token, db).await?;
    let fresh = check_in(&db.0, session_id, &who).await.map_err(status_booking_error)?;
    Ok(Json(CheckInResponse {
        message: if fresh { "Checked in." } else { "Already checked in." }.to_string(),
        already_checked_in: !fresh,
    }))
}

#[derive(Serialize, Debug)]
struct StatusResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    position: Option<i64>,
}

/// The re-query primitive: after a timeout a caller asks "am I booked or
/// waitlisted for this class?" instead of blindly retrying.
#[get("/api/classes/<session_id>/status")]
async fn get_my_status(session_id: SessionId, token: BearerToken, db: &State<DbPool>) -> Result<Json<StatusResponse>, Custom<String>> {
    let who = load_identity(&token, db).await?;
    let pool = &db.0;
    let session = load_session(pool, session_id).await.map_err(status_booking_error)?;
    if session.gym_id != who.gym_id {
        return Err(status_booking_error(BookingError::NotFound));
    }
    if let Some(existing) = booking::find_booking(pool, session_id, who.user_id).await.map_err(status_booking_error)? {
        let status = match existing.status {
            crate::booking::BookingStatus::CheckedIn => "checked_in",
            _ => "booked",
        };
        return Ok(Json(StatusResponse { status, position: None }));
    }
    if let Some(entry) = waitlist::find_entry(pool, session_id, who.user_id).await.map_err(status_booking_error)? {
        let position = waitlist::position_of(pool, &entry).await.map_err(status_booking_error)?;
        return Ok(Json(StatusResponse { status: "waitlisted", position: Some(position) }));
    }
    Ok(Json(StatusResponse { status: "none", position: None }))
}

#[derive(Serialize, Debug)]
struct CancelResponse {
    message: String,
    already_canceled: bool,
    notified_users: i64,
}

#[derive(Deserialize, Default, Debug)]
struct CancelBody {
    reason: Option<String>,
}

#[post("/api/classes/<session_id>/cancel", data = "<body>")]
async fn post_cancel(session_id: SessionId, token: BearerToken, body: Option<Json<CancelBody>>, db: &State<DbPool>) -> Result<Json<CancelResponse>, Custom<String>> {
    let who = load_identity(&token, db).await?;
    let reason = body.as_ref().and_then(|b| b.reason.as_deref());
    let outcome = cancel_class(&db.0, session_id, reason, &who).await.map_err(status_booking_error)?;
    Ok(Json(CancelResponse {
        message: if outcome.already_canceled {
            "Class already canceled.".to_string()
        } else {
            "Class canceled and users notified.".to_string()
        },
        already_canceled: outcome.already_canceled,
        notified_users: outcome.notified_users,
    }))
}

#[post("/api/classes/<session_id>/uncancel")]
async fn post_uncancel(session_id: SessionId, token: BearerToken, db: &State<DbPool>) -> Result<Json<SessionRecord>, Custom<String>> {
    let who = load_identity(&token, db).await?;
    let restored = uncancel_class(&db.0, session_id, &who).await.map_err(status_booking_error)?;
    Ok(Json(restored))
}

#[derive(Serialize, Debug)]
struct DeleteResponse {
    ok: bool,
    id: SessionId,
    message: String,
}

#[delete("/api/classes/<session_id>")]
async fn delete_session_route(session_id: SessionId, token: BearerToken, db: &State<DbPool>) -> Result<Json<DeleteResponse>, Custom<String>> {
    let who = load_identity(&token, db).await?;
    delete_class(&db.0, session_id, &who).await.map_err(status_booking_error)?;
    Ok(Json(DeleteResponse { ok: true, id: session_id, message: "Class deleted.".to_string() }))
}

#[post("/api/classes/<session_id>/recount")]
async fn post_recount(session_id: SessionId, token: BearerToken, db: &State<DbPool>) -> Result<Json<SessionRecord>, Custom<String>> {
    let who = load_identity(&token, db).await?;
    if !who.is_admin() {
        return Err(status_booking_error(BookingError::Forbidden("admin role required".to_string())));
    }
    let session = load_session(&db.0, session_id).await.map_err(status_booking_error)?;
    if session.gym_id != who.gym_id {
        return Err(status_booking_error(BookingError::NotFound));
    }
    let recounted = recount_session(&db.0, session_id).await.map_err(status_booking_error)?;
    Ok(Json(recounted))
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            post_join,
            post_leave,
            post_checkin,
            get_my_status,
            post_cancel,
            post_uncancel,
            delete_session_route,
            post_recount,
        ])
}
