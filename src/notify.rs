use chrono::{DateTime, Utc};
use log::{info, warn};
use rocket::fairing::AdHoc;
use rocket::response::status::Custom;
use rocket::serde::json::Json;
use rocket::serde::{Deserialize, Serialize};
use rocket::{Build, Rocket, State};
use sqlx::{query, query_as, FromRow, SqlitePool};
use std::time::Duration;
use crate::auth::{load_identity, BearerToken, UserId};
use crate::db::DbPool;
use crate::error::{status_booking_error, BookingError};
use crate::session::{SessionId, SessionRecord};

const MAX_DELIVERY_ATTEMPTS: i64 = 3;
const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq, Debug)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum NotifyEvent {
    Canceled,
    Promoted,
}

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
pub struct NotificationRecord {
    pub id: i64,
    pub user_id: UserId,
    pub session_id: SessionId,
    pub event: NotifyEvent,
    pub session_title: String,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub attempts: i64,
    pub sent_at: Option<DateTime<Utc>>,
}

/// Queues a notification in the caller's transaction. Delivery happens later
/// in the background worker, so a mail failure can never roll back the state
/// change that caused it, and a committed change keeps its notification even
/// across a process restart.
pub async fn queue_notification<'e, E>(
    executor: E,
    user_id: UserId,
    session: &SessionRecord,
    event: NotifyEvent,
    reason: Option<&str>,
) -> Result<(), BookingError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    query("INSERT INTO notifications(user_id, session_id, event, session_title, reason, created_at) VALUES (?, ?, ?, ?, ?, ?)")
        .bind(user_id)
        .bind(session.id)
        .bind(event)
        .bind(&session.title)
        .bind(reason)
        .bind(Utc::now())
        .execute(executor)
        .await?;
    Ok(())
}

async fn deliver(pool: &SqlitePool, notification: &NotificationRecord) -> anyhow::Result<()> {
    let recipient: Option<(String, String)> = query_as("SELECT name, email FROM users WHERE id=?")
        .bind(notification.user_id)
        .fetch_optional(pool)
        .await?;
    let Some((name, email)) = recipient else {
        anyhow::bail!("user {} not found", notification.user_id);
    };
    match notification.event {
        NotifyEvent::Promoted => {
            info!(
                "MAIL to {name} <{email}>: You're in! A spot opened up, you've been moved from waitlist to booked for {}",
                notification.session_title
            );
        }
        NotifyEvent::Canceled => {
            let reason = notification
                .reason
                .as_deref()
                .filter(|r| !r.is_empty())
                .map(|r| format!(" Reason: {r}."))
                .unwrap_or_default();
            info!(
                "MAIL to {name} <{email}>: We're sorry, your class {} has been canceled.{reason}",
                notification.session_title
            );
        }
    }
    Ok(())
}

async fn deliver_pending(pool: &SqlitePool) {
    let pending: Vec<NotificationRecord> = match query_as(
        "SELECT * FROM notifications WHERE sent_at IS NULL AND attempts < ? ORDER BY id LIMIT 16",
    )
    .bind(MAX_DELIVERY_ATTEMPTS)
    .fetch_all(pool)
    .await
    {
        Ok(pending) => pending,
        Err(e) => {
            warn!("Notification poll error: {e}");
            return;
        }
    };
    for notification in &pending {
        let outcome = deliver(pool, notification).await;
        let result = match outcome {
            Ok(()) => {
                query("UPDATE notifications SET sent_at=?, attempts=attempts+1 WHERE id=?")
                    .bind(Utc::now())
                    .bind(notification.id)
                    .execute(pool)
                    .await
            }
            Err(e) => {
                warn!("Notification {} delivery failed (attempt {}): {e}", notification.id, notification.attempts + 1);
                query("UPDATE notifications SET attempts=attempts+1 WHERE id=?")
                    .bind(notification.id)
                    .execute(pool)
                    .await
            }
        };
        if let Err(e) = result {
            warn!("Notification {} bookkeeping error: {e}", notification.id);
        }
    }
}

pub fn stage() -> AdHoc {
    AdHoc::on_liftoff("Notification worker", |rocket| {
        Box::pin(async move {
            let pool = rocket.state::<DbPool>().expect("database pool").0.clone();
            rocket::tokio::spawn(async move {
                loop {
                    deliver_pending(&pool).await;
                    rocket::tokio::time::sleep(POLL_INTERVAL).await;
                }
            });
        })
    })
}

/// Outbox audit for one session, admin only.
#[get("/api/classes/<session_id>/notifications")]
async fn get_session_notifications(session_id: SessionId, token: BearerToken, db: &State<DbPool>) -> Result<Json<Vec<NotificationRecord>>, Custom<String>> {
    let who = load_identity(&token, db).await?;
    if !who.is_admin() {
        return Err(status_booking_error(BookingError::Forbidden("admin role required".to_string())));
    }
    let session = crate::session::load_session(&db.0, session_id).await.map_err(status_booking_error)?;
    if session.gym_id != who.gym_id {
        return Err(status_booking_error(BookingError::NotFound));
    }
    let notifications: Vec<NotificationRecord> = query_as("SELECT * FROM notifications WHERE session_id=? ORDER BY id")
        .bind(session_id)
        .fetch_all(&db.0)
        .await
        .map_err(crate::util::status_sqlx_error)?;
    Ok(Json(notifications))
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            get_session_notifications,
        ])
}
