use chrono::{Duration, Utc};
use rocket::http::{Header, Status};
use rocket::local::blocking::Client;
use serde_json::{json, Value};
use crate::notify::NotificationRecord;
use crate::seed::{SeededGym, SeededUser};
use crate::session::{SessionRecord, SessionWithWaitlist};

fn create_test_server() -> (Client, SeededGym) {
    let client = Client::tracked(super::rocket()).unwrap();
    let resp = client.post("/api/demo/seed").dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let gym = resp.into_json::<SeededGym>().unwrap();
    (client, gym)
}

fn bearer(user: &SeededUser) -> Header<'static> {
    Header::new("Authorization", format!("Bearer {}", user.token))
}

fn create_session(client: &Client, trainer: &SeededUser, capacity: i64) -> SessionRecord {
    let start = Utc::now() + Duration::hours(1);
    let end = start + Duration::hours(1);
    let resp = client.post("/api/classes/session")
        .header(bearer(trainer))
        .json(&json!({
            "title": "Morning Spin",
            "description": "Cardio on wheels",
            "start_time": start,
            "end_time": end,
            "capacity": capacity,
        }))
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    resp.into_json::<SessionRecord>().unwrap()
}

fn fetch_session(client: &Client, user: &SeededUser, session_id: i64) -> SessionWithWaitlist {
    let resp = client.get(format!("/api/classes/{session_id}"))
        .header(bearer(user))
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    resp.into_json::<SessionWithWaitlist>().unwrap()
}

fn join(client: &Client, user: &SeededUser, session_id: i64) -> (Status, Value) {
    let resp = client.post(format!("/api/classes/{session_id}/join"))
        .header(bearer(user))
        .dispatch();
    let status = resp.status();
    let body = resp.into_string().unwrap_or_default();
    (status, serde_json::from_str(&body).unwrap_or(Value::String(body)))
}

fn leave(client: &Client, user: &SeededUser, session_id: i64) -> (Status, Value) {
    let resp = client.post(format!("/api/classes/{session_id}/leave"))
        .header(bearer(user))
        .dispatch();
    let status = resp.status();
    let body = resp.into_string().unwrap_or_default();
    (status, serde_json::from_str(&body).unwrap_or(Value::String(body)))
}

fn my_status(client: &Client, user: &SeededUser, session_id: i64) -> Value {
    let resp = client.get(format!("/api/classes/{session_id}/status"))
        .header(bearer(user))
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    resp.into_json::<Value>().unwrap()
}

#[test]
fn service_info_and_seed() {
    let (client, gym) = create_test_server();

    let resp = client.get("/").dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let info = resp.into_json::<Value>().unwrap();
    assert_eq!(info["name"], "sghttpd");

    assert_eq!(gym.members.len(), 3);
    let mut tokens = vec![gym.admin.token.clone(), gym.trainer.token.clone()];
    tokens.extend(gym.members.iter().map(|m| m.token.clone()));
    tokens.sort();
    tokens.dedup();
    assert_eq!(tokens.len(), 5);

    // unknown token is rejected
    let resp = client.get("/api/classes").header(Header::new("Authorization", "Bearer nope")).dispatch();
    assert_eq!(resp.status(), Status::Unauthorized);
}

#[test]
fn create_session_validation() {
    let (client, gym) = create_test_server();
    let start = Utc::now() + Duration::hours(1);
    let end = start + Duration::hours(1);

    // members cannot create sessions
    let resp = client.post("/api/classes/session")
        .header(bearer(&gym.members[0]))
        .json(&json!({"title": "Yoga", "start_time": start, "end_time": end, "capacity": 5}))
        .dispatch();
    assert_eq!(resp.status(), Status::Forbidden);

    // end before start
    let resp = client.post("/api/classes/session")
        .header(bearer(&gym.trainer))
        .json(&json!({"title": "Yoga", "start_time": end, "end_time": start, "capacity": 5}))
        .dispatch();
    assert_eq!(resp.status(), Status::BadRequest);

    // capacity below one
    let resp = client.post("/api/classes/session")
        .header(bearer(&gym.trainer))
        .json(&json!({"title": "Yoga", "start_time": start, "end_time": end, "capacity": 0}))
        .dispatch();
    assert_eq!(resp.status(), Status::BadRequest);

    // empty title
    let resp = client.post("/api/classes/session")
        .header(bearer(&gym.trainer))
        .json(&json!({"title": "  ", "start_time": start, "end_time": end, "capacity": 5}))
        .dispatch();
    assert_eq!(resp.status(), Status::BadRequest);

    // trainer-created sessions belong to the trainer
    let session = create_session(&client, &gym.trainer, 5);
    assert_eq!(session.trainer_id, gym.trainer.user_id);
    assert_eq!(session.gym_id, gym.gym_id);
    assert_eq!(session.booked_count, 0);

    // admins may assign any trainer
    let resp = client.post("/api/classes/session")
        .header(bearer(&gym.admin))
        .json(&json!({
            "title": "HIIT",
            "start_time": start,
            "end_time": end,
            "capacity": 8,
            "trainer_id": gym.trainer.user_id,
        }))
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let session = resp.into_json::<SessionRecord>().unwrap();
    assert_eq!(session.trainer_id, gym.trainer.user_id);
}

#[test]
fn update_session_patch() {
    let (client, gym) = create_test_server();
    let session = create_session(&client, &gym.trainer, 5);

    // partial time update that would invert the window is rejected
    let resp = client.put(format!("/api/classes/{}", session.id))
        .header(bearer(&gym.trainer))
        .json(&json!({"start_time": session.end_time + Duration::hours(2)}))
        .dispatch();
    assert_eq!(resp.status(), Status::BadRequest);

    // capacity zero rejected
    let resp = client.put(format!("/api/classes/{}", session.id))
        .header(bearer(&gym.trainer))
        .json(&json!({"capacity": 0}))
        .dispatch();
    assert_eq!(resp.status(), Status::BadRequest);

    // a valid patch applies
    let resp = client.put(format!("/api/classes/{}", session.id))
        .header(bearer(&gym.trainer))
        .json(&json!({"title": "Evening Spin", "capacity": 7}))
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let updated = resp.into_json::<SessionRecord>().unwrap();
    assert_eq!(updated.title, "Evening Spin");
    assert_eq!(updated.capacity, 7);

    // members cannot edit
    let resp = client.put(format!("/api/classes/{}", session.id))
        .header(bearer(&gym.members[0]))
        .json(&json!({"title": "Hijacked"}))
        .dispatch();
    assert_eq!(resp.status(), Status::Forbidden);

    // no credential at all
    let resp = client.put(format!("/api/classes/{}", session.id))
        .json(&json!({"title": "Anonymous"}))
        .dispatch();
    assert_eq!(resp.status(), Status::Unauthorized);
}

#[test]
fn book_waitlist_promote_capacity_one() {
    let (client, gym) = create_test_server();
    let session = create_session(&client, &gym.trainer, 1);
    let (user_a, user_b) = (&gym.members[0], &gym.members[1]);

    // A gets the seat
    let (status, body) = join(&client, user_a, session.id);
    assert_eq!(status, Status::Ok);
    assert_eq!(body["waitlisted"], false);
    assert_eq!(fetch_session(&client, user_a, session.id).session.booked_count, 1);

    // B is waitlisted at position 1
    let (status, body) = join(&client, user_b, session.id);
    assert_eq!(status, Status::Ok);
    assert_eq!(body["waitlisted"], true);
    assert_eq!(body["position"], 1);
    assert_eq!(fetch_session(&client, user_a, session.id).waitlist_count, 1);

    // booked and waitlisted states are mutually exclusive and sticky
    let (status, _) = join(&client, user_a, session.id);
    assert_eq!(status, Status::Conflict);
    let (status, _) = join(&client, user_b, session.id);
    assert_eq!(status, Status::Conflict);

    // A leaves, B is promoted into the freed seat
    let (status, body) = leave(&client, user_a, session.id);
    assert_eq!(status, Status::Ok);
    assert_eq!(body["removed_from"], "booking");
    assert_eq!(body["promoted_user"], user_b.user_id);

    let listed = fetch_session(&client, user_a, session.id);
    assert_eq!(listed.session.booked_count, 1);
    assert_eq!(listed.waitlist_count, 0);
    assert_eq!(my_status(&client, user_b, session.id)["status"], "booked");
    assert_eq!(my_status(&client, user_a, session.id)["status"], "none");

    // B leaves with nobody waiting, then a second leave is a no-op
    let (status, body) = leave(&client, user_b, session.id);
    assert_eq!(status, Status::Ok);
    assert!(body["promoted_user"].is_null());
    assert_eq!(fetch_session(&client, user_a, session.id).session.booked_count, 0);
    let (status, _) = leave(&client, user_b, session.id);
    assert_eq!(status, Status::NotFound);
}

#[test]
fn fifo_promotion_order() {
    let (client, gym) = create_test_server();
    let session = create_session(&client, &gym.trainer, 1);
    let (user_a, user_b, user_c) = (&gym.members[0], &gym.members[1], &gym.members[2]);

    let (status, _) = join(&client, user_a, session.id);
    assert_eq!(status, Status::Ok);
    for (user, expected_position) in [(user_b, 1), (user_c, 2)] {
        let (status, body) = join(&client, user, session.id);
        assert_eq!(status, Status::Ok);
        assert_eq!(body["waitlisted"], true);
        assert_eq!(body["position"], expected_position);
    }

    // first leave promotes the longest-waiting user, exactly one per leave
    let (_, body) = leave(&client, user_a, session.id);
    assert_eq!(body["promoted_user"], user_b.user_id);
    assert_eq!(my_status(&client, user_c, session.id)["position"], 1);

    let (_, body) = leave(&client, user_b, session.id);
    assert_eq!(body["promoted_user"], user_c.user_id);
    assert_eq!(my_status(&client, user_c, session.id)["status"], "booked");
    assert_eq!(fetch_session(&client, user_c, session.id).waitlist_count, 0);
}

#[test]
fn capacity_two_admits_two_then_waitlists() {
    let (client, gym) = create_test_server();
    let session = create_session(&client, &gym.trainer, 2);

    for user in [&gym.members[0], &gym.members[1]] {
        let (status, body) = join(&client, user, session.id);
        assert_eq!(status, Status::Ok);
        assert_eq!(body["waitlisted"], false);
    }
    let listed = fetch_session(&client, &gym.trainer, session.id);
    assert_eq!(listed.session.booked_count, 2);

    let (status, body) = join(&client, &gym.members[2], session.id);
    assert_eq!(status, Status::Ok);
    assert_eq!(body["waitlisted"], true);
    assert_eq!(fetch_session(&client, &gym.trainer, session.id).session.booked_count, 2);
}

#[test]
fn join_after_end_is_rejected() {
    let (client, gym) = create_test_server();
    let start = Utc::now() - Duration::hours(2);
    let end = Utc::now() - Duration::hours(1);
    let resp = client.post("/api/classes/session")
        .header(bearer(&gym.trainer))
        .json(&json!({"title": "Bygone Barre", "start_time": start, "end_time": end, "capacity": 5}))
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let session = resp.into_json::<SessionRecord>().unwrap();

    let (status, body) = join(&client, &gym.members[0], session.id);
    assert_eq!(status, Status::BadRequest);
    assert!(body.as_str().unwrap_or_default().contains("already ended"));
    assert_eq!(fetch_session(&client, &gym.trainer, session.id).session.booked_count, 0);
}

#[test]
fn cancel_clears_waitlist_and_notifies_once() {
    let (client, gym) = create_test_server();
    let session = create_session(&client, &gym.trainer, 1);
    let (user_a, user_b) = (&gym.members[0], &gym.members[1]);
    join(&client, user_a, session.id);
    join(&client, user_b, session.id);

    let resp = client.post(format!("/api/classes/{}/cancel", session.id))
        .header(bearer(&gym.trainer))
        .json(&json!({"reason": "trainer is sick"}))
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let body = resp.into_json::<Value>().unwrap();
    assert_eq!(body["already_canceled"], false);
    assert_eq!(body["notified_users"], 2);

    let listed = fetch_session(&client, user_a, session.id);
    assert_eq!(listed.session.status, crate::session::SessionStatus::Canceled);
    assert_eq!(listed.waitlist_count, 0);
    // the booking is kept as a historical record
    assert_eq!(listed.session.booked_count, 1);

    // joining a canceled class fails
    let (status, _) = join(&client, &gym.members[2], session.id);
    assert_eq!(status, Status::BadRequest);

    // canceling again is an idempotent no-op without new notifications
    let resp = client.post(format!("/api/classes/{}/cancel", session.id))
        .header(bearer(&gym.trainer))
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let body = resp.into_json::<Value>().unwrap();
    assert_eq!(body["already_canceled"], true);

    // exactly one queued notification per affected user
    let resp = client.get(format!("/api/classes/{}/notifications", session.id))
        .header(bearer(&gym.admin))
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let notifications = resp.into_json::<Vec<NotificationRecord>>().unwrap();
    assert_eq!(notifications.len(), 2);
    let mut notified: Vec<i64> = notifications.iter().map(|n| n.user_id).collect();
    notified.sort();
    let mut expected = vec![user_a.user_id, user_b.user_id];
    expected.sort();
    assert_eq!(notified, expected);

    // the audit endpoint is admin only
    let resp = client.get(format!("/api/classes/{}/notifications", session.id))
        .header(bearer(&gym.trainer))
        .dispatch();
    assert_eq!(resp.status(), Status::Forbidden);
}

#[test]
fn uncancel_does_not_restore_waitlist() {
    let (client, gym) = create_test_server();
    let session = create_session(&client, &gym.trainer, 1);
    let (user_a, user_b) = (&gym.members[0], &gym.members[1]);
    join(&client, user_a, session.id);
    join(&client, user_b, session.id);

    let resp = client.post(format!("/api/classes/{}/cancel", session.id))
        .header(bearer(&gym.trainer))
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);

    // a cancel without a body leaves the reason unset, not empty
    let canceled = fetch_session(&client, user_a, session.id);
    assert!(canceled.session.cancel_reason.is_none());
    assert!(canceled.session.canceled_at.is_some());

    let resp = client.post(format!("/api/classes/{}/uncancel", session.id))
        .header(bearer(&gym.trainer))
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let restored = resp.into_json::<SessionRecord>().unwrap();
    assert_eq!(restored.status, crate::session::SessionStatus::Scheduled);
    assert!(restored.cancel_reason.is_none());
    assert!(restored.canceled_at.is_none());

    // the waitlisted user has to rejoin, the booked one is still in
    assert_eq!(fetch_session(&client, user_a, session.id).waitlist_count, 0);
    assert_eq!(my_status(&client, user_b, session.id)["status"], "none");
    assert_eq!(my_status(&client, user_a, session.id)["status"], "booked");
}

#[test]
fn delete_cascades_bookings_and_waitlist() {
    let (client, gym) = create_test_server();
    let session = create_session(&client, &gym.trainer, 1);
    join(&client, &gym.members[0], session.id);
    join(&client, &gym.members[1], session.id);

    let resp = client.delete(format!("/api/classes/{}", session.id))
        .header(bearer(&gym.admin))
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);

    let resp = client.get(format!("/api/classes/{}", session.id))
        .header(bearer(&gym.admin))
        .dispatch();
    assert_eq!(resp.status(), Status::NotFound);

    let resp = client.get("/api/classes").header(bearer(&gym.admin)).dispatch();
    let listed = resp.into_json::<Vec<SessionWithWaitlist>>().unwrap();
    assert!(listed.iter().all(|s| s.session.id != session.id));
}

#[test]
fn foreign_tenant_and_role_boundaries() {
    let (client, gym) = create_test_server();
    let other_gym = client.post("/api/demo/seed").dispatch().into_json::<SeededGym>().unwrap();
    let session = create_session(&client, &gym.trainer, 3);

    // members cannot cancel at all
    let resp = client.post(format!("/api/classes/{}/cancel", session.id))
        .header(bearer(&gym.members[0]))
        .dispatch();
    assert_eq!(resp.status(), Status::Forbidden);

    // a trainer from another gym does not own this session
    let resp = client.post(format!("/api/classes/{}/cancel", session.id))
        .header(bearer(&other_gym.trainer))
        .dispatch();
    assert_eq!(resp.status(), Status::Forbidden);

    // another gym's admin does not even see it
    let resp = client.post(format!("/api/classes/{}/cancel", session.id))
        .header(bearer(&other_gym.admin))
        .dispatch();
    assert_eq!(resp.status(), Status::NotFound);

    // and its members cannot book across the tenant boundary
    let (status, _) = join(&client, &other_gym.members[0], session.id);
    assert_eq!(status, Status::NotFound);

    // a canceled foreign session still reads as absent, not as canceled
    let resp = client.post(format!("/api/classes/{}/cancel", session.id))
        .header(bearer(&gym.trainer))
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let resp = client.post(format!("/api/classes/{}/checkin", session.id))
        .header(bearer(&other_gym.members[0]))
        .dispatch();
    assert_eq!(resp.status(), Status::NotFound);
}

#[test]
fn checkin_flow() {
    let (client, gym) = create_test_server();
    let session = create_session(&client, &gym.trainer, 2);
    let user = &gym.members[0];
    join(&client, user, session.id);

    let resp = client.post(format!("/api/classes/{}/checkin", session.id))
        .header(bearer(user))
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let body = resp.into_json::<Value>().unwrap();
    assert_eq!(body["already_checked_in"], false);
    assert_eq!(my_status(&client, user, session.id)["status"], "checked_in");
    assert_eq!(fetch_session(&client, user, session.id).session.checked_in_count, 1);

    // idempotent second check-in, counter unchanged
    let resp = client.post(format!("/api/classes/{}/checkin", session.id))
        .header(bearer(user))
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let body = resp.into_json::<Value>().unwrap();
    assert_eq!(body["already_checked_in"], true);
    assert_eq!(fetch_session(&client, user, session.id).session.checked_in_count, 1);

    // without a booking there is nothing to check into
    let resp = client.post(format!("/api/classes/{}/checkin", session.id))
        .header(bearer(&gym.members[1]))
        .dispatch();
    assert_eq!(resp.status(), Status::NotFound);
}

#[test]
fn leave_after_checkin_releases_both_counters() {
    let (client, gym) = create_test_server();
    let session = create_session(&client, &gym.trainer, 1);
    let user = &gym.members[0];
    join(&client, user, session.id);

    let resp = client.post(format!("/api/classes/{}/checkin", session.id))
        .header(bearer(user))
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let listed = fetch_session(&client, user, session.id);
    assert_eq!(listed.session.booked_count, 1);
    assert_eq!(listed.session.checked_in_count, 1);

    // leaving a checked-in booking frees the seat and the check-in
    let (status, _) = leave(&client, user, session.id);
    assert_eq!(status, Status::Ok);
    let listed = fetch_session(&client, user, session.id);
    assert_eq!(listed.session.booked_count, 0);
    assert_eq!(listed.session.checked_in_count, 0);

    // the cached counters already equal ground truth, recount changes nothing
    let resp = client.post(format!("/api/classes/{}/recount", session.id))
        .header(bearer(&gym.admin))
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let recounted = resp.into_json::<SessionRecord>().unwrap();
    assert_eq!(recounted.booked_count, 0);
    assert_eq!(recounted.checked_in_count, 0);
}

#[test]
fn recount_matches_counters() {
    let (client, gym) = create_test_server();
    let session = create_session(&client, &gym.trainer, 2);
    join(&client, &gym.members[0], session.id);
    join(&client, &gym.members[1], session.id);
    join(&client, &gym.members[2], session.id); // waitlisted
    leave(&client, &gym.members[0], session.id); // promotes member 2

    let listed = fetch_session(&client, &gym.admin, session.id);
    let resp = client.post(format!("/api/classes/{}/recount", session.id))
        .header(bearer(&gym.admin))
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let recounted = resp.into_json::<SessionRecord>().unwrap();
    assert_eq!(recounted.booked_count, listed.session.booked_count);
    assert_eq!(recounted.booked_count, 2);
    assert_eq!(recounted.checked_in_count, 0);

    // reconciliation is an admin tool
    let resp = client.post(format!("/api/classes/{}/recount", session.id))
        .header(bearer(&gym.trainer))
        .dispatch();
    assert_eq!(resp.status(), Status::Forbidden);
}

#[test]
fn listing_views() {
    let (client, gym) = create_test_server();
    let first = create_session(&client, &gym.trainer, 1);
    let second = create_session(&client, &gym.trainer, 5);
    join(&client, &gym.members[0], first.id);
    join(&client, &gym.members[1], first.id); // waitlisted
    join(&client, &gym.members[0], second.id);

    let resp = client.get("/api/classes").header(bearer(&gym.members[0])).dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let listed = resp.into_json::<Vec<SessionWithWaitlist>>().unwrap();
    assert_eq!(listed.len(), 2);
    let first_listed = listed.iter().find(|s| s.session.id == first.id).unwrap();
    assert_eq!(first_listed.waitlist_count, 1);

    let resp = client.get("/api/classes/mine").header(bearer(&gym.members[0])).dispatch();
    let mine = resp.into_json::<Vec<SessionRecord>>().unwrap();
    assert_eq!(mine.len(), 2);
    let resp = client.get("/api/classes/mine").header(bearer(&gym.members[1])).dispatch();
    let mine = resp.into_json::<Vec<SessionRecord>>().unwrap();
    assert!(mine.is_empty()); // waitlisted is not booked

    let resp = client.get("/api/classes/trainer/mine").header(bearer(&gym.trainer)).dispatch();
    let trainer_sessions = resp.into_json::<Vec<SessionRecord>>().unwrap();
    assert_eq!(trainer_sessions.len(), 2);

    let resp = client.get(format!("/api/classes/trainer/mine?trainer_id={}", gym.trainer.user_id))
        .header(bearer(&gym.admin))
        .dispatch();
    let trainer_sessions = resp.into_json::<Vec<SessionRecord>>().unwrap();
    assert_eq!(trainer_sessions.len(), 2);
}
