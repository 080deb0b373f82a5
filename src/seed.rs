use log::info;
use rocket::response::status::Custom;
use rocket::serde::json::Json;
use rocket::serde::{Deserialize, Serialize};
use rocket::{Build, Rocket, State};
use sqlx::{query_as, query_scalar};
use crate::auth::{GymId, Role, UserId};
use crate::db::DbPool;
use crate::util::{generate_random_string, status_sqlx_error};

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SeededUser {
    pub user_id: UserId,
    pub name: String,
    pub email: String,
    pub role: Role,
    pub token: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SeededGym {
    pub gym_id: GymId,
    pub admin: SeededUser,
    pub trainer: SeededUser,
    pub members: Vec<SeededUser>,
}

async fn insert_user(pool: &sqlx::SqlitePool, gym_id: GymId, name: &str, role: Role) -> Result<SeededUser, sqlx::Error> {
    let email = format!("{}@demo.gym", name.to_lowercase().replace(' ', "."));
    let token = generate_random_string(16);
    let user_id: UserId = query_scalar("INSERT INTO users(gym_id, name, email, role, auth_token) VALUES (?, ?, ?, ?, ?) RETURNING id")
        .bind(gym_id)
        .bind(name)
        .bind(&email)
        .bind(role)
        .bind(&token)
        .fetch_one(pool)
        .await?;
    Ok(SeededUser { user_id, name: name.to_string(), email, role, token })
}

/// Provisions one demo tenant: an admin, a trainer and three members with
/// fresh bearer tokens. Every call creates a new gym, so tenants stay
/// isolated from each other.
#[post("/api/demo/seed")]
async fn post_seed_demo(db: &State<DbPool>) -> Result<Json<SeededGym>, Custom<String>> {
    let pool = &db.0;
    let gym_id: GymId = query_as::<_, (GymId,)>("SELECT COALESCE(MAX(gym_id), 0) + 1 FROM users")
        .fetch_one(pool)
        .await
        .map_err(status_sqlx_error)?
        .0;

    let admin = insert_user(pool, gym_id, "Avery Admin", Role::Admin).await.map_err(status_sqlx_error)?;
    let trainer = insert_user(pool, gym_id, "Tracy Trainer", Role::Trainer).await.map_err(status_sqlx_error)?;
    let mut members = Vec::new();
    for name in ["Mia Member", "Max Member", "Mo Member"] {
        members.push(insert_user(pool, gym_id, name, Role::Member).await.map_err(status_sqlx_error)?);
    }

    info!("Demo gym {gym_id} seeded with {} users", 2 + members.len());
    Ok(Json(SeededGym { gym_id, admin, trainer, members }))
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            post_seed_demo,
        ])
}
