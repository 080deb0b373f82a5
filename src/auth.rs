use rocket::http::Status;
use rocket::request::{self, FromRequest, Outcome};
use rocket::response::status::Custom;
use rocket::serde::{Deserialize, Serialize};
use rocket::{Request, State};
use sqlx::FromRow;
use crate::db::DbPool;

pub type UserId = i64;
pub type GymId = i64;

#[derive(Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq, Debug)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Trainer,
    Member,
}

/// Bearer credential as it arrives on the wire. Resolution to an identity
/// happens against the users table, see [`load_identity`].
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct BearerToken(pub String);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for BearerToken {
    type Error = ();
    async fn from_request(request: &'r Request<'_>) -> request::Outcome<BearerToken, ()> {
        if let Some(value) = request.headers().get_one("Authorization") {
            let token = value.strip_prefix("Bearer ").unwrap_or(value);
            if !token.is_empty() {
                return Outcome::Success(BearerToken(token.to_string()));
            }
        }
        Outcome::Forward(Status::Unauthorized)
    }
}

/// The authenticated identity every booking operation runs under.
/// The engine trusts this value completely.
#[derive(Serialize, Deserialize, FromRow, Clone, Copy, Debug)]
pub struct IdentityClaim {
    pub user_id: UserId,
    pub gym_id: GymId,
    pub role: Role,
}

impl IdentityClaim {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
    pub fn is_trainer(&self) -> bool {
        self.role == Role::Trainer
    }
}

pub async fn load_identity(token: &BearerToken, db: &State<DbPool>) -> Result<IdentityClaim, Custom<String>> {
    let pool = &db.0;
    let claim: IdentityClaim = sqlx::query_as("SELECT id AS user_id, gym_id, role FROM users WHERE auth_token=?")
        .bind(&token.0)
        .fetch_one(pool)
        .await
        .map_err(|_| Custom(Status::Unauthorized, "Invalid token".to_string()))?;
    Ok(claim)
}
