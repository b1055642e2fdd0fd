use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::model::role::Role;
use crate::model::user::User;
use crate::models::TokenType;
use actix_web::{FromRequest, HttpMessage, HttpRequest, dev::Payload, web::Data};
use futures::future::{Ready, ready};
use sqlx::MySqlPool;

use super::jwt::verify_token;

/// The authenticated caller. Inserted by `auth_middleware`; decoded from the header otherwise.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: u64,
    pub username: String,
    pub role: Role,
}

pub(crate) fn bearer(req: &HttpRequest) -> Option<&str> {
    req.headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
}

impl FromRequest for AuthUser {
    type Error = AppError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        if let Some(user) = req.extensions().get::<AuthUser>() {
            return ready(Ok(user.clone()));
        }

        let Some(token) = bearer(req) else {
            return ready(Err(AppError::Unauthorized("Missing token".to_string())));
        };
        let Some(config) = req.app_data::<Data<Config>>() else {
            return ready(Err(AppError::internal("Config missing")));
        };

        let claims = match verify_token(token, &config.jwt_secret) {
            Ok(c) if c.token_type == TokenType::Access => c,
            _ => return ready(Err(AppError::Unauthorized("Invalid token".to_string()))),
        };
        let Some(role) = Role::from_id(claims.role) else {
            return ready(Err(AppError::Unauthorized("Invalid role".to_string())));
        };

        ready(Ok(AuthUser {
            user_id: claims.user_id,
            username: claims.sub,
            role,
        }))
    }
}

impl AuthUser {
    /// MANAGER or HR.
    pub fn require_manager(&self) -> AppResult<()> {
        if self.role.can_manage() {
            Ok(())
        } else {
            Err(AppError::forbidden("Manager or HR access required"))
        }
    }

    pub fn require_hr(&self) -> AppResult<()> {
        if self.role == Role::Hr {
            Ok(())
        } else {
            Err(AppError::forbidden("HR access required"))
        }
    }

    /// Current row for the caller; deactivated accounts are rejected.
    pub async fn load(&self, pool: &MySqlPool) -> AppResult<User> {
        match User::find(pool, self.user_id).await? {
            Some(user) if user.is_active => Ok(user),
            Some(_) => Err(AppError::Unauthorized("Account is deactivated".to_string())),
            None => Err(AppError::Unauthorized("User no longer exists".to_string())),
        }
    }
}
