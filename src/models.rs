use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::model::role::Role;
use crate::model::user::User;

#[derive(Debug, Deserialize, ToSchema)]
pub struct RegisterReq {
    #[schema(example = "jane@acme.io")]
    pub email: String,
    #[schema(example = "jane")]
    pub username: String,
    #[schema(example = "Jane Doe")]
    pub full_name: String,
    pub password: String,
    /// Defaults to EMPLOYEE.
    pub role: Option<Role>,
    pub department: Option<String>,
    pub position: Option<String>,
    pub manager_id: Option<u64>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct LoginReqDto {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: &'static str,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct LoginResponse {
    #[serde(flatten)]
    pub tokens: TokenPair,
    pub user: User,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: u64,
    pub sub: String,
    /// Role id, see `Role::from_id`.
    pub role: u8,
    pub exp: usize,
    pub jti: String,
    pub token_type: TokenType,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub enum TokenType {
    Access,
    Refresh,
}
