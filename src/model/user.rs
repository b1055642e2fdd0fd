use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, MySqlPool};
use utoipa::ToSchema;

use super::role::Role;

pub const USER_COLUMNS: &str = "id, email, username, full_name, password, role_id, department, \
     position, manager_id, is_active, last_login_at, created_at";

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct User {
    #[schema(example = 7)]
    pub id: u64,
    #[schema(example = "jane@acme.io")]
    pub email: String,
    #[schema(example = "jane")]
    pub username: String,
    #[schema(example = "Jane Doe")]
    pub full_name: String,
    #[serde(skip_serializing, default)]
    #[schema(value_type = String, write_only)]
    pub password: String,
    #[schema(example = 1)]
    pub role_id: u8,
    #[schema(example = "Engineering")]
    pub department: Option<String>,
    #[schema(example = "Backend Developer")]
    pub position: Option<String>,
    pub manager_id: Option<u64>,
    pub is_active: bool,
    #[schema(value_type = Option<String>, format = "date-time")]
    pub last_login_at: Option<NaiveDateTime>,
    #[schema(value_type = String, format = "date-time")]
    pub created_at: NaiveDateTime,
}

impl User {
    pub fn role(&self) -> Role {
        Role::from_id(self.role_id).unwrap_or(Role::Employee)
    }

    pub async fn find(pool: &MySqlPool, id: u64) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as::<_, User>(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?"))
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub async fn find_by_username(
        pool: &MySqlPool,
        username: &str,
    ) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE username = ?"
        ))
        .bind(username)
        .fetch_optional(pool)
        .await
    }

    /// Active users reporting directly to `manager_id`.
    pub async fn direct_reports(pool: &MySqlPool, manager_id: u64) -> Result<Vec<User>, sqlx::Error> {
        sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE manager_id = ? AND is_active = TRUE ORDER BY full_name"
        ))
        .bind(manager_id)
        .fetch_all(pool)
        .await
    }

    pub async fn active_in_department(
        pool: &MySqlPool,
        department: &str,
    ) -> Result<Vec<User>, sqlx::Error> {
        sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE department = ? AND is_active = TRUE ORDER BY full_name"
        ))
        .bind(department)
        .fetch_all(pool)
        .await
    }

    pub async fn all_active(pool: &MySqlPool) -> Result<Vec<User>, sqlx::Error> {
        sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE is_active = TRUE ORDER BY full_name"
        ))
        .fetch_all(pool)
        .await
    }

    /// The first HR account, used as the default manager for new sign-ups.
    pub async fn first_hr(pool: &MySqlPool) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE role_id = ? AND is_active = TRUE ORDER BY id LIMIT 1"
        ))
        .bind(Role::Hr.id())
        .fetch_optional(pool)
        .await
    }
}

#[cfg(test)]
pub(crate) fn sample_user(id: u64, name: &str, role: Role, department: &str) -> User {
    User {
        id,
        email: format!("{}@acme.io", name.to_lowercase().replace(' ', ".")),
        username: name.to_lowercase().replace(' ', "."),
        full_name: name.to_string(),
        password: String::new(),
        role_id: role.id(),
        department: Some(department.to_string()),
        position: Some("Engineer".to_string()),
        manager_id: None,
        is_active: true,
        last_login_at: None,
        created_at: chrono::NaiveDate::from_ymd_opt(2025, 1, 1)
            .and_then(|d| d.and_hms_opt(9, 0, 0))
            .unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_is_never_serialized() {
        let mut user = sample_user(1, "Jane Doe", Role::Manager, "Engineering");
        user.password = "$argon2id$secret".to_string();
        let json = serde_json::to_value(&user).unwrap();
        assert!(json.get("password").is_none());
        assert_eq!(json["full_name"], "Jane Doe");
        assert_eq!(user.role(), Role::Manager);
    }
}
