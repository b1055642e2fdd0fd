use sqlx::MySqlPool;
use tracing::warn;

use super::{identity_cache, identity_filter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityKind {
    Username,
    Email,
}

impl IdentityKind {
    fn column(self) -> &'static str {
        match self {
            IdentityKind::Username => "username",
            IdentityKind::Email => "email",
        }
    }

    /// Filter and cache key; identities compare case-insensitively.
    pub(crate) fn key(self, value: &str) -> String {
        format!("{}:{}", self.column(), value.trim().to_lowercase())
    }
}

/// true => AVAILABLE. Cuckoo filter for the fast negative, cache for the fast positive,
/// then the database.
pub async fn is_available(pool: &MySqlPool, kind: IdentityKind, value: &str) -> bool {
    if !identity_filter::might_exist(kind, value) {
        return true;
    }
    if identity_cache::is_taken(kind, value).await {
        return false;
    }

    let sql = format!(
        "SELECT EXISTS(SELECT 1 FROM users WHERE LOWER({}) = ? LIMIT 1)",
        kind.column()
    );
    let exists = sqlx::query_scalar::<_, bool>(&sql)
        .bind(value.trim().to_lowercase())
        .fetch_one(pool)
        .await
        .unwrap_or_else(|e| {
            warn!(error = %e, "Identity lookup failed, treating as taken");
            true
        });

    if exists {
        identity_cache::mark_taken(kind, value).await;
    }
    !exists
}

pub async fn mark_taken(kind: IdentityKind, value: &str) {
    identity_filter::insert(kind, value);
    identity_cache::mark_taken(kind, value).await;
}
