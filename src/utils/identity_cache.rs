use anyhow::Result;
use futures_util::StreamExt;
use moka::future::Cache;
use once_cell::sync::Lazy;
use sqlx::MySqlPool;
use std::time::Duration;
use tracing::info;

use super::identity::IdentityKind;

/// Only taken identities are stored.
static TAKEN: Lazy<Cache<String, bool>> = Lazy::new(|| {
    Cache::builder()
        .max_capacity(500_000)
        .time_to_live(Duration::from_secs(86400))
        .build()
});

pub async fn mark_taken(kind: IdentityKind, value: &str) {
    TAKEN.insert(kind.key(value), true).await;
}

pub async fn is_taken(kind: IdentityKind, value: &str) -> bool {
    TAKEN.get(&kind.key(value)).await.unwrap_or(false)
}

async fn batch_mark(keys: &[String]) {
    let inserts: Vec<_> = keys.iter().map(|k| TAKEN.insert(k.clone(), true)).collect();
    futures::future::join_all(inserts).await;
}

/// Loads identities of users active in the last `days` days, in batches.
pub async fn warmup_identity_cache(pool: &MySqlPool, days: u32, batch_size: usize) -> Result<()> {
    let mut stream = sqlx::query_as::<_, (String, String)>(
        r#"
        SELECT username, email
        FROM users
        WHERE last_login_at >= NOW() - INTERVAL ? DAY
        ORDER BY last_login_at DESC
        "#,
    )
    .bind(days)
    .fetch(pool);

    let mut batch = Vec::with_capacity(batch_size * 2);
    let mut total = 0usize;

    while let Some(row) = stream.next().await {
        let (username, email) = row?;
        batch.push(IdentityKind::Username.key(&username));
        batch.push(IdentityKind::Email.key(&email));
        total += 1;

        if batch.len() >= batch_size * 2 {
            batch_mark(&batch).await;
            batch.clear();
        }
    }
    if !batch.is_empty() {
        batch_mark(&batch).await;
    }

    info!(users = total, days, "Identity cache warmup complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[actix_web::test]
    async fn marked_identities_are_taken() {
        assert!(!is_taken(IdentityKind::Email, "cache.sample@example.test").await);
        mark_taken(IdentityKind::Email, "Cache.Probe@example.test").await;
        assert!(is_taken(IdentityKind::Email, "cache.sample@example.test").await);
        assert!(!is_taken(IdentityKind::Username, "cache.sample@example.test").await);
    }
}
