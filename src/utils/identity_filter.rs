use anyhow::{Result, anyhow};
use autoscale_cuckoo_filter::CuckooFilter;
use futures::StreamExt;
use once_cell::sync::Lazy;
use sqlx::MySqlPool;
use std::sync::RwLock;
use tracing::info;

use super::identity::IdentityKind;

/// Expected capacity and false-positive rate, shared by usernames and e-mails.
const FILTER_CAPACITY: usize = 200_000;
const FALSE_POSITIVE_RATE: f64 = 0.001;

static IDENTITY_FILTER: Lazy<RwLock<CuckooFilter<String>>> =
    Lazy::new(|| RwLock::new(CuckooFilter::new(FILTER_CAPACITY, FALSE_POSITIVE_RATE)));

/// May return false positives, never false negatives. A poisoned lock reads as "maybe".
pub fn might_exist(kind: IdentityKind, value: &str) -> bool {
    let key = kind.key(value);
    IDENTITY_FILTER
        .read()
        .map(|filter| filter.contains(&key))
        .unwrap_or(true)
}

pub fn insert(kind: IdentityKind, value: &str) {
    let key = kind.key(value);
    if let Ok(mut filter) = IDENTITY_FILTER.write() {
        filter.add(&key);
    }
}

fn insert_batch(keys: &[String]) {
    if let Ok(mut filter) = IDENTITY_FILTER.write() {
        for key in keys {
            filter.add(key);
        }
    }
}

/// Streams every username and e-mail into the filter.
pub async fn warmup_identity_filter(pool: &MySqlPool, batch_size: usize) -> Result<()> {
    let mut stream = sqlx::query_as::<_, (String, String)>("SELECT username, email FROM users").fetch(pool);

    let mut batch = Vec::with_capacity(batch_size * 2);
    let mut total = 0usize;

    while let Some(row) = stream.next().await {
        let (username, email) = row.map_err(|e| anyhow!("DB row fetch failed: {e}"))?;
        batch.push(IdentityKind::Username.key(&username));
        batch.push(IdentityKind::Email.key(&email));
        total += 1;

        if batch.len() >= batch_size * 2 {
            insert_batch(&batch);
            batch.clear();
        }
    }
    if !batch.is_empty() {
        insert_batch(&batch);
    }

    info!(users = total, "Identity filter warmup complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inserted_values_are_found_case_insensitively() {
        insert(IdentityKind::Username, "Filter.Probe");
        assert!(might_exist(IdentityKind::Username, "filter.sample"));
        // Same text under another kind is a different key.
        assert!(!might_exist(IdentityKind::Email, "zz-never-inserted@example.test"));
    }
}
