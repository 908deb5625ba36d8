//! Short-lived mutual exclusion across worker processes
//!
//! A lock is a key with an owner token and an expiry. Acquiring a held,
//! unexpired key fails immediately (`Ok(None)`); an expired lock is taken
//! over, so a crashed worker blocks a key for at most one TTL.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use uuid::Uuid;

use crate::db::Database;
use crate::error::{DbError, Result};

/// Proof of ownership returned by a successful acquire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerToken(String);

impl OwnerToken {
    fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Key guarding one publish of a post through one account
pub fn publish_key(post_id: &str, account_id: &str) -> String {
    format!("publish:{}:{}", post_id, account_id)
}

/// Key guarding a proactive token refresh
pub fn refresh_key(account_id: &str) -> String {
    format!("refresh:{}", account_id)
}

#[async_trait]
pub trait LockManager: Send + Sync {
    /// Take `key` for `ttl`. `Ok(None)` when someone else holds it.
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<OwnerToken>>;

    /// Release `key` if `owner` still holds it. Returns false when the lock
    /// had expired and was taken over, or was already released.
    async fn release(&self, key: &str, owner: &OwnerToken) -> Result<bool>;
}

/// Locks in the shared SQLite database, visible to every worker process
#[derive(Clone)]
pub struct SqlLockManager {
    db: Database,
}

impl SqlLockManager {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Delete locks that expired before now; returns how many were removed
    pub async fn purge_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM publish_locks WHERE expires_at <= ?")
            .bind(now_millis())
            .execute(self.db.pool())
            .await
            .map_err(DbError::SqlxError)?;
        Ok(result.rows_affected())
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[async_trait]
impl LockManager for SqlLockManager {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<OwnerToken>> {
        let owner = OwnerToken::generate();
        let now = now_millis();
        let expires_at = now.saturating_add(ttl.as_millis() as i64);

        // Insert, or take over an expired holder, in one statement. A live
        // holder makes the WHERE clause false and nothing changes.
        let result = sqlx::query(
            r#"
            INSERT INTO publish_locks (key, owner, expires_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET owner = excluded.owner, expires_at = excluded.expires_at
            WHERE publish_locks.expires_at <= ?4
            "#,
        )
        .bind(key)
        .bind(owner.as_str())
        .bind(expires_at)
        .bind(now)
        .execute(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        if result.rows_affected() == 1 {
            tracing::trace!(key = %key, "Lock acquired");
            Ok(Some(owner))
        } else {
            tracing::debug!(key = %key, "Lock held elsewhere");
            Ok(None)
        }
    }

    async fn release(&self, key: &str, owner: &OwnerToken) -> Result<bool> {
        let result = sqlx::query("DELETE FROM publish_locks WHERE key = ? AND owner = ?")
            .bind(key)
            .bind(owner.as_str())
            .execute(self.db.pool())
            .await
            .map_err(DbError::SqlxError)?;

        let released = result.rows_affected() == 1;
        if !released {
            tracing::warn!(key = %key, "Lock expired before release");
        }
        Ok(released)
    }
}

/// In-process locks for single-worker deployments and tests
#[derive(Default)]
pub struct MemoryLockManager {
    held: Mutex<HashMap<String, (OwnerToken, Instant)>>,
}

impl MemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockManager for MemoryLockManager {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<OwnerToken>> {
        let mut held = self.held.lock().unwrap_or_else(|p| p.into_inner());
        let now = Instant::now();

        if let Some((_, expires)) = held.get(key) {
            if *expires > now {
                return Ok(None);
            }
        }

        let owner = OwnerToken::generate();
        held.insert(key.to_string(), (owner.clone(), now + ttl));
        Ok(Some(owner))
    }

    async fn release(&self, key: &str, owner: &OwnerToken) -> Result<bool> {
        let mut held = self.held.lock().unwrap_or_else(|p| p.into_inner());
        match held.get(key) {
            Some((holder, _)) if holder == owner => {
                held.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
