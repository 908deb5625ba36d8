//! Retry bookkeeping and dead-letter quarantine
//!
//! Attempts are tracked per (post, platform) in `publish_attempts`. Each
//! retryable failure either schedules the next attempt or, once the attempt
//! ceiling is reached, moves the pair to `dead_letters` for an operator.

use std::time::Duration;

use sqlx::Row;
use uuid::Uuid;

use crate::config::SchedulingConfig;
use crate::db::{parse_column, Database};
use crate::error::{CadenceError, DbError, ErrorClass, PlatformError, Result};
use crate::types::{DeadLetterEntry, Platform, PublishAttempt};

/// Backoff schedule and attempt ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Used for rate-limited failures that carry no cool-down of their own
    pub rate_limit_cooldown: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &SchedulingConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_secs(config.base_delay_secs),
            max_delay: Duration::from_secs(config.max_delay_secs),
            rate_limit_cooldown: Duration::from_secs(config.rate_limit_cooldown_secs),
        }
    }

    /// Delay before retrying after the `attempt`-th failure:
    /// `base * 2^(attempt - 1)`, capped at `max_delay`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        if exponent >= u32::BITS {
            return self.max_delay;
        }
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Cool-down for a rate-limited failure
    pub fn cooldown(&self, retry_after: Option<Duration>) -> Duration {
        retry_after.unwrap_or(self.rate_limit_cooldown)
    }

    /// Seconds until the next attempt for a retryable error
    fn wait_for(&self, attempt: u32, error: &PlatformError) -> Duration {
        match error.class() {
            ErrorClass::RateLimited => self.cooldown(error.retry_after()),
            _ => self.delay_for(attempt),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&SchedulingConfig::default())
    }
}

/// What happens after a retryable failure
#[derive(Debug, Clone)]
pub enum RetryDecision {
    /// Try again at this Unix timestamp
    RetryAt(i64),
    /// The ceiling was reached; the pair is quarantined
    DeadLettered(DeadLetterEntry),
}

#[derive(Clone)]
pub struct RetryCoordinator {
    db: Database,
    policy: RetryPolicy,
}

impl RetryCoordinator {
    pub fn new(db: Database, policy: RetryPolicy) -> Self {
        Self { db, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Count a transient or rate-limited failure and decide what comes next
    pub async fn record_failure(
        &self,
        post_id: &str,
        platform: Platform,
        account_id: Option<&str>,
        error: &PlatformError,
        now: i64,
    ) -> Result<RetryDecision> {
        let class = error.class();
        let message = error.to_string();

        let mut tx = self.db.pool().begin().await.map_err(DbError::SqlxError)?;

        let attempts: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO publish_attempts
                (post_id, platform, account_id, attempts, last_error_class, last_error, next_retry_at)
            VALUES (?, ?, ?, 1, ?, ?, NULL)
            ON CONFLICT(post_id, platform) DO UPDATE SET
                attempts = publish_attempts.attempts + 1,
                account_id = excluded.account_id,
                last_error_class = excluded.last_error_class,
                last_error = excluded.last_error
            RETURNING attempts
            "#,
        )
        .bind(post_id)
        .bind(platform.as_str())
        .bind(account_id)
        .bind(class.as_str())
        .bind(&message)
        .fetch_one(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;
        let attempts = attempts.max(0) as u32;

        if attempts >= self.policy.max_attempts {
            let entry = DeadLetterEntry {
                id: Uuid::new_v4().to_string(),
                post_id: post_id.to_string(),
                platform,
                account_id: account_id.map(str::to_string),
                attempts,
                last_error: message,
                error_class: class.as_str().to_string(),
                created_at: now,
                resolved_at: None,
            };

            sqlx::query(
                r#"
                INSERT INTO dead_letters
                    (id, post_id, platform, account_id, attempts, last_error, error_class, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&entry.id)
            .bind(&entry.post_id)
            .bind(platform.as_str())
            .bind(&entry.account_id)
            .bind(entry.attempts as i64)
            .bind(&entry.last_error)
            .bind(&entry.error_class)
            .bind(entry.created_at)
            .execute(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;

            sqlx::query("DELETE FROM publish_attempts WHERE post_id = ? AND platform = ?")
                .bind(post_id)
                .bind(platform.as_str())
                .execute(&mut *tx)
                .await
                .map_err(DbError::SqlxError)?;

            tx.commit().await.map_err(DbError::SqlxError)?;

            tracing::error!(
                dead_letter_id = %entry.id,
                post_id = %post_id,
                platform = %platform,
                account_id = ?account_id,
                attempts = attempts,
                error_class = %class,
                error = %entry.last_error,
                "Publish dead-lettered after exhausting retries"
            );
            return Ok(RetryDecision::DeadLettered(entry));
        }

        let wait = self.policy.wait_for(attempts, error);
        let retry_at = now.saturating_add(wait.as_secs() as i64);

        sqlx::query(
            "UPDATE publish_attempts SET next_retry_at = ? WHERE post_id = ? AND platform = ?",
        )
        .bind(retry_at)
        .bind(post_id)
        .bind(platform.as_str())
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        tx.commit().await.map_err(DbError::SqlxError)?;

        tracing::info!(
            post_id = %post_id,
            platform = %platform,
            attempt = attempts,
            max_attempts = self.policy.max_attempts,
            error_class = %class,
            retry_in_secs = wait.as_secs(),
            "Publish failed, retry scheduled"
        );
        Ok(RetryDecision::RetryAt(retry_at))
    }

    /// Push the next attempt of a pair back to `until` without counting a
    /// failure, e.g. while its account cools down from a rate limit
    pub async fn defer(
        &self,
        post_id: &str,
        platform: Platform,
        account_id: Option<&str>,
        until: i64,
        reason: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO publish_attempts
                (post_id, platform, account_id, attempts, last_error_class, last_error, next_retry_at)
            VALUES (?, ?, ?, 0, 'rate_limited', ?, ?)
            ON CONFLICT(post_id, platform) DO UPDATE SET
                account_id = excluded.account_id,
                last_error_class = 'rate_limited',
                last_error = excluded.last_error,
                next_retry_at = excluded.next_retry_at
            "#,
        )
        .bind(post_id)
        .bind(platform.as_str())
        .bind(account_id)
        .bind(reason)
        .bind(until)
        .execute(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;
        Ok(())
    }

    /// Count a permanent failure. Nothing is scheduled; returns the attempt
    /// count.
    pub async fn record_permanent(
        &self,
        post_id: &str,
        platform: Platform,
        account_id: Option<&str>,
        message: &str,
    ) -> Result<u32> {
        let attempts: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO publish_attempts
                (post_id, platform, account_id, attempts, last_error_class, last_error, next_retry_at)
            VALUES (?, ?, ?, 1, 'permanent', ?, NULL)
            ON CONFLICT(post_id, platform) DO UPDATE SET
                attempts = publish_attempts.attempts + 1,
                account_id = excluded.account_id,
                last_error_class = 'permanent',
                last_error = excluded.last_error,
                next_retry_at = NULL
            RETURNING attempts
            "#,
        )
        .bind(post_id)
        .bind(platform.as_str())
        .bind(account_id)
        .bind(message)
        .fetch_one(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        Ok(attempts.max(0) as u32)
    }

    /// Forget the attempts of a pair that just succeeded
    pub async fn record_success(&self, post_id: &str, platform: Platform) -> Result<()> {
        sqlx::query("DELETE FROM publish_attempts WHERE post_id = ? AND platform = ?")
            .bind(post_id)
            .bind(platform.as_str())
            .execute(self.db.pool())
            .await
            .map_err(DbError::SqlxError)?;
        Ok(())
    }

    pub async fn attempt(&self, post_id: &str, platform: Platform) -> Result<Option<PublishAttempt>> {
        let row = sqlx::query(
            r#"
            SELECT post_id, platform, account_id, attempts, last_error_class, last_error, next_retry_at
            FROM publish_attempts WHERE post_id = ? AND platform = ?
            "#,
        )
        .bind(post_id)
        .bind(platform.as_str())
        .fetch_optional(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        row.map(|r| {
            Ok(PublishAttempt {
                post_id: r.get("post_id"),
                platform: parse_column("publish_attempts.platform", r.get("platform"))?,
                account_id: r.get("account_id"),
                attempts: r.get::<i64, _>("attempts").max(0) as u32,
                last_error_class: parse_column(
                    "publish_attempts.last_error_class",
                    r.get("last_error_class"),
                )?,
                last_error: r.get("last_error"),
                next_retry_at: r.get("next_retry_at"),
            })
        })
        .transpose()
    }

    /// Dead letters, newest first. Resolved entries only with
    /// `include_resolved`.
    pub async fn list_dead_letters(&self, include_resolved: bool) -> Result<Vec<DeadLetterEntry>> {
        let sql = if include_resolved {
            format!("{} ORDER BY created_at DESC", DEAD_LETTER_SELECT)
        } else {
            format!(
                "{} WHERE resolved_at IS NULL ORDER BY created_at DESC",
                DEAD_LETTER_SELECT
            )
        };

        let rows = sqlx::query(&sql)
            .fetch_all(self.db.pool())
            .await
            .map_err(DbError::SqlxError)?;

        rows.iter().map(dead_letter_from_row).collect()
    }

    pub async fn get_dead_letter(&self, id: &str) -> Result<Option<DeadLetterEntry>> {
        let row = sqlx::query(&format!("{} WHERE id = ?", DEAD_LETTER_SELECT))
            .bind(id)
            .fetch_optional(self.db.pool())
            .await
            .map_err(DbError::SqlxError)?;

        row.map(|r| dead_letter_from_row(&r)).transpose()
    }

    /// Operator action: give a dead-lettered pair a fresh set of attempts.
    ///
    /// Marks the entry resolved, clears the attempt counter, resets the
    /// platform result to pending and puts the post back in the queue, due
    /// at `now`. All four writes commit together; if the post can no longer
    /// be queued nothing changes.
    pub async fn requeue(&self, dead_letter_id: &str, now: i64) -> Result<DeadLetterEntry> {
        let mut entry = self.get_dead_letter(dead_letter_id).await?.ok_or_else(|| {
            CadenceError::InvalidInput(format!("no dead letter with id {}", dead_letter_id))
        })?;

        let mut tx = self.db.pool().begin().await.map_err(DbError::SqlxError)?;

        let resolved = sqlx::query(
            "UPDATE dead_letters SET resolved_at = ? WHERE id = ? AND resolved_at IS NULL",
        )
        .bind(now)
        .bind(dead_letter_id)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        if resolved.rows_affected() == 0 {
            return Err(CadenceError::InvalidInput(format!(
                "dead letter {} is already resolved",
                dead_letter_id
            )));
        }
        entry.resolved_at = Some(now);

        sqlx::query("DELETE FROM publish_attempts WHERE post_id = ? AND platform = ?")
            .bind(&entry.post_id)
            .bind(entry.platform.as_str())
            .execute(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;

        sqlx::query(
            r#"
            UPDATE post_results
            SET status = 'pending', error_message = NULL, error_class = NULL
            WHERE post_id = ? AND platform = ? AND status != 'published'
            "#,
        )
        .bind(&entry.post_id)
        .bind(entry.platform.as_str())
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        let queued = sqlx::query(
            r#"
            UPDATE posts SET status = 'queued', next_attempt_at = ?
            WHERE id = ? AND status IN ('queued', 'published', 'failed')
            "#,
        )
        .bind(now)
        .bind(&entry.post_id)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        if queued.rows_affected() == 0 {
            // dropping the transaction rolls it back
            return Err(CadenceError::InvalidInput(format!(
                "post {} can no longer be requeued",
                entry.post_id
            )));
        }

        tx.commit().await.map_err(DbError::SqlxError)?;

        tracing::info!(
            dead_letter_id = %entry.id,
            post_id = %entry.post_id,
            platform = %entry.platform,
            "Dead letter requeued"
        );
        Ok(entry)
    }
}

const DEAD_LETTER_SELECT: &str = r#"
    SELECT id, post_id, platform, account_id, attempts, last_error, error_class, created_at, resolved_at
    FROM dead_letters
"#;

fn dead_letter_from_row(r: &sqlx::sqlite::SqliteRow) -> Result<DeadLetterEntry> {
    Ok(DeadLetterEntry {
        id: r.get("id"),
        post_id: r.get("post_id"),
        platform: parse_column("dead_letters.platform", r.get("platform"))?,
        account_id: r.get("account_id"),
        attempts: r.get::<i64, _>("attempts").max(0) as u32,
        last_error: r.get("last_error"),
        error_class: r.get("error_class"),
        created_at: r.get("created_at"),
        resolved_at: r.get("resolved_at"),
    })
}
