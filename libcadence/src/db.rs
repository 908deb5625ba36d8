//! Database access for Cadence
//!
//! All worker processes share one SQLite database. Posts are owned by the
//! content module; the publisher only advances their status through the
//! conditional updates below.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use crate::error::{DbError, ErrorClass, Result};
use crate::types::{Analytics, Platform, PlatformResult, Post, PostStatus, ResultStatus};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// A published platform result whose analytics are due for a refresh
#[derive(Debug, Clone)]
pub struct AnalyticsCandidate {
    pub post_id: String,
    pub platform: Platform,
    pub account_id: String,
    pub platform_post_id: String,
}

/// Counts shown by `cadence-queue stats`
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub draft: i64,
    pub scheduled: i64,
    pub queued: i64,
    pub published: i64,
    pub failed: i64,
    pub due_now: i64,
    pub pending_retries: i64,
    pub open_dead_letters: i64,
}

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

impl Database {
    /// Open (creating if needed) the database at `db_path` and run migrations
    pub async fn new(db_path: &str) -> Result<Self> {
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePool::connect_with(options)
            .await
            .map_err(DbError::SqlxError)?;

        Self::migrate(pool).await
    }

    /// Private in-memory database on a single connection
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(DbError::SqlxError)?
            .foreign_keys(true);

        // Every connection to :memory: is a separate database, so the pool
        // must never open a second one or drop the first.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(DbError::SqlxError)?;

        Self::migrate(pool).await
    }

    async fn migrate(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::MigrationError)?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Insert a post
    pub async fn create_post(&self, post: &Post) -> Result<()> {
        let platforms = serde_json::to_string(&post.platforms).map_err(|e| DbError::Corrupt {
            column: "posts.platforms",
            value: e.to_string(),
        })?;

        sqlx::query(
            r#"
            INSERT INTO posts (id, team_id, content, platforms, created_at, scheduled_at, status, next_attempt_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&post.id)
        .bind(&post.team_id)
        .bind(&post.content)
        .bind(platforms)
        .bind(post.created_at)
        .bind(post.scheduled_at)
        .bind(post.status.as_str())
        .bind(post.next_attempt_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn get_post(&self, post_id: &str) -> Result<Option<Post>> {
        let row = sqlx::query(
            r#"
            SELECT id, team_id, content, platforms, created_at, scheduled_at, status, next_attempt_at
            FROM posts WHERE id = ?
            "#,
        )
        .bind(post_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.map(|r| post_from_row(&r)).transpose()
    }

    /// Posts that are due at `now`, oldest first.
    ///
    /// A post is due when it is `scheduled` with `scheduled_at <= now`, or
    /// `queued` with `next_attempt_at <= now` (an expired lease or a retry
    /// whose time has come).
    pub async fn due_posts(&self, now: i64, limit: u32) -> Result<Vec<Post>> {
        let rows = sqlx::query(
            r#"
            SELECT id, team_id, content, platforms, created_at, scheduled_at, status, next_attempt_at
            FROM posts
            WHERE (status = 'scheduled' AND scheduled_at <= ?1)
               OR (status = 'queued' AND next_attempt_at <= ?1)
            ORDER BY CASE status WHEN 'scheduled' THEN scheduled_at ELSE next_attempt_at END ASC
            LIMIT ?2
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(post_from_row).collect()
    }

    /// Claim a due post by moving it to `queued` with a lease.
    ///
    /// Returns false when the post is no longer due, which is the case when
    /// another worker claimed it first.
    pub async fn claim_post(&self, post_id: &str, now: i64, lease_until: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE posts
            SET status = 'queued', next_attempt_at = ?1
            WHERE id = ?2
              AND ((status = 'scheduled' AND scheduled_at <= ?3)
                OR (status = 'queued' AND next_attempt_at <= ?3))
            "#,
        )
        .bind(lease_until)
        .bind(post_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Move a queued post to its next state. Only applies while the post is
    /// still `queued`.
    pub async fn update_post_status(
        &self,
        post_id: &str,
        status: PostStatus,
        next_attempt_at: Option<i64>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE posts SET status = ?, next_attempt_at = ?
            WHERE id = ? AND status = 'queued'
            "#,
        )
        .bind(status.as_str())
        .bind(next_attempt_at)
        .bind(post_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn get_result(&self, post_id: &str, platform: Platform) -> Result<Option<PlatformResult>> {
        let row = sqlx::query(&format!("{} WHERE post_id = ? AND platform = ?", RESULT_SELECT))
            .bind(post_id)
            .bind(platform.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        row.map(|r| result_from_row(&r)).transpose()
    }

    pub async fn get_results(&self, post_id: &str) -> Result<Vec<PlatformResult>> {
        let rows = sqlx::query(&format!("{} WHERE post_id = ? ORDER BY platform", RESULT_SELECT))
            .bind(post_id)
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        rows.iter().map(result_from_row).collect()
    }

    /// Insert or overwrite the publish outcome of a (post, platform) pair.
    ///
    /// Analytics columns are left untouched.
    pub async fn save_result(&self, result: &PlatformResult) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO post_results
                (post_id, platform, account_id, status, platform_post_id, error_message, error_class, published_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(post_id, platform) DO UPDATE SET
                account_id = excluded.account_id,
                status = excluded.status,
                platform_post_id = excluded.platform_post_id,
                error_message = excluded.error_message,
                error_class = excluded.error_class,
                published_at = excluded.published_at
            "#,
        )
        .bind(&result.post_id)
        .bind(result.platform.as_str())
        .bind(&result.account_id)
        .bind(result.status.as_str())
        .bind(&result.platform_post_id)
        .bind(&result.error_message)
        .bind(result.error_class.map(|c| c.as_str()))
        .bind(result.published_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Published results with no analytics or analytics fetched before
    /// `stale_before`, skipping pairs already tried at or after
    /// `attempted_before`. Least recently tried first, so pairs that keep
    /// failing or being skipped rotate to the back of the batch.
    pub async fn analytics_candidates(
        &self,
        stale_before: i64,
        attempted_before: i64,
        limit: u32,
    ) -> Result<Vec<AnalyticsCandidate>> {
        let rows = sqlx::query(
            r#"
            SELECT post_id, platform, account_id, platform_post_id
            FROM post_results
            WHERE status = 'published'
              AND platform_post_id IS NOT NULL
              AND account_id IS NOT NULL
              AND (analytics_fetched_at IS NULL OR analytics_fetched_at < ?)
              AND (analytics_attempted_at IS NULL OR analytics_attempted_at < ?)
            ORDER BY COALESCE(analytics_attempted_at, 0) ASC, published_at ASC
            LIMIT ?
            "#,
        )
        .bind(stale_before)
        .bind(attempted_before)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter()
            .map(|r| {
                Ok(AnalyticsCandidate {
                    post_id: r.get("post_id"),
                    platform: parse_column("post_results.platform", r.get("platform"))?,
                    account_id: r.get("account_id"),
                    platform_post_id: r.get("platform_post_id"),
                })
            })
            .collect()
    }

    pub async fn store_analytics(
        &self,
        post_id: &str,
        platform: Platform,
        analytics: &Analytics,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE post_results
            SET likes = ?, reposts = ?, replies = ?, impressions = ?,
                analytics_fetched_at = ?, analytics_attempted_at = ?
            WHERE post_id = ? AND platform = ?
            "#,
        )
        .bind(analytics.likes)
        .bind(analytics.reposts)
        .bind(analytics.replies)
        .bind(analytics.impressions)
        .bind(analytics.fetched_at)
        .bind(analytics.fetched_at)
        .bind(post_id)
        .bind(platform.as_str())
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Note an analytics fetch that was skipped or failed at `at`
    pub async fn mark_analytics_attempt(&self, post_id: &str, platform: Platform, at: i64) -> Result<()> {
        sqlx::query(
            "UPDATE post_results SET analytics_attempted_at = ? WHERE post_id = ? AND platform = ?",
        )
        .bind(at)
        .bind(post_id)
        .bind(platform.as_str())
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn queue_stats(&self, now: i64) -> Result<QueueStats> {
        let mut stats = QueueStats::default();

        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM posts GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        for row in rows {
            let n: i64 = row.get("n");
            match parse_column::<PostStatus>("posts.status", row.get("status"))? {
                PostStatus::Draft => stats.draft = n,
                PostStatus::Scheduled => stats.scheduled = n,
                PostStatus::Queued => stats.queued = n,
                PostStatus::Published => stats.published = n,
                PostStatus::Failed => stats.failed = n,
            }
        }

        stats.due_now = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM posts
            WHERE (status = 'scheduled' AND scheduled_at <= ?1)
               OR (status = 'queued' AND next_attempt_at <= ?1)
            "#,
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        stats.pending_retries =
            sqlx::query_scalar("SELECT COUNT(*) FROM publish_attempts WHERE next_retry_at IS NOT NULL")
                .fetch_one(&self.pool)
                .await
                .map_err(DbError::SqlxError)?;

        stats.open_dead_letters =
            sqlx::query_scalar("SELECT COUNT(*) FROM dead_letters WHERE resolved_at IS NULL")
                .fetch_one(&self.pool)
                .await
                .map_err(DbError::SqlxError)?;

        Ok(stats)
    }
}

const RESULT_SELECT: &str = r#"
    SELECT post_id, platform, account_id, status, platform_post_id, error_message, error_class,
           published_at, likes, reposts, replies, impressions, analytics_fetched_at
    FROM post_results
"#;

/// Parse a TEXT column into one of our enums, reporting the column on failure
pub(crate) fn parse_column<T: FromStr>(column: &'static str, value: String) -> Result<T> {
    value
        .parse::<T>()
        .map_err(|_| DbError::Corrupt { column, value }.into())
}

fn post_from_row(r: &sqlx::sqlite::SqliteRow) -> Result<Post> {
    let platforms: String = r.get("platforms");
    let platforms: Vec<Platform> =
        serde_json::from_str(&platforms).map_err(|_| DbError::Corrupt {
            column: "posts.platforms",
            value: platforms.clone(),
        })?;

    Ok(Post {
        id: r.get("id"),
        team_id: r.get("team_id"),
        content: r.get("content"),
        platforms,
        created_at: r.get("created_at"),
        scheduled_at: r.get("scheduled_at"),
        status: parse_column("posts.status", r.get("status"))?,
        next_attempt_at: r.get("next_attempt_at"),
    })
}

fn result_from_row(r: &sqlx::sqlite::SqliteRow) -> Result<PlatformResult> {
    let error_class = r
        .get::<Option<String>, _>("error_class")
        .map(|c| parse_column::<ErrorClass>("post_results.error_class", c))
        .transpose()?;

    let analytics = r
        .get::<Option<i64>, _>("analytics_fetched_at")
        .map(|fetched_at| Analytics {
            likes: r.get::<Option<i64>, _>("likes").unwrap_or(0),
            reposts: r.get::<Option<i64>, _>("reposts").unwrap_or(0),
            replies: r.get::<Option<i64>, _>("replies").unwrap_or(0),
            impressions: r.get("impressions"),
            fetched_at,
        });

    Ok(PlatformResult {
        post_id: r.get("post_id"),
        platform: parse_column("post_results.platform", r.get("platform"))?,
        account_id: r.get("account_id"),
        status: parse_column::<ResultStatus>("post_results.status", r.get("status"))?,
        platform_post_id: r.get("platform_post_id"),
        error_message: r.get("error_message"),
        error_class,
        published_at: r.get("published_at"),
        analytics,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CadenceError;
    use tempfile::TempDir;

    fn scheduled_post(at: i64) -> Post {
        Post::new(
            "team-1".to_string(),
            "Launch day".to_string(),
            vec![Platform::Twitter, Platform::Mastodon],
        )
        .scheduled(at)
    }

    fn published(post_id: &str, platform: Platform, at: i64) -> PlatformResult {
        PlatformResult {
            post_id: post_id.to_string(),
            platform,
            account_id: Some("acct-1".to_string()),
            status: ResultStatus::Published,
            platform_post_id: Some(format!("{}-remote", platform)),
            error_message: None,
            error_class: None,
            published_at: Some(at),
            analytics: None,
        }
    }

    #[tokio::test]
    async fn test_new_creates_parent_directories() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("nested").join("dir").join("cadence.db");

        let db = Database::new(db_path.to_str().unwrap()).await.unwrap();
        assert!(db_path.exists());

        let post = scheduled_post(100);
        db.create_post(&post).await.unwrap();
        assert!(db.get_post(&post.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_invalid_path_is_database_error() {
        let result = Database::new("/dev/null/cadence.db").await;
        assert!(matches!(result, Err(CadenceError::Database(_))));
    }

    #[tokio::test]
    async fn test_post_round_trip() {
        let db = Database::in_memory().await.unwrap();
        let post = scheduled_post(1_700_000_000);
        db.create_post(&post).await.unwrap();

        let loaded = db.get_post(&post.id).await.unwrap().unwrap();
        assert_eq!(loaded.team_id, "team-1");
        assert_eq!(loaded.platforms, vec![Platform::Twitter, Platform::Mastodon]);
        assert_eq!(loaded.status, PostStatus::Scheduled);
        assert_eq!(loaded.scheduled_at, Some(1_700_000_000));

        assert!(db.get_post("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_due_posts_selects_scheduled_and_retryable() {
        let db = Database::in_memory().await.unwrap();
        let now = 1_000;

        let due = scheduled_post(now - 10);
        let future = scheduled_post(now + 10);
        let draft = Post::new("team-1".to_string(), "draft".to_string(), vec![]);
        let mut retry = scheduled_post(now - 500);
        retry.status = PostStatus::Queued;
        retry.next_attempt_at = Some(now);
        let mut leased = scheduled_post(now - 500);
        leased.status = PostStatus::Queued;
        leased.next_attempt_at = Some(now + 300);

        for post in [&due, &future, &draft, &retry, &leased] {
            db.create_post(post).await.unwrap();
        }

        let ids: Vec<String> = db
            .due_posts(now, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect();

        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&due.id));
        assert!(ids.contains(&retry.id));
    }

    #[tokio::test]
    async fn test_due_posts_respects_limit() {
        let db = Database::in_memory().await.unwrap();
        for i in 0..5 {
            db.create_post(&scheduled_post(i)).await.unwrap();
        }

        let posts = db.due_posts(100, 3).await.unwrap();
        assert_eq!(posts.len(), 3);
        assert_eq!(posts[0].scheduled_at, Some(0));
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let db = Database::in_memory().await.unwrap();
        let post = scheduled_post(50);
        db.create_post(&post).await.unwrap();

        assert!(db.claim_post(&post.id, 100, 400).await.unwrap());
        assert!(!db.claim_post(&post.id, 100, 400).await.unwrap());

        let loaded = db.get_post(&post.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, PostStatus::Queued);
        assert_eq!(loaded.next_attempt_at, Some(400));

        // lease expired
        assert!(db.claim_post(&post.id, 400, 700).await.unwrap());
    }

    #[tokio::test]
    async fn test_update_post_status_only_from_queued() {
        let db = Database::in_memory().await.unwrap();
        let post = scheduled_post(50);
        db.create_post(&post).await.unwrap();

        assert!(!db
            .update_post_status(&post.id, PostStatus::Published, None)
            .await
            .unwrap());

        db.claim_post(&post.id, 100, 400).await.unwrap();
        assert!(db
            .update_post_status(&post.id, PostStatus::Published, None)
            .await
            .unwrap());

        let loaded = db.get_post(&post.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, PostStatus::Published);
        assert_eq!(loaded.next_attempt_at, None);
    }

    #[tokio::test]
    async fn test_save_result_upserts() {
        let db = Database::in_memory().await.unwrap();
        let post = scheduled_post(50);
        db.create_post(&post).await.unwrap();

        let mut result = PlatformResult {
            post_id: post.id.clone(),
            platform: Platform::Twitter,
            account_id: Some("acct-1".to_string()),
            status: ResultStatus::Pending,
            platform_post_id: None,
            error_message: Some("connection reset".to_string()),
            error_class: Some(ErrorClass::Transient),
            published_at: None,
            analytics: None,
        };
        db.save_result(&result).await.unwrap();

        result.status = ResultStatus::Published;
        result.platform_post_id = Some("1789".to_string());
        result.error_message = None;
        result.error_class = None;
        result.published_at = Some(200);
        db.save_result(&result).await.unwrap();

        let results = db.get_results(&post.id).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, ResultStatus::Published);
        assert_eq!(results[0].platform_post_id.as_deref(), Some("1789"));
        assert_eq!(results[0].error_class, None);
    }

    #[tokio::test]
    async fn test_result_requires_existing_post() {
        let db = Database::in_memory().await.unwrap();
        let result = published("no-such-post", Platform::Twitter, 10);

        let err = db.save_result(&result).await.unwrap_err();
        assert!(matches!(err, CadenceError::Database(DbError::SqlxError(_))));
    }

    #[tokio::test]
    async fn test_analytics_candidates_and_store() {
        let db = Database::in_memory().await.unwrap();
        let post = scheduled_post(50);
        db.create_post(&post).await.unwrap();
        db.save_result(&published(&post.id, Platform::Twitter, 100)).await.unwrap();
        db.save_result(&published(&post.id, Platform::Mastodon, 100)).await.unwrap();

        let candidates = db.analytics_candidates(1_000, 1_000, 10).await.unwrap();
        assert_eq!(candidates.len(), 2);

        let analytics = Analytics {
            likes: 7,
            reposts: 2,
            replies: 1,
            impressions: Some(300),
            fetched_at: 900,
        };
        db.store_analytics(&post.id, Platform::Twitter, &analytics).await.unwrap();

        // fetched at 900: stale relative to 1000, fresh relative to 800
        assert_eq!(db.analytics_candidates(1_000, 1_000, 10).await.unwrap().len(), 2);
        let fresh_cutoff = db.analytics_candidates(800, 800, 10).await.unwrap();
        assert_eq!(fresh_cutoff.len(), 1);
        assert_eq!(fresh_cutoff[0].platform, Platform::Mastodon);

        let stored = db.get_result(&post.id, Platform::Twitter).await.unwrap().unwrap();
        assert_eq!(stored.analytics, Some(analytics));
    }

    #[tokio::test]
    async fn test_queue_stats() {
        let db = Database::in_memory().await.unwrap();
        db.create_post(&scheduled_post(10)).await.unwrap();
        db.create_post(&scheduled_post(10_000)).await.unwrap();
        db.create_post(&Post::new("t".to_string(), "d".to_string(), vec![]))
            .await
            .unwrap();

        let stats = db.queue_stats(100).await.unwrap();
        assert_eq!(stats.scheduled, 2);
        assert_eq!(stats.draft, 1);
        assert_eq!(stats.due_now, 1);
        assert_eq!(stats.pending_retries, 0);
        assert_eq!(stats.open_dead_letters, 0);
    }

    #[tokio::test]
    async fn test_corrupt_status_is_reported() {
        let db = Database::in_memory().await.unwrap();
        let post = scheduled_post(10);
        db.create_post(&post).await.unwrap();
        sqlx::query("UPDATE posts SET platforms = 'not json' WHERE id = ?")
            .bind(&post.id)
            .execute(db.pool())
            .await
            .unwrap();

        let err = db.get_post(&post.id).await.unwrap_err();
        assert!(err.to_string().contains("posts.platforms"));
    }
}
