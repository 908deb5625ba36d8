//! Publishing one due post to each of its target platforms
//!
//! A dispatch claims the post, then works through every target platform that
//! has no terminal result yet: resolve the team's account, take the
//! `(post, account)` lock, re-check, gate on account state, refresh the token
//! if needed, publish, and record the outcome. Finally the post status is
//! derived from the platform results.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;

use crate::accounts::AccountRepository;
use crate::db::Database;
use crate::error::{AccountError, CadenceError, ErrorClass, PlatformError, Result};
use crate::lock::{publish_key, LockManager};
use crate::platforms::Adapters;
use crate::refresh::TokenRefresher;
use crate::retry::{RetryCoordinator, RetryDecision};
use crate::types::{
    AccountStatus, Platform, PlatformResult, Post, PostStatus, PublishReceipt, ResultStatus,
    SocialAccount,
};

const NO_ACCOUNT: &str = "no connected account";
const RECONNECT_REQUIRED: &str = "reconnect required";

/// What happened to one (post, platform) pair during a dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformOutcome {
    Published,
    Failed,
    RetryScheduled(i64),
    DeadLettered,
    /// Already terminal, not yet due, or locked by another worker
    Skipped,
    /// Internal error (database, vault); retried after the lease
    Errored,
}

/// Summary of one dispatch
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub post_id: String,
    /// False when another worker had already claimed the post
    pub claimed: bool,
    pub platforms: Vec<(Platform, PlatformOutcome)>,
    pub post_status: PostStatus,
    pub next_attempt_at: Option<i64>,
}

impl DispatchOutcome {
    pub fn count(&self, outcome: &PlatformOutcome) -> usize {
        self.platforms.iter().filter(|(_, o)| o == outcome).count()
    }
}

pub struct Dispatcher {
    db: Database,
    accounts: AccountRepository,
    adapters: Adapters,
    locks: Arc<dyn LockManager>,
    retry: RetryCoordinator,
    refresher: Arc<TokenRefresher>,
    lock_ttl: Duration,
}

impl Dispatcher {
    pub fn new(
        db: Database,
        accounts: AccountRepository,
        adapters: Adapters,
        locks: Arc<dyn LockManager>,
        retry: RetryCoordinator,
        refresher: Arc<TokenRefresher>,
        lock_ttl: Duration,
    ) -> Self {
        Self {
            db,
            accounts,
            adapters,
            locks,
            retry,
            refresher,
            lock_ttl,
        }
    }

    pub async fn dispatch(&self, post: &Post) -> Result<DispatchOutcome> {
        self.dispatch_at(post, chrono::Utc::now().timestamp()).await
    }

    /// Dispatch `post` as of `now` (Unix seconds)
    pub async fn dispatch_at(&self, post: &Post, now: i64) -> Result<DispatchOutcome> {
        let lease_until = now.saturating_add(self.lock_ttl.as_secs() as i64);

        if !self.db.claim_post(&post.id, now, lease_until).await? {
            tracing::debug!(post_id = %post.id, "Post already claimed by another worker");
            return Ok(DispatchOutcome {
                post_id: post.id.clone(),
                claimed: false,
                platforms: Vec::new(),
                post_status: post.status,
                next_attempt_at: post.next_attempt_at,
            });
        }

        let mut seen = HashSet::new();
        let targets: Vec<Platform> = post
            .platforms
            .iter()
            .copied()
            .filter(|p| seen.insert(*p))
            .collect();

        let outcomes = join_all(targets.iter().map(|&platform| async move {
            let outcome = match self.dispatch_platform(post, platform, now).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(
                        post_id = %post.id,
                        platform = %platform,
                        error = %e,
                        "Dispatch failed"
                    );
                    PlatformOutcome::Errored
                }
            };
            (platform, outcome)
        }))
        .await;

        let (post_status, next_attempt_at) = self.aggregate(post, &targets, lease_until).await?;

        tracing::info!(
            post_id = %post.id,
            status = post_status.as_str(),
            next_attempt_at = ?next_attempt_at,
            "Dispatched post"
        );

        Ok(DispatchOutcome {
            post_id: post.id.clone(),
            claimed: true,
            platforms: outcomes,
            post_status,
            next_attempt_at,
        })
    }

    async fn dispatch_platform(
        &self,
        post: &Post,
        platform: Platform,
        now: i64,
    ) -> Result<PlatformOutcome> {
        if let Some(existing) = self.db.get_result(&post.id, platform).await? {
            if existing.status.is_terminal() {
                return Ok(PlatformOutcome::Skipped);
            }
        }

        let account = match self.accounts.find_for_publish(&post.team_id, platform).await? {
            Some(account) => account,
            None => return self.fail(post, platform, None, NO_ACCOUNT).await,
        };

        let key = publish_key(&post.id, &account.id);
        let owner = match self.locks.try_acquire(&key, self.lock_ttl).await? {
            Some(owner) => owner,
            None => {
                tracing::debug!(post_id = %post.id, account_id = %account.id, "Publish lock held, skipping");
                return Ok(PlatformOutcome::Skipped);
            }
        };

        let outcome = self.publish_locked(post, platform, account, now).await;

        if let Err(e) = self.locks.release(&key, &owner).await {
            tracing::warn!(key = %key, error = %e, "Failed to release publish lock");
        }
        outcome
    }

    async fn publish_locked(
        &self,
        post: &Post,
        platform: Platform,
        mut account: SocialAccount,
        now: i64,
    ) -> Result<PlatformOutcome> {
        // Another worker may have finished or rescheduled this pair while we
        // waited for the lock
        if let Some(existing) = self.db.get_result(&post.id, platform).await? {
            if existing.status.is_terminal() {
                return Ok(PlatformOutcome::Skipped);
            }
        }
        if let Some(attempt) = self.retry.attempt(&post.id, platform).await? {
            if matches!(attempt.next_retry_at, Some(at) if at > now) {
                return Ok(PlatformOutcome::Skipped);
            }
        }

        let account_id = account.id.clone();

        match account.status {
            AccountStatus::Revoked | AccountStatus::Expired => {
                return self
                    .fail(post, platform, Some(&account_id), RECONNECT_REQUIRED)
                    .await;
            }
            AccountStatus::RateLimited => match account.rate_limited_until {
                Some(until) if until > now => {
                    let reason = format!("account rate limited until {}", until);
                    self.retry
                        .defer(&post.id, platform, Some(&account_id), until, &reason)
                        .await?;
                    self.save_pending(post, platform, &account_id, &reason, ErrorClass::RateLimited)
                        .await?;
                    return Ok(PlatformOutcome::RetryScheduled(until));
                }
                _ => {
                    self.accounts
                        .set_status(&account_id, AccountStatus::RateLimited, AccountStatus::Active, None)
                        .await?;
                    account.status = AccountStatus::Active;
                }
            },
            AccountStatus::Active => {}
        }

        let account = match self.refresher.ensure_fresh(account, now).await {
            Ok(account) => account,
            Err(CadenceError::Platform(e)) if e.class() == ErrorClass::Permanent => {
                let message = format!("token refresh failed: {}", e);
                return self.fail(post, platform, Some(&account_id), &message).await;
            }
            Err(CadenceError::Platform(e)) => {
                return self.retry_failure(post, platform, &account_id, &e, now).await;
            }
            Err(CadenceError::Account(AccountError::Disconnected(_))) => {
                return self
                    .fail(post, platform, Some(&account_id), RECONNECT_REQUIRED)
                    .await;
            }
            Err(e) => return Err(e),
        };

        match self.publish(&account, &post.content).await {
            Ok(Ok(receipt)) => self.record_published(post, &account, receipt, now).await,
            Ok(Err(e)) if e.class() == ErrorClass::Permanent => {
                if e.is_auth_failure() {
                    self.accounts
                        .set_status(&account_id, account.status, AccountStatus::Revoked, None)
                        .await?;
                }
                self.fail(post, platform, Some(&account_id), &e.to_string()).await
            }
            Ok(Err(e)) => {
                if e.class() == ErrorClass::RateLimited {
                    let until = now
                        .saturating_add(self.retry.policy().cooldown(e.retry_after()).as_secs() as i64);
                    self.accounts
                        .set_status(&account_id, account.status, AccountStatus::RateLimited, Some(until))
                        .await?;
                }
                self.retry_failure(post, platform, &account_id, &e, now).await
            }
            Err(CadenceError::Account(AccountError::Disconnected(_))) => {
                self.fail(post, platform, Some(&account_id), RECONNECT_REQUIRED).await
            }
            Err(e) => Err(e),
        }
    }

    /// Publish with the account's credentials. The outer result carries
    /// local failures, the inner one the platform's answer.
    async fn publish(
        &self,
        account: &SocialAccount,
        content: &str,
    ) -> Result<std::result::Result<PublishReceipt, PlatformError>> {
        let adapter = match self.adapters.require(account.platform) {
            Ok(adapter) => Arc::clone(adapter),
            Err(e) => return Ok(Err(e)),
        };

        self.accounts
            .with_credentials(account, move |credentials| async move {
                adapter.publish_post(&credentials, content).await
            })
            .await
    }

    async fn record_published(
        &self,
        post: &Post,
        account: &SocialAccount,
        receipt: PublishReceipt,
        now: i64,
    ) -> Result<PlatformOutcome> {
        self.db
            .save_result(&PlatformResult {
                post_id: post.id.clone(),
                platform: account.platform,
                account_id: Some(account.id.clone()),
                status: ResultStatus::Published,
                platform_post_id: Some(receipt.platform_post_id.clone()),
                error_message: None,
                error_class: None,
                published_at: Some(now),
                analytics: None,
            })
            .await?;
        self.retry.record_success(&post.id, account.platform).await?;
        self.accounts.touch_synced(&account.id, now).await?;

        tracing::info!(
            post_id = %post.id,
            platform = %account.platform,
            account_id = %account.id,
            platform_post_id = %receipt.platform_post_id,
            url = ?receipt.url,
            "Published"
        );
        Ok(PlatformOutcome::Published)
    }

    async fn retry_failure(
        &self,
        post: &Post,
        platform: Platform,
        account_id: &str,
        error: &PlatformError,
        now: i64,
    ) -> Result<PlatformOutcome> {
        match self
            .retry
            .record_failure(&post.id, platform, Some(account_id), error, now)
            .await?
        {
            RetryDecision::RetryAt(at) => {
                self.save_pending(post, platform, account_id, &error.to_string(), error.class())
                    .await?;
                Ok(PlatformOutcome::RetryScheduled(at))
            }
            RetryDecision::DeadLettered(entry) => {
                self.db
                    .save_result(&PlatformResult {
                        post_id: post.id.clone(),
                        platform,
                        account_id: Some(account_id.to_string()),
                        status: ResultStatus::Failed,
                        platform_post_id: None,
                        error_message: Some(format!("dead-lettered ({})", entry.id)),
                        error_class: Some(error.class()),
                        published_at: None,
                        analytics: None,
                    })
                    .await?;
                Ok(PlatformOutcome::DeadLettered)
            }
        }
    }

    async fn save_pending(
        &self,
        post: &Post,
        platform: Platform,
        account_id: &str,
        message: &str,
        class: ErrorClass,
    ) -> Result<()> {
        self.db
            .save_result(&PlatformResult {
                post_id: post.id.clone(),
                platform,
                account_id: Some(account_id.to_string()),
                status: ResultStatus::Pending,
                platform_post_id: None,
                error_message: Some(message.to_string()),
                error_class: Some(class),
                published_at: None,
                analytics: None,
            })
            .await
    }

    /// Terminal failure of one pair
    async fn fail(
        &self,
        post: &Post,
        platform: Platform,
        account_id: Option<&str>,
        message: &str,
    ) -> Result<PlatformOutcome> {
        self.retry
            .record_permanent(&post.id, platform, account_id, message)
            .await?;
        self.db
            .save_result(&PlatformResult {
                post_id: post.id.clone(),
                platform,
                account_id: account_id.map(str::to_string),
                status: ResultStatus::Failed,
                platform_post_id: None,
                error_message: Some(message.to_string()),
                error_class: Some(ErrorClass::Permanent),
                published_at: None,
                analytics: None,
            })
            .await?;

        tracing::warn!(
            post_id = %post.id,
            platform = %platform,
            account_id = ?account_id,
            reason = %message,
            "Publish failed permanently"
        );
        Ok(PlatformOutcome::Failed)
    }

    /// Derive the post status from its platform results and store it
    async fn aggregate(
        &self,
        post: &Post,
        targets: &[Platform],
        lease_until: i64,
    ) -> Result<(PostStatus, Option<i64>)> {
        let results = self.db.get_results(&post.id).await?;

        let mut pending = Vec::new();
        let mut published = 0;
        for platform in targets {
            match results.iter().find(|r| r.platform == *platform) {
                Some(r) if r.status == ResultStatus::Published => published += 1,
                Some(r) if r.status == ResultStatus::Failed => {}
                _ => pending.push(*platform),
            }
        }

        let (status, next_attempt_at) = if pending.is_empty() {
            let status = if published > 0 {
                PostStatus::Published
            } else {
                PostStatus::Failed
            };
            (status, None)
        } else {
            let mut next = None;
            for platform in pending {
                let retry_at = self
                    .retry
                    .attempt(&post.id, platform)
                    .await?
                    .and_then(|a| a.next_retry_at)
                    .unwrap_or(lease_until);
                next = Some(next.map_or(retry_at, |n: i64| n.min(retry_at)));
            }
            (PostStatus::Queued, next)
        };

        if !self
            .db
            .update_post_status(&post.id, status, next_attempt_at)
            .await?
        {
            tracing::warn!(post_id = %post.id, "Post left the queue during dispatch");
        }
        Ok((status, next_attempt_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::MemoryLockManager;
    use crate::platforms::mock::MockAdapter;
    use crate::retry::RetryPolicy;
    use crate::types::Token;
    use crate::vault::Vault;
    use secrecy::SecretString;

    const NOW: i64 = 1_800_000_000;

    struct Fixture {
        db: Database,
        accounts: AccountRepository,
        retry: RetryCoordinator,
        twitter: MockAdapter,
        mastodon: MockAdapter,
        dispatcher: Dispatcher,
    }

    async fn fixture() -> Fixture {
        let db = Database::in_memory().await.unwrap();
        let vault = Vault::from_base64_key(&Vault::generate_key()).unwrap();
        let accounts = AccountRepository::new(db.clone(), Arc::new(vault));
        let twitter = MockAdapter::new(Platform::Twitter);
        let mastodon = MockAdapter::new(Platform::Mastodon);
        let adapters = Adapters::new()
            .with(Arc::new(twitter.clone()))
            .with(Arc::new(mastodon.clone()));
        let locks: Arc<dyn LockManager> = Arc::new(MemoryLockManager::new());
        let retry = RetryCoordinator::new(
            db.clone(),
            RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_secs(30),
                max_delay: Duration::from_secs(3600),
                rate_limit_cooldown: Duration::from_secs(900),
            },
        );
        let refresher = Arc::new(TokenRefresher::new(
            accounts.clone(),
            adapters.clone(),
            Arc::clone(&locks),
            Duration::from_secs(300),
            Duration::from_secs(300),
        ));
        let dispatcher = Dispatcher::new(
            db.clone(),
            accounts.clone(),
            adapters,
            locks,
            retry.clone(),
            refresher,
            Duration::from_secs(300),
        );
        Fixture {
            db,
            accounts,
            retry,
            twitter,
            mastodon,
            dispatcher,
        }
    }

    async fn connect(f: &Fixture, platform: Platform) -> SocialAccount {
        let token = Token {
            access_token: SecretString::from(format!("{}-access", platform)),
            refresh_token: Some(SecretString::from("refresh".to_string())),
            expires_at: None,
            platform_user_id: format!("{}-user", platform),
            handle: None,
        };
        f.accounts.connect("team", platform, &token).await.unwrap()
    }

    async fn due_post(f: &Fixture, platforms: Vec<Platform>) -> Post {
        let post = Post::new("team".to_string(), "Ship it".to_string(), platforms).scheduled(NOW - 5);
        f.db.create_post(&post).await.unwrap();
        post
    }

    #[tokio::test]
    async fn test_publishes_to_every_platform() {
        let f = fixture().await;
        connect(&f, Platform::Twitter).await;
        connect(&f, Platform::Mastodon).await;
        let post = due_post(&f, vec![Platform::Twitter, Platform::Mastodon]).await;

        let outcome = f.dispatcher.dispatch_at(&post, NOW).await.unwrap();
        assert!(outcome.claimed);
        assert_eq!(outcome.count(&PlatformOutcome::Published), 2);
        assert_eq!(outcome.post_status, PostStatus::Published);

        let stored = f.db.get_post(&post.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PostStatus::Published);
        assert_eq!(stored.next_attempt_at, None);

        let result = f.db.get_result(&post.id, Platform::Twitter).await.unwrap().unwrap();
        assert_eq!(result.platform_post_id.as_deref(), Some("twitter-1"));
        assert_eq!(result.published_at, Some(NOW));
        assert_eq!(f.twitter.published(), vec!["Ship it".to_string()]);
        assert_eq!(f.twitter.tokens_seen(), vec!["twitter-access".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_account_fails_that_platform_only() {
        let f = fixture().await;
        connect(&f, Platform::Twitter).await;
        let post = due_post(&f, vec![Platform::Twitter, Platform::Mastodon]).await;

        let outcome = f.dispatcher.dispatch_at(&post, NOW).await.unwrap();
        assert_eq!(outcome.post_status, PostStatus::Published);

        let result = f.db.get_result(&post.id, Platform::Mastodon).await.unwrap().unwrap();
        assert_eq!(result.status, ResultStatus::Failed);
        assert_eq!(result.error_message.as_deref(), Some(NO_ACCOUNT));
        assert_eq!(f.mastodon.publish_calls(), 0);
    }

    #[tokio::test]
    async fn test_all_failed_marks_post_failed() {
        let f = fixture().await;
        connect(&f, Platform::Twitter).await;
        f.twitter
            .fail_next_publish(PlatformError::Validation("duplicate content".to_string()));
        let post = due_post(&f, vec![Platform::Twitter]).await;

        let outcome = f.dispatcher.dispatch_at(&post, NOW).await.unwrap();
        assert_eq!(outcome.post_status, PostStatus::Failed);
        let result = f.db.get_result(&post.id, Platform::Twitter).await.unwrap().unwrap();
        assert!(result.error_message.unwrap().contains("duplicate content"));
    }

    #[tokio::test]
    async fn test_unauthorized_revokes_account_without_retry() {
        let f = fixture().await;
        let account = connect(&f, Platform::Twitter).await;
        f.twitter
            .fail_next_publish(PlatformError::Authentication("401 Unauthorized".to_string()));
        let post = due_post(&f, vec![Platform::Twitter]).await;

        let outcome = f.dispatcher.dispatch_at(&post, NOW).await.unwrap();
        assert_eq!(outcome.platforms, vec![(Platform::Twitter, PlatformOutcome::Failed)]);

        let attempt = f.retry.attempt(&post.id, Platform::Twitter).await.unwrap().unwrap();
        assert_eq!(attempt.attempts, 1);
        assert_eq!(attempt.next_retry_at, None);

        let account = f.accounts.find_by_id(&account.id).await.unwrap().unwrap();
        assert_eq!(account.status, AccountStatus::Revoked);

        // a second post fails fast without calling the platform
        let second = due_post(&f, vec![Platform::Twitter]).await;
        f.dispatcher.dispatch_at(&second, NOW).await.unwrap();
        let result = f.db.get_result(&second.id, Platform::Twitter).await.unwrap().unwrap();
        assert_eq!(result.error_message.as_deref(), Some(RECONNECT_REQUIRED));
        assert_eq!(f.twitter.publish_calls(), 1);
    }

    #[tokio::test]
    async fn test_rejected_content_keeps_account_active() {
        let f = fixture().await;
        let account = connect(&f, Platform::Twitter).await;
        let duplicate = crate::platforms::http::error_for_status(
            Platform::Twitter,
            "publish",
            reqwest::StatusCode::FORBIDDEN,
            &reqwest::header::HeaderMap::new(),
            r#"{"detail":"You are not allowed to create a Tweet with duplicate content.","status":403}"#,
        );
        f.twitter.fail_next_publish(duplicate);
        let post = due_post(&f, vec![Platform::Twitter]).await;

        let outcome = f.dispatcher.dispatch_at(&post, NOW).await.unwrap();
        assert_eq!(outcome.platforms, vec![(Platform::Twitter, PlatformOutcome::Failed)]);

        let account = f.accounts.find_by_id(&account.id).await.unwrap().unwrap();
        assert_eq!(account.status, AccountStatus::Active);

        // the next post goes out normally
        let second = due_post(&f, vec![Platform::Twitter]).await;
        let outcome = f.dispatcher.dispatch_at(&second, NOW).await.unwrap();
        assert_eq!(outcome.post_status, PostStatus::Published);
        assert_eq!(f.twitter.publish_calls(), 2);
    }

    #[tokio::test]
    async fn test_rate_limit_keeps_post_queued() {
        let f = fixture().await;
        let account = connect(&f, Platform::Twitter).await;
        f.twitter.fail_next_publish(PlatformError::RateLimit {
            message: "429 Too Many Requests".to_string(),
            retry_after: Some(Duration::from_secs(60)),
        });
        let post = due_post(&f, vec![Platform::Twitter]).await;

        let outcome = f.dispatcher.dispatch_at(&post, NOW).await.unwrap();
        assert_eq!(
            outcome.platforms,
            vec![(Platform::Twitter, PlatformOutcome::RetryScheduled(NOW + 60))]
        );
        assert_eq!(outcome.post_status, PostStatus::Queued);
        assert_eq!(outcome.next_attempt_at, Some(NOW + 60));

        let account = f.accounts.find_by_id(&account.id).await.unwrap().unwrap();
        assert_eq!(account.status, AccountStatus::RateLimited);
        assert_eq!(account.rate_limited_until, Some(NOW + 60));

        // once the cool-down is over the account is usable again
        let post = f.db.get_post(&post.id).await.unwrap().unwrap();
        let outcome = f.dispatcher.dispatch_at(&post, NOW + 60).await.unwrap();
        assert_eq!(outcome.post_status, PostStatus::Published);
        let account = f.accounts.find_by_id(&account.id).await.unwrap().unwrap();
        assert_eq!(account.status, AccountStatus::Active);
    }

    #[tokio::test]
    async fn test_rate_limited_account_defers_other_posts() {
        let f = fixture().await;
        let account = connect(&f, Platform::Twitter).await;
        f.accounts
            .set_status(&account.id, AccountStatus::Active, AccountStatus::RateLimited, Some(NOW + 120))
            .await
            .unwrap();
        let post = due_post(&f, vec![Platform::Twitter]).await;

        let outcome = f.dispatcher.dispatch_at(&post, NOW).await.unwrap();
        assert_eq!(outcome.next_attempt_at, Some(NOW + 120));
        assert_eq!(f.twitter.publish_calls(), 0);

        let attempt = f.retry.attempt(&post.id, Platform::Twitter).await.unwrap().unwrap();
        assert_eq!(attempt.attempts, 0);
    }

    #[tokio::test]
    async fn test_transient_failures_dead_letter() {
        let f = fixture().await;
        connect(&f, Platform::Twitter).await;
        f.twitter
            .fail_all_publishes(PlatformError::Network("connection reset".to_string()));
        let post = due_post(&f, vec![Platform::Twitter]).await;

        let mut now = NOW;
        let mut last = None;
        for _ in 0..3 {
            let current = f.db.get_post(&post.id).await.unwrap().unwrap();
            let outcome = f.dispatcher.dispatch_at(&current, now).await.unwrap();
            now = outcome.next_attempt_at.unwrap_or(now);
            last = Some(outcome);
        }

        let last = last.unwrap();
        assert_eq!(last.platforms, vec![(Platform::Twitter, PlatformOutcome::DeadLettered)]);
        assert_eq!(last.post_status, PostStatus::Failed);
        assert_eq!(f.twitter.publish_calls(), 3);

        let result = f.db.get_result(&post.id, Platform::Twitter).await.unwrap().unwrap();
        assert!(result.error_message.unwrap().starts_with("dead-lettered ("));
        assert_eq!(f.retry.list_dead_letters(false).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_second_claim_skips() {
        let f = fixture().await;
        connect(&f, Platform::Twitter).await;
        let post = due_post(&f, vec![Platform::Twitter]).await;

        let first = f.dispatcher.dispatch_at(&post, NOW).await.unwrap();
        let second = f.dispatcher.dispatch_at(&post, NOW).await.unwrap();

        assert!(first.claimed);
        assert!(!second.claimed);
        assert_eq!(f.twitter.publish_calls(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_targets_publish_once() {
        let f = fixture().await;
        connect(&f, Platform::Mastodon).await;
        let post = due_post(&f, vec![Platform::Mastodon, Platform::Mastodon]).await;

        let outcome = f.dispatcher.dispatch_at(&post, NOW).await.unwrap();
        assert_eq!(outcome.platforms.len(), 1);
        assert_eq!(f.mastodon.publish_calls(), 1);
    }
}
