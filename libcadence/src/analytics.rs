//! Periodic engagement snapshots for published posts

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::accounts::AccountRepository;
use crate::cache::Cache;
use crate::config::AnalyticsConfig;
use crate::db::{AnalyticsCandidate, Database};
use crate::error::Result;
use crate::platforms::Adapters;
use crate::types::{Analytics, Platform};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
    pub refreshed: usize,
    pub failed: usize,
    /// Disconnected or unusable account, or platform not configured
    pub skipped: usize,
}

fn cache_key(post_id: &str, platform: Platform) -> String {
    format!("analytics:{}:{}", post_id, platform)
}

pub struct AnalyticsRefresher {
    db: Database,
    accounts: AccountRepository,
    adapters: Adapters,
    cache: Arc<dyn Cache>,
    interval: Duration,
    staleness: Duration,
    batch_size: u32,
    cache_ttl: Duration,
}

impl AnalyticsRefresher {
    pub fn new(
        db: Database,
        accounts: AccountRepository,
        adapters: Adapters,
        cache: Arc<dyn Cache>,
        config: &AnalyticsConfig,
    ) -> Self {
        Self {
            db,
            accounts,
            adapters,
            cache,
            interval: Duration::from_secs(config.interval_secs),
            staleness: Duration::from_secs(config.staleness_secs),
            batch_size: config.batch_size,
            cache_ttl: Duration::from_secs(config.cache_ttl_secs),
        }
    }

    pub async fn refresh_cycle(&self) -> Result<RefreshReport> {
        self.refresh_cycle_at(chrono::Utc::now().timestamp()).await
    }

    /// Refresh one batch of missing or stale snapshots as of `now`.
    ///
    /// Skipped and failed pairs are marked as tried, so they move behind
    /// untried ones and come up again in a later cycle.
    pub async fn refresh_cycle_at(&self, now: i64) -> Result<RefreshReport> {
        let stale_before = now.saturating_sub(self.staleness.as_secs() as i64);
        let candidates = self
            .db
            .analytics_candidates(stale_before, now, self.batch_size)
            .await?;

        let mut report = RefreshReport::default();
        for candidate in candidates {
            let refreshed = match self.refresh_one(&candidate).await {
                Ok(Some(_)) => {
                    report.refreshed += 1;
                    true
                }
                Ok(None) => {
                    report.skipped += 1;
                    false
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(
                        post_id = %candidate.post_id,
                        platform = %candidate.platform,
                        error = %e,
                        "Analytics refresh failed, will retry next cycle"
                    );
                    false
                }
            };

            if !refreshed {
                self.db
                    .mark_analytics_attempt(&candidate.post_id, candidate.platform, now)
                    .await?;
            }
        }

        let purged = self.cache.purge_expired().await;
        if purged > 0 {
            tracing::debug!(count = purged, "Purged expired analytics cache entries");
        }

        if report != RefreshReport::default() {
            tracing::info!(
                refreshed = report.refreshed,
                failed = report.failed,
                skipped = report.skipped,
                "Analytics refresh finished"
            );
        }
        Ok(report)
    }

    async fn refresh_one(&self, candidate: &AnalyticsCandidate) -> Result<Option<Analytics>> {
        let account = match self.accounts.find_by_id(&candidate.account_id).await? {
            Some(account) if account.deleted_at.is_none() && !account.status.requires_reconnect() => {
                account
            }
            _ => return Ok(None),
        };
        let adapter = match self.adapters.get(candidate.platform) {
            Some(adapter) => Arc::clone(adapter),
            None => return Ok(None),
        };

        let platform_post_id = candidate.platform_post_id.as_str();
        let analytics = self
            .accounts
            .with_credentials(&account, move |credentials| async move {
                adapter.get_post_analytics(&credentials, platform_post_id).await
            })
            .await??;

        self.db
            .store_analytics(&candidate.post_id, candidate.platform, &analytics)
            .await?;
        self.remember(&candidate.post_id, candidate.platform, &analytics)
            .await;

        Ok(Some(analytics))
    }

    async fn remember(&self, post_id: &str, platform: Platform, analytics: &Analytics) {
        match serde_json::to_string(analytics) {
            Ok(json) => {
                self.cache
                    .set(&cache_key(post_id, platform), &json, self.cache_ttl)
                    .await
            }
            Err(e) => tracing::warn!(error = %e, "Could not serialize analytics for the cache"),
        }
    }

    /// Latest stored snapshot for a (post, platform) pair, read through the
    /// cache
    pub async fn analytics_for(&self, post_id: &str, platform: Platform) -> Result<Option<Analytics>> {
        let key = cache_key(post_id, platform);
        if let Some(cached) = self.cache.get(&key).await {
            match serde_json::from_str(&cached) {
                Ok(analytics) => return Ok(Some(analytics)),
                Err(_) => self.cache.delete(&key).await,
            }
        }

        let analytics = self
            .db
            .get_result(post_id, platform)
            .await?
            .and_then(|r| r.analytics);

        if let Some(analytics) = &analytics {
            self.remember(post_id, platform, analytics).await;
        }
        Ok(analytics)
    }

    /// Refresh every interval until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = self.refresh_cycle() => {
                    if let Err(e) = result {
                        tracing::error!(error = %e, "Analytics refresh cycle failed");
                    }
                }
            }
        }

        tracing::info!("Analytics refresher stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::error::PlatformError;
    use crate::platforms::mock::MockAdapter;
    use crate::types::{AccountStatus, PlatformResult, Post, ResultStatus, SocialAccount, Token};
    use crate::vault::Vault;
    use secrecy::SecretString;

    const NOW: i64 = 1_800_000_000;

    struct Fixture {
        db: Database,
        accounts: AccountRepository,
        mock: MockAdapter,
        cache: MemoryCache,
        refresher: AnalyticsRefresher,
    }

    async fn fixture() -> Fixture {
        fixture_with(AnalyticsConfig::default()).await
    }

    async fn fixture_with(config: AnalyticsConfig) -> Fixture {
        let db = Database::in_memory().await.unwrap();
        let vault = Vault::from_base64_key(&Vault::generate_key()).unwrap();
        let accounts = AccountRepository::new(db.clone(), Arc::new(vault));
        let mock = MockAdapter::new(Platform::Twitter);
        let cache = MemoryCache::new();
        let refresher = AnalyticsRefresher::new(
            db.clone(),
            accounts.clone(),
            Adapters::new().with(Arc::new(mock.clone())),
            Arc::new(cache.clone()),
            &config,
        );
        Fixture {
            db,
            accounts,
            mock,
            cache,
            refresher,
        }
    }

    async fn published_post(f: &Fixture) -> (Post, SocialAccount) {
        published_post_for(f, "team", NOW - 60).await
    }

    async fn published_post_for(f: &Fixture, team: &str, published_at: i64) -> (Post, SocialAccount) {
        let token = Token {
            access_token: SecretString::from("a".to_string()),
            refresh_token: None,
            expires_at: None,
            platform_user_id: format!("{}-42", team),
            handle: None,
        };
        let account = f.accounts.connect(team, Platform::Twitter, &token).await.unwrap();

        let post = Post::new(team.to_string(), "hi".to_string(), vec![Platform::Twitter]);
        f.db.create_post(&post).await.unwrap();
        f.db.save_result(&PlatformResult {
            post_id: post.id.clone(),
            platform: Platform::Twitter,
            account_id: Some(account.id.clone()),
            status: ResultStatus::Published,
            platform_post_id: Some("1790".to_string()),
            error_message: None,
            error_class: None,
            published_at: Some(published_at),
            analytics: None,
        })
        .await
        .unwrap();
        (post, account)
    }

    #[tokio::test]
    async fn test_cycle_stores_and_caches_snapshots() {
        let f = fixture().await;
        let (post, _) = published_post(&f).await;
        let snapshot = Analytics {
            likes: 10,
            reposts: 3,
            replies: 2,
            impressions: Some(900),
            fetched_at: NOW,
        };
        f.mock.push_analytics(Ok(snapshot.clone()));

        let report = f.refresher.refresh_cycle_at(NOW).await.unwrap();
        assert_eq!(report.refreshed, 1);

        let stored = f.db.get_result(&post.id, Platform::Twitter).await.unwrap().unwrap();
        assert_eq!(stored.analytics, Some(snapshot.clone()));
        assert!(f.cache.get(&cache_key(&post.id, Platform::Twitter)).await.is_some());

        // fresh snapshots are not fetched again
        let report = f.refresher.refresh_cycle_at(NOW + 60).await.unwrap();
        assert_eq!(report, RefreshReport::default());
        assert_eq!(f.mock.analytics_calls(), 1);
    }

    #[tokio::test]
    async fn test_failures_are_retried_next_cycle() {
        let f = fixture().await;
        published_post(&f).await;
        f.mock
            .push_analytics(Err(PlatformError::Network("timeout".to_string())));

        let report = f.refresher.refresh_cycle_at(NOW).await.unwrap();
        assert_eq!(report.failed, 1);

        // not tried twice within one cycle
        let report = f.refresher.refresh_cycle_at(NOW).await.unwrap();
        assert_eq!(report, RefreshReport::default());

        let report = f.refresher.refresh_cycle_at(NOW + 3600).await.unwrap();
        assert_eq!(report.refreshed, 1);
    }

    #[tokio::test]
    async fn test_revoked_accounts_are_skipped() {
        let f = fixture().await;
        let (_, account) = published_post(&f).await;
        f.accounts
            .set_status(&account.id, AccountStatus::Active, AccountStatus::Revoked, None)
            .await
            .unwrap();

        let report = f.refresher.refresh_cycle_at(NOW).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(f.mock.analytics_calls(), 0);
    }

    #[tokio::test]
    async fn test_analytics_for_reads_through_cache() {
        let f = fixture().await;
        let (post, _) = published_post(&f).await;

        assert_eq!(f.refresher.analytics_for(&post.id, Platform::Twitter).await.unwrap(), None);

        let snapshot = Analytics {
            likes: 1,
            fetched_at: NOW,
            ..Default::default()
        };
        f.db.store_analytics(&post.id, Platform::Twitter, &snapshot).await.unwrap();

        let loaded = f.refresher.analytics_for(&post.id, Platform::Twitter).await.unwrap();
        assert_eq!(loaded, Some(snapshot.clone()));

        // served from the cache even after the row changes
        let newer = Analytics {
            likes: 99,
            fetched_at: NOW + 1,
            ..Default::default()
        };
        f.db.store_analytics(&post.id, Platform::Twitter, &newer).await.unwrap();
        let cached = f.refresher.analytics_for(&post.id, Platform::Twitter).await.unwrap();
        assert_eq!(cached, Some(snapshot));
    }

    #[tokio::test]
    async fn test_skipped_pairs_do_not_block_the_batch() {
        let f = fixture_with(AnalyticsConfig {
            batch_size: 1,
            ..AnalyticsConfig::default()
        })
        .await;
        let (_, revoked) = published_post_for(&f, "old-team", NOW - 600).await;
        let (healthy, _) = published_post_for(&f, "new-team", NOW - 60).await;
        f.accounts
            .set_status(&revoked.id, AccountStatus::Active, AccountStatus::Revoked, None)
            .await
            .unwrap();

        f.mock.push_analytics(Ok(Analytics {
            likes: 5,
            fetched_at: NOW + 3600,
            ..Default::default()
        }));

        let report = f.refresher.refresh_cycle_at(NOW).await.unwrap();
        assert_eq!(report.skipped, 1);

        let report = f.refresher.refresh_cycle_at(NOW + 3600).await.unwrap();
        assert_eq!(report.refreshed, 1);
        assert_eq!(f.mock.analytics_calls(), 1);

        let stored = f.db.get_result(&healthy.id, Platform::Twitter).await.unwrap().unwrap();
        assert!(stored.analytics.is_some());

        // the revoked pair keeps coming back, behind everything else
        let report = f.refresher.refresh_cycle_at(NOW + 7200).await.unwrap();
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test]
    async fn test_cycle_purges_expired_cache_entries() {
        let f = fixture_with(AnalyticsConfig {
            cache_ttl_secs: 0,
            ..AnalyticsConfig::default()
        })
        .await;
        published_post(&f).await;
        f.cache
            .set("analytics:old:twitter", "{}", Duration::ZERO)
            .await;

        let report = f.refresher.refresh_cycle_at(NOW).await.unwrap();
        assert_eq!(report.refreshed, 1);
        assert_eq!(f.cache.stored().await, 0);
    }
}
