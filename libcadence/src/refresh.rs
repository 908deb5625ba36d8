//! Access token refresh
//!
//! Refreshes are serialized per account inside a process by a
//! `tokio::sync::Mutex`, and across processes by the token version check in
//! [`AccountRepository::update`]. The proactive sweep additionally takes the
//! `refresh:{account}` lock so only one worker spends a refresh call on a
//! given account.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::accounts::AccountRepository;
use crate::error::{AccountError, CadenceError, ErrorClass, PlatformError, Result};
use crate::lock::{refresh_key, LockManager};
use crate::platforms::Adapters;
use crate::types::{AccountStatus, SocialAccount};

/// Counts from one proactive sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub refreshed: usize,
    pub failed: usize,
    /// Held by another worker
    pub skipped: usize,
}

pub struct TokenRefresher {
    accounts: AccountRepository,
    adapters: Adapters,
    locks: Arc<dyn LockManager>,
    lock_ttl: Duration,
    lookahead_secs: i64,
    in_flight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl TokenRefresher {
    pub fn new(
        accounts: AccountRepository,
        adapters: Adapters,
        locks: Arc<dyn LockManager>,
        lock_ttl: Duration,
        lookahead: Duration,
    ) -> Self {
        Self {
            accounts,
            adapters,
            locks,
            lock_ttl,
            lookahead_secs: lookahead.as_secs() as i64,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    fn account_guard(&self, account_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(map.entry(account_id.to_string()).or_default())
    }

    /// Give back a guard from [`account_guard`](Self::account_guard); the
    /// last holder removes the map entry.
    fn release_guard(&self, account_id: &str, guard: Arc<tokio::sync::Mutex<()>>) {
        let mut map = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        drop(guard);
        if map
            .get(account_id)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            map.remove(account_id);
        }
    }

    #[cfg(test)]
    fn guards_in_flight(&self) -> usize {
        self.in_flight.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Return an account whose token is good for at least the lookahead
    /// window, refreshing it first if needed.
    ///
    /// Platform failures come back as `CadenceError::Platform`. A permanent
    /// failure has already moved the account to `expired`, or `revoked` for
    /// authentication failures.
    pub async fn ensure_fresh(&self, account: SocialAccount, now: i64) -> Result<SocialAccount> {
        if !account.expires_within(now, self.lookahead_secs) {
            return Ok(account);
        }

        let guard = self.account_guard(&account.id);
        let result = {
            let _held = guard.lock().await;
            self.refresh_locked(&account.id, now).await
        };
        self.release_guard(&account.id, guard);
        result
    }

    /// The refresh itself, run while holding the account's guard
    async fn refresh_locked(&self, account_id: &str, now: i64) -> Result<SocialAccount> {
        // Someone may have refreshed while we waited
        let current = self
            .accounts
            .find_by_id(account_id)
            .await?
            .ok_or_else(|| AccountError::NotFound(account_id.to_string()))?;
        if current.deleted_at.is_some() {
            return Err(AccountError::Disconnected(current.id).into());
        }
        if !current.expires_within(now, self.lookahead_secs) {
            return Ok(current);
        }

        let adapter = Arc::clone(self.adapters.require(current.platform)?);
        let refreshed = self
            .accounts
            .with_credentials(&current, move |credentials| async move {
                adapter.refresh_token(&credentials).await
            })
            .await?;

        let token = match refreshed {
            Ok(token) => token,
            Err(e) => return Err(self.refresh_failed(&current, e).await),
        };

        if !self
            .accounts
            .update(&current, &token, AccountStatus::Active)
            .await?
        {
            tracing::debug!(
                account_id = %current.id,
                "Token was replaced concurrently, using the stored one"
            );
        } else {
            tracing::info!(
                account_id = %current.id,
                platform = %current.platform,
                expires_at = ?token.expires_at,
                "Refreshed access token"
            );
        }

        self.accounts
            .find_by_id(&current.id)
            .await?
            .ok_or_else(|| AccountError::NotFound(current.id.clone()).into())
    }

    async fn refresh_failed(&self, account: &SocialAccount, error: PlatformError) -> CadenceError {
        if error.class() != ErrorClass::Permanent {
            tracing::warn!(
                account_id = %account.id,
                platform = %account.platform,
                error = %error,
                "Token refresh failed, will retry"
            );
            return error.into();
        }

        let status = if error.is_auth_failure() {
            AccountStatus::Revoked
        } else {
            AccountStatus::Expired
        };

        match self
            .accounts
            .set_status(&account.id, account.status, status, None)
            .await
        {
            Ok(_) => {
                tracing::warn!(
                    account_id = %account.id,
                    platform = %account.platform,
                    status = status.as_str(),
                    error = %error,
                    "Token refresh rejected, account needs reconnecting"
                );
                error.into()
            }
            Err(db_error) => db_error,
        }
    }

    /// Refresh every account expiring within the lookahead window
    pub async fn sweep(&self, now: i64) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let expiring = self
            .accounts
            .find_expiring_within(now, self.lookahead_secs)
            .await?;

        for account in expiring {
            if self.adapters.get(account.platform).is_none() {
                continue;
            }

            let key = refresh_key(&account.id);
            let owner = match self.locks.try_acquire(&key, self.lock_ttl).await? {
                Some(owner) => owner,
                None => {
                    report.skipped += 1;
                    continue;
                }
            };

            let account_id = account.id.clone();
            match self.ensure_fresh(account, now).await {
                Ok(_) => report.refreshed += 1,
                Err(CadenceError::Platform(_)) | Err(CadenceError::Account(_)) => report.failed += 1,
                Err(e) => {
                    self.locks.release(&key, &owner).await?;
                    return Err(e);
                }
            }
            self.locks.release(&key, &owner).await?;
            tracing::trace!(account_id = %account_id, "Sweep visited account");
        }

        if report.refreshed + report.failed > 0 {
            tracing::info!(
                refreshed = report.refreshed,
                failed = report.failed,
                skipped = report.skipped,
                "Token sweep finished"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::lock::MemoryLockManager;
    use crate::platforms::mock::MockAdapter;
    use crate::types::{Platform, Token};
    use crate::vault::Vault;
    use secrecy::{ExposeSecret, SecretString};

    const LOOKAHEAD: Duration = Duration::from_secs(300);

    struct Fixture {
        accounts: AccountRepository,
        mock: MockAdapter,
        refresher: TokenRefresher,
    }

    async fn fixture() -> Fixture {
        let db = Database::in_memory().await.unwrap();
        let vault = Vault::from_base64_key(&Vault::generate_key()).unwrap();
        let accounts = AccountRepository::new(db, Arc::new(vault));
        let mock = MockAdapter::new(Platform::Twitter);
        let adapters = Adapters::new().with(Arc::new(mock.clone()));
        let refresher = TokenRefresher::new(
            accounts.clone(),
            adapters,
            Arc::new(MemoryLockManager::new()),
            Duration::from_secs(300),
            LOOKAHEAD,
        );
        Fixture {
            accounts,
            mock,
            refresher,
        }
    }

    async fn connect(accounts: &AccountRepository, expires_at: Option<i64>) -> SocialAccount {
        let token = Token {
            access_token: SecretString::from("original".to_string()),
            refresh_token: Some(SecretString::from("refresh".to_string())),
            expires_at,
            platform_user_id: "u-1".to_string(),
            handle: Some("@team".to_string()),
        };
        accounts.connect("team", Platform::Twitter, &token).await.unwrap()
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    #[tokio::test]
    async fn test_fresh_token_is_left_alone() {
        let f = fixture().await;
        let account = connect(&f.accounts, Some(now() + 3_600)).await;

        let same = f.refresher.ensure_fresh(account.clone(), now()).await.unwrap();
        assert_eq!(same.token_version, account.token_version);
        assert_eq!(f.mock.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn test_expiring_token_is_refreshed_and_persisted() {
        let f = fixture().await;
        let account = connect(&f.accounts, Some(now() + 60)).await;

        let fresh = f.refresher.ensure_fresh(account.clone(), now()).await.unwrap();
        assert_eq!(f.mock.refresh_calls(), 1);
        assert!(fresh.token_version > account.token_version);
        assert!(fresh.token_expires_at.unwrap() > now() + 3_600);

        let token = f
            .accounts
            .with_credentials(&fresh, |c| async move {
                c.access_token.expose_secret().to_string()
            })
            .await
            .unwrap();
        assert_eq!(token, "refreshed-1");
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_call_platform_once() {
        let f = fixture().await;
        let account = connect(&f.accounts, Some(now() - 10)).await;
        let refresher = Arc::new(f.refresher);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let refresher = Arc::clone(&refresher);
                let account = account.clone();
                tokio::spawn(async move { refresher.ensure_fresh(account, now()).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(f.mock.refresh_calls(), 1);
        assert_eq!(refresher.guards_in_flight(), 0);
    }

    #[tokio::test]
    async fn test_rejected_refresh_revokes_account() {
        let f = fixture().await;
        let account = connect(&f.accounts, Some(now() + 30)).await;
        f.mock
            .fail_next_refresh(PlatformError::Authentication("invalid_grant".to_string()));

        let err = f.refresher.ensure_fresh(account.clone(), now()).await.unwrap_err();
        assert!(matches!(err, CadenceError::Platform(PlatformError::Authentication(_))));

        let stored = f.accounts.find_by_id(&account.id).await.unwrap().unwrap();
        assert_eq!(stored.status, AccountStatus::Revoked);
    }

    #[tokio::test]
    async fn test_transient_refresh_failure_keeps_account_active() {
        let f = fixture().await;
        let account = connect(&f.accounts, Some(now() + 30)).await;
        f.mock
            .fail_next_refresh(PlatformError::Network("timed out".to_string()));

        let err = f.refresher.ensure_fresh(account.clone(), now()).await.unwrap_err();
        assert!(matches!(err, CadenceError::Platform(PlatformError::Network(_))));
        assert_eq!(f.refresher.guards_in_flight(), 0);

        let stored = f.accounts.find_by_id(&account.id).await.unwrap().unwrap();
        assert_eq!(stored.status, AccountStatus::Active);
    }

    #[tokio::test]
    async fn test_sweep_refreshes_only_expiring_accounts() {
        let f = fixture().await;
        connect(&f.accounts, Some(now() + 120)).await;

        let other = Token {
            access_token: SecretString::from("long-lived".to_string()),
            refresh_token: Some(SecretString::from("r".to_string())),
            expires_at: Some(now() + 86_400),
            platform_user_id: "u-2".to_string(),
            handle: None,
        };
        f.accounts.connect("team", Platform::Twitter, &other).await.unwrap();

        let report = f.refresher.sweep(now()).await.unwrap();
        assert_eq!(
            report,
            SweepReport {
                refreshed: 1,
                failed: 0,
                skipped: 0
            }
        );
        assert_eq!(f.mock.refresh_calls(), 1);

        // nothing left to do
        assert_eq!(f.refresher.sweep(now()).await.unwrap(), SweepReport::default());
    }
}
