//! Scripted platform adapter for tests
//!
//! [`MockAdapter`] answers every call from a script: queued results are
//! consumed first, then the sticky default applies. Call counts and the
//! access tokens it was handed are recorded for assertions.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use super::{AdapterResult, PlatformAdapter};
use crate::error::PlatformError;
use crate::types::{Analytics, Credentials, Platform, PublishReceipt, Token};

#[derive(Default)]
struct Script {
    publish: VecDeque<AdapterResult<PublishReceipt>>,
    publish_default: Option<PlatformError>,
    refresh: VecDeque<AdapterResult<()>>,
    analytics: VecDeque<AdapterResult<Analytics>>,
    token_valid: bool,
    refresh_expires_in: Option<i64>,
    delay: Duration,

    publish_calls: usize,
    refresh_calls: usize,
    analytics_calls: usize,
    published: Vec<String>,
    tokens_seen: Vec<String>,
}

/// Cheap to clone; clones share the same script and counters
#[derive(Clone)]
pub struct MockAdapter {
    platform: Platform,
    script: Arc<Mutex<Script>>,
}

impl MockAdapter {
    /// An adapter that publishes, refreshes and reports analytics successfully
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            script: Arc::new(Mutex::new(Script {
                token_valid: true,
                refresh_expires_in: Some(7200),
                ..Default::default()
            })),
        }
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue the outcome of the next `publish_post` call
    pub fn push_publish(&self, result: AdapterResult<PublishReceipt>) -> &Self {
        self.script().publish.push_back(result);
        self
    }

    /// Queue a publish failure
    pub fn fail_next_publish(&self, error: PlatformError) -> &Self {
        self.push_publish(Err(error))
    }

    /// Fail every publish call once the queue is empty
    pub fn fail_all_publishes(&self, error: PlatformError) -> &Self {
        self.script().publish_default = Some(error);
        self
    }

    /// Queue a refresh failure
    pub fn fail_next_refresh(&self, error: PlatformError) -> &Self {
        self.script().refresh.push_back(Err(error));
        self
    }

    /// Lifetime of tokens handed out by `refresh_token`, `None` for
    /// non-expiring
    pub fn refresh_expires_in(&self, secs: Option<i64>) -> &Self {
        self.script().refresh_expires_in = secs;
        self
    }

    pub fn push_analytics(&self, result: AdapterResult<Analytics>) -> &Self {
        self.script().analytics.push_back(result);
        self
    }

    pub fn set_token_valid(&self, valid: bool) -> &Self {
        self.script().token_valid = valid;
        self
    }

    /// Simulated network latency for publish calls
    pub fn with_delay(&self, delay: Duration) -> &Self {
        self.script().delay = delay;
        self
    }

    pub fn publish_calls(&self) -> usize {
        self.script().publish_calls
    }

    pub fn refresh_calls(&self) -> usize {
        self.script().refresh_calls
    }

    pub fn analytics_calls(&self) -> usize {
        self.script().analytics_calls
    }

    /// Content of every successful publish, in order
    pub fn published(&self) -> Vec<String> {
        self.script().published.clone()
    }

    /// Access tokens presented to publish calls, in order
    pub fn tokens_seen(&self) -> Vec<String> {
        self.script().tokens_seen.clone()
    }
}

#[async_trait]
impl PlatformAdapter for MockAdapter {
    fn platform(&self) -> Platform {
        self.platform
    }

    fn auth_url(&self, state: &str, scopes: &[&str]) -> AdapterResult<String> {
        Ok(format!(
            "https://{}.mock/authorize?state={}&scope={}",
            self.platform,
            state,
            scopes.join("+")
        ))
    }

    async fn exchange_code(&self, code: &str) -> AdapterResult<Token> {
        if code.is_empty() {
            return Err(PlatformError::Authentication("empty authorization code".to_string()));
        }

        let expires_in = self.script().refresh_expires_in;
        Ok(Token {
            access_token: SecretString::from(format!("access-{}", code)),
            refresh_token: Some(SecretString::from(format!("refresh-{}", code))),
            expires_at: expires_in.map(|secs| chrono::Utc::now().timestamp() + secs),
            platform_user_id: format!("{}-user", self.platform),
            handle: Some(format!("@{}-mock", self.platform)),
        })
    }

    async fn refresh_token(&self, credentials: &Credentials) -> AdapterResult<Token> {
        let (outcome, calls, expires_in) = {
            let mut script = self.script();
            script.refresh_calls += 1;
            (
                script.refresh.pop_front().unwrap_or(Ok(())),
                script.refresh_calls,
                script.refresh_expires_in,
            )
        };
        outcome?;

        if credentials.refresh_token.is_none() {
            return Err(PlatformError::Authentication("no refresh token".to_string()));
        }

        Ok(Token {
            access_token: SecretString::from(format!("refreshed-{}", calls)),
            refresh_token: Some(SecretString::from(format!("rotated-{}", calls))),
            expires_at: expires_in.map(|secs| chrono::Utc::now().timestamp() + secs),
            platform_user_id: credentials.platform_user_id.clone(),
            handle: None,
        })
    }

    async fn publish_post(
        &self,
        credentials: &Credentials,
        content: &str,
    ) -> AdapterResult<PublishReceipt> {
        let delay = {
            let mut script = self.script();
            script.publish_calls += 1;
            script
                .tokens_seen
                .push(credentials.access_token.expose_secret().to_string());
            script.delay
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut script = self.script();
        let outcome = match script.publish.pop_front() {
            Some(outcome) => outcome,
            None => match &script.publish_default {
                Some(error) => Err(error.clone()),
                None => Ok(PublishReceipt {
                    platform_post_id: format!("{}-{}", self.platform, script.publish_calls),
                    url: None,
                }),
            },
        };

        if outcome.is_ok() {
            script.published.push(content.to_string());
        }
        outcome
    }

    async fn get_post_analytics(
        &self,
        _credentials: &Credentials,
        _platform_post_id: &str,
    ) -> AdapterResult<Analytics> {
        let mut script = self.script();
        script.analytics_calls += 1;
        let calls = script.analytics_calls as i64;

        script.analytics.pop_front().unwrap_or_else(|| {
            Ok(Analytics {
                likes: calls,
                reposts: 0,
                replies: 0,
                impressions: None,
                fetched_at: chrono::Utc::now().timestamp(),
            })
        })
    }

    async fn validate_token(&self, _credentials: &Credentials) -> AdapterResult<bool> {
        Ok(self.script().token_valid)
    }
}
