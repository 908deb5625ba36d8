//! Platform adapters
//!
//! Every external platform implements [`PlatformAdapter`]. The set of
//! platforms is closed: [`Adapters`] holds one slot per [`Platform`] variant,
//! is built once at startup and handed to whoever needs to talk to a
//! platform.
//!
//! ```no_run
//! use libcadence::config::Config;
//! use libcadence::platforms::Adapters;
//! use libcadence::types::Platform;
//!
//! # fn example() -> libcadence::error::Result<()> {
//! let config = Config::load()?;
//! let adapters = Adapters::from_config(&config.platforms)?;
//!
//! if let Some(twitter) = adapters.get(Platform::Twitter) {
//!     let url = twitter.auth_url("csrf-state", &["tweet.read", "tweet.write"])?;
//!     println!("Authorize at {}", url);
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::PlatformsConfig;
use crate::error::{PlatformError, Result};
use crate::types::{Analytics, Credentials, Platform, PublishReceipt, Token};

pub mod http;
pub mod linkedin;
pub mod mastodon;
pub mod twitter;

// Scripted adapter, compiled into every build so integration tests can use it
pub mod mock;

/// Result of a call to an external platform
pub type AdapterResult<T> = std::result::Result<T, PlatformError>;

/// The capability contract every platform implements.
///
/// Errors are [`PlatformError`] values; the retry machinery classifies them
/// with [`PlatformError::class`].
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    fn platform(&self) -> Platform;

    /// URL the user is sent to in order to grant access.
    ///
    /// `state` is echoed back to the redirect URI for CSRF protection.
    fn auth_url(&self, state: &str, scopes: &[&str]) -> AdapterResult<String>;

    /// Exchange an authorization code for tokens and the platform identity
    async fn exchange_code(&self, code: &str) -> AdapterResult<Token>;

    /// Obtain a new access token with the refresh token in `credentials`.
    ///
    /// The returned token carries the same platform user id. Platforms that
    /// do not rotate refresh tokens return `refresh_token: None`.
    async fn refresh_token(&self, credentials: &Credentials) -> AdapterResult<Token>;

    async fn publish_post(
        &self,
        credentials: &Credentials,
        content: &str,
    ) -> AdapterResult<PublishReceipt>;

    async fn get_post_analytics(
        &self,
        credentials: &Credentials,
        platform_post_id: &str,
    ) -> AdapterResult<Analytics>;

    /// Check the access token against the platform.
    ///
    /// `Ok(false)` means the platform rejected it; errors are reserved for
    /// failures to find out.
    async fn validate_token(&self, credentials: &Credentials) -> AdapterResult<bool>;
}

/// One optional adapter per platform
#[derive(Clone, Default)]
pub struct Adapters {
    twitter: Option<Arc<dyn PlatformAdapter>>,
    linkedin: Option<Arc<dyn PlatformAdapter>>,
    mastodon: Option<Arc<dyn PlatformAdapter>>,
}

impl std::fmt::Debug for Adapters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.configured()).finish()
    }
}

impl Adapters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the adapters for every platform with a configuration section
    pub fn from_config(config: &PlatformsConfig) -> Result<Self> {
        let mut adapters = Self::new();

        if let Some(twitter) = &config.twitter {
            adapters = adapters.with(Arc::new(twitter::TwitterAdapter::new(twitter)?));
        }
        if let Some(linkedin) = &config.linkedin {
            adapters = adapters.with(Arc::new(linkedin::LinkedInAdapter::new(linkedin)?));
        }
        if let Some(mastodon) = &config.mastodon {
            adapters = adapters.with(Arc::new(mastodon::MastodonAdapter::new(mastodon)?));
        }

        tracing::debug!(platforms = ?adapters.configured(), "Platform adapters ready");
        Ok(adapters)
    }

    /// Install `adapter` in the slot for the platform it reports
    pub fn with(mut self, adapter: Arc<dyn PlatformAdapter>) -> Self {
        let platform = adapter.platform();
        *self.slot_mut(platform) = Some(adapter);
        self
    }

    pub fn get(&self, platform: Platform) -> Option<&Arc<dyn PlatformAdapter>> {
        match platform {
            Platform::Twitter => self.twitter.as_ref(),
            Platform::LinkedIn => self.linkedin.as_ref(),
            Platform::Mastodon => self.mastodon.as_ref(),
        }
    }

    /// Like [`get`](Self::get), but a missing adapter is a permanent error
    pub fn require(&self, platform: Platform) -> AdapterResult<&Arc<dyn PlatformAdapter>> {
        self.get(platform).ok_or_else(|| {
            PlatformError::NotConfigured(format!("no [platforms.{}] configuration", platform))
        })
    }

    pub fn configured(&self) -> Vec<Platform> {
        Platform::ALL
            .into_iter()
            .filter(|p| self.get(*p).is_some())
            .collect()
    }

    fn slot_mut(&mut self, platform: Platform) -> &mut Option<Arc<dyn PlatformAdapter>> {
        match platform {
            Platform::Twitter => &mut self.twitter,
            Platform::LinkedIn => &mut self.linkedin,
            Platform::Mastodon => &mut self.mastodon,
        }
    }
}

/// Join scopes the way OAuth 2.0 expects them (space separated)
pub(crate) fn scope_param(scopes: &[&str]) -> String {
    scopes.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MastodonConfig, OAuthClientConfig};
    use crate::error::ErrorClass;
    use mock::MockAdapter;

    fn client(name: &str) -> OAuthClientConfig {
        OAuthClientConfig {
            client_id: format!("{}-id", name),
            client_secret: format!("{}-secret", name),
            redirect_uri: format!("https://app.example.com/oauth/{}", name),
            request_timeout_secs: 30,
        }
    }

    #[test]
    fn test_empty_registry() {
        let adapters = Adapters::new();
        assert!(adapters.configured().is_empty());

        let err = match adapters.require(Platform::LinkedIn) {
            Err(e) => e,
            Ok(_) => panic!("expected NotConfigured"),
        };
        assert_eq!(err.class(), ErrorClass::Permanent);
        assert!(err.to_string().contains("platforms.linkedin"));
    }

    #[test]
    fn test_with_fills_the_matching_slot() {
        let adapters = Adapters::new()
            .with(Arc::new(MockAdapter::new(Platform::Mastodon)))
            .with(Arc::new(MockAdapter::new(Platform::Twitter)));

        assert_eq!(
            adapters.configured(),
            vec![Platform::Twitter, Platform::Mastodon]
        );
        assert_eq!(
            adapters.get(Platform::Mastodon).unwrap().platform(),
            Platform::Mastodon
        );
        assert!(adapters.get(Platform::LinkedIn).is_none());
    }

    #[test]
    fn test_from_config_builds_configured_platforms() {
        let config = PlatformsConfig {
            twitter: Some(client("twitter")),
            linkedin: None,
            mastodon: Some(MastodonConfig {
                instance: "https://mastodon.social".to_string(),
                client: client("mastodon"),
            }),
        };

        let adapters = Adapters::from_config(&config).unwrap();
        assert_eq!(
            adapters.configured(),
            vec![Platform::Twitter, Platform::Mastodon]
        );
    }

    #[test]
    fn test_scope_param() {
        assert_eq!(scope_param(&["tweet.read", "users.read"]), "tweet.read users.read");
        assert_eq!(scope_param(&[]), "");
    }
}
