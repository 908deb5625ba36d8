//! Mastodon adapter
//!
//! API calls go through megalodon; the OAuth token endpoint is called
//! directly since the application credentials come from configuration
//! rather than from app registration.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use megalodon::megalodon::PostStatusOutput;
use megalodon::{Megalodon, SNS};
use secrecy::ExposeSecret;
use url::Url;

use super::http;
use super::{scope_param, AdapterResult, PlatformAdapter};
use crate::config::MastodonConfig;
use crate::error::PlatformError;
use crate::types::{Analytics, Credentials, Platform, PublishReceipt, Token};

pub struct MastodonAdapter {
    instance_url: String,
    client_id: String,
    client_secret: String,
    redirect_uri: String,
    timeout: Duration,
    http: reqwest::Client,
}

impl MastodonAdapter {
    pub fn new(config: &MastodonConfig) -> AdapterResult<Self> {
        let timeout = Duration::from_secs(config.client.request_timeout_secs);

        Ok(Self {
            instance_url: normalize_instance_url(&config.instance),
            client_id: config.client.client_id.clone(),
            client_secret: config.client.client_secret.clone(),
            redirect_uri: config.client.redirect_uri.clone(),
            timeout,
            http: http::build_client(timeout)?,
        })
    }

    fn client(&self, access_token: &str) -> AdapterResult<Box<dyn Megalodon + Send + Sync>> {
        megalodon::generator(
            SNS::Mastodon,
            self.instance_url.clone(),
            Some(access_token.to_string()),
            None,
        )
        .map_err(|e| PlatformError::NotConfigured(format!("mastodon client: {}", e)))
    }

    /// Run a megalodon call under the configured request timeout
    async fn call<T, F>(&self, context: &str, call: F) -> AdapterResult<T>
    where
        F: Future<Output = std::result::Result<T, megalodon::error::Error>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result.map_err(|e| map_megalodon_error(e, context)),
            Err(_) => Err(PlatformError::Network(format!(
                "mastodon {}: no response within {}s",
                context,
                self.timeout.as_secs()
            ))),
        }
    }

    fn token_url(&self) -> String {
        format!("{}/oauth/token", self.instance_url)
    }

    async fn verify(&self, access_token: &str) -> AdapterResult<megalodon::entities::Account> {
        let client = self.client(access_token)?;
        let response = self
            .call("verify credentials", client.verify_account_credentials())
            .await?;
        Ok(response.json)
    }
}

fn normalize_instance_url(instance: &str) -> String {
    let trimmed = instance.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    }
}

#[async_trait]
impl PlatformAdapter for MastodonAdapter {
    fn platform(&self) -> Platform {
        Platform::Mastodon
    }

    fn auth_url(&self, state: &str, scopes: &[&str]) -> AdapterResult<String> {
        let url = Url::parse_with_params(
            &format!("{}/oauth/authorize", self.instance_url),
            &[
                ("response_type", "code"),
                ("client_id", self.client_id.as_str()),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("scope", scope_param(scopes).as_str()),
                ("state", state),
            ],
        )
        .map_err(|e| PlatformError::NotConfigured(format!("mastodon authorize URL: {}", e)))?;

        Ok(url.to_string())
    }

    async fn exchange_code(&self, code: &str) -> AdapterResult<Token> {
        let response = http::token_request(
            &self.http,
            Platform::Mastodon,
            "code exchange",
            &self.token_url(),
            &[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ],
            None,
        )
        .await?;

        let account = self.verify(&response.access_token).await?;
        let now = chrono::Utc::now().timestamp();
        Ok(response.into_token(account.id, Some(format!("@{}", account.acct)), now))
    }

    async fn refresh_token(&self, credentials: &Credentials) -> AdapterResult<Token> {
        let refresh = credentials.refresh_token.as_ref().ok_or_else(|| {
            PlatformError::Authentication("mastodon account has no refresh token".to_string())
        })?;

        let response = http::token_request(
            &self.http,
            Platform::Mastodon,
            "token refresh",
            &self.token_url(),
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh.expose_secret()),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ],
            None,
        )
        .await?;

        let now = chrono::Utc::now().timestamp();
        Ok(response.into_token(credentials.platform_user_id.clone(), None, now))
    }

    async fn publish_post(
        &self,
        credentials: &Credentials,
        content: &str,
    ) -> AdapterResult<PublishReceipt> {
        if content.trim().is_empty() {
            return Err(PlatformError::Validation(
                "mastodon publish: content is empty".to_string(),
            ));
        }

        let client = self.client(credentials.access_token.expose_secret())?;
        let response = self
            .call("publish", client.post_status(content.to_string(), None))
            .await?;

        let id = match response.json {
            PostStatusOutput::Status(status) => status.id,
            PostStatusOutput::ScheduledStatus(scheduled) => scheduled.id,
        };

        Ok(PublishReceipt {
            url: Some(format!("{}/web/statuses/{}", self.instance_url, id)),
            platform_post_id: id,
        })
    }

    async fn get_post_analytics(
        &self,
        credentials: &Credentials,
        platform_post_id: &str,
    ) -> AdapterResult<Analytics> {
        let client = self.client(credentials.access_token.expose_secret())?;
        let response = self
            .call("analytics", client.get_status(platform_post_id.to_string()))
            .await?;
        let status = response.json;

        Ok(Analytics {
            likes: status.favourites_count as i64,
            reposts: status.reblogs_count as i64,
            replies: status.replies_count as i64,
            impressions: None,
            fetched_at: chrono::Utc::now().timestamp(),
        })
    }

    async fn validate_token(&self, credentials: &Credentials) -> AdapterResult<bool> {
        match self.verify(credentials.access_token.expose_secret()).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_auth_failure() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Classify a megalodon error.
///
/// megalodon reports HTTP failures as text, so the status is recovered from
/// the message and then classified the same way as the other platforms.
fn map_megalodon_error(error: megalodon::error::Error, context: &str) -> PlatformError {
    let message = error.to_string();
    let detail = format!("mastodon {}: {}", context, message);

    match status_in_message(&message) {
        Some(401) | Some(403) => PlatformError::Authentication(detail),
        Some(408) => PlatformError::Network(detail),
        Some(429) => PlatformError::RateLimit {
            message: detail,
            retry_after: None,
        },
        Some(500..=599) => PlatformError::Network(detail),
        Some(400..=499) => PlatformError::Validation(detail),
        Some(_) => PlatformError::Posting(detail),
        None => {
            let lower = message.to_lowercase();
            if lower.contains("unauthorized") || lower.contains("forbidden") {
                PlatformError::Authentication(detail)
            } else if lower.contains("too many requests") || lower.contains("rate limit") {
                PlatformError::RateLimit {
                    message: detail,
                    retry_after: None,
                }
            } else if lower.contains("unprocessable") || lower.contains("validation") {
                PlatformError::Validation(detail)
            } else if lower.contains("parse") || lower.contains("deserialize") {
                PlatformError::Posting(detail)
            } else {
                // connection refused, DNS, TLS, reset
                PlatformError::Network(detail)
            }
        }
    }
}

/// Find an HTTP status code in an error message ("HTTP 401", "status 503",
/// "422: Unprocessable Entity", ...)
fn status_in_message(message: &str) -> Option<u16> {
    for prefix in ["HTTP ", "status ", "status: ", "code: ", "status_code: "] {
        if let Some(pos) = message.find(prefix) {
            let code = message[pos + prefix.len()..]
                .get(0..3)
                .and_then(|s| s.parse::<u16>().ok());
            if let Some(code) = code.filter(|c| (100..=599).contains(c)) {
                return Some(code);
            }
        }
    }

    let bytes = message.as_bytes();
    for i in 0..bytes.len().saturating_sub(3) {
        let window = &bytes[i..i + 4];
        let standalone = i == 0 || !bytes[i - 1].is_ascii_digit();
        if standalone
            && window[..3].iter().all(u8::is_ascii_digit)
            && (window[3] == b':' || window[3] == b' ')
        {
            let code = std::str::from_utf8(&window[..3])
                .ok()
                .and_then(|s| s.parse::<u16>().ok());
            if let Some(code) = code.filter(|c| (100..=599).contains(c)) {
                return Some(code);
            }
        }
    }

    None
}
