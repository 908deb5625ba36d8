//! X (Twitter) adapter using the v2 API with OAuth 2.0 authorization code + PKCE

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use secrecy::ExposeSecret;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use url::Url;

use super::http::{self, TokenResponse};
use super::{scope_param, AdapterResult, PlatformAdapter};
use crate::config::OAuthClientConfig;
use crate::error::PlatformError;
use crate::types::{Analytics, Credentials, Platform, PublishReceipt, Token};

const AUTHORIZE_URL: &str = "https://x.com/i/oauth2/authorize";
const API_BASE: &str = "https://api.x.com/2";

pub struct TwitterAdapter {
    client_id: String,
    client_secret: String,
    redirect_uri: String,
    http: reqwest::Client,
}

impl TwitterAdapter {
    pub fn new(config: &OAuthClientConfig) -> AdapterResult<Self> {
        Ok(Self {
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            redirect_uri: config.redirect_uri.clone(),
            http: http::build_client(Duration::from_secs(config.request_timeout_secs))?,
        })
    }

    /// PKCE verifier for this application.
    ///
    /// The code exchange receives only the code, so the verifier is derived
    /// from the client secret instead of being stored between the two steps.
    /// Every authorization therefore carries the same challenge: an
    /// intercepted code is useless without the client secret, but the
    /// challenge does not tell two authorizations apart. Binding a callback
    /// to the request that started it is left to the caller's `state`.
    fn code_verifier(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(b"cadence-pkce-verifier:");
        hasher.update(self.client_id.as_bytes());
        hasher.update(b":");
        hasher.update(self.client_secret.as_bytes());
        URL_SAFE_NO_PAD.encode(hasher.finalize())
    }

    fn code_challenge(&self) -> String {
        URL_SAFE_NO_PAD.encode(Sha256::digest(self.code_verifier().as_bytes()))
    }

    fn token_url() -> String {
        format!("{}/oauth2/token", API_BASE)
    }

    async fn me(&self, access_token: &str) -> AdapterResult<TwitterUser> {
        let response = self
            .http
            .get(format!("{}/users/me", API_BASE))
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| http::request_error(Platform::Twitter, "users/me", e))?;
        let response = http::check(Platform::Twitter, "users/me", response).await?;

        let body: DataEnvelope<TwitterUser> = response
            .json()
            .await
            .map_err(|e| http::request_error(Platform::Twitter, "users/me", e))?;
        Ok(body.data)
    }
}

#[derive(Deserialize)]
struct DataEnvelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct TwitterUser {
    id: String,
    username: String,
}

#[derive(Deserialize)]
struct CreatedTweet {
    id: String,
}

#[derive(Deserialize)]
struct TweetWithMetrics {
    public_metrics: PublicMetrics,
}

#[derive(Deserialize)]
struct PublicMetrics {
    #[serde(default)]
    like_count: i64,
    #[serde(default)]
    retweet_count: i64,
    #[serde(default)]
    quote_count: i64,
    #[serde(default)]
    reply_count: i64,
    #[serde(default)]
    impression_count: Option<i64>,
}

impl PublicMetrics {
    fn into_analytics(self, fetched_at: i64) -> Analytics {
        Analytics {
            likes: self.like_count,
            reposts: self.retweet_count + self.quote_count,
            replies: self.reply_count,
            impressions: self.impression_count,
            fetched_at,
        }
    }
}

#[async_trait]
impl PlatformAdapter for TwitterAdapter {
    fn platform(&self) -> Platform {
        Platform::Twitter
    }

    fn auth_url(&self, state: &str, scopes: &[&str]) -> AdapterResult<String> {
        let url = Url::parse_with_params(
            AUTHORIZE_URL,
            &[
                ("response_type", "code"),
                ("client_id", self.client_id.as_str()),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("scope", scope_param(scopes).as_str()),
                ("state", state),
                ("code_challenge", self.code_challenge().as_str()),
                ("code_challenge_method", "S256"),
            ],
        )
        .map_err(|e| PlatformError::NotConfigured(format!("twitter authorize URL: {}", e)))?;

        Ok(url.to_string())
    }

    async fn exchange_code(&self, code: &str) -> AdapterResult<Token> {
        let verifier = self.code_verifier();
        let response = http::token_request(
            &self.http,
            Platform::Twitter,
            "code exchange",
            &Self::token_url(),
            &[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("code_verifier", verifier.as_str()),
            ],
            Some((self.client_id.as_str(), self.client_secret.as_str())),
        )
        .await?;

        let user = self.me(&response.access_token).await?;
        let now = chrono::Utc::now().timestamp();
        Ok(response.into_token(user.id, Some(format!("@{}", user.username)), now))
    }

    async fn refresh_token(&self, credentials: &Credentials) -> AdapterResult<Token> {
        let refresh = credentials.refresh_token.as_ref().ok_or_else(|| {
            PlatformError::Authentication("twitter account has no refresh token".to_string())
        })?;

        let response: TokenResponse = http::token_request(
            &self.http,
            Platform::Twitter,
            "token refresh",
            &Self::token_url(),
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh.expose_secret()),
                ("client_id", self.client_id.as_str()),
            ],
            Some((self.client_id.as_str(), self.client_secret.as_str())),
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
        let response = self
            .http
            .post(format!("{}/tweets", API_BASE))
            .bearer_auth(credentials.access_token.expose_secret())
            .json(&serde_json::json!({ "text": content }))
            .send()
            .await
            .map_err(|e| http::request_error(Platform::Twitter, "publish", e))?;
        let response = http::check(Platform::Twitter, "publish", response).await?;

        let body: DataEnvelope<CreatedTweet> = response
            .json()
            .await
            .map_err(|e| http::request_error(Platform::Twitter, "publish", e))?;

        Ok(PublishReceipt {
            url: Some(format!("https://x.com/i/web/status/{}", body.data.id)),
            platform_post_id: body.data.id,
        })
    }

    async fn get_post_analytics(
        &self,
        credentials: &Credentials,
        platform_post_id: &str,
    ) -> AdapterResult<Analytics> {
        let response = self
            .http
            .get(format!("{}/tweets/{}", API_BASE, platform_post_id))
            .query(&[("tweet.fields", "public_metrics")])
            .bearer_auth(credentials.access_token.expose_secret())
            .send()
            .await
            .map_err(|e| http::request_error(Platform::Twitter, "analytics", e))?;
        let response = http::check(Platform::Twitter, "analytics", response).await?;

        let body: DataEnvelope<TweetWithMetrics> = response
            .json()
            .await
            .map_err(|e| http::request_error(Platform::Twitter, "analytics", e))?;

        Ok(body
            .data
            .public_metrics
            .into_analytics(chrono::Utc::now().timestamp()))
    }

    async fn validate_token(&self, credentials: &Credentials) -> AdapterResult<bool> {
        match self.me(credentials.access_token.expose_secret()).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_auth_failure() => Ok(false),
            Err(e) => Err(e),
        }
    }
}
