//! LinkedIn adapter (OAuth 2.0, Posts API, OpenID Connect userinfo)

use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::Deserialize;
use url::Url;

use super::http;
use super::{scope_param, AdapterResult, PlatformAdapter};
use crate::config::OAuthClientConfig;
use crate::error::PlatformError;
use crate::types::{Analytics, Credentials, Platform, PublishReceipt, Token};

const AUTHORIZE_URL: &str = "https://www.linkedin.com/oauth/v2/authorization";
const TOKEN_URL: &str = "https://www.linkedin.com/oauth/v2/accessToken";
const API_BASE: &str = "https://api.linkedin.com";
/// Versioned REST API release the requests are written against
const API_VERSION: &str = "202405";

pub struct LinkedInAdapter {
    client_id: String,
    client_secret: String,
    redirect_uri: String,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct UserInfo {
    sub: String,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Deserialize)]
struct SocialActions {
    #[serde(default, rename = "likesSummary")]
    likes: Option<LikesSummary>,
    #[serde(default, rename = "commentsSummary")]
    comments: Option<CommentsSummary>,
}

#[derive(Deserialize)]
struct LikesSummary {
    #[serde(default, rename = "totalLikes")]
    total_likes: i64,
}

#[derive(Deserialize)]
struct CommentsSummary {
    #[serde(default, rename = "aggregatedTotalComments")]
    total_comments: i64,
}

impl SocialActions {
    fn into_analytics(self, fetched_at: i64) -> Analytics {
        Analytics {
            likes: self.likes.map(|l| l.total_likes).unwrap_or(0),
            // reshare counts need the organization analytics product
            reposts: 0,
            replies: self.comments.map(|c| c.total_comments).unwrap_or(0),
            impressions: None,
            fetched_at,
        }
    }
}

impl LinkedInAdapter {
    pub fn new(config: &OAuthClientConfig) -> AdapterResult<Self> {
        Ok(Self {
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            redirect_uri: config.redirect_uri.clone(),
            http: http::build_client(Duration::from_secs(config.request_timeout_secs))?,
        })
    }

    async fn userinfo(&self, access_token: &str) -> AdapterResult<UserInfo> {
        let response = self
            .http
            .get(format!("{}/v2/userinfo", API_BASE))
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| http::request_error(Platform::LinkedIn, "userinfo", e))?;
        let response = http::check(Platform::LinkedIn, "userinfo", response).await?;

        response
            .json()
            .await
            .map_err(|e| http::request_error(Platform::LinkedIn, "userinfo", e))
    }

    fn post_body(author_id: &str, content: &str) -> serde_json::Value {
        serde_json::json!({
            "author": author_urn(author_id),
            "commentary": content,
            "visibility": "PUBLIC",
            "distribution": {
                "feedDistribution": "MAIN_FEED",
                "targetEntities": [],
                "thirdPartyDistributionChannels": []
            },
            "lifecycleState": "PUBLISHED",
            "isReshareDisabledByAuthor": false
        })
    }
}

fn author_urn(member_id: &str) -> String {
    format!("urn:li:person:{}", member_id)
}

#[async_trait]
impl PlatformAdapter for LinkedInAdapter {
    fn platform(&self) -> Platform {
        Platform::LinkedIn
    }

    fn auth_url(&self, state: &str, scopes: &[&str]) -> AdapterResult<String> {
        let url = Url::parse_with_params(
            AUTHORIZE_URL,
            &[
                ("response_type", "code"),
                ("client_id", self.client_id.as_str()),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("state", state),
                ("scope", scope_param(scopes).as_str()),
            ],
        )
        .map_err(|e| PlatformError::NotConfigured(format!("linkedin authorize URL: {}", e)))?;

        Ok(url.to_string())
    }

    async fn exchange_code(&self, code: &str) -> AdapterResult<Token> {
        let response = http::token_request(
            &self.http,
            Platform::LinkedIn,
            "code exchange",
            TOKEN_URL,
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

        let user = self.userinfo(&response.access_token).await?;
        let now = chrono::Utc::now().timestamp();
        Ok(response.into_token(user.sub, user.name, now))
    }

    async fn refresh_token(&self, credentials: &Credentials) -> AdapterResult<Token> {
        let refresh = credentials.refresh_token.as_ref().ok_or_else(|| {
            PlatformError::Authentication("linkedin account has no refresh token".to_string())
        })?;

        let response = http::token_request(
            &self.http,
            Platform::LinkedIn,
            "token refresh",
            TOKEN_URL,
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
        let response = self
            .http
            .post(format!("{}/rest/posts", API_BASE))
            .bearer_auth(credentials.access_token.expose_secret())
            .header("LinkedIn-Version", API_VERSION)
            .header("X-Restli-Protocol-Version", "2.0.0")
            .json(&Self::post_body(&credentials.platform_user_id, content))
            .send()
            .await
            .map_err(|e| http::request_error(Platform::LinkedIn, "publish", e))?;
        let response = http::check(Platform::LinkedIn, "publish", response).await?;

        // 201 Created with the post URN in a header and an empty body
        let post_urn = response
            .headers()
            .get("x-restli-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                PlatformError::Posting("linkedin publish: response carried no x-restli-id".to_string())
            })?;

        Ok(PublishReceipt {
            url: Some(format!("https://www.linkedin.com/feed/update/{}/", post_urn)),
            platform_post_id: post_urn,
        })
    }

    async fn get_post_analytics(
        &self,
        credentials: &Credentials,
        platform_post_id: &str,
    ) -> AdapterResult<Analytics> {
        let mut url = Url::parse(API_BASE)
            .map_err(|e| PlatformError::NotConfigured(format!("linkedin API URL: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| PlatformError::NotConfigured("linkedin API URL".to_string()))?
            .extend(["v2", "socialActions", platform_post_id]);

        let response = self
            .http
            .get(url)
            .bearer_auth(credentials.access_token.expose_secret())
            .header("X-Restli-Protocol-Version", "2.0.0")
            .send()
            .await
            .map_err(|e| http::request_error(Platform::LinkedIn, "analytics", e))?;
        let response = http::check(Platform::LinkedIn, "analytics", response).await?;

        let actions: SocialActions = response
            .json()
            .await
            .map_err(|e| http::request_error(Platform::LinkedIn, "analytics", e))?;

        Ok(actions.into_analytics(chrono::Utc::now().timestamp()))
    }

    async fn validate_token(&self, credentials: &Credentials) -> AdapterResult<bool> {
        match self.userinfo(credentials.access_token.expose_secret()).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_auth_failure() => Ok(false),
            Err(e) => Err(e),
        }
    }
}
