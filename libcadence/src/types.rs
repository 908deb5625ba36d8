//! Core types for Cadence

use std::str::FromStr;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorClass;

/// Supported external platforms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Twitter,
    LinkedIn,
    Mastodon,
}

impl Platform {
    pub const ALL: [Platform; 3] = [Platform::Twitter, Platform::LinkedIn, Platform::Mastodon];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Twitter => "twitter",
            Platform::LinkedIn => "linkedin",
            Platform::Mastodon => "mastodon",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "twitter" | "x" => Ok(Platform::Twitter),
            "linkedin" => Ok(Platform::LinkedIn),
            "mastodon" => Ok(Platform::Mastodon),
            other => Err(format!(
                "Unknown platform '{}'. Valid options: twitter, linkedin, mastodon",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Expired,
    Revoked,
    RateLimited,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Expired => "expired",
            AccountStatus::Revoked => "revoked",
            AccountStatus::RateLimited => "rate_limited",
        }
    }

    /// Expired and revoked accounts need the user to reconnect
    pub fn requires_reconnect(&self) -> bool {
        matches!(self, AccountStatus::Expired | AccountStatus::Revoked)
    }
}

impl FromStr for AccountStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(AccountStatus::Active),
            "expired" => Ok(AccountStatus::Expired),
            "revoked" => Ok(AccountStatus::Revoked),
            "rate_limited" => Ok(AccountStatus::RateLimited),
            other => Err(format!("unknown account status '{}'", other)),
        }
    }
}

/// A team's connection to one platform identity.
///
/// Never carries token material; use
/// [`AccountRepository::with_credentials`](crate::accounts::AccountRepository::with_credentials)
/// to work with the decrypted tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocialAccount {
    pub id: String,
    pub team_id: String,
    pub platform: Platform,
    pub platform_user_id: String,
    pub handle: Option<String>,
    pub status: AccountStatus,
    /// End of the rate-limit cool-down (Unix timestamp)
    pub rate_limited_until: Option<i64>,
    pub connected_at: i64,
    pub last_synced_at: Option<i64>,
    pub deleted_at: Option<i64>,
    /// Access token expiry, `None` for non-expiring tokens
    pub token_expires_at: Option<i64>,
    /// Bumped on every token write; used for conditional updates
    pub token_version: i64,
}

impl SocialAccount {
    /// True when the token is expired or will expire within `window_secs`
    pub fn expires_within(&self, now: i64, window_secs: i64) -> bool {
        match self.token_expires_at {
            Some(expires_at) => expires_at <= now + window_secs,
            None => false,
        }
    }

    pub fn is_expired(&self, now: i64) -> bool {
        matches!(self.token_expires_at, Some(expires_at) if expires_at <= now)
    }
}

/// Decrypted credentials, only ever lent out for the duration of one call
#[derive(Debug)]
pub struct Credentials {
    pub access_token: SecretString,
    pub refresh_token: Option<SecretString>,
    pub expires_at: Option<i64>,
    pub platform_user_id: String,
}

/// Token set returned by a platform's OAuth endpoints
#[derive(Debug)]
pub struct Token {
    pub access_token: SecretString,
    pub refresh_token: Option<SecretString>,
    /// Absolute expiry (Unix timestamp)
    pub expires_at: Option<i64>,
    pub platform_user_id: String,
    pub handle: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub platform_post_id: String,
    pub url: Option<String>,
}

/// Engagement metrics for one published item
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Analytics {
    pub likes: i64,
    pub reposts: i64,
    pub replies: i64,
    pub impressions: Option<i64>,
    pub fetched_at: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PostStatus {
    Draft,
    Scheduled,
    Queued,
    Published,
    Failed,
}

impl PostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostStatus::Draft => "draft",
            PostStatus::Scheduled => "scheduled",
            PostStatus::Queued => "queued",
            PostStatus::Published => "published",
            PostStatus::Failed => "failed",
        }
    }
}

impl FromStr for PostStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(PostStatus::Draft),
            "scheduled" => Ok(PostStatus::Scheduled),
            "queued" => Ok(PostStatus::Queued),
            "published" => Ok(PostStatus::Published),
            "failed" => Ok(PostStatus::Failed),
            other => Err(format!("unknown post status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub team_id: String,
    pub content: String,
    pub platforms: Vec<Platform>,
    pub created_at: i64,
    pub scheduled_at: Option<i64>,
    pub status: PostStatus,
    /// Lease or retry time for queued posts
    pub next_attempt_at: Option<i64>,
}

impl Post {
    pub fn new(team_id: String, content: String, platforms: Vec<Platform>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            team_id,
            content,
            platforms,
            created_at: chrono::Utc::now().timestamp(),
            scheduled_at: None,
            status: PostStatus::Draft,
            next_attempt_at: None,
        }
    }

    /// Schedule the post for `at` (Unix timestamp)
    pub fn scheduled(mut self, at: i64) -> Self {
        self.scheduled_at = Some(at);
        self.status = PostStatus::Scheduled;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Pending,
    Published,
    Failed,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultStatus::Pending => "pending",
            ResultStatus::Published => "published",
            ResultStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ResultStatus::Pending)
    }
}

impl FromStr for ResultStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ResultStatus::Pending),
            "published" => Ok(ResultStatus::Published),
            "failed" => Ok(ResultStatus::Failed),
            other => Err(format!("unknown result status '{}'", other)),
        }
    }
}

/// Outcome of publishing one post to one platform
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformResult {
    pub post_id: String,
    pub platform: Platform,
    pub account_id: Option<String>,
    pub status: ResultStatus,
    pub platform_post_id: Option<String>,
    pub error_message: Option<String>,
    #[serde(skip)]
    pub error_class: Option<ErrorClass>,
    pub published_at: Option<i64>,
    pub analytics: Option<Analytics>,
}

/// Retry bookkeeping for one (post, platform) pair
#[derive(Debug, Clone)]
pub struct PublishAttempt {
    pub post_id: String,
    pub platform: Platform,
    pub account_id: Option<String>,
    pub attempts: u32,
    pub last_error_class: ErrorClass,
    pub last_error: String,
    pub next_retry_at: Option<i64>,
}

/// A quarantined (post, platform) pair that exhausted its retries
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterEntry {
    pub id: String,
    pub post_id: String,
    pub platform: Platform,
    pub account_id: Option<String>,
    pub attempts: u32,
    pub last_error: String,
    pub error_class: String,
    pub created_at: i64,
    pub resolved_at: Option<i64>,
}
