//! HTTP plumbing shared by the platform adapters
//!
//! Every adapter maps HTTP failures through [`error_for_status`] so the same
//! response classifies the same way on every platform.

use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Response, StatusCode};
use secrecy::SecretString;
use serde::Deserialize;

use super::AdapterResult;
use crate::error::PlatformError;
use crate::types::{Platform, Token};

/// Build the HTTP client an adapter uses for all its requests
pub(crate) fn build_client(timeout: Duration) -> AdapterResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("cadence/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| PlatformError::NotConfigured(format!("HTTP client: {}", e)))
}

/// Classify a non-success response.
///
/// - 401 → `Authentication` (revoked or invalid grant)
/// - 403 → `Validation` when the body rejects the content itself (X answers
///   a duplicate tweet with 403), otherwise `Authentication`
/// - 400 with `invalid_grant` → `Authentication`
/// - 408 and 5xx → `Network` (transient)
/// - 429 → `RateLimit`, with the cool-down from the response headers
/// - other 4xx → `Validation` (the platform rejected the request)
pub fn error_for_status(
    platform: Platform,
    context: &str,
    status: StatusCode,
    headers: &HeaderMap,
    body: &str,
) -> PlatformError {
    let detail = format!("{} {} returned {}: {}", platform, context, status, truncate(body, 300));

    match status.as_u16() {
        401 => PlatformError::Authentication(detail),
        403 if is_content_rejection(body) => PlatformError::Validation(detail),
        403 => PlatformError::Authentication(detail),
        400 if body.contains("invalid_grant") => PlatformError::Authentication(detail),
        408 => PlatformError::Network(detail),
        429 => PlatformError::RateLimit {
            message: detail,
            retry_after: retry_after(headers, chrono::Utc::now().timestamp()),
        },
        500..=599 => PlatformError::Network(detail),
        400..=499 => PlatformError::Validation(detail),
        _ => PlatformError::Posting(detail),
    }
}

/// Phrases platforms use when a 403 refuses the post rather than the grant
const CONTENT_REJECTIONS: [&str; 5] = [
    "duplicate",
    "not allowed to create a tweet",
    "content policy",
    "violat",
    "spam",
];

fn is_content_rejection(body: &str) -> bool {
    let body = body.to_lowercase();
    CONTENT_REJECTIONS.iter().any(|phrase| body.contains(phrase))
}

/// Pass successful responses through, classify the rest
pub(crate) async fn check(platform: Platform, context: &str, response: Response) -> AdapterResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let headers = response.headers().clone();
    let body = response.text().await.unwrap_or_default();
    Err(error_for_status(platform, context, status, &headers, &body))
}

/// Classify a transport-level failure
pub(crate) fn request_error(platform: Platform, context: &str, error: reqwest::Error) -> PlatformError {
    if error.is_decode() {
        PlatformError::Posting(format!("{} {}: unexpected response: {}", platform, context, error))
    } else if error.is_builder() {
        PlatformError::NotConfigured(format!("{} {}: {}", platform, context, error))
    } else {
        // timeouts, connection resets, DNS failures
        PlatformError::Network(format!("{} {}: {}", platform, context, error))
    }
}

/// Cool-down requested by a rate-limited response.
///
/// Understands `Retry-After` (seconds or HTTP date) and the reset headers
/// used by X (`x-rate-limit-reset`, Unix seconds) and Mastodon
/// (`x-ratelimit-reset`, RFC 3339).
pub fn retry_after(headers: &HeaderMap, now: i64) -> Option<Duration> {
    if let Some(value) = header(headers, RETRY_AFTER.as_str()) {
        if let Ok(secs) = value.parse::<u64>() {
            return Some(Duration::from_secs(secs));
        }
        if let Ok(at) = chrono::DateTime::parse_from_rfc2822(value) {
            return Some(until(at.timestamp(), now));
        }
    }

    if let Some(value) = header(headers, "x-rate-limit-reset") {
        if let Ok(at) = value.parse::<i64>() {
            return Some(until(at, now));
        }
    }

    if let Some(value) = header(headers, "x-ratelimit-reset") {
        if let Ok(at) = chrono::DateTime::parse_from_rfc3339(value) {
            return Some(until(at.timestamp(), now));
        }
    }

    None
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

fn until(at: i64, now: i64) -> Duration {
    Duration::from_secs(at.saturating_sub(now).max(0) as u64)
}

fn truncate(body: &str, max_chars: usize) -> String {
    match body.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &body[..idx]),
        None => body.to_string(),
    }
}

/// RFC 6749 token endpoint response
#[derive(Deserialize)]
pub(crate) struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

impl TokenResponse {
    /// Convert to a [`Token`] with an absolute expiry
    pub fn into_token(self, platform_user_id: String, handle: Option<String>, now: i64) -> Token {
        Token {
            access_token: SecretString::from(self.access_token),
            refresh_token: self.refresh_token.map(SecretString::from),
            expires_at: self.expires_in.map(|secs| now + secs),
            platform_user_id,
            handle,
        }
    }
}

/// POST a form to an OAuth token endpoint.
///
/// With `basic_auth` the client credentials go in the Authorization header,
/// otherwise the caller includes them in `form`.
pub(crate) async fn token_request(
    client: &reqwest::Client,
    platform: Platform,
    context: &str,
    url: &str,
    form: &[(&str, &str)],
    basic_auth: Option<(&str, &str)>,
) -> AdapterResult<TokenResponse> {
    let mut request = client
        .post(url)
        .header(reqwest::header::ACCEPT, "application/json")
        .form(form);
    if let Some((client_id, client_secret)) = basic_auth {
        request = request.basic_auth(client_id, Some(client_secret));
    }

    let response = request
        .send()
        .await
        .map_err(|e| request_error(platform, context, e))?;
    let response = check(platform, context, response).await?;

    response
        .json::<TokenResponse>()
        .await
        .map_err(|e| request_error(platform, context, e))
}
