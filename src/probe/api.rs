//! Helix (Twitch) user lookup and app-access-token grant.
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use super::transport::{HttpRequest, HttpResponse, HttpTransport};
use crate::cache::{IssuedToken, TokenProvider};
use crate::error::{CheckError, ProbeError};
use crate::model::CheckStatus;
use crate::platform::Platform;

pub const TWITCH_TOKEN_URL: &str = "https://id.twitch.tv/oauth2/token";
/// Used when a 429 carries no usable reset header.
pub const DEFAULT_RATE_LIMIT_RESET_SECS: i64 = 300;
/// Longest throttle window honoured from provider headers.
pub const MAX_RATE_LIMIT_RESET_SECS: i64 = 24 * 60 * 60;
/// Twitch app tokens live about 60 days; anything longer is clamped.
pub const MAX_TOKEN_LIFETIME_SECS: i64 = 60 * 24 * 60 * 60;

#[derive(Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiCredentials {
    pub client_id: String,
    pub client_secret: String,
}

impl fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

impl ApiCredentials {
    pub fn is_complete(&self) -> bool {
        !self.client_id.trim().is_empty() && !self.client_secret.trim().is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct UsersResponse {
    data: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

pub fn users_url(endpoint: &str, login: &str) -> Result<Url, ProbeError> {
    Url::parse_with_params(endpoint, &[("login", login)]).map_err(|err| ProbeError::Parse {
        url: endpoint.to_string(),
        message: err.to_string(),
    })
}

/// An empty `data` array means nobody holds the login.
pub fn parse_users(url: &str, body: &str) -> Result<CheckStatus, ProbeError> {
    let parsed: UsersResponse = serde_json::from_str(body).map_err(|err| ProbeError::Parse {
        url: url.to_string(),
        message: err.to_string(),
    })?;
    Ok(if parsed.data.is_empty() {
        CheckStatus::Available
    } else {
        CheckStatus::Unavailable
    })
}

/// Time until the provider's rate-limit window resets. Reads the epoch
/// `Ratelimit-Reset` header, then `Retry-After`, else the default.
pub fn rate_limit_reset(response: &HttpResponse, now: DateTime<Utc>) -> Duration {
    if let Some(reset) = response
        .header("ratelimit-reset")
        .and_then(|v| v.trim().parse::<i64>().ok())
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
    {
        return (reset - now).clamp(Duration::zero(), Duration::seconds(MAX_RATE_LIMIT_RESET_SECS));
    }
    if let Some(secs) = response
        .header("retry-after")
        .and_then(|v| v.trim().parse::<i64>().ok())
    {
        return Duration::seconds(secs.clamp(0, MAX_RATE_LIMIT_RESET_SECS));
    }
    Duration::seconds(DEFAULT_RATE_LIMIT_RESET_SECS)
}

/// Client-credentials grant against the Twitch identity endpoint.
pub struct TwitchTokenProvider {
    transport: Arc<dyn HttpTransport>,
    credentials: ApiCredentials,
    token_url: String,
}

impl TwitchTokenProvider {
    pub fn new(transport: Arc<dyn HttpTransport>, credentials: ApiCredentials) -> Self {
        Self::with_token_url(transport, credentials, TWITCH_TOKEN_URL)
    }

    pub fn with_token_url(
        transport: Arc<dyn HttpTransport>,
        credentials: ApiCredentials,
        token_url: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            credentials,
            token_url: token_url.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for TwitchTokenProvider {
    async fn issue_token(&self, platform: Platform) -> Result<IssuedToken, CheckError> {
        if platform != Platform::Twitch {
            return Err(CheckError::MissingCredentials(platform.to_string()));
        }
        if !self.credentials.is_complete() {
            return Err(CheckError::MissingCredentials(platform.to_string()));
        }
        let url = Url::parse_with_params(
            &self.token_url,
            &[
                ("client_id", self.credentials.client_id.as_str()),
                ("client_secret", self.credentials.client_secret.as_str()),
                ("grant_type", "client_credentials"),
            ],
        )
        .map_err(|err| ProbeError::Parse {
            url: self.token_url.clone(),
            message: err.to_string(),
        })?;

        let res = self.transport.send(HttpRequest::post(url.as_str())).await?;
        if !(200..300).contains(&res.status) {
            return Err(ProbeError::Http {
                status: res.status,
                url: self.token_url.clone(),
            }
            .into());
        }
        let payload: TokenResponse =
            serde_json::from_str(&res.body).map_err(|err| ProbeError::Parse {
                url: self.token_url.clone(),
                message: err.to_string(),
            })?;
        Ok(IssuedToken {
            access_token: payload.access_token,
            expires_in: Duration::seconds(payload.expires_in.clamp(0, MAX_TOKEN_LIFETIME_SECS)),
        })
    }
}
