//! Single availability check for one handle on one platform.
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cache::TokenCache;
use crate::error::{CheckError, ProbeError};
use crate::model::CheckStatus;
use crate::platform::{normalize_handle, CheckMethod, Platform, PlatformConfig};
use crate::queue::RateLimitedQueue;

pub mod api;
pub mod content;
pub mod transport;

pub use api::{ApiCredentials, TwitchTokenProvider};
pub use transport::{HttpRequest, HttpResponse, HttpTransport, ProxySettings, ReqwestTransport};

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(7);

#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, name: &str, config: &PlatformConfig) -> Result<CheckStatus, CheckError>;
}

pub struct AvailabilityProber {
    transport: Arc<dyn HttpTransport>,
    tokens: Arc<TokenCache>,
    queue: Arc<RateLimitedQueue>,
    credentials: HashMap<Platform, ApiCredentials>,
    timeout: Duration,
}

impl AvailabilityProber {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        tokens: Arc<TokenCache>,
        queue: Arc<RateLimitedQueue>,
    ) -> Self {
        Self {
            transport,
            tokens,
            queue,
            credentials: HashMap::new(),
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn with_credentials(mut self, platform: Platform, credentials: ApiCredentials) -> Self {
        self.credentials.insert(platform, credentials);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, ProbeError> {
        match tokio::time::timeout(self.timeout, self.transport.send(request)).await {
            Ok(result) => result,
            Err(_) => Err(ProbeError::Timeout(self.timeout)),
        }
    }

    /// Record a platform-wide throttle on the queue and build the error.
    fn throttle(&self, platform: Platform, response: &HttpResponse) -> CheckError {
        let reset_in = api::rate_limit_reset(response, Utc::now());
        self.queue
            .set_rate_limit(platform.as_str(), 0, Some(reset_in));
        ProbeError::RateLimited {
            platform: platform.to_string(),
            reset_in: reset_in.to_std().unwrap_or_default(),
        }
        .into()
    }

    async fn probe_api(
        &self,
        name: &str,
        config: &PlatformConfig,
        endpoint: &str,
    ) -> Result<CheckStatus, CheckError> {
        let platform = config.platform;
        let credentials = self
            .credentials
            .get(&platform)
            .filter(|c| c.is_complete())
            .ok_or_else(|| CheckError::MissingCredentials(platform.to_string()))?;
        let url = api::users_url(endpoint, name)?;

        let mut token = self.tokens.get(platform).await?;
        let mut refreshed = false;
        loop {
            let request = HttpRequest::get(url.as_str())
                .header("Client-Id", credentials.client_id.as_str())
                .header("Authorization", format!("Bearer {}", token));
            let res = self.send(request).await?;
            match res.status {
                200..=299 => {
                    let status = api::parse_users(url.as_str(), &res.body)?;
                    info!(%platform, handle = name, status = status.as_str(), "api lookup classified handle");
                    return Ok(status);
                }
                401 if !refreshed => {
                    warn!(%platform, "api token rejected; refreshing once");
                    token = self.tokens.refresh(platform, &token).await?;
                    refreshed = true;
                }
                429 => return Err(self.throttle(platform, &res)),
                status => {
                    return Err(ProbeError::Http {
                        status,
                        url: url.to_string(),
                    }
                    .into())
                }
            }
        }
    }

    async fn probe_content(&self, name: &str, config: &PlatformConfig) -> Result<CheckStatus, CheckError> {
        let platform = config.platform;
        let url = config.profile_url(name)?;
        debug!(%platform, url = %url, "fetching profile page");
        let res = self.send(HttpRequest::get(url.as_str()).via_proxy()).await?;
        match res.status {
            200..=299 | 404 | 410 => {}
            429 => return Err(self.throttle(platform, &res)),
            status => {
                return Err(ProbeError::Http {
                    status,
                    url: url.to_string(),
                }
                .into())
            }
        }

        let verdict = content::classify(config, res.status, &res.body);
        info!(
            %platform,
            handle = name,
            rule = verdict.rule.as_str(),
            matched = verdict.matched.as_deref().unwrap_or("-"),
            status = verdict.status.as_str(),
            "content heuristic classified handle"
        );
        Ok(verdict.status)
    }
}

#[async_trait]
impl Prober for AvailabilityProber {
    async fn probe(&self, name: &str, config: &PlatformConfig) -> Result<CheckStatus, CheckError> {
        let name = normalize_handle(name);
        match config.method {
            CheckMethod::Api { endpoint } => self.probe_api(&name, config, endpoint).await,
            CheckMethod::Content => self.probe_content(&name, config).await,
        }
    }
}
