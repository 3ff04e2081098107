//! HTTP transport used by the prober.
//!
//! Profile-page fetches go out through a rotating-session proxy with a
//! randomized User-Agent; every proxied request gets a new session id.
use async_trait::async_trait;
use rand::seq::IndexedRandom;
use reqwest::{Client, Method, Proxy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::error::ProbeError;

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_4 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Mobile/15E148 Safari/604.1",
];

pub fn random_user_agent() -> &'static str {
    USER_AGENTS
        .choose(&mut rand::rng())
        .copied()
        .unwrap_or(USER_AGENTS[0])
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub via_proxy: bool,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            via_proxy: false,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn via_proxy(mut self) -> Self {
        self.via_proxy = true;
        self
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub status: u16,
    /// Header names are lower-cased.
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, ProbeError>;
}

/// Rotating-session proxy endpoint. The username is suffixed with
/// `-session-<id>` so each request exits through a fresh session.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProxySettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for ProxySettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxySettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl ProxySettings {
    pub fn session_url(&self, session_id: &str) -> String {
        format!(
            "http://{}-session-{}:{}@{}:{}",
            self.username, session_id, self.password, self.host, self.port
        )
    }
}

pub struct ReqwestTransport {
    direct: Client,
    proxy: Option<ProxySettings>,
    timeout: Duration,
}

impl fmt::Debug for ReqwestTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReqwestTransport")
            .field("proxy", &self.proxy)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ReqwestTransport {
    pub fn new(proxy: Option<ProxySettings>, timeout: Duration) -> Result<Self, ProbeError> {
        let direct = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| client_error("direct client", err))?;
        Ok(Self {
            direct,
            proxy,
            timeout,
        })
    }

    fn client_for(&self, request: &HttpRequest) -> Result<Client, ProbeError> {
        let Some(proxy) = self.proxy.as_ref().filter(|_| request.via_proxy) else {
            return Ok(self.direct.clone());
        };
        let session = Uuid::new_v4().simple().to_string();
        debug!(host = %proxy.host, session = %session, "routing request through proxy session");
        let proxy = Proxy::all(proxy.session_url(&session))
            .map_err(|err| client_error("proxy settings", err))?;
        Client::builder()
            .timeout(self.timeout)
            .proxy(proxy)
            .build()
            .map_err(|err| client_error("proxied client", err))
    }
}

fn client_error(what: &str, err: reqwest::Error) -> ProbeError {
    ProbeError::Network {
        url: what.to_string(),
        message: err.to_string(),
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, ProbeError> {
        let client = self.client_for(&request)?;
        let mut builder = client.request(request.method.clone(), &request.url);
        if request.header_value("User-Agent").is_none() {
            builder = builder
                .header("User-Agent", random_user_agent())
                .header("Accept-Language", "en-US,en;q=0.9");
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let res = builder.send().await.map_err(|err| {
            if err.is_timeout() {
                ProbeError::Timeout(self.timeout)
            } else {
                ProbeError::Network {
                    url: request.url.clone(),
                    message: err.to_string(),
                }
            }
        })?;

        let status = res.status().as_u16();
        let headers = res
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = res.text().await.map_err(|err| ProbeError::Network {
            url: request.url.clone(),
            message: err.to_string(),
        })?;
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_url_embeds_session_id() {
        let proxy = ProxySettings {
            host: "proxy.local".into(),
            port: 7000,
            username: "user".into(),
            password: "pw".into(),
        };
        assert_eq!(
            proxy.session_url("abc123"),
            "http://user-session-abc123:pw@proxy.local:7000"
        );
        assert!(!format!("{:?}", proxy).contains("pw"));
    }

    #[test]
    fn random_user_agent_comes_from_pool() {
        for _ in 0..20 {
            assert!(USER_AGENTS.contains(&random_user_agent()));
        }
    }

    #[test]
    fn request_builder_collects_headers() {
        let req = HttpRequest::get("https://x.com/jack")
            .header("Client-Id", "abc")
            .via_proxy();
        assert!(req.via_proxy);
        assert_eq!(req.header_value("client-id"), Some("abc"));
        assert_eq!(req.method, Method::GET);
    }

    #[test]
    fn response_headers_are_case_insensitive() {
        let res = HttpResponse::new(429, "").with_header("Ratelimit-Reset", "1700000000");
        assert_eq!(res.header("ratelimit-reset"), Some("1700000000"));
        assert_eq!(res.header("RATELIMIT-RESET"), Some("1700000000"));
    }

    #[test]
    fn transport_builds_without_proxy() {
        let transport = ReqwestTransport::new(None, Duration::from_secs(7)).unwrap();
        let client = transport.client_for(&HttpRequest::get("https://example.com").via_proxy());
        assert!(client.is_ok());
    }
}
