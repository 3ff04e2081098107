//! Static per-platform probing configuration.
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use reqwest::Url;

use crate::error::{CheckError, ProbeError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Twitch,
    Twitter,
    Instagram,
    TikTok,
    YouTube,
    Kick,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Twitch => "twitch",
            Platform::Twitter => "twitter",
            Platform::Instagram => "instagram",
            Platform::TikTok => "tiktok",
            Platform::YouTube => "youtube",
            Platform::Kick => "kick",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = CheckError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "twitch" => Ok(Platform::Twitch),
            "twitter" | "x" => Ok(Platform::Twitter),
            "instagram" => Ok(Platform::Instagram),
            "tiktok" => Ok(Platform::TikTok),
            "youtube" => Ok(Platform::YouTube),
            "kick" => Ok(Platform::Kick),
            _ => Err(CheckError::UnsupportedPlatform(s.to_string())),
        }
    }
}

/// How a platform is probed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckMethod {
    /// Authenticated user-lookup endpoint.
    Api { endpoint: &'static str },
    /// Fetch the public profile page and inspect its content.
    Content,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformConfig {
    pub platform: Platform,
    /// Profile URL template; `{name}` is replaced by the handle.
    pub probe_url: &'static str,
    pub method: CheckMethod,
    pub requires_at_symbol: bool,
    pub available_indicators: &'static [&'static str],
    pub taken_indicators: &'static [&'static str],
    pub not_found_text: &'static [&'static str],
}

impl PlatformConfig {
    /// Public profile URL for an already-normalized handle. The handle is
    /// percent-encoded as a single path segment.
    pub fn profile_url(&self, name: &str) -> Result<Url, ProbeError> {
        let segment = if self.requires_at_symbol {
            format!("@{}", name)
        } else {
            name.to_string()
        };
        let (base, suffix) = self
            .probe_url
            .split_once("{name}")
            .unwrap_or((self.probe_url, ""));
        let invalid = |message: &str| ProbeError::Parse {
            url: self.probe_url.to_string(),
            message: message.to_string(),
        };
        let mut url = Url::parse(base).map_err(|err| invalid(&err.to_string()))?;
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| invalid("template cannot carry a path"))?;
            path.pop_if_empty().push(&segment);
            if !suffix.is_empty() {
                path.extend(suffix.trim_start_matches('/').split('/'));
            }
        }
        Ok(url)
    }
}

/// Trim whitespace and any leading `@` the user may have typed.
pub fn normalize_handle(name: &str) -> String {
    name.trim().trim_start_matches('@').to_ascii_lowercase()
}

/// Read-only lookup from platform name to its probing configuration.
#[derive(Debug, Clone)]
pub struct PlatformRegistry {
    configs: HashMap<Platform, PlatformConfig>,
}

impl Default for PlatformRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl PlatformRegistry {
    pub fn new(configs: impl IntoIterator<Item = PlatformConfig>) -> Self {
        Self {
            configs: configs.into_iter().map(|c| (c.platform, c)).collect(),
        }
    }

    pub fn builtin() -> Self {
        Self::new(builtin_configs())
    }

    /// Resolve a platform name. Unknown or unregistered platforms are an
    /// error; callers decide what that means for the handle.
    pub fn lookup(&self, name: &str) -> Result<&PlatformConfig, CheckError> {
        let platform: Platform = name.parse()?;
        self.configs
            .get(&platform)
            .ok_or_else(|| CheckError::UnsupportedPlatform(name.to_string()))
    }

    pub fn platforms(&self) -> Vec<Platform> {
        let mut platforms: Vec<Platform> = self.configs.keys().copied().collect();
        platforms.sort();
        platforms
    }
}

fn builtin_configs() -> Vec<PlatformConfig> {
    vec![
        PlatformConfig {
            platform: Platform::Twitch,
            probe_url: "https://www.twitch.tv/{name}",
            method: CheckMethod::Api {
                endpoint: "https://api.twitch.tv/helix/users",
            },
            requires_at_symbol: false,
            available_indicators: &[],
            taken_indicators: &[],
            not_found_text: &[],
        },
        PlatformConfig {
            platform: Platform::Twitter,
            probe_url: "https://x.com/{name}",
            method: CheckMethod::Content,
            requires_at_symbol: false,
            available_indicators: &["This account doesn't exist"],
            taken_indicators: &["Followers", "Following"],
            not_found_text: &["Try searching for another"],
        },
        PlatformConfig {
            platform: Platform::Instagram,
            probe_url: "https://www.instagram.com/{name}/",
            method: CheckMethod::Content,
            requires_at_symbol: false,
            available_indicators: &[
                "Sorry, this page isn't available",
                "The link you followed may be broken",
            ],
            taken_indicators: &["\"profilePage_", "\"edge_followed_by\""],
            not_found_text: &["Page Not Found"],
        },
        PlatformConfig {
            platform: Platform::TikTok,
            probe_url: "https://www.tiktok.com/{name}",
            method: CheckMethod::Content,
            requires_at_symbol: true,
            available_indicators: &["Couldn't find this account"],
            taken_indicators: &["\"uniqueId\":\"", "\"followerCount\""],
            not_found_text: &["Looking for videos? Try browsing our trending creators"],
        },
        PlatformConfig {
            platform: Platform::YouTube,
            probe_url: "https://www.youtube.com/{name}",
            method: CheckMethod::Content,
            requires_at_symbol: true,
            available_indicators: &["This page isn't available"],
            taken_indicators: &["\"channelId\"", "subscribers"],
            not_found_text: &["404 Not Found"],
        },
        PlatformConfig {
            platform: Platform::Kick,
            probe_url: "https://kick.com/{name}",
            method: CheckMethod::Content,
            requires_at_symbol: false,
            available_indicators: &["Oops, Something went wrong"],
            taken_indicators: &["\"followers_count\"", "\"livestream\""],
            not_found_text: &["page you are looking for"],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_known_platforms() {
        let registry = PlatformRegistry::builtin();
        let twitch = registry.lookup("twitch").unwrap();
        assert_eq!(
            twitch.method,
            CheckMethod::Api {
                endpoint: "https://api.twitch.tv/helix/users"
            }
        );
        let twitter = registry.lookup("X").unwrap();
        assert_eq!(twitter.platform, Platform::Twitter);
        assert_eq!(twitter.method, CheckMethod::Content);
        assert_eq!(registry.platforms().len(), 6);
    }

    #[test]
    fn unknown_platform_is_an_error() {
        let registry = PlatformRegistry::builtin();
        match registry.lookup("myspace") {
            Err(CheckError::UnsupportedPlatform(name)) => assert_eq!(name, "myspace"),
            other => panic!("unexpected result: {:?}", other.map(|c| c.platform)),
        }
    }

    #[test]
    fn unregistered_platform_is_an_error() {
        let registry = PlatformRegistry::new(
            builtin_configs()
                .into_iter()
                .filter(|c| matches!(c.method, CheckMethod::Api { .. })),
        );
        assert!(registry.lookup("twitch").is_ok());
        assert!(matches!(
            registry.lookup("tiktok"),
            Err(CheckError::UnsupportedPlatform(_))
        ));
    }

    #[test]
    fn profile_url_adds_at_symbol_when_required() {
        let registry = PlatformRegistry::builtin();
        let tiktok = registry.lookup("tiktok").unwrap();
        assert_eq!(
            tiktok
                .profile_url(&normalize_handle("@SomeOne "))
                .unwrap()
                .as_str(),
            "https://www.tiktok.com/@someone"
        );
        let twitter = registry.lookup("twitter").unwrap();
        assert_eq!(twitter.profile_url("jack").unwrap().as_str(), "https://x.com/jack");
        let instagram = registry.lookup("instagram").unwrap();
        assert_eq!(
            instagram.profile_url("jack").unwrap().as_str(),
            "https://www.instagram.com/jack/"
        );
    }

    #[test]
    fn profile_url_encodes_reserved_characters() {
        let registry = PlatformRegistry::builtin();
        let twitter = registry.lookup("twitter").unwrap();
        let url = twitter.profile_url("a/b?c#d").unwrap();
        assert_eq!(url.as_str(), "https://x.com/a%2Fb%3Fc%23d");
        assert_eq!(url.path_segments().map(|s| s.count()), Some(1));
        assert!(url.query().is_none());
        assert!(url.fragment().is_none());
    }
}
