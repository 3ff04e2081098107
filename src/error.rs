//! Error taxonomy for the check engine.
use std::time::Duration;
use thiserror::Error;

/// Failure while talking to a platform. Every variant is retryable by the
/// queue; the prober never retries on its own except for a single token
/// refresh after a 401.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("request to {url} failed: {message}")]
    Network { url: String, message: String },
    #[error("unexpected HTTP status {status} from {url}")]
    Http { status: u16, url: String },
    #[error("could not parse response from {url}: {message}")]
    Parse { url: String, message: String },
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("rate limited by {platform}; window resets in {reset_in:?}")]
    RateLimited { platform: String, reset_in: Duration },
}

#[derive(Debug, Error)]
pub enum CheckError {
    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(String),
    #[error("missing API credentials for {0}")]
    MissingCredentials(String),
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error("persistence failure: {0:#}")]
    Persistence(anyhow::Error),
    #[error("handle {0} not found")]
    HandleNotFound(String),
}

impl CheckError {
    /// Whether the queue should schedule another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CheckError::Probe(_))
    }

    /// Configuration problems are fatal for the platform, never for the batch.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            CheckError::UnsupportedPlatform(_) | CheckError::MissingCredentials(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_failures_are_retryable() {
        let timeout = CheckError::from(ProbeError::Timeout(Duration::from_secs(7)));
        assert!(timeout.is_retryable());
        let limited = CheckError::from(ProbeError::RateLimited {
            platform: "twitch".into(),
            reset_in: Duration::from_secs(300),
        });
        assert!(limited.is_retryable());
        assert!(!limited.is_config());
    }

    #[test]
    fn config_errors_are_terminal() {
        let err = CheckError::UnsupportedPlatform("myspace".into());
        assert!(err.is_config());
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "unsupported platform: myspace");
        assert!(!CheckError::Persistence(anyhow::anyhow!("disk full")).is_retryable());
    }
}
