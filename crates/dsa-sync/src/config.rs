use std::path::PathBuf;
use std::time::Duration;

use dsa_adapters::{parse_base_url, DEFAULT_BASE_URL};
use dsa_core::District;
use dsa_storage::{BackoffPolicy, HttpClientConfig};
use thiserror::Error;
use url::Url;

pub const DEFAULT_USER_AGENT: &str = "dsa-export/0.1";
pub const MAX_DISTRICT_CONCURRENCY: usize = 3;
/// Longest accepted gap between requests.
pub const MAX_DELAY_SECONDS: f64 = 3600.0;

/// Backoff base used when pacing is disabled.
const FALLBACK_BACKOFF_BASE: Duration = Duration::from_millis(500);

const PROXY_SCHEMES: [&str; 4] = ["http", "https", "socks5", "socks5h"];

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("delay must be between 0 and {MAX_DELAY_SECONDS} seconds, got {0}")]
    InvalidDelay(f64),
    #[error("no districts selected")]
    EmptySelection,
    #[error("unknown district code {0}")]
    UnknownDistrict(String),
    #[error("unknown county {0}")]
    UnknownCounty(String),
    #[error("invalid proxy {proxy}: {reason}")]
    InvalidProxy { proxy: String, reason: String },
    #[error("invalid base url {url}: {reason}")]
    InvalidBaseUrl { url: String, reason: String },
    #[error("max pages must be at least 1")]
    ZeroMaxPages,
    #[error("max attempts must be at least 1")]
    ZeroMaxAttempts,
    #[error("district concurrency must be between 1 and {MAX_DISTRICT_CONCURRENCY}, got {0}")]
    Concurrency(usize),
}

#[derive(Debug, Clone)]
pub struct JobConfig {
    pub base_url: String,
    /// Minimum gap between any two outbound requests of a job.
    pub delay_seconds: f64,
    pub proxy: Option<String>,
    pub max_pages: u32,
    pub max_attempts: usize,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub district_concurrency: usize,
    pub fetch_details: bool,
    pub archive_dir: Option<PathBuf>,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            delay_seconds: 1.0,
            proxy: None,
            max_pages: 50,
            max_attempts: 3,
            http_timeout_secs: 30,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            district_concurrency: 1,
            fetch_details: false,
            archive_dir: None,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl JobConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: env_string("DSA_BASE_URL").unwrap_or(defaults.base_url),
            delay_seconds: env_parse("DSA_DELAY_SECONDS").unwrap_or(defaults.delay_seconds),
            proxy: env_string("DSA_PROXY"),
            max_pages: env_parse("DSA_MAX_PAGES").unwrap_or(defaults.max_pages),
            max_attempts: env_parse("DSA_MAX_ATTEMPTS").unwrap_or(defaults.max_attempts),
            http_timeout_secs: env_parse("DSA_HTTP_TIMEOUT_SECS")
                .unwrap_or(defaults.http_timeout_secs),
            user_agent: env_string("DSA_USER_AGENT").unwrap_or(defaults.user_agent),
            district_concurrency: env_parse("DSA_DISTRICT_CONCURRENCY")
                .unwrap_or(defaults.district_concurrency),
            fetch_details: env_flag("DSA_FETCH_DETAILS").unwrap_or(defaults.fetch_details),
            archive_dir: env_string("DSA_ARCHIVE_DIR").map(PathBuf::from),
        }
    }

    /// Check everything that can be checked without touching the network.
    pub fn validate(&self, districts: &[District]) -> Result<(), ConfigError> {
        if !(0.0..=MAX_DELAY_SECONDS).contains(&self.delay_seconds) {
            return Err(ConfigError::InvalidDelay(self.delay_seconds));
        }
        if districts.is_empty() {
            return Err(ConfigError::EmptySelection);
        }
        if self.max_pages == 0 {
            return Err(ConfigError::ZeroMaxPages);
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::ZeroMaxAttempts);
        }
        if !(1..=MAX_DISTRICT_CONCURRENCY).contains(&self.district_concurrency) {
            return Err(ConfigError::Concurrency(self.district_concurrency));
        }
        parse_base_url(&self.base_url).map_err(|e| ConfigError::InvalidBaseUrl {
            url: self.base_url.clone(),
            reason: e.to_string(),
        })?;
        if let Some(proxy) = &self.proxy {
            validate_proxy(proxy)?;
        }
        Ok(())
    }

    /// Clamped to `0..=MAX_DELAY_SECONDS`; an unrepresentable delay paces at
    /// the maximum, never at zero.
    pub fn request_gap(&self) -> Duration {
        let max = Duration::from_secs_f64(MAX_DELAY_SECONDS);
        Duration::try_from_secs_f64(self.delay_seconds.clamp(0.0, MAX_DELAY_SECONDS))
            .unwrap_or(max)
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        let gap = self.request_gap();
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            proxy: self.proxy.clone(),
            min_request_gap: gap,
            backoff: BackoffPolicy {
                max_attempts: self.max_attempts,
                base_delay: if gap.is_zero() { FALLBACK_BACKOFF_BASE } else { gap },
                ..Default::default()
            },
        }
    }
}

fn validate_proxy(proxy: &str) -> Result<(), ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidProxy {
        proxy: proxy.to_string(),
        reason,
    };
    let url = Url::parse(proxy).map_err(|e| invalid(e.to_string()))?;
    if !PROXY_SCHEMES.contains(&url.scheme()) {
        return Err(invalid(format!("unsupported scheme {}", url.scheme())));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(invalid("missing host".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one() -> Vec<District> {
        vec![District {
            county: "Alameda".into(),
            name: "Alameda Unified".into(),
            code: "360".into(),
        }]
    }

    #[test]
    fn defaults_are_valid() {
        assert_eq!(JobConfig::default().validate(&one()), Ok(()));
    }

    #[test]
    fn bad_settings_are_rejected() {
        let cases = [
            (JobConfig { delay_seconds: -0.5, ..Default::default() }, ConfigError::InvalidDelay(-0.5)),
            (JobConfig { max_pages: 0, ..Default::default() }, ConfigError::ZeroMaxPages),
            (JobConfig { max_attempts: 0, ..Default::default() }, ConfigError::ZeroMaxAttempts),
            (JobConfig { district_concurrency: 4, ..Default::default() }, ConfigError::Concurrency(4)),
        ];
        for (config, expected) in cases {
            assert_eq!(config.validate(&one()), Err(expected));
        }
        assert_eq!(JobConfig::default().validate(&[]), Err(ConfigError::EmptySelection));
        assert!(JobConfig { delay_seconds: f64::NAN, ..Default::default() }
            .validate(&one())
            .is_err());
    }

    #[test]
    fn huge_delays_are_rejected_and_never_unpace() {
        for delay in [1e20, MAX_DELAY_SECONDS + 1.0, f64::INFINITY] {
            let config = JobConfig { delay_seconds: delay, ..Default::default() };
            assert_eq!(config.validate(&one()), Err(ConfigError::InvalidDelay(delay)));
            assert_eq!(config.request_gap(), Duration::from_secs(3600));
        }
        let edge = JobConfig { delay_seconds: MAX_DELAY_SECONDS, ..Default::default() };
        assert_eq!(edge.validate(&one()), Ok(()));
        let nan = JobConfig { delay_seconds: f64::NAN, ..Default::default() };
        assert_eq!(nan.request_gap(), Duration::from_secs(3600));
    }

    #[test]
    fn proxies_need_a_known_scheme_and_host() {
        for ok in ["http://proxy.local:8080", "socks5h://user:pw@10.0.0.2:1080"] {
            let config = JobConfig { proxy: Some(ok.into()), ..Default::default() };
            assert_eq!(config.validate(&one()), Ok(()), "{ok}");
        }
        for bad in ["proxy.local:8080", "ftp://proxy.local", "http://[not-a-host"] {
            let config = JobConfig { proxy: Some(bad.into()), ..Default::default() };
            assert!(
                matches!(config.validate(&one()), Err(ConfigError::InvalidProxy { .. })),
                "{bad}"
            );
        }
    }

    #[test]
    fn backoff_starts_at_the_delay() {
        let config = JobConfig { delay_seconds: 2.5, max_attempts: 4, ..Default::default() };
        let http = config.http_client_config();
        assert_eq!(http.min_request_gap, Duration::from_millis(2500));
        assert_eq!(http.backoff.base_delay, Duration::from_millis(2500));
        assert_eq!(http.backoff.max_attempts, 4);

        let unpaced = JobConfig { delay_seconds: 0.0, ..Default::default() }.http_client_config();
        assert_eq!(unpaced.min_request_gap, Duration::ZERO);
        assert_eq!(unpaced.backoff.base_delay, FALLBACK_BACKOFF_BASE);
    }
}
