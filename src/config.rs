//! Runtime configuration.

use crate::error::{Error, Result};
use crate::observability::TtlPolicy;
use std::str::FromStr;
use std::time::Duration;

/// Default bound B of every cached list.
pub const DEFAULT_LIST_BOUND: usize = 1000;

/// Default deadline for a single cache-store call.
pub const DEFAULT_CACHE_TIMEOUT: Duration = Duration::from_millis(100);

/// Default number of recipients written concurrently during fan-out.
/// Override with FEEDKIT_FANOUT_CONCURRENCY.
pub const DEFAULT_FANOUT_CONCURRENCY: usize = 16;

/// How `publish` waits for follower fan-out.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum FanoutMode {
    /// Follower fan-out runs detached; `publish` returns after the author's
    /// own timeline is written.
    #[default]
    Background,
    /// `publish` waits for the detached fan-out task to finish.
    Inline,
}

impl FromStr for FanoutMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "background" => Ok(FanoutMode::Background),
            "inline" => Ok(FanoutMode::Inline),
            other => Err(Error::ConfigError(format!("unknown fan-out mode: {}", other))),
        }
    }
}

/// Tunables shared by the caches, the fan-out engine and the paginators.
#[derive(Clone, Debug)]
pub struct FeedConfig {
    /// Max items kept per cached list.
    pub list_bound: usize,
    pub cache_timeout: Duration,
    pub ttl_policy: TtlPolicy,
    pub fanout_mode: FanoutMode,
    pub fanout_concurrency: usize,
    /// Per-recipient retries after the first failed write.
    pub fanout_retries: u32,
    /// Base delay of the exponential retry backoff.
    pub fanout_backoff: Duration,
    pub endless_page_size: usize,
    pub endless_max_page_size: usize,
    pub offset_page_size: usize,
    pub offset_max_page_size: usize,
    pub min_body_chars: usize,
    pub max_body_chars: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        FeedConfig {
            list_bound: DEFAULT_LIST_BOUND,
            cache_timeout: DEFAULT_CACHE_TIMEOUT,
            ttl_policy: TtlPolicy::Infinite,
            fanout_mode: FanoutMode::Background,
            fanout_concurrency: DEFAULT_FANOUT_CONCURRENCY,
            fanout_retries: 2,
            fanout_backoff: Duration::from_millis(100),
            endless_page_size: 20,
            endless_max_page_size: 100,
            offset_page_size: 20,
            offset_max_page_size: 20,
            min_body_chars: 6,
            max_body_chars: 140,
        }
    }
}

impl FeedConfig {
    /// Build from `FEEDKIT_*` environment variables.
    ///
    /// Missing or unparsable values keep their defaults.
    pub fn from_env() -> Self {
        let defaults = FeedConfig::default();
        FeedConfig {
            list_bound: env_or("FEEDKIT_LIST_BOUND", defaults.list_bound),
            cache_timeout: Duration::from_millis(env_or(
                "FEEDKIT_CACHE_TIMEOUT_MS",
                defaults.cache_timeout.as_millis() as u64,
            )),
            ttl_policy: match std::env::var("FEEDKIT_CACHE_TTL_SECS")
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
            {
                Some(secs) => TtlPolicy::Fixed(Duration::from_secs(secs)),
                None => defaults.ttl_policy,
            },
            fanout_mode: env_or("FEEDKIT_FANOUT_MODE", defaults.fanout_mode),
            fanout_concurrency: env_or("FEEDKIT_FANOUT_CONCURRENCY", defaults.fanout_concurrency),
            fanout_retries: env_or("FEEDKIT_FANOUT_RETRIES", defaults.fanout_retries),
            fanout_backoff: Duration::from_millis(env_or(
                "FEEDKIT_FANOUT_BACKOFF_MS",
                defaults.fanout_backoff.as_millis() as u64,
            )),
            endless_page_size: env_or("FEEDKIT_PAGE_SIZE", defaults.endless_page_size),
            endless_max_page_size: env_or("FEEDKIT_MAX_PAGE_SIZE", defaults.endless_max_page_size),
            offset_page_size: env_or("FEEDKIT_OFFSET_PAGE_SIZE", defaults.offset_page_size),
            offset_max_page_size: env_or(
                "FEEDKIT_OFFSET_MAX_PAGE_SIZE",
                defaults.offset_max_page_size,
            ),
            ..defaults
        }
    }

    /// Reject settings the caches cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.list_bound == 0 {
            return Err(Error::ConfigError("list_bound must be positive".into()));
        }
        if self.fanout_concurrency == 0 {
            return Err(Error::ConfigError(
                "fanout_concurrency must be positive".into(),
            ));
        }
        if self.endless_page_size == 0 || self.offset_page_size == 0 {
            return Err(Error::ConfigError("page sizes must be positive".into()));
        }
        if self.endless_page_size > self.endless_max_page_size
            || self.offset_page_size > self.offset_max_page_size
        {
            return Err(Error::ConfigError(
                "default page size exceeds its maximum".into(),
            ));
        }
        if self.min_body_chars > self.max_body_chars {
            return Err(Error::ConfigError(
                "min_body_chars exceeds max_body_chars".into(),
            ));
        }
        Ok(())
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse::<T>().ok())
        .unwrap_or(default)
}
