use std::time::Duration;

use interfaces::defs::{Item, StoreError};
use serde::{Deserialize, Serialize};

/// Largest page the upstream listing endpoint accepts.
pub const MAX_PAGE_LIMIT: usize = 100;

/// Length of the upstream budget window.
pub const BUDGET_PERIOD: Duration = Duration::from_secs(600);

pub const SAFETY_FACTOR: f64 = 0.95;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub client_id: String,
    pub client_secret: String,
    pub user_agent: String,
    pub base_url: String,
    pub auth_url: String,
    pub timeout_seconds: u64,
    pub retry_delay_seconds: u64,
    pub max_acquire_attempts: u32,
    pub max_acquire_elapsed_seconds: u64,
    pub wait_timeout_seconds: u64,
    pub max_requests_per_minute: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            user_agent: "source-poller/0.1".to_string(),
            base_url: "https://oauth.reddit.com".to_string(),
            auth_url: "https://www.reddit.com/api/v1/access_token".to_string(),
            timeout_seconds: 30,
            retry_delay_seconds: 1,
            max_acquire_attempts: 5,
            max_acquire_elapsed_seconds: 60,
            wait_timeout_seconds: 30,
            max_requests_per_minute: 100,
        }
    }
}

impl ClientConfig {
    pub fn rate_policy(&self) -> RatePolicy {
        RatePolicy::per_minute(self.max_requests_per_minute)
    }
}

/// Nominal request allocation of the upstream API.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RatePolicy {
    pub total_allowed: u32,
    pub period: Duration,
    pub safety_factor: f64,
}

impl RatePolicy {
    /// Allocation for a per-minute budget spread over the full budget window.
    /// A zero budget falls back to 100 requests per minute.
    pub fn per_minute(max_requests_per_minute: u32) -> Self {
        let per_minute = if max_requests_per_minute == 0 { 100 } else { max_requests_per_minute };
        let minutes = (BUDGET_PERIOD.as_secs() / 60) as u32;
        Self {
            total_allowed: per_minute * minutes,
            period: BUDGET_PERIOD,
            safety_factor: SAFETY_FACTOR,
        }
    }

    /// Requests per second we aim for across all sources.
    pub fn nominal_rate(&self) -> f64 {
        rate_for(self.total_allowed, self.period, self.safety_factor)
    }
}

impl Default for RatePolicy {
    fn default() -> Self {
        Self::per_minute(100)
    }
}

pub(crate) fn rate_for(total_allowed: u32, period: Duration, safety_factor: f64) -> f64 {
    (total_allowed as f64 / period.as_secs_f64()) * safety_factor
}

/// Most recent usage counters reported by the upstream API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateBudget {
    pub remaining: i64,
    pub reset_secs: i64,
    pub used: i64,
}

impl Default for RateBudget {
    fn default() -> Self {
        Self {
            remaining: 0,
            reset_secs: BUDGET_PERIOD.as_secs() as i64,
            used: 0,
        }
    }
}

/// One page of a source listing.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub items: Vec<Item>,
    pub next_cursor: String,
}

#[derive(Debug, thiserror::Error)]
pub enum PollerError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Request failed with status {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Rate limit budget exhausted after {attempts} attempts")]
    RateLimited { attempts: u32 },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Polling cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, PollerError>;
