use crate::rate_limiter::{RateBudgetCache, TokenBucket};
use crate::traits::PageSource;
use crate::types::{ClientConfig, Page, PollerError, RateBudget, RatePolicy, Result, MAX_PAGE_LIMIT};
use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoff};
use chrono::{DateTime, Utc};
use interfaces::defs::Item;
use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use url::Url;

const HEADER_USED: &str = "x-ratelimit-used";
const HEADER_REMAINING: &str = "x-ratelimit-remaining";
const HEADER_RESET: &str = "x-ratelimit-reset";

/// Longest we trust a token, whatever the exchange claims.
const MAX_TOKEN_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
struct AccessToken {
    value: String,
    expires_at: Instant,
}

impl AccessToken {
    fn is_valid(&self) -> bool {
        !self.value.is_empty() && Instant::now() < self.expires_at
    }
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct Listing {
    data: ListingData,
}

#[derive(Debug, Deserialize)]
struct ListingData {
    #[serde(default)]
    after: Option<String>,
    #[serde(default)]
    children: Vec<ListingChild>,
}

#[derive(Debug, Deserialize)]
struct ListingChild {
    data: RawItem,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawItem {
    id: String,
    title: String,
    author: String,
    url: Option<String>,
    created_utc: f64,
    ups: i64,
    downs: i64,
    score: i64,
    num_comments: i64,
    post_hint: Option<String>,
    is_video: bool,
    is_self: bool,
    selftext: Option<String>,
    permalink: String,
}

impl RawItem {
    fn into_item(self, source: &str, processed_at: DateTime<Utc>) -> Item {
        let created_at = DateTime::from_timestamp(self.created_utc as i64, 0).unwrap_or(processed_at);
        Item {
            id: self.id,
            title: self.title,
            author: self.author,
            source: source.to_string(),
            url: self.url.unwrap_or_default(),
            created_utc: self.created_utc,
            created_at,
            upvotes: self.ups,
            downvotes: self.downs,
            score: self.score,
            num_comments: self.num_comments,
            post_hint: self.post_hint.unwrap_or_default(),
            is_video: self.is_video,
            is_self: self.is_self,
            self_text: self.selftext.unwrap_or_default(),
            permalink: self.permalink,
            processed_at,
        }
    }
}

/// Authenticated, rate-gated client for the upstream listing API.
pub struct Fetcher {
    client: Client,
    config: ClientConfig,
    base_url: Url,
    policy: RatePolicy,
    limiter: Arc<TokenBucket>,
    budget: RateBudgetCache,
    credential: RwLock<Option<AccessToken>>,
}

impl Fetcher {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let limiter = Arc::new(TokenBucket::from_policy(
            &config.rate_policy(),
            Duration::from_secs(config.wait_timeout_seconds),
        ));
        Self::with_limiter(config, limiter)
    }

    pub fn with_limiter(config: ClientConfig, limiter: Arc<TokenBucket>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_seconds))
            .gzip(true)
            .build()?;

        let mut base_url = Url::parse(&config.base_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Ok(Self {
            client,
            policy: config.rate_policy(),
            config,
            base_url,
            limiter,
            budget: RateBudgetCache::new(),
            credential: RwLock::new(None),
        })
    }

    pub fn limiter(&self) -> &Arc<TokenBucket> {
        &self.limiter
    }

    pub fn policy(&self) -> RatePolicy {
        self.policy
    }

    pub async fn fetch_posts(&self, source: &str, limit: usize, cursor: &str) -> Result<Page> {
        let token = self.access_token().await?;
        let limit = clamp_limit(limit);

        self.acquire_slot(source).await?;

        let mut url = self.base_url.join(&format!("r/{}/new.json", source))?;
        url.query_pairs_mut().append_pair("limit", &limit.to_string());
        if !cursor.is_empty() {
            url.query_pairs_mut().append_pair("after", cursor);
        }

        info!(source, cursor, limit, "Fetching page with pagination cursor");

        let response = self.client.get(url).bearer_auth(&token).send().await?;
        self.update_rate_limits(response.headers());

        let status = response.status();
        if !status.is_success() {
            if status == StatusCode::UNAUTHORIZED {
                // Force a fresh token exchange on the next fetch.
                *self.credential.write().await = None;
            }
            let body = response.text().await.unwrap_or_default();
            error!(source, status = status.as_u16(), response_body = %body, "Upstream API error response");
            return Err(PollerError::Api { status: status.as_u16(), body });
        }

        let body = response.bytes().await?;
        let listing: Listing = serde_json::from_slice(&body)?;

        let processed_at = Utc::now();
        let items: Vec<Item> = listing
            .data
            .children
            .into_iter()
            .map(|child| child.data.into_item(source, processed_at))
            .collect();
        let next_cursor = listing.data.after.unwrap_or_default();

        info!(
            source,
            item_count = items.len(),
            cursor,
            next_cursor = %next_cursor,
            cursor_changed = cursor != next_cursor && !next_cursor.is_empty(),
            "Fetched page"
        );

        Ok(Page { items, next_cursor })
    }

    /// Current bearer token, exchanging client credentials if it is missing or expired.
    async fn access_token(&self) -> Result<String> {
        {
            let credential = self.credential.read().await;
            if let Some(token) = credential.as_ref().filter(|token| token.is_valid()) {
                return Ok(token.value.clone());
            }
        }

        info!("Authenticating with upstream API");

        if !self.limiter.acquire_or_wait().await {
            return Err(PollerError::RateLimited { attempts: 1 });
        }

        let response = self
            .client
            .post(&self.config.auth_url)
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;
        self.update_rate_limits(response.headers());

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PollerError::Auth(format!("token exchange returned {}: {}", status.as_u16(), body)));
        }

        let body = response.bytes().await?;
        let auth: AuthResponse = serde_json::from_slice(&body)?;
        if auth.access_token.is_empty() {
            return Err(PollerError::Auth("token exchange returned an empty token".to_string()));
        }

        let token = AccessToken {
            value: auth.access_token,
            expires_at: token_expiry(Instant::now(), auth.expires_in),
        };
        let value = token.value.clone();
        *self.credential.write().await = Some(token);

        info!("Successfully authenticated with upstream API");
        Ok(value)
    }

    /// Wait for a rate limit token, backing off exponentially between attempts.
    async fn acquire_slot(&self, source: &str) -> Result<()> {
        let delay = Duration::from_secs(self.config.retry_delay_seconds.max(1));
        let mut backoff = ExponentialBackoff {
            current_interval: delay,
            initial_interval: delay,
            max_interval: delay * 32,
            multiplier: 2.0,
            max_elapsed_time: Some(Duration::from_secs(self.config.max_acquire_elapsed_seconds)),
            ..Default::default()
        };

        let max_attempts = self.config.max_acquire_attempts.max(1);
        let mut attempts = 0;
        loop {
            attempts += 1;
            if self.limiter.acquire_or_wait().await {
                return Ok(());
            }
            if attempts >= max_attempts {
                break;
            }
            match backoff.next_backoff() {
                Some(wait) => {
                    warn!("Rate limit exceeded for {}, retrying in {:?} (attempt {})", source, wait, attempts);
                    tokio::time::sleep(wait).await;
                }
                None => break,
            }
        }

        error!("Gave up waiting for a rate limit token for {} after {} attempts", source, attempts);
        Err(PollerError::RateLimited { attempts })
    }

    fn update_rate_limits(&self, headers: &HeaderMap) {
        let used = header_as_int(headers, HEADER_USED);
        let remaining = header_as_int(headers, HEADER_REMAINING);
        let reset = header_as_int(headers, HEADER_RESET);

        if reset == 0 && used == 0 {
            return;
        }

        // remaining is known to always report 0 upstream; cache it anyway
        self.budget.set(RateBudget {
            remaining,
            reset_secs: reset,
            used,
        });
        self.limiter.adjust_rate(used, reset, self.policy.total_allowed);

        debug!(
            used,
            reset_sec = reset,
            new_fill_rate = self.limiter.fill_rate(),
            usage_pct = used as f64 / self.policy.total_allowed as f64 * 100.0,
            "Updated rate limiter from response headers"
        );
    }
}

#[async_trait]
impl PageSource for Fetcher {
    async fn fetch_page(&self, source: &str, limit: usize, cursor: &str) -> Result<Page> {
        self.fetch_posts(source, limit, cursor).await
    }

    fn rate_budget(&self) -> RateBudget {
        self.budget.get()
    }
}

fn token_expiry(now: Instant, expires_in: u64) -> Instant {
    let lifetime = Duration::from_secs(expires_in).min(MAX_TOKEN_LIFETIME);
    now.checked_add(lifetime).unwrap_or(now)
}

fn clamp_limit(limit: usize) -> usize {
    if limit == 0 || limit > MAX_PAGE_LIMIT {
        MAX_PAGE_LIMIT
    } else {
        limit
    }
}

/// Integer value of a header, or 0 when it is missing or unparseable.
/// Fractional values are truncated.
pub fn header_as_int(headers: &HeaderMap, name: &str) -> i64 {
    let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) else {
        return 0;
    };
    let value = value.trim();
    value
        .parse::<i64>()
        .ok()
        .or_else(|| value.parse::<f64>().ok().filter(|v| v.is_finite()).map(|v| v as i64))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn header_as_int_cases() {
        let cases = [
            ("valid integer", headers(&[("x-ratelimit-remaining", "42")]), 42),
            ("empty value", headers(&[("x-ratelimit-remaining", "")]), 0),
            ("missing header", headers(&[("x-ratelimit-used", "10")]), 0),
            ("not a number", headers(&[("x-ratelimit-remaining", "not-a-number")]), 0),
            (
                "first of several values",
                headers(&[("x-ratelimit-remaining", "100"), ("x-ratelimit-remaining", "200")]),
                100,
            ),
            ("fractional value", headers(&[("x-ratelimit-remaining", "598.0")]), 598),
        ];

        for (name, map, expected) in cases {
            assert_eq!(header_as_int(&map, HEADER_REMAINING), expected, "{name}");
        }
    }

    #[test]
    fn huge_token_lifetime_is_capped() {
        let now = Instant::now();
        assert_eq!(token_expiry(now, u64::MAX), now + MAX_TOKEN_LIFETIME);
        assert_eq!(token_expiry(now, 3600), now + Duration::from_secs(3600));
        assert_eq!(token_expiry(now, 0), now);
    }

    #[test]
    fn limit_is_clamped_to_page_maximum() {
        assert_eq!(clamp_limit(0), 100);
        assert_eq!(clamp_limit(250), 100);
        assert_eq!(clamp_limit(25), 25);
    }

    #[test]
    fn raw_item_tolerates_missing_fields() {
        let raw: RawItem = serde_json::from_str(r#"{"id": "abc", "ups": 4, "post_hint": null}"#).unwrap();
        let item = raw.into_item("rust", Utc::now());
        assert_eq!(item.id, "abc");
        assert_eq!(item.source, "rust");
        assert_eq!(item.upvotes, 4);
        assert_eq!(item.post_hint, "");
    }

    #[test]
    fn trailing_slash_is_added_to_base_url() {
        let fetcher = Fetcher::new(ClientConfig {
            base_url: "http://127.0.0.1:9/api".to_string(),
            ..ClientConfig::default()
        })
        .unwrap();
        let url = fetcher.base_url.join("r/rust/new.json").unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:9/api/r/rust/new.json");
    }
}
