use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{ConnectInfo, Path, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use governor::{clock::DefaultClock, state::keyed::DefaultKeyedStateStore, Quota, RateLimiter};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::state::StatsState;
use crate::types::RatePolicy;

/// Idle clients are forgotten after this long.
pub const CLIENT_EXPIRY: Duration = Duration::from_secs(3 * 60);

type ClientLimiter = RateLimiter<IpAddr, DefaultKeyedStateStore<IpAddr>, DefaultClock>;

#[derive(Clone)]
pub struct ApiState {
    pub stats: Arc<StatsState>,
    limiter: Arc<ClientLimiter>,
}

impl ApiState {
    /// Each client IP gets its own bucket without burst, refilled at the
    /// nominal rate of the per-minute budget.
    pub fn new(stats: Arc<StatsState>, max_requests_per_minute: u32) -> Self {
        let rate = RatePolicy::per_minute(max_requests_per_minute).nominal_rate();
        let quota = Quota::with_period(Duration::from_secs_f64(1.0 / rate))
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::MIN);
        Self {
            stats,
            limiter: Arc::new(RateLimiter::keyed(quota)),
        }
    }

    /// Number of clients currently tracked by the limiter.
    pub fn tracked_clients(&self) -> usize {
        self.limiter.len()
    }

    /// Drop clients whose bucket has fully refilled.
    pub fn forget_idle_clients(&self) {
        self.limiter.retain_recent();
        self.limiter.shrink_to_fit();
    }

    /// Periodically forget idle clients until `cancel` fires.
    pub async fn sweep_idle_clients(self, every: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    self.forget_idle_clients();
                    debug!("Rate limiter tracking {} clients", self.tracked_clients());
                }
            }
        }
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/stats", get(get_stats))
        .route("/api/stats/{source}", get(get_source_stats))
        .route("/healthz", get(|| async { "OK" }))
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit))
        .with_state(state)
}

/// Client address: first `X-Forwarded-For` hop, then `X-Real-IP`, then the
/// peer address. Requests with none of these share one bucket.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> IpAddr {
    let header_ip = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse::<IpAddr>().ok())
    };

    header_ip("x-forwarded-for")
        .or_else(|| header_ip("x-real-ip"))
        .or_else(|| peer.map(|addr| addr.ip()))
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

async fn rate_limit(State(state): State<ApiState>, request: Request, next: Next) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client = client_ip(request.headers(), peer);

    if state.limiter.check_key(&client).is_err() {
        warn!("Rate limit exceeded for {} on {}", client, request.uri().path());
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({ "error": "Rate limit exceeded, please try again later" })),
        )
            .into_response();
    }
    next.run(request).await
}

async fn get_stats(State(state): State<ApiState>) -> Response {
    let stats = state.stats.snapshot();
    Json(&*stats).into_response()
}

async fn get_source_stats(State(state): State<ApiState>, Path(source): Path<String>) -> Response {
    debug!("Serving statistics for {}", source);
    match state.stats.source_stats(&source) {
        Some(stats) => Json(stats).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("No statistics available for source {}", source) })),
        )
            .into_response(),
    }
}
