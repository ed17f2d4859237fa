//! Per-client token bucket, keyed by the peer IP address.

use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use governor::{clock, state::keyed::DefaultKeyedStateStore, Quota, RateLimiter};
use metrics::counter;
use serde_json::json;

use crate::error::RouterError;

#[derive(Clone)]
pub struct IpRateLimiter {
    limiter: Arc<RateLimiter<IpAddr, DefaultKeyedStateStore<IpAddr>, clock::DefaultClock>>,
}

impl IpRateLimiter {
    /// `rps` tokens are added per second, up to `burst`. Rates below one are spread out over
    /// a longer period, e.g. 0.5 is one token every two seconds.
    pub fn new(rps: f64, burst: u32) -> Result<Self, RouterError> {
        let burst = NonZeroU32::new(burst)
            .ok_or(RouterError::RateLimit("burst must be greater than 0"))?;

        let quota = if rps >= 1.0 {
            let rate = NonZeroU32::new(rps.round() as u32)
                .ok_or(RouterError::RateLimit("rps must be greater than 0"))?;
            Quota::per_second(rate).allow_burst(burst)
        } else if rps > 0.0 {
            let interval_ms = (1000.0 / rps).round() as u64;
            Quota::with_period(Duration::from_millis(interval_ms))
                .ok_or(RouterError::RateLimit("invalid rate limit period"))?
                .allow_burst(burst)
        } else {
            return Err(RouterError::RateLimit("rps must be greater than 0"));
        };

        Ok(Self {
            limiter: Arc::new(RateLimiter::dashmap(quota)),
        })
    }

    pub fn allow(&self, ip: IpAddr) -> bool {
        self.limiter.check_key(&ip).is_ok()
    }
}

/// Rejects requests over the client's budget with 429. Requests without a known peer address
/// are let through.
pub async fn limit_by_ip(
    State(limiter): State<IpRateLimiter>,
    req: Request,
    next: Next,
) -> Response {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    if let Some(ip) = peer {
        if !limiter.allow(ip) {
            counter!("http_rate_limited_total").increment(1);
            return (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({ "error": "rate limit exceeded" })),
            )
                .into_response();
        }
    }

    next.run(req).await
}
