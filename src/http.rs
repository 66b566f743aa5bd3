//! Rate-limited HTTP transport for the Joyful API.
//!
//! This module provides a wrapper around `reqwest::Client` that adds:
//! * Request rate limiting to stay within the API quota
//! * A fixed per-request timeout
//! * Consistent `User-Agent` and `Accept-Language` headers
//!
//! The transport knows nothing about credentials or business envelopes;
//! those are layered on top by [`crate::client::Client`].
//!
//! # Rate Limiting
//!
//! By default allows 50 calls per 5-second interval, with bursts up to the
//! maximum calls per interval. Requests that would exceed the limit are
//! delayed.

use std::{future::Future, num::NonZeroU32, time::Duration};

use futures_util::{FutureExt, TryFutureExt};
use governor::{DefaultDirectRateLimiter, Quota};
use reqwest::{
    self,
    header::{HeaderValue, ACCEPT_LANGUAGE},
    Method, Url,
};

use crate::{
    config::Config,
    error::{Error, Result},
};

/// HTTP client with built-in rate limiting.
pub struct Client {
    /// Unlimited request client for special cases.
    ///
    /// Direct access to underlying client without rate limiting.
    pub unlimited: reqwest::Client,

    /// Rate limiter for API quota compliance.
    rate_limiter: DefaultDirectRateLimiter,
}

impl Client {
    /// Duration to keep idle connections alive.
    ///
    /// Prevents frequent reconnection overhead for subsequent requests.
    const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(60);

    /// Creates a new client.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// * HTTP client creation fails
    /// * the rate limit quota is zero
    pub fn new(config: &Config) -> Result<Self> {
        // Not having `Accept-Language` set is non-fatal.
        let mut headers = reqwest::header::HeaderMap::new();
        if let Ok(lang) = HeaderValue::from_str(&config.app_lang) {
            headers.insert(ACCEPT_LANGUAGE, lang);
        }

        let http_client = reqwest::Client::builder()
            .tcp_keepalive(Self::KEEPALIVE_TIMEOUT)
            .timeout(config.timeout)
            .default_headers(headers)
            .user_agent(&config.user_agent);

        // Rate limit own requests as to not DoS the API infrastructure.
        let calls = NonZeroU32::new(config.rate_limit_calls)
            .ok_or_else(|| Error::invalid_argument("calls per interval is zero"))?;
        let replenish_interval = config.rate_limit_interval / calls.get();
        let quota = Quota::with_period(replenish_interval)
            .ok_or_else(|| Error::invalid_argument("quota time interval is zero"))?
            .allow_burst(calls);

        Ok(Self {
            unlimited: http_client.build()?,
            rate_limiter: governor::RateLimiter::direct(quota),
        })
    }

    /// Builds a request with specified method and URL, without a body.
    pub fn request<U>(&self, method: Method, url: U) -> reqwest::Request
    where
        U: Into<Url>,
    {
        reqwest::Request::new(method, url.into())
    }

    /// Builds a GET request.
    pub fn get<U>(&self, url: U) -> reqwest::Request
    where
        U: Into<Url>,
    {
        self.request(Method::GET, url)
    }

    /// Executes a request with rate limiting.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// * Request execution fails
    /// * Network error or timeout occurs
    pub fn execute(
        &self,
        request: reqwest::Request,
    ) -> impl Future<Output = Result<reqwest::Response>> + '_ {
        // No need to await with jitter because the level of concurrency is low.
        let throttle = self.rate_limiter.until_ready();
        throttle.then(|()| self.unlimited.execute(request).map_err(Into::into))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_quota_is_rejected() {
        let mut config = Config::new("http://localhost").unwrap();
        config.rate_limit_calls = 0;
        assert!(Client::new(&config).is_err());

        let mut config = Config::new("http://localhost").unwrap();
        config.rate_limit_interval = Duration::ZERO;
        assert!(Client::new(&config).is_err());
    }

    #[test]
    fn requests_have_no_body() {
        let config = Config::new("http://localhost").unwrap();
        let client = Client::new(&config).unwrap();
        let request = client.get(config.endpoint("/api/v1/getNewToken").unwrap());
        assert_eq!(request.method(), Method::GET);
        assert!(request.body().is_none());
    }
}
