use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use reqwest::{Method, Response};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::token_manager::TokenManager;

const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(10);
/// Safety net against a pathological server that 429s forever; honoring `Retry-After` should
/// never mean an unbounded retry budget.
const MAX_RATE_LIMIT_RETRIES: u32 = 8;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// delay = min(initial * 1.5^(attempt-1), 10s) * U(0.9, 1.1), attempt is 1-based.
fn backoff_delay(initial: Duration, attempt: u32) -> Duration {
    let exponent = 1.5f64.powi((attempt as i32) - 1);
    let base = (initial.as_secs_f64() * exponent).min(MAX_BACKOFF.as_secs_f64());
    let jitter = rand::rng().random_range(0.9..=1.1);
    Duration::from_secs_f64(base * jitter)
}

fn parse_retry_after(response: &Response) -> Duration {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_RETRY_AFTER)
}

/// Authenticated HTTP client with the retry/backoff/refresh pipeline (C4).
///
/// One instance is shared across every C5 adapter method; its retry policy and the
/// [`TokenManager`]'s single-flight refresh guard are the shared state that makes concurrent
/// calls coalesce onto one retry/refresh cycle instead of each reinventing their own.
pub struct HttpClient {
    http: reqwest::Client,
    tokens: Arc<TokenManager>,
    policy: RetryPolicy,
}

impl HttpClient {
    pub fn new(tokens: Arc<TokenManager>, policy: RetryPolicy) -> Self {
        let http = reqwest::Client::builder()
            .timeout(policy.request_timeout)
            .build()
            .expect("failed to build reqwest client");
        Self {
            http,
            tokens,
            policy,
        }
    }

    /// Issue an authenticated request, applying the full retry pipeline. `body`, if present,
    /// is sent as a JSON request body (used by the PUT/POST endpoints in §6).
    pub async fn request(&self, method: Method, url: &str, body: Option<Value>) -> Result<Response> {
        self.tokens.ensure_valid().await?;

        let mut backoff_attempt = 0u32;
        let mut rate_limit_attempt = 0u32;
        let mut refreshed_on_401 = false;

        loop {
            let token = self.tokens.get().await.ok_or(Error::Unauthorized)?;
            let mut builder = self.http.request(method.clone(), url).bearer_auth(token);
            if let Some(ref b) = body {
                builder = builder.json(b);
            }

            let started = Instant::now();
            match builder.send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let elapsed = started.elapsed();
                        if elapsed > Duration::from_secs(1) {
                            log::warn!("request to {url} took {elapsed:?}");
                        }
                        return Ok(response);
                    }

                    if status.as_u16() == 401 {
                        if refreshed_on_401 {
                            return Err(Error::Unauthorized);
                        }
                        refreshed_on_401 = true;
                        self.tokens.refresh().await?;
                        continue;
                    }

                    if status.as_u16() == 429 {
                        if rate_limit_attempt >= MAX_RATE_LIMIT_RETRIES {
                            return Err(Error::RateLimited {
                                retry_after: parse_retry_after(&response),
                            });
                        }
                        rate_limit_attempt += 1;
                        let retry_after = parse_retry_after(&response);
                        tokio::time::sleep(retry_after).await;
                        continue;
                    }

                    if status.is_server_error() {
                        let message = response.text().await.unwrap_or_default();
                        if backoff_attempt + 1 >= self.policy.max_retries {
                            return Err(Error::Upstream {
                                status: status.as_u16(),
                                message,
                            });
                        }
                        backoff_attempt += 1;
                        tokio::time::sleep(backoff_delay(self.policy.initial_backoff, backoff_attempt)).await;
                        continue;
                    }

                    // Other 4xx: not retried.
                    let message = response.text().await.unwrap_or_default();
                    return Err(Error::Upstream {
                        status: status.as_u16(),
                        message,
                    });
                }
                Err(err) => {
                    let err: Error = err.into();
                    if backoff_attempt + 1 >= self.policy.max_retries {
                        return Err(err);
                    }
                    backoff_attempt += 1;
                    tokio::time::sleep(backoff_delay(self.policy.initial_backoff, backoff_attempt)).await;
                }
            }
        }
    }

    pub async fn get(&self, url: &str) -> Result<Response> {
        self.request(Method::GET, url, None).await
    }

    pub async fn put(&self, url: &str, body: Option<Value>) -> Result<Response> {
        self.request(Method::PUT, url, body).await
    }

    pub async fn delete(&self, url: &str) -> Result<Response> {
        self.request(Method::DELETE, url, None).await
    }

    pub async fn post(&self, url: &str, body: Option<Value>) -> Result<Response> {
        self.request(Method::POST, url, body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_delay_stays_within_jittered_bounds() {
        let initial = Duration::from_secs(1);
        for attempt in 1..=5u32 {
            let delay = backoff_delay(initial, attempt);
            let base = (initial.as_secs_f64() * 1.5f64.powi(attempt as i32 - 1)).min(10.0);
            assert!(delay.as_secs_f64() >= base * 0.9 - 1e-9);
            assert!(delay.as_secs_f64() <= base * 1.1 + 1e-9);
        }
    }

    #[test]
    fn backoff_delay_is_capped_at_ten_seconds() {
        let delay = backoff_delay(Duration::from_secs(1), 20);
        assert!(delay.as_secs_f64() <= 11.0);
    }
}
