//! Throttling retry.
//!
//! SharePoint Online and Graph answer 429 / 503 when a tenant is throttled,
//! usually with a `Retry-After` header. Those responses are retried here,
//! waiting the advertised delay or backing off exponentially when none is
//! given, until the attempt budget runs out and a `Throttled` error surfaces.
//! Nothing else is retried.

use crate::HttpTransport;
use sprest_core::{Error, HttpRequest, RawResponse, Result};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
    /// Statuses treated as throttling.
    pub throttle_statuses: Vec<u16>,
    /// Longest wait between attempts, whatever the server advertises.
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 7,
            backoff: BackoffStrategy::Exponential {
                initial: Duration::from_millis(100),
                max: Duration::from_secs(30),
                multiplier: 2.0,
            },
            throttle_statuses: vec![429, 503],
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Wait before retry number `attempt` (0-indexed): the advertised delay
    /// when there is one, the backoff otherwise, never above `max_delay`.
    pub fn delay_for(&self, attempt: u32, advertised: Option<Duration>) -> Duration {
        advertised
            .unwrap_or_else(|| self.backoff.delay_for_attempt(attempt))
            .min(self.max_delay)
    }

    /// A single attempt, never retrying.
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn is_throttled(&self, status: u16) -> bool {
        self.throttle_statuses.contains(&status)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BackoffStrategy {
    Constant(Duration),
    Exponential {
        initial: Duration,
        max: Duration,
        multiplier: f64,
    },
}

impl BackoffStrategy {
    /// Delay before retry number `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            Self::Constant(d) => *d,
            Self::Exponential {
                initial,
                max,
                multiplier,
            } => {
                let factor = multiplier.powi(attempt as i32);
                let millis = (initial.as_millis() as f64 * factor) as u64;
                Duration::from_millis(millis).min(*max)
            }
        }
    }
}

/// Parse `Retry-After` as delta-seconds or as an HTTP-date.
pub fn retry_after(response: &RawResponse) -> Option<Duration> {
    let value = response.header("retry-after")?.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    if let Ok(secs) = value.parse::<f64>() {
        return Duration::try_from_secs_f64(secs).ok();
    }
    let date = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let wait = date.with_timezone(&chrono::Utc) - chrono::Utc::now();
    Some(wait.to_std().unwrap_or(Duration::ZERO))
}

/// Send `request`, retrying throttled responses per `config`.
///
/// Non-throttling responses are returned as they are, whatever their status;
/// judging them is the parser's job.
pub async fn send_with_retry<T>(transport: &T, request: HttpRequest, config: &RetryConfig) -> Result<RawResponse>
where
    T: HttpTransport + ?Sized,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let response = transport
            .send(request.clone())
            .await
            .map_err(|e| e.into_error(&request.url))?;

        if !config.is_throttled(response.status) {
            if attempt > 1 {
                debug!(url = %request.url, attempt, "Request succeeded after throttling");
            }
            return Ok(response);
        }

        let advertised = retry_after(&response);
        if attempt >= config.max_attempts {
            warn!(
                url = %request.url,
                status = response.status,
                attempts = attempt,
                "Giving up on throttled request"
            );
            return Err(Error::Throttled {
                url: request.url.clone(),
                status: response.status,
                attempts: attempt,
                retry_after: advertised,
            });
        }

        let delay = config.delay_for(attempt - 1, advertised);
        warn!(
            url = %request.url,
            status = response.status,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Request throttled, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}
