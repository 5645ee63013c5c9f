use http::{HeaderName, HeaderValue};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::{
    config::RateLimitSettings,
    error::{GovernorError, Result},
    metrics::Metrics,
    store::{BatchOp, EphemeralStore},
    utils::Clock,
};

pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
pub const HEADER_RESET: &str = "x-ratelimit-reset";
pub const HEADER_RETRY_AFTER: &str = "retry-after";

/// Outcome of one admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub admitted: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Epoch seconds at which the current window has fully rolled over
    pub reset_at: i64,
    /// Seconds a denied client should wait, always the window size
    pub retry_after: u64,
    /// Admitted only because the store could not be consulted
    pub fail_open: bool,
}

impl Decision {
    /// Informational and, for denials, `Retry-After` headers.
    ///
    /// Fail-open decisions carry no accounting, so they produce no headers.
    pub fn headers(&self) -> Vec<(HeaderName, HeaderValue)> {
        if self.fail_open {
            return vec![];
        }

        let mut headers = vec![
            (HeaderName::from_static(HEADER_LIMIT), HeaderValue::from(self.limit)),
            (HeaderName::from_static(HEADER_REMAINING), HeaderValue::from(self.remaining)),
            (HeaderName::from_static(HEADER_RESET), HeaderValue::from(self.reset_at)),
        ];
        if !self.admitted {
            headers.push((
                HeaderName::from_static(HEADER_RETRY_AFTER),
                HeaderValue::from(self.retry_after),
            ));
        }
        headers
    }
}

/// Per-identity sliding-window admission controller.
///
/// Each identity owns a sorted set of request timestamps in the store. A
/// check prunes timestamps older than the window, counts the rest, records
/// the current request and refreshes the record's expiry, all in one atomic
/// batch so concurrent checks for the same identity cannot interleave.
pub struct SlidingWindowLimiter {
    store: Arc<dyn EphemeralStore>,
    settings: RateLimitSettings,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
}

impl SlidingWindowLimiter {
    pub fn new(
        store: Arc<dyn EphemeralStore>,
        settings: RateLimitSettings,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            settings,
            clock,
            metrics,
        }
    }

    pub fn settings(&self) -> &RateLimitSettings {
        &self.settings
    }

    /// Store key of the window record for `identity`
    pub fn record_key(&self, identity: &str) -> String {
        format!("{}:{}", self.settings.key_prefix, identity)
    }

    /// Account for one request from `identity` and decide on it.
    ///
    /// The request is recorded even when denied, so a denied request still
    /// occupies a slot in the window. Errors from the store are returned.
    pub async fn check(&self, identity: &str) -> Result<Decision> {
        let key = self.record_key(identity);
        let limit = self.settings.requests_per_window;
        let window_secs = self.settings.window_secs;

        let now_ms = self.clock.now_millis();
        let now_secs = now_ms.div_euclid(1000);
        let window_ms = i64::try_from(window_secs)
            .unwrap_or(i64::MAX)
            .saturating_mul(1000);
        let window_start = now_ms.saturating_sub(window_ms);

        let replies = self
            .store
            .execute_atomic(vec![
                BatchOp::PruneScores {
                    key: key.clone(),
                    max: window_start,
                },
                BatchOp::Cardinality { key: key.clone() },
                BatchOp::AddScored {
                    key: key.clone(),
                    score: now_ms,
                    member: now_ms.to_string(),
                },
                BatchOp::Expire {
                    key,
                    seconds: window_secs,
                },
            ])
            .await?;

        let count_before_add = replies
            .get(1)
            .ok_or_else(|| {
                GovernorError::UnexpectedReply("atomic batch is missing the ZCARD reply".to_string())
            })?
            .as_int()?
            .max(0) as u64;

        let admitted = count_before_add < u64::from(limit);
        let remaining = u64::from(limit).saturating_sub(count_before_add + 1) as u32;

        Ok(Decision {
            admitted,
            limit,
            remaining,
            reset_at: now_secs.saturating_add(window_ms / 1000),
            retry_after: window_secs,
            fail_open: false,
        })
    }

    /// Like `check`, but an unreachable store admits the request. The
    /// failure is only logged and counted.
    pub async fn allow(&self, identity: &str) -> Decision {
        let _timer = self.metrics.start_decision_timer();

        match self.check(identity).await {
            Ok(decision) => {
                if decision.admitted {
                    self.metrics.record_decision("admitted");
                } else {
                    debug!(
                        "Rate limit exceeded for {} (limit {} per {}s)",
                        identity, decision.limit, decision.retry_after
                    );
                    self.metrics.record_decision("denied");
                }
                decision
            }
            Err(e) => {
                warn!("Rate limiter store error for {}, admitting: {}", identity, e);
                self.metrics.record_decision("fail_open");
                self.fail_open_decision()
            }
        }
    }

    fn fail_open_decision(&self) -> Decision {
        let window_secs = self.settings.window_secs;
        Decision {
            admitted: true,
            limit: self.settings.requests_per_window,
            remaining: self.settings.requests_per_window,
            reset_at: self
                .clock
                .unix_now()
                .saturating_add(i64::try_from(window_secs).unwrap_or(i64::MAX)),
            retry_after: window_secs,
            fail_open: true,
        }
    }
}
