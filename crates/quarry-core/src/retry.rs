use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use tracing::warn;

/// Exponential backoff with jitter, shared by the coordination store, the
/// queue bus and the relational store: initial 1s, factor 2, cap 30s,
/// +/-60% jitter.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub factor: f64,
    pub cap: Duration,
    /// Fractional jitter, e.g. 0.6 spreads delays over [0.4x, 1.6x].
    pub jitter: f64,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            factor: 2.0,
            cap: Duration::from_secs(30),
            jitter: 0.6,
            max_attempts: 3,
        }
    }
}

impl BackoffPolicy {
    /// Reconnect budget: more patient than the per-operation default.
    pub fn reconnect() -> Self {
        Self {
            max_attempts: 10,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-based), jittered.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.initial.as_secs_f64() * self.factor.powi(attempt as i32);
        let base = base.min(self.cap.as_secs_f64());
        let spread = base * self.jitter;
        let jittered = if spread > 0.0 {
            rand::thread_rng().gen_range(base - spread..=base + spread)
        } else {
            base
        };
        Duration::from_secs_f64(jittered.max(0.0))
    }
}

/// Run `op` until it succeeds or the attempt budget is spent. Every failure
/// is logged with the operation label; the final error propagates.
pub async fn with_retries<T, F, Fut>(policy: BackoffPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                attempt += 1;
                if attempt >= policy.max_attempts {
                    return Err(e);
                }
                let delay = policy.delay(attempt - 1);
                warn!("{what} failed (attempt {attempt}/{}): {e:#}; retrying in {delay:?}", policy.max_attempts);
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_is_bounded_by_jitter_envelope() {
        let policy = BackoffPolicy::default();
        for attempt in 0..8 {
            let base = (1.0f64 * 2.0f64.powi(attempt)).min(30.0);
            for _ in 0..50 {
                let d = policy.delay(attempt as u32).as_secs_f64();
                assert!(d >= base * 0.4 - 1e-9, "attempt {attempt}: {d} < lower bound");
                assert!(d <= base * 1.6 + 1e-9, "attempt {attempt}: {d} > upper bound");
            }
        }
    }

    #[test]
    fn delay_caps_at_thirty_seconds_before_jitter() {
        let policy = BackoffPolicy {
            jitter: 0.0,
            ..BackoffPolicy::default()
        };
        assert_eq!(policy.delay(10), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn retries_until_budget_then_propagates() {
        let calls = AtomicU32::new(0);
        let policy = BackoffPolicy {
            initial: Duration::from_millis(1),
            max_attempts: 3,
            ..BackoffPolicy::default()
        };
        let result: Result<()> = with_retries(policy, "always-fails", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(anyhow::anyhow!("nope")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn succeeds_mid_budget() {
        let calls = AtomicU32::new(0);
        let policy = BackoffPolicy {
            initial: Duration::from_millis(1),
            max_attempts: 5,
            ..BackoffPolicy::default()
        };
        let result = with_retries(policy, "flaky", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(anyhow::anyhow!("transient"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.ok(), Some(2));
    }
}
