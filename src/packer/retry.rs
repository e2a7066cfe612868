//! Retry classification and backoff — §4.9/§7.
//!
//! Transient errors retry with exponential backoff and jitter up to a
//! capped attempt count; permanent errors fail upward immediately; unknown
//! errors are treated as transient (conservative).

use std::time::Duration;

use rand::Rng;

use crate::error::{DesError, Retryability};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Full-jitter exponential backoff: `random(0, min(max_delay, base * 2^attempt))`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.as_millis().saturating_mul(1u128 << attempt.min(20));
        let capped = exp.min(self.max_delay.as_millis());
        let jittered = rand::thread_rng().gen_range(0..=capped.max(1)) as u64;
        Duration::from_millis(jittered)
    }
}

fn classify(err: &DesError) -> Retryability {
    match err {
        DesError::Transient(_) => Retryability::Transient,
        DesError::Permanent(_)
        | DesError::CorruptContainer(_)
        | DesError::NameConflict(_)
        | DesError::InvalidName(_, _)
        | DesError::NotFound { .. }
        | DesError::ConfigError(_) => Retryability::Permanent,
        DesError::LeaseLost { .. } => Retryability::Permanent,
        DesError::ExternalFetchFailed(_) => Retryability::Unknown,
        DesError::Io(io_err) => DesError::classify_io(io_err),
    }
}

/// Run `op` under `policy`, retrying transient/unknown failures with
/// backoff up to `max_attempts`, and failing immediately on a permanent one.
pub async fn with_retry<F, Fut, T>(policy: &RetryPolicy, mut op: F) -> Result<T, DesError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, DesError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                let retryable = classify(&e).should_retry();
                attempt += 1;
                if !retryable || attempt >= policy.max_attempts {
                    return Err(e);
                }
                tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn classifies_kinds_per_spec_table() {
        assert_eq!(classify(&DesError::Transient("x".into())), Retryability::Transient);
        assert_eq!(classify(&DesError::Permanent("x".into())), Retryability::Permanent);
        assert_eq!(classify(&DesError::CorruptContainer("x".into())), Retryability::Permanent);
        assert_eq!(classify(&DesError::ExternalFetchFailed("x".into())), Retryability::Unknown);
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };
        let result = with_retry(&policy, || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(DesError::Transient("not yet".into()))
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn never_retries_permanent() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::default();
        let result: Result<(), DesError> = with_retry(&policy, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(DesError::Permanent("nope".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
