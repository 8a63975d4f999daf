use std::future::Future;
use std::time::Duration;

use super::types::RetryPolicy;

/// Terminal state returned by the retry runner.
#[derive(Debug)]
pub struct RetryTerminal<E> {
    pub error: E,
    pub attempts: u32,
}

/// Executes one async upstream operation under the micro-retry policy.
///
/// `is_retryable` classifies each error. Delays use deterministic jitter derived from `seed`
/// so concurrent callers for different accounts don't retry in lockstep.
pub async fn run_with_retry<T, E, F, Fut, R>(
    retry_policy: &RetryPolicy,
    seed: u64,
    mut op: F,
    mut is_retryable: R,
) -> Result<(T, u32), RetryTerminal<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: FnMut(&E) -> bool,
{
    let max_attempts = retry_policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op(attempt).await {
            Ok(value) => return Ok((value, attempt)),
            Err(error) => {
                if is_retryable(&error) && attempt < max_attempts {
                    let delay = compute_backoff_delay(retry_policy, attempt, seed);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                    continue;
                }
                return Err(RetryTerminal {
                    error,
                    attempts: attempt,
                });
            }
        }
    }
}

pub fn compute_backoff_delay(policy: &RetryPolicy, attempt: u32, seed: u64) -> Duration {
    if policy.initial_backoff.is_zero() && policy.jitter.is_zero() {
        return Duration::ZERO;
    }

    let shift = u32::min(attempt.saturating_sub(1), 20);
    let exponential_ms = policy
        .initial_backoff
        .as_millis()
        .saturating_mul(1u128 << shift);
    let capped_ms = exponential_ms.min(policy.max_backoff.as_millis());

    let jitter_ms = deterministic_jitter(seed, attempt, policy.jitter.as_millis());
    let total_ms = capped_ms.saturating_add(jitter_ms);
    Duration::from_millis(total_ms.min(u64::MAX as u128) as u64)
}

/// Stable seed for jitter, derived from an account id.
pub fn seed_for(key: &str) -> u64 {
    key.bytes().fold(0xcbf2_9ce4_8422_2325u64, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3)
    })
}

fn deterministic_jitter(seed: u64, attempt: u32, jitter_cap: u128) -> u128 {
    if jitter_cap == 0 {
        return 0;
    }

    let mut x = seed ^ (attempt as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51_afd7_ed55_8ccd);
    x ^= x >> 33;
    x = x.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    x ^= x >> 33;

    (x as u128) % (jitter_cap + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_wait_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn retryable_errors_are_repeated_until_success() {
        let calls = AtomicU32::new(0);
        let result = run_with_retry(
            &no_wait_policy(3),
            7,
            |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err("transient")
                    } else {
                        Ok(attempt)
                    }
                }
            },
            |_| true,
        )
        .await;

        assert_eq!(result.expect("second attempt succeeds"), (2, 2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_retryable_errors_stop_immediately() {
        let result: Result<((), u32), _> =
            run_with_retry(&no_wait_policy(5), 7, |_| async { Err("fatal") }, |_| false).await;

        let terminal = result.expect_err("should fail");
        assert_eq!(terminal.attempts, 1);
    }

    #[test]
    fn backoff_is_capped_and_jitter_is_bounded() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(250),
            jitter: Duration::from_millis(10),
        };

        let first = compute_backoff_delay(&policy, 1, seed_for("1789"));
        let fourth = compute_backoff_delay(&policy, 4, seed_for("1789"));

        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(110));
        assert!(fourth >= Duration::from_millis(250) && fourth <= Duration::from_millis(260));
        assert_eq!(first, compute_backoff_delay(&policy, 1, seed_for("1789")));
    }
}
