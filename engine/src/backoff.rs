//! Exponential backoff with jitter, shared by the deployment engine's retry logic (C6) and the
//! watch pipeline's reconnect logic (C7) — one formula, two call sites (Testable Property 9).

use std::time::Duration;

use rand::Rng;

/// Retry policy for a single fallible operation (an apply call, a server-side patch).
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt fails.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Multiplier applied per attempt (exponential base).
    pub multiplier: f64,
    /// Ceiling on the computed delay, before jitter.
    pub max_delay: Duration,
    /// Jitter fraction `j`, applied as a uniform draw from `[1-j, 1+j]`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 5,
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: 0.1,
        }
    }
}

/// Reconnect policy for a watch connection. Distinct type from [`RetryPolicy`] (a watch has no
/// "max retries" — it reconnects until `max_attempts`, then signals degraded monitoring and keeps
/// trying on its own schedule) but shares the same delay formula.
#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    /// Base delay for the first attempt.
    pub base: Duration,
    /// Ceiling on the computed delay, before jitter.
    pub max: Duration,
    /// Jitter fraction `j`, applied as a uniform draw from `[1-j, 1+j]`.
    pub jitter: f64,
    /// Attempts before a "monitoring degraded" signal is emitted. Reconnection itself never
    /// stops; this only gates the degraded-signal emission.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy {
            base: Duration::from_millis(500),
            max: Duration::from_secs(60),
            jitter: 0.2,
            max_attempts: 10,
        }
    }
}

impl From<RetryPolicy> for BackoffPolicy {
    fn from(r: RetryPolicy) -> Self {
        BackoffPolicy {
            base: r.initial_delay,
            max: r.max_delay,
            jitter: r.jitter,
            max_attempts: r.max_retries,
        }
    }
}

/// Computes the delay before retry/reconnect attempt `attempt` (1-based: the delay before the
/// *first* retry is `attempt = 1`), per Testable Property 9:
/// `delay ∈ [min(b·2^(k-1), M)·(1-j), min(b·2^(k-1), M)·(1+j)]`.
///
/// `attempt` of 0 is treated the same as 1 (there is no meaningful "zeroth" backoff).
pub fn delay(attempt: u32, base: Duration, max: Duration, jitter: f64, rng: &mut impl Rng) -> Duration {
    let k = attempt.max(1);
    let exponent = i32::try_from(k.min(1_000)).unwrap_or(i32::MAX).saturating_sub(1);
    let unjittered = base.mul_f64(2f64.powi(exponent)).min(max);
    if jitter <= 0.0 {
        return unjittered;
    }
    let factor = rng.gen_range((1.0 - jitter)..=(1.0 + jitter));
    unjittered.mul_f64(factor.max(0.0))
}

/// Computes the delay for a [`RetryPolicy`] at a given attempt, without requiring the caller to
/// destructure the policy's fields.
pub fn retry_delay(policy: &RetryPolicy, attempt: u32, rng: &mut impl Rng) -> Duration {
    delay(attempt, policy.initial_delay, policy.max_delay, policy.jitter, rng)
}

/// Computes the delay for a [`BackoffPolicy`] at a given attempt.
pub fn reconnect_delay(policy: &BackoffPolicy, attempt: u32, rng: &mut impl Rng) -> Duration {
    delay(attempt, policy.base, policy.max, policy.jitter, rng)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;

    #[test]
    fn zero_jitter_matches_exact_powers_of_two() {
        let mut rng = StepRng::new(0, 0);
        let base = Duration::from_millis(10);
        let max = Duration::from_secs(1);
        assert_eq!(delay(1, base, max, 0.0, &mut rng), Duration::from_millis(10));
        assert_eq!(delay(2, base, max, 0.0, &mut rng), Duration::from_millis(20));
        assert_eq!(delay(3, base, max, 0.0, &mut rng), Duration::from_millis(40));
    }

    #[test]
    fn delay_is_capped_at_max() {
        let mut rng = StepRng::new(0, 0);
        let base = Duration::from_millis(10);
        let max = Duration::from_millis(25);
        assert_eq!(delay(10, base, max, 0.0, &mut rng), max);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let mut rng = rand::thread_rng();
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(10);
        for attempt in 1..=5u32 {
            let unjittered = base.mul_f64(2f64.powi(i32::try_from(attempt.saturating_sub(1)).unwrap())).min(max);
            let lo = unjittered.mul_f64(0.8);
            let hi = unjittered.mul_f64(1.2);
            for _ in 0..20 {
                let d = delay(attempt, base, max, 0.2, &mut rng);
                assert!(d >= lo && d <= hi, "attempt {attempt}: {d:?} not in [{lo:?}, {hi:?}]");
            }
        }
    }

    #[test]
    fn retry_policy_default_matches_formula() {
        let policy = RetryPolicy::default();
        let mut rng = StepRng::new(0, 0);
        let first = retry_delay(&policy, 1, &mut rng);
        assert!(first >= policy.initial_delay.mul_f64(1.0 - policy.jitter));
    }
}
