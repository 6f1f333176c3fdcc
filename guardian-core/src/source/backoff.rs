//! Restart backoff computation.
//!
//! Pure: the jitter fraction is passed in so the state machine stays
//! deterministic under test; the runtime caller draws it from a thread rng.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
}

/// Diagnostics attached to every recover event's meta.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffMeta {
    pub base_delay_ms: u64,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub applied_jitter_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffDecision {
    pub delay_ms: u64,
    pub meta: BackoffMeta,
}

/// `clamp(delay_ms * 2^(attempt-1), delay_ms, max_delay_ms)`, then symmetric
/// jitter of up to `base * jitter_factor`. `attempt` is the monotone
/// per-incarnation counter, starting at 1; `jitter_fraction` must be in
/// [-1, 1].
pub fn compute(policy: &BackoffPolicy, attempt: u32, jitter_fraction: f64) -> BackoffDecision {
    let exponent = attempt.saturating_sub(1).min(31);
    let base = policy
        .delay_ms
        .saturating_mul(1u64 << exponent)
        .clamp(policy.delay_ms, policy.max_delay_ms.max(policy.delay_ms));

    let jitter_fraction = jitter_fraction.clamp(-1.0, 1.0);
    let applied_jitter_ms =
        (base as f64 * policy.jitter_factor.clamp(0.0, 1.0) * jitter_fraction).round() as i64;
    let delay_ms = (base as i64 + applied_jitter_ms).max(0) as u64;

    BackoffDecision {
        delay_ms,
        meta: BackoffMeta {
            base_delay_ms: base,
            min_delay_ms: policy.delay_ms,
            max_delay_ms: policy.max_delay_ms,
            applied_jitter_ms,
        },
    }
}

/// Runtime entry point: deterministic core plus a random jitter draw.
pub fn compute_jittered(policy: &BackoffPolicy, attempt: u32) -> BackoffDecision {
    let fraction = if policy.jitter_factor > 0.0 {
        rand::random_range(-1.0..=1.0)
    } else {
        0.0
    };
    compute(policy, attempt, fraction)
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLICY: BackoffPolicy = BackoffPolicy {
        delay_ms: 1_000,
        max_delay_ms: 60_000,
        jitter_factor: 0.2,
    };

    #[test]
    fn doubles_per_attempt_until_clamped() {
        let expectations = [
            (1, 1_000),
            (2, 2_000),
            (3, 4_000),
            (4, 8_000),
            (5, 16_000),
            (6, 32_000),
            (7, 60_000),
            (8, 60_000),
            (40, 60_000),
        ];
        for (attempt, base) in expectations {
            let decision = compute(&POLICY, attempt, 0.0);
            assert_eq!(decision.delay_ms, base, "attempt {attempt}");
            assert_eq!(decision.meta.base_delay_ms, base);
        }
    }

    #[test]
    fn jitter_is_symmetric_and_bounded() {
        let up = compute(&POLICY, 3, 1.0);
        let down = compute(&POLICY, 3, -1.0);
        assert_eq!(up.meta.applied_jitter_ms, 800);
        assert_eq!(down.meta.applied_jitter_ms, -800);
        assert_eq!(up.delay_ms, 4_800);
        assert_eq!(down.delay_ms, 3_200);
    }

    #[test]
    fn meta_carries_policy_bounds() {
        let decision = compute(&POLICY, 1, 0.5);
        assert_eq!(decision.meta.min_delay_ms, 1_000);
        assert_eq!(decision.meta.max_delay_ms, 60_000);
    }

    #[test]
    fn attempt_zero_behaves_like_first() {
        // Attempts are 1-based; a defensive zero maps to the base delay.
        assert_eq!(compute(&POLICY, 0, 0.0).delay_ms, 1_000);
    }

    #[test]
    fn jittered_delay_stays_within_envelope() {
        for attempt in 1..10 {
            let decision = compute_jittered(&POLICY, attempt);
            let base = decision.meta.base_delay_ms as f64;
            let lo = (base * 0.8).floor() as u64;
            let hi = (base * 1.2).ceil() as u64;
            assert!(
                (lo..=hi).contains(&decision.delay_ms),
                "attempt {attempt}: {} outside [{lo}, {hi}]",
                decision.delay_ms
            );
        }
    }
}
