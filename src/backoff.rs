//! Backoff strategies for retry delays.

use rand::Rng;
use std::time::Duration;

/// Default jitter factor: delays are scaled by a uniform factor in
/// `[1 - 0.25, 1 + 0.25]`.
pub const DEFAULT_JITTER_FACTOR: f64 = 0.25;

/// Delay schedule for retries.
///
/// `delay` is 1-indexed: attempt 1 is the first delay computed after the
/// first failure.
#[derive(Debug, Clone)]
pub enum Backoff {
    /// Fixed delay between retries.
    Constant { initial: Duration },
    /// `initial + (n - 1) * step`, capped at `max`.
    Linear { initial: Duration, step: Duration, max: Duration },
    /// `initial * multiplier^(n - 1)`, capped at `max`.
    Exponential { initial: Duration, multiplier: f64, max: Duration },
    /// `initial * fib(n)` with `fib(1) = fib(2) = 1`, capped at `max`.
    Fibonacci { initial: Duration, max: Duration },
}

impl Backoff {
    pub fn constant(initial: Duration) -> Self {
        Backoff::Constant { initial }
    }

    pub fn linear(initial: Duration, step: Duration, max: Duration) -> Self {
        Backoff::Linear { initial, step, max }
    }

    pub fn exponential(initial: Duration, multiplier: f64, max: Duration) -> Self {
        Backoff::Exponential { initial, multiplier, max }
    }

    pub fn fibonacci(initial: Duration, max: Duration) -> Self {
        Backoff::Fibonacci { initial, max }
    }

    /// Calculate the delay for a given attempt number (1-indexed).
    pub fn delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self {
            Backoff::Constant { initial } => *initial,
            Backoff::Linear { initial, step, max } => {
                let grown = initial
                    .checked_add(step.saturating_mul(attempt - 1))
                    .unwrap_or(Duration::MAX);
                grown.min(*max)
            }
            Backoff::Exponential { initial, multiplier, max } => {
                let ms = initial.as_millis() as f64 * multiplier.powi(attempt as i32 - 1);
                let capped = if ms.is_finite() { ms.min(max.as_millis() as f64) } else { return *max };
                Duration::from_millis(capped as u64).min(*max)
            }
            Backoff::Fibonacci { initial, max } => {
                let factor = fib(attempt);
                let ms = (initial.as_millis() as u128).saturating_mul(factor);
                let capped = ms.min(max.as_millis());
                Duration::from_millis(capped as u64)
            }
        }
    }
}

fn fib(n: u32) -> u128 {
    let (mut a, mut b): (u128, u128) = (1, 1);
    for _ in 2..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    b
}

/// Jitter applied on top of the computed backoff delay.
#[derive(Debug, Clone, Copy)]
pub enum Jitter {
    /// Use the exact backoff delay.
    None,
    /// Scale by a uniform factor in `[1 - factor, 1 + factor]`.
    Proportional { factor: f64 },
}

impl Jitter {
    /// Proportional jitter with the default factor.
    pub fn proportional() -> Self {
        Jitter::Proportional { factor: DEFAULT_JITTER_FACTOR }
    }

    /// Apply jitter to a delay duration.
    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rand::rng())
    }

    /// Apply jitter with a caller-supplied RNG (deterministic in tests).
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        match self {
            Jitter::None => delay,
            Jitter::Proportional { factor } => {
                let factor = factor.abs();
                let lo = (1.0 - factor).max(0.0);
                let hi = 1.0 + factor;
                let scale = rng.random_range(lo..=hi);
                let ms = (delay.as_millis() as f64 * scale).floor().max(0.0);
                Duration::from_millis(ms as u64)
            }
        }
    }
}
