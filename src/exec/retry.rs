//! Retry options and the backoff/jitter delay composition.
//!
//! A retry delay is computed as `jitter(backoff(attempt))`: the backoff
//! family maps an attempt number to a base delay (capped at its maximum),
//! and the jitter family spreads that delay to avoid retry storms. The
//! decorrelated jitter variant keeps per-node state on the pipeline
//! context and is safe to drive from concurrent workers.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;

use crate::{PipelineError, Result};

/// Backoff families producing a raw delay from an attempt number.
///
/// Attempts are 1-based: attempt 1 is the first retry.
#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    /// The same delay on every attempt
    Fixed {
        /// Delay for every attempt
        delay: Duration,
    },
    /// `base * attempt`, capped
    Linear {
        /// Delay for the first attempt
        base: Duration,
        /// Upper bound on the produced delay
        max_delay: Duration,
    },
    /// `base * multiplier^(attempt-1)`, capped
    Exponential {
        /// Delay for the first attempt
        base: Duration,
        /// Growth factor per attempt
        multiplier: f64,
        /// Upper bound on the produced delay
        max_delay: Duration,
    },
}

impl Backoff {
    /// An exponential backoff doubling from `base`, capped at `max_delay`.
    pub fn exponential(base: Duration, max_delay: Duration) -> Self {
        Backoff::Exponential {
            base,
            multiplier: 2.0,
            max_delay,
        }
    }

    /// The raw delay for a 1-based attempt number.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self {
            Backoff::Fixed { delay } => *delay,
            Backoff::Linear { base, max_delay } => {
                base.saturating_mul(attempt).min(*max_delay)
            }
            Backoff::Exponential {
                base,
                multiplier,
                max_delay,
            } => {
                let factor = multiplier.powi(attempt as i32 - 1);
                Duration::from_secs_f64(base.as_secs_f64() * factor).min(*max_delay)
            }
        }
    }

    /// The first-attempt delay; the lower bound for decorrelated jitter.
    pub fn base(&self) -> Duration {
        self.delay_for(1)
    }

    /// The delay cap; the upper bound for decorrelated jitter.
    pub fn cap(&self) -> Duration {
        match self {
            Backoff::Fixed { delay } => *delay,
            Backoff::Linear { max_delay, .. } => *max_delay,
            Backoff::Exponential { max_delay, .. } => *max_delay,
        }
    }

    fn validate(&self) -> Result<()> {
        let (base, cap) = match self {
            Backoff::Fixed { delay } => (*delay, *delay),
            Backoff::Linear { base, max_delay } => (*base, *max_delay),
            Backoff::Exponential {
                base,
                multiplier,
                max_delay,
            } => {
                if *multiplier < 1.0 {
                    return Err(PipelineError::Internal(format!(
                        "exponential backoff multiplier must be >= 1.0, got {multiplier}"
                    )));
                }
                (*base, *max_delay)
            }
        };
        if cap < base {
            return Err(PipelineError::Internal(
                "backoff max_delay must be >= base".to_string(),
            ));
        }
        Ok(())
    }
}

/// Jitter families spreading a raw backoff delay.
#[derive(Debug, Clone, PartialEq)]
pub enum Jitter {
    /// Use the backoff delay as-is
    None,
    /// Uniform on `[0, delay)`
    Full,
    /// `delay/2 + uniform[0, delay/2)`
    Equal,
    /// `uniform[base, min(cap, prev * multiplier))`, stateful per node
    Decorrelated {
        /// Growth factor applied to the previous delay
        multiplier: f64,
    },
}

/// Mutable state for decorrelated jitter, owned by the pipeline context
/// and shared by all workers retrying items of one node.
#[derive(Debug, Default)]
pub struct JitterState {
    prev: Mutex<Option<Duration>>,
}

impl JitterState {
    /// Fresh state; the first draw is seeded by the backoff base.
    pub fn new() -> Self {
        Self::default()
    }
}

/// The composed delay strategy: `delay(attempt) = jitter(backoff(attempt))`.
#[derive(Debug, Clone, PartialEq)]
pub struct DelayStrategy {
    /// Raw delay family
    pub backoff: Backoff,
    /// Spreading applied on top
    pub jitter: Jitter,
}

impl DelayStrategy {
    /// A strategy with no jitter.
    pub fn backoff_only(backoff: Backoff) -> Self {
        Self {
            backoff,
            jitter: Jitter::None,
        }
    }

    /// Compute the delay for a 1-based attempt.
    pub fn delay_for<R: Rng + ?Sized>(
        &self,
        attempt: u32,
        rng: &mut R,
        state: &JitterState,
    ) -> Duration {
        let raw = self.backoff.delay_for(attempt);
        match &self.jitter {
            Jitter::None => raw,
            Jitter::Full => mul_f64(raw, rng.gen::<f64>()),
            Jitter::Equal => {
                let half = raw / 2;
                half + mul_f64(half, rng.gen::<f64>())
            }
            Jitter::Decorrelated { multiplier } => {
                let base = self.backoff.base();
                let cap = self.backoff.cap();
                let mut prev = state.prev.lock();
                let last = prev.unwrap_or(base);
                let upper = mul_f64(last, *multiplier).min(cap).max(base);
                let span = upper.saturating_sub(base);
                let drawn = base + mul_f64(span, rng.gen::<f64>());
                *prev = Some(drawn);
                drawn
            }
        }
    }

    fn validate(&self) -> Result<()> {
        self.backoff.validate()?;
        if let Jitter::Decorrelated { multiplier } = self.jitter {
            if multiplier < 1.0 {
                return Err(PipelineError::Internal(format!(
                    "decorrelated jitter multiplier must be >= 1.0, got {multiplier}"
                )));
            }
        }
        Ok(())
    }
}

fn mul_f64(d: Duration, f: f64) -> Duration {
    Duration::from_secs_f64(d.as_secs_f64() * f)
}

/// Retry predicate deciding whether an error is worth another attempt.
pub type RetryPredicate = Arc<dyn Fn(&PipelineError) -> bool + Send + Sync>;

/// Immutable retry configuration, set per pipeline or per node.
#[derive(Clone)]
pub struct RetryOptions {
    /// Retries allowed per item before escalating
    pub max_item_retries: u32,
    /// Restarts allowed per failure episode; 0 disables restart
    pub max_node_restart_attempts: u32,
    /// Global bound on restarts across all failures in one run
    pub max_sequential_node_attempts: u32,
    /// Capacity of the restart materialization buffer; `None` disables it
    pub max_materialized_items: Option<usize>,
    /// Errors this returns `false` for escalate without retrying.
    /// Must be deterministic.
    pub should_retry: RetryPredicate,
    /// Delay composition between attempts; `None` retries immediately
    pub delay: Option<DelayStrategy>,
    /// Fixed RNG seed for jitter, for reproducible runs
    pub jitter_seed: Option<u64>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_item_retries: 3,
            max_node_restart_attempts: 0,
            max_sequential_node_attempts: 10,
            max_materialized_items: None,
            should_retry: Arc::new(|_| true),
            delay: None,
            jitter_seed: None,
        }
    }
}

impl RetryOptions {
    /// Set the per-item retry budget.
    pub fn with_item_retries(mut self, retries: u32) -> Self {
        self.max_item_retries = retries;
        self
    }

    /// Enable node restart with the given per-episode budget.
    pub fn with_node_restarts(mut self, attempts: u32) -> Self {
        self.max_node_restart_attempts = attempts;
        self
    }

    /// Set the global restart bound across all failures.
    pub fn with_sequential_attempts(mut self, attempts: u32) -> Self {
        self.max_sequential_node_attempts = attempts;
        self
    }

    /// Cap the restart materialization buffer.
    pub fn with_materialized_items(mut self, items: usize) -> Self {
        self.max_materialized_items = Some(items);
        self
    }

    /// Set the delay composition between attempts.
    pub fn with_delay(mut self, delay: DelayStrategy) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Restrict which errors are retried.
    pub fn with_retry_predicate(
        mut self,
        predicate: impl Fn(&PipelineError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.should_retry = Arc::new(predicate);
        self
    }

    /// Fix the jitter RNG seed for reproducible runs.
    pub fn with_jitter_seed(mut self, seed: u64) -> Self {
        self.jitter_seed = Some(seed);
        self
    }

    /// Check the options for internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.max_sequential_node_attempts == 0 {
            return Err(PipelineError::Internal(
                "max_sequential_node_attempts must be positive".to_string(),
            ));
        }
        if let Some(0) = self.max_materialized_items {
            return Err(PipelineError::Internal(
                "max_materialized_items must be positive when set".to_string(),
            ));
        }
        if let Some(delay) = &self.delay {
            delay.validate()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for RetryOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryOptions")
            .field("max_item_retries", &self.max_item_retries)
            .field("max_node_restart_attempts", &self.max_node_restart_attempts)
            .field(
                "max_sequential_node_attempts",
                &self.max_sequential_node_attempts,
            )
            .field("max_materialized_items", &self.max_materialized_items)
            .field("delay", &self.delay)
            .field("jitter_seed", &self.jitter_seed)
            .finish()
    }
}

impl PartialEq for RetryOptions {
    fn eq(&self, other: &Self) -> bool {
        self.max_item_retries == other.max_item_retries
            && self.max_node_restart_attempts == other.max_node_restart_attempts
            && self.max_sequential_node_attempts == other.max_sequential_node_attempts
            && self.max_materialized_items == other.max_materialized_items
            && self.delay == other.delay
            && self.jitter_seed == other.jitter_seed
            && Arc::ptr_eq(&self.should_retry, &other.should_retry)
    }
}
