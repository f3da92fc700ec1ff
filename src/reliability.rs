//! Reliability wrapper: per-node timeout and retry with exponential backoff.
//!
//! Every node invocation goes through [`run_with_policy`]. The policy bounds
//! the invocation with an optional timeout, classifies raised errors as
//! retryable or fatal, and re-invokes retryable failures against the *same*
//! pre-superstep snapshot after a backoff delay. Nodes must therefore be
//! safe to re-run against identical input.
//!
//! Delays follow `base_delay × backoff^(attempt-1)`, capped at `max_delay`,
//! optionally jittered by a factor in `0.5..1.5` to avoid thundering herds.
//!
//! # Examples
//!
//! ```rust
//! use stategraph::reliability::RetryPolicy;
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::new(3)
//!     .with_base_delay(Duration::from_millis(50))
//!     .with_backoff(2.0)
//!     .with_jitter(true)
//!     .with_timeout(Duration::from_secs(5));
//! assert_eq!(policy.max_attempts, 3);
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::node::{Node, NodeContext, NodeError, PartialUpdate};
use crate::state::Snapshot;

/// Classification of a node error by a retry policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth another attempt, budget permitting.
    Retryable,
    /// Retrying cannot help; surface immediately.
    Fatal,
}

/// Caller-supplied error classifier.
pub type ErrorClassifier = Arc<dyn Fn(&NodeError) -> ErrorClass + Send + Sync>;

/// Default classification: timeouts are fatal, everything else is retryable.
///
/// Timeouts usually mean the budget itself is wrong, so burning further
/// attempts on them is opt-in via a custom classifier.
#[must_use]
pub fn default_classifier(error: &NodeError) -> ErrorClass {
    match error {
        NodeError::Timeout { .. } => ErrorClass::Fatal,
        _ => ErrorClass::Retryable,
    }
}

/// Retry and timeout policy for a single node.
///
/// `max_attempts` counts invocations, not re-tries: the default of 1 means
/// no retry at all.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Total invocation budget (minimum 1).
    pub max_attempts: u32,
    /// Delay before the first re-invocation.
    pub base_delay: Duration,
    /// Multiplicative backoff factor applied per attempt.
    pub backoff: f64,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Randomize delays by a factor in `0.5..1.5`.
    pub jitter: bool,
    /// Per-invocation wall-clock bound; `None` means unbounded.
    pub timeout: Option<Duration>,
    classifier: Option<ErrorClassifier>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::from_millis(100),
            backoff: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: false,
            timeout: None,
            classifier: None,
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("backoff", &self.backoff)
            .field("max_delay", &self.max_delay)
            .field("jitter", &self.jitter)
            .field("timeout", &self.timeout)
            .field(
                "classifier",
                &self.classifier.as_ref().map(|_| "<custom>"),
            )
            .finish()
    }
}

impl RetryPolicy {
    /// Policy with the given invocation budget and default backoff.
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Set the total invocation budget (clamped to at least 1).
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the delay before the first re-invocation.
    #[must_use]
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Set the multiplicative backoff factor.
    #[must_use]
    pub fn with_backoff(mut self, backoff: f64) -> Self {
        self.backoff = backoff;
        self
    }

    /// Cap any single delay.
    #[must_use]
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Enable or disable delay jitter.
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Bound each invocation's wall-clock time.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Replace the default error classifier.
    #[must_use]
    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Classify an error using the custom classifier, falling back to
    /// [`default_classifier`].
    #[must_use]
    pub fn classify(&self, error: &NodeError) -> ErrorClass {
        match &self.classifier {
            Some(classify) => classify(error),
            None => default_classifier(error),
        }
    }

    /// Delay to wait after the given failed attempt (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = self.backoff.powi(exponent.min(i32::MAX as u32) as i32);
        let mut delay = self.base_delay.mul_f64(factor.max(0.0)).min(self.max_delay);
        if self.jitter {
            let spread: f64 = rand::rng().random_range(0.5..1.5);
            delay = delay.mul_f64(spread).min(self.max_delay);
        }
        delay
    }
}

/// Successful invocation plus the attempts it consumed.
#[derive(Clone, Debug)]
pub struct RetryOutcome {
    /// The node's contribution.
    pub update: PartialUpdate,
    /// Attempts consumed, counting the successful one.
    pub attempts: u32,
}

/// Budget exhausted or fatal error; carries the last raised error.
#[derive(Debug)]
pub struct RetryExhausted {
    /// Attempts consumed, counting the failing one.
    pub attempts: u32,
    /// Whether the final error was classified retryable (budget ran out)
    /// rather than fatal.
    pub retryable: bool,
    /// The last error the node raised.
    pub source: NodeError,
}

/// Invoke a node under its retry policy.
///
/// Each attempt runs against a fresh clone of the same pre-superstep
/// snapshot. Timeouts surface as [`NodeError::Timeout`] and go through the
/// classifier like any other error.
pub async fn run_with_policy(
    node: &dyn Node,
    policy: &RetryPolicy,
    snapshot: &Snapshot,
    ctx: &NodeContext,
) -> Result<RetryOutcome, RetryExhausted> {
    let mut attempt: u32 = 1;
    loop {
        let result = match policy.timeout {
            Some(limit) => {
                match tokio::time::timeout(limit, node.run(snapshot.clone(), ctx.clone())).await {
                    Ok(inner) => inner,
                    Err(_) => Err(NodeError::Timeout {
                        limit_ms: limit.as_millis() as u64,
                    }),
                }
            }
            None => node.run(snapshot.clone(), ctx.clone()).await,
        };

        match result {
            Ok(update) => {
                return Ok(RetryOutcome {
                    update,
                    attempts: attempt,
                })
            }
            Err(error) => {
                let retryable = policy.classify(&error) == ErrorClass::Retryable;
                if !retryable || attempt >= policy.max_attempts {
                    return Err(RetryExhausted {
                        attempts: attempt,
                        retryable,
                        source: error,
                    });
                }
                let delay = policy.delay_for(attempt);
                warn!(
                    node = %ctx.node,
                    step = ctx.step,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "node attempt failed; backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
