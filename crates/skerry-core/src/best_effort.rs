//! Collect-all-errors combinator for teardown paths.
//!
//! Teardown never short-circuits: every independent step runs, each failure
//! is logged and kept, and the caller gets one [`CoreError::PartialFailure`]
//! listing all of them. Create paths use ordinary `?` instead.

use crate::error::{CoreError, Failures, Result};

/// Accumulates the outcome of independent teardown steps.
///
/// ```ignore
/// let mut steps = BestEffort::new("network teardown", sandbox_id);
/// steps.record("delete netns", host.run(del_netns).await);
/// steps.record("delete veth", host.run(del_veth).await);
/// steps.finish()?;
/// ```
#[derive(Debug)]
pub struct BestEffort {
    scope: &'static str,
    subject: String,
    failures: Vec<CoreError>,
}

impl BestEffort {
    /// Start collecting failures for `scope` (e.g. "network teardown") on `subject`.
    pub fn new(scope: &'static str, subject: impl Into<String>) -> Self {
        Self {
            scope,
            subject: subject.into(),
            failures: Vec::new(),
        }
    }

    /// Record the result of one step.
    ///
    /// Nested partial failures are flattened so the final list names every
    /// leaf cause exactly once.
    pub fn record<T>(&mut self, step: &str, result: Result<T>) -> Option<T> {
        match result {
            Ok(value) => {
                tracing::trace!(scope = self.scope, subject = %self.subject, step, "Step done");
                Some(value)
            }
            Err(CoreError::PartialFailure(inner)) => {
                tracing::warn!(
                    scope = self.scope,
                    subject = %self.subject,
                    step,
                    failed = inner.len(),
                    "Step partially failed"
                );
                self.failures.extend(inner.0);
                None
            }
            Err(err) => {
                tracing::warn!(
                    scope = self.scope,
                    subject = %self.subject,
                    step,
                    error = %err,
                    "Step failed"
                );
                self.failures.push(err);
                None
            }
        }
    }

    /// Number of failures so far.
    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    /// `Ok(())` if every step succeeded, otherwise all failures joined.
    pub fn finish(self) -> Result<()> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            tracing::error!(
                scope = self.scope,
                subject = %self.subject,
                failed = self.failures.len(),
                "Best-effort teardown finished with failures"
            );
            Err(CoreError::PartialFailure(Failures(self.failures)))
        }
    }
}
