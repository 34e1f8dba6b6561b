//! [`Guardian`] – optional validation gate consulted between boot batches.
//!
//! After every batch the orchestrator hands the guardian a [`BatchReview`].
//! A [`Verdict::Abort`] stops the boot: the batch's degraded kernels are
//! treated as if they were required, and no later batch is started.

use async_trait::async_trait;
use serde::Serialize;

/// What the guardian gets to see after a batch finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchReview {
    pub index: usize,
    /// Kernels of this batch that reached `Running`.
    pub started: Vec<String>,
    /// Kernels of this batch that ended `Degraded`.
    pub degraded: Vec<String>,
    /// Every kernel degraded so far, this batch included.
    pub total_degraded: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    Abort { reason: String },
}

/// External boot validation gate.
#[async_trait]
pub trait Guardian: Send + Sync {
    async fn review(&self, review: &BatchReview) -> Verdict;
}

/// Aborts the boot once more than `max_degraded` kernels are degraded.
#[derive(Debug, Clone, Copy)]
pub struct DegradedLimitGuardian {
    max_degraded: usize,
}

impl DegradedLimitGuardian {
    pub fn new(max_degraded: usize) -> Self {
        Self { max_degraded }
    }
}

#[async_trait]
impl Guardian for DegradedLimitGuardian {
    async fn review(&self, review: &BatchReview) -> Verdict {
        if review.total_degraded.len() > self.max_degraded {
            Verdict::Abort {
                reason: format!(
                    "{} degraded kernel(s) exceed the limit of {}: {}",
                    review.total_degraded.len(),
                    self.max_degraded,
                    review.total_degraded.join(", ")
                ),
            }
        } else {
            Verdict::Continue
        }
    }
}
