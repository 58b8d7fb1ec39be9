use crate::StoreError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Per-request cancellation and deadline carried into every store call.
///
/// Clones share the cancel flag, so a handle kept by the caller can abort work running on
/// another thread. The store checks the context when a transaction opens, between statements,
/// and right before commit; a fired context rolls the transaction back.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    deadline: Option<Instant>,
    cancelled: Arc<AtomicBool>,
}

impl RequestContext {
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            cancelled: Arc::default(),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_expired(&self) -> bool {
        self.deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Fails with an internal error once the request was cancelled or ran past its deadline.
    pub fn check(&self, operation: &str) -> Result<(), StoreError> {
        if self.is_cancelled() {
            return Err(StoreError::internal_message(format!(
                "{operation} cancelled"
            )));
        }
        if self.is_expired() {
            return Err(StoreError::internal_message(format!(
                "{operation} exceeded its deadline"
            )));
        }
        Ok(())
    }

    /// Lock wait bounded by whatever is left of the deadline.
    pub(crate) fn lock_wait(&self, configured: Duration) -> Duration {
        match self.deadline {
            Some(deadline) => configured.min(deadline.saturating_duration_since(Instant::now())),
            None => configured,
        }
    }
}
