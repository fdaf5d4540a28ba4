use common::RejectionReason;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::warn;

/// Fixed ceiling of in-flight workflows. Requests over the ceiling are
/// rejected on the spot, never queued.
#[derive(Debug, Clone)]
pub struct AdmissionControl {
    permits: Arc<Semaphore>,
    ceiling: usize,
}

impl AdmissionControl {
    pub fn new(ceiling: usize) -> Self {
        let ceiling = ceiling.max(1);
        Self {
            permits: Arc::new(Semaphore::new(ceiling)),
            ceiling,
        }
    }

    /// The permit is held by the workflow until it reaches a terminal state
    pub fn try_admit(&self) -> Result<OwnedSemaphorePermit, RejectionReason> {
        match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => Ok(permit),
            Err(TryAcquireError::NoPermits) | Err(TryAcquireError::Closed) => {
                warn!(ceiling = self.ceiling, "Admission refused, concurrency ceiling reached");
                Err(RejectionReason::Overloaded {
                    limit: self.ceiling,
                })
            }
        }
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    pub fn in_flight(&self) -> usize {
        self.ceiling
            .saturating_sub(self.permits.available_permits())
    }
}
