//! Deadline and cancellation for long reads across extents and snapshot levels.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use super::error::VMDKError;

/// Checked before every grain chunk and every parent fetch of a read.
#[derive(Clone, Debug, Default)]
pub struct ReadControl {
    deadline: Option<Instant>,
    cancel: Option<Arc<AtomicBool>>,
}

impl ReadControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Cancels the read as soon as `flag` is set to true.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn check(&self) -> Result<(), VMDKError> {
        if let Some(ref flag) = self.cancel {
            if flag.load(Ordering::Relaxed) {
                return Err(VMDKError::Cancelled("cancellation requested"));
            }
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(VMDKError::Cancelled("deadline exceeded"));
            }
        }
        Ok(())
    }
}
