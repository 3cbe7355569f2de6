//! Cooperative cancellation for in-flight tasks.
//!
//! A [`CancelToken`] is cloned into every adapter and model call and checked
//! at each suspension point. Cancellation and deadline expiry are both
//! surfaced through [`CancelToken::check`] so callers handle them uniformly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Why a task was interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    /// Explicit cancellation (user request or supervisor shutdown).
    Cancelled,
    /// The task's wall-clock deadline passed.
    DeadlineExceeded,
}

/// Shared cancellation flag plus optional wall-clock deadline.
#[derive(Debug, Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: None,
        }
    }

    /// A token that also trips once `deadline` passes.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: Some(deadline),
        }
    }

    /// A token sharing this token's flag, with a deadline attached. Used by
    /// the supervisor so a cancel issued while the task was queued still
    /// trips the deadline-carrying token it runs under.
    pub fn child_with_deadline(&self, deadline: Instant) -> Self {
        Self {
            flag: Arc::clone(&self.flag),
            deadline: Some(deadline),
        }
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns the interrupt reason, if any. Cancellation wins over deadline
    /// so an explicit cancel is never reported as a timeout.
    pub fn interrupted(&self) -> Option<Interrupt> {
        if self.is_cancelled() {
            return Some(Interrupt::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Some(Interrupt::DeadlineExceeded);
            }
        }
        None
    }

    /// Check for interruption, for use with `?` at suspension points.
    pub fn check(&self) -> Result<(), Interrupt> {
        match self.interrupted() {
            Some(reason) => Err(reason),
            None => Ok(()),
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn cancel_is_shared_across_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(token.check().is_ok());
        clone.cancel();
        assert_eq!(token.interrupted(), Some(Interrupt::Cancelled));
    }

    #[test]
    fn deadline_trips_after_expiry() {
        let token = CancelToken::with_deadline(Instant::now() - Duration::from_millis(1));
        assert_eq!(token.interrupted(), Some(Interrupt::DeadlineExceeded));
    }

    #[test]
    fn cancel_wins_over_deadline() {
        let token = CancelToken::with_deadline(Instant::now() - Duration::from_millis(1));
        token.cancel();
        assert_eq!(token.interrupted(), Some(Interrupt::Cancelled));
    }
}
