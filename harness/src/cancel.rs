//! Cancellation tokens and deadlines for long-running build steps.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared flag flipped once to request cancellation.
///
/// Clones observe the same flag. Cancellation is one-way. A child token is
/// cancelled with its parent, but cancelling the child leaves the parent
/// untouched.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    parent: Option<Arc<CancelToken>>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that observes `self` and can also be cancelled on its own.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            flag: Arc::default(),
            parent: Some(Arc::new(self.clone())),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || self.parent.as_ref().is_some_and(|p| p.is_cancelled())
    }

    /// This token's own flag, for signal handlers that set it directly.
    #[must_use]
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.flag)
    }
}

/// Why a controlled operation stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    Cancelled,
    TimedOut { elapsed: Duration },
}

/// Cancellation plus an optional overall deadline, checked together.
#[derive(Debug, Clone)]
pub struct RunControl {
    cancel: CancelToken,
    started: Instant,
    deadline: Option<Instant>,
}

impl RunControl {
    #[must_use]
    pub fn new(cancel: CancelToken, timeout: Option<Duration>) -> Self {
        let started = Instant::now();
        Self {
            cancel,
            started,
            deadline: timeout.map(|t| started + t),
        }
    }

    /// No deadline, never cancelled unless `cancel_token()` is used.
    #[must_use]
    pub fn unbounded() -> Self {
        Self::new(CancelToken::new(), None)
    }

    #[must_use]
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// `Err` once cancelled or past the deadline. Cancellation wins.
    ///
    /// # Errors
    ///
    /// The interrupt that applies.
    pub fn check(&self) -> Result<(), Interrupt> {
        if self.cancel.is_cancelled() {
            return Err(Interrupt::Cancelled);
        }
        match self.deadline {
            Some(d) if Instant::now() >= d => Err(Interrupt::TimedOut {
                elapsed: self.elapsed(),
            }),
            _ => Ok(()),
        }
    }
}
