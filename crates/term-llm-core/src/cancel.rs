use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

/// Why a waiter returned early. A deadline that has expired at the moment
/// of observation always reads as `TimedOut`, even if a manual `cancel`
/// raced it; callers rely on that distinction to classify sub-agent
/// failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CancelError {
    #[error("operation cancelled")]
    Cancelled,
    #[error("operation timed out")]
    TimedOut,
}

struct TokenState {
    fired: Option<CancelError>,
    children: Vec<Weak<Shared>>,
}

struct Shared {
    state: Mutex<TokenState>,
    cond: Condvar,
    deadline: Option<Instant>,
}

impl Shared {
    fn status(&self) -> Option<CancelError> {
        if let Some(deadline) = self.deadline
            && Instant::now() >= deadline
        {
            return Some(CancelError::TimedOut);
        }
        self.state.lock().expect("cancel token lock").fired
    }

    fn fire(&self, reason: CancelError) {
        let children = {
            let mut state = self.state.lock().expect("cancel token lock");
            if state.fired.is_some() {
                return;
            }
            state.fired = Some(reason);
            std::mem::take(&mut state.children)
        };
        self.cond.notify_all();
        for child in children {
            if let Some(child) = child.upgrade() {
                child.fire(reason);
            }
        }
    }
}

/// Cancellation signal shared between a parent task and its workers.
///
/// Cancellation cascades parent to child; deadlines are inherited as the
/// minimum of the parent's and the child's own. All blocking helpers wake
/// promptly on cancel or deadline expiry.
#[derive(Clone)]
pub struct CancelToken {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("status", &self.status())
            .field("deadline", &self.shared.deadline)
            .finish()
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self::with_deadline(None)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Some(Instant::now() + timeout))
    }

    fn with_deadline(deadline: Option<Instant>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(TokenState {
                    fired: None,
                    children: Vec::new(),
                }),
                cond: Condvar::new(),
                deadline,
            }),
        }
    }

    /// Derive a child token that inherits this token's deadline and is
    /// cancelled whenever this token fires.
    pub fn child(&self) -> Self {
        self.child_inner(None)
    }

    /// Derive a child with its own timeout; the effective deadline is the
    /// nearer of the parent's and the child's.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        self.child_inner(Some(Instant::now() + timeout))
    }

    fn child_inner(&self, own_deadline: Option<Instant>) -> Self {
        let deadline = match (self.shared.deadline, own_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let child = Self::with_deadline(deadline);
        let mut state = self.shared.state.lock().expect("cancel token lock");
        if let Some(reason) = state.fired {
            drop(state);
            child.shared.fire(reason);
        } else {
            state.children.push(Arc::downgrade(&child.shared));
        }
        child
    }

    /// Manually cancel this token and every descendant.
    pub fn cancel(&self) {
        self.shared.fire(CancelError::Cancelled);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.shared.deadline
    }

    /// Current terminal status, or `None` while still live.
    pub fn status(&self) -> Option<CancelError> {
        self.shared.status()
    }

    pub fn is_done(&self) -> bool {
        self.status().is_some()
    }

    pub fn check(&self) -> Result<(), CancelError> {
        match self.status() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Sleep for `duration`, returning early with the cancellation reason
    /// if the token fires first.
    pub fn sleep(&self, duration: Duration) -> Result<(), CancelError> {
        let until = Instant::now() + duration;
        let mut state = self.shared.state.lock().expect("cancel token lock");
        loop {
            if let Some(deadline) = self.shared.deadline
                && Instant::now() >= deadline
            {
                return Err(CancelError::TimedOut);
            }
            if let Some(reason) = state.fired {
                return Err(reason);
            }
            let now = Instant::now();
            if now >= until {
                return Ok(());
            }
            let mut wait = until - now;
            if let Some(deadline) = self.shared.deadline {
                wait = wait.min(deadline.saturating_duration_since(now));
            }
            let (next, _) = self
                .shared
                .cond
                .wait_timeout(state, wait.max(Duration::from_millis(1)))
                .expect("cancel token lock");
            state = next;
        }
    }

    /// Block until the token fires, returning the reason.
    pub fn wait_until_done(&self) -> CancelError {
        loop {
            match self.sleep(Duration::from_secs(3600)) {
                Ok(()) => continue,
                Err(reason) => return reason,
            }
        }
    }
}
