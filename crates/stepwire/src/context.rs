//! Call context: cancellation plus an optional deadline.

use std::time::Duration;

use tokio::time::Instant;
pub use tokio_util::sync::CancellationToken;

/// Why a context is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cancellation {
    Cancelled,
    DeadlineExceeded,
}

/// Scope of a single call.
///
/// Cloning shares the same token and deadline. `child_*` constructors derive
/// a context that is cancelled with its parent but can be cancelled (or
/// expire) on its own.
#[derive(Debug, Clone)]
pub struct CallContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for CallContext {
    fn default() -> Self {
        Self::background()
    }
}

impl CallContext {
    /// Never expires; cancelled only explicitly.
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(deadline),
        }
    }

    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Child context whose deadline is the earlier of ours and `timeout` from now.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(d) if d < candidate => d,
            _ => candidate,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// `Some` once the context is done.
    pub fn err(&self) -> Option<Cancellation> {
        if self.token.is_cancelled() {
            return Some(Cancellation::Cancelled);
        }
        match self.deadline {
            Some(d) if d <= Instant::now() => Some(Cancellation::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves when the context is cancelled or its deadline passes.
    pub async fn done(&self) -> Cancellation {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => Cancellation::Cancelled,
                    _ = tokio::time::sleep_until(deadline) => Cancellation::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                Cancellation::Cancelled
            }
        }
    }
}
