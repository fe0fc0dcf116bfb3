//! Cooperative cancellation and deadlines for workflow runs.

use crate::error::WorkflowError;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Execution context handed to every step.
///
/// Cancellation is cooperative: the engine checks the context at well
/// defined points (before a step or iteration, during delays, while
/// joining parallel steps) and steps are expected to do the same. A step
/// that ignores its context is never interrupted.
///
/// Cloning is cheap and clones observe the same cancellation.
///
/// # Examples
///
/// ```
/// use hataori_core::Context;
///
/// let parent = Context::new();
/// let child = parent.child();
///
/// parent.cancel();
/// assert!(child.is_done());
/// ```
#[derive(Clone, Default)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("canceled", &self.token.is_cancelled())
            .field("deadline", &self.deadline)
            .finish()
    }
}

impl Context {
    /// Creates a root context that is never done until canceled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a context driven by an existing cancellation token.
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Derives a context that is canceled with its parent but can also be
    /// canceled on its own.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Derives a child context that expires after `timeout`.
    ///
    /// The parent's deadline still applies if it is earlier.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    /// Cancels this context and every context derived from it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns the underlying cancellation token.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Returns the deadline, if one is set.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns `true` once the context is canceled or past its deadline.
    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Returns why the context is done, or `None` while it is still live.
    pub fn err(&self) -> Option<WorkflowError> {
        if self.token.is_cancelled() {
            return Some(WorkflowError::Canceled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(WorkflowError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Completes when the context is canceled or its deadline passes.
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }

    /// Sleeps for `duration` unless the context ends first.
    ///
    /// # Errors
    ///
    /// Returns the context error if the context ended during the sleep.
    pub async fn sleep(&self, duration: Duration) -> Result<(), WorkflowError> {
        if let Some(err) = self.err() {
            return Err(err);
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.done() => Err(self.err().unwrap_or(WorkflowError::Canceled)),
        }
    }
}
