//! Cancellation and deadlines for backend-dependent operations.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::vfs::{VfsError, VfsResult};

/// Caller-supplied cancellation and deadline.
///
/// Only operations that reach the backing store (lazy collection load,
/// block fetch, upload and commit) consult the context. Pure tree
/// operations finish in bounded local time and ignore it.
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl OpContext {
    /// No deadline, never cancelled unless [`cancel`](Self::cancel) is called.
    pub fn background() -> Self {
        Self::default()
    }

    /// A context that expires `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            ..Self::default()
        }
    }

    /// Use an externally owned cancellation token.
    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Cancel every operation running under this context (and its clones).
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run `fut`, failing with `Cancelled` or `TimedOut` if the context
    /// fires first.
    pub async fn run<T, F>(&self, fut: F) -> VfsResult<T>
    where
        F: Future<Output = VfsResult<T>>,
    {
        if self.cancel.is_cancelled() {
            return Err(VfsError::Cancelled);
        }
        let bounded = async {
            match self.deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, fut)
                    .await
                    .map_err(|_| VfsError::TimedOut)?,
                None => fut.await,
            }
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(VfsError::Cancelled),
            result = bounded => result,
        }
    }
}
