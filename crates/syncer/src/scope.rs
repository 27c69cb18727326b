//! Structured cancellation for families of cooperating tasks: a
//! cancellation token plus a first-error slot. Scopes replace ambient
//! "wait-closer" style globals; every leader, follower, and sync stage is
//! handed its scope explicitly.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::Error;

#[derive(Clone)]
pub struct Scope {
    inner: Arc<Inner>,
}

struct Inner {
    token: CancellationToken,
    error: Mutex<Option<Error>>,
}

impl Scope {
    pub fn new() -> Self {
        Self::from_token(CancellationToken::new())
    }

    fn from_token(token: CancellationToken) -> Self {
        Self {
            inner: Arc::new(Inner {
                token,
                error: Mutex::new(None),
            }),
        }
    }

    /// Derive a scope which is cancelled when its parent is, but may be
    /// cancelled (and fail) independently. It has its own error slot.
    pub fn child(&self) -> Self {
        Self::from_token(self.inner.token.child_token())
    }

    pub fn cancel(&self) {
        self.inner.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Resolves once the scope is cancelled.
    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await;
    }

    /// The raw token, for collaborators which take one directly.
    pub fn token(&self) -> &CancellationToken {
        &self.inner.token
    }

    /// Record `err` (the first recorded error wins) and cancel the scope.
    pub fn fail(&self, err: Error) {
        {
            let mut slot = self.inner.error.lock().unwrap();
            if slot.is_none() {
                *slot = Some(err);
            }
        }
        self.inner.token.cancel();
    }

    /// Take the first recorded error, if any.
    pub fn take_error(&self) -> Option<Error> {
        self.inner.error.lock().unwrap().take()
    }

    /// Sleep for `duration`, returning false if cancelled first.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            () = self.inner.token.cancelled() => false,
            () = tokio::time::sleep(duration) => true,
        }
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_recorded_error_wins() {
        let scope = Scope::new();
        scope.fail(Error::EmptyRunId);
        scope.fail(Error::Disconnected);

        assert!(scope.is_cancelled());
        assert!(matches!(scope.take_error(), Some(Error::EmptyRunId)));
        assert!(scope.take_error().is_none());
    }

    #[tokio::test]
    async fn child_follows_parent_but_not_vice_versa() {
        let parent = Scope::new();
        let child = parent.child();

        child.cancel();
        assert!(!parent.is_cancelled());

        let child = parent.child();
        parent.cancel();
        child.cancelled().await;
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn sleep_is_cut_short_by_cancellation() {
        let scope = Scope::new();
        assert!(scope.sleep(Duration::from_millis(10)).await);

        let sleeper = scope.clone();
        let task = tokio::spawn(async move { sleeper.sleep(Duration::from_secs(3600)).await });
        tokio::task::yield_now().await;
        scope.cancel();
        assert!(!task.await.unwrap());
    }
}
