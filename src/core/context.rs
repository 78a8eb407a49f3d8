use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::errors::DomainError;
use crate::store::StoreError;

/// Per-call cancellation scope threaded through every store and cache call.
#[derive(Debug, Clone)]
pub struct RequestContext {
    request_id: Uuid,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self { request_id: Uuid::new_v4(), cancel: CancellationToken::new(), deadline: None }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    pub fn ensure_active(&self) -> Result<(), DomainError> {
        if self.is_cancelled() {
            return Err(DomainError::Cancelled);
        }
        Ok(())
    }

    /// Drives a store call, aborting with `Cancelled` when the scope ends first.
    ///
    /// A dropped call inside a unit of work leaves the transaction uncommitted, so
    /// the store rolls it back.
    pub async fn store<T, F>(&self, context: &'static str, fut: F) -> Result<T, DomainError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match self.race(fut).await {
            Some(result) => result.map_err(|err| DomainError::store(context, err)),
            None => Err(DomainError::Cancelled),
        }
    }

    /// Returns `None` when the scope is cancelled or past its deadline before `fut` finishes.
    pub async fn race<T, F>(&self, fut: F) -> Option<T>
    where
        F: Future<Output = T>,
    {
        if self.is_cancelled() {
            return None;
        }

        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            _ = deadline => None,
            value = fut => Some(value),
        }
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}
