//! The caller side of one in-flight request.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::registry::ResponseReceiver;
use crate::connection::Lifecycle;
use crate::error::{Result, S7Error};
use crate::protocol::Frame;

/// Waits for the response to one registered PDU reference.
///
/// Dropping it before the response arrives removes the registration, so an
/// abandoned request never leaks a registry entry.
pub struct PendingRequest {
    id: u16,
    token: u64,
    rx: ResponseReceiver,
    lifecycle: Arc<Lifecycle>,
    done: bool,
}

impl PendingRequest {
    pub(crate) fn new(id: u16, token: u64, rx: ResponseReceiver, lifecycle: Arc<Lifecycle>) -> Self {
        Self {
            id,
            token,
            rx,
            lifecycle,
            done: false,
        }
    }

    /// The PDU reference this request waits on.
    #[inline]
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Wait for the response, at most `timeout`.
    pub async fn wait(mut self, timeout: Duration) -> Result<Frame> {
        let outcome = match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(S7Error::NotConnected),
            Err(_) => Err(S7Error::ReadTimeout { reference: self.id }),
        };
        self.finish(outcome)
    }

    /// Like [`wait`](Self::wait), but gives up with `Cancelled` once `cancel`
    /// fires.
    pub async fn wait_cancellable(
        mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Frame> {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(S7Error::Cancelled),
            result = tokio::time::timeout(timeout, &mut self.rx) => match result {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_)) => Err(S7Error::NotConnected),
                Err(_) => Err(S7Error::ReadTimeout { reference: self.id }),
            },
        };
        self.finish(outcome)
    }

    fn finish(&mut self, outcome: Result<Frame>) -> Result<Frame> {
        if let Err(ref error) = outcome {
            self.lifecycle.deregister(self.id, self.token);
            if matches!(error, S7Error::ReadTimeout { .. }) {
                tracing::debug!(reference = self.id, "Request timed out");
            }
        }
        self.done = true;
        outcome
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        if !self.done {
            self.lifecycle.deregister(self.id, self.token);
        }
    }
}
