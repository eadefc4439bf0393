//! Alarm indication subscriptions.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_core::Stream;
use tokio_util::sync::CancellationToken;

use crate::codec::alarms::AlarmIndication;
use crate::codec::decode;
use crate::connection::Lifecycle;
use crate::correlation::IndicationReceiver;
use crate::error::{Result, S7Error};
use crate::protocol::Frame;

/// Receives alarm indications pushed by the PLC.
///
/// Every subscription sees every indication, as long as its queue has room.
/// When the connection drops the subscription yields `NotConnected` once and
/// then ends. Dropping it unsubscribes.
///
/// Also usable as a [`Stream`] of `Result<AlarmIndication>`.
pub struct AlarmSubscription {
    id: u64,
    rx: IndicationReceiver,
    lifecycle: Arc<Lifecycle>,
}

impl AlarmSubscription {
    pub(crate) fn new(id: u64, rx: IndicationReceiver, lifecycle: Arc<Lifecycle>) -> Self {
        Self { id, rx, lifecycle }
    }

    /// Wait for the next indication.
    ///
    /// Returns `NotConnected` once the connection is gone.
    pub async fn recv(&mut self) -> Result<AlarmIndication> {
        into_indication(self.rx.recv().await)
    }

    /// Wait at most `timeout`; `Ok(None)` if nothing arrived.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<AlarmIndication>> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(item) => into_indication(item).map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Wait until an indication arrives or `cancel` fires.
    pub async fn recv_cancellable(&mut self, cancel: &CancellationToken) -> Result<AlarmIndication> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(S7Error::Cancelled),
            item = self.rx.recv() => into_indication(item),
        }
    }
}

fn into_indication(item: Option<Result<Frame>>) -> Result<AlarmIndication> {
    match item {
        Some(Ok(frame)) => decode(&frame),
        Some(Err(error)) => Err(error),
        None => Err(S7Error::NotConnected),
    }
}

impl Stream for AlarmSubscription {
    type Item = Result<AlarmIndication>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx
            .poll_recv(cx)
            .map(|item| item.map(|outcome| outcome.and_then(|frame| decode(&frame))))
    }
}

impl Drop for AlarmSubscription {
    fn drop(&mut self) {
        self.lifecycle.unsubscribe(self.id);
    }
}

impl std::fmt::Debug for AlarmSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlarmSubscription").field("id", &self.id).finish()
    }
}
