//! Pending-request registry.
//!
//! Maps PDU references of in-flight requests to the oneshot channel of the
//! waiting caller, and keeps the bounded queues of indication subscribers.
//! Each registration carries a token so that a late deregistration of an
//! abandoned waiter never removes a newer entry that reuses the reference.
//!
//! The registry itself is not synchronised; the connection lifecycle owns
//! it behind the same lock as the connection state.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};

use crate::codec::MessageKind;
use crate::error::{Result, S7Error};
use crate::protocol::Frame;

/// Receiving half handed to the waiter of a request.
pub type ResponseReceiver = oneshot::Receiver<Result<Frame>>;

/// Receiving half handed to an indication subscriber.
pub type IndicationReceiver = mpsc::Receiver<Result<Frame>>;

/// Entry for one in-flight request.
struct PendingEntry {
    expected: MessageKind,
    token: u64,
    tx: oneshot::Sender<Result<Frame>>,
}

/// Registry of in-flight requests and indication subscribers.
#[derive(Default)]
pub struct PendingRegistry {
    requests: HashMap<u16, PendingEntry>,
    subscribers: HashMap<u64, mpsc::Sender<Result<Frame>>>,
    /// Next token / subscription id to hand out.
    next_token: u64,
}

impl PendingRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn token(&mut self) -> u64 {
        self.next_token = self.next_token.wrapping_add(1);
        self.next_token
    }

    /// Register a waiter for `id`, expecting a response of `expected` kind.
    ///
    /// Fails if `id` is already in flight.
    pub fn register(&mut self, id: u16, expected: MessageKind) -> Result<(u64, ResponseReceiver)> {
        if self.requests.contains_key(&id) {
            return Err(S7Error::protocol(format!(
                "PDU reference {} is already in flight",
                id
            )));
        }
        let token = self.token();
        let (tx, rx) = oneshot::channel();
        self.requests.insert(
            id,
            PendingEntry {
                expected,
                token,
                tx,
            },
        );
        Ok((token, rx))
    }

    /// Deliver a response to the waiter of `id` and remove the entry.
    ///
    /// A response of the wrong kind is delivered as `MalformedResponse`.
    /// Returns false when no request with this reference is in flight.
    pub fn resolve(&mut self, id: u16, kind: MessageKind, frame: Frame) -> bool {
        let Some(entry) = self.requests.remove(&id) else {
            tracing::warn!(reference = id, ?kind, "Dropping response for unknown reference");
            return false;
        };

        let outcome = if entry.expected == kind {
            Ok(frame)
        } else {
            Err(S7Error::malformed(format!(
                "Expected {:?}, got {:?}",
                entry.expected, kind
            )))
        };
        let _ = entry.tx.send(outcome);
        true
    }

    /// Deliver an error to the waiter of `id` and remove the entry.
    pub fn fail(&mut self, id: u16, error: S7Error) -> bool {
        let Some(entry) = self.requests.remove(&id) else {
            tracing::warn!(reference = id, error = %error, "Dropping error for unknown reference");
            return false;
        };
        let _ = entry.tx.send(Err(error));
        true
    }

    /// Remove the entry of an abandoned waiter if it is still the same one.
    pub fn deregister(&mut self, id: u16, token: u64) -> bool {
        match self.requests.get(&id) {
            Some(entry) if entry.token == token => {
                self.requests.remove(&id);
                true
            }
            _ => false,
        }
    }

    /// Check whether `id` is in flight.
    pub fn contains(&self, id: u16) -> bool {
        self.requests.contains_key(&id)
    }

    /// Number of in-flight requests.
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Check if no request is in flight.
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Add an indication subscriber with a queue of `capacity` entries.
    pub fn subscribe(&mut self, capacity: usize) -> (u64, IndicationReceiver) {
        let id = self.token();
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.subscribers.insert(id, tx);
        (id, rx)
    }

    /// Remove an indication subscriber.
    pub fn unsubscribe(&mut self, id: u64) -> bool {
        self.subscribers.remove(&id).is_some()
    }

    /// Number of indication subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Offer an indication to every subscriber without waiting.
    ///
    /// Subscribers with a full queue miss this indication; closed ones are
    /// removed. Returns the number of subscribers that received it.
    pub fn broadcast(&mut self, frame: &Frame) -> usize {
        let mut delivered = 0;
        self.subscribers.retain(|id, tx| match tx.try_send(Ok(frame.clone())) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(subscriber = id, "Subscriber queue full, dropping indication");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        delivered
    }

    /// Fail every request and end every subscription with `NotConnected`.
    pub fn drain(&mut self) -> usize {
        let mut drained = 0;
        for (_, entry) in self.requests.drain() {
            let _ = entry.tx.send(Err(S7Error::NotConnected));
            drained += 1;
        }
        for (_, tx) in self.subscribers.drain() {
            // A full queue still ends: the closed channel reads as NotConnected.
            let _ = tx.try_send(Err(S7Error::NotConnected));
            drained += 1;
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn frame(tag: u8) -> Frame {
        Frame::data(Bytes::from(vec![tag]))
    }

    #[test]
    fn test_register_and_resolve() {
        let mut registry = PendingRegistry::new();
        let (_, mut rx) = registry.register(5, MessageKind::ReadAck).unwrap();

        assert!(registry.resolve(5, MessageKind::ReadAck, frame(1)));
        assert_eq!(rx.try_recv().unwrap().unwrap().payload(), &[1]);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_duplicate_reference_rejected() {
        let mut registry = PendingRegistry::new();
        let _pending = registry.register(5, MessageKind::ReadAck).unwrap();
        assert!(matches!(
            registry.register(5, MessageKind::ReadAck),
            Err(S7Error::Protocol(_))
        ));
    }

    #[test]
    fn test_resolve_at_most_once() {
        let mut registry = PendingRegistry::new();
        let (_, _rx) = registry.register(7, MessageKind::ReadAck).unwrap();

        assert!(registry.resolve(7, MessageKind::ReadAck, frame(1)));
        assert!(!registry.resolve(7, MessageKind::ReadAck, frame(2)));
        assert!(!registry.fail(7, S7Error::NotConnected));
    }

    #[test]
    fn test_unknown_reference_dropped() {
        let mut registry = PendingRegistry::new();
        assert!(!registry.resolve(42, MessageKind::ReadAck, frame(1)));
    }

    #[test]
    fn test_kind_mismatch_is_malformed() {
        let mut registry = PendingRegistry::new();
        let (_, mut rx) = registry.register(3, MessageKind::ReadAck).unwrap();

        registry.resolve(3, MessageKind::WriteAck, frame(1));
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(S7Error::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_stale_deregister_keeps_newer_entry() {
        let mut registry = PendingRegistry::new();
        let (old_token, _) = registry.register(9, MessageKind::ReadAck).unwrap();
        assert!(registry.deregister(9, old_token));

        let (new_token, _rx) = registry.register(9, MessageKind::ReadAck).unwrap();
        assert!(!registry.deregister(9, old_token));
        assert!(registry.contains(9));
        assert!(registry.deregister(9, new_token));
    }

    #[test]
    fn test_broadcast() {
        let mut registry = PendingRegistry::new();
        let (_, mut first) = registry.subscribe(4);
        let (_, mut second) = registry.subscribe(4);
        let (_, closed) = registry.subscribe(4);
        drop(closed);

        assert_eq!(registry.broadcast(&frame(8)), 2);
        assert_eq!(registry.subscriber_count(), 2);
        assert_eq!(first.try_recv().unwrap().unwrap().payload(), &[8]);
        assert_eq!(second.try_recv().unwrap().unwrap().payload(), &[8]);
    }

    #[test]
    fn test_broadcast_full_queue_drops_indication() {
        let mut registry = PendingRegistry::new();
        let (_, mut rx) = registry.subscribe(1);

        assert_eq!(registry.broadcast(&frame(1)), 1);
        assert_eq!(registry.broadcast(&frame(2)), 0);
        assert_eq!(registry.subscriber_count(), 1);
        assert_eq!(rx.try_recv().unwrap().unwrap().payload(), &[1]);
    }

    #[test]
    fn test_drain() {
        let mut registry = PendingRegistry::new();
        let (_, mut a) = registry.register(1, MessageKind::ReadAck).unwrap();
        let (_, mut b) = registry.register(2, MessageKind::WriteAck).unwrap();
        let (_, mut sub) = registry.subscribe(2);

        assert_eq!(registry.drain(), 3);
        assert!(matches!(a.try_recv().unwrap(), Err(S7Error::NotConnected)));
        assert!(matches!(b.try_recv().unwrap(), Err(S7Error::NotConnected)));
        assert!(matches!(sub.try_recv().unwrap(), Err(S7Error::NotConnected)));
        assert!(registry.is_empty());
        assert_eq!(registry.subscriber_count(), 0);
    }
}
