//! Job admission control.
//!
//! The PLC announces during communication setup how many jobs it accepts
//! in parallel. [`AdmissionGate`] bounds the number of in-flight requests to
//! that capacity. Callers wait in FIFO order for a slot, and an
//! [`AdmissionPermit`] returns its slot when dropped, whatever the exit path.
//!
//! # Resizing
//!
//! The capacity is renegotiated on every reconnect. Growing adds slots
//! immediately. Shrinking removes idle slots and records the rest as a debt
//! that returning permits pay off, so the number of outstanding permits
//! never exceeds the current capacity.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{Result, S7Error};

/// Shared gate state.
#[derive(Debug)]
struct GateInner {
    semaphore: Arc<Semaphore>,
    capacity: AtomicUsize,
    /// Slots to swallow when outstanding permits come back.
    debt: Mutex<usize>,
}

/// Bounds the number of concurrently outstanding requests.
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    inner: Arc<GateInner>,
}

impl AdmissionGate {
    /// Create a gate with `capacity` slots.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(GateInner {
                semaphore: Arc::new(Semaphore::new(capacity)),
                capacity: AtomicUsize::new(capacity),
                debt: Mutex::new(0),
            }),
        }
    }

    /// Wait for a free slot.
    ///
    /// Cancel-safe: dropping the future before it resolves holds no slot.
    pub async fn acquire(&self) -> Result<AdmissionPermit> {
        let permit = self
            .inner
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| S7Error::NotConnected)?;
        Ok(self.wrap(permit))
    }

    /// Take a slot if one is free right now.
    pub fn try_acquire(&self) -> Option<AdmissionPermit> {
        self.inner
            .semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| self.wrap(permit))
    }

    fn wrap(&self, permit: OwnedSemaphorePermit) -> AdmissionPermit {
        AdmissionPermit {
            permit: Some(permit),
            inner: self.inner.clone(),
        }
    }

    /// Current capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.inner.capacity.load(Ordering::Acquire)
    }

    /// Slots free right now.
    #[inline]
    pub fn available(&self) -> usize {
        self.inner.semaphore.available_permits()
    }

    /// Change the capacity.
    pub fn resize(&self, capacity: usize) {
        let mut debt = match self.inner.debt.lock() {
            Ok(debt) => debt,
            Err(poisoned) => poisoned.into_inner(),
        };
        let old = self.inner.capacity.swap(capacity, Ordering::AcqRel);

        if capacity > old {
            let grow = capacity - old;
            let paid = grow.min(*debt);
            *debt -= paid;
            self.inner.semaphore.add_permits(grow - paid);
        } else if capacity < old {
            let shrink = old - capacity;
            let forgotten = self.inner.semaphore.forget_permits(shrink);
            *debt += shrink - forgotten;
        }

        tracing::debug!(old, capacity, debt = *debt, "Admission gate resized");
    }
}

/// A slot of the admission gate, released on drop.
#[derive(Debug)]
pub struct AdmissionPermit {
    permit: Option<OwnedSemaphorePermit>,
    inner: Arc<GateInner>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        let Some(permit) = self.permit.take() else {
            return;
        };
        let mut debt = match self.inner.debt.lock() {
            Ok(debt) => debt,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *debt > 0 {
            *debt -= 1;
            permit.forget();
        } else {
            drop(permit);
        }
    }
}
