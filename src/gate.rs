use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, Mutex as AsyncMutex, OwnedSemaphorePermit, Semaphore};

use crate::PoolError;

/// A bounded FIFO that admits at most `capacity` items between
/// [`enqueue`](BackpressureGate::enqueue) and the moment the dequeued
/// [`Admitted`] slot is dropped.
///
/// Admission is a fair semaphore, so producers blocked on a full gate are
/// resumed one at a time in the order they started waiting. Every admitted
/// item carries its permit until the consumer is done with it, which means
/// `queued + in_flight` can never exceed the capacity.
#[derive(Debug)]
pub(crate) struct BackpressureGate<J> {
    capacity: usize,
    slots: Arc<Semaphore>,
    tx: Mutex<Option<mpsc::UnboundedSender<Admitted<J>>>>,
    rx: AsyncMutex<mpsc::UnboundedReceiver<Admitted<J>>>,
    counters: Arc<Counters>,
}

#[derive(Debug, Default)]
struct Counters {
    queued: AtomicUsize,
    in_flight: AtomicUsize,
}

/// An item that left the queue and is being worked on.
///
/// Dropping it marks the work as finished and frees its slot in the gate.
#[derive(Debug)]
pub(crate) struct Admitted<J> {
    item: Option<J>,
    counters: Arc<Counters>,
    in_flight: bool,
    _permit: OwnedSemaphorePermit,
}

impl<J> Admitted<J> {
    /// Take the item out of the slot. The slot stays occupied until dropped.
    pub(crate) fn take(&mut self) -> Option<J> {
        self.item.take()
    }
}

impl<J> Drop for Admitted<J> {
    fn drop(&mut self) {
        // Runs before the permit field is dropped, so the counters never
        // report more than the semaphore allows.
        if self.in_flight {
            self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
        } else {
            self.counters.queued.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl<J> BackpressureGate<J> {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            capacity,
            slots: Arc::new(Semaphore::new(capacity)),
            tx: Mutex::new(Some(tx)),
            rx: AsyncMutex::new(rx),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Wait for a free slot and append `item` to the back of the queue.
    ///
    /// Cancel safe: if the returned future is dropped before it completes,
    /// nothing has been enqueued.
    pub(crate) async fn enqueue(&self, item: J) -> Result<(), PoolError> {
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PoolError::PoolClosed)?;

        let guard = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = guard.as_ref().ok_or(PoolError::PoolClosed)?;

        self.counters.queued.fetch_add(1, Ordering::SeqCst);
        let admitted = Admitted {
            item: Some(item),
            counters: self.counters.clone(),
            in_flight: false,
            _permit: permit,
        };
        // The receiver lives as long as the gate, so this only fails if the
        // channel was closed, and the queued counter is restored by the drop.
        tx.send(admitted).map_err(|_| PoolError::PoolClosed)
    }

    /// Take the oldest pending item, waiting while the queue is empty.
    ///
    /// Returns `None` once the gate is closed and every pending item has been
    /// handed out.
    pub(crate) async fn dequeue(&self) -> Option<Admitted<J>> {
        let mut admitted = self.rx.lock().await.recv().await?;
        self.counters.queued.fetch_sub(1, Ordering::SeqCst);
        self.counters.in_flight.fetch_add(1, Ordering::SeqCst);
        admitted.in_flight = true;
        Some(admitted)
    }

    /// Stop admitting new items. Items already queued stay dequeueable, and
    /// producers still waiting for a slot get [`PoolError::PoolClosed`].
    pub(crate) fn close(&self) {
        self.slots.close();
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.slots.is_closed()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn available(&self) -> usize {
        self.slots.available_permits()
    }

    pub(crate) fn queued(&self) -> usize {
        self.counters.queued.load(Ordering::SeqCst)
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.counters.in_flight.load(Ordering::SeqCst)
    }
}
