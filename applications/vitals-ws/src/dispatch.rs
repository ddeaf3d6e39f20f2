//! Fan-out of newly stored readings to observers
//!
//! Observers are called synchronously, in subscription order, outside the
//! registry lock. A failing or panicking observer is logged and skipped; the
//! remaining observers still receive the reading.

use crate::vitals::Reading;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::broadcast;

pub trait Observer: Send + Sync {
    fn on_reading(&self, reading: &Reading) -> anyhow::Result<()>;
}

impl<F> Observer for F
where
    F: Fn(&Reading) -> anyhow::Result<()> + Send + Sync,
{
    fn on_reading(&self, reading: &Reading) -> anyhow::Result<()> {
        self(reading)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

#[derive(Default)]
pub struct Dispatcher {
    observers: RwLock<Vec<(SubscriptionHandle, Arc<dyn Observer>)>>,
    next_id: AtomicU64,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: Arc<dyn Observer>) -> SubscriptionHandle {
        let handle = SubscriptionHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((handle, observer));
        tracing::debug!("Observer {:?} subscribed", handle);
        handle
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(h, _)| *h != handle);
        tracing::debug!("Observer {:?} unsubscribed", handle);
    }

    pub fn observer_count(&self) -> usize {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Deliver `reading` to every current observer. Returns how many succeeded.
    pub fn publish(&self, reading: &Reading) -> usize {
        let snapshot: Vec<(SubscriptionHandle, Arc<dyn Observer>)> = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut delivered = 0;
        for (handle, observer) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| observer.on_reading(reading))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    tracing::warn!(
                        device_id = %reading.device_id(),
                        "Observer {:?} failed: {}",
                        handle,
                        e
                    );
                }
                Err(_) => {
                    tracing::error!(
                        device_id = %reading.device_id(),
                        "Observer {:?} panicked",
                        handle
                    );
                }
            }
        }
        delivered
    }
}

/// Observer that forwards readings onto a tokio broadcast channel.
pub struct BroadcastObserver {
    tx: broadcast::Sender<Reading>,
}

impl BroadcastObserver {
    pub fn new(tx: broadcast::Sender<Reading>) -> Self {
        Self { tx }
    }
}

impl Observer for BroadcastObserver {
    fn on_reading(&self, reading: &Reading) -> anyhow::Result<()> {
        if self.tx.receiver_count() == 0 {
            tracing::debug!("No live clients connected, skipping broadcast");
            return Ok(());
        }
        self.tx
            .send(reading.clone())
            .map(|count| tracing::debug!("Broadcast reading to {} live clients", count))
            .map_err(|e| anyhow::anyhow!("broadcast failed: {}", e))
    }
}
