//! Bounded pool of transport handles to one endpoint.
//!
//! # Accounting
//!
//! Every handle is in exactly one of three places: the idle set, a
//! [`Lease`] held by one caller, or destroyed. `live` counts the first two.
//! Each lease also holds one semaphore permit out of `capacity`, and a new
//! handle is only opened by a permit holder that found the idle set empty,
//! so `live` never exceeds `capacity`.
//!
//! # Blocking
//!
//! [`Pool::acquire`] is the only place that waits. It suspends until a
//! permit frees up or the caller's cancellation token fires; dropping the
//! wait leaves nothing behind.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::{Error, Result};
use super::transport::{Connector, Transport};

struct Shared<T> {
    idle: Mutex<Vec<Arc<T>>>,
    live: AtomicUsize,
    slots: Arc<Semaphore>,
    capacity: usize,
    closed: AtomicBool,
}

impl<T> Shared<T> {
    fn idle(&self) -> MutexGuard<'_, Vec<Arc<T>>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct Pool<C: Connector> {
    connector: C,
    shared: Arc<Shared<C::Transport>>,
}

impl<C: Connector> Pool<C> {
    pub fn new(connector: C, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            connector,
            shared: Arc::new(Shared {
                idle: Mutex::new(Vec::new()),
                live: AtomicUsize::new(0),
                slots: Arc::new(Semaphore::new(capacity)),
                capacity,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Handles currently idle or leased.
    pub fn live_count(&self) -> usize {
        self.shared.live.load(Ordering::SeqCst)
    }

    pub fn idle_count(&self) -> usize {
        self.shared.idle().len()
    }

    /// Check out a handle, opening a new one when no healthy idle handle exists.
    ///
    /// Handshake failures propagate as-is and leave `live` untouched.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<Lease<C::Transport>> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }

        if self.shared.slots.available_permits() == 0 {
            debug!(
                "All {} connections to {} are busy, waiting",
                self.shared.capacity,
                self.connector.endpoint()
            );
        }
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            permit = self.shared.slots.clone().acquire_owned() => {
                permit.map_err(|_| Error::Closed)?
            }
        };

        loop {
            let candidate = self.shared.idle().pop();
            match candidate {
                Some(transport) if !transport.is_closed() => {
                    return Ok(Lease::new(transport, self.shared.clone(), permit));
                }
                Some(transport) => {
                    self.shared.live.fetch_sub(1, Ordering::SeqCst);
                    debug!("Discarding dead idle connection to {}", self.connector.endpoint());
                    transport.close().await;
                }
                None => break,
            }
        }

        debug!(
            "Opening connection {}/{} to {}",
            self.live_count() + 1,
            self.shared.capacity,
            self.connector.endpoint()
        );
        let transport = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            result = self.connector.connect() => result?,
        };
        self.shared.live.fetch_add(1, Ordering::SeqCst);
        Ok(Lease::new(Arc::new(transport), self.shared.clone(), permit))
    }

    /// Close idle handles and refuse further acquisitions. Leased handles are
    /// closed when their lease ends.
    pub async fn close(&self) {
        // Flag flips under the idle lock so a concurrent release either
        // lands before the drain or sees the pool closed
        let idle = {
            let mut idle = self.shared.idle();
            if self.shared.closed.swap(true, Ordering::SeqCst) {
                return;
            }
            std::mem::take(&mut *idle)
        };
        self.shared.slots.close();
        debug!(
            "Closing pool for {} ({} idle connections)",
            self.connector.endpoint(),
            idle.len()
        );
        for transport in idle {
            self.shared.live.fetch_sub(1, Ordering::SeqCst);
            transport.close().await;
        }
    }
}

/// Exclusive use of one pooled handle.
///
/// Dropping the lease releases the handle to the idle set, unless the
/// handle is already dead or the pool is closed, in which case it is
/// destroyed.
pub struct Lease<T: Transport> {
    transport: Option<Arc<T>>,
    shared: Arc<Shared<T>>,
    _permit: OwnedSemaphorePermit,
}

impl<T: Transport> Lease<T> {
    fn new(transport: Arc<T>, shared: Arc<Shared<T>>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            transport: Some(transport),
            shared,
            _permit: permit,
        }
    }

    pub fn transport(&self) -> Option<Arc<T>> {
        self.transport.clone()
    }

    /// Return the handle for reuse.
    pub fn release(self) {}

    /// Destroy the handle instead of returning it.
    pub async fn invalidate(mut self) {
        if let Some(transport) = self.transport.take() {
            self.shared.live.fetch_sub(1, Ordering::SeqCst);
            warn!("Invalidating pooled connection");
            transport.close().await;
        }
    }
}

impl<T: Transport> Drop for Lease<T> {
    fn drop(&mut self) {
        let Some(transport) = self.transport.take() else {
            return;
        };
        {
            let mut idle = self.shared.idle();
            if !transport.is_closed() && !self.shared.closed.load(Ordering::SeqCst) {
                // Pushed before the permit is released so the next holder sees it
                idle.push(transport);
                return;
            }
        }
        self.shared.live.fetch_sub(1, Ordering::SeqCst);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move { transport.close().await });
        }
    }
}
