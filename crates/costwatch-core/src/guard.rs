//! Single-flight guard serializing usage fetches within one process.
//!
//! Waiters queue in FIFO order. `release` hands ownership straight to the
//! head of the queue while still holding the internal lock, so a third
//! caller never observes the guard as free during a hand-over.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

struct Waiter {
    id: u64,
    tx: oneshot::Sender<bool>,
}

#[derive(Default)]
struct Inner {
    held: bool,
    next_id: u64,
    waiters: VecDeque<Waiter>,
}

/// Binary mutual-exclusion primitive with bounded, FIFO waiting
#[derive(Default)]
pub struct SingleFlightGuard {
    inner: Mutex<Inner>,
}

impl SingleFlightGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the guard, waiting at most `timeout`.
    ///
    /// Returns `false` on timeout or when the queue is force-released.
    pub async fn acquire(&self, timeout: Duration) -> bool {
        let mut ticket = {
            let mut inner = self.inner.lock();
            if !inner.held {
                inner.held = true;
                return true;
            }
            let id = inner.next_id;
            inner.next_id = inner.next_id.wrapping_add(1);
            let (tx, rx) = oneshot::channel();
            inner.waiters.push_back(Waiter { id, tx });
            debug!(waiter = id, queued = inner.waiters.len(), "Single-flight guard busy, queued");
            Ticket {
                guard: self,
                id,
                rx,
                settled: false,
            }
        };

        let waited = tokio::time::timeout(timeout, &mut ticket.rx).await;
        let granted = match waited {
            Ok(result) => result.unwrap_or(false),
            Err(_) => ticket.withdraw(),
        };
        ticket.settled = true;
        granted
    }

    /// Acquire the guard and return a permit that releases it on drop
    pub async fn lock(&self, timeout: Duration) -> Option<FlightPermit<'_>> {
        if self.acquire(timeout).await {
            Some(FlightPermit { guard: self })
        } else {
            None
        }
    }

    /// Release the guard, handing it to the oldest live waiter if any
    pub fn release(&self) {
        let mut inner = self.inner.lock();
        if !inner.held {
            warn!("Release called on a single-flight guard that is not held");
            return;
        }
        while let Some(waiter) = inner.waiters.pop_front() {
            // A failed send means the waiter went away; try the next one
            if waiter.tx.send(true).is_ok() {
                debug!(waiter = waiter.id, "Single-flight guard handed over");
                return;
            }
        }
        inner.held = false;
    }

    /// Clear the guard and fail every queued waiter. Used at shutdown.
    pub fn force_release(&self) {
        let mut inner = self.inner.lock();
        inner.held = false;
        let failed = inner.waiters.len();
        for waiter in inner.waiters.drain(..) {
            let _ = waiter.tx.send(false);
        }
        if failed > 0 {
            debug!(failed, "Single-flight guard force-released queued waiters");
        }
    }

    pub fn is_held(&self) -> bool {
        self.inner.lock().held
    }

    /// Number of callers currently waiting
    pub fn queued(&self) -> usize {
        self.inner.lock().waiters.len()
    }
}

/// A queued `acquire` call. Dropping it unsettled (the caller's future was
/// cancelled) removes it from the queue, or passes ownership on if it was
/// granted in the meantime.
struct Ticket<'a> {
    guard: &'a SingleFlightGuard,
    id: u64,
    rx: oneshot::Receiver<bool>,
    settled: bool,
}

impl Ticket<'_> {
    /// Leave the queue after a timeout. Returns `true` only if ownership was
    /// transferred before we could withdraw.
    fn withdraw(&mut self) -> bool {
        let mut inner = self.guard.inner.lock();
        if let Some(pos) = inner.waiters.iter().position(|w| w.id == self.id) {
            inner.waiters.remove(pos);
            return false;
        }
        drop(inner);
        self.rx.try_recv().unwrap_or(false)
    }
}

impl Drop for Ticket<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if self.withdraw() {
            self.guard.release();
        }
    }
}

/// Ownership of a [`SingleFlightGuard`]; released when dropped
pub struct FlightPermit<'a> {
    guard: &'a SingleFlightGuard,
}

impl Drop for FlightPermit<'_> {
    fn drop(&mut self) {
        self.guard.release();
    }
}
