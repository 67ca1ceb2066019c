//! # Synchronization Primitives
//!
//! Completion signals and buffer reservations.
//!
//! A [`CompletionSignal`] is a one-shot notification that some piece of GPU
//! work retired. Continuations registered on a pending signal run exactly
//! once, on whichever thread signals it.
//!
//! A [`Reservation`] is the per-buffer lock plus the set of signals that
//! must retire before the buffer's contents may be reused.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::types::FenceHandle;

// =============================================================================
// CLOCK
// =============================================================================

/// Monotonic time source used for bounded waits
pub trait Clock {
    /// Current time in nanoseconds
    fn now_ns(&self) -> u64;
}

// =============================================================================
// COMPLETION SIGNAL
// =============================================================================

/// Continuation run when a signal retires
pub type Continuation = Box<dyn FnOnce() + Send + 'static>;

/// Outcome of [`CompletionSignal::on_signaled`]
pub enum Registration<F> {
    /// The continuation will run when the signal retires
    Registered,
    /// The signal already retired; the continuation is handed back
    AlreadySignaled(F),
    /// No room for the continuation record; the continuation is handed back
    OutOfMemory(F),
}

impl<F> Registration<F> {
    /// True if the continuation was queued
    pub fn is_registered(&self) -> bool {
        matches!(self, Registration::Registered)
    }
}

static NEXT_SIGNAL: AtomicU64 = AtomicU64::new(1);

struct SignalInner {
    id: FenceHandle,
    signaled: AtomicBool,
    callbacks: spin::Mutex<Vec<Continuation>>,
}

/// One-shot completion notification for submitted GPU work
///
/// Cloning shares the same underlying signal.
#[derive(Clone)]
pub struct CompletionSignal {
    inner: Arc<SignalInner>,
}

impl CompletionSignal {
    fn with_state(signaled: bool) -> Self {
        Self {
            inner: Arc::new(SignalInner {
                id: FenceHandle::new(NEXT_SIGNAL.fetch_add(1, Ordering::Relaxed)),
                signaled: AtomicBool::new(signaled),
                callbacks: spin::Mutex::new(Vec::new()),
            }),
        }
    }

    /// Create a pending signal
    pub fn new() -> Self {
        Self::with_state(false)
    }

    /// Create a signal that has already retired
    ///
    /// Used as the initial value of "last update" style slots.
    pub fn signaled() -> Self {
        Self::with_state(true)
    }

    /// Identity of this signal
    pub fn id(&self) -> FenceHandle {
        self.inner.id
    }

    /// True once the work retired
    pub fn is_signaled(&self) -> bool {
        self.inner.signaled.load(Ordering::Acquire)
    }

    /// True if both handles refer to the same signal
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Retire the signal and run every queued continuation
    ///
    /// Signaling twice is a no-op.
    pub fn signal(&self) {
        let callbacks = {
            let mut queue = self.inner.callbacks.lock();
            if self.inner.signaled.swap(true, Ordering::AcqRel) {
                return;
            }
            core::mem::take(&mut *queue)
        };

        for callback in callbacks {
            callback();
        }
    }

    /// Queue a continuation to run when the signal retires
    ///
    /// The continuation is returned to the caller if the signal already
    /// retired or if the continuation record cannot be stored.
    pub fn on_signaled<F>(&self, f: F) -> Registration<F>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut queue = self.inner.callbacks.lock();
        if self.inner.signaled.load(Ordering::Acquire) {
            return Registration::AlreadySignaled(f);
        }
        if queue.try_reserve(1).is_err() {
            return Registration::OutOfMemory(f);
        }
        queue.push(Box::new(f));
        Registration::Registered
    }

    /// Spin until the signal retires
    pub fn wait(&self) {
        while !self.is_signaled() {
            core::hint::spin_loop();
        }
    }

    /// Spin until the signal retires or `timeout_ns` elapses
    ///
    /// Returns the remaining budget on success.
    pub fn wait_timeout(&self, clock: &dyn Clock, timeout_ns: u64) -> Result<u64> {
        let start = clock.now_ns();
        loop {
            let elapsed = clock.now_ns().saturating_sub(start);
            if self.is_signaled() {
                return Ok(timeout_ns.saturating_sub(elapsed));
            }
            if elapsed >= timeout_ns {
                return Err(Error::Timeout);
            }
            core::hint::spin_loop();
        }
    }
}

impl Default for CompletionSignal {
    fn default() -> Self {
        Self::signaled()
    }
}

impl core::fmt::Debug for CompletionSignal {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CompletionSignal")
            .field("id", &self.inner.id)
            .field("signaled", &self.is_signaled())
            .finish()
    }
}

// =============================================================================
// RESERVATION
// =============================================================================

/// How a fenced operation uses the reserved buffer
///
/// Ordered from most to least restrictive; a query for one usage also
/// returns every more restrictive usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FenceUsage {
    /// Kernel-internal moves and clears
    Kernel,
    /// Writers
    Write,
    /// Readers
    Read,
    /// Bookkeeping only, e.g. page-table updates
    Bookkeep,
}

static NEXT_RESERVATION: AtomicU64 = AtomicU64::new(1);

/// Buffer reservation: exclusive lock plus the outstanding signals
pub struct Reservation {
    id: u64,
    locked: AtomicBool,
    fences: spin::Mutex<Vec<(CompletionSignal, FenceUsage)>>,
}

impl Reservation {
    /// Create an unlocked reservation with no fences
    pub fn new() -> Self {
        Self {
            id: NEXT_RESERVATION.fetch_add(1, Ordering::Relaxed),
            locked: AtomicBool::new(false),
            fences: spin::Mutex::new(Vec::new()),
        }
    }

    /// Unique id of this reservation
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Acquire the reservation, spinning while it is held
    pub fn lock(&self) -> ReservationGuard<'_> {
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            core::hint::spin_loop();
        }
    }

    /// Acquire the reservation without waiting
    pub fn try_lock(&self) -> Option<ReservationGuard<'_>> {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| ReservationGuard { resv: self })
    }

    /// True while someone holds the reservation
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// Track a signal that must retire before the buffer is idle
    ///
    /// Retired signals are pruned on the way.
    pub fn add_fence(&self, signal: CompletionSignal, usage: FenceUsage) {
        let mut fences = self.fences.lock();
        fences.retain(|(f, _)| !f.is_signaled());
        if !fences.iter().any(|(f, _)| f.ptr_eq(&signal)) {
            fences.push((signal, usage));
        }
    }

    /// Pending signals with the given usage or any more restrictive one
    pub fn fences(&self, usage: FenceUsage) -> Vec<CompletionSignal> {
        self.fences
            .lock()
            .iter()
            .filter(|(f, u)| *u <= usage && !f.is_signaled())
            .map(|(f, _)| f.clone())
            .collect()
    }

    /// True if every signal up to `usage` retired
    pub fn test_signaled(&self, usage: FenceUsage) -> bool {
        self.fences
            .lock()
            .iter()
            .all(|(f, u)| *u > usage || f.is_signaled())
    }

    /// Wait for every signal up to `usage`, bounded by `timeout_ns`
    ///
    /// Returns the remaining budget on success.
    pub fn wait_timeout(&self, usage: FenceUsage, clock: &dyn Clock, timeout_ns: u64) -> Result<u64> {
        let mut remaining = timeout_ns;
        for fence in self.fences(usage) {
            remaining = fence.wait_timeout(clock, remaining)?;
        }
        Ok(remaining)
    }
}

impl Default for Reservation {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Reservation")
            .field("id", &self.id)
            .field("locked", &self.is_locked())
            .finish()
    }
}

/// RAII guard for a held [`Reservation`]
pub struct ReservationGuard<'a> {
    resv: &'a Reservation,
}

impl ReservationGuard<'_> {
    /// The reservation this guard holds
    pub fn reservation(&self) -> &Reservation {
        self.resv
    }
}

impl Drop for ReservationGuard<'_> {
    fn drop(&mut self) {
        self.resv.locked.store(false, Ordering::Release);
    }
}
