//! # TLB Flush Sequencer
//!
//! Per address space generation counter. It advances once the GPU has
//! consumed an update that changes translation structure, which tells the
//! submission path that cached translations of this space may be stale.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use magma_core::{CompletionSignal, Registration};

/// TLB generation of one address space
#[derive(Debug)]
pub struct TlbSequence {
    seq: Arc<AtomicU64>,
    last_flush: spin::Mutex<CompletionSignal>,
}

impl TlbSequence {
    /// Start at generation zero with a retired last-flush signal
    pub fn new() -> Self {
        Self {
            seq: Arc::new(AtomicU64::new(0)),
            last_flush: spin::Mutex::new(CompletionSignal::signaled()),
        }
    }

    /// Current generation
    pub fn current(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    /// Signal of the last update that requested a flush
    pub fn last_flush(&self) -> CompletionSignal {
        self.last_flush.lock().clone()
    }

    /// Advance the generation once `signal` retires
    ///
    /// Advances immediately if the signal already retired or the
    /// continuation cannot be queued.
    pub fn bump_on(&self, signal: &CompletionSignal) {
        *self.last_flush.lock() = signal.clone();

        let seq = self.seq.clone();
        match signal.on_signaled(move || {
            seq.fetch_add(1, Ordering::AcqRel);
        }) {
            Registration::Registered => {}
            Registration::AlreadySignaled(bump) | Registration::OutOfMemory(bump) => bump(),
        }
    }
}

impl Default for TlbSequence {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bump_deferred_until_signal() {
        let tlb = TlbSequence::new();
        let signal = CompletionSignal::new();
        tlb.bump_on(&signal);
        assert_eq!(tlb.current(), 0);
        assert!(tlb.last_flush().ptr_eq(&signal));

        signal.signal();
        assert_eq!(tlb.current(), 1);
        signal.signal();
        assert_eq!(tlb.current(), 1);
    }

    #[test]
    fn test_bump_immediate_on_retired_signal() {
        let tlb = TlbSequence::new();
        tlb.bump_on(&CompletionSignal::signaled());
        assert_eq!(tlb.current(), 1);
    }

    #[test]
    fn test_monotonic() {
        let tlb = TlbSequence::new();
        let signals: [CompletionSignal; 4] = Default::default();
        let pending: alloc::vec::Vec<CompletionSignal> =
            (0..4).map(|_| CompletionSignal::new()).collect();
        let mut last = tlb.current();
        for (done, pend) in signals.iter().zip(&pending) {
            tlb.bump_on(done);
            tlb.bump_on(pend);
            assert!(tlb.current() > last);
            last = tlb.current();
        }
        for pend in pending.iter().rev() {
            pend.signal();
            assert!(tlb.current() > last);
            last = tlb.current();
        }
        assert_eq!(last, 8);
    }
}
