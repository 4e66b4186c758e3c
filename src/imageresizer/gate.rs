//! Admission control for scaler processes.
//!
//! A bounded counter of live scaler processes. Admission never blocks or
//! queues: when the ceiling is reached the caller is turned away at once and
//! is expected to serve the original image instead.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::observability::metrics;

#[derive(Debug)]
pub struct ConcurrencyGate {
    live: AtomicU32,
    ceiling: u32,
    rejected: AtomicU64,
}

impl ConcurrencyGate {
    pub fn new(ceiling: u32) -> Self {
        Self {
            live: AtomicU32::new(0),
            ceiling,
            rejected: AtomicU64::new(0),
        }
    }

    /// Admit one more scaler if the ceiling allows it.
    ///
    /// A rejected call leaves the live count untouched.
    pub fn acquire(&self) -> bool {
        let mut prev = self.live.load(Ordering::Relaxed);
        loop {
            if prev >= self.ceiling {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                metrics::record_concurrency_limit_exceeded();
                return false;
            }
            match self.live.compare_exchange_weak(
                prev,
                prev + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    metrics::record_scaler_processes(prev + 1);
                    return true;
                }
                Err(x) => prev = x,
            }
        }
    }

    /// Return one slot. Pair with a successful [`acquire`](Self::acquire).
    pub fn release(&self) {
        let prev = self.live.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "scaler slot released twice");
        metrics::record_scaler_processes(prev.saturating_sub(1));
    }

    /// Scoped acquisition: the slot is returned when the permit drops.
    pub fn try_acquire(self: &Arc<Self>) -> Option<ScalerPermit> {
        self.acquire().then(|| ScalerPermit { gate: self.clone() })
    }

    pub fn live(&self) -> u32 {
        self.live.load(Ordering::Acquire)
    }

    pub fn ceiling(&self) -> u32 {
        self.ceiling
    }

    /// Number of rejected admissions since creation.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

/// One admitted scaler slot.
#[derive(Debug)]
pub struct ScalerPermit {
    gate: Arc<ConcurrencyGate>,
}

impl Drop for ScalerPermit {
    fn drop(&mut self) {
        self.gate.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn rejects_past_ceiling_without_touching_count() {
        let gate = Arc::new(ConcurrencyGate::new(3));
        let permits: Vec<_> = (0..3).map(|_| gate.try_acquire().unwrap()).collect();
        assert_eq!(gate.live(), 3);

        assert!(gate.try_acquire().is_none());
        assert_eq!(gate.live(), 3);
        assert_eq!(gate.rejected(), 1);

        drop(permits);
        assert_eq!(gate.live(), 0);
        assert!(gate.try_acquire().is_some());
    }

    #[test]
    fn permit_releases_once() {
        let gate = Arc::new(ConcurrencyGate::new(1));
        {
            let _permit = gate.try_acquire().unwrap();
            assert_eq!(gate.live(), 1);
        }
        assert_eq!(gate.live(), 0);
    }

    #[test]
    fn concurrent_acquisitions_never_exceed_ceiling() {
        let gate = Arc::new(ConcurrencyGate::new(100));
        let barrier = Arc::new(Barrier::new(16));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let gate = gate.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    let mut held = Vec::new();
                    for _ in 0..50 {
                        if let Some(p) = gate.try_acquire() {
                            assert!(gate.live() <= gate.ceiling());
                            held.push(p);
                        }
                    }
                    // hold every permit until all threads are done acquiring
                    barrier.wait();
                    held.len()
                })
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 100);
        assert_eq!(gate.rejected(), 16 * 50 - 100);
        assert_eq!(gate.live(), 0);
    }
}
