//! Query-level memory budget and repartition pressure.
//!
//! An aggregation reserves bytes from a shared [`MemoryBudget`] when it opens
//! and asks the returned signal whether its hash table has outgrown the
//! grant. When it has, the node raises its hash level so the next build pass
//! partitions groups with an independent seed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// How much of the requested memory was actually granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryPressure {
    /// At least three quarters of the request was granted.
    Normal,
    /// Between 40% and 75% of the request was granted.
    Elevated,
    /// Less than 40% of the request was granted.
    Critical,
}

/// Repartition guidance attached to one reservation.
#[derive(Debug, Clone, Copy)]
pub struct MemoryPressureSignal {
    /// Pressure classification.
    pub pressure: MemoryPressure,
    /// Bytes granted to this reservation.
    pub granted_bytes: usize,
    /// Repartition ratio numerator.
    pub trigger_num: u32,
    /// Repartition ratio denominator.
    pub trigger_den: u32,
}

impl MemoryPressureSignal {
    /// True when `estimated_bytes` exceeds `granted * num / den`.
    ///
    /// A zero grant always asks for repartitioning.
    #[must_use]
    pub fn should_repartition(&self, estimated_bytes: usize) -> bool {
        if self.granted_bytes == 0 {
            return true;
        }
        let lhs = (estimated_bytes as u128).saturating_mul(self.trigger_den.max(1) as u128);
        let rhs = (self.granted_bytes as u128).saturating_mul(self.trigger_num as u128);
        lhs > rhs
    }

    fn unlimited(granted_bytes: usize) -> Self {
        Self {
            pressure: MemoryPressure::Normal,
            granted_bytes,
            trigger_num: 1,
            trigger_den: 1,
        }
    }
}

/// Process-wide byte budget shared by every fragment.
#[derive(Debug)]
pub struct MemoryBudget {
    limit_bytes: usize,
    in_use_bytes: AtomicUsize,
}

impl MemoryBudget {
    /// Budget with a hard byte limit. `usize::MAX` disables accounting.
    #[must_use]
    pub fn new(limit_bytes: usize) -> Arc<Self> {
        Arc::new(Self {
            limit_bytes,
            in_use_bytes: AtomicUsize::new(0),
        })
    }

    /// Bytes currently held by live reservations.
    pub fn in_use_bytes(&self) -> usize {
        self.in_use_bytes.load(Ordering::Acquire)
    }

    /// Reserve up to `requested_bytes`. The grant may be smaller under contention.
    #[must_use]
    pub fn reserve(self: &Arc<Self>, requested_bytes: usize) -> MemoryReservation {
        if self.limit_bytes == usize::MAX || requested_bytes == 0 {
            return MemoryReservation {
                budget: Arc::clone(self),
                reserved_bytes: 0,
                signal: MemoryPressureSignal::unlimited(requested_bytes),
            };
        }

        let mut current = self.in_use_bytes.load(Ordering::Acquire);
        loop {
            let granted = requested_bytes.min(self.limit_bytes.saturating_sub(current));
            match self.in_use_bytes.compare_exchange_weak(
                current,
                current.saturating_add(granted),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return MemoryReservation {
                        budget: Arc::clone(self),
                        reserved_bytes: granted,
                        signal: classify(requested_bytes, granted),
                    };
                }
                Err(observed) => current = observed,
            }
        }
    }
}

fn classify(requested: usize, granted: usize) -> MemoryPressureSignal {
    let ratio = granted as f64 / requested.max(1) as f64;
    if ratio >= 0.75 {
        MemoryPressureSignal::unlimited(granted)
    } else if ratio >= 0.40 {
        MemoryPressureSignal {
            pressure: MemoryPressure::Elevated,
            granted_bytes: granted,
            trigger_num: 4,
            trigger_den: 5,
        }
    } else {
        MemoryPressureSignal {
            pressure: MemoryPressure::Critical,
            granted_bytes: granted,
            trigger_num: 3,
            trigger_den: 5,
        }
    }
}

/// RAII grant that returns its bytes to the budget on drop.
#[derive(Debug)]
pub struct MemoryReservation {
    budget: Arc<MemoryBudget>,
    reserved_bytes: usize,
    signal: MemoryPressureSignal,
}

impl MemoryReservation {
    /// Pressure signal for this reservation.
    #[must_use]
    pub fn signal(&self) -> MemoryPressureSignal {
        self.signal
    }

    /// Bytes held against the shared budget.
    pub fn reserved_bytes(&self) -> usize {
        self.reserved_bytes
    }
}

impl Drop for MemoryReservation {
    fn drop(&mut self) {
        if self.reserved_bytes > 0 {
            self.budget
                .in_use_bytes
                .fetch_sub(self.reserved_bytes, Ordering::AcqRel);
        }
    }
}
