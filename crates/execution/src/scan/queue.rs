//! Bounded batch queue shared by scan workers and the scan consumer.
//!
//! One mutex guards the buffered batches, the live-worker count and the
//! delivery counters. Two condition variables split the waiters: the
//! consumer waits on `reader` for "batch available, scanning finished,
//! failure or cancellation", producers wait on `writer` for "space available,
//! failure or cancellation". Every transition that can satisfy a waiter is
//! made under the mutex and followed by a notify on the matching condvar.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use tundra_common::{Result, TundraError};

use crate::batch::RowBatch;
use crate::scan::status::FirstErrorCell;

/// Delivery counters. `produced == delivered + discarded` once the queue is drained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub produced: u64,
    pub delivered: u64,
    pub discarded: u64,
    /// Highest number of batches buffered at once.
    pub max_depth: usize,
}

/// Result of [`BatchQueue::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Pushed,
    /// The queue stopped accepting batches; the batch was discarded.
    Stopped,
}

#[derive(Debug, Default)]
struct QueueState {
    batches: VecDeque<RowBatch>,
    running_workers: usize,
    stats: QueueStats,
}

#[derive(Debug)]
pub struct BatchQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    reader: Condvar,
    writer: Condvar,
    cancelled: AtomicBool,
    finished: AtomicBool,
    status: FirstErrorCell,
}

impl BatchQueue {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(TundraError::Construction(
                "batch queue capacity must be > 0".to_string(),
            ));
        }
        Ok(Self {
            capacity,
            state: Mutex::new(QueueState::default()),
            reader: Condvar::new(),
            writer: Condvar::new(),
            cancelled: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            status: FirstErrorCell::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Announce `n` workers before they start. With `n == 0` scanning is finished at once.
    pub fn register_workers(&self, n: usize) {
        let mut st = self.lock();
        st.running_workers += n;
        if st.running_workers == 0 {
            self.finished.store(true, Ordering::Release);
            drop(st);
            self.reader.notify_all();
        }
    }

    /// Called exactly once per registered worker. The last one marks scanning finished.
    pub fn worker_finished(&self) {
        let mut st = self.lock();
        st.running_workers = st.running_workers.saturating_sub(1);
        if st.running_workers == 0 {
            self.finished.store(true, Ordering::Release);
            drop(st);
            self.reader.notify_all();
        }
    }

    pub fn running_workers(&self) -> usize {
        self.lock().running_workers
    }

    /// Lock-free check for the worker loop: stop on cancellation or any recorded failure.
    pub fn should_stop(&self) -> bool {
        self.cancelled.load(Ordering::Acquire) || self.status.is_set()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Block until there is room, then enqueue. Gives up on cancellation or failure.
    pub fn push(&self, batch: RowBatch) -> PushOutcome {
        let mut st = self.lock();
        st.stats.produced += 1;
        loop {
            if self.should_stop() {
                st.stats.discarded += 1;
                return PushOutcome::Stopped;
            }
            if st.batches.len() < self.capacity {
                st.batches.push_back(batch);
                st.stats.max_depth = st.stats.max_depth.max(st.batches.len());
                drop(st);
                self.reader.notify_one();
                return PushOutcome::Pushed;
            }
            st = self
                .writer
                .wait(st)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block until a batch, end of stream, a failure or cancellation.
    ///
    /// A recorded failure wins over buffered batches; those are discarded.
    pub fn pop(&self) -> Result<Option<RowBatch>> {
        let mut st = self.lock();
        loop {
            if let Some(err) = self.status.get() {
                Self::discard_buffered(&mut st);
                return Err(err.clone());
            }
            if self.is_cancelled() {
                return Err(TundraError::Cancelled);
            }
            if let Some(batch) = st.batches.pop_front() {
                st.stats.delivered += 1;
                drop(st);
                self.writer.notify_one();
                return Ok(Some(batch));
            }
            if st.running_workers == 0 && self.is_finished() {
                return Ok(None);
            }
            st = self
                .reader
                .wait(st)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Record `err` if it is the first failure and wake every waiter.
    ///
    /// Returns `true` when this call recorded the failure.
    pub fn record_failure(&self, err: TundraError) -> bool {
        let mut st = self.lock();
        let won = self.status.record(err);
        if won {
            Self::discard_buffered(&mut st);
        }
        drop(st);
        self.reader.notify_all();
        self.writer.notify_all();
        won
    }

    pub fn failure(&self) -> Option<TundraError> {
        self.status.get().cloned()
    }

    /// Stop producers and the consumer. Idempotent.
    pub fn cancel(&self) {
        let st = self.lock();
        self.cancelled.store(true, Ordering::Release);
        drop(st);
        self.reader.notify_all();
        self.writer.notify_all();
    }

    /// Discard whatever is still buffered. Returns the number of batches dropped.
    pub fn drain(&self) -> usize {
        let mut st = self.lock();
        Self::discard_buffered(&mut st)
    }

    pub fn len(&self) -> usize {
        self.lock().batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        self.lock().stats
    }

    fn discard_buffered(st: &mut QueueState) -> usize {
        let n = st.batches.len();
        st.stats.discarded += n as u64;
        st.batches.clear();
        n
    }
}
