use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tundra_common::{EngineConfig, MemoryBudget, MetricsRegistry, QueryId};

type CancelCallback = Box<dyn Fn() + Send + Sync>;

/// Query-wide stop request shared by every node of a fragment.
///
/// Observers poll [`CancellationToken::is_cancelled`] or register a callback
/// that runs once when cancellation is requested.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    callbacks: Mutex<Vec<CancelCallback>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Request cancellation. Callbacks run on the calling thread; repeated calls are no-ops.
    pub fn cancel(&self) {
        let callbacks = {
            let mut guard = self
                .inner
                .callbacks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if self.inner.cancelled.swap(true, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut *guard)
        };
        for cb in callbacks {
            cb();
        }
    }

    /// Run `cb` when cancellation is requested, or immediately if it already was.
    pub fn on_cancel(&self, cb: impl Fn() + Send + Sync + 'static) {
        {
            let mut guard = self
                .inner
                .callbacks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if !self.inner.cancelled.load(Ordering::Acquire) {
                guard.push(Box::new(cb));
                return;
            }
        }
        cb();
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Read-only execution environment handed to every node call.
#[derive(Debug, Clone)]
pub struct RuntimeState {
    query_id: QueryId,
    config: EngineConfig,
    metrics: MetricsRegistry,
    memory: Arc<MemoryBudget>,
    cancel: CancellationToken,
}

impl RuntimeState {
    /// State with a fresh metrics registry and a budget sized from `config`.
    pub fn new(query_id: QueryId, config: EngineConfig) -> Self {
        let memory = MemoryBudget::new(config.mem_budget_bytes);
        Self {
            query_id,
            config,
            metrics: MetricsRegistry::new(),
            memory,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsRegistry) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_memory_budget(mut self, memory: Arc<MemoryBudget>) -> Self {
        self.memory = memory;
        self
    }

    /// Share `cancel` with another owner that may cancel the query.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    pub fn memory(&self) -> &Arc<MemoryBudget> {
        &self.memory
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
