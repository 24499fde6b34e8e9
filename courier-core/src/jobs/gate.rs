//! Concurrency gates passed before a claimed job may execute.
//!
//! Two independent limits apply: a per-queue lane bounded by the queue's
//! worker concurrency, and an optional process-wide pool shared by every
//! queue that declares a global capacity. Both are released by dropping the
//! returned [`ExecutionPermit`], so every exit path (including a panicking
//! handler) gives the slots back.

use std::{
    cmp::Ordering,
    collections::{BinaryHeap, HashMap},
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tokio::sync::{OwnedSemaphorePermit, Semaphore, oneshot};
use tokio_util::sync::CancellationToken;

use super::{catalog::QueueCatalog, job::QueueName};

/// Counting semaphore whose waiters are served by priority (lower value
/// first) and FIFO within a priority.
pub struct PriorityGate {
    capacity: usize,
    state: Mutex<GateState>,
}

struct GateState {
    available: usize,
    next_seq: u64,
    waiters: BinaryHeap<Waiter>,
}

struct Waiter {
    priority: i32,
    seq: u64,
    tx: oneshot::Sender<GlobalPermit>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    // BinaryHeap pops the greatest element; invert both keys.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl fmt::Debug for PriorityGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("PriorityGate")
            .field("capacity", &self.capacity)
            .field("available", &state.available)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

impl PriorityGate {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            state: Mutex::new(GateState {
                available: capacity,
                next_seq: 0,
                waiters: BinaryHeap::new(),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Permits currently held.
    pub fn in_use(&self) -> usize {
        self.capacity - self.lock().available
    }

    pub fn waiting(&self) -> usize {
        self.lock().waiters.len()
    }

    /// Take a permit if one is free and nobody is queued for it.
    pub fn try_acquire(self: &Arc<Self>) -> Option<GlobalPermit> {
        let mut state = self.lock();
        if state.available > 0 && state.waiters.is_empty() {
            state.available -= 1;
            Some(GlobalPermit::new(Arc::clone(self)))
        } else {
            None
        }
    }

    /// Wait for a permit. Dropping the returned future gives up the place in
    /// line; a permit handed over concurrently is returned to the pool.
    pub async fn acquire(self: &Arc<Self>, priority: i32) -> GlobalPermit {
        let rx = {
            let mut state = self.lock();
            if state.available > 0 && state.waiters.is_empty() {
                state.available -= 1;
                return GlobalPermit::new(Arc::clone(self));
            }
            let (tx, rx) = oneshot::channel();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.waiters.push(Waiter { priority, seq, tx });
            rx
        };

        match rx.await {
            Ok(permit) => permit,
            // Only reachable if the waiter was dropped without a send.
            Err(_) => self.acquire_fallback().await,
        }
    }

    async fn acquire_fallback(self: &Arc<Self>) -> GlobalPermit {
        loop {
            if let Some(permit) = self.try_acquire() {
                return permit;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    fn release(self: &Arc<Self>) {
        loop {
            let waiter = {
                let mut state = self.lock();
                match state.waiters.pop() {
                    Some(waiter) => waiter,
                    None => {
                        state.available += 1;
                        return;
                    }
                }
            };
            match waiter.tx.send(GlobalPermit::new(Arc::clone(self))) {
                Ok(()) => return,
                // The waiter gave up; hand the slot to the next one.
                Err(mut unclaimed) => unclaimed.disarm(),
            }
        }
    }
}

/// One slot of the global pool. Dropping it releases the slot.
pub struct GlobalPermit {
    gate: Option<Arc<PriorityGate>>,
}

impl GlobalPermit {
    fn new(gate: Arc<PriorityGate>) -> Self {
        Self { gate: Some(gate) }
    }

    fn disarm(&mut self) {
        self.gate = None;
    }
}

impl fmt::Debug for GlobalPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalPermit")
            .field("armed", &self.gate.is_some())
            .finish()
    }
}

impl Drop for GlobalPermit {
    fn drop(&mut self) {
        if let Some(gate) = self.gate.take() {
            gate.release();
        }
    }
}

/// Both slots needed to run one job. Dropping releases them.
#[derive(Debug)]
pub struct ExecutionPermit {
    _lane: OwnedSemaphorePermit,
    global: Option<GlobalPermit>,
}

impl ExecutionPermit {
    pub fn holds_global(&self) -> bool {
        self.global.is_some()
    }
}

#[derive(Debug)]
struct Lane {
    slots: Arc<Semaphore>,
    priority: i32,
    gated: bool,
}

/// Per-queue lanes plus the shared global pool.
#[derive(Debug)]
pub struct ConcurrencyGate {
    lanes: HashMap<QueueName, Lane>,
    global: Option<Arc<PriorityGate>>,
}

impl ConcurrencyGate {
    pub fn from_catalog(catalog: &QueueCatalog) -> Self {
        let lanes = catalog
            .queues()
            .map(|spec| {
                (
                    spec.name().clone(),
                    Lane {
                        slots: Arc::new(Semaphore::new(spec.concurrency())),
                        priority: spec.priority(),
                        gated: spec.is_globally_gated(),
                    },
                )
            })
            .collect();

        Self {
            lanes,
            global: catalog.global_capacity().map(PriorityGate::new),
        }
    }

    pub fn global(&self) -> Option<&Arc<PriorityGate>> {
        self.global.as_ref()
    }

    /// Free per-queue slots right now.
    pub fn available(&self, queue: &str) -> usize {
        self.lanes
            .get(queue)
            .map(|lane| lane.slots.available_permits())
            .unwrap_or(0)
    }

    /// Reserve as many execution slots as the queue can use right now.
    ///
    /// Free per-queue slots are taken without waiting. For globally gated
    /// queues each one is paired with a global permit; when none is free the
    /// call waits, in priority order, for a single permit. Returns an empty
    /// batch when the lane is full or `shutdown` fires while waiting.
    pub async fn reserve(
        &self,
        queue: &str,
        shutdown: &CancellationToken,
    ) -> Vec<ExecutionPermit> {
        let Some(lane) = self.lanes.get(queue) else {
            return Vec::new();
        };

        let mut local = Vec::new();
        while let Ok(permit) = Arc::clone(&lane.slots).try_acquire_owned() {
            local.push(permit);
        }
        if local.is_empty() {
            return Vec::new();
        }

        let Some(global) = self.global.as_ref().filter(|_| lane.gated) else {
            return local
                .into_iter()
                .map(|permit| ExecutionPermit {
                    _lane: permit,
                    global: None,
                })
                .collect();
        };

        let mut paired = Vec::with_capacity(local.len());
        let mut local = local.into_iter();
        while let Some(lane_permit) = local.next() {
            match global.try_acquire() {
                Some(global_permit) => paired.push(ExecutionPermit {
                    _lane: lane_permit,
                    global: Some(global_permit),
                }),
                None => {
                    if paired.is_empty() {
                        let global_permit = tokio::select! {
                            _ = shutdown.cancelled() => return Vec::new(),
                            permit = global.acquire(lane.priority) => permit,
                        };
                        paired.push(ExecutionPermit {
                            _lane: lane_permit,
                            global: Some(global_permit),
                        });
                    }
                    break;
                }
            }
        }
        paired
    }
}
