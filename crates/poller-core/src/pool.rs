//! Owns the worker slots and the priority queue; enforces per-OLT serialization and detects
//! saturation (§4.D).

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::clock::Clock;
use crate::composite_node::{CompositeNode, DispatchOutcome};
use crate::lock::DistributedLock;
use crate::model::OltId;
use crate::queue::{NodeQueue, QueueEntrySnapshot};
use crate::runtime::ExecutionRuntime;
use crate::store::PollerStore;
use crate::worker::{SlotStats, WorkerSlot};

const SATURATION_BUSY_PCT: f64 = 75.0;
const SATURATION_QUEUE_FACTOR: usize = 2;

pub struct WorkerPool {
    slots: Vec<Arc<WorkerSlot>>,
    queue: NodeQueue,
    store: Arc<dyn PollerStore>,
    lock: Arc<dyn DistributedLock>,
    runtime: Arc<dyn ExecutionRuntime>,
    clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone)]
pub struct PoolStats {
    pub total_pollers: usize,
    pub free_pollers: usize,
    pub busy_pollers: usize,
    pub busy_percentage: f64,
    pub queue_size: usize,
    pub is_saturated: bool,
    pub is_overload: bool,
    pub total_tasks_completed: u64,
    pub total_tasks_delayed: u64,
}

impl WorkerPool {
    pub fn new(
        size: usize,
        queue_max_size: usize,
        store: Arc<dyn PollerStore>,
        lock: Arc<dyn DistributedLock>,
        runtime: Arc<dyn ExecutionRuntime>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let slots = (0..size).map(|id| Arc::new(WorkerSlot::new(id))).collect();
        Arc::new(Self {
            slots,
            queue: NodeQueue::new(queue_max_size),
            store,
            lock,
            runtime,
            clock,
        })
    }

    pub fn slots(&self) -> &[Arc<WorkerSlot>] {
        &self.slots
    }

    pub fn queue(&self) -> &NodeQueue {
        &self.queue
    }

    /// §4.D `has_free_slot`.
    pub async fn has_free_slot(&self) -> bool {
        for slot in &self.slots {
            if slot.is_free().await {
                return true;
            }
        }
        false
    }

    async fn find_free_slot(&self) -> Option<Arc<WorkerSlot>> {
        for slot in &self.slots {
            if slot.is_free().await {
                return Some(slot.clone());
            }
        }
        None
    }

    /// §4.D `is_olt_busy`: delegated to the store, which is the authoritative source of
    /// in-flight Executions per OLT (I6).
    pub async fn is_olt_busy(&self, olt_id: OltId) -> bool {
        self.store.olt_is_busy(olt_id).await.unwrap_or_else(|e| {
            warn!(olt_id = %olt_id, error = %e, "store unavailable checking olt busy state, assuming busy");
            true
        })
    }

    /// §4.D `assign`.
    pub async fn assign(self: &Arc<Self>, node: CompositeNode) {
        if self.is_olt_busy(node.olt.id).await {
            self.queue.put(node);
            return;
        }

        let slot = match self.find_free_slot().await {
            Some(slot) => slot,
            None => {
                self.queue.put(node);
                return;
            }
        };

        let pool = self.clone();
        let store = self.store.clone();
        let lock = self.lock.clone();
        let runtime = self.runtime.clone();
        let clock = self.clock.clone();
        let olt_id = node.olt.id;

        tokio::spawn(async move {
            let outcome = slot.execute(&node, store.as_ref(), lock, runtime.as_ref(), clock.as_ref()).await;
            match &outcome {
                DispatchOutcome::Dispatched(execution) => {
                    info!(execution_id = %execution.id, node_id = %node.master.id, "master dispatched");
                }
                DispatchOutcome::AlreadyRunning(execution) => {
                    info!(execution_id = %execution.id, node_id = %node.master.id, "master already running");
                }
                DispatchOutcome::Rejected(e) => {
                    warn!(node_id = %node.master.id, error = %e, "master dispatch rejected");
                }
            }
            pool.process_queue_for_olt(olt_id).await;
        });
    }

    /// §4.D `process_queue(max)`.
    pub async fn process_queue(self: &Arc<Self>, max: usize) {
        let mut dispatched = 0;
        while dispatched < max && !self.queue.is_empty() {
            if !self.has_free_slot().await {
                break;
            }
            let Some(node) = self.queue.get() else { break };
            self.assign(node).await;
            dispatched += 1;
        }
    }

    /// §4.D `process_queue_for_olt`. Re-checks `is_olt_busy` first: this is called both
    /// right after a slot's dispatch completes (when the OLT is typically still busy, so
    /// this is a no-op) and by the completion dispatcher when the OLT actually frees up.
    pub async fn process_queue_for_olt(self: &Arc<Self>, olt_id: OltId) {
        if self.is_olt_busy(olt_id).await {
            return;
        }
        if let Some(node) = self.queue.take_for_olt(olt_id) {
            self.assign(node).await;
        }
    }

    /// §4.D `is_saturated`.
    pub async fn is_saturated(&self) -> bool {
        let total = self.slots.len();
        if total == 0 {
            return false;
        }
        let mut busy = 0;
        for slot in &self.slots {
            if !slot.is_free().await {
                busy += 1;
            }
        }
        let queue_size = self.queue.size();
        let busy_pct = 100.0 * busy as f64 / total as f64;
        busy_pct > SATURATION_BUSY_PCT
            || queue_size > SATURATION_QUEUE_FACTOR * total
            || (busy == total && queue_size > 0)
    }

    pub fn is_overload(&self) -> bool {
        self.queue.is_overload()
    }

    pub fn peek_queue(&self, n: usize) -> Vec<QueueEntrySnapshot> {
        self.queue.peek(n)
    }

    /// §4.D `stats`: reconciliation pass (frees any slot whose Execution has gone terminal)
    /// followed by a counter snapshot. Authoritative view for observability endpoints.
    pub async fn stats(&self) -> PoolStats {
        for slot in &self.slots {
            slot.reconcile(self.store.as_ref()).await;
        }

        let mut free = 0;
        let mut total_completed = 0;
        let mut total_delayed = 0;
        let mut total_busy_time = Duration::ZERO;
        let mut total_elapsed = Duration::ZERO;

        let mut per_slot: Vec<SlotStats> = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            let s = slot.stats().await;
            if s.status == crate::worker::SlotStatus::Free {
                free += 1;
            }
            total_completed += s.tasks_completed;
            total_delayed += s.tasks_delayed;
            total_busy_time += s.busy_time;
            total_elapsed += s.total_time;
            per_slot.push(s);
        }

        let total = self.slots.len();
        let busy = total - free;
        let busy_percentage = if total_elapsed.is_zero() {
            0.0
        } else {
            100.0 * total_busy_time.as_secs_f64() / total_elapsed.as_secs_f64()
        };

        PoolStats {
            total_pollers: total,
            free_pollers: free,
            busy_pollers: busy,
            busy_percentage,
            queue_size: self.queue.size(),
            is_saturated: self.is_saturated().await,
            is_overload: self.is_overload(),
            total_tasks_completed: total_completed,
            total_tasks_delayed: total_delayed,
        }
    }

    pub async fn slot_stats(&self) -> Vec<SlotStats> {
        let mut out = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            out.push(slot.stats().await);
        }
        out
    }

    /// Finds the slot currently holding `execution_id`, if any, and frees it. Called by the
    /// completion dispatcher (§4.F step 2).
    pub async fn release_slot_for_execution(&self, execution_id: crate::model::ExecutionId, duration: Duration) -> bool {
        for slot in &self.slots {
            if slot.release_if_matches(execution_id, duration).await {
                return true;
            }
        }
        false
    }

    /// Manual out-of-schedule trigger for `POST /pollers/nodes/{id}/run`: runs `node`
    /// through the same §4.C protocol a scheduled dispatch would, without touching a worker
    /// slot or the queue (an operator-initiated run shouldn't wait behind either).
    pub async fn run_node_now(
        &self,
        olt: &crate::model::Olt,
        workflow: &crate::model::Workflow,
        node: &crate::model::WorkflowNode,
    ) -> DispatchOutcome {
        CompositeNode::dispatch_node(olt, workflow, node, self.store.as_ref(), self.lock.clone(), self.runtime.as_ref(), self.clock.as_ref()).await
    }
}
