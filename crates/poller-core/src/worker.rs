//! One worker slot: a unit of "this slot has an outstanding SNMP operation on an OLT",
//! held across the asynchronous round-trip so per-OLT serialization (I6) holds (§4.B).

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::clock::Clock;
use crate::composite_node::{CompositeNode, DispatchOutcome};
use crate::lock::DistributedLock;
use crate::model::{ExecutionId, NodeId, OltId};
use crate::runtime::ExecutionRuntime;
use crate::store::PollerStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    Free,
    Busy,
}

/// The current assignment, if any. Cleared independently of the cumulative counters below.
struct Assignment {
    execution_id: Option<ExecutionId>,
    node_id: NodeId,
    olt_id: OltId,
    started_at: Instant,
}

struct State {
    created_at: Instant,
    assignment: Option<Assignment>,
    busy_time: Duration,
    tasks_completed: u64,
    tasks_delayed: u64,
}

impl Default for State {
    fn default() -> Self {
        Self {
            created_at: Instant::now(),
            assignment: None,
            busy_time: Duration::ZERO,
            tasks_completed: 0,
            tasks_delayed: 0,
        }
    }
}

impl State {
    fn status(&self) -> SlotStatus {
        if self.assignment.is_some() {
            SlotStatus::Busy
        } else {
            SlotStatus::Free
        }
    }
}

/// Snapshot returned by [`WorkerSlot::stats`], used directly by the `GET /pollers` response.
#[derive(Debug, Clone)]
pub struct SlotStats {
    pub slot_id: usize,
    pub status: SlotStatus,
    pub current_execution_id: Option<ExecutionId>,
    pub current_node_id: Option<NodeId>,
    pub busy_time: Duration,
    pub total_time: Duration,
    pub tasks_completed: u64,
    pub tasks_delayed: u64,
}

impl SlotStats {
    pub fn busy_percentage(&self) -> f64 {
        if self.total_time.is_zero() {
            0.0
        } else {
            100.0 * self.busy_time.as_secs_f64() / self.total_time.as_secs_f64()
        }
    }
}

pub struct WorkerSlot {
    pub id: usize,
    state: tokio::sync::Mutex<State>,
}

impl WorkerSlot {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            state: tokio::sync::Mutex::new(State::default()),
        }
    }

    pub async fn is_free(&self) -> bool {
        self.state.lock().await.status() == SlotStatus::Free
    }

    /// §4.B `execute`: sets BUSY, dispatches the master, records the Execution id, then
    /// releases the slot lock while *remaining* BUSY, the caller does not await the
    /// Execution's completion here, only its creation/submission.
    pub async fn execute(
        &self,
        composite_node: &CompositeNode,
        store: &dyn PollerStore,
        lock: Arc<dyn DistributedLock>,
        runtime: &dyn ExecutionRuntime,
        clock: &dyn Clock,
    ) -> DispatchOutcome {
        {
            let mut state = self.state.lock().await;
            if composite_node.delayed {
                state.tasks_delayed += 1;
            }
            state.assignment = Some(Assignment {
                execution_id: None,
                node_id: composite_node.master.id,
                olt_id: composite_node.olt.id,
                started_at: Instant::now(),
            });
        }

        let outcome = composite_node.dispatch_master(store, lock, runtime, clock).await;

        let mut state = self.state.lock().await;
        match &outcome {
            DispatchOutcome::Dispatched(execution) | DispatchOutcome::AlreadyRunning(execution) => {
                if let Some(a) = state.assignment.as_mut() {
                    a.execution_id = Some(execution.id);
                }
            }
            DispatchOutcome::Rejected(e) => {
                warn!(node_id = %composite_node.master.id, error = %e, "dispatch rejected, freeing slot");
                state.assignment = None;
            }
        }
        outcome
    }

    /// Called by the completion dispatcher once the slot's Execution reaches a terminal
    /// state. Returns true if this slot actually held `execution_id` (and was freed).
    pub async fn release_if_matches(&self, execution_id: ExecutionId, duration: Duration) -> bool {
        let mut state = self.state.lock().await;
        let holds = matches!(&state.assignment, Some(a) if a.execution_id == Some(execution_id));
        if !holds {
            return false;
        }
        state.assignment = None;
        state.busy_time += duration;
        state.tasks_completed += 1;
        true
    }

    /// Health-check auto-repair (§4.B): if BUSY with a terminal Execution in storage, force
    /// the slot back to FREE. Used by `WorkerPool::stats`'s reconciliation pass.
    pub async fn reconcile(&self, store: &dyn PollerStore) {
        let execution_id = {
            let state = self.state.lock().await;
            match state.assignment.as_ref().and_then(|a| a.execution_id) {
                Some(id) => id,
                None => return,
            }
        };

        let terminal = match store.get_execution(execution_id).await {
            Ok(Some(execution)) => execution.status.is_terminal(),
            Ok(None) => true,
            Err(_) => false,
        };

        if terminal {
            let mut state = self.state.lock().await;
            let still_holds = matches!(&state.assignment, Some(a) if a.execution_id == Some(execution_id));
            if still_holds {
                state.assignment = None;
                state.tasks_completed += 1;
            }
        }
    }

    pub async fn stats(&self) -> SlotStats {
        let state = self.state.lock().await;
        SlotStats {
            slot_id: self.id,
            status: state.status(),
            current_execution_id: state.assignment.as_ref().and_then(|a| a.execution_id),
            current_node_id: state.assignment.as_ref().map(|a| a.node_id),
            busy_time: state.busy_time,
            total_time: state.created_at.elapsed(),
            tasks_completed: state.tasks_completed,
            tasks_delayed: state.tasks_delayed,
        }
    }

    pub async fn current_olt_id(&self) -> Option<OltId> {
        self.state.lock().await.assignment.as_ref().map(|a| a.olt_id)
    }
}
