//! Reacts to Execution termination: advances scheduling state, frees the worker slot, starts
//! the next chain node, and drains the OLT backlog (§4.F).
//!
//! Split into a pure `advance_scheduling` step and a `dispatch_chain_successor`
//! side-effecting step, connected by a typed `NodeAdvance` intermediate: this makes P5
//! (busy-slot/Execution consistency) testable independently of chain-dispatch behavior.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::clock::Clock;
use crate::composite_node::CompositeNode;
use crate::error::PollerError;
use crate::lock::DistributedLock;
use crate::model::{Execution, ExecutionId, ExecutionStatus, Olt, OltId, Workflow, WorkflowNode};
use crate::pool::WorkerPool;
use crate::store::PollerStore;

/// Lock TTL for the chain-dispatch critical section (§4.G, §6 `chain_lock_ttl_seconds`).
pub const CHAIN_LOCK_TTL: Duration = Duration::from_secs(30);
const RECONCILIATION_POLL_ATTEMPTS: u32 = 3;
const RECONCILIATION_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Markers the discovery runtime is expected to write into `result_summary` once ONU
/// inventory reconciliation has completed, before a discovery master's chain may start.
const RECONCILIATION_MARKERS: [&str; 2] = ["total_found", "new_index_created"];

/// Typed intermediate between the two dispatcher phases (§9).
pub struct NodeAdvance {
    pub node: WorkflowNode,
    pub workflow: Workflow,
    pub olt: Olt,
    pub execution: Execution,
}

pub struct CompletionDispatcher {
    store: Arc<dyn PollerStore>,
    pool: Arc<WorkerPool>,
    lock: Arc<dyn DistributedLock>,
    clock: Arc<dyn Clock>,
}

impl CompletionDispatcher {
    pub fn new(
        store: Arc<dyn PollerStore>,
        pool: Arc<WorkerPool>,
        lock: Arc<dyn DistributedLock>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            pool,
            lock,
            clock,
        }
    }

    /// Public entry point invoked by the downstream execution runtime (§6). Always releases
    /// the slot and drains the OLT backlog, even if the rest fails: the `finally`-equivalent
    /// required by §7.
    pub async fn on_execution_terminal(
        &self,
        olt_id: OltId,
        execution_id: ExecutionId,
        status: ExecutionStatus,
        duration_ms: i64,
    ) {
        if !status.is_terminal() {
            warn!(execution_id = %execution_id, status = %status, "on_execution_terminal called with non-terminal status, ignoring");
            return;
        }

        let advance = match self.advance_scheduling(execution_id, status, duration_ms).await {
            Ok(Some(advance)) => Some(advance),
            Ok(None) => None,
            Err(e) => {
                warn!(execution_id = %execution_id, error = %e, "failed to advance scheduling state");
                None
            }
        };

        if let Some(advance) = advance {
            if let Err(e) = self.dispatch_chain_successor(advance).await {
                warn!(execution_id = %execution_id, error = %e, "chain dispatch failed");
            }
        }

        self.pool.process_queue_for_olt(olt_id).await;
    }

    /// §4.F steps 1-2: pure-ish scheduling state update (persists to the store) plus slot
    /// release. Returns `None` if the Execution is unknown.
    pub async fn advance_scheduling(
        &self,
        execution_id: ExecutionId,
        status: ExecutionStatus,
        duration_ms: i64,
    ) -> Result<Option<NodeAdvance>, PollerError> {
        let Some(mut execution) = self.store.get_execution(execution_id).await? else {
            // §7: runtime callback for unknown Execution, logged and ignored.
            warn!(execution_id = %execution_id, "completion callback for unknown execution, ignoring");
            return Ok(None);
        };

        if execution.status.is_terminal() {
            // §7/§8 R2: a retried or duplicate callback for an already-finished Execution is
            // ignored rather than reprocessed, so next_run_at advances exactly once.
            info!(execution_id = %execution_id, status = %execution.status, "duplicate completion callback for already-terminal execution, ignoring");
            return Ok(None);
        }

        let now = self.clock.now();
        execution.status = status;
        execution.finished_at = Some(now);
        execution.duration_ms = Some(duration_ms);

        self.store
            .set_execution_status(execution_id, status, Some(now), Some(duration_ms), None)
            .await?;

        let Some(node) = self.store.get_node(execution.node_id).await? else {
            return Ok(None);
        };

        // Masters only: advance next_run_at (I3: chain nodes never carry next_run_at).
        let next_run_at = if !node.is_chain_node {
            Some(now + chrono::Duration::seconds(node.interval_seconds.unwrap_or(300)))
        } else {
            None
        };
        self.store
            .record_node_completion(node.id, now, status == ExecutionStatus::Success, next_run_at)
            .await?;

        self.pool
            .release_slot_for_execution(execution_id, Duration::from_millis(duration_ms.max(0) as u64))
            .await;

        let Some(workflow) = self.store.get_workflow(node.workflow_id).await? else {
            return Ok(None);
        };
        let Some(olt) = self.store.get_olt(workflow.olt_id).await? else {
            return Ok(None);
        };

        Ok(Some(NodeAdvance {
            node,
            workflow,
            olt,
            execution,
        }))
    }

    /// §4.F steps 3-4: starts the first chain node (if the completed node was a master) or
    /// the next chain node in order (if the completed node was itself a chain node).
    ///
    /// Failure semantics (§4.F): a failed master or chain node still starts its successor.
    /// Chains run after any terminal state, not only success.
    pub async fn dispatch_chain_successor(&self, advance: NodeAdvance) -> Result<(), PollerError> {
        if !advance.node.is_chain_node {
            self.dispatch_first_chain_node(&advance).await
        } else {
            self.dispatch_next_chain_node(&advance).await
        }
    }

    async fn dispatch_first_chain_node(&self, advance: &NodeAdvance) -> Result<(), PollerError> {
        let chain = self.store.list_chain_nodes(advance.node.id).await?;
        let Some(first) = chain.into_iter().next() else {
            // B3: empty chain, nothing more to do.
            return Ok(());
        };

        let lock_key = format!("chain_execution:master:{}:chain:{}", advance.node.id, first.id);
        let Some(guard) = self.lock.clone().try_acquire(&lock_key, CHAIN_LOCK_TTL).await? else {
            // Another callback is already handling this chain start.
            return Ok(());
        };

        if advance.node.job_type() == crate::model::JobType::Discovery {
            self.wait_for_reconciliation_markers(advance.execution.id).await;
        }

        if self.store.active_execution_for_node(first.id).await?.is_some() {
            guard.release().await;
            return Ok(());
        }

        self.dispatch_one(&advance.olt, &advance.workflow, &first).await;
        guard.release().await;
        Ok(())
    }

    async fn dispatch_next_chain_node(&self, advance: &NodeAdvance) -> Result<(), PollerError> {
        let Some(master_id) = advance.node.master_node else {
            return Ok(());
        };
        let chain = self.store.list_chain_nodes(master_id).await?;
        let position = chain.iter().position(|n| n.id == advance.node.id);
        let Some(successor) = position.and_then(|i| chain.get(i + 1)).cloned() else {
            return Ok(());
        };

        let lock_key = format!("chain_execution:chain:{}", successor.id);
        let Some(guard) = self.lock.clone().try_acquire(&lock_key, CHAIN_LOCK_TTL).await? else {
            return Ok(());
        };

        if self.store.active_execution_for_node(successor.id).await?.is_some() {
            guard.release().await;
            return Ok(());
        }

        self.dispatch_one(&advance.olt, &advance.workflow, &successor).await;
        guard.release().await;
        Ok(())
    }

    /// Dispatches a single chain node through a free worker slot via the pool, falling back
    /// to the queue if none is free or the OLT has raced busy again (Open Question Q1: the
    /// node keeps `next_run_at = null` and is selected solely by this completion path).
    async fn dispatch_one(&self, olt: &Olt, workflow: &Workflow, node: &WorkflowNode) {
        let cn = CompositeNode::new(node.clone(), Vec::new(), workflow.clone(), olt.clone());
        self.pool.assign(cn).await;
    }

    /// Retry-poll up to 3x 1s for a discovery master's reconciliation markers (§4.F step 3,
    /// §9: uses the injected `Clock` rather than a bare `sleep` for testability).
    async fn wait_for_reconciliation_markers(&self, execution_id: ExecutionId) {
        for attempt in 0..RECONCILIATION_POLL_ATTEMPTS {
            match self.store.get_execution(execution_id).await {
                Ok(Some(execution)) if Self::has_reconciliation_markers(&execution) => return,
                Ok(_) => {}
                Err(e) => {
                    warn!(execution_id = %execution_id, error = %e, "store unavailable polling reconciliation markers");
                    return;
                }
            }
            if attempt + 1 < RECONCILIATION_POLL_ATTEMPTS {
                self.clock.sleep(RECONCILIATION_POLL_INTERVAL).await;
            }
        }
        info!(execution_id = %execution_id, "reconciliation markers not observed after retries, starting chain anyway");
    }

    fn has_reconciliation_markers(execution: &Execution) -> bool {
        RECONCILIATION_MARKERS
            .iter()
            .any(|marker| execution.result_summary.contains_key(*marker))
    }
}
